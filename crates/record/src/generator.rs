//! Migration file generator

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use heck::ToSnakeCase;

use crate::error::DbResult;
use crate::loader::sql_migration_template;
use crate::migration::parse_version;

/// Write a new migration skeleton to
/// `<dir>/<database>/<YYYYMMDDHHMMSS>_<name>.rs` and return its path.
pub fn generate_migration(
    dir: &Path,
    database: &str,
    name: &str,
    transactional: bool,
) -> DbResult<PathBuf> {
    write_migration(
        dir,
        database,
        name,
        "rs",
        &migration_template(name, transactional),
    )
}

/// Same as [`generate_migration`] but writes a `.sql` file for
/// [`load_sql_migrations`](crate::loader::load_sql_migrations).
pub fn generate_sql_migration(
    dir: &Path,
    database: &str,
    name: &str,
    transactional: bool,
) -> DbResult<PathBuf> {
    write_migration(
        dir,
        database,
        name,
        "sql",
        &sql_migration_template(name, transactional),
    )
}

fn write_migration(
    dir: &Path,
    database: &str,
    name: &str,
    extension: &str,
    content: &str,
) -> DbResult<PathBuf> {
    let timestamp = Utc::now().format("%Y%m%d%H%M%S").to_string();
    let file_name = format!("{}_{}.{}", timestamp, name.to_snake_case(), extension);
    parse_version(&file_name)?;

    let target_dir = dir.join(database);
    fs::create_dir_all(&target_dir)?;

    let path = target_dir.join(&file_name);
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&path)?;
    file.write_all(content.as_bytes())?;

    tracing::info!("Created migration {}", path.display());
    Ok(path)
}

fn migration_template(name: &str, transactional: bool) -> String {
    format!(
        "//! Migration: {name}\n\
         \n\
         use keel_record::{{ConnectionHandle, DbResult, MigrationEntry}};\n\
         \n\
         const UP: &str = r\"\";\n\
         \n\
         const DOWN: &str = r\"\";\n\
         \n\
         pub fn register(db: &ConnectionHandle) -> DbResult<()> {{\n    \
             db.add_migration(MigrationEntry::sql(file!(), UP, DOWN, {transactional}))\n\
         }}\n",
        name = name,
        transactional = transactional,
    )
}
