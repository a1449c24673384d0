//! Schema snapshots
//!
//! A dump captures the structure of a database together with its applied
//! versions and writes it as a Rust module under `<dir>/<name>/schema.rs`.
//! Compiling that module into an application and calling its `load` function
//! installs the schema text on the handle, ready for [`load_schema`].

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use regex::Regex;
use sqlx::{AnyPool, Row};

use crate::config::{Adapter, DatabaseConfig};
use crate::error::{DbError, DbResult};
use crate::handle::ConnectionHandle;
use crate::runner::Migrator;

/// Produces the raw structure dump of a database
#[async_trait]
pub trait SchemaExporter: Send + Sync {
    fn name(&self) -> &'static str;

    async fn export(&self, config: &DatabaseConfig, pool: &AnyPool) -> DbResult<String>;
}

/// Exporter used when none was installed on the handle.
pub fn default_exporter(adapter: Adapter) -> Arc<dyn SchemaExporter> {
    match adapter {
        Adapter::Postgres => Arc::new(PgDumpExporter),
        Adapter::Mysql => Arc::new(MysqlDumpExporter),
        Adapter::Sqlite => Arc::new(SqliteCatalogExporter),
    }
}

/// Runs `pg_dump` against the configured search path
#[derive(Debug, Clone, Copy, Default)]
pub struct PgDumpExporter;

#[async_trait]
impl SchemaExporter for PgDumpExporter {
    fn name(&self) -> &'static str {
        "pg_dump"
    }

    async fn export(&self, config: &DatabaseConfig, _pool: &AnyPool) -> DbResult<String> {
        let mut args = vec![
            "-s".to_string(),
            "-x".to_string(),
            "-O".to_string(),
            "--no-comments".to_string(),
            "-d".to_string(),
            config.database.clone(),
            "-n".to_string(),
            config.schema_search_path.clone(),
        ];
        push_flag(&mut args, "-h", &config.host);
        push_flag(&mut args, "-p", &config.port);
        push_flag(&mut args, "-U", &config.username);

        run_tool(self.name(), &args, &[("PGPASSWORD", config.password.as_str())]).await
    }
}

/// Runs `mysqldump` without data
#[derive(Debug, Clone, Copy, Default)]
pub struct MysqlDumpExporter;

#[async_trait]
impl SchemaExporter for MysqlDumpExporter {
    fn name(&self) -> &'static str {
        "mysqldump"
    }

    async fn export(&self, config: &DatabaseConfig, _pool: &AnyPool) -> DbResult<String> {
        let mut args = vec![
            "--no-data".to_string(),
            "--routines".to_string(),
            "--skip-comments".to_string(),
            "--skip-quote-names".to_string(),
        ];
        push_flag(&mut args, "--host", &config.host);
        push_flag(&mut args, "--port", &config.port);
        push_flag(&mut args, "--user", &config.username);
        args.push(config.database.clone());

        run_tool(self.name(), &args, &[("MYSQL_PWD", config.password.as_str())]).await
    }
}

/// Reads the definitions stored in `sqlite_master`, no external tool needed
#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteCatalogExporter;

#[async_trait]
impl SchemaExporter for SqliteCatalogExporter {
    fn name(&self) -> &'static str {
        "sqlite_master"
    }

    async fn export(&self, _config: &DatabaseConfig, pool: &AnyPool) -> DbResult<String> {
        let rows = sqlx::query(
            "SELECT sql FROM sqlite_master \
             WHERE sql IS NOT NULL AND substr(name, 1, 7) <> 'sqlite_' \
             ORDER BY CASE type WHEN 'table' THEN 0 WHEN 'index' THEN 1 WHEN 'view' THEN 2 ELSE 3 END, name",
        )
        .fetch_all(pool)
        .await?;

        let mut statements = Vec::with_capacity(rows.len());
        for row in &rows {
            let sql: String = row.try_get(0)?;
            statements.push(format!("{};", sql.trim().trim_end_matches(';')));
        }
        Ok(statements.join("\n\n"))
    }
}

fn push_flag(args: &mut Vec<String>, flag: &str, value: &str) {
    if !value.is_empty() {
        args.push(flag.to_string());
        args.push(value.to_string());
    }
}

async fn run_tool(tool: &str, args: &[String], envs: &[(&str, &str)]) -> DbResult<String> {
    tracing::debug!("Running {} {}", tool, args.join(" "));

    let output = tokio::process::Command::new(tool)
        .args(args)
        .envs(envs.iter().copied())
        .output()
        .await
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => DbError::DumpToolMissing {
                tool: tool.to_string(),
            },
            _ => DbError::Io(e),
        })?;

    if !output.status.success() {
        return Err(DbError::DumpFailed {
            tool: tool.to_string(),
            status: output.status.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

fn create_pattern(adapter: Adapter) -> DbResult<Regex> {
    let objects = match adapter {
        Adapter::Postgres => r"extension|schema|sequence|table|unique\s+index|index",
        Adapter::Mysql => r"table",
        Adapter::Sqlite => r"table|unique\s+index|index|view|trigger",
    };
    pattern(&format!(r"(?i)\bcreate\s+({})\s+", objects))
}

fn pattern(source: &str) -> DbResult<Regex> {
    Regex::new(source).map_err(|e| DbError::Custom(format!("invalid dump pattern: {}", e)))
}

fn is_noise(adapter: Adapter, line: &str) -> bool {
    let trimmed = line.trim_start();
    if trimmed.starts_with("--") {
        return true;
    }
    match adapter {
        // psql meta-commands and the session search path reset
        Adapter::Postgres => {
            trimmed.starts_with('\\') || trimmed.contains("pg_catalog.set_config('search_path'")
        }
        // conditional version comments
        Adapter::Mysql => trimmed.starts_with("/*!") && trimmed.ends_with("*/;"),
        Adapter::Sqlite => false,
    }
}

/// Clean a raw dump so it can be replayed onto an empty database.
///
/// Comments and tool noise are dropped and supported `CREATE` statements
/// gain an `IF NOT EXISTS` guard.
pub fn normalize_dump(adapter: Adapter, raw: &str) -> DbResult<String> {
    let kept = raw
        .lines()
        .filter(|line| !is_noise(adapter, line))
        .collect::<Vec<_>>()
        .join("\n");

    let guarded = create_pattern(adapter)?.replace_all(&kept, |caps: &regex::Captures| {
        format!("CREATE {} IF NOT EXISTS ", caps[1].to_uppercase())
    });
    let guarded = pattern(r"(?i)if\s+not\s+exists\s+if\s+not\s+exists")?
        .replace_all(&guarded, "IF NOT EXISTS")
        .into_owned();
    let collapsed = pattern(r"\n{3,}")?.replace_all(&guarded, "\n\n").into_owned();

    Ok(collapsed.trim().to_string())
}

/// Insert statement restoring the applied versions.
pub fn versions_insert_block(table: &str, versions: &[String]) -> String {
    if versions.is_empty() {
        return String::new();
    }

    let values = versions
        .iter()
        .map(|v| format!("('{}')", v.replace('\'', "''")))
        .collect::<Vec<_>>()
        .join(",\n");
    format!("INSERT INTO {} (version) VALUES\n{};", table, values)
}

/// Source of the generated schema module for database `name`.
pub fn render_schema_module(name: &str, schema: &str) -> String {
    let hashes = "#".repeat(raw_string_hashes(schema));
    format!(
        "//! Schema snapshot for the '{name}' database, generated by `keel schema:dump`.\n\
         //! Do not edit by hand.\n\
         \n\
         use keel_record::ConnectionHandle;\n\
         \n\
         pub const DATABASE: &str = {name:?};\n\
         \n\
         pub const SCHEMA: &str = r{hashes}\"{schema}\"{hashes};\n\
         \n\
         /// Install the snapshot on `db` so `load_schema` can replay it.\n\
         pub fn load(db: &ConnectionHandle) {{\n    db.set_schema(SCHEMA);\n}}\n",
        name = name,
        hashes = hashes,
        schema = schema,
    )
}

/// Extract the `SCHEMA` text from a module written by
/// [`render_schema_module`].
pub fn read_schema_module(source: &str) -> DbResult<String> {
    let malformed = || DbError::Custom("schema module has no `SCHEMA` raw string".to_string());

    let marker = "pub const SCHEMA: &str = r";
    let start = source.find(marker).ok_or_else(malformed)? + marker.len();
    let rest = &source[start..];

    let hashes = rest.chars().take_while(|c| *c == '#').count();
    let body = rest[hashes..].strip_prefix('"').ok_or_else(malformed)?;
    let terminator = format!("\"{}", "#".repeat(hashes));
    let end = body.find(&terminator).ok_or_else(malformed)?;

    Ok(body[..end].to_string())
}

/// Read `<dir>/<name>/schema.rs` and install its schema text on `handle`.
///
/// Used where the generated module is not compiled into the program, such as
/// the command line tool.
pub async fn read_schema_file(handle: &ConnectionHandle, dir: &Path) -> DbResult<PathBuf> {
    let path = dir.join(handle.name()).join("schema.rs");
    let source = tokio::fs::read_to_string(&path).await?;
    handle.set_schema(read_schema_module(&source)?);
    Ok(path)
}

// Enough `#`s that no `"###` run inside the text closes the raw string.
fn raw_string_hashes(text: &str) -> usize {
    let mut longest = 0;
    for (i, _) in text.match_indices('"') {
        let run = text[i + 1..].chars().take_while(|c| *c == '#').count();
        longest = longest.max(run);
    }
    longest + 1
}

/// Dump the schema of `handle` and write `<dir>/<name>/schema.rs`.
///
/// The dumped text, followed by the applied versions, is also cached on the
/// handle.
pub async fn dump_schema(handle: &ConnectionHandle, dir: &Path) -> DbResult<PathBuf> {
    let config = handle.config();
    let migrator = Migrator::new(handle);
    let versions = migrator.recorded_versions().await?;

    let pool = handle.pool()?;
    let exporter = handle.schema_exporter();
    tracing::debug!(
        "Dumping schema of '{}' with {}",
        handle.name(),
        exporter.name()
    );
    let raw = exporter.export(config, &pool).await?;
    let mut schema = normalize_dump(config.adapter, &raw)?;

    let block = versions_insert_block(&config.versions_table(), &versions);
    if !block.is_empty() {
        if !schema.is_empty() {
            schema.push_str("\n\n");
        }
        schema.push_str(&block);
    }

    let path = dir.join(handle.name()).join("schema.rs");
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(&path, render_schema_module(handle.name(), &schema)).await?;
    handle.set_schema(schema);

    tracing::info!(
        "Dumped schema of '{}' ({} applied version(s)) to {}",
        handle.name(),
        versions.len(),
        path.display()
    );
    Ok(path)
}

/// Replay the cached schema text onto the handle's database.
pub async fn load_schema(handle: &ConnectionHandle) -> DbResult<()> {
    handle.ensure_writable("schema:load")?;

    let schema = handle.schema();
    if schema.trim().is_empty() {
        return Err(DbError::EmptySchema {
            name: handle.name().to_string(),
        });
    }

    handle.execute_batch(&schema).await?;
    tracing::info!("Loaded schema into '{}'", handle.name());
    Ok(())
}
