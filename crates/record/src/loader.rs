//! Plain SQL migration files
//!
//! Besides migrations compiled into an application, a database can pick up
//! `.sql` files from `<dir>/<database>/`. Each file is named like a compiled
//! migration (`20200201165238_create_users.sql`) and split into sections:
//!
//! ```sql
//! -- Up migration
//! CREATE TABLE users (id INTEGER PRIMARY KEY);
//!
//! -- Down migration
//! DROP TABLE users;
//! ```
//!
//! A `-- Transactional: false` line runs the file outside of a transaction.

use std::fs;
use std::path::Path;

use chrono::Utc;

use crate::error::DbResult;
use crate::migration::{MigrationEntry, MigrationRegistry};

#[derive(Debug, Default, PartialEq)]
struct SqlSections {
    up: String,
    down: String,
    transactional: bool,
}

fn parse_sections(content: &str) -> SqlSections {
    let mut up = Vec::new();
    let mut down = Vec::new();
    let mut transactional = true;
    let mut section = "";

    for line in content.lines() {
        let marker = line.trim().to_lowercase();

        match marker.as_str() {
            "-- up" | "-- up migration" => {
                section = "up";
                continue;
            }
            "-- down" | "-- down migration" => {
                section = "down";
                continue;
            }
            _ => {}
        }
        if let Some(value) = marker.strip_prefix("-- transactional:") {
            transactional = value.trim() != "false";
            continue;
        }

        if marker.is_empty() || marker.starts_with("--") {
            continue;
        }

        match section {
            "up" => up.push(line),
            "down" => down.push(line),
            _ => {}
        }
    }

    SqlSections {
        up: up.join("\n").trim().to_string(),
        down: down.join("\n").trim().to_string(),
        transactional,
    }
}

/// Load every `.sql` migration under `dir`, ordered by file name.
///
/// A missing directory yields an empty registry.
pub fn load_sql_migrations(dir: &Path) -> DbResult<MigrationRegistry> {
    let mut registry = MigrationRegistry::new();
    if !dir.is_dir() {
        return Ok(registry);
    }

    let mut paths: Vec<_> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.extension().map_or(false, |ext| ext == "sql"))
        .collect();
    paths.sort();

    for path in paths {
        let content = fs::read_to_string(&path)?;
        let sections = parse_sections(&content);
        let source = path.to_string_lossy().into_owned();

        registry.register(MigrationEntry::sql(
            source,
            sections.up,
            sections.down,
            sections.transactional,
        )?)?;
    }

    tracing::debug!(
        "Loaded {} SQL migration(s) from {}",
        registry.len(),
        dir.display()
    );
    Ok(registry)
}

/// Template for a new SQL migration file.
pub fn sql_migration_template(name: &str, transactional: bool) -> String {
    format!(
        "-- Migration: {}\n\
         -- Created: {}\n\
         -- Transactional: {}\n\n\
         -- Up migration\n\n\n\
         -- Down migration\n\n",
        name,
        Utc::now().format("%Y-%m-%d %H:%M:%S UTC"),
        transactional
    )
}
