//! Database tasks run across every configured database
//!
//! Each task walks the manager's handles in name order. Write tasks skip
//! replicas, and tasks that take a database name do nothing when that name
//! is not configured.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::{DbError, DbResult};
use crate::handle::ConnectionHandle;
use crate::manager::ConnectionManager;
use crate::runner::{MigrationRunResult, MigrationStatus, RollbackResult};

/// Deployment environment, read from `APP_ENV`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Environment {
    Development,
    Testing,
    Staging,
    Production,
    Custom(String),
}

impl Environment {
    pub fn from_env() -> Self {
        std::env::var("APP_ENV")
            .map(|value| Environment::from(value.as_str()))
            .unwrap_or(Environment::Development)
    }

    pub fn as_str(&self) -> &str {
        match self {
            Environment::Development => "development",
            Environment::Testing => "testing",
            Environment::Staging => "staging",
            Environment::Production => "production",
            Environment::Custom(name) => name,
        }
    }

    /// Destructive tasks are refused in protected environments.
    pub fn is_protected(&self) -> bool {
        matches!(self, Environment::Production)
    }
}

impl From<&str> for Environment {
    fn from(value: &str) -> Self {
        match value.to_lowercase().as_str() {
            "" | "development" | "dev" => Environment::Development,
            "testing" | "test" => Environment::Testing,
            "staging" | "stage" => Environment::Staging,
            "production" | "prod" => Environment::Production,
            custom => Environment::Custom(custom.to_string()),
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fail when the configuration had errors or declared no database.
pub fn ensure_ready(manager: &ConnectionManager) -> DbResult<()> {
    if let Some(first) = manager.errors().first() {
        for error in manager.errors() {
            tracing::error!("{}", error);
        }
        return Err(DbError::Config(first.clone()));
    }

    if manager.is_empty() {
        return Err(DbError::NoDatabases);
    }

    Ok(())
}

fn writable(manager: &ConnectionManager, operation: &str) -> Vec<Arc<ConnectionHandle>> {
    manager
        .handles()
        .filter(|handle| {
            if handle.is_replica() {
                tracing::debug!("Skipping replica '{}' for {}", handle.name(), operation);
                false
            } else {
                true
            }
        })
        .cloned()
        .collect()
}

fn selected(
    manager: &ConnectionManager,
    database: Option<&str>,
    operation: &str,
) -> Vec<Arc<ConnectionHandle>> {
    match database {
        None => writable(manager, operation),
        Some(name) => match manager.handle(name) {
            Some(handle) if handle.is_replica() => {
                tracing::warn!("Database '{}' is a replica, skipping {}", name, operation);
                Vec::new()
            }
            Some(handle) => vec![handle],
            None => {
                tracing::warn!("Database '{}' is not configured, skipping {}", name, operation);
                Vec::new()
            }
        },
    }
}

/// Create every primary database and its test companion.
pub async fn create_all(manager: &ConnectionManager) -> DbResult<Vec<String>> {
    let mut created = Vec::new();
    for handle in writable(manager, "create") {
        handle.create_database().await?;
        created.push(handle.name().to_string());
    }
    Ok(created)
}

/// Drop every primary database and its test companion.
pub async fn drop_all(manager: &ConnectionManager, env: &Environment) -> DbResult<Vec<String>> {
    if env.is_protected() {
        return Err(DbError::ProtectedEnvironment {
            environment: env.to_string(),
            operation: "drop".to_string(),
        });
    }

    let mut dropped = Vec::new();
    for handle in writable(manager, "drop") {
        handle.drop_database().await?;
        dropped.push(handle.name().to_string());
    }
    Ok(dropped)
}

pub async fn migrate_all(
    manager: &ConnectionManager,
    database: Option<&str>,
) -> DbResult<Vec<(String, MigrationRunResult)>> {
    let mut results = Vec::new();
    for handle in selected(manager, database, "migrate") {
        let result = handle.migrate().await?;
        results.push((handle.name().to_string(), result));
    }
    Ok(results)
}

/// Status of every database, replicas included.
pub async fn migrate_status_all(
    manager: &ConnectionManager,
) -> DbResult<Vec<(String, Vec<MigrationStatus>)>> {
    let mut report = Vec::new();
    for handle in manager.handles() {
        report.push((handle.name().to_string(), handle.migrate_status().await?));
    }
    Ok(report)
}

pub async fn rollback(
    manager: &ConnectionManager,
    database: Option<&str>,
) -> DbResult<Vec<(String, RollbackResult)>> {
    let mut results = Vec::new();
    for handle in selected(manager, database, "rollback") {
        let result = handle.rollback().await?;
        results.push((handle.name().to_string(), result));
    }
    Ok(results)
}

pub async fn dump_schema_all(manager: &ConnectionManager, dir: &Path) -> DbResult<Vec<PathBuf>> {
    let mut paths = Vec::new();
    for handle in writable(manager, "schema:dump") {
        paths.push(handle.dump_schema(dir).await?);
    }
    Ok(paths)
}

pub async fn load_schema_all(manager: &ConnectionManager) -> DbResult<Vec<String>> {
    let mut loaded = Vec::new();
    for handle in writable(manager, "schema:load") {
        handle.load_schema().await?;
        loaded.push(handle.name().to_string());
    }
    Ok(loaded)
}

pub async fn seed_all(manager: &ConnectionManager, database: Option<&str>) -> DbResult<Vec<String>> {
    let mut seeded = Vec::new();
    for handle in selected(manager, database, "seed") {
        handle.seed().await?;
        seeded.push(handle.name().to_string());
    }
    Ok(seeded)
}
