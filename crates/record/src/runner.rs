//! Migration runner: migrate, rollback and status for one connection handle
//!
//! Applied versions are tracked in a one-column versions table. Pending
//! migrations run in registration order; consecutive transactional entries
//! share a transaction and a non-transactional entry commits whatever is open
//! before it runs on its own connection.

use std::collections::HashSet;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use sqlx::{Any, AnyConnection, Row, Transaction};

use crate::config::Adapter;
use crate::error::{DbError, DbResult};
use crate::handle::{log_statement, ConnectionHandle, DbValue};
use crate::migration::{is_chronological, MigrationEntry};

/// Result of a migrate call
#[derive(Debug, Clone, Default)]
pub struct MigrationRunResult {
    pub applied: Vec<String>,
    pub skipped: usize,
    pub elapsed: Duration,
}

/// Result of a rollback call
#[derive(Debug, Clone, Default)]
pub struct RollbackResult {
    pub rolled_back: Option<String>,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MigrationState {
    Up,
    Down,
}

impl fmt::Display for MigrationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MigrationState::Up => f.pad("up"),
            MigrationState::Down => f.pad("down"),
        }
    }
}

/// One row of the migration status report
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationStatus {
    pub status: MigrationState,
    pub version: String,
    pub source: String,
}

pub struct Migrator<'a> {
    handle: &'a ConnectionHandle,
}

impl<'a> Migrator<'a> {
    pub fn new(handle: &'a ConnectionHandle) -> Self {
        Self { handle }
    }

    /// Whether the adapter catalog lists the versions table.
    pub async fn versions_table_exists(&self) -> DbResult<bool> {
        let config = self.handle.config();
        let table = &config.schema_migrations_table;

        let (check, params) = match config.adapter {
            Adapter::Postgres => (
                "SELECT COUNT(*) FROM pg_tables WHERE schemaname = $1 AND tablename = $2",
                vec![
                    DbValue::from(config.schema_search_path.as_str()),
                    DbValue::from(table.as_str()),
                ],
            ),
            Adapter::Mysql => (
                "SELECT COUNT(*) FROM information_schema.tables WHERE table_schema = ? AND table_name = ?",
                vec![
                    DbValue::from(config.database.as_str()),
                    DbValue::from(table.as_str()),
                ],
            ),
            Adapter::Sqlite => (
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?",
                vec![DbValue::from(table.as_str())],
            ),
        };

        let count: i64 = self.handle.fetch_one(check, &params).await?.try_get(0)?;
        Ok(count > 0)
    }

    /// Create the versions table when it does not exist yet.
    pub async fn ensure_versions_table(&self) -> DbResult<()> {
        if self.versions_table_exists().await? {
            return Ok(());
        }

        let config = self.handle.config();
        let qualified = config.versions_table();
        match config.adapter {
            Adapter::Postgres => {
                self.handle
                    .execute(
                        &format!("CREATE SCHEMA IF NOT EXISTS {}", config.schema_search_path),
                        &[],
                    )
                    .await?;
                self.handle
                    .execute(
                        &format!("CREATE TABLE {} (version VARCHAR PRIMARY KEY)", qualified),
                        &[],
                    )
                    .await?;
            }
            Adapter::Mysql => {
                self.handle
                    .execute(
                        &format!(
                            "CREATE TABLE IF NOT EXISTS {} (version VARCHAR(64), PRIMARY KEY (version))",
                            qualified
                        ),
                        &[],
                    )
                    .await?;
            }
            Adapter::Sqlite => {
                self.handle
                    .execute(
                        &format!(
                            "CREATE TABLE IF NOT EXISTS {} (version VARCHAR(64) PRIMARY KEY)",
                            qualified
                        ),
                        &[],
                    )
                    .await?;
            }
        }

        tracing::info!(
            "Created versions table {} for database '{}'",
            qualified,
            self.handle.name()
        );
        Ok(())
    }

    /// Applied versions for read-only reporting. Replicas are never written
    /// to, so a replica without a versions table reports nothing applied.
    pub async fn recorded_versions(&self) -> DbResult<Vec<String>> {
        if !self.handle.is_replica() {
            self.ensure_versions_table().await?;
        } else if !self.versions_table_exists().await? {
            tracing::debug!(
                "Replica '{}' has no versions table yet",
                self.handle.name()
            );
            return Ok(Vec::new());
        }
        self.applied_versions().await
    }

    /// Applied versions in ascending order.
    pub async fn applied_versions(&self) -> DbResult<Vec<String>> {
        let sql = format!(
            "SELECT version FROM {} ORDER BY version ASC",
            self.handle.config().versions_table()
        );
        let rows = self.handle.fetch_all(&sql, &[]).await?;
        rows.iter()
            .map(|row| row.try_get::<String, _>(0).map_err(DbError::from))
            .collect()
    }

    /// Apply every pending migration.
    pub async fn migrate(&self) -> DbResult<MigrationRunResult> {
        let started = Instant::now();
        self.handle.ensure_writable("migrate")?;
        let _guard = self.handle.migration_lock().lock().await;

        self.ensure_versions_table().await?;
        let applied: HashSet<String> = self.applied_versions().await?.into_iter().collect();

        let entries = self.handle.migrations();
        if !is_chronological(&entries) {
            tracing::warn!(
                "Migrations for '{}' are not registered in version order, applying them in registration order",
                self.handle.name()
            );
        }

        let pending: Vec<Arc<MigrationEntry>> = entries
            .iter()
            .filter(|entry| !applied.contains(entry.version()))
            .cloned()
            .collect();

        let mut result = MigrationRunResult {
            skipped: entries.len() - pending.len(),
            ..Default::default()
        };

        if pending.is_empty() {
            tracing::info!("Database '{}' is up to date", self.handle.name());
            result.elapsed = started.elapsed();
            return Ok(result);
        }

        let mut batch: Option<Transaction<'static, Any>> = None;
        match self.apply_pending(&pending, &mut batch, &mut result.applied).await {
            Ok(()) => {
                if let Some(tx) = batch.take() {
                    self.commit(tx).await?;
                }
            }
            Err(e) => {
                if let Some(tx) = batch.take() {
                    log_statement(self.handle.name(), "ROLLBACK;", &[]);
                    if let Err(rollback_err) = tx.rollback().await {
                        tracing::error!(
                            "Failed to roll back migrations on '{}': {}",
                            self.handle.name(),
                            rollback_err
                        );
                    }
                }
                tracing::error!("Migrating '{}' failed: {}", self.handle.name(), e);
                return Err(e);
            }
        }

        result.elapsed = started.elapsed();
        tracing::info!(
            "Applied {} migration(s) to '{}' in {:?}",
            result.applied.len(),
            self.handle.name(),
            result.elapsed
        );
        Ok(result)
    }

    async fn apply_pending(
        &self,
        pending: &[Arc<MigrationEntry>],
        batch: &mut Option<Transaction<'static, Any>>,
        applied: &mut Vec<String>,
    ) -> DbResult<()> {
        for entry in pending {
            if entry.is_transactional() {
                if batch.is_none() {
                    *batch = Some(self.handle.begin().await?);
                }
                if let Some(tx) = batch.as_mut() {
                    self.run_up(entry, &mut **tx).await?;
                }
            } else {
                if let Some(tx) = batch.take() {
                    self.commit(tx).await?;
                }
                let pool = self.handle.pool()?;
                let mut conn = pool.acquire().await?;
                self.run_up(entry, &mut *conn).await?;
            }
            applied.push(entry.version().to_string());
        }
        Ok(())
    }

    async fn run_up(&self, entry: &MigrationEntry, conn: &mut AnyConnection) -> DbResult<()> {
        tracing::info!(
            "Migrating {} ({}) on '{}'...",
            entry.version(),
            entry.source(),
            self.handle.name()
        );
        (entry.up())(&mut *conn)
            .await
            .map_err(|e| DbError::in_migration(entry.version(), e))?;
        self.insert_version(conn, entry.version()).await
    }

    async fn insert_version(&self, conn: &mut AnyConnection, version: &str) -> DbResult<()> {
        let config = self.handle.config();
        let sql = format!(
            "INSERT INTO {} (version) VALUES ({})",
            config.versions_table(),
            config.adapter.placeholder(1)
        );
        let params = [DbValue::from(version)];
        log_statement(self.handle.name(), &sql, &params);
        sqlx::query(&sql)
            .bind(version.to_string())
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    async fn delete_version(&self, conn: &mut AnyConnection, version: &str) -> DbResult<()> {
        let config = self.handle.config();
        let sql = format!(
            "DELETE FROM {} WHERE version = {}",
            config.versions_table(),
            config.adapter.placeholder(1)
        );
        let params = [DbValue::from(version)];
        log_statement(self.handle.name(), &sql, &params);
        sqlx::query(&sql)
            .bind(version.to_string())
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    async fn commit(&self, tx: Transaction<'static, Any>) -> DbResult<()> {
        log_statement(self.handle.name(), "COMMIT;", &[]);
        tx.commit().await?;
        Ok(())
    }

    /// Revert the most recently applied migration.
    ///
    /// Rolls back at most one migration per call. When the latest applied
    /// version has no registered migration nothing changes.
    pub async fn rollback(&self) -> DbResult<RollbackResult> {
        let started = Instant::now();
        self.handle.ensure_writable("rollback")?;
        let _guard = self.handle.migration_lock().lock().await;

        self.ensure_versions_table().await?;
        let applied = self.applied_versions().await?;

        let Some(latest) = applied.iter().max().cloned() else {
            let tx = self.handle.begin().await?;
            self.commit(tx).await?;
            tracing::info!("Database '{}' has no migration to roll back", self.handle.name());
            return Ok(RollbackResult {
                rolled_back: None,
                elapsed: started.elapsed(),
            });
        };

        let entries = self.handle.migrations();
        let Some(entry) = entries.iter().rev().find(|e| e.version() == latest) else {
            tracing::warn!(
                "Applied version {} on '{}' has no registered migration, nothing rolled back",
                latest,
                self.handle.name()
            );
            return Ok(RollbackResult {
                rolled_back: None,
                elapsed: started.elapsed(),
            });
        };

        tracing::info!(
            "Rolling back {} ({}) on '{}'...",
            entry.version(),
            entry.source(),
            self.handle.name()
        );

        if entry.is_transactional() {
            let mut tx = self.handle.begin().await?;
            match self.run_down(entry, &mut *tx).await {
                Ok(()) => self.commit(tx).await?,
                Err(e) => {
                    log_statement(self.handle.name(), "ROLLBACK;", &[]);
                    tx.rollback().await?;
                    return Err(e);
                }
            }
        } else {
            let pool = self.handle.pool()?;
            let mut conn = pool.acquire().await?;
            self.run_down(entry, &mut *conn).await?;
        }

        Ok(RollbackResult {
            rolled_back: Some(latest),
            elapsed: started.elapsed(),
        })
    }

    async fn run_down(&self, entry: &MigrationEntry, conn: &mut AnyConnection) -> DbResult<()> {
        (entry.down())(&mut *conn)
            .await
            .map_err(|e| DbError::in_migration(entry.version(), e))?;
        self.delete_version(conn, entry.version()).await
    }

    /// Report every registered migration as up or down, in registration
    /// order.
    pub async fn status(&self) -> DbResult<Vec<MigrationStatus>> {
        let _guard = self.handle.migration_lock().lock().await;

        let applied: HashSet<String> = self.recorded_versions().await?.into_iter().collect();

        let cwd = std::env::current_dir().ok();
        Ok(self
            .handle
            .migrations()
            .iter()
            .map(|entry| MigrationStatus {
                status: if applied.contains(entry.version()) {
                    MigrationState::Up
                } else {
                    MigrationState::Down
                },
                version: entry.version().to_string(),
                source: relative_source(entry.source(), cwd.as_deref()),
            })
            .collect())
    }
}

fn relative_source(source: &str, cwd: Option<&Path>) -> String {
    cwd.and_then(|cwd| Path::new(source).strip_prefix(cwd).ok())
        .map(|path| path.to_string_lossy().into_owned())
        .unwrap_or_else(|| source.to_string())
}
