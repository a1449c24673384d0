//! Connection handle for one configured database
//!
//! A handle owns the connection pool, the registered migrations, the seed
//! function and the cached schema text of a single database. Statement
//! execution goes through the handle so every statement is logged.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;
use sqlx::any::{AnyArguments, AnyPoolOptions, AnyRow};
use sqlx::query::Query;
use sqlx::{Any, AnyConnection, AnyPool, Executor, Transaction};
use tokio::sync::Mutex;

use crate::config::{Adapter, DatabaseConfig};
use crate::error::{DbError, DbResult};
use crate::migration::{migration_fn, MigrationEntry, MigrationFn, MigrationFuture, MigrationRegistry};
use crate::runner::{MigrationRunResult, MigrationStatus, Migrator, RollbackResult};
use crate::schema::{self, SchemaExporter};

/// A value bound to a statement placeholder
#[derive(Debug, Clone, PartialEq)]
pub enum DbValue {
    Null,
    Bool(bool),
    Int32(i32),
    Int64(i64),
    Float64(f64),
    String(String),
    Bytes(Vec<u8>),
}

impl From<bool> for DbValue {
    fn from(value: bool) -> Self {
        DbValue::Bool(value)
    }
}

impl From<i32> for DbValue {
    fn from(value: i32) -> Self {
        DbValue::Int32(value)
    }
}

impl From<i64> for DbValue {
    fn from(value: i64) -> Self {
        DbValue::Int64(value)
    }
}

impl From<f64> for DbValue {
    fn from(value: f64) -> Self {
        DbValue::Float64(value)
    }
}

impl From<&str> for DbValue {
    fn from(value: &str) -> Self {
        DbValue::String(value.to_string())
    }
}

impl From<String> for DbValue {
    fn from(value: String) -> Self {
        DbValue::String(value)
    }
}

impl From<Vec<u8>> for DbValue {
    fn from(value: Vec<u8>) -> Self {
        DbValue::Bytes(value)
    }
}

impl<T: Into<DbValue>> From<Option<T>> for DbValue {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(DbValue::Null)
    }
}

pub(crate) fn bind_values<'q>(
    mut query: Query<'q, Any, AnyArguments<'q>>,
    params: &[DbValue],
) -> Query<'q, Any, AnyArguments<'q>> {
    for param in params {
        query = match param {
            DbValue::Null => query.bind(None::<String>),
            DbValue::Bool(v) => query.bind(*v),
            DbValue::Int32(v) => query.bind(*v),
            DbValue::Int64(v) => query.bind(*v),
            DbValue::Float64(v) => query.bind(*v),
            DbValue::String(v) => query.bind(v.clone()),
            DbValue::Bytes(v) => query.bind(v.clone()),
        };
    }
    query
}

/// Format a statement for the statement log.
///
/// Surrounding whitespace is trimmed and continuation lines are indented so
/// multi-line statements stay readable under the `[DB]` prefix.
pub fn format_query(sql: &str) -> String {
    let body = sql
        .trim()
        .lines()
        .map(str::trim_end)
        .collect::<Vec<_>>()
        .join("\n     ");
    format!("[DB] {}", body)
}

pub(crate) fn log_statement(database: &str, sql: &str, params: &[DbValue]) {
    if params.is_empty() {
        tracing::info!(database = %database, "{}", format_query(sql));
    } else {
        tracing::info!(database = %database, params = ?params, "{}", format_query(sql));
    }
}

/// Replace the password in a connection URL for logging.
fn masked_uri(uri: &str) -> String {
    match url::Url::parse(uri) {
        Ok(mut url) if url.password().is_some() => {
            let _ = url.set_password(Some("***"));
            url.to_string()
        }
        _ => uri.to_string(),
    }
}

/// Live handle on one configured database
pub struct ConnectionHandle {
    name: String,
    config: DatabaseConfig,
    pool: RwLock<Option<AnyPool>>,
    migrations: RwLock<MigrationRegistry>,
    migration_lock: Mutex<()>,
    schema: RwLock<String>,
    seed: RwLock<Option<MigrationFn>>,
    exporter: RwLock<Arc<dyn SchemaExporter>>,
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("name", &self.name)
            .field("adapter", &self.config.adapter)
            .field("database", &self.config.database)
            .field("replica", &self.config.replica)
            .field("connected", &self.is_connected())
            .field("migrations", &self.migrations.read().len())
            .finish()
    }
}

impl ConnectionHandle {
    pub fn new(name: impl Into<String>, config: DatabaseConfig) -> Self {
        let exporter = schema::default_exporter(config.adapter);
        Self {
            name: name.into(),
            config,
            pool: RwLock::new(None),
            migrations: RwLock::new(MigrationRegistry::new()),
            migration_lock: Mutex::new(()),
            schema: RwLock::new(String::new()),
            seed: RwLock::new(None),
            exporter: RwLock::new(exporter),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    pub fn adapter(&self) -> Adapter {
        self.config.adapter
    }

    pub fn is_replica(&self) -> bool {
        self.config.replica
    }

    /// Bind placeholder for the `n`th (1-based) parameter.
    pub fn placeholder(&self, n: usize) -> String {
        self.config.adapter.placeholder(n)
    }

    pub fn is_connected(&self) -> bool {
        self.pool.read().is_some()
    }

    /// Fail with [`DbError::ReplicaWrite`] when this handle is a replica.
    pub fn ensure_writable(&self, operation: &str) -> DbResult<()> {
        if self.config.replica {
            return Err(DbError::ReplicaWrite {
                name: self.name.clone(),
                operation: operation.to_string(),
            });
        }
        Ok(())
    }

    /// Open the pool on the configured database.
    pub async fn connect(&self) -> DbResult<()> {
        self.connect_database(true).await
    }

    /// Open the pool on the adapter's administrative database.
    pub async fn connect_admin(&self) -> DbResult<()> {
        self.connect_database(false).await
    }

    /// Open the pool. With `same_database` false the pool targets the
    /// adapter's administrative database instead of the configured one.
    pub async fn connect_database(&self, same_database: bool) -> DbResult<()> {
        sqlx::any::install_default_drivers();

        let uri = if same_database {
            self.config.uri.clone()
        } else {
            self.config.admin_uri()?
        };

        let lifetime = if self.config.conn_max_lifetime.is_zero() {
            None
        } else {
            Some(self.config.conn_max_lifetime)
        };

        let mut options = AnyPoolOptions::new()
            .max_connections(self.config.max_open_conns.max(1))
            .max_lifetime(lifetime);

        if same_database && self.config.adapter == Adapter::Postgres {
            let statement = format!("SET search_path TO {}", self.config.schema_search_path);
            options = options.after_connect(move |conn, _meta| {
                let statement = statement.clone();
                Box::pin(async move {
                    conn.execute(statement.as_str()).await?;
                    Ok(())
                })
            });
        }

        tracing::debug!(
            "Connecting database '{}' to {} (max_open={}, max_idle={})",
            self.name,
            masked_uri(&uri),
            self.config.max_open_conns,
            self.config.max_idle_conns
        );

        let started = Instant::now();
        let pool = options
            .connect(&uri)
            .await
            .map_err(|source| DbError::Connection {
                name: self.name.clone(),
                source,
            })?;

        sqlx::query("SELECT 1")
            .execute(&pool)
            .await
            .map_err(|source| DbError::Connection {
                name: self.name.clone(),
                source,
            })?;

        let previous = self.pool.write().replace(pool);
        if let Some(previous) = previous {
            previous.close().await;
        }

        tracing::info!(
            "Connected database '{}' ({}) in {:?}",
            self.name,
            self.config.adapter,
            started.elapsed()
        );
        Ok(())
    }

    /// Close the pool. Closing a handle that was never connected is a no-op.
    pub async fn close(&self) {
        let pool = self.pool.write().take();
        if let Some(pool) = pool {
            pool.close().await;
            tracing::debug!("Closed database '{}'", self.name);
        }
    }

    pub fn pool(&self) -> DbResult<AnyPool> {
        self.pool.read().clone().ok_or_else(|| DbError::NotConnected {
            name: self.name.clone(),
        })
    }

    /// Run a statement and return the number of affected rows.
    pub async fn execute(&self, sql: &str, params: &[DbValue]) -> DbResult<u64> {
        let pool = self.pool()?;
        log_statement(&self.name, sql, params);
        let result = bind_values(sqlx::query(sql), params).execute(&pool).await?;
        Ok(result.rows_affected())
    }

    pub async fn fetch_all(&self, sql: &str, params: &[DbValue]) -> DbResult<Vec<AnyRow>> {
        let pool = self.pool()?;
        log_statement(&self.name, sql, params);
        Ok(bind_values(sqlx::query(sql), params).fetch_all(&pool).await?)
    }

    pub async fn fetch_one(&self, sql: &str, params: &[DbValue]) -> DbResult<AnyRow> {
        let pool = self.pool()?;
        log_statement(&self.name, sql, params);
        Ok(bind_values(sqlx::query(sql), params).fetch_one(&pool).await?)
    }

    pub async fn fetch_optional(&self, sql: &str, params: &[DbValue]) -> DbResult<Option<AnyRow>> {
        let pool = self.pool()?;
        log_statement(&self.name, sql, params);
        Ok(bind_values(sqlx::query(sql), params)
            .fetch_optional(&pool)
            .await?)
    }

    /// Run several `;` separated statements without parameters.
    pub async fn execute_batch(&self, sql: &str) -> DbResult<()> {
        let pool = self.pool()?;
        log_statement(&self.name, sql, &[]);
        pool.execute(sql).await?;
        Ok(())
    }

    pub async fn begin(&self) -> DbResult<Transaction<'static, Any>> {
        let pool = self.pool()?;
        log_statement(&self.name, "BEGIN;", &[]);
        Ok(pool.begin().await?)
    }

    /// Create the configured database and its `_test` companion.
    ///
    /// Expects a pool on the administrative database, see
    /// [`connect_database`](Self::connect_database). For sqlite the files are
    /// created instead.
    pub async fn create_database(&self) -> DbResult<()> {
        self.ensure_writable("create")?;
        let names = [self.config.database.clone(), self.config.test_database()];

        match self.config.adapter {
            Adapter::Sqlite => {
                for path in &names {
                    create_sqlite_file(Path::new(path)).await?;
                    tracing::info!("Created database '{}'", path);
                }
            }
            Adapter::Mysql | Adapter::Postgres => {
                for database in &names {
                    self.execute(&format!("CREATE DATABASE {}", database), &[])
                        .await?;
                    tracing::info!("Created database '{}'", database);
                }
            }
        }
        Ok(())
    }

    /// Drop the configured database and its `_test` companion.
    pub async fn drop_database(&self) -> DbResult<()> {
        self.ensure_writable("drop")?;
        let names = [self.config.database.clone(), self.config.test_database()];

        match self.config.adapter {
            Adapter::Sqlite => {
                for path in &names {
                    remove_sqlite_file(Path::new(path)).await?;
                    tracing::info!("Dropped database '{}'", path);
                }
            }
            Adapter::Postgres => {
                for database in &names {
                    self.execute(
                        "SELECT pg_terminate_backend(pid) FROM pg_stat_activity \
                         WHERE datname = $1 AND pid <> pg_backend_pid()",
                        &[DbValue::from(database.as_str())],
                    )
                    .await?;
                    self.execute(&format!("DROP DATABASE {}", database), &[])
                        .await?;
                    tracing::info!("Dropped database '{}'", database);
                }
            }
            Adapter::Mysql => {
                for database in &names {
                    self.execute(&format!("DROP DATABASE {}", database), &[])
                        .await?;
                    tracing::info!("Dropped database '{}'", database);
                }
            }
        }
        Ok(())
    }

    /// Register a migration that runs outside of a transaction.
    pub fn register_migration<U, D>(&self, source: &str, up: U, down: D) -> DbResult<()>
    where
        U: for<'c> Fn(&'c mut AnyConnection) -> MigrationFuture<'c> + Send + Sync + 'static,
        D: for<'c> Fn(&'c mut AnyConnection) -> MigrationFuture<'c> + Send + Sync + 'static,
    {
        self.add_migration(MigrationEntry::new(source, up, down, false)?)
    }

    /// Register a migration that runs inside the migrate transaction.
    pub fn register_migration_tx<U, D>(&self, source: &str, up: U, down: D) -> DbResult<()>
    where
        U: for<'c> Fn(&'c mut AnyConnection) -> MigrationFuture<'c> + Send + Sync + 'static,
        D: for<'c> Fn(&'c mut AnyConnection) -> MigrationFuture<'c> + Send + Sync + 'static,
    {
        self.add_migration(MigrationEntry::new(source, up, down, true)?)
    }

    pub fn add_migration(&self, entry: MigrationEntry) -> DbResult<()> {
        tracing::debug!(
            "Registering migration {} on '{}' (transactional={})",
            entry.version(),
            self.name,
            entry.is_transactional()
        );
        self.migrations.write().register(entry)
    }

    /// Replace the registered migrations wholesale.
    pub fn set_migrations(&self, registry: MigrationRegistry) {
        *self.migrations.write() = registry;
    }

    /// Snapshot of the registered migrations in registration order.
    pub fn migrations(&self) -> Vec<Arc<MigrationEntry>> {
        self.migrations.read().entries().to_vec()
    }

    pub(crate) fn migration_lock(&self) -> &Mutex<()> {
        &self.migration_lock
    }

    /// Cached schema text, as produced by a dump or installed by a
    /// generated schema module.
    pub fn schema(&self) -> String {
        self.schema.read().clone()
    }

    pub fn set_schema(&self, schema: impl Into<String>) {
        *self.schema.write() = schema.into();
    }

    pub fn set_schema_exporter(&self, exporter: Arc<dyn SchemaExporter>) {
        *self.exporter.write() = exporter;
    }

    pub fn schema_exporter(&self) -> Arc<dyn SchemaExporter> {
        self.exporter.read().clone()
    }

    /// Install the seed function. Only the last one registered is kept.
    pub fn register_seed<F>(&self, seed: F)
    where
        F: for<'c> Fn(&'c mut AnyConnection) -> MigrationFuture<'c> + Send + Sync + 'static,
    {
        *self.seed.write() = Some(migration_fn(seed));
    }

    pub fn has_seed(&self) -> bool {
        self.seed.read().is_some()
    }

    /// Run the seed function inside a transaction. Without a seed the
    /// transaction is committed empty.
    pub async fn seed(&self) -> DbResult<()> {
        self.ensure_writable("seed")?;
        let seed = self.seed.read().clone();

        let mut tx = self.begin().await?;
        if let Some(seed) = seed {
            tracing::info!("Seeding database '{}'...", self.name);
            if let Err(e) = (seed)(&mut *tx).await {
                log_statement(&self.name, "ROLLBACK;", &[]);
                tx.rollback().await?;
                return Err(e);
            }
        }
        log_statement(&self.name, "COMMIT;", &[]);
        tx.commit().await?;
        Ok(())
    }

    pub async fn migrate(&self) -> DbResult<MigrationRunResult> {
        Migrator::new(self).migrate().await
    }

    pub async fn rollback(&self) -> DbResult<RollbackResult> {
        Migrator::new(self).rollback().await
    }

    pub async fn migrate_status(&self) -> DbResult<Vec<MigrationStatus>> {
        Migrator::new(self).status().await
    }

    /// Dump the schema into `<dir>/<name>/schema.rs` and cache it.
    pub async fn dump_schema(&self, dir: &Path) -> DbResult<PathBuf> {
        schema::dump_schema(self, dir).await
    }

    pub async fn load_schema(&self) -> DbResult<()> {
        schema::load_schema(self).await
    }
}

async fn create_sqlite_file(path: &Path) -> DbResult<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }
    tokio::fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(path)
        .await?;
    Ok(())
}

async fn remove_sqlite_file(path: &Path) -> DbResult<()> {
    tokio::fs::remove_file(path).await?;
    for suffix in ["-wal", "-shm", "-journal"] {
        let mut sidecar = path.as_os_str().to_owned();
        sidecar.push(suffix);
        match tokio::fs::remove_file(&sidecar).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}
