//! Migration entries and the ordered registry that holds them
//!
//! A migration is a pair of async functions run against a live connection.
//! Its version is the 14-digit timestamp that prefixes the identifier it is
//! registered under, e.g. `db/migrate/primary/20200201165238_create_users.rs`
//! has version `20200201165238`.

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use chrono::NaiveDateTime;
use futures::future::BoxFuture;
use sqlx::{AnyConnection, Executor};

use crate::error::{DbError, DbResult};
use crate::handle::format_query;

const VERSION_FORMAT: &str = "%Y%m%d%H%M%S";
const VERSION_LEN: usize = 14;

/// Future returned by a migration step
pub type MigrationFuture<'c> = BoxFuture<'c, DbResult<()>>;

/// A migration step. Transactional steps receive the open transaction's
/// connection, the others a plain pooled connection.
pub type MigrationFn =
    Arc<dyn for<'c> Fn(&'c mut AnyConnection) -> MigrationFuture<'c> + Send + Sync>;

/// Box a closure into a [`MigrationFn`].
///
/// ```ignore
/// let up = migration_fn(|conn| Box::pin(async move {
///     sqlx::query("CREATE TABLE users (id INTEGER PRIMARY KEY)").execute(conn).await?;
///     Ok(())
/// }));
/// ```
pub fn migration_fn<F>(f: F) -> MigrationFn
where
    F: for<'c> Fn(&'c mut AnyConnection) -> MigrationFuture<'c> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// A step that executes `sql` verbatim. Blank SQL is a no-op.
pub fn sql_step(label: impl Into<String>, sql: impl Into<String>) -> MigrationFn {
    let label = label.into();
    let sql = sql.into();

    migration_fn(move |conn| {
        let label = label.clone();
        let sql = sql.clone();
        Box::pin(async move {
            if sql.trim().is_empty() {
                return Ok(());
            }
            tracing::info!(migration = %label, "{}", format_query(&sql));
            conn.execute(sql.as_str()).await?;
            Ok(())
        })
    })
}

/// Extract the version from a migration identifier.
///
/// The file name (directory and extension ignored) must look like
/// `<14 digit timestamp>_<description>`.
pub fn parse_version(source: &str) -> DbResult<String> {
    let invalid = |reason: &str| DbError::InvalidMigrationName {
        name: source.to_string(),
        reason: reason.to_string(),
    };

    let file_name = Path::new(source)
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or(source);
    let stem = file_name.split('.').next().unwrap_or(file_name);

    let (version, description) = stem
        .split_once('_')
        .ok_or_else(|| invalid("expected <timestamp>_<description>"))?;

    if version.len() != VERSION_LEN || !version.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid("name must start with a 14 digit timestamp"));
    }

    NaiveDateTime::parse_from_str(version, VERSION_FORMAT)
        .map_err(|_| invalid("timestamp is not a valid YYYYMMDDHHMMSS date"))?;

    if description.split('_').all(|segment| segment.is_empty()) {
        return Err(invalid("description is missing"));
    }

    Ok(version.to_string())
}

/// One registered migration
#[derive(Clone)]
pub struct MigrationEntry {
    version: String,
    source: String,
    up: MigrationFn,
    down: MigrationFn,
    transactional: bool,
}

impl MigrationEntry {
    pub fn new<U, D>(
        source: impl Into<String>,
        up: U,
        down: D,
        transactional: bool,
    ) -> DbResult<Self>
    where
        U: for<'c> Fn(&'c mut AnyConnection) -> MigrationFuture<'c> + Send + Sync + 'static,
        D: for<'c> Fn(&'c mut AnyConnection) -> MigrationFuture<'c> + Send + Sync + 'static,
    {
        Self::from_fns(source, migration_fn(up), migration_fn(down), transactional)
    }

    pub fn from_fns(
        source: impl Into<String>,
        up: MigrationFn,
        down: MigrationFn,
        transactional: bool,
    ) -> DbResult<Self> {
        let source = source.into();
        let version = parse_version(&source)?;

        Ok(Self {
            version,
            source,
            up,
            down,
            transactional,
        })
    }

    /// Migration made of plain SQL for both directions.
    pub fn sql(
        source: impl Into<String>,
        up_sql: impl Into<String>,
        down_sql: impl Into<String>,
        transactional: bool,
    ) -> DbResult<Self> {
        let source = source.into();
        let version = parse_version(&source)?;
        let up = sql_step(format!("{} up", version), up_sql);
        let down = sql_step(format!("{} down", version), down_sql);

        Ok(Self {
            version,
            source,
            up,
            down,
            transactional,
        })
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn is_transactional(&self) -> bool {
        self.transactional
    }

    pub fn up(&self) -> &MigrationFn {
        &self.up
    }

    pub fn down(&self) -> &MigrationFn {
        &self.down
    }
}

impl fmt::Debug for MigrationEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MigrationEntry")
            .field("version", &self.version)
            .field("source", &self.source)
            .field("transactional", &self.transactional)
            .finish()
    }
}

/// Migrations for one database, kept in registration order.
///
/// Applications can assemble the full list up front and hand it to a
/// connection handle, or register entries one by one on the handle.
#[derive(Debug, Clone, Default)]
pub struct MigrationRegistry {
    entries: Vec<Arc<MigrationEntry>>,
}

impl MigrationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry. Versions must be unique within a registry.
    pub fn register(&mut self, entry: MigrationEntry) -> DbResult<()> {
        if let Some(existing) = self.find(entry.version()) {
            return Err(DbError::DuplicateVersion {
                version: entry.version().to_string(),
                source_name: existing.source().to_string(),
            });
        }

        self.entries.push(Arc::new(entry));
        Ok(())
    }

    /// Builder form of [`register`](Self::register).
    pub fn with(mut self, entry: MigrationEntry) -> DbResult<Self> {
        self.register(entry)?;
        Ok(self)
    }

    pub fn entries(&self) -> &[Arc<MigrationEntry>] {
        &self.entries
    }

    pub fn versions(&self) -> Vec<&str> {
        self.entries.iter().map(|e| e.version()).collect()
    }

    pub fn find(&self, version: &str) -> Option<&Arc<MigrationEntry>> {
        self.entries.iter().find(|e| e.version() == version)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether registration order matches ascending version order.
    pub fn is_chronological(&self) -> bool {
        is_chronological(&self.entries)
    }
}

pub(crate) fn is_chronological(entries: &[Arc<MigrationEntry>]) -> bool {
    entries
        .windows(2)
        .all(|pair| pair[0].version() <= pair[1].version())
}
