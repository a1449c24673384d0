//! # keel-record
//!
//! Schema migrations and versioning for pooled mysql, postgres and sqlite
//! databases.
//!
//! Databases are declared through `DB_URI_<NAME>` environment entries. The
//! [`ConnectionManager`] builds a [`ConnectionHandle`] for each of them;
//! migrations are registered on a handle and applied, rolled back or
//! reported with [`ConnectionHandle::migrate`],
//! [`ConnectionHandle::rollback`] and [`ConnectionHandle::migrate_status`].
//! Schema snapshots are dumped to and loaded from generated Rust modules.
//!
//! ```ignore
//! let manager = ConnectionManager::from_env();
//! tasks::ensure_ready(&manager)?;
//! manager.connect_all(true).await?;
//!
//! let primary = manager.handle("primary").unwrap();
//! primary.add_migration(MigrationEntry::sql(
//!     "20200201165238_create_users.rs",
//!     "CREATE TABLE users (id INTEGER PRIMARY KEY)",
//!     "DROP TABLE users",
//!     true,
//! )?)?;
//! primary.migrate().await?;
//! ```

pub mod config;
pub mod error;
pub mod generator;
pub mod handle;
pub mod loader;
pub mod manager;
pub mod migration;
pub mod runner;
pub mod schema;
pub mod tasks;

pub use config::{resolve, Adapter, DatabaseConfig};
pub use error::{ConfigError, DbError, DbResult};
pub use generator::{generate_migration, generate_sql_migration};
pub use handle::{format_query, ConnectionHandle, DbValue};
pub use loader::load_sql_migrations;
pub use manager::ConnectionManager;
pub use migration::{
    migration_fn, parse_version, sql_step, MigrationEntry, MigrationFn, MigrationFuture,
    MigrationRegistry,
};
pub use runner::{MigrationRunResult, MigrationState, MigrationStatus, Migrator, RollbackResult};
pub use schema::{
    MysqlDumpExporter, PgDumpExporter, SchemaExporter, SqliteCatalogExporter,
};
pub use tasks::Environment;
