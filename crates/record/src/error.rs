//! Error types for the database layer
//!
//! Configuration problems are collected as [`ConfigError`] values and handed
//! back next to the resolved configuration. Everything that happens once a
//! database is in play is a [`DbError`].

/// Result type alias for database operations
pub type DbResult<T> = Result<T, DbError>;

/// Errors raised while resolving database configuration.
///
/// These are never fatal to a resolution pass: each one is attached to the
/// database it was found on and the remaining databases still resolve.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("adapter '{adapter}' for database '{database}' is not supported")]
    UnsupportedAdapter { database: String, adapter: String },

    #[error("invalid connection URI for database '{database}': {reason}")]
    InvalidUri { database: String, reason: String },

    #[error("invalid value for {key}: '{value}', expected {expected}")]
    InvalidValue {
        key: String,
        value: String,
        expected: String,
    },
}

/// Errors raised by connection handles, the migration runner and the schema
/// snapshot.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("database '{name}' is not connected")]
    NotConnected { name: String },

    #[error("failed to connect to database '{name}': {source}")]
    Connection {
        name: String,
        #[source]
        source: sqlx::Error,
    },

    #[error("invalid migration name {name:?}: {reason}, a valid example: 20060102150405_create_users.rs")]
    InvalidMigrationName { name: String, reason: String },

    #[error("migration version {version} is already registered by '{source_name}'")]
    DuplicateVersion { version: String, source_name: String },

    #[error("migration {version} failed: {source}")]
    Migration {
        version: String,
        #[source]
        source: Box<DbError>,
    },

    #[error("'{operation}' is not allowed on replica database '{name}'")]
    ReplicaWrite { name: String, operation: String },

    #[error("'{operation}' is not allowed in the '{environment}' environment")]
    ProtectedEnvironment {
        environment: String,
        operation: String,
    },

    #[error("database '{name}' has no schema to load")]
    EmptySchema { name: String },

    #[error("'{tool}' was not found in PATH")]
    DumpToolMissing { tool: String },

    #[error("'{tool}' exited with {status}: {stderr}")]
    DumpFailed {
        tool: String,
        status: String,
        stderr: String,
    },

    #[error("no database is configured")]
    NoDatabases,

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Custom(String),
}

impl DbError {
    /// Wrap an error raised while running the migration with `version`.
    pub fn in_migration(version: impl Into<String>, err: DbError) -> Self {
        DbError::Migration {
            version: version.into(),
            source: Box::new(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::UnsupportedAdapter {
            database: "primary".to_string(),
            adapter: "oracle".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "adapter 'oracle' for database 'primary' is not supported"
        );
    }

    #[test]
    fn test_config_error_converts_into_db_error() {
        let err: DbError = ConfigError::InvalidValue {
            key: "DB_MAX_OPEN_CONNS_PRIMARY".to_string(),
            value: "lots".to_string(),
            expected: "an integer".to_string(),
        }
        .into();

        assert!(matches!(err, DbError::Config(_)));
        assert!(err.to_string().contains("DB_MAX_OPEN_CONNS_PRIMARY"));
    }

    #[test]
    fn test_migration_error_keeps_version_and_cause() {
        let err = DbError::in_migration("20200201165238", DbError::Custom("boom".to_string()));
        assert_eq!(err.to_string(), "migration 20200201165238 failed: boom");
    }

    #[test]
    fn test_invalid_name_mentions_example() {
        let err = DbError::InvalidMigrationName {
            name: "create_users.rs".to_string(),
            reason: "missing timestamp".to_string(),
        };
        assert!(err.to_string().contains("20060102150405_create_users.rs"));
    }
}
