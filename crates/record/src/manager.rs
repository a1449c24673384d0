//! Registry of connection handles, one per configured database

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::config::{self, DatabaseConfig};
use crate::error::{ConfigError, DbResult};
use crate::handle::ConnectionHandle;

/// Owns a [`ConnectionHandle`] for every database found in the
/// configuration, together with the errors found while resolving it.
#[derive(Debug, Default)]
pub struct ConnectionManager {
    handles: BTreeMap<String, Arc<ConnectionHandle>>,
    errors: Vec<ConfigError>,
}

impl ConnectionManager {
    /// Build from the process environment.
    pub fn from_env() -> Self {
        Self::from_vars(std::env::vars())
    }

    /// Build from explicit key/value entries.
    pub fn from_vars<I, K, V>(vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let (configs, errors) = config::resolve(vars);
        Self::from_configs(configs, errors)
    }

    pub fn from_configs(configs: HashMap<String, DatabaseConfig>, errors: Vec<ConfigError>) -> Self {
        let handles = configs
            .into_iter()
            .map(|(name, config)| {
                let handle = Arc::new(ConnectionHandle::new(name.clone(), config));
                (name, handle)
            })
            .collect();

        for error in &errors {
            tracing::warn!("Database configuration error: {}", error);
        }

        Self { handles, errors }
    }

    pub fn handle(&self, name: &str) -> Option<Arc<ConnectionHandle>> {
        self.handles.get(name).cloned()
    }

    /// Handles sorted by database name.
    pub fn handles(&self) -> impl Iterator<Item = &Arc<ConnectionHandle>> {
        self.handles.values()
    }

    pub fn names(&self) -> Vec<&str> {
        self.handles.keys().map(String::as_str).collect()
    }

    pub fn errors(&self) -> &[ConfigError] {
        &self.errors
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    /// Connect every handle, stopping at the first failure.
    pub async fn connect_all(&self, same_database: bool) -> DbResult<()> {
        for handle in self.handles() {
            handle.connect_database(same_database).await?;
        }
        Ok(())
    }

    pub async fn close_all(&self) -> DbResult<()> {
        for handle in self.handles() {
            handle.close().await;
        }
        Ok(())
    }

    /// One-line summary of the configured databases.
    pub fn info(&self) -> String {
        if self.handles.is_empty() {
            return "* DBs: none".to_string();
        }
        format!("* DBs: {}", self.names().join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_manager_builds_one_handle_per_database() {
        let manager = ConnectionManager::from_vars([
            ("DB_URI_PRIMARY", "postgres://u:p@localhost:5432/app"),
            ("DB_URI_PRIMARY_REPLICA", "postgres://u:p@localhost:5433/app"),
            ("DB_REPLICA_PRIMARY_REPLICA", "true"),
            ("DB_URI_ANALYTICS", "mysql://u:p@localhost:3306/stats"),
        ]);

        assert!(manager.errors().is_empty());
        assert_eq!(manager.names(), vec!["analytics", "primary", "primaryReplica"]);
        assert_eq!(manager.info(), "* DBs: analytics, primary, primaryReplica");

        let replica = manager.handle("primaryReplica").unwrap();
        assert!(replica.is_replica());
        assert!(!replica.is_connected());
        assert!(manager.handle("missing").is_none());
    }

    #[test]
    fn test_manager_keeps_errors_next_to_handles() {
        let manager = ConnectionManager::from_vars([
            ("DB_URI_PRIMARY", "postgres://u:p@localhost:5432/app"),
            ("DB_URI_LEGACY", "oracle://u:p@localhost:1521/app"),
        ]);

        assert_eq!(manager.len(), 1);
        assert_eq!(manager.errors().len(), 1);
    }

    #[test]
    fn test_info_without_databases() {
        let manager = ConnectionManager::from_vars(Vec::<(String, String)>::new());
        assert!(manager.is_empty());
        assert_eq!(manager.info(), "* DBs: none");
    }

    #[test]
    #[serial]
    fn test_from_env_reads_process_environment() {
        std::env::set_var("DB_URI_KEEL_ENV_PROBE", "sqlite://probe.db");
        let manager = ConnectionManager::from_env();
        std::env::remove_var("DB_URI_KEEL_ENV_PROBE");

        let handle = manager.handle("keelEnvProbe").unwrap();
        assert_eq!(handle.config().database, "probe.db");
    }

    #[tokio::test]
    async fn test_connect_all_on_sqlite() {
        let dir = tempfile::tempdir().unwrap();
        let uri = format!("sqlite://{}?mode=rwc", dir.path().join("app.db").display());
        let manager = ConnectionManager::from_vars([("DB_URI_PRIMARY", uri)]);

        manager.connect_all(true).await.unwrap();
        assert!(manager.handle("primary").unwrap().is_connected());

        manager.close_all().await.unwrap();
        assert!(!manager.handle("primary").unwrap().is_connected());
    }
}
