use std::path::Path;
use std::sync::Arc;

use keel_record::{
    tasks, ConnectionHandle, ConnectionManager, DatabaseConfig, DbError, MigrationEntry,
    MigrationRegistry, MigrationState,
};
use sqlx::{Executor, Row};

const CREATE_USERS: &str = "db/migrate/primary/20200201165238_create_users.rs";
const ADD_INDEX: &str = "db/migrate/primary/20200202165238_add_index_to_users.rs";

fn sqlite_handle(dir: &Path, file: &str) -> ConnectionHandle {
    let uri = format!("sqlite://{}?mode=rwc", dir.join(file).display());
    ConnectionHandle::new("primary", DatabaseConfig::from_uri("primary", &uri).unwrap())
}

fn register_users(handle: &ConnectionHandle) {
    handle
        .add_migration(
            MigrationEntry::sql(
                CREATE_USERS,
                "CREATE TABLE users (\n  id INTEGER PRIMARY KEY,\n  name TEXT NOT NULL\n)",
                "DROP TABLE users",
                true,
            )
            .unwrap(),
        )
        .unwrap();
    handle
        .add_migration(
            MigrationEntry::sql(
                ADD_INDEX,
                "CREATE INDEX idx_users_name ON users (name)",
                "DROP INDEX idx_users_name",
                false,
            )
            .unwrap(),
        )
        .unwrap();
}

async fn applied_versions(handle: &ConnectionHandle) -> Vec<String> {
    handle
        .fetch_all("SELECT version FROM schema_migrations ORDER BY version", &[])
        .await
        .unwrap()
        .iter()
        .map(|row| row.try_get::<String, _>(0).unwrap())
        .collect()
}

async fn table_exists(handle: &ConnectionHandle, table: &str) -> bool {
    let row = handle
        .fetch_one(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?",
            &[table.into()],
        )
        .await
        .unwrap();
    row.try_get::<i64, _>(0).unwrap() > 0
}

fn states(status: &[keel_record::MigrationStatus]) -> Vec<(MigrationState, &str)> {
    status
        .iter()
        .map(|s| (s.status, s.version.as_str()))
        .collect()
}

#[tokio::test]
async fn test_migrate_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let handle = sqlite_handle(dir.path(), "app.db");
    handle.connect().await.unwrap();
    register_users(&handle);

    let first = handle.migrate().await.unwrap();
    assert_eq!(first.applied, vec!["20200201165238", "20200202165238"]);
    assert_eq!(first.skipped, 0);

    let second = handle.migrate().await.unwrap();
    assert!(second.applied.is_empty());
    assert_eq!(second.skipped, 2);

    assert_eq!(
        applied_versions(&handle).await,
        vec!["20200201165238", "20200202165238"]
    );
    handle.close().await;
}

#[tokio::test]
async fn test_status_follows_rollbacks() {
    let dir = tempfile::tempdir().unwrap();
    let handle = sqlite_handle(dir.path(), "app.db");
    handle.connect().await.unwrap();
    register_users(&handle);

    let before = handle.migrate_status().await.unwrap();
    assert_eq!(
        states(&before),
        vec![
            (MigrationState::Down, "20200201165238"),
            (MigrationState::Down, "20200202165238"),
        ]
    );
    assert_eq!(before[0].source, CREATE_USERS);

    handle.migrate().await.unwrap();
    assert_eq!(
        states(&handle.migrate_status().await.unwrap()),
        vec![
            (MigrationState::Up, "20200201165238"),
            (MigrationState::Up, "20200202165238"),
        ]
    );

    let rolled = handle.rollback().await.unwrap();
    assert_eq!(rolled.rolled_back.as_deref(), Some("20200202165238"));
    assert_eq!(
        states(&handle.migrate_status().await.unwrap()),
        vec![
            (MigrationState::Up, "20200201165238"),
            (MigrationState::Down, "20200202165238"),
        ]
    );
    assert!(table_exists(&handle, "users").await);

    let rolled = handle.rollback().await.unwrap();
    assert_eq!(rolled.rolled_back.as_deref(), Some("20200201165238"));
    assert!(handle
        .migrate_status()
        .await
        .unwrap()
        .iter()
        .all(|s| s.status == MigrationState::Down));
    assert!(!table_exists(&handle, "users").await);

    let rolled = handle.rollback().await.unwrap();
    assert!(rolled.rolled_back.is_none());
    handle.close().await;
}

#[tokio::test]
async fn test_failed_transactional_batch_is_rolled_back() {
    let dir = tempfile::tempdir().unwrap();
    let handle = sqlite_handle(dir.path(), "app.db");
    handle.connect().await.unwrap();

    handle
        .add_migration(
            MigrationEntry::sql("20200201165238_create_a", "CREATE TABLE a (id INTEGER)", "DROP TABLE a", true)
                .unwrap(),
        )
        .unwrap();
    handle
        .add_migration(
            MigrationEntry::sql("20200202165238_broken", "CREATE TABLE (", "", true).unwrap(),
        )
        .unwrap();

    let err = handle.migrate().await.unwrap_err();
    match err {
        DbError::Migration { version, .. } => assert_eq!(version, "20200202165238"),
        other => panic!("unexpected error: {:?}", other),
    }

    assert!(applied_versions(&handle).await.is_empty());
    assert!(!table_exists(&handle, "a").await);
    handle.close().await;
}

#[tokio::test]
async fn test_non_transactional_entry_commits_preceding_batch() {
    let dir = tempfile::tempdir().unwrap();
    let handle = sqlite_handle(dir.path(), "app.db");
    handle.connect().await.unwrap();

    let registry = MigrationRegistry::new()
        .with(MigrationEntry::sql("20200201165238_create_a", "CREATE TABLE a (id INTEGER)", "DROP TABLE a", true).unwrap())
        .unwrap()
        .with(MigrationEntry::sql("20200202165238_create_b", "CREATE TABLE b (id INTEGER)", "DROP TABLE b", false).unwrap())
        .unwrap()
        .with(MigrationEntry::sql("20200203165238_broken", "CREATE TABLE (", "", true).unwrap())
        .unwrap();
    handle.set_migrations(registry);

    assert!(handle.migrate().await.is_err());

    assert_eq!(
        applied_versions(&handle).await,
        vec!["20200201165238", "20200202165238"]
    );
    assert!(table_exists(&handle, "a").await);
    assert!(table_exists(&handle, "b").await);
    handle.close().await;
}

#[tokio::test]
async fn test_closure_migrations_run_on_the_transaction() {
    let dir = tempfile::tempdir().unwrap();
    let handle = sqlite_handle(dir.path(), "app.db");
    handle.connect().await.unwrap();

    handle
        .register_migration_tx(
            CREATE_USERS,
            |conn| {
                Box::pin(async move {
                    conn.execute("CREATE TABLE users (name TEXT)").await?;
                    sqlx::query("INSERT INTO users (name) VALUES (?)")
                        .bind("root")
                        .execute(&mut *conn)
                        .await?;
                    Ok(())
                })
            },
            |conn| {
                Box::pin(async move {
                    conn.execute("DROP TABLE users").await?;
                    Ok(())
                })
            },
        )
        .unwrap();

    handle.migrate().await.unwrap();
    let row = handle.fetch_one("SELECT name FROM users", &[]).await.unwrap();
    assert_eq!(row.try_get::<String, _>(0).unwrap(), "root");

    handle.rollback().await.unwrap();
    assert!(!table_exists(&handle, "users").await);
    handle.close().await;
}

#[tokio::test]
async fn test_concurrent_migrate_on_one_handle() {
    let dir = tempfile::tempdir().unwrap();
    let handle = Arc::new(sqlite_handle(dir.path(), "app.db"));
    handle.connect().await.unwrap();
    register_users(&handle);

    let (first, second) = tokio::join!(handle.migrate(), handle.migrate());
    let applied = first.unwrap().applied.len() + second.unwrap().applied.len();

    assert_eq!(applied, 2);
    assert_eq!(applied_versions(&handle).await.len(), 2);
    handle.close().await;
}

#[tokio::test]
async fn test_replica_refuses_writes() {
    let dir = tempfile::tempdir().unwrap();
    let uri = format!("sqlite://{}?mode=rwc", dir.path().join("app.db").display());
    let mut config = DatabaseConfig::from_uri("primaryReplica", &uri).unwrap();
    config.replica = true;
    let handle = ConnectionHandle::new("primaryReplica", config);
    handle.connect().await.unwrap();
    register_users(&handle);

    assert!(matches!(
        handle.migrate().await,
        Err(DbError::ReplicaWrite { .. })
    ));
    assert!(matches!(
        handle.rollback().await,
        Err(DbError::ReplicaWrite { .. })
    ));
    assert!(!table_exists(&handle, "users").await);
    handle.close().await;
}

#[tokio::test]
async fn test_duplicate_versions_are_rejected_on_registration() {
    let dir = tempfile::tempdir().unwrap();
    let handle = sqlite_handle(dir.path(), "app.db");
    register_users(&handle);

    let err = handle
        .add_migration(MigrationEntry::sql("20200201165238_create_posts", "", "", true).unwrap())
        .unwrap_err();
    assert!(matches!(err, DbError::DuplicateVersion { .. }));
    assert_eq!(handle.migrations().len(), 2);

    let err = handle
        .register_migration("create_posts.rs", |_| Box::pin(async { Ok(()) }), |_| Box::pin(async { Ok(()) }))
        .unwrap_err();
    assert!(matches!(err, DbError::InvalidMigrationName { .. }));
}

#[tokio::test]
async fn test_rollback_leaves_unregistered_versions_alone() {
    let dir = tempfile::tempdir().unwrap();
    let handle = sqlite_handle(dir.path(), "app.db");
    handle.connect().await.unwrap();
    register_users(&handle);
    handle.migrate().await.unwrap();

    handle.set_migrations(MigrationRegistry::new());
    let rolled = handle.rollback().await.unwrap();

    assert!(rolled.rolled_back.is_none());
    assert_eq!(applied_versions(&handle).await.len(), 2);
    handle.close().await;
}

#[tokio::test]
async fn test_tasks_run_across_the_manager() {
    let dir = tempfile::tempdir().unwrap();
    let uri = format!("sqlite://{}?mode=rwc", dir.path().join("app.db").display());
    let manager = ConnectionManager::from_vars([("DB_URI_PRIMARY", uri)]);
    tasks::ensure_ready(&manager).unwrap();
    manager.connect_all(true).await.unwrap();
    register_users(&manager.handle("primary").unwrap());

    let results = tasks::migrate_all(&manager, None).await.unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].0, "primary");
    assert_eq!(results[0].1.applied.len(), 2);

    let report = tasks::migrate_status_all(&manager).await.unwrap();
    assert!(report[0].1.iter().all(|s| s.status == MigrationState::Up));

    let rolled = tasks::rollback(&manager, Some("primary")).await.unwrap();
    assert_eq!(rolled[0].1.rolled_back.as_deref(), Some("20200202165238"));

    manager.close_all().await.unwrap();
}

#[tokio::test]
async fn test_registration_order_differs_from_version_order() {
    let dir = tempfile::tempdir().unwrap();
    let handle = sqlite_handle(dir.path(), "app.db");
    handle.connect().await.unwrap();

    handle
        .add_migration(
            MigrationEntry::sql(
                "20200202165238_create_posts",
                "CREATE TABLE posts (id INTEGER)",
                "DROP TABLE posts",
                true,
            )
            .unwrap(),
        )
        .unwrap();
    handle
        .add_migration(
            MigrationEntry::sql(
                "20200201165238_create_users",
                "CREATE TABLE users (id INTEGER)",
                "DROP TABLE users",
                false,
            )
            .unwrap(),
        )
        .unwrap();
    let registered: Vec<String> = handle
        .migrations()
        .iter()
        .map(|entry| entry.version().to_string())
        .collect();
    assert_eq!(registered, vec!["20200202165238", "20200201165238"]);

    let result = handle.migrate().await.unwrap();
    assert_eq!(result.applied, vec!["20200202165238", "20200201165238"]);

    let rolled = handle.rollback().await.unwrap();
    assert_eq!(rolled.rolled_back.as_deref(), Some("20200202165238"));
    assert_eq!(
        states(&handle.migrate_status().await.unwrap()),
        vec![
            (MigrationState::Down, "20200202165238"),
            (MigrationState::Up, "20200201165238"),
        ]
    );
    assert!(!table_exists(&handle, "posts").await);
    assert!(table_exists(&handle, "users").await);

    let rolled = handle.rollback().await.unwrap();
    assert_eq!(rolled.rolled_back.as_deref(), Some("20200201165238"));
    assert!(!table_exists(&handle, "users").await);
    assert!(applied_versions(&handle).await.is_empty());
    handle.close().await;
}

#[tokio::test]
async fn test_replica_without_versions_table_reports_nothing_applied() {
    let dir = tempfile::tempdir().unwrap();
    let uri = format!("sqlite://{}?mode=rwc", dir.path().join("app.db").display());
    let mut config = DatabaseConfig::from_uri("primaryReplica", &uri).unwrap();
    config.replica = true;
    let handle = ConnectionHandle::new("primaryReplica", config);
    handle.connect().await.unwrap();
    register_users(&handle);

    let status = handle.migrate_status().await.unwrap();
    assert_eq!(
        states(&status),
        vec![
            (MigrationState::Down, "20200201165238"),
            (MigrationState::Down, "20200202165238"),
        ]
    );
    assert!(!table_exists(&handle, "schema_migrations").await);
    handle.close().await;
}
