pub mod db;
pub mod migrate;
pub mod schema;

use std::path::PathBuf;

use keel_record::{load_sql_migrations, tasks, ConnectionManager, Environment};

/// Settings shared by every command
pub struct Context {
    pub migrations_dir: PathBuf,
    pub schema_dir: PathBuf,
    pub env: Environment,
}

/// Resolve the configured databases and attach their SQL migrations.
pub fn manager(ctx: &Context) -> anyhow::Result<ConnectionManager> {
    let manager = ConnectionManager::from_env();
    tasks::ensure_ready(&manager)?;

    for handle in manager.handles() {
        let registry = load_sql_migrations(&ctx.migrations_dir.join(handle.name()))?;
        if !registry.is_empty() {
            handle.set_migrations(registry);
        }
    }

    tracing::debug!("{} ({})", manager.info(), ctx.env);
    Ok(manager)
}
