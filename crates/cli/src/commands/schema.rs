use keel_record::{schema as snapshot, tasks};

use super::{manager, Context};

pub async fn dump(ctx: &Context) -> anyhow::Result<()> {
    let manager = manager(ctx)?;
    manager.connect_all(true).await?;

    let result = tasks::dump_schema_all(&manager, &ctx.schema_dir).await;
    manager.close_all().await?;

    for path in result? {
        println!("📄 Wrote {}", path.display());
    }
    Ok(())
}

pub async fn load(ctx: &Context) -> anyhow::Result<()> {
    let manager = manager(ctx)?;
    for handle in manager.handles().filter(|handle| !handle.is_replica()) {
        snapshot::read_schema_file(handle, &ctx.schema_dir).await?;
    }
    manager.connect_all(true).await?;

    let result = tasks::load_schema_all(&manager).await;
    manager.close_all().await?;

    for name in result? {
        println!("✅ Loaded schema into '{}'", name);
    }
    Ok(())
}
