use keel_record::tasks;

use super::{manager, Context};

pub async fn create(ctx: &Context) -> anyhow::Result<()> {
    let manager = manager(ctx)?;
    manager.connect_all(false).await?;

    let result = tasks::create_all(&manager).await;
    manager.close_all().await?;

    for name in result? {
        println!("✅ Created database '{}'", name);
    }
    Ok(())
}

pub async fn drop(ctx: &Context) -> anyhow::Result<()> {
    let manager = manager(ctx)?;
    manager.connect_all(false).await?;

    let result = tasks::drop_all(&manager, &ctx.env).await;
    manager.close_all().await?;

    for name in result? {
        println!("🗑️  Dropped database '{}'", name);
    }
    Ok(())
}

pub async fn seed(ctx: &Context, database: Option<&str>) -> anyhow::Result<()> {
    let manager = manager(ctx)?;
    manager.connect_all(true).await?;

    let result = tasks::seed_all(&manager, database).await;
    manager.close_all().await?;

    for name in result? {
        println!("🌱 Seeded database '{}'", name);
    }
    Ok(())
}
