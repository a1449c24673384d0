use keel_record::{generate_migration, generate_sql_migration, tasks, MigrationStatus};

use super::{manager, Context};

pub async fn run(ctx: &Context, database: Option<&str>) -> anyhow::Result<()> {
    let manager = manager(ctx)?;
    manager.connect_all(true).await?;

    let result = tasks::migrate_all(&manager, database).await;
    manager.close_all().await?;

    for (name, run) in result? {
        if run.applied.is_empty() {
            println!("✅ '{}' is up to date", name);
        } else {
            println!(
                "✅ '{}': applied {} migration(s) in {:?}",
                name,
                run.applied.len(),
                run.elapsed
            );
            for version in &run.applied {
                println!("   {}", version);
            }
        }
    }
    Ok(())
}

pub async fn rollback(ctx: &Context, database: Option<&str>) -> anyhow::Result<()> {
    let manager = manager(ctx)?;
    manager.connect_all(true).await?;

    let result = tasks::rollback(&manager, database).await;
    manager.close_all().await?;

    for (name, rollback) in result? {
        match rollback.rolled_back {
            Some(version) => println!("↩️  '{}': rolled back {}", name, version),
            None => println!("'{}': nothing to roll back", name),
        }
    }
    Ok(())
}

pub async fn status(ctx: &Context, json: bool) -> anyhow::Result<()> {
    let manager = manager(ctx)?;
    manager.connect_all(true).await?;

    let result = tasks::migrate_status_all(&manager).await;
    manager.close_all().await?;
    let report = result?;

    if json {
        let mut value = serde_json::Map::new();
        for (name, rows) in &report {
            value.insert(name.clone(), serde_json::to_value(rows)?);
        }
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    for (name, rows) in &report {
        println!("{}", render_status(name, rows));
    }
    Ok(())
}

fn render_status(name: &str, rows: &[MigrationStatus]) -> String {
    let mut out = format!("Database: {}\n\n Status   Version          Source\n", name);
    out.push_str("--------------------------------------------------\n");
    if rows.is_empty() {
        out.push_str(" No migrations registered\n");
    }
    for row in rows {
        out.push_str(&format!(
            " {:<8} {:<16} {}\n",
            row.status, row.version, row.source
        ));
    }
    out
}

pub fn create(
    ctx: &Context,
    database: &str,
    name: &str,
    transactional: bool,
    sql: bool,
) -> anyhow::Result<()> {
    let path = if sql {
        generate_sql_migration(&ctx.migrations_dir, database, name, transactional)?
    } else {
        generate_migration(&ctx.migrations_dir, database, name, transactional)?
    };

    println!("Created migration: {}", path.display());
    Ok(())
}
