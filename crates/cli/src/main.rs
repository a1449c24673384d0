mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use commands::*;
use keel_record::Environment;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "keel")]
#[command(about = "Database tasks for DB_URI_* configured databases")]
struct Cli {
    /// Directory holding `<database>/*.sql` migrations
    #[arg(long, global = true, default_value = "db/migrate")]
    migrations_dir: PathBuf,

    /// Directory holding `<database>/schema.rs` snapshots
    #[arg(long, global = true, default_value = "db/schema")]
    schema_dir: PathBuf,

    /// Environment, defaults to APP_ENV
    #[arg(long, global = true)]
    env: Option<String>,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create every primary database and its test companion
    Create,

    /// Drop every primary database and its test companion
    Drop,

    /// Apply pending migrations
    Migrate {
        /// Only migrate this database
        #[arg(long)]
        database: Option<String>,
    },

    /// Show which migrations are applied
    #[command(name = "migrate:status")]
    MigrateStatus {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Roll back the latest applied migration
    Rollback {
        /// Only roll back this database
        #[arg(long)]
        database: Option<String>,
    },

    /// Dump every primary schema to the schema directory
    #[command(name = "schema:dump")]
    SchemaDump,

    /// Load every primary schema from the schema directory
    #[command(name = "schema:load")]
    SchemaLoad,

    /// Run the seed for every primary database
    Seed {
        /// Only seed this database
        #[arg(long)]
        database: Option<String>,
    },

    /// Generate a new migration file
    #[command(name = "migration:new")]
    MigrationNew {
        /// Database the migration belongs to
        database: String,

        /// Migration name (e.g. CreateUsers)
        name: String,

        /// Run the migration inside a transaction
        #[arg(long)]
        tx: bool,

        /// Write a `.sql` migration instead of a Rust module
        #[arg(long)]
        sql: bool,
    },
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let env = cli
        .env
        .as_deref()
        .map(Environment::from)
        .unwrap_or_else(Environment::from_env);
    let ctx = Context {
        migrations_dir: cli.migrations_dir,
        schema_dir: cli.schema_dir,
        env,
    };

    match cli.command {
        Commands::Create => db::create(&ctx).await?,
        Commands::Drop => db::drop(&ctx).await?,
        Commands::Migrate { database } => migrate::run(&ctx, database.as_deref()).await?,
        Commands::MigrateStatus { json } => migrate::status(&ctx, json).await?,
        Commands::Rollback { database } => migrate::rollback(&ctx, database.as_deref()).await?,
        Commands::SchemaDump => schema::dump(&ctx).await?,
        Commands::SchemaLoad => schema::load(&ctx).await?,
        Commands::Seed { database } => db::seed(&ctx, database.as_deref()).await?,
        Commands::MigrationNew {
            database,
            name,
            tx,
            sql,
        } => migrate::create(&ctx, &database, &name, tx, sql)?,
    }

    Ok(())
}
