use billing_core::{CoreError, adapters::PostgresStore};
use clap::{Args, Parser, Subcommand};
use tracing::info;

mod create_admin;
mod transfer;

#[derive(Debug, Parser)]
#[command(name = "billing-admin", about = "Meter billing administration", long_about = None)]
pub(crate) struct Cli {
    #[command(flatten)]
    database: DatabaseArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Args)]
struct DatabaseArgs {
    /// PostgreSQL connection string
    #[arg(long, global = true, env = "DATABASE_URL", hide_env_values = true)]
    database_url: Option<String>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Apply pending schema migrations
    Migrate,
    /// Dump every collection to a JSON file
    Export(transfer::ExportArgs),
    /// Load a JSON dump in one transaction, overwriting records with the same id.
    /// Any failing record aborts the import and leaves the database unchanged.
    Import(transfer::ImportArgs),
    /// Create an admin account
    CreateAdmin(create_admin::CreateAdminArgs),
}

impl Cli {
    pub(crate) async fn run(self) -> Result<(), CoreError> {
        let store = connect(&self.database).await?;
        match self.command {
            Commands::Migrate => {
                info!("Migrations applied successfully.");
                Ok(())
            }
            Commands::Export(args) => transfer::export(&store, args).await,
            Commands::Import(args) => transfer::import(&store, args).await,
            Commands::CreateAdmin(args) => create_admin::run(&store, args).await,
        }
    }
}

/// Every command runs against an up-to-date schema.
async fn connect(args: &DatabaseArgs) -> Result<PostgresStore, CoreError> {
    let url = args
        .database_url
        .as_deref()
        .ok_or_else(|| CoreError::Configuration("DATABASE_URL is required".into()))?;
    let store = PostgresStore::connect(url, 1).await?;
    info!("Applying database migrations...");
    store.migrate().await?;
    Ok(store)
}
