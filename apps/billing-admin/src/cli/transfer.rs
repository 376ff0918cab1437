use billing_core::{
    BillingStore, CoreError,
    transfer::{DatabaseDump, DumpImport, export_all},
};
use chrono::Utc;
use clap::Args;
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Debug, Args)]
pub(crate) struct ExportArgs {
    /// Destination JSON file
    #[arg(long)]
    out: PathBuf,
}

#[derive(Debug, Args)]
pub(crate) struct ImportArgs {
    /// JSON file produced by `export`
    #[arg(long = "in")]
    input: PathBuf,
}

pub(crate) async fn export<S>(store: &S, args: ExportArgs) -> Result<(), CoreError>
where
    S: BillingStore + ?Sized,
{
    let dump = export_all(store, Utc::now()).await?;
    write_dump(&args.out, &dump).await?;
    info!(path = %args.out.display(), "Export written");
    Ok(())
}

pub(crate) async fn import<S>(store: &S, args: ImportArgs) -> Result<(), CoreError>
where
    S: DumpImport + ?Sized,
{
    let dump = read_dump(&args.input).await?;
    let summary = store.import_dump(dump).await?;
    println!(
        "imported {} users, {} flats, {} readings",
        summary.users, summary.flats, summary.readings
    );
    Ok(())
}

async fn write_dump(path: &Path, dump: &DatabaseDump) -> Result<(), CoreError> {
    let json = serde_json::to_vec_pretty(dump)?;
    tokio::fs::write(path, json)
        .await
        .map_err(|e| CoreError::Infrastructure(Box::new(e)))
}

async fn read_dump(path: &Path) -> Result<DatabaseDump, CoreError> {
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|e| CoreError::Infrastructure(Box::new(e)))?;
    Ok(serde_json::from_slice(&bytes)?)
}
