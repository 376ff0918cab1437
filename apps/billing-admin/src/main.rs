use clap::Parser;
use dotenvy::dotenv;
use std::process::ExitCode;
use tracing::error;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

mod cli;

#[tokio::main]
async fn main() -> ExitCode {
    dotenv().ok();

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .finish();
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("failed to install logger: {e}");
    }

    match cli::Cli::parse().run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}
