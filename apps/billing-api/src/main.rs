use billing_api::{AppState, config::AppConfig, create_app};
use billing_core::adapters::{InMemoryCache, InMemoryEventBus, InMemoryStore, PostgresStore};
use dotenvy::dotenv;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{Level, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    // Load environment (.env) if present, before RUST_LOG is read.
    dotenv().ok();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_env_filter(EnvFilter::from_default_env())
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!("Starting billing API v{}...", env!("CARGO_PKG_VERSION"));
    let config = AppConfig::from_env()?;

    let cache = Arc::new(InMemoryCache::default());
    let event_bus = Arc::new(InMemoryEventBus::default());

    let app_state = match config.database_url.as_deref() {
        Some(url) => {
            let store = PostgresStore::connect(url, config.database_max_connections).await?;
            info!("Connected to Postgres; applying migrations...");
            store.migrate().await?;
            info!("Migrations applied successfully.");
            AppState::from_store(
                Arc::new(store),
                cache,
                event_bus,
                config.session_ttl_seconds,
            )
        }
        None => {
            warn!("DATABASE_URL not set; using in-memory storage (data is lost on restart)");
            AppState::from_store(
                Arc::new(InMemoryStore::new()),
                cache,
                event_bus,
                config.session_ttl_seconds,
            )
        }
    };

    let app = create_app(app_state);

    let listener = TcpListener::bind(config.bind_addr).await?;
    info!("Billing API listening on {}", config.bind_addr);
    axum::serve(listener, app.into_make_service()).await?;
    Ok(())
}
