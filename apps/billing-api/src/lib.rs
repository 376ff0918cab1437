use axum::{
    Json, Router,
    http::StatusCode,
    middleware,
    routing::{get, post, put},
};
use billing_core::{
    BillingStore, Cache, CoreError, EventPublisher, EventSubscriber, FlatRepository,
    ReadingRepository, SettingsStore, UserRepository,
    adapters::{InMemoryCache, InMemoryEventBus, InMemoryStore},
};
use serde_json::{Value, json};
use std::sync::Arc;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, warn};

pub mod application;
pub mod config;

use application::{
    commands::{
        change_password::{handle_change_password_request, handle_reset_password_request},
        login::{handle_login_request, handle_logout_request},
        manage_flats::{handle_create_flat_request, handle_update_flat_request},
        register_user::handle_register_user_request,
        review_reading::{
            handle_approve_reading_request, handle_reject_reading_request,
            handle_reopen_reading_request,
        },
        submit_reading::handle_submit_reading_request,
        update_settings::handle_update_settings_request,
    },
    middleware::session_auth,
    query::{
        handle_get_flat, handle_get_reading, handle_get_receipt, handle_get_settings,
        handle_list_flats, handle_list_readings, handle_list_users, handle_me,
        handle_monthly_summary,
    },
    ws::ws_handler,
};

const DEFAULT_SESSION_TTL_SECONDS: u64 = 12 * 60 * 60;

// Holds shared dependencies
#[derive(Clone)]
pub struct AppState {
    pub users: Arc<dyn UserRepository>,
    pub flats: Arc<dyn FlatRepository>,
    pub readings: Arc<dyn ReadingRepository>,
    pub settings: Arc<dyn SettingsStore>,
    pub cache: Arc<dyn Cache>,
    pub event_publisher: Arc<dyn EventPublisher>,
    pub event_subscriber: Arc<dyn EventSubscriber>,
    pub session_ttl_seconds: u64,
}

impl AppState {
    /// Wires every repository port to the same backing store.
    pub fn from_store<S>(
        store: Arc<S>,
        cache: Arc<dyn Cache>,
        event_bus: Arc<InMemoryEventBus>,
        session_ttl_seconds: u64,
    ) -> Self
    where
        S: BillingStore + 'static,
    {
        Self {
            users: store.clone(),
            flats: store.clone(),
            readings: store.clone(),
            settings: store,
            cache,
            event_publisher: event_bus.clone(),
            event_subscriber: event_bus,
            session_ttl_seconds,
        }
    }

    /// Fully in-memory state, used by tests and when no database is configured.
    pub fn in_memory() -> Self {
        Self::from_store(
            Arc::new(InMemoryStore::new()),
            Arc::new(InMemoryCache::default()),
            Arc::new(InMemoryEventBus::default()),
            DEFAULT_SESSION_TTL_SECONDS,
        )
    }
}

pub fn create_app(app_state: AppState) -> Router {
    let auth = || middleware::from_fn_with_state(app_state.clone(), session_auth);

    let api_routes = Router::new()
        .route("/auth/login", post(handle_login_request))
        .route("/auth/logout", post(handle_logout_request))
        // Registration stays open for the bootstrap admin and checks the session itself.
        .route(
            "/users",
            get(handle_list_users)
                .route_layer(auth())
                .post(handle_register_user_request),
        )
        .route("/users/me", get(handle_me).route_layer(auth()))
        .route(
            "/users/me/password",
            put(handle_change_password_request).route_layer(auth()),
        )
        .route(
            "/users/{user_id}/password",
            put(handle_reset_password_request).route_layer(auth()),
        )
        .route(
            "/flats",
            get(handle_list_flats)
                .post(handle_create_flat_request)
                .route_layer(auth()),
        )
        .route(
            "/flats/{flat_id}",
            get(handle_get_flat)
                .put(handle_update_flat_request)
                .route_layer(auth()),
        )
        .route(
            "/settings",
            get(handle_get_settings)
                .put(handle_update_settings_request)
                .route_layer(auth()),
        )
        .route(
            "/readings",
            get(handle_list_readings)
                .post(handle_submit_reading_request)
                .route_layer(auth()),
        )
        .route(
            "/readings/{reading_id}",
            get(handle_get_reading).route_layer(auth()),
        )
        .route(
            "/readings/{reading_id}/receipt",
            get(handle_get_receipt).route_layer(auth()),
        )
        .route(
            "/readings/{reading_id}/approve",
            post(handle_approve_reading_request).route_layer(auth()),
        )
        .route(
            "/readings/{reading_id}/reject",
            post(handle_reject_reading_request).route_layer(auth()),
        )
        .route(
            "/readings/{reading_id}/reopen",
            post(handle_reopen_reading_request).route_layer(auth()),
        )
        .route(
            "/summaries/{month}",
            get(handle_monthly_summary).route_layer(auth()),
        )
        // Authenticates from the header or the `token` query parameter.
        .route("/ws", get(ws_handler));

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .nest("/api", api_routes)
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(app_state)
}

pub async fn health() -> Json<Value> {
    Json(json!({ "status": "ok", "version": env!("CARGO_PKG_VERSION") }))
}

pub fn map_core_error(err: &CoreError) -> StatusCode {
    let status = match err {
        CoreError::NotFound(_) => StatusCode::NOT_FOUND,
        CoreError::Validation(_) => StatusCode::BAD_REQUEST,
        CoreError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
        CoreError::Forbidden(_) => StatusCode::FORBIDDEN,
        CoreError::Conflict(_) | CoreError::AlreadyExists(_) => StatusCode::CONFLICT,
        CoreError::Internal(_)
        | CoreError::Serialization(_)
        | CoreError::Infrastructure(_)
        | CoreError::Configuration(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        error!("CoreError occurred: {:?}", err);
    } else {
        warn!("Request failed: {}", err);
    }
    status
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn core_errors_map_to_http_status() {
        let cases = [
            (CoreError::NotFound("x".into()), StatusCode::NOT_FOUND),
            (CoreError::Validation("x".into()), StatusCode::BAD_REQUEST),
            (CoreError::Conflict("x".into()), StatusCode::CONFLICT),
            (CoreError::AlreadyExists("x".into()), StatusCode::CONFLICT),
            (CoreError::Forbidden("x".into()), StatusCode::FORBIDDEN),
            (CoreError::Unauthorized("x".into()), StatusCode::UNAUTHORIZED),
            (CoreError::Internal("x".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, expected) in cases {
            assert_eq!(map_core_error(&err), expected, "{:?}", err);
        }
    }
}
