use crate::map_core_error;
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use billing_core::{CoreError, EventPublisher, domain::events::BillingEvent};
use serde_json::json;
use tracing::warn;

pub mod authz;
pub mod commands;
pub mod middleware;
pub mod query;
pub mod ws;

/// Error returned by every route handler; rendered as `{"error": message}`.
#[derive(thiserror::Error, Debug)]
pub enum ApplicationError {
    #[error("{0}")]
    Core(#[from] CoreError),

    #[error("{0}")]
    Unauthorized(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    NotFound(String),
}

impl ApplicationError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApplicationError::Core(e) => map_core_error(e),
            ApplicationError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApplicationError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApplicationError::Validation(_) => StatusCode::BAD_REQUEST,
            ApplicationError::NotFound(_) => StatusCode::NOT_FOUND,
        }
    }
}

impl IntoResponse for ApplicationError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = if status.is_server_error() {
            "Internal server error".to_string()
        } else {
            self.to_string()
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

/// Runs CPU-heavy work (password hashing) off the async workers.
pub(crate) async fn blocking<T, F>(work: F) -> Result<T, CoreError>
where
    F: FnOnce() -> Result<T, CoreError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| CoreError::Internal(format!("blocking task failed: {}", e)))?
}

/// Publishes `event` on each of its topics. The change is already stored, so
/// delivery failures are logged rather than returned.
pub(crate) async fn publish_event(publisher: &dyn EventPublisher, event: &BillingEvent) {
    for topic in event.topics() {
        if let Err(e) = publisher.publish(&topic, event).await {
            warn!(
                topic = %topic,
                event_type = event.event_type(),
                "Failed to publish event: {}",
                e
            );
        }
    }
}
