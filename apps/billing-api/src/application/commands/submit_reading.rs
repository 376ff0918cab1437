use crate::{
    AppState,
    application::{
        ApplicationError,
        authz::{Requirement, authorize},
        middleware::AuthenticatedUser,
        publish_event,
    },
};
use axum::{
    Json,
    extract::{Extension, State},
    http::StatusCode,
};
use billing_core::{
    CommandHandler, CoreError, EventPublisher, FlatRepository, ReadingRepository,
    domain::{
        events::BillingEvent,
        reading::{Reading, SubmitReading},
    },
};
use chrono::Utc;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{info, warn};

pub struct SubmitReadingHandler {
    flat_repository: Arc<dyn FlatRepository>,
    reading_repository: Arc<dyn ReadingRepository>,
    event_publisher: Arc<dyn EventPublisher>,
}

impl SubmitReadingHandler {
    pub fn new(
        flat_repository: Arc<dyn FlatRepository>,
        reading_repository: Arc<dyn ReadingRepository>,
        event_publisher: Arc<dyn EventPublisher>,
    ) -> Self {
        Self {
            flat_repository,
            reading_repository,
            event_publisher,
        }
    }
}

impl CommandHandler<SubmitReading> for SubmitReadingHandler {
    type Output = Reading;

    async fn handle(&self, command: SubmitReading) -> Result<Reading, CoreError> {
        if self
            .flat_repository
            .get_flat(&command.flat_id)
            .await?
            .is_none()
        {
            return Err(CoreError::NotFound(format!(
                "Flat not found: {}",
                command.flat_id
            )));
        }

        let reading = Reading::submit(command, Utc::now())?;
        let reading = self.reading_repository.submit_reading(reading).await?;
        info!(
            reading_id = %reading.id,
            flat_id = %reading.flat_id,
            month = %reading.bucket(),
            "Reading submitted"
        );

        publish_event(
            self.event_publisher.as_ref(),
            &BillingEvent::for_reading(&reading),
        )
        .await;
        Ok(reading)
    }
}

#[derive(Debug, Deserialize)]
pub struct SubmitReadingRequest {
    /// Defaults to the caller's own flat.
    pub flat_id: Option<String>,
    pub image_ref: String,
    pub tenant_reading: Decimal,
}

// POST /api/readings
pub async fn handle_submit_reading_request(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthenticatedUser>,
    Json(payload): Json<SubmitReadingRequest>,
) -> Result<(StatusCode, Json<Reading>), ApplicationError> {
    let flat_id = match payload.flat_id.or_else(|| ctx.flat_id.clone()) {
        Some(flat_id) => flat_id,
        None if ctx.is_admin() => {
            return Err(ApplicationError::Validation("flat_id is required".into()));
        }
        None => {
            return Err(ApplicationError::Forbidden(
                "No flat is linked to this account".into(),
            ));
        }
    };
    authorize(&ctx, Requirement::FlatAccess { flat_id: &flat_id })?;

    let handler = SubmitReadingHandler::new(
        state.flats.clone(),
        state.readings.clone(),
        state.event_publisher.clone(),
    );
    let command = SubmitReading {
        flat_id,
        image_ref: payload.image_ref,
        tenant_reading: payload.tenant_reading,
    };
    match handler.handle(command).await {
        Ok(reading) => Ok((StatusCode::CREATED, Json(reading))),
        Err(e) => {
            warn!(user_id = %ctx.user_id, "Reading submission refused: {}", e);
            Err(e.into())
        }
    }
}
