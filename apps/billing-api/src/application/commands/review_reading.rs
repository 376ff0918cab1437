//! Admin review of submitted readings: approve, reject and reopen.

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
    extract::{Extension, Path, State},
};
use billing_core::{
    CommandHandler, CoreError, EventPublisher, ReadingRepository, SettingsStore,
    domain::{
        events::BillingEvent,
        reading::{ApproveReading, Reading, RejectReading, ReopenReading},
    },
};
use chrono::Utc;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::sync::Arc;
use tracing::info;

pub struct ApproveReadingHandler {
    reading_repository: Arc<dyn ReadingRepository>,
    settings_store: Arc<dyn SettingsStore>,
    event_publisher: Arc<dyn EventPublisher>,
}

impl ApproveReadingHandler {
    pub fn new(
        reading_repository: Arc<dyn ReadingRepository>,
        settings_store: Arc<dyn SettingsStore>,
        event_publisher: Arc<dyn EventPublisher>,
    ) -> Self {
        Self {
            reading_repository,
            settings_store,
            event_publisher,
        }
    }
}

impl CommandHandler<ApproveReading> for ApproveReadingHandler {
    type Output = Reading;

    async fn handle(&self, command: ApproveReading) -> Result<Reading, CoreError> {
        let rates = self.settings_store.current_settings().await?.snapshot();
        let reading = self
            .reading_repository
            .approve_reading(
                &command.reading_id,
                command.corrected_reading,
                &rates,
                Utc::now(),
            )
            .await?;
        info!(
            reading_id = %reading.id,
            flat_id = %reading.flat_id,
            settings_version = rates.version,
            amount = ?reading.amount,
            "Reading approved"
        );
        publish_event(
            self.event_publisher.as_ref(),
            &BillingEvent::for_reading(&reading),
        )
        .await;
        Ok(reading)
    }
}

pub struct RejectReadingHandler {
    reading_repository: Arc<dyn ReadingRepository>,
    event_publisher: Arc<dyn EventPublisher>,
}

impl RejectReadingHandler {
    pub fn new(
        reading_repository: Arc<dyn ReadingRepository>,
        event_publisher: Arc<dyn EventPublisher>,
    ) -> Self {
        Self {
            reading_repository,
            event_publisher,
        }
    }
}

impl CommandHandler<RejectReading> for RejectReadingHandler {
    type Output = Reading;

    async fn handle(&self, command: RejectReading) -> Result<Reading, CoreError> {
        let reading = self
            .reading_repository
            .reject_reading(&command.reading_id, command.reason)
            .await?;
        info!(reading_id = %reading.id, flat_id = %reading.flat_id, "Reading rejected");
        publish_event(
            self.event_publisher.as_ref(),
            &BillingEvent::for_reading(&reading),
        )
        .await;
        Ok(reading)
    }
}

pub struct ReopenReadingHandler {
    reading_repository: Arc<dyn ReadingRepository>,
    event_publisher: Arc<dyn EventPublisher>,
}

impl ReopenReadingHandler {
    pub fn new(
        reading_repository: Arc<dyn ReadingRepository>,
        event_publisher: Arc<dyn EventPublisher>,
    ) -> Self {
        Self {
            reading_repository,
            event_publisher,
        }
    }
}

impl CommandHandler<ReopenReading> for ReopenReadingHandler {
    type Output = Reading;

    async fn handle(&self, command: ReopenReading) -> Result<Reading, CoreError> {
        let reading = self
            .reading_repository
            .reopen_reading(&command.reading_id, command.reason)
            .await?;
        info!(
            reading_id = %reading.id,
            flat_id = %reading.flat_id,
            reason = ?reading.reopen_reason,
            "Reading reopened"
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
pub struct ApproveRequest {
    pub corrected_reading: Decimal,
}

#[derive(Debug, Default, Deserialize)]
pub struct RejectRequest {
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ReopenRequest {
    pub reason: String,
}

// POST /api/readings/{reading_id}/approve
pub async fn handle_approve_reading_request(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthenticatedUser>,
    Path(reading_id): Path<String>,
    Json(payload): Json<ApproveRequest>,
) -> Result<Json<Reading>, ApplicationError> {
    authorize(&ctx, Requirement::AdminOnly)?;
    let handler = ApproveReadingHandler::new(
        state.readings.clone(),
        state.settings.clone(),
        state.event_publisher.clone(),
    );
    let reading = handler
        .handle(ApproveReading {
            reading_id,
            corrected_reading: payload.corrected_reading,
        })
        .await?;
    Ok(Json(reading))
}

// POST /api/readings/{reading_id}/reject
pub async fn handle_reject_reading_request(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthenticatedUser>,
    Path(reading_id): Path<String>,
    Json(payload): Json<RejectRequest>,
) -> Result<Json<Reading>, ApplicationError> {
    authorize(&ctx, Requirement::AdminOnly)?;
    let handler = RejectReadingHandler::new(state.readings.clone(), state.event_publisher.clone());
    let reading = handler
        .handle(RejectReading {
            reading_id,
            reason: payload.reason,
        })
        .await?;
    Ok(Json(reading))
}

// POST /api/readings/{reading_id}/reopen
pub async fn handle_reopen_reading_request(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthenticatedUser>,
    Path(reading_id): Path<String>,
    Json(payload): Json<ReopenRequest>,
) -> Result<Json<Reading>, ApplicationError> {
    authorize(&ctx, Requirement::AdminOnly)?;
    let handler = ReopenReadingHandler::new(state.readings.clone(), state.event_publisher.clone());
    let reading = handler
        .handle(ReopenReading {
            reading_id,
            reason: payload.reason,
        })
        .await?;
    Ok(Json(reading))
}
