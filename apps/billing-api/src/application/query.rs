use axum::{
    Json,
    extract::{Extension, Path, Query, State},
};
use billing_core::{
    CoreError, FlatRepository, ReadingRepository, SettingsStore, UserRepository,
    domain::{
        flat::Flat,
        reading::{Reading, ReadingFilter, ReadingStatus, YearMonth},
        receipt::{MonthlySummary, Receipt},
        settings::GlobalSettings,
    },
};
use serde::Deserialize;
use tracing::debug;

use super::authz::{Requirement, authorize};
use super::commands::UserResponse;
use super::middleware::AuthenticatedUser;
use super::ApplicationError;
use crate::AppState;

const MAX_LIMIT: u32 = 200;
const DEFAULT_LIMIT: u32 = 50;

#[derive(Debug, Default, Deserialize)]
pub struct ReadingQuery {
    pub status: Option<ReadingStatus>,
    pub flat_id: Option<String>,
    pub month: Option<YearMonth>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

fn normalize_pagination(limit: Option<u32>, offset: Option<u32>) -> (usize, usize) {
    let mut limit = limit.unwrap_or(DEFAULT_LIMIT);
    if limit == 0 {
        limit = DEFAULT_LIMIT;
    }
    if limit > MAX_LIMIT {
        limit = MAX_LIMIT;
    }
    (limit as usize, offset.unwrap_or(0) as usize)
}

/// Builds the store filter for `q`, including the page. Tenants are pinned to
/// their own flat.
fn reading_filter(ctx: &AuthenticatedUser, q: &ReadingQuery) -> Result<ReadingFilter, ApplicationError> {
    let flat_id = if ctx.is_admin() {
        q.flat_id.clone()
    } else {
        let own = ctx
            .flat_id
            .clone()
            .ok_or_else(|| ApplicationError::Forbidden("No flat is linked to this account".into()))?;
        if let Some(requested) = q.flat_id.as_deref() {
            authorize(ctx, Requirement::FlatAccess { flat_id: requested })?;
        }
        Some(own)
    };
    let (limit, offset) = normalize_pagination(q.limit, q.offset);
    Ok(ReadingFilter {
        flat_id,
        status: q.status,
        month: q.month,
        ..ReadingFilter::default()
    }
    .page(limit, offset))
}

async fn load_reading(state: &AppState, reading_id: &str) -> Result<Reading, ApplicationError> {
    state
        .readings
        .get_reading(reading_id)
        .await?
        .ok_or_else(|| ApplicationError::NotFound(format!("Reading not found: {}", reading_id)))
}

// GET /api/readings
pub async fn handle_list_readings(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthenticatedUser>,
    Query(q): Query<ReadingQuery>,
) -> Result<Json<Vec<Reading>>, ApplicationError> {
    let filter = reading_filter(&ctx, &q)?;
    let readings = state.readings.list_readings(&filter).await?;
    debug!(
        user_id = %ctx.user_id,
        returned = readings.len(),
        limit = ?filter.limit,
        offset = ?filter.offset,
        "Listed readings"
    );
    Ok(Json(readings))
}

// GET /api/readings/{reading_id}
pub async fn handle_get_reading(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthenticatedUser>,
    Path(reading_id): Path<String>,
) -> Result<Json<Reading>, ApplicationError> {
    let reading = load_reading(&state, &reading_id).await?;
    authorize(&ctx, Requirement::FlatAccess { flat_id: &reading.flat_id })?;
    Ok(Json(reading))
}

// GET /api/readings/{reading_id}/receipt
pub async fn handle_get_receipt(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthenticatedUser>,
    Path(reading_id): Path<String>,
) -> Result<Json<Receipt>, ApplicationError> {
    let reading = load_reading(&state, &reading_id).await?;
    authorize(&ctx, Requirement::FlatAccess { flat_id: &reading.flat_id })?;

    let flat = state
        .flats
        .get_flat(&reading.flat_id)
        .await?
        .ok_or_else(|| ApplicationError::NotFound(format!("Flat not found: {}", reading.flat_id)))?;
    let settings = state.settings.current_settings().await?;
    let receipt = Receipt::for_reading(&reading, &flat, settings.tariff_per_unit)
        .map_err(CoreError::from)?;
    Ok(Json(receipt))
}

// GET /api/summaries/{month}
pub async fn handle_monthly_summary(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthenticatedUser>,
    Path(month): Path<String>,
) -> Result<Json<MonthlySummary>, ApplicationError> {
    authorize(&ctx, Requirement::AdminOnly)?;
    let month: YearMonth = month.parse().map_err(CoreError::from)?;

    let filter = ReadingFilter {
        month: Some(month),
        ..ReadingFilter::default()
    };
    let readings = state.readings.list_readings(&filter).await?;
    let flats = state.flats.list_flats().await?;
    let settings = state.settings.current_settings().await?;
    let summary = MonthlySummary::build(month, &readings, &flats, settings.tariff_per_unit)
        .map_err(CoreError::from)?;
    Ok(Json(summary))
}

// GET /api/flats
pub async fn handle_list_flats(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthenticatedUser>,
) -> Result<Json<Vec<Flat>>, ApplicationError> {
    let flats = state.flats.list_flats().await?;
    if ctx.is_admin() {
        return Ok(Json(flats));
    }
    let own = ctx.flat_id.as_deref();
    Ok(Json(
        flats
            .into_iter()
            .filter(|f| Some(f.id.as_str()) == own)
            .collect(),
    ))
}

// GET /api/flats/{flat_id}
pub async fn handle_get_flat(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthenticatedUser>,
    Path(flat_id): Path<String>,
) -> Result<Json<Flat>, ApplicationError> {
    authorize(&ctx, Requirement::FlatAccess { flat_id: &flat_id })?;
    let flat = state
        .flats
        .get_flat(&flat_id)
        .await?
        .ok_or_else(|| ApplicationError::NotFound(format!("Flat not found: {}", flat_id)))?;
    Ok(Json(flat))
}

// GET /api/settings
pub async fn handle_get_settings(
    State(state): State<AppState>,
    Extension(_ctx): Extension<AuthenticatedUser>,
) -> Result<Json<GlobalSettings>, ApplicationError> {
    Ok(Json(state.settings.current_settings().await?))
}

// GET /api/users
pub async fn handle_list_users(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthenticatedUser>,
) -> Result<Json<Vec<UserResponse>>, ApplicationError> {
    authorize(&ctx, Requirement::AdminOnly)?;
    let users = state.users.list_users().await?;
    Ok(Json(users.into_iter().map(UserResponse::from).collect()))
}

// GET /api/users/me
pub async fn handle_me(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthenticatedUser>,
) -> Result<Json<UserResponse>, ApplicationError> {
    let user = state
        .users
        .get_user(&ctx.user_id)
        .await?
        .ok_or_else(|| ApplicationError::NotFound(format!("User not found: {}", ctx.user_id)))?;
    Ok(Json(user.into()))
}
