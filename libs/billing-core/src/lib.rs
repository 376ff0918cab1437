use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::{error::Error as StdError, fmt::Debug, future::Future};
use tokio::sync::broadcast;

pub mod adapters;
pub mod domain;
pub mod transfer;

use domain::{
    billing::TariffSnapshot,
    events::BillingEvent,
    flat::Flat,
    reading::{Reading, ReadingFilter},
    settings::{GlobalSettings, SettingsUpdate},
    user::User,
};

// Port-level error shared by every adapter and command handler.
#[derive(thiserror::Error, Debug)]
pub enum CoreError {
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Validation failed: {0}")]
    Validation(String),
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("Already exists: {0}")]
    AlreadyExists(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Infrastructure error: {0}")]
    Infrastructure(#[from] Box<dyn StdError + Send + Sync>),
    #[error("Configuration error: {0}")]
    Configuration(String),
    #[error("Unauthorized: {0}")]
    Unauthorized(String),
    #[error("Forbidden: {0}")]
    Forbidden(String),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => CoreError::NotFound("row not found".into()),
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                CoreError::AlreadyExists(db.message().to_string())
            }
            other => CoreError::Infrastructure(Box::new(other)),
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::Serialization(err.to_string())
    }
}

// Allows '?' to turn domain errors into CoreError inside adapters and handlers.
impl From<domain::reading::ReadingError> for CoreError {
    fn from(err: domain::reading::ReadingError) -> Self {
        use domain::reading::ReadingError;
        match err {
            ReadingError::InvalidInput(msg) => CoreError::Validation(msg),
            e @ ReadingError::InvalidStateTransition { .. } => CoreError::Conflict(e.to_string()),
            e @ ReadingError::MonthlyLimit { .. } => CoreError::Conflict(e.to_string()),
        }
    }
}

impl From<domain::user::UserError> for CoreError {
    fn from(err: domain::user::UserError) -> Self {
        use domain::user::UserError;
        match err {
            UserError::Core(ce) => ce,
            UserError::AlreadyExists(name) => {
                CoreError::AlreadyExists(format!("User already exists: {}", name))
            }
            UserError::InvalidInput(msg) | UserError::InvalidRole(msg) => {
                CoreError::Validation(msg)
            }
            UserError::InvalidPassword => CoreError::Unauthorized("Invalid credentials".into()),
        }
    }
}

// Marker trait for commands
pub trait Command: Send + Sync + 'static {}

// Port for handling commands
pub trait CommandHandler<C: Command>: Send + Sync {
    type Output: Send;

    fn handle(&self, command: C) -> impl Future<Output = Result<Self::Output, CoreError>> + Send;
}

// Port for user accounts
#[async_trait]
pub trait UserRepository: Send + Sync {
    async fn create_user(&self, user: User) -> Result<User, CoreError>;
    async fn get_user(&self, user_id: &str) -> Result<Option<User>, CoreError>;
    async fn find_by_username(&self, username: &str) -> Result<Option<User>, CoreError>;
    async fn list_users(&self) -> Result<Vec<User>, CoreError>;
    async fn count_users(&self) -> Result<u64, CoreError>;
    async fn set_password_hash(&self, user_id: &str, password_hash: &str)
        -> Result<(), CoreError>;
    /// Points a tenant account at its flat, or unlinks it with `None`. The
    /// flat side of the link lives in `Flat::user_id`; callers keep both in step.
    async fn set_flat(&self, user_id: &str, flat_id: Option<&str>) -> Result<(), CoreError>;
    /// Insert or overwrite a user record as-is (used by import).
    async fn put_user(&self, user: User) -> Result<(), CoreError>;
}

// Port for flats
#[async_trait]
pub trait FlatRepository: Send + Sync {
    async fn create_flat(&self, flat: Flat) -> Result<Flat, CoreError>;
    async fn update_flat(&self, flat: Flat) -> Result<Flat, CoreError>;
    async fn get_flat(&self, flat_id: &str) -> Result<Option<Flat>, CoreError>;
    async fn list_flats(&self) -> Result<Vec<Flat>, CoreError>;
    async fn put_flat(&self, flat: Flat) -> Result<(), CoreError>;
}

/// Port for meter readings.
///
/// `submit_reading` and `approve_reading` must run their read-then-write
/// sequence atomically per flat: concurrent calls for the same flat are
/// serialized so the monthly gate and the previous-reading lookup always see
/// the other call's result.
#[async_trait]
pub trait ReadingRepository: Send + Sync {
    /// Enforces the one-reading-per-flat-per-month rule and inserts `reading`.
    async fn submit_reading(&self, reading: Reading) -> Result<Reading, CoreError>;
    async fn get_reading(&self, reading_id: &str) -> Result<Option<Reading>, CoreError>;
    /// Newest first.
    async fn list_readings(&self, filter: &ReadingFilter) -> Result<Vec<Reading>, CoreError>;
    async fn approve_reading(
        &self,
        reading_id: &str,
        corrected_reading: Decimal,
        rates: &TariffSnapshot,
        now: DateTime<Utc>,
    ) -> Result<Reading, CoreError>;
    async fn reject_reading(
        &self,
        reading_id: &str,
        reason: Option<String>,
    ) -> Result<Reading, CoreError>;
    async fn reopen_reading(&self, reading_id: &str, reason: String)
        -> Result<Reading, CoreError>;
    /// Insert or overwrite a reading as-is, bypassing the monthly gate (used by import).
    async fn put_reading(&self, reading: Reading) -> Result<(), CoreError>;
}

// Port for the versioned global tariff settings
#[async_trait]
pub trait SettingsStore: Send + Sync {
    async fn current_settings(&self) -> Result<GlobalSettings, CoreError>;
    async fn update_settings(
        &self,
        update: SettingsUpdate,
        now: DateTime<Utc>,
    ) -> Result<GlobalSettings, CoreError>;
    async fn put_settings(&self, settings: GlobalSettings) -> Result<(), CoreError>;
}

/// Everything a single backing database provides.
pub trait BillingStore: UserRepository + FlatRepository + ReadingRepository + SettingsStore {}

impl<T> BillingStore for T where T: UserRepository + FlatRepository + ReadingRepository + SettingsStore
{}

// Port for publishing change notifications
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, topic: &str, event: &BillingEvent) -> Result<(), CoreError>;
}

// Port for subscribing to change notifications on a topic
pub trait EventSubscriber: Send + Sync {
    fn subscribe(&self, topic: &str) -> broadcast::Receiver<BillingEvent>;
}

// Port for caching data (sessions)
#[async_trait]
pub trait Cache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CoreError>;
    async fn set(&self, key: &str, value: &[u8], ttl_seconds: Option<u64>)
        -> Result<(), CoreError>;
    async fn delete(&self, key: &str) -> Result<(), CoreError>;
}
