use crate::{Command, CoreError};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Flat {
    pub id: String,
    /// Display identifier, e.g. "A-101".
    pub flat_number: String,
    #[serde(default)]
    pub tenant_name: Option<String>,
    /// Stored per flat; approval prices with the global tariff.
    #[serde(default)]
    pub tariff_override: Option<Decimal>,
    /// Linked tenant account.
    #[serde(default)]
    pub user_id: Option<String>,
    /// Baseline for the first approval when no approved reading exists.
    #[serde(default)]
    pub initial_reading: Option<Decimal>,
    pub created_at: DateTime<Utc>,
}

/// Editable fields of a flat, used both to create and to replace them.
#[derive(Debug, Clone, Deserialize)]
pub struct FlatDetails {
    pub flat_number: String,
    #[serde(default)]
    pub tenant_name: Option<String>,
    #[serde(default)]
    pub tariff_override: Option<Decimal>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub initial_reading: Option<Decimal>,
}

impl Command for FlatDetails {}

impl FlatDetails {
    fn validate(mut self) -> Result<Self, CoreError> {
        self.flat_number = self.flat_number.trim().to_string();
        if self.flat_number.is_empty() {
            return Err(CoreError::Validation("Flat number cannot be empty".into()));
        }
        if self.tariff_override.is_some_and(|t| t.is_sign_negative()) {
            return Err(CoreError::Validation(
                "Tariff override cannot be negative".into(),
            ));
        }
        if self.initial_reading.is_some_and(|r| r.is_sign_negative()) {
            return Err(CoreError::Validation(
                "Initial reading cannot be negative".into(),
            ));
        }
        self.tenant_name = self
            .tenant_name
            .map(|n| n.trim().to_string())
            .filter(|n| !n.is_empty());
        Ok(self)
    }
}

impl Flat {
    pub fn create(details: FlatDetails, now: DateTime<Utc>) -> Result<Self, CoreError> {
        let details = details.validate()?;
        Ok(Self {
            id: Uuid::new_v4().to_string(),
            flat_number: details.flat_number,
            tenant_name: details.tenant_name,
            tariff_override: details.tariff_override,
            user_id: details.user_id,
            initial_reading: details.initial_reading,
            created_at: now,
        })
    }

    pub fn with_details(&self, details: FlatDetails) -> Result<Self, CoreError> {
        let details = details.validate()?;
        Ok(Self {
            flat_number: details.flat_number,
            tenant_name: details.tenant_name,
            tariff_override: details.tariff_override,
            user_id: details.user_id,
            initial_reading: details.initial_reading,
            ..self.clone()
        })
    }
}
