use crate::{
    Command, CoreError,
    domain::billing::{BillingRates, DEFAULT_MINIMUM_PRICE, DEFAULT_UNIT_FACTOR, TariffSnapshot},
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Process-wide tariff configuration. Every update bumps `version`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalSettings {
    pub version: u64,
    pub tariff_per_unit: Decimal,
    pub minimum_price: Decimal,
    pub unit_factor: Decimal,
    pub updated_at: DateTime<Utc>,
}

impl Default for GlobalSettings {
    fn default() -> Self {
        Self {
            version: 1,
            tariff_per_unit: Decimal::ZERO,
            minimum_price: DEFAULT_MINIMUM_PRICE,
            unit_factor: DEFAULT_UNIT_FACTOR,
            updated_at: DateTime::<Utc>::default(),
        }
    }
}

/// Partial update; omitted fields keep their current value.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SettingsUpdate {
    pub tariff_per_unit: Option<Decimal>,
    pub minimum_price: Option<Decimal>,
    pub unit_factor: Option<Decimal>,
}

impl Command for SettingsUpdate {}

impl GlobalSettings {
    pub fn snapshot(&self) -> TariffSnapshot {
        TariffSnapshot {
            version: self.version,
            rates: BillingRates {
                tariff_per_unit: self.tariff_per_unit,
                unit_factor: self.unit_factor,
                minimum_price: self.minimum_price,
            },
        }
    }

    pub fn apply(&self, update: &SettingsUpdate, now: DateTime<Utc>) -> Result<Self, CoreError> {
        for (name, value) in [
            ("tariff_per_unit", update.tariff_per_unit),
            ("minimum_price", update.minimum_price),
            ("unit_factor", update.unit_factor),
        ] {
            if value.is_some_and(|v| v.is_sign_negative()) {
                return Err(CoreError::Validation(format!(
                    "{} cannot be negative",
                    name
                )));
            }
        }
        if update.tariff_per_unit.is_none()
            && update.minimum_price.is_none()
            && update.unit_factor.is_none()
        {
            return Err(CoreError::Validation("Nothing to update".into()));
        }

        Ok(Self {
            version: self.version + 1,
            tariff_per_unit: update.tariff_per_unit.unwrap_or(self.tariff_per_unit),
            minimum_price: update.minimum_price.unwrap_or(self.minimum_price),
            unit_factor: update.unit_factor.unwrap_or(self.unit_factor),
            updated_at: now,
        })
    }
}
