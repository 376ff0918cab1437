use crate::domain::reading::{Reading, ReadingStatus, YearMonth};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Topic carrying every reading change.
pub const READINGS_TOPIC: &str = "readings";
pub const SETTINGS_TOPIC: &str = "settings";

/// Topic carrying the reading changes of one flat.
pub fn flat_topic(flat_id: &str) -> String {
    format!("readings.flat.{}", flat_id)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BillingEvent {
    ReadingSubmitted {
        reading_id: String,
        flat_id: String,
        month: YearMonth,
    },
    ReadingApproved {
        reading_id: String,
        flat_id: String,
        amount: Decimal,
    },
    ReadingRejected {
        reading_id: String,
        flat_id: String,
    },
    ReadingReopened {
        reading_id: String,
        flat_id: String,
    },
    SettingsUpdated {
        version: u64,
    },
}

impl BillingEvent {
    /// Event describing the state `reading` has just entered.
    pub fn for_reading(reading: &Reading) -> Self {
        let reading_id = reading.id.clone();
        let flat_id = reading.flat_id.clone();
        match reading.status {
            ReadingStatus::Pending if reading.reopen_reason.is_some() => {
                BillingEvent::ReadingReopened {
                    reading_id,
                    flat_id,
                }
            }
            ReadingStatus::Pending => BillingEvent::ReadingSubmitted {
                reading_id,
                flat_id,
                month: reading.bucket(),
            },
            ReadingStatus::Approved => BillingEvent::ReadingApproved {
                reading_id,
                flat_id,
                amount: reading.amount.unwrap_or_default(),
            },
            ReadingStatus::Rejected => BillingEvent::ReadingRejected {
                reading_id,
                flat_id,
            },
        }
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            BillingEvent::ReadingSubmitted { .. } => "ReadingSubmitted",
            BillingEvent::ReadingApproved { .. } => "ReadingApproved",
            BillingEvent::ReadingRejected { .. } => "ReadingRejected",
            BillingEvent::ReadingReopened { .. } => "ReadingReopened",
            BillingEvent::SettingsUpdated { .. } => "SettingsUpdated",
        }
    }

    /// Every topic this event is published on.
    pub fn topics(&self) -> Vec<String> {
        match self {
            BillingEvent::ReadingSubmitted { flat_id, .. }
            | BillingEvent::ReadingApproved { flat_id, .. }
            | BillingEvent::ReadingRejected { flat_id, .. }
            | BillingEvent::ReadingReopened { flat_id, .. } => {
                vec![READINGS_TOPIC.to_string(), flat_topic(flat_id)]
            }
            BillingEvent::SettingsUpdated { .. } => vec![SETTINGS_TOPIC.to_string()],
        }
    }
}
