use crate::{
    Command,
    domain::billing::{self, TariffSnapshot},
};
use chrono::{DateTime, Datelike, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};
use uuid::Uuid;

// --- Year-month bucket ---

/// Calendar month a reading is attributed to, written as `YYYY-MM`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct YearMonth {
    year: i32,
    month: u32,
}

impl YearMonth {
    pub fn new(year: i32, month: u32) -> Result<Self, ReadingError> {
        if !(1..=12).contains(&month) {
            return Err(ReadingError::InvalidInput(format!(
                "Month must be between 1 and 12, got {}",
                month
            )));
        }
        if !(1..=9999).contains(&year) {
            return Err(ReadingError::InvalidInput(format!(
                "Year out of range: {}",
                year
            )));
        }
        Ok(Self { year, month })
    }

    /// Bucket containing the given instant (UTC).
    pub fn of(at: &DateTime<Utc>) -> Self {
        Self {
            year: at.year(),
            month: at.month(),
        }
    }

    pub fn year(&self) -> i32 {
        self.year
    }

    pub fn month(&self) -> u32 {
        self.month
    }
}

impl fmt::Display for YearMonth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

impl FromStr for YearMonth {
    type Err = ReadingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ReadingError::InvalidInput(format!("Invalid year-month '{}'", s));
        let (year, month) = s.trim().split_once('-').ok_or_else(invalid)?;
        if year.len() != 4 || month.len() != 2 {
            return Err(invalid());
        }
        let year = year.parse::<i32>().map_err(|_| invalid())?;
        let month = month.parse::<u32>().map_err(|_| invalid())?;
        Self::new(year, month)
    }
}

impl TryFrom<String> for YearMonth {
    type Error = ReadingError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<YearMonth> for String {
    fn from(value: YearMonth) -> Self {
        value.to_string()
    }
}

// --- Status ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReadingStatus {
    Pending,
    Approved,
    Rejected,
}

impl ReadingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReadingStatus::Pending => "pending",
            ReadingStatus::Approved => "approved",
            ReadingStatus::Rejected => "rejected",
        }
    }
}

impl fmt::Display for ReadingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReadingStatus {
    type Err = ReadingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ReadingStatus::Pending),
            "approved" => Ok(ReadingStatus::Approved),
            "rejected" => Ok(ReadingStatus::Rejected),
            other => Err(ReadingError::InvalidInput(format!(
                "Unknown reading status '{}'",
                other
            ))),
        }
    }
}

// --- Reading ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub id: String,
    pub flat_id: String,
    pub image_ref: String,
    /// Value the tenant read off the meter.
    #[serde(default)]
    pub tenant_reading: Option<Decimal>,
    /// Value captured by the old OCR flow; only present on legacy records.
    #[serde(default)]
    pub ocr_reading: Option<Decimal>,
    #[serde(default)]
    pub corrected_reading: Option<Decimal>,
    #[serde(default)]
    pub previous_reading: Option<Decimal>,
    #[serde(default)]
    pub units_used: Option<Decimal>,
    #[serde(default)]
    pub amount: Option<Decimal>,
    pub status: ReadingStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub approved_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub month: Option<YearMonth>,
    #[serde(default)]
    pub tariff_at_approval: Option<Decimal>,
    #[serde(default)]
    pub unit_factor_at_approval: Option<Decimal>,
    #[serde(default)]
    pub minimum_price_at_approval: Option<Decimal>,
    #[serde(default)]
    pub settings_version_at_approval: Option<u64>,
    #[serde(default)]
    pub rejection_reason: Option<String>,
    #[serde(default)]
    pub reopen_reason: Option<String>,
}

// --- Commands ---

#[derive(Debug, Clone, Deserialize)]
pub struct SubmitReading {
    pub flat_id: String,
    pub image_ref: String,
    pub tenant_reading: Decimal,
}

#[derive(Debug, Clone)]
pub struct ApproveReading {
    pub reading_id: String,
    pub corrected_reading: Decimal,
}

#[derive(Debug, Clone)]
pub struct RejectReading {
    pub reading_id: String,
    pub reason: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ReopenReading {
    pub reading_id: String,
    pub reason: String,
}

impl Command for SubmitReading {}
impl Command for ApproveReading {}
impl Command for RejectReading {}
impl Command for ReopenReading {}

// --- Errors ---

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum ReadingError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    #[error("Cannot {action} a reading that is {from}")]
    InvalidStateTransition {
        action: &'static str,
        from: ReadingStatus,
    },
    #[error(
        "A reading for {month} was already submitted on {} and is {status}",
        .submitted_at.format("%Y-%m-%d")
    )]
    MonthlyLimit {
        month: YearMonth,
        submitted_at: DateTime<Utc>,
        status: ReadingStatus,
    },
}

// --- Query filter ---

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ReadingFilter {
    pub flat_id: Option<String>,
    pub status: Option<ReadingStatus>,
    pub month: Option<YearMonth>,
    /// Page size applied by the store after sorting newest first. `None` is unbounded.
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

impl ReadingFilter {
    pub fn for_flat(flat_id: impl Into<String>) -> Self {
        Self {
            flat_id: Some(flat_id.into()),
            ..Self::default()
        }
    }

    pub fn page(self, limit: usize, offset: usize) -> Self {
        Self {
            limit: Some(limit),
            offset: Some(offset),
            ..self
        }
    }

    /// Matches on the predicates only; `limit` and `offset` are applied by the store.
    pub fn matches(&self, reading: &Reading) -> bool {
        self.flat_id
            .as_deref()
            .is_none_or(|flat_id| reading.flat_id == flat_id)
            && self.status.is_none_or(|status| reading.status == status)
            && self.month.is_none_or(|month| reading.bucket() == month)
    }
}

// --- Behaviour ---

impl Reading {
    /// Builds a new pending reading for the month containing `now`.
    pub fn submit(command: SubmitReading, now: DateTime<Utc>) -> Result<Self, ReadingError> {
        if command.flat_id.trim().is_empty() {
            return Err(ReadingError::InvalidInput("Flat ID cannot be empty".into()));
        }
        if command.image_ref.trim().is_empty() {
            return Err(ReadingError::InvalidInput(
                "A meter photo is required".into(),
            ));
        }
        if command.tenant_reading.is_sign_negative() {
            return Err(ReadingError::InvalidInput(
                "Meter reading cannot be negative".into(),
            ));
        }

        Ok(Self {
            id: Uuid::new_v4().to_string(),
            flat_id: command.flat_id,
            image_ref: command.image_ref,
            tenant_reading: Some(command.tenant_reading),
            ocr_reading: None,
            corrected_reading: None,
            previous_reading: None,
            units_used: None,
            amount: None,
            status: ReadingStatus::Pending,
            created_at: now,
            approved_at: None,
            month: Some(YearMonth::of(&now)),
            tariff_at_approval: None,
            unit_factor_at_approval: None,
            minimum_price_at_approval: None,
            settings_version_at_approval: None,
            rejection_reason: None,
            reopen_reason: None,
        })
    }

    /// Stored bucket, or the month of `created_at` for records that predate it.
    pub fn bucket(&self) -> YearMonth {
        self.month.unwrap_or_else(|| YearMonth::of(&self.created_at))
    }

    /// Ordering key used to find the latest approval.
    pub fn approval_time(&self) -> DateTime<Utc> {
        self.approved_at.unwrap_or(self.created_at)
    }

    /// Admin-confirmed meter value, falling back to the legacy OCR value.
    pub fn recorded_value(&self) -> Option<Decimal> {
        self.corrected_reading.or(self.ocr_reading)
    }

    pub fn approve(
        &self,
        corrected_reading: Decimal,
        previous_reading: Decimal,
        rates: &TariffSnapshot,
        now: DateTime<Utc>,
    ) -> Result<Self, ReadingError> {
        if self.status != ReadingStatus::Pending {
            return Err(ReadingError::InvalidStateTransition {
                action: "approve",
                from: self.status,
            });
        }
        if corrected_reading.is_sign_negative() {
            return Err(ReadingError::InvalidInput(
                "Corrected reading cannot be negative".into(),
            ));
        }

        let units_used = billing::consumption(previous_reading, corrected_reading)?;
        let breakdown = billing::bill(units_used, &rates.rates)?;

        Ok(Self {
            corrected_reading: Some(corrected_reading),
            previous_reading: Some(previous_reading),
            units_used: Some(breakdown.units_used),
            amount: Some(breakdown.amount),
            status: ReadingStatus::Approved,
            approved_at: Some(now),
            tariff_at_approval: Some(rates.rates.tariff_per_unit),
            unit_factor_at_approval: Some(rates.rates.unit_factor),
            minimum_price_at_approval: Some(rates.rates.minimum_price),
            settings_version_at_approval: Some(rates.version),
            ..self.clone()
        })
    }

    pub fn reject(&self, reason: Option<String>) -> Result<Self, ReadingError> {
        if self.status != ReadingStatus::Pending {
            return Err(ReadingError::InvalidStateTransition {
                action: "reject",
                from: self.status,
            });
        }
        let reason = reason
            .map(|r| r.trim().to_string())
            .filter(|r| !r.is_empty());

        Ok(Self {
            status: ReadingStatus::Rejected,
            rejection_reason: reason,
            ..self.clone()
        })
    }

    /// Sends an approved reading back to the queue. Submission data is kept;
    /// everything computed or frozen at approval is cleared.
    pub fn reopen(&self, reason: String) -> Result<Self, ReadingError> {
        if self.status != ReadingStatus::Approved {
            return Err(ReadingError::InvalidStateTransition {
                action: "reopen",
                from: self.status,
            });
        }
        let reason = reason.trim();
        if reason.is_empty() {
            return Err(ReadingError::InvalidInput(
                "A reason is required to reopen a reading".into(),
            ));
        }

        Ok(Self {
            corrected_reading: None,
            previous_reading: None,
            units_used: None,
            amount: None,
            status: ReadingStatus::Pending,
            approved_at: None,
            tariff_at_approval: None,
            unit_factor_at_approval: None,
            minimum_price_at_approval: None,
            settings_version_at_approval: None,
            rejection_reason: None,
            reopen_reason: Some(reason.to_string()),
            ..self.clone()
        })
    }
}

/// Fails if `existing` already holds a non-rejected reading for `flat_id` in `month`.
pub fn ensure_month_open(
    existing: &[Reading],
    flat_id: &str,
    month: YearMonth,
) -> Result<(), ReadingError> {
    let conflict = existing
        .iter()
        .filter(|r| r.flat_id == flat_id)
        .filter(|r| r.status != ReadingStatus::Rejected)
        .filter(|r| r.bucket() == month)
        .min_by_key(|r| r.created_at);

    match conflict {
        Some(r) => Err(ReadingError::MonthlyLimit {
            month,
            submitted_at: r.created_at,
            status: r.status,
        }),
        None => Ok(()),
    }
}

/// Newest first, the order every listing uses.
pub fn sort_newest_first(readings: &mut [Reading]) {
    readings.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
}
