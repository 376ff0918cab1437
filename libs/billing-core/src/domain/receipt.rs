//! Receipt and monthly summary documents.
//!
//! Both reprice approved readings from their frozen rates through
//! [`billing::breakdown_for`], so they always agree with the approval.

use crate::domain::{
    billing::{self, BillBreakdown},
    flat::Flat,
    reading::{Reading, ReadingError, ReadingStatus, YearMonth},
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Receipt {
    pub reading_id: String,
    pub flat_id: String,
    pub flat_number: String,
    pub tenant_name: Option<String>,
    pub month: YearMonth,
    pub previous_reading: Decimal,
    pub current_reading: Decimal,
    pub approved_at: DateTime<Utc>,
    pub settings_version: Option<u64>,
    pub breakdown: BillBreakdown,
}

impl Receipt {
    /// Receipt for an approved reading. `current_tariff` only prices legacy
    /// records that have no frozen tariff.
    pub fn for_reading(
        reading: &Reading,
        flat: &Flat,
        current_tariff: Decimal,
    ) -> Result<Self, ReadingError> {
        let breakdown = billing::breakdown_for(reading, current_tariff)?.ok_or(
            ReadingError::InvalidStateTransition {
                action: "issue a receipt for",
                from: reading.status,
            },
        )?;

        Ok(Self {
            reading_id: reading.id.clone(),
            flat_id: flat.id.clone(),
            flat_number: flat.flat_number.clone(),
            tenant_name: flat.tenant_name.clone(),
            month: reading.bucket(),
            previous_reading: reading.previous_reading.unwrap_or_default(),
            current_reading: reading.recorded_value().unwrap_or_default(),
            approved_at: reading.approval_time(),
            settings_version: reading.settings_version_at_approval,
            breakdown,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SummaryLine {
    pub reading_id: String,
    pub flat_id: String,
    pub flat_number: Option<String>,
    pub tenant_name: Option<String>,
    pub units_used: Decimal,
    pub total_quantity: Decimal,
    pub amount: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MonthlySummary {
    pub month: YearMonth,
    pub lines: Vec<SummaryLine>,
    pub total_units: Decimal,
    pub total_quantity: Decimal,
    pub total_amount: Decimal,
    pub approved_count: usize,
    pub pending_count: usize,
    pub rejected_count: usize,
}

impl MonthlySummary {
    /// Summarizes the readings that fall in `month`; others are ignored.
    pub fn build(
        month: YearMonth,
        readings: &[Reading],
        flats: &[Flat],
        current_tariff: Decimal,
    ) -> Result<Self, ReadingError> {
        let flats_by_id: HashMap<&str, &Flat> =
            flats.iter().map(|f| (f.id.as_str(), f)).collect();
        let in_month = || readings.iter().filter(move |r| r.bucket() == month);
        let count = |status: ReadingStatus| in_month().filter(|r| r.status == status).count();

        let mut lines = Vec::new();
        for r in in_month() {
            let Some(breakdown) = billing::breakdown_for(r, current_tariff)? else {
                continue;
            };
            let flat = flats_by_id.get(r.flat_id.as_str());
            lines.push(SummaryLine {
                reading_id: r.id.clone(),
                flat_id: r.flat_id.clone(),
                flat_number: flat.map(|f| f.flat_number.clone()),
                tenant_name: flat.and_then(|f| f.tenant_name.clone()),
                units_used: breakdown.units_used,
                total_quantity: breakdown.total_quantity,
                amount: breakdown.amount,
            });
        }
        lines.sort_by(|a, b| {
            a.flat_number
                .cmp(&b.flat_number)
                .then_with(|| a.flat_id.cmp(&b.flat_id))
        });

        Ok(Self {
            month,
            total_units: billing::checked_total(lines.iter().map(|l| l.units_used))?,
            total_quantity: billing::checked_total(lines.iter().map(|l| l.total_quantity))?,
            total_amount: billing::checked_total(lines.iter().map(|l| l.amount))?,
            approved_count: lines.len(),
            pending_count: count(ReadingStatus::Pending),
            rejected_count: count(ReadingStatus::Rejected),
            lines,
        })
    }
}
