//! The billing formula and the previous-reading lookup.
//!
//! Approval, receipts and summaries all price a reading through [`bill`], so
//! the formula lives in exactly one place.

use crate::domain::reading::{Reading, ReadingError, ReadingStatus};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Standing charge used when settings or a legacy record carry none.
pub const DEFAULT_MINIMUM_PRICE: Decimal = Decimal::from_parts(250, 0, 0, false, 0);
/// Raw meter units to billed quantity (2.3) when settings or a legacy record carry none.
pub const DEFAULT_UNIT_FACTOR: Decimal = Decimal::from_parts(23, 0, 0, false, 1);

/// The three inputs of the formula.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BillingRates {
    pub tariff_per_unit: Decimal,
    pub unit_factor: Decimal,
    pub minimum_price: Decimal,
}

/// Rates taken from one version of the global settings. Passed explicitly to
/// the approval calculator so the frozen values are exactly the ones used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TariffSnapshot {
    pub version: u64,
    pub rates: BillingRates,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BillBreakdown {
    pub units_used: Decimal,
    pub unit_factor: Decimal,
    pub total_quantity: Decimal,
    pub tariff_per_unit: Decimal,
    pub energy_amount: Decimal,
    pub minimum_price: Decimal,
    pub amount: Decimal,
}

fn out_of_range() -> ReadingError {
    ReadingError::InvalidInput("Meter values or rates are too large to bill".into())
}

/// Units consumed between two meter values. Never negative: a meter reset
/// or rollover bills zero units.
pub fn consumption(previous: Decimal, current: Decimal) -> Result<Decimal, ReadingError> {
    let delta = current.checked_sub(previous).ok_or_else(out_of_range)?;
    Ok(delta.max(Decimal::ZERO))
}

/// `amount = units * unit_factor * tariff + minimum_price`.
///
/// The minimum price is a standing charge added to every bill, not a floor.
/// Fails with `InvalidInput` instead of overflowing.
pub fn bill(units_used: Decimal, rates: &BillingRates) -> Result<BillBreakdown, ReadingError> {
    let total_quantity = units_used
        .checked_mul(rates.unit_factor)
        .ok_or_else(out_of_range)?;
    let energy_amount = total_quantity
        .checked_mul(rates.tariff_per_unit)
        .ok_or_else(out_of_range)?;
    let amount = energy_amount
        .checked_add(rates.minimum_price)
        .ok_or_else(out_of_range)?;
    Ok(BillBreakdown {
        units_used,
        unit_factor: rates.unit_factor,
        total_quantity,
        tariff_per_unit: rates.tariff_per_unit,
        energy_amount,
        minimum_price: rates.minimum_price,
        amount,
    })
}

/// Sum that reports overflow the same way [`bill`] does.
pub fn checked_total(values: impl IntoIterator<Item = Decimal>) -> Result<Decimal, ReadingError> {
    values
        .into_iter()
        .try_fold(Decimal::ZERO, |acc, v| acc.checked_add(v).ok_or_else(out_of_range))
}

/// Baseline for approving `target_id`: the recorded value of the flat's most
/// recently approved other reading, else the flat's initial reading, else 0.
///
/// `history` must only contain readings of the target's flat.
pub fn previous_reading<'a>(
    history: impl IntoIterator<Item = &'a Reading>,
    target_id: &str,
    initial_reading: Option<Decimal>,
) -> Decimal {
    history
        .into_iter()
        .filter(|r| r.status == ReadingStatus::Approved && r.id != target_id)
        .filter_map(|r| r.recorded_value().map(|value| (r, value)))
        .max_by(|(a, _), (b, _)| {
            a.approval_time()
                .cmp(&b.approval_time())
                .then_with(|| a.id.cmp(&b.id))
        })
        .map(|(_, value)| value)
        .or(initial_reading)
        .unwrap_or(Decimal::ZERO)
}

impl BillingRates {
    /// Rates frozen on an approved reading. Legacy records missing a frozen
    /// value fall back to the defaults, and to `current_tariff` for the tariff.
    pub fn frozen_on(reading: &Reading, current_tariff: Decimal) -> Self {
        Self {
            tariff_per_unit: reading.tariff_at_approval.unwrap_or(current_tariff),
            unit_factor: reading
                .unit_factor_at_approval
                .unwrap_or(DEFAULT_UNIT_FACTOR),
            minimum_price: reading
                .minimum_price_at_approval
                .unwrap_or(DEFAULT_MINIMUM_PRICE),
        }
    }
}

/// Breakdown of an approved reading, recomputed from its frozen inputs.
/// `None` for readings that are not approved.
pub fn breakdown_for(
    reading: &Reading,
    current_tariff: Decimal,
) -> Result<Option<BillBreakdown>, ReadingError> {
    if reading.status != ReadingStatus::Approved {
        return Ok(None);
    }
    let rates = BillingRates::frozen_on(reading, current_tariff);
    let units = reading.units_used.unwrap_or(Decimal::ZERO);
    bill(units, &rates).map(Some)
}
