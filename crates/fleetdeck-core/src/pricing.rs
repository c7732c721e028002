// ── Pricing engine ──
//
// Quantity derivation, price breakdowns, and payment-status rules.
// Pure functions over the configured fee and rate tables; money is f64
// with a 0.01 comparison epsilon, matching what the hosted database
// stores.

use chrono::{DateTime, Duration, Utc};

use crate::config::{FeeTable, TransportFlags};
use crate::error::CoreError;
use crate::model::{PaymentStatus, ReservationStatus, UnitType};

/// Comparison tolerance for currency amounts.
pub const MONEY_EPSILON: f64 = 0.01;

/// Itemized price for one vehicle over one window.
#[derive(Debug, Clone, PartialEq)]
pub struct PriceBreakdown {
    pub quantity: u32,
    pub subtotal: f64,
    pub fees: f64,
    pub total: f64,
    pub deposit_suggested: f64,
    pub balance: f64,
}

/// Billable unit count for a window.
///
/// Hourly quantities use the overnight convention: a rental billed by the
/// hour whose end lands before its start rolls the end forward one
/// day (a 22:00 pickup returned "at 02:00" means 02:00 tomorrow). The
/// roll is keyed on instant ordering, not clock faces: a multi-day hourly
/// rental whose end clock-time happens to precede the start clock-time
/// (22:00 out, back 02:00 two days later) is intentionally left as-is.
/// Daily and weekly quantities round partial units up, minimum 1.
pub fn quantity_for(
    unit_type: UnitType,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Result<u32, CoreError> {
    let end = match unit_type {
        UnitType::Hourly if end < start => end + Duration::days(1),
        _ => end,
    };
    if end <= start {
        return Err(CoreError::validation(format!(
            "end must be after start (got {start} .. {end})"
        )));
    }

    let minutes = (end - start).num_minutes().unsigned_abs();
    let quantity = match unit_type {
        UnitType::Hourly => minutes.div_ceil(60),
        UnitType::Daily => minutes.div_ceil(60 * 24),
        UnitType::Weekly => minutes.div_ceil(60 * 24 * 7),
    };
    Ok(u32::try_from(quantity.max(1)).unwrap_or(u32::MAX))
}

/// Price a window at the given per-unit rate.
///
/// `fees = pickup + dropoff (when flagged) + extra_passenger_fee × units`,
/// `total = quantity × rate + fees`, deposit suggestion is a configured
/// percentage of the total, and `balance` is what remains after it.
pub fn compute_price(
    unit_type: UnitType,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    rate_per_unit: f64,
    transport: TransportFlags,
    extra_passenger_units: u32,
    fee_table: &FeeTable,
) -> Result<PriceBreakdown, CoreError> {
    if rate_per_unit < 0.0 {
        return Err(CoreError::validation("rate must be non-negative"));
    }

    let quantity = quantity_for(unit_type, start, end)?;
    let subtotal = f64::from(quantity) * rate_per_unit;

    let mut fees = f64::from(extra_passenger_units) * fee_table.extra_passenger_fee;
    if transport.pickup {
        fees += fee_table.pickup_fee;
    }
    if transport.dropoff {
        fees += fee_table.dropoff_fee;
    }

    let total = subtotal + fees;
    let deposit_suggested = total * fee_table.deposit_percentage / 100.0;

    Ok(PriceBreakdown {
        quantity,
        subtotal,
        fees,
        total,
        deposit_suggested,
        balance: total - deposit_suggested,
    })
}

/// Derive the payment status from amounts and reservation status.
///
/// Completed reservations are forced to Paid regardless of the recorded
/// deposit; the books treat a closed-out rental as settled. Overdue is
/// never derived here, only applied by external payment operations.
pub fn derive_payment_status(
    deposit: f64,
    total: f64,
    status: ReservationStatus,
) -> PaymentStatus {
    if status == ReservationStatus::Completed {
        return PaymentStatus::Paid;
    }
    if deposit.abs() < MONEY_EPSILON {
        PaymentStatus::Unpaid
    } else if (deposit - total).abs() < MONEY_EPSILON || deposit >= total {
        PaymentStatus::Paid
    } else {
        PaymentStatus::Partial
    }
}

/// Amount still owed. Zero for Completed reservations and never negative.
pub fn outstanding_balance(deposit: f64, total: f64, status: ReservationStatus) -> f64 {
    if status == ReservationStatus::Completed {
        return 0.0;
    }
    (total - deposit).max(0.0)
}
