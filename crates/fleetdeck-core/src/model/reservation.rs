// ── Reservation ──

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::entity_id::EntityId;

/// Lifecycle status of a reservation.
///
/// Scheduled, Active and Confirmed block the vehicle's calendar;
/// Completed and Cancelled do not.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ReservationStatus {
    Scheduled,
    Active,
    Confirmed,
    Completed,
    Cancelled,
}

impl ReservationStatus {
    /// Whether reservations in this status occupy the vehicle's calendar.
    pub fn is_blocking(self) -> bool {
        matches!(self, Self::Scheduled | Self::Active | Self::Confirmed)
    }
}

/// Billing granularity of a rental.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum UnitType {
    Hourly,
    Daily,
    Weekly,
}

/// Payment state. Derived from (deposit, total, status) by the pricing
/// engine -- never set ad hoc. Overdue is applied by external payment
/// operations only.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum PaymentStatus {
    Unpaid,
    Partial,
    Paid,
    Overdue,
}

/// Identity and contact details for a rider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiderRecord {
    pub name: String,
    pub contact: String,
}

impl RiderRecord {
    pub fn new(name: impl Into<String>, contact: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            contact: contact.into(),
        }
    }

    pub fn is_complete(&self) -> bool {
        !self.name.trim().is_empty() && !self.contact.trim().is_empty()
    }
}

/// A booked `[start, end)` interval against one vehicle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: EntityId,
    pub vehicle_id: EntityId,
    pub start_at: DateTime<Utc>,
    pub end_at: DateTime<Utc>,
    pub status: ReservationStatus,
    pub customer_ref: String,
    pub unit_type: UnitType,
    pub quantity: u32,
    pub unit_price: f64,
    pub fees: f64,
    pub total_amount: f64,
    pub deposit_amount: f64,
    pub payment_status: PaymentStatus,
    #[serde(default)]
    pub lead_rider: Option<RiderRecord>,
    #[serde(default)]
    pub passenger: Option<RiderRecord>,
}

impl Reservation {
    /// Half-open interval overlap: `[s1,e1)` and `[s2,e2)` conflict iff
    /// `s1 < e2 && s2 < e1`. Touching endpoints do not conflict.
    pub fn overlaps(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
        self.start_at < end && start < self.end_at
    }

    /// Whether this reservation blocks the given window.
    pub fn blocks(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
        self.status.is_blocking() && self.overlaps(start, end)
    }
}
