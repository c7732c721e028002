// ── Vehicle (rentable resource) ──
//
// Read-only to this core: fleet and maintenance operations mutate
// vehicles externally; we only consume their change events.

use serde::{Deserialize, Serialize};

use super::entity_id::EntityId;

/// Rate class of a rentable unit.
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
pub enum VehicleClass {
    Standard,
    Performance,
    Utility,
    Youth,
}

/// Operational status, owned by fleet/maintenance operations.
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
pub enum VehicleStatus {
    Available,
    Reserved,
    Maintenance,
    OutOfService,
}

/// A rentable unit that can be reserved for a time window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vehicle {
    pub id: EntityId,
    pub name: String,
    pub class: VehicleClass,
    pub status: VehicleStatus,
    #[serde(default)]
    pub location: Option<String>,
}

impl Vehicle {
    /// Whether this vehicle is a candidate for new reservations.
    pub fn is_rentable(&self) -> bool {
        self.status == VehicleStatus::Available
    }
}
