// ── Availability engine ──
//
// Answers "which vehicles of this class are free for [start, end)?" from
// store snapshots. Pure reads: identical inputs against an unchanged
// store give identical answers.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::error::CoreError;
use crate::model::{EntityId, Reservation, Vehicle, VehicleClass, VehicleStatus};
use crate::store::LiveStore;

/// One blocking reservation that collides with a requested window.
#[derive(Debug, Clone, PartialEq)]
pub struct ConflictInfo {
    pub vehicle_id: EntityId,
    pub reservation_id: EntityId,
    pub start_at: DateTime<Utc>,
    pub end_at: DateTime<Utc>,
    /// Soonest instant the vehicle could be free again: the latest end
    /// among its blocking reservations that overlap the window.
    pub next_free: Option<DateTime<Utc>>,
}

/// Result of an availability check. An empty `available` list is a
/// normal answer, not an error.
#[derive(Debug, Clone, Default)]
pub struct Availability {
    pub available: Vec<Arc<Vehicle>>,
    pub conflicts: Vec<ConflictInfo>,
}

/// Conflict detection over the live store.
pub struct AvailabilityEngine {
    store: Arc<LiveStore>,
}

impl AvailabilityEngine {
    pub fn new(store: Arc<LiveStore>) -> Self {
        Self { store }
    }

    /// Find vehicles of `class` free for the half-open window
    /// `[start, end)`.
    ///
    /// Candidates are vehicles of the class with status Available.
    /// A candidate is excluded when any reservation in a blocking status
    /// (scheduled, active, confirmed) overlaps the window; touching
    /// endpoints do not overlap. `exclude` drops one reservation id from
    /// the blocking set so an edit does not conflict with itself.
    pub fn check_range(
        &self,
        class: VehicleClass,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        exclude: Option<&EntityId>,
    ) -> Result<Availability, CoreError> {
        if start >= end {
            return Err(CoreError::validation(format!(
                "start must be before end (got {start} >= {end})"
            )));
        }

        let vehicles = self.store.vehicles_snapshot();
        let reservations = self.store.reservations_snapshot();

        // Blocking overlaps per vehicle, for conflict reporting and the
        // next_free derivation.
        let mut overlaps: HashMap<EntityId, Vec<&Reservation>> = HashMap::new();
        for res in reservations.iter() {
            if exclude.is_some_and(|id| *id == res.id) {
                continue;
            }
            if res.blocks(start, end) {
                overlaps
                    .entry(res.vehicle_id.clone())
                    .or_default()
                    .push(res);
            }
        }
        let blocked: HashSet<&EntityId> = overlaps.keys().collect();

        let mut available: Vec<Arc<Vehicle>> = vehicles
            .iter()
            .filter(|v| {
                v.class == class && v.status == VehicleStatus::Available && !blocked.contains(&v.id)
            })
            .cloned()
            .collect();
        available.sort_by(|a, b| a.name.cmp(&b.name));

        let mut conflicts: Vec<ConflictInfo> = Vec::new();
        for (vehicle_id, blocking) in &overlaps {
            // Only report conflicts for vehicles of the requested class.
            let in_class = vehicles
                .iter()
                .any(|v| v.id == *vehicle_id && v.class == class);
            if !in_class {
                continue;
            }
            let next_free = blocking.iter().map(|r| r.end_at).max();
            for res in blocking {
                conflicts.push(ConflictInfo {
                    vehicle_id: vehicle_id.clone(),
                    reservation_id: res.id.clone(),
                    start_at: res.start_at,
                    end_at: res.end_at,
                    next_free,
                });
            }
        }
        conflicts.sort_by(|a, b| {
            (&a.vehicle_id, a.start_at, &a.reservation_id).cmp(&(
                &b.vehicle_id,
                b.start_at,
                &b.reservation_id,
            ))
        });

        Ok(Availability {
            available,
            conflicts,
        })
    }
}
