// ── Live entity store ──
//
// Holds the dashboard's synchronized view of vehicles and reservations,
// kept warm by the update batcher. Reads are snapshot-based; mutations
// are broadcast to subscribers via `watch` channels.

mod collection;
mod stream;

pub use stream::{EntityStream, SnapshotStream};

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::watch;

use collection::EntityCollection;

use crate::convert::{EntityChange, StoreChange};
use crate::model::{EntityId, Reservation, Vehicle};

/// Central reactive store for the synchronized collections.
///
/// Constructed explicitly and injected into consumers; no global state.
pub struct LiveStore {
    vehicles: EntityCollection<Vehicle>,
    reservations: EntityCollection<Reservation>,
    last_synced: watch::Sender<Option<DateTime<Utc>>>,
}

impl LiveStore {
    pub fn new() -> Self {
        let (last_synced, _) = watch::channel(None);
        Self {
            vehicles: EntityCollection::new(),
            reservations: EntityCollection::new(),
            last_synced,
        }
    }

    // ── Snapshot accessors ───────────────────────────────────────────

    pub fn vehicles_snapshot(&self) -> Arc<Vec<Arc<Vehicle>>> {
        self.vehicles.snapshot()
    }

    pub fn reservations_snapshot(&self) -> Arc<Vec<Arc<Reservation>>> {
        self.reservations.snapshot()
    }

    pub fn vehicle(&self, id: &EntityId) -> Option<Arc<Vehicle>> {
        self.vehicles.get(id)
    }

    pub fn reservation(&self, id: &EntityId) -> Option<Arc<Reservation>> {
        self.reservations.get(id)
    }

    pub fn vehicle_count(&self) -> usize {
        self.vehicles.len()
    }

    pub fn reservation_count(&self) -> usize {
        self.reservations.len()
    }

    // ── Subscriptions ────────────────────────────────────────────────

    pub fn subscribe_vehicles(&self) -> watch::Receiver<Arc<Vec<Arc<Vehicle>>>> {
        self.vehicles.subscribe()
    }

    pub fn subscribe_reservations(&self) -> watch::Receiver<Arc<Vec<Arc<Reservation>>>> {
        self.reservations.subscribe()
    }

    /// Reactive view over the vehicle collection.
    pub fn vehicle_stream(&self) -> EntityStream<Vehicle> {
        EntityStream::new(self.vehicles.subscribe())
    }

    /// Reactive view over the reservation collection.
    pub fn reservation_stream(&self) -> EntityStream<Reservation> {
        EntityStream::new(self.reservations.subscribe())
    }

    // ── Mutation ─────────────────────────────────────────────────────

    /// Apply one decoded change from the live feed.
    pub fn apply(&self, change: StoreChange) {
        match change {
            StoreChange::Vehicle(change) => apply_to(&self.vehicles, change, |v| v.id.clone()),
            StoreChange::Reservation(change) => {
                apply_to(&self.reservations, change, |r| r.id.clone());
            }
        }
        let _ = self.last_synced.send(Some(Utc::now()));
    }

    /// Replace both collections from a full snapshot (manual refresh).
    pub fn apply_snapshot(&self, vehicles: Vec<Vehicle>, reservations: Vec<Reservation>) {
        self.vehicles
            .replace_all(vehicles.into_iter().map(|v| (v.id.clone(), v)));
        self.reservations
            .replace_all(reservations.into_iter().map(|r| (r.id.clone(), r)));
        let _ = self.last_synced.send(Some(Utc::now()));
    }

    // ── Metadata ─────────────────────────────────────────────────────

    pub fn last_synced(&self) -> Option<DateTime<Utc>> {
        *self.last_synced.borrow()
    }

    /// How long ago the store last changed, or `None` if never synced.
    pub fn data_age(&self) -> Option<chrono::Duration> {
        self.last_synced().map(|t| Utc::now() - t)
    }
}

impl Default for LiveStore {
    fn default() -> Self {
        Self::new()
    }
}

fn apply_to<T: Send + Sync + 'static>(
    collection: &EntityCollection<T>,
    change: EntityChange<T>,
    id_of: impl Fn(&T) -> EntityId,
) {
    match change {
        EntityChange::Insert(entity) | EntityChange::Update(entity) => {
            collection.upsert(id_of(&entity), entity);
        }
        EntityChange::Delete(id) => {
            collection.remove(&id);
        }
    }
}
