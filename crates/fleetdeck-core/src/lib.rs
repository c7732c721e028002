// fleetdeck-core: domain layer for the fleetdeck dashboard.
//
// Live synchronization (batcher + reactive store), availability and
// pricing engines, and the booking flow. Transport lives in
// fleetdeck-api and is consumed through its trait seams.

pub mod availability;
pub mod batcher;
pub mod booking;
pub mod config;
pub mod convert;
pub mod error;
pub mod model;
pub mod pricing;
pub mod store;
pub mod sync;

// ── Primary re-exports ──────────────────────────────────────────────
pub use availability::{Availability, AvailabilityEngine, ConflictInfo};
pub use batcher::{BatchConsumer, BatchGroup, UpdateBatcher};
pub use booking::{BookingFlow, BookingRequest, BookingState, VehicleDetails};
pub use config::{BatchTiming, FeeTable, RateTable, SyncConfig, TransportFlags};
pub use convert::{EntityChange, StoreChange};
pub use error::CoreError;
pub use model::{
    EntityId, PaymentStatus, Reservation, ReservationStatus, RiderRecord, UnitType, Vehicle,
    VehicleClass, VehicleStatus,
};
pub use pricing::PriceBreakdown;
pub use store::{EntityStream, LiveStore, SnapshotStream};
pub use sync::SyncService;
