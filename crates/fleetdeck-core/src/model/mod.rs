// ── Domain model ──

mod entity_id;
mod reservation;
mod vehicle;

pub use entity_id::EntityId;
pub use reservation::{
    PaymentStatus, Reservation, ReservationStatus, RiderRecord, UnitType,
};
pub use vehicle::{Vehicle, VehicleClass, VehicleStatus};
