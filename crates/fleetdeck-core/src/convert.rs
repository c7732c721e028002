// ── Wire-to-domain decoding ──
//
// Turns loosely-typed change events from the feed into the tagged,
// strongly-typed changes the store applies.

use fleetdeck_api::{ChangeEvent, ChangeOperation, Topic};

use crate::error::CoreError;
use crate::model::{EntityId, Reservation, Vehicle};

/// A typed row mutation.
#[derive(Debug, Clone)]
pub enum EntityChange<T> {
    Insert(T),
    Update(T),
    Delete(EntityId),
}

/// A typed mutation against one of the synchronized collections.
#[derive(Debug, Clone)]
pub enum StoreChange {
    Vehicle(EntityChange<Vehicle>),
    Reservation(EntityChange<Reservation>),
}

/// Decode one wire event into a typed store change.
///
/// Fails with `Validation` when the payload is missing or does not match
/// the topic's schema; callers log and skip such events rather than
/// letting them kill the processing loop.
pub fn decode(event: &ChangeEvent) -> Result<StoreChange, CoreError> {
    match event.topic {
        Topic::Vehicles => Ok(StoreChange::Vehicle(decode_entity::<Vehicle>(event)?)),
        Topic::Reservations => Ok(StoreChange::Reservation(decode_entity::<Reservation>(
            event,
        )?)),
    }
}

fn decode_entity<T: serde::de::DeserializeOwned>(
    event: &ChangeEvent,
) -> Result<EntityChange<T>, CoreError> {
    match event.operation {
        ChangeOperation::Insert | ChangeOperation::Update => {
            let row = event.new.as_ref().ok_or_else(|| {
                CoreError::validation(format!(
                    "{} event on '{}' is missing its row payload",
                    event.operation, event.topic
                ))
            })?;
            let entity: T = serde_json::from_value(row.clone()).map_err(|e| {
                CoreError::validation(format!("bad row on '{}': {e}", event.topic))
            })?;
            Ok(match event.operation {
                ChangeOperation::Insert => EntityChange::Insert(entity),
                _ => EntityChange::Update(entity),
            })
        }
        ChangeOperation::Delete => {
            let id = event.entity_id().ok_or_else(|| {
                CoreError::validation(format!("delete event on '{}' has no id", event.topic))
            })?;
            Ok(EntityChange::Delete(EntityId::from(id)))
        }
    }
}
