// ── Change-stream wire types ──
//
// One `ChangeEvent` per row mutation on the hosted database. The feed
// delivers them as JSON frames; typed decoding into domain entities
// happens in fleetdeck-core, not here.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A named change topic, one per synchronized collection.
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
pub enum Topic {
    Vehicles,
    Reservations,
}

/// Row operation carried by a change event.
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
pub enum ChangeOperation {
    Insert,
    Update,
    Delete,
}

/// One insert/update/delete notification from the live data feed.
///
/// `new` carries the row after the mutation (inserts and updates),
/// `old` the row before it (updates and deletes). Ephemeral: produced
/// by the feed, consumed once by the batcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub topic: Topic,
    pub operation: ChangeOperation,
    #[serde(default)]
    pub old: Option<serde_json::Value>,
    #[serde(default)]
    pub new: Option<serde_json::Value>,
    pub timestamp: DateTime<Utc>,
}

impl ChangeEvent {
    /// The id of the affected row, taken from `new` then `old`.
    ///
    /// Returns `None` for malformed frames with no `id` field anywhere;
    /// those are logged and skipped by consumers.
    pub fn entity_id(&self) -> Option<&str> {
        self.new
            .as_ref()
            .and_then(|row| row.get("id"))
            .or_else(|| self.old.as_ref().and_then(|row| row.get("id")))
            .and_then(serde_json::Value::as_str)
    }

    /// The row payload relevant to this operation: `new` for inserts
    /// and updates, `old` for deletes.
    pub fn row(&self) -> Option<&serde_json::Value> {
        match self.operation {
            ChangeOperation::Insert | ChangeOperation::Update => self.new.as_ref(),
            ChangeOperation::Delete => self.old.as_ref().or(self.new.as_ref()),
        }
    }
}
