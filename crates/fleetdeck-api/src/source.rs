// ── Collaborator trait seams ──
//
// The core never talks to the hosted database directly: it consumes these
// two traits. `ws::WsFeed` and `rest::RestStore` are the production
// implementations; tests substitute scripted in-memory ones.

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::Error;
use crate::event::{ChangeEvent, ChangeOperation, Topic};

/// A live channel of change events for one (topic, filter) subscription.
///
/// `next()` yields events until the channel errors or closes. `None`
/// means the remote side closed cleanly; `Some(Err(_))` is a channel
/// error. Either way the channel is finished and must be reopened.
pub struct EventChannel {
    rx: mpsc::Receiver<Result<ChangeEvent, Error>>,
}

impl EventChannel {
    pub fn new(rx: mpsc::Receiver<Result<ChangeEvent, Error>>) -> Self {
        Self { rx }
    }

    pub async fn next(&mut self) -> Option<Result<ChangeEvent, Error>> {
        self.rx.recv().await
    }
}

/// Source of raw change-event channels, one per (topic, operation filter).
///
/// `open` establishes a fresh channel; the `ConnectionManager` owns the
/// reconnect policy around it. `probe` is a lightweight liveness check
/// used by manual reconnects.
#[async_trait]
pub trait EventSource: Send + Sync {
    async fn open(
        &self,
        topic: Topic,
        filter: Option<ChangeOperation>,
    ) -> Result<EventChannel, Error>;

    async fn probe(&self) -> Result<(), Error>;
}

// ── Persistence collaborator ─────────────────────────────────────────

/// A vehicle status update bundled into an atomic reservation commit.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct VehicleStatusUpdate {
    pub vehicle_id: String,
    pub status: String,
}

/// An atomic commit unit: reservation rows plus the vehicle status
/// updates that must land with them. Both succeed or neither does.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CommitRequest {
    pub reservations: Vec<Value>,
    pub vehicle_updates: Vec<VehicleStatusUpdate>,
}

/// Result of an accepted commit.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CommitOutcome {
    pub reservation_ids: Vec<String>,
}

/// Row-level access to the hosted database.
///
/// Single-row writes are atomic on the remote side; `commit_reservations`
/// is the one multi-row operation and maps to an atomic RPC. This is the
/// sole authoritative boundary against double-booking -- availability
/// results upstream of it are advisory.
#[async_trait]
pub trait Persistence: Send + Sync {
    async fn select(&self, collection: &str, filter: Option<&str>) -> Result<Vec<Value>, Error>;

    async fn upsert(&self, collection: &str, row: Value) -> Result<Value, Error>;

    async fn delete(&self, collection: &str, id: &str) -> Result<(), Error>;

    /// Atomically write reservations and their vehicle status updates.
    ///
    /// A window/resource conflict detected at commit time surfaces as
    /// [`Error::Service`] with status 409.
    async fn commit_reservations(&self, commit: CommitRequest) -> Result<CommitOutcome, Error>;

    async fn probe(&self) -> Result<(), Error>;
}
