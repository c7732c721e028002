// fleetdeck-api: transport layer for the fleetdeck dashboard.
//
// Change-stream subscriptions (WebSocket + reconnect management) and the
// hosted-database REST client. Domain logic lives in fleetdeck-core.

pub mod connection;
pub mod error;
pub mod event;
pub mod rest;
pub mod source;
pub mod ws;

// ── Primary re-exports ──────────────────────────────────────────────
pub use connection::{
    ConnectionHealth, ConnectionManager, ReconnectPolicy, SubscribeOptions, SubscriptionHandle,
    SubscriptionKey, SubscriptionStatus,
};
pub use error::Error;
pub use event::{ChangeEvent, ChangeOperation, Topic};
pub use rest::RestStore;
pub use source::{
    CommitOutcome, CommitRequest, EventChannel, EventSource, Persistence, VehicleStatusUpdate,
};
pub use ws::{FeedConfig, WsFeed};
