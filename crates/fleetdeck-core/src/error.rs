// ── Core error types ──
//
// Domain-facing errors from fleetdeck-core. Consumers never see HTTP
// statuses or socket failures directly -- the `From<fleetdeck_api::Error>`
// impl translates transport-layer errors into these variants.
//
// The taxonomy matters for retry behavior: Validation is never retried,
// Conflict sends the booking flow back to vehicle selection, Degraded
// tells consumers to fall back to manual refresh, and Persistence means
// the whole commit must be resubmitted (writes are atomic, never partial).

use thiserror::Error;

use fleetdeck_api::Topic;

use crate::availability::ConflictInfo;

/// Unified error type for the core crate.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Malformed input (start ≥ end, missing rider fields, bad payloads).
    /// Surfaced immediately; never retried automatically.
    #[error("Validation failed: {message}")]
    Validation { message: String },

    /// Requested window/vehicle unavailable. Carries the conflicting
    /// reservations and, when derivable, the next free instant.
    #[error("Reservation conflict: {} conflicting reservation(s)", conflicts.len())]
    Conflict { conflicts: Vec<ConflictInfo> },

    /// A live subscription exhausted its reconnect budget. The dashboard
    /// is degraded, not silently stale -- fall back to manual refresh.
    #[error("Live updates degraded for topic '{topic}'")]
    Degraded { topic: Topic },

    /// A persistence write failed. Atomic: nothing was partially applied;
    /// resubmit the entire reservation.
    #[error("Persistence error: {message}")]
    Persistence { message: String },

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoreError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }
}

// ── Conversion from transport-layer errors ───────────────────────────

impl From<fleetdeck_api::Error> for CoreError {
    fn from(err: fleetdeck_api::Error) -> Self {
        match err {
            fleetdeck_api::Error::Service { status: 409, .. } => {
                // Conflict detected at commit time; diagnostics are filled
                // in by the caller from live availability state.
                CoreError::Conflict {
                    conflicts: Vec::new(),
                }
            }
            fleetdeck_api::Error::Service {
                status: 400 | 422,
                message,
            } => CoreError::Validation { message },
            fleetdeck_api::Error::SubscriptionFailed { topic, .. } => CoreError::Degraded { topic },
            fleetdeck_api::Error::Deserialization { message } => {
                CoreError::Internal(format!("deserialization: {message}"))
            }
            other => CoreError::Persistence {
                message: other.to_string(),
            },
        }
    }
}
