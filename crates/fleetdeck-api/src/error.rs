use thiserror::Error;

use crate::event::Topic;

/// Top-level error type for the `fleetdeck-api` crate.
///
/// Covers every transport failure mode: HTTP calls against the hosted
/// database, change-feed connections, and subscription lifecycle.
/// `fleetdeck-core` maps these into domain-facing diagnostics.
#[derive(Debug, Error)]
pub enum Error {
    // ── Transport ───────────────────────────────────────────────────
    /// HTTP transport error (connection refused, DNS failure, etc.)
    #[error("HTTP transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// URL parsing error.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// Request timed out.
    #[error("Request timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    // ── Service ─────────────────────────────────────────────────────
    /// Structured error response from the hosted database.
    #[error("Service error (HTTP {status}): {message}")]
    Service { message: String, status: u16 },

    // ── Change feed ─────────────────────────────────────────────────
    /// Change-feed connection failed.
    #[error("Change feed connection failed: {0}")]
    StreamConnect(String),

    /// Change feed closed unexpectedly.
    #[error("Change feed closed (code {code}): {reason}")]
    StreamClosed { code: u16, reason: String },

    /// A subscription exhausted its automatic reconnect budget.
    #[error("Subscription to '{topic}' failed after {attempts} attempts")]
    SubscriptionFailed { topic: Topic, attempts: u32 },

    // ── Data ────────────────────────────────────────────────────────
    /// JSON deserialization failed.
    #[error("Deserialization error: {message}")]
    Deserialization { message: String },
}

impl Error {
    /// Returns `true` if this is a transient error worth retrying.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport(e) => e.is_timeout() || e.is_connect(),
            Self::Timeout { .. } | Self::StreamConnect(_) | Self::StreamClosed { .. } => true,
            Self::Service { status, .. } => *status >= 500,
            _ => false,
        }
    }
}
