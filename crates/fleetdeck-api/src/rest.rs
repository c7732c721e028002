// REST client for the hosted database
//
// Wraps `reqwest::Client` with collection-scoped URL construction and
// error-body decoding. Row payloads are raw JSON values -- typed decoding
// into domain entities happens in fleetdeck-core.

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;
use url::Url;

use crate::error::Error;
use crate::source::{CommitOutcome, CommitRequest, Persistence, VehicleStatusUpdate};

/// Row-level HTTP client implementing the [`Persistence`] seam.
///
/// All writes are single-row and atomic on the remote side, except
/// [`commit_reservations`](Persistence::commit_reservations) which maps to
/// an atomic RPC endpoint.
const REQUEST_TIMEOUT_SECS: u64 = 30;

pub struct RestStore {
    http: reqwest::Client,
    base_url: Url,
    api_key: SecretString,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: Option<String>,
}

impl RestStore {
    /// `base_url` is the service root, e.g. `https://db.example.com`.
    pub fn new(base_url: Url, api_key: SecretString) -> Result<Self, Error> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()?;
        Ok(Self {
            http,
            base_url,
            api_key,
        })
    }

    /// Client with a caller-provided `reqwest::Client` (tests, shared pools).
    pub fn from_reqwest(base_url: Url, api_key: SecretString, http: reqwest::Client) -> Self {
        Self {
            http,
            base_url,
            api_key,
        }
    }

    // ── URL builders ─────────────────────────────────────────────────

    fn collection_url(&self, collection: &str) -> Result<Url, Error> {
        let full = format!(
            "{}/v1/{}",
            self.base_url.as_str().trim_end_matches('/'),
            collection
        );
        Ok(Url::parse(&full)?)
    }

    fn row_url(&self, collection: &str, id: &str) -> Result<Url, Error> {
        let full = format!(
            "{}/v1/{}/{}",
            self.base_url.as_str().trim_end_matches('/'),
            collection,
            id
        );
        Ok(Url::parse(&full)?)
    }

    fn rpc_url(&self, function: &str) -> Result<Url, Error> {
        let full = format!(
            "{}/v1/rpc/{}",
            self.base_url.as_str().trim_end_matches('/'),
            function
        );
        Ok(Url::parse(&full)?)
    }

    // ── Request helpers ──────────────────────────────────────────────

    fn bearer(&self) -> String {
        format!("Bearer {}", self.api_key.expose_secret())
    }

    /// Decode a response, turning non-success statuses into [`Error::Service`].
    async fn decode<T: serde::de::DeserializeOwned>(resp: reqwest::Response) -> Result<T, Error> {
        let status = resp.status();
        if !status.is_success() {
            let message = resp
                .json::<ErrorBody>()
                .await
                .ok()
                .and_then(|b| b.message)
                .unwrap_or_else(|| status.to_string());
            return Err(Error::Service {
                message,
                status: status.as_u16(),
            });
        }

        resp.json::<T>().await.map_err(|e| Error::Deserialization {
            message: e.to_string(),
        })
    }

    fn transport_err(e: reqwest::Error) -> Error {
        if e.is_timeout() {
            Error::Timeout {
                timeout_secs: REQUEST_TIMEOUT_SECS,
            }
        } else {
            Error::Transport(e)
        }
    }

    async fn check(resp: reqwest::Response) -> Result<(), Error> {
        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        let message = resp
            .json::<ErrorBody>()
            .await
            .ok()
            .and_then(|b| b.message)
            .unwrap_or_else(|| status.to_string());
        Err(Error::Service {
            message,
            status: status.as_u16(),
        })
    }
}

#[async_trait]
impl Persistence for RestStore {
    async fn select(&self, collection: &str, filter: Option<&str>) -> Result<Vec<Value>, Error> {
        let mut url = self.collection_url(collection)?;
        if let Some(filter) = filter {
            url.set_query(Some(filter));
        }
        debug!(%url, "SELECT");

        let resp = self
            .http
            .get(url)
            .header("Authorization", self.bearer())
            .send()
            .await
            .map_err(Self::transport_err)?;

        Self::decode(resp).await
    }

    async fn upsert(&self, collection: &str, row: Value) -> Result<Value, Error> {
        let url = self.collection_url(collection)?;
        debug!(%url, "UPSERT");

        let resp = self
            .http
            .post(url)
            .header("Authorization", self.bearer())
            .json(&row)
            .send()
            .await
            .map_err(Self::transport_err)?;

        Self::decode(resp).await
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<(), Error> {
        let url = self.row_url(collection, id)?;
        debug!(%url, "DELETE");

        let resp = self
            .http
            .delete(url)
            .header("Authorization", self.bearer())
            .send()
            .await
            .map_err(Self::transport_err)?;

        Self::check(resp).await
    }

    async fn commit_reservations(&self, commit: CommitRequest) -> Result<CommitOutcome, Error> {
        let url = self.rpc_url("commit_reservations")?;
        debug!(
            reservations = commit.reservations.len(),
            vehicle_updates = commit.vehicle_updates.len(),
            "COMMIT"
        );

        let resp = self
            .http
            .post(url)
            .header("Authorization", self.bearer())
            .json(&commit)
            .send()
            .await
            .map_err(Self::transport_err)?;

        Self::decode(resp).await
    }

    async fn probe(&self) -> Result<(), Error> {
        let url = self.rpc_url("health")?;
        let resp = self
            .http
            .get(url)
            .header("Authorization", self.bearer())
            .send()
            .await
            .map_err(Self::transport_err)?;
        Self::check(resp).await
    }
}

/// Convenience constructor for vehicle status updates.
impl VehicleStatusUpdate {
    pub fn new(vehicle_id: impl Into<String>, status: impl Into<String>) -> Self {
        Self {
            vehicle_id: vehicle_id.into(),
            status: status.into(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn store() -> RestStore {
        RestStore::from_reqwest(
            Url::parse("https://db.example.com").unwrap(),
            SecretString::from("svc-key".to_string()),
            reqwest::Client::new(),
        )
    }

    #[test]
    fn url_builders() {
        let s = store();
        assert_eq!(
            s.collection_url("reservations").unwrap().as_str(),
            "https://db.example.com/v1/reservations"
        );
        assert_eq!(
            s.row_url("vehicles", "veh-1").unwrap().as_str(),
            "https://db.example.com/v1/vehicles/veh-1"
        );
        assert_eq!(
            s.rpc_url("commit_reservations").unwrap().as_str(),
            "https://db.example.com/v1/rpc/commit_reservations"
        );
    }

    #[test]
    fn trailing_slash_is_tolerated() {
        let s = RestStore::from_reqwest(
            Url::parse("https://db.example.com/").unwrap(),
            SecretString::from("k".to_string()),
            reqwest::Client::new(),
        );
        assert_eq!(
            s.collection_url("vehicles").unwrap().as_str(),
            "https://db.example.com/v1/vehicles"
        );
    }
}
