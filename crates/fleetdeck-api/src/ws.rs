//! WebSocket transport for the hosted database's change feed.
//!
//! Implements [`EventSource`] by opening one socket per (topic, filter)
//! channel. Reconnection is not handled here -- the `ConnectionManager`
//! owns that policy; this module only turns a live socket into an
//! [`EventChannel`].

use async_trait::async_trait;
use futures_util::StreamExt;
use secrecy::{ExposeSecret, SecretString};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{self, ClientRequestBuilder};
use tracing::{debug, info, trace};
use url::Url;

use crate::error::Error;
use crate::event::{ChangeEvent, ChangeOperation, Topic};
use crate::source::{EventChannel, EventSource};

const CHANNEL_BUFFER: usize = 256;

/// Connection settings for the change feed endpoint.
#[derive(Debug, Clone)]
pub struct FeedConfig {
    /// Stream endpoint root, e.g. `wss://db.example.com/realtime/v1`.
    pub endpoint: Url,
    /// Service API key, sent as a bearer header on the upgrade request.
    pub api_key: SecretString,
}

/// WebSocket-backed [`EventSource`].
pub struct WsFeed {
    config: FeedConfig,
}

impl WsFeed {
    pub fn new(config: FeedConfig) -> Self {
        Self { config }
    }

    /// Build the per-channel URL: `{endpoint}/stream?topic=...&operation=...`
    fn channel_url(&self, topic: Topic, filter: Option<ChangeOperation>) -> Result<Url, Error> {
        let mut url = self.config.endpoint.join("stream")?;
        {
            let mut pairs = url.query_pairs_mut();
            pairs.append_pair("topic", &topic.to_string());
            if let Some(op) = filter {
                pairs.append_pair("operation", &op.to_string());
            }
        }
        Ok(url)
    }

    async fn connect(
        &self,
        url: &Url,
    ) -> Result<
        tokio_tungstenite::WebSocketStream<
            tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
        >,
        Error,
    > {
        let uri: tungstenite::http::Uri = url
            .as_str()
            .parse()
            .map_err(|e: tungstenite::http::uri::InvalidUri| Error::StreamConnect(e.to_string()))?;

        let request = ClientRequestBuilder::new(uri).with_header(
            "Authorization",
            format!("Bearer {}", self.config.api_key.expose_secret()),
        );

        let (stream, _response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| Error::StreamConnect(e.to_string()))?;

        Ok(stream)
    }
}

#[async_trait]
impl EventSource for WsFeed {
    async fn open(
        &self,
        topic: Topic,
        filter: Option<ChangeOperation>,
    ) -> Result<EventChannel, Error> {
        let url = self.channel_url(topic, filter)?;
        info!(%topic, ?filter, "opening change feed channel");

        let ws_stream = self.connect(&url).await?;
        let (_write, mut read) = ws_stream.split();

        let (tx, rx) = mpsc::channel(CHANNEL_BUFFER);

        tokio::spawn(async move {
            while let Some(frame) = read.next().await {
                match frame {
                    Ok(tungstenite::Message::Text(text)) => {
                        if let Some(event) = parse_frame(&text, topic) {
                            if tx.send(Ok(event)).await.is_err() {
                                // Receiver gone -- channel abandoned.
                                return;
                            }
                        }
                    }
                    Ok(tungstenite::Message::Ping(_)) => {
                        // tungstenite replies with pongs automatically
                        trace!("change feed ping");
                    }
                    Ok(tungstenite::Message::Close(frame)) => {
                        if let Some(cf) = frame {
                            info!(code = %cf.code, reason = %cf.reason, "change feed close frame");
                            let code: u16 = cf.code.into();
                            if code != 1000 {
                                let _ = tx
                                    .send(Err(Error::StreamClosed {
                                        code,
                                        reason: cf.reason.to_string(),
                                    }))
                                    .await;
                            }
                        }
                        return;
                    }
                    Ok(_) => {
                        // Binary, Pong, Frame -- ignore
                    }
                    Err(e) => {
                        let _ = tx.send(Err(Error::StreamConnect(e.to_string()))).await;
                        return;
                    }
                }
            }
            // Stream ended without a close frame: clean close.
        });

        Ok(EventChannel::new(rx))
    }

    /// Lightweight liveness check: open a socket to the endpoint root and
    /// close it again.
    async fn probe(&self) -> Result<(), Error> {
        let url = self.config.endpoint.join("health")?;
        let stream = self.connect(&url).await?;
        drop(stream);
        Ok(())
    }
}

/// Parse one text frame into a [`ChangeEvent`].
///
/// Frames for other topics (shared sockets on some deployments) and
/// unparseable frames are skipped, not errors.
fn parse_frame(text: &str, topic: Topic) -> Option<ChangeEvent> {
    let event: ChangeEvent = match serde_json::from_str(text) {
        Ok(event) => event,
        Err(e) => {
            debug!(error = %e, "skipping unparseable change feed frame");
            return None;
        }
    };

    if event.topic != topic {
        debug!(got = %event.topic, want = %topic, "skipping frame for other topic");
        return None;
    }

    Some(event)
}
