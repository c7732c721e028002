//! Change-stream subscription management with auto-reconnect.
//!
//! One driver task per (topic, operation-filter) key owns the full channel
//! lifecycle: connect, heartbeat, read, backoff, reconnect. Because a single
//! task owns each key, at most one reconnect attempt is ever in flight for
//! it. After the reconnect budget is exhausted the driver parks in `Failed`
//! until a manual [`reconnect`](ConnectionManager::reconnect) wakes it.

use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::event::{ChangeEvent, ChangeOperation, Topic};
use crate::source::{EventChannel, EventSource};

const EVENT_BUFFER: usize = 256;

// ── Policy & options ─────────────────────────────────────────────────

/// Bounded exponential backoff for subscription reconnects.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    /// Delay before the first retry; doubles each attempt. Default: 1s.
    pub base_delay: Duration,

    /// Upper bound on a single backoff delay. Default: 30s.
    pub max_delay: Duration,

    /// Automatic attempts before the subscription is marked `Failed`.
    /// Default: 5. Manual reconnect remains possible afterwards.
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_attempts: 5,
        }
    }
}

/// Per-subscription tuning handed to [`ConnectionManager::subscribe_with`].
#[derive(Debug, Clone)]
pub struct SubscribeOptions {
    /// Interval between heartbeat ticks re-affirming a live channel.
    /// Default: 30s.
    pub heartbeat_interval: Duration,

    pub reconnect: ReconnectPolicy,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

// ── Observable state ─────────────────────────────────────────────────

/// Lifecycle state of one subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionStatus {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting { attempt: u32 },
    Error,
    Failed,
}

/// Identity of a subscription: topic plus optional operation filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionKey {
    pub topic: Topic,
    pub filter: Option<ChangeOperation>,
}

/// Connection health snapshot for observability/UI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionHealth {
    pub status: SubscriptionStatus,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub active_subscriptions: usize,
}

// ── ConnectionManager ────────────────────────────────────────────────

/// Owns every live subscription against an [`EventSource`].
///
/// Cheaply cloneable. Constructed explicitly and injected into consumers;
/// holds no global state. Call [`teardown`](Self::teardown) to stop all
/// driver tasks and clear the registry.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

struct Inner {
    source: Arc<dyn EventSource>,
    subs: DashMap<SubscriptionKey, SubEntry>,
    cancel: CancellationToken,
}

struct SubEntry {
    status: Arc<watch::Sender<SubscriptionStatus>>,
    last_heartbeat: Arc<watch::Sender<Option<DateTime<Utc>>>>,
    wake: Arc<Notify>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl ConnectionManager {
    pub fn new(source: Arc<dyn EventSource>) -> Self {
        Self {
            inner: Arc::new(Inner {
                source,
                subs: DashMap::new(),
                cancel: CancellationToken::new(),
            }),
        }
    }

    /// Subscribe with default options.
    pub fn subscribe(&self, topic: Topic, filter: Option<ChangeOperation>) -> SubscriptionHandle {
        self.subscribe_with(topic, filter, SubscribeOptions::default())
    }

    /// Subscribe to a change topic, spawning its driver task.
    ///
    /// A duplicate (topic, filter) key is not an error: it logs a warning
    /// and returns an inert handle whose receiver yields nothing and whose
    /// unsubscribe is a no-op.
    pub fn subscribe_with(
        &self,
        topic: Topic,
        filter: Option<ChangeOperation>,
        options: SubscribeOptions,
    ) -> SubscriptionHandle {
        let key = SubscriptionKey { topic, filter };

        if self.inner.subs.contains_key(&key) {
            warn!(%topic, ?filter, "duplicate subscription ignored");
            return SubscriptionHandle::noop(key);
        }

        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
        let (status_tx, status_rx) = watch::channel(SubscriptionStatus::Connecting);
        let (hb_tx, _) = watch::channel(None);
        let status_tx = Arc::new(status_tx);
        let hb_tx = Arc::new(hb_tx);
        let wake = Arc::new(Notify::new());
        let cancel = self.inner.cancel.child_token();

        let task = tokio::spawn(drive_subscription(
            Arc::clone(&self.inner.source),
            key,
            options,
            events_tx,
            Arc::clone(&status_tx),
            Arc::clone(&hb_tx),
            Arc::clone(&wake),
            cancel.clone(),
        ));

        self.inner.subs.insert(
            key,
            SubEntry {
                status: status_tx,
                last_heartbeat: hb_tx,
                wake,
                cancel: cancel.clone(),
                task,
            },
        );

        SubscriptionHandle {
            key,
            events: events_rx,
            status: status_rx,
            cancel,
            registry: Arc::downgrade(&self.inner),
            noop: false,
        }
    }

    /// Manually reconnect a subscription after it failed.
    ///
    /// Probes the source for liveness first. On success the parked driver
    /// is woken with a reset attempt counter; heartbeat restarts once the
    /// channel reopens. On failure the subscription is left in `Error` and
    /// `false` is returned.
    pub async fn reconnect(&self, topic: Topic, filter: Option<ChangeOperation>) -> bool {
        let key = SubscriptionKey { topic, filter };
        // Clone what the probe outcome needs and release the registry
        // guard before awaiting: holding it across the probe would block
        // every registry write (subscribe, unsubscribe, teardown) on this
        // key's shard for the whole round trip.
        let Some((status, wake)) = self
            .inner
            .subs
            .get(&key)
            .map(|entry| (Arc::clone(&entry.status), Arc::clone(&entry.wake)))
        else {
            warn!(%topic, ?filter, "manual reconnect for unknown subscription");
            return false;
        };

        let parked = matches!(
            *status.borrow(),
            SubscriptionStatus::Failed | SubscriptionStatus::Error
        );

        match self.inner.source.probe().await {
            Ok(()) => {
                if parked {
                    info!(%topic, "liveness probe ok, waking subscription driver");
                    wake.notify_one();
                }
                true
            }
            Err(e) => {
                warn!(%topic, error = %e, "liveness probe failed");
                let _ = status.send(SubscriptionStatus::Error);
                false
            }
        }
    }

    /// Watch the status of one subscription, if it exists.
    pub fn subscription_status(
        &self,
        topic: Topic,
        filter: Option<ChangeOperation>,
    ) -> Option<watch::Receiver<SubscriptionStatus>> {
        let key = SubscriptionKey { topic, filter };
        self.inner.subs.get(&key).map(|e| e.status.subscribe())
    }

    /// Aggregate health across all subscriptions.
    ///
    /// The worst individual status wins: any `Failed` subscription marks
    /// the whole connection failed so consumers can drop to manual refresh.
    pub fn health(&self) -> ConnectionHealth {
        let mut status = SubscriptionStatus::Disconnected;
        let mut last_heartbeat: Option<DateTime<Utc>> = None;
        let mut active = 0usize;

        for entry in &self.inner.subs {
            let s = *entry.status.borrow();
            if s == SubscriptionStatus::Connected {
                active += 1;
            }
            status = worse(status, s);
            let hb = *entry.last_heartbeat.borrow();
            if hb > last_heartbeat {
                last_heartbeat = hb;
            }
        }

        ConnectionHealth {
            status,
            last_heartbeat,
            active_subscriptions: active,
        }
    }

    /// Stop every driver task, clear all timers, and empty the registry.
    pub async fn teardown(&self) {
        self.inner.cancel.cancel();

        let keys: Vec<SubscriptionKey> = self.inner.subs.iter().map(|e| *e.key()).collect();
        for key in keys {
            if let Some((_, entry)) = self.inner.subs.remove(&key) {
                let _ = entry.task.await;
            }
        }
        debug!("connection manager torn down");
    }
}

/// Severity ordering for aggregate health.
fn worse(a: SubscriptionStatus, b: SubscriptionStatus) -> SubscriptionStatus {
    fn rank(s: SubscriptionStatus) -> u8 {
        match s {
            SubscriptionStatus::Disconnected => 0,
            SubscriptionStatus::Connected => 1,
            SubscriptionStatus::Connecting => 2,
            SubscriptionStatus::Reconnecting { .. } => 3,
            SubscriptionStatus::Error => 4,
            SubscriptionStatus::Failed => 5,
        }
    }
    if rank(b) > rank(a) { b } else { a }
}

// ── SubscriptionHandle ───────────────────────────────────────────────

/// Consumer side of one subscription.
///
/// Receive events with [`recv`](Self::recv); dropping the handle (or
/// calling [`unsubscribe`](Self::unsubscribe)) stops the driver task and
/// removes the registry entry.
pub struct SubscriptionHandle {
    key: SubscriptionKey,
    events: mpsc::Receiver<ChangeEvent>,
    status: watch::Receiver<SubscriptionStatus>,
    cancel: CancellationToken,
    registry: Weak<Inner>,
    noop: bool,
}

impl SubscriptionHandle {
    /// Inert handle returned for duplicate subscriptions.
    fn noop(key: SubscriptionKey) -> Self {
        // Sender dropped immediately: recv() returns None forever.
        let (_, events) = mpsc::channel(1);
        let (status_tx, status) = watch::channel(SubscriptionStatus::Disconnected);
        drop(status_tx);
        Self {
            key,
            events,
            status,
            cancel: CancellationToken::new(),
            registry: Weak::new(),
            noop: true,
        }
    }

    pub fn key(&self) -> SubscriptionKey {
        self.key
    }

    /// `true` for the inert handle a duplicate subscription gets.
    pub fn is_noop(&self) -> bool {
        self.noop
    }

    /// Receive the next event. `None` once the subscription has stopped.
    pub async fn recv(&mut self) -> Option<ChangeEvent> {
        self.events.recv().await
    }

    /// Watch this subscription's status.
    pub fn status(&self) -> watch::Receiver<SubscriptionStatus> {
        self.status.clone()
    }

    /// Stop the driver and remove the subscription.
    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        if self.noop {
            return;
        }
        self.cancel.cancel();
        if let Some(inner) = self.registry.upgrade() {
            inner.subs.remove(&self.key);
        }
    }
}

// ── Driver task ──────────────────────────────────────────────────────

enum ReadOutcome {
    Shutdown,
    ConsumerGone,
    Closed,
    Errored,
}

/// Full lifecycle loop for one subscription key.
#[allow(clippy::too_many_arguments)]
async fn drive_subscription(
    source: Arc<dyn EventSource>,
    key: SubscriptionKey,
    options: SubscribeOptions,
    events_tx: mpsc::Sender<ChangeEvent>,
    status: Arc<watch::Sender<SubscriptionStatus>>,
    last_heartbeat: Arc<watch::Sender<Option<DateTime<Utc>>>>,
    wake: Arc<Notify>,
    cancel: CancellationToken,
) {
    let topic = key.topic;
    let mut attempt: u32 = 0;

    'outer: loop {
        if cancel.is_cancelled() {
            break;
        }

        match source.open(topic, key.filter).await {
            Ok(mut channel) => {
                attempt = 0;
                let _ = status.send(SubscriptionStatus::Connected);
                info!(%topic, "subscription connected");

                match read_channel(
                    &mut channel,
                    &events_tx,
                    &status,
                    &last_heartbeat,
                    options.heartbeat_interval,
                    &cancel,
                )
                .await
                {
                    ReadOutcome::Shutdown => break,
                    ReadOutcome::ConsumerGone => {
                        debug!(%topic, "subscriber dropped, stopping driver");
                        break;
                    }
                    ReadOutcome::Closed => info!(%topic, "change feed closed, reconnecting"),
                    ReadOutcome::Errored => {}
                }
            }
            Err(e) => {
                warn!(%topic, error = %e, attempt, "subscription connect failed");
            }
        }

        // Channel gone (error or close): schedule the next attempt.
        attempt += 1;
        if attempt >= options.reconnect.max_attempts {
            let _ = status.send(SubscriptionStatus::Failed);
            error!(
                %topic,
                attempts = attempt,
                "reconnect budget exhausted, waiting for manual reconnect"
            );

            tokio::select! {
                biased;
                () = cancel.cancelled() => break 'outer,
                () = wake.notified() => {
                    attempt = 0;
                    let _ = status.send(SubscriptionStatus::Connecting);
                    continue 'outer;
                }
            }
        }

        let delay = backoff_delay(attempt - 1, &options.reconnect);
        let _ = status.send(SubscriptionStatus::Reconnecting { attempt });
        debug!(%topic, attempt, delay_ms = delay.as_millis() as u64, "waiting before reconnect");

        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            () = tokio::time::sleep(delay) => {}
        }
    }

    let _ = status.send(SubscriptionStatus::Disconnected);
}

/// Read one live channel until it drops, ticking the heartbeat.
async fn read_channel(
    channel: &mut EventChannel,
    events_tx: &mpsc::Sender<ChangeEvent>,
    status: &watch::Sender<SubscriptionStatus>,
    last_heartbeat: &watch::Sender<Option<DateTime<Utc>>>,
    heartbeat_interval: Duration,
    cancel: &CancellationToken,
) -> ReadOutcome {
    let mut heartbeat = tokio::time::interval(heartbeat_interval);
    heartbeat.tick().await; // consume the immediate first tick
    let _ = last_heartbeat.send(Some(Utc::now()));

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => return ReadOutcome::Shutdown,
            _ = heartbeat.tick() => {
                // Re-affirm liveness only while the channel is open; a dead
                // channel exits this loop and can never look healthy.
                let _ = last_heartbeat.send(Some(Utc::now()));
                let _ = status.send(SubscriptionStatus::Connected);
            }
            item = channel.next() => match item {
                Some(Ok(event)) => {
                    if events_tx.send(event).await.is_err() {
                        return ReadOutcome::ConsumerGone;
                    }
                }
                Some(Err(e)) => {
                    warn!(error = %e, "change feed channel error");
                    let _ = status.send(SubscriptionStatus::Error);
                    return ReadOutcome::Errored;
                }
                None => return ReadOutcome::Closed,
            }
        }
    }
}

/// `delay = min(base × 2^exp, max_delay)`
fn backoff_delay(exp: u32, policy: &ReconnectPolicy) -> Duration {
    let factor = 2u32.saturating_pow(exp);
    policy
        .base_delay
        .saturating_mul(factor)
        .min(policy.max_delay)
}

// ── Tests ────────────────────────────────────────────────────────────
