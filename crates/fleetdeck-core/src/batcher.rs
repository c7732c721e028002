//! Debounced, batched delivery of change events.
//!
//! Raw events arrive in bursts (a staff bulk edit touches dozens of rows);
//! consumers want one coherent delivery per burst, not one callback per
//! event. Each registered consumer gets its own buffering task: inbound
//! events reset a debounce timer, and once the burst settles a batch timer
//! fires and flushes everything buffered since the last flush, grouped by
//! (topic, operation). Coalescing under load is the documented behavior,
//! not event loss.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use fleetdeck_api::{ChangeEvent, ChangeOperation, Topic};

use crate::config::BatchTiming;

const DISPATCH_BUFFER: usize = 512;
const CONSUMER_BUFFER: usize = 256;
const BATCH_BUFFER: usize = 64;

/// One delivered group: all buffered events sharing (topic, operation),
/// in arrival order. Across groups no ordering is promised.
#[derive(Debug, Clone)]
pub struct BatchGroup {
    pub topic: Topic,
    pub operation: ChangeOperation,
    pub events: Vec<ChangeEvent>,
}

// ── UpdateBatcher ────────────────────────────────────────────────────

/// Fans raw change events out to registered consumers, each with its own
/// debounce/batch timing.
///
/// Explicitly constructed and torn down; holds no global state.
pub struct UpdateBatcher {
    dispatch_tx: mpsc::Sender<ChangeEvent>,
    consumers: Arc<DashMap<u64, ConsumerEntry>>,
    next_id: AtomicU64,
    cancel: CancellationToken,
    dispatch_task: JoinHandle<()>,
}

struct ConsumerEntry {
    topics: Vec<Topic>,
    tx: mpsc::Sender<ChangeEvent>,
    task: JoinHandle<()>,
}

impl UpdateBatcher {
    pub fn new() -> Self {
        let (dispatch_tx, dispatch_rx) = mpsc::channel(DISPATCH_BUFFER);
        let consumers: Arc<DashMap<u64, ConsumerEntry>> = Arc::new(DashMap::new());
        let cancel = CancellationToken::new();

        let dispatch_task = tokio::spawn(dispatch_loop(
            dispatch_rx,
            Arc::clone(&consumers),
            cancel.clone(),
        ));

        Self {
            dispatch_tx,
            consumers,
            next_id: AtomicU64::new(0),
            cancel,
            dispatch_task,
        }
    }

    /// Feed one raw event in (the sync service pipes subscriptions here).
    pub async fn push(&self, event: ChangeEvent) {
        if self.dispatch_tx.send(event).await.is_err() {
            warn!("update batcher is shut down, dropping event");
        }
    }

    /// A cloneable sender for pump tasks.
    pub fn sender(&self) -> mpsc::Sender<ChangeEvent> {
        self.dispatch_tx.clone()
    }

    /// Register a consumer for the given topics with its own timing.
    pub fn register(&self, topics: Vec<Topic>, timing: BatchTiming) -> BatchConsumer {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (event_tx, event_rx) = mpsc::channel(CONSUMER_BUFFER);
        let (batch_tx, batch_rx) = mpsc::channel(BATCH_BUFFER);
        let cancel = self.cancel.child_token();

        let task = tokio::spawn(consumer_loop(event_rx, batch_tx, timing, cancel.clone()));

        self.consumers.insert(
            id,
            ConsumerEntry {
                topics,
                tx: event_tx,
                task,
            },
        );

        BatchConsumer {
            id,
            batches: batch_rx,
            cancel,
            registry: Arc::downgrade(&self.consumers),
        }
    }

    /// Stop dispatch and every consumer task. Each consumer's pending
    /// buffer is flushed once before its timers are cleared.
    pub async fn teardown(&self) {
        self.cancel.cancel();

        let ids: Vec<u64> = self.consumers.iter().map(|e| *e.key()).collect();
        for id in ids {
            if let Some((_, entry)) = self.consumers.remove(&id) {
                let _ = entry.task.await;
            }
        }
        self.dispatch_task.abort();
        debug!("update batcher torn down");
    }
}

impl Default for UpdateBatcher {
    fn default() -> Self {
        Self::new()
    }
}

// ── BatchConsumer ────────────────────────────────────────────────────

/// Consumer side of one registration.
///
/// After [`shutdown`](Self::shutdown) the final flushed batches remain
/// receivable until [`recv`](Self::recv) returns `None`.
pub struct BatchConsumer {
    id: u64,
    batches: mpsc::Receiver<BatchGroup>,
    cancel: CancellationToken,
    registry: Weak<DashMap<u64, ConsumerEntry>>,
}

impl BatchConsumer {
    /// Receive the next delivered group. `None` once shut down and drained.
    pub async fn recv(&mut self) -> Option<BatchGroup> {
        self.batches.recv().await
    }

    /// Stop this consumer, flushing its pending buffer once first.
    pub async fn shutdown(&mut self) {
        self.cancel.cancel();
        if let Some(registry) = self.registry.upgrade() {
            if let Some((_, entry)) = registry.remove(&self.id) {
                let _ = entry.task.await;
            }
        }
    }
}

impl Drop for BatchConsumer {
    fn drop(&mut self) {
        self.cancel.cancel();
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(&self.id);
        }
    }
}

// ── Dispatch task ────────────────────────────────────────────────────

async fn dispatch_loop(
    mut rx: mpsc::Receiver<ChangeEvent>,
    consumers: Arc<DashMap<u64, ConsumerEntry>>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            maybe = rx.recv() => {
                let Some(event) = maybe else { break };

                // Collect matching senders first: never hold a map guard
                // across an await.
                let targets: Vec<mpsc::Sender<ChangeEvent>> = consumers
                    .iter()
                    .filter(|entry| entry.topics.contains(&event.topic))
                    .map(|entry| entry.tx.clone())
                    .collect();

                for tx in targets {
                    if tx.send(event.clone()).await.is_err() {
                        trace!("consumer gone, skipping delivery");
                    }
                }
            }
        }
    }
}

// ── Consumer task ────────────────────────────────────────────────────

enum Phase {
    Idle,
    Debouncing(Instant),
    Batching(Instant),
}

async fn consumer_loop(
    mut rx: mpsc::Receiver<ChangeEvent>,
    batch_tx: mpsc::Sender<BatchGroup>,
    timing: BatchTiming,
    cancel: CancellationToken,
) {
    let mut pending: Vec<ChangeEvent> = Vec::new();
    // Ids already delivered to this consumer (any batch so far).
    let mut delivered: HashSet<(Topic, String)> = HashSet::new();
    let mut phase = Phase::Idle;

    loop {
        let deadline = match phase {
            Phase::Idle => None,
            Phase::Debouncing(d) | Phase::Batching(d) => Some(d),
        };
        // Placeholder deadline keeps the branch well-formed when disabled.
        let sleep_to = deadline.unwrap_or_else(|| Instant::now() + std::time::Duration::from_secs(86_400));

        tokio::select! {
            biased;
            () = cancel.cancelled() => {
                flush(&mut pending, &mut delivered, &batch_tx).await;
                break;
            }
            maybe = rx.recv() => {
                let Some(event) = maybe else {
                    flush(&mut pending, &mut delivered, &batch_tx).await;
                    break;
                };
                coalesce(&mut pending, &mut delivered, event);
                // Every inbound event restarts the settling window.
                phase = Phase::Debouncing(Instant::now() + timing.debounce);
            }
            () = tokio::time::sleep_until(sleep_to), if deadline.is_some() => {
                phase = match phase {
                    Phase::Debouncing(_) => Phase::Batching(Instant::now() + timing.batch_delay),
                    Phase::Batching(_) | Phase::Idle => {
                        flush(&mut pending, &mut delivered, &batch_tx).await;
                        Phase::Idle
                    }
                };
            }
        }
    }
}

/// Fold one inbound event into the pending buffer.
///
/// - Insert: dropped if the id was already delivered or is already pending.
/// - Update: becomes an insert-equivalent when the id has never been seen.
/// - Delete: removes the id's pending inserts/updates, then queues itself;
///   the delivered mark is cleared so a later re-insert flows through.
fn coalesce(
    pending: &mut Vec<ChangeEvent>,
    delivered: &mut HashSet<(Topic, String)>,
    mut event: ChangeEvent,
) {
    let Some(id) = event.entity_id().map(str::to_owned) else {
        // No id to coalesce on; pass it through untouched.
        pending.push(event);
        return;
    };
    let key = (event.topic, id);

    let is_pending = |pending: &[ChangeEvent]| {
        pending.iter().any(|e| {
            e.topic == key.0
                && e.operation != ChangeOperation::Delete
                && e.entity_id() == Some(key.1.as_str())
        })
    };

    match event.operation {
        ChangeOperation::Insert => {
            if delivered.contains(&key) || is_pending(pending) {
                trace!(topic = %key.0, id = %key.1, "duplicate insert dropped");
                return;
            }
            pending.push(event);
        }
        ChangeOperation::Update => {
            if !delivered.contains(&key) && !is_pending(pending) {
                event.operation = ChangeOperation::Insert;
            }
            pending.push(event);
        }
        ChangeOperation::Delete => {
            pending.retain(|e| {
                !(e.topic == key.0
                    && e.operation != ChangeOperation::Delete
                    && e.entity_id() == Some(key.1.as_str()))
            });
            delivered.remove(&key);
            pending.push(event);
        }
    }
}

/// Deliver the pending buffer as (topic, operation) groups, arrival order
/// preserved inside each group.
async fn flush(
    pending: &mut Vec<ChangeEvent>,
    delivered: &mut HashSet<(Topic, String)>,
    batch_tx: &mpsc::Sender<BatchGroup>,
) {
    if pending.is_empty() {
        return;
    }

    let mut groups: Vec<BatchGroup> = Vec::new();
    for event in pending.drain(..) {
        if event.operation != ChangeOperation::Delete {
            if let Some(id) = event.entity_id() {
                delivered.insert((event.topic, id.to_owned()));
            }
        }
        match groups
            .iter_mut()
            .find(|g| g.topic == event.topic && g.operation == event.operation)
        {
            Some(group) => group.events.push(event),
            None => groups.push(BatchGroup {
                topic: event.topic,
                operation: event.operation,
                events: vec![event],
            }),
        }
    }

    for group in groups {
        if batch_tx.send(group).await.is_err() {
            debug!("batch consumer receiver dropped");
            return;
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;
    use std::time::Duration;

    fn insert(topic: Topic, id: &str) -> ChangeEvent {
        ChangeEvent {
            topic,
            operation: ChangeOperation::Insert,
            old: None,
            new: Some(json!({ "id": id })),
            timestamp: Utc::now(),
        }
    }

    fn update(topic: Topic, id: &str) -> ChangeEvent {
        ChangeEvent {
            operation: ChangeOperation::Update,
            ..insert(topic, id)
        }
    }

    fn delete(topic: Topic, id: &str) -> ChangeEvent {
        ChangeEvent {
            topic,
            operation: ChangeOperation::Delete,
            old: Some(json!({ "id": id })),
            new: None,
            timestamp: Utc::now(),
        }
    }

    async fn settle() {
        // Past debounce (100ms) + batch delay (250ms).
        tokio::time::sleep(Duration::from_millis(400)).await;
    }

    async fn assert_drained(consumer: &mut BatchConsumer) {
        let outcome = tokio::time::timeout(Duration::from_secs(2), consumer.recv()).await;
        assert!(outcome.is_err(), "expected no further batches");
    }

    #[tokio::test(start_paused = true)]
    async fn burst_of_inserts_is_one_batch() {
        let batcher = UpdateBatcher::new();
        let mut consumer = batcher.register(vec![Topic::Reservations], BatchTiming::default());

        for i in 0..5 {
            batcher.push(insert(Topic::Reservations, &format!("res-{i}"))).await;
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        settle().await;

        let group = consumer.recv().await.unwrap();
        assert_eq!(group.topic, Topic::Reservations);
        assert_eq!(group.operation, ChangeOperation::Insert);
        assert_eq!(group.events.len(), 5);
        assert_eq!(group.events[0].entity_id(), Some("res-0"));
        assert_eq!(group.events[4].entity_id(), Some("res-4"));

        assert_drained(&mut consumer).await;
    }

    #[tokio::test(start_paused = true)]
    async fn update_for_unseen_id_becomes_insert() {
        let batcher = UpdateBatcher::new();
        let mut consumer = batcher.register(vec![Topic::Vehicles], BatchTiming::default());

        batcher.push(update(Topic::Vehicles, "veh-1")).await;
        settle().await;

        let group = consumer.recv().await.unwrap();
        assert_eq!(group.operation, ChangeOperation::Insert);
        assert_eq!(group.events.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn update_for_delivered_id_stays_update() {
        let batcher = UpdateBatcher::new();
        let mut consumer = batcher.register(vec![Topic::Vehicles], BatchTiming::default());

        batcher.push(insert(Topic::Vehicles, "veh-1")).await;
        settle().await;
        assert_eq!(consumer.recv().await.unwrap().operation, ChangeOperation::Insert);

        batcher.push(update(Topic::Vehicles, "veh-1")).await;
        settle().await;

        let group = consumer.recv().await.unwrap();
        assert_eq!(group.operation, ChangeOperation::Update);
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_insert_across_batches_is_dropped() {
        let batcher = UpdateBatcher::new();
        let mut consumer = batcher.register(vec![Topic::Vehicles], BatchTiming::default());

        batcher.push(insert(Topic::Vehicles, "veh-1")).await;
        settle().await;
        assert_eq!(consumer.recv().await.unwrap().events.len(), 1);

        batcher.push(insert(Topic::Vehicles, "veh-1")).await;
        settle().await;

        assert_drained(&mut consumer).await;
    }

    #[tokio::test(start_paused = true)]
    async fn delete_cancels_pending_insert() {
        let batcher = UpdateBatcher::new();
        let mut consumer = batcher.register(vec![Topic::Reservations], BatchTiming::default());

        batcher.push(insert(Topic::Reservations, "res-1")).await;
        batcher.push(insert(Topic::Reservations, "res-2")).await;
        batcher.push(delete(Topic::Reservations, "res-1")).await;
        settle().await;

        let first = consumer.recv().await.unwrap();
        let second = consumer.recv().await.unwrap();
        assert_drained(&mut consumer).await;

        let (inserts, deletes) = if first.operation == ChangeOperation::Insert {
            (first, second)
        } else {
            (second, first)
        };
        assert_eq!(inserts.events.len(), 1);
        assert_eq!(inserts.events[0].entity_id(), Some("res-2"));
        assert_eq!(deletes.operation, ChangeOperation::Delete);
        assert_eq!(deletes.events[0].entity_id(), Some("res-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn groups_split_by_topic_and_operation() {
        let batcher = UpdateBatcher::new();
        let mut consumer = batcher.register(
            vec![Topic::Vehicles, Topic::Reservations],
            BatchTiming::default(),
        );

        batcher.push(insert(Topic::Vehicles, "veh-1")).await;
        batcher.push(insert(Topic::Vehicles, "veh-2")).await;
        batcher.push(insert(Topic::Reservations, "res-1")).await;
        settle().await;

        let first = consumer.recv().await.unwrap();
        let second = consumer.recv().await.unwrap();
        assert_drained(&mut consumer).await;

        let mut sizes: Vec<(Topic, usize)> = vec![
            (first.topic, first.events.len()),
            (second.topic, second.events.len()),
        ];
        sizes.sort_by_key(|(t, _)| *t == Topic::Reservations);
        assert_eq!(sizes, vec![(Topic::Vehicles, 2), (Topic::Reservations, 1)]);
    }

    #[tokio::test(start_paused = true)]
    async fn consumers_only_see_their_topics() {
        let batcher = UpdateBatcher::new();
        let mut consumer = batcher.register(vec![Topic::Vehicles], BatchTiming::default());

        batcher.push(insert(Topic::Reservations, "res-1")).await;
        batcher.push(insert(Topic::Vehicles, "veh-1")).await;
        settle().await;

        let group = consumer.recv().await.unwrap();
        assert_eq!(group.topic, Topic::Vehicles);
        assert_drained(&mut consumer).await;
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_flushes_pending_once() {
        let batcher = UpdateBatcher::new();
        let mut consumer = batcher.register(vec![Topic::Vehicles], BatchTiming::default());

        batcher.push(insert(Topic::Vehicles, "veh-1")).await;
        batcher.push(insert(Topic::Vehicles, "veh-2")).await;
        // Give dispatch a chance to hand the events over, but stay inside
        // the debounce window so nothing has been delivered yet.
        tokio::time::sleep(Duration::from_millis(20)).await;

        consumer.shutdown().await;

        let group = consumer.recv().await.unwrap();
        assert_eq!(group.events.len(), 2);
        assert!(consumer.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn a_new_burst_resets_the_debounce_window() {
        let batcher = UpdateBatcher::new();
        let mut consumer = batcher.register(vec![Topic::Vehicles], BatchTiming::default());

        batcher.push(insert(Topic::Vehicles, "veh-1")).await;
        // Keep poking before the debounce expires; nothing should flush.
        for i in 2..5 {
            tokio::time::sleep(Duration::from_millis(80)).await;
            batcher.push(insert(Topic::Vehicles, &format!("veh-{i}"))).await;
        }
        settle().await;

        let group = consumer.recv().await.unwrap();
        assert_eq!(group.events.len(), 4);
        assert_drained(&mut consumer).await;
    }
}
