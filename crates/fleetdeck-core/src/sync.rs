// ── Sync service ──
//
// Wires the pipeline together: ConnectionManager subscriptions feed the
// UpdateBatcher, whose delivered batches are decoded and folded into the
// LiveStore. Explicit init()/teardown() lifecycle; constructed from
// config plus injected collaborators, no module-level state.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use fleetdeck_api::{
    ConnectionHealth, ConnectionManager, EventSource, Persistence, SubscribeOptions,
    SubscriptionStatus, Topic,
};

use crate::availability::AvailabilityEngine;
use crate::batcher::{BatchConsumer, UpdateBatcher};
use crate::config::SyncConfig;
use crate::convert;
use crate::error::CoreError;
use crate::model::{Reservation, Vehicle};
use crate::store::LiveStore;

/// Owns the live synchronization pipeline for one dashboard session.
pub struct SyncService {
    config: SyncConfig,
    connections: ConnectionManager,
    batcher: UpdateBatcher,
    store: Arc<LiveStore>,
    availability: Arc<AvailabilityEngine>,
    persistence: Option<Arc<dyn Persistence>>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    initialized: AtomicBool,
}

impl SyncService {
    pub fn new(config: SyncConfig, source: Arc<dyn EventSource>) -> Self {
        let store = Arc::new(LiveStore::new());
        Self {
            connections: ConnectionManager::new(source),
            batcher: UpdateBatcher::new(),
            availability: Arc::new(AvailabilityEngine::new(Arc::clone(&store))),
            store,
            persistence: None,
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
            initialized: AtomicBool::new(false),
            config,
        }
    }

    /// Attach a persistence client, enabling manual refresh.
    #[must_use]
    pub fn with_persistence(mut self, persistence: Arc<dyn Persistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    /// Subscribe the configured topics and start the pipeline tasks.
    /// Idempotent: a second call is a no-op.
    pub fn init(&self) {
        if self.initialized.swap(true, Ordering::SeqCst) {
            warn!("sync service already initialized");
            return;
        }

        let options = SubscribeOptions {
            heartbeat_interval: self.config.heartbeat_interval,
            reconnect: self.config.reconnect.clone(),
        };

        let mut tasks = Vec::new();
        for &topic in &self.config.topics {
            let mut handle = self.connections.subscribe_with(topic, None, options.clone());
            let feed = self.batcher.sender();
            let cancel = self.cancel.clone();

            // Pump: subscription events into the batcher.
            tasks.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        biased;
                        () = cancel.cancelled() => break,
                        maybe = handle.recv() => {
                            let Some(event) = maybe else { break };
                            if feed.send(event).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            }));

            // Degraded-mode watch: a Failed subscription is logged once so
            // operators know live updates stopped; health() carries it too.
            if let Some(mut status) = self.connections.subscription_status(topic, None) {
                let cancel = self.cancel.clone();
                tasks.push(tokio::spawn(async move {
                    loop {
                        tokio::select! {
                            biased;
                            () = cancel.cancelled() => break,
                            changed = status.changed() => {
                                if changed.is_err() {
                                    break;
                                }
                                if *status.borrow_and_update() == SubscriptionStatus::Failed {
                                    warn!(%topic, "live updates degraded, falling back to manual refresh");
                                }
                            }
                        }
                    }
                }));
            }
        }

        // Apply: delivered batches into the store.
        let consumer = self
            .batcher
            .register(self.config.topics.clone(), self.config.batch);
        let store = Arc::clone(&self.store);
        tasks.push(tokio::spawn(apply_batches(consumer, store)));

        self.tasks.lock().unwrap_or_else(std::sync::PoisonError::into_inner).extend(tasks);
        info!(topics = self.config.topics.len(), "sync service initialized");
    }

    pub fn store(&self) -> Arc<LiveStore> {
        Arc::clone(&self.store)
    }

    pub fn availability(&self) -> Arc<AvailabilityEngine> {
        Arc::clone(&self.availability)
    }

    pub fn health(&self) -> ConnectionHealth {
        self.connections.health()
    }

    pub fn last_synced(&self) -> Option<DateTime<Utc>> {
        self.store.last_synced()
    }

    /// Manually reconnect one topic's subscription after it failed.
    pub async fn reconnect(&self, topic: Topic) -> bool {
        self.connections.reconnect(topic, None).await
    }

    /// Pull a full snapshot through persistence and replace the store.
    /// The degraded-mode fallback when live updates have failed.
    pub async fn refresh(&self) -> Result<(), CoreError> {
        let Some(persistence) = &self.persistence else {
            return Err(CoreError::Persistence {
                message: "manual refresh requires a persistence client".into(),
            });
        };

        let vehicle_rows = persistence.select("vehicles", None).await?;
        let reservation_rows = persistence.select("reservations", None).await?;

        let vehicles = decode_rows::<Vehicle>("vehicles", vehicle_rows);
        let reservations = decode_rows::<Reservation>("reservations", reservation_rows);
        info!(
            vehicles = vehicles.len(),
            reservations = reservations.len(),
            "manual refresh applied"
        );
        self.store.apply_snapshot(vehicles, reservations);
        Ok(())
    }

    /// Stop every pipeline task, flush the batcher, and tear the
    /// connection manager down.
    pub async fn teardown(&self) {
        self.cancel.cancel();
        self.connections.teardown().await;
        self.batcher.teardown().await;

        let tasks: Vec<JoinHandle<()>> = std::mem::take(
            &mut *self.tasks.lock().unwrap_or_else(std::sync::PoisonError::into_inner),
        );
        for task in tasks {
            let _ = task.await;
        }
        info!("sync service torn down");
    }

    /// How stale the dashboard's data is, if it ever synced.
    pub fn data_age(&self) -> Option<chrono::Duration> {
        self.store.data_age()
    }
}

async fn apply_batches(mut consumer: BatchConsumer, store: Arc<LiveStore>) {
    while let Some(group) = consumer.recv().await {
        for event in &group.events {
            match convert::decode(event) {
                Ok(change) => store.apply(change),
                // One bad payload never kills the loop.
                Err(e) => warn!(topic = %group.topic, error = %e, "skipping undecodable event"),
            }
        }
    }
}

fn decode_rows<T: serde::de::DeserializeOwned>(
    collection: &str,
    rows: Vec<serde_json::Value>,
) -> Vec<T> {
    rows.into_iter()
        .filter_map(|row| match serde_json::from_value(row) {
            Ok(entity) => Some(entity),
            Err(e) => {
                warn!(collection, error = %e, "skipping undecodable row");
                None
            }
        })
        .collect()
}
