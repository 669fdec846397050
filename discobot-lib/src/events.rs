//! Project event bus: persist-then-publish with a DB poller for rows other
//! replicas wrote.
//!
//! Fan-out is per-project over bounded broadcast channels. A slow subscriber
//! loses the oldest queued events (tokio lag semantics); it notices via a
//! gap in the `seq` stream it observes and can replay over the HTTP API.
//! Delivery is at-least-once: a row may arrive both from the direct publish
//! path and from the poller during a race.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::model::ProjectEvent;
use crate::now_ms;
use crate::store::Store;

/// Rows fetched per poller tick.
const POLL_BATCH: i64 = 500;

pub struct EventBroker {
    store: Store,
    subscribers: DashMap<String, broadcast::Sender<ProjectEvent>>,
    buffer: usize,
    poll_interval: Duration,
    retention: Duration,
    /// Highest seq delivered by this process; the poller tails from here.
    last_seq: AtomicI64,
    drops: AtomicU64,
}

impl EventBroker {
    pub async fn new(
        store: Store,
        buffer: usize,
        poll_interval: Duration,
        retention: Duration,
    ) -> Result<Arc<Self>> {
        // Start at the current head: history is replayed on request, not on
        // boot.
        let last_seq = store.max_event_seq().await.unwrap_or(0);
        Ok(Arc::new(Self {
            store,
            subscribers: DashMap::new(),
            buffer,
            poll_interval,
            retention,
            last_seq: AtomicI64::new(last_seq),
            drops: AtomicU64::new(0),
        }))
    }

    /// Persist the event (assigning `seq`), then hand the stored row to
    /// every in-process subscriber of the project.
    pub async fn publish(
        &self,
        project_id: &str,
        event_type: &str,
        data: &serde_json::Value,
    ) -> Result<ProjectEvent> {
        let event = self
            .store
            .create_project_event(project_id, event_type, data)
            .await?;
        self.deliver(&event);
        Ok(event)
    }

    fn deliver(&self, event: &ProjectEvent) {
        self.last_seq.fetch_max(event.seq, Ordering::SeqCst);
        if let Some(tx) = self.subscribers.get(&event.project_id) {
            // No receivers is fine; the log is the source of truth.
            let _ = tx.send(event.clone());
        }
    }

    /// Live feed for one project. Buffer overflow drops the oldest queued
    /// events for that receiver (visible as a seq gap).
    pub fn subscribe(&self, project_id: &str) -> broadcast::Receiver<ProjectEvent> {
        self.subscribers
            .entry(project_id.to_string())
            .or_insert_with(|| broadcast::channel(self.buffer).0)
            .subscribe()
    }

    /// Called by subscribers when they observe lag.
    pub fn record_drop(&self, missed: u64) {
        self.drops.fetch_add(missed, Ordering::Relaxed);
    }

    pub fn dropped_events(&self) -> u64 {
        self.drops.load(Ordering::Relaxed)
    }

    /// One poller pass: fan out rows that other processes appended.
    pub async fn poll_once(&self) -> Result<usize> {
        let last = self.last_seq.load(Ordering::SeqCst);
        let events = self.store.list_events_after_seq(last, POLL_BATCH).await?;
        let count = events.len();
        for event in &events {
            self.deliver(event);
        }
        Ok(count)
    }

    /// Poll the log until shutdown. Gives multi-replica deployments correct
    /// fan-out without a pub/sub sidecar.
    pub async fn run_poller(self: Arc<Self>, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = ticker.tick() => {
                    if let Err(err) = self.poll_once().await {
                        tracing::warn!(error = %err, "event poller pass failed");
                    }
                }
            }
        }
    }

    /// Hourly age-based GC of the event log.
    pub async fn run_retention_gc(self: Arc<Self>, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(Duration::from_secs(3600));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = ticker.tick() => {
                    let cutoff = now_ms() - self.retention.as_millis() as i64;
                    match self.store.delete_events_older_than(cutoff).await {
                        Ok(0) => {}
                        Ok(n) => tracing::info!(deleted = n, "event retention GC"),
                        Err(err) => tracing::warn!(error = %err, "event retention GC failed"),
                    }
                }
            }
        }
    }
}
