//! # Worker Registry & Router
//!
//! Tracks subscribed Processing Workers, their in-flight load, and which
//! worker last served each entity. Routing prefers the affinity worker so
//! per-worker LRU caches stay warm, spilling to the least-loaded worker
//! once the affinity worker is gone or busy past the overload threshold.
//!
//! One lock covers worker records, load counters, and the affinity map;
//! every operation is O(#workers). Affinity is stored as plain
//! `entityID → worker_id` strings, so an evicted or vanished worker simply
//! misses the lookup.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// A worker past this many in-flight requests no longer attracts affinity
/// traffic.
pub const MAX_ACTIVE_REQUESTS: u32 = 32;

/// Registry view of a worker's lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Available,
    Unavailable,
}

/// Everything the Main Worker tracks about one Processing Worker.
#[derive(Debug, Clone)]
pub struct WorkerRecord {
    pub worker_id: String,
    pub status: WorkerStatus,
    /// Master-key generation handed over at subscription.
    pub key_id: String,
    /// Current worker token; attached to forwarded Process calls.
    pub token: String,
    /// Address the Main Worker dials for Process calls.
    pub grpc_address: String,
    pub tags: Vec<String>,
    pub last_seen: DateTime<Utc>,
    pub active_requests: u32,
}

/// Client-visible registry row for the operator surface.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerView {
    pub worker_id: String,
    pub status: WorkerStatus,
    pub active_requests: u32,
    pub last_seen: DateTime<Utc>,
    pub tags: Vec<String>,
}

impl From<&WorkerRecord> for WorkerView {
    fn from(record: &WorkerRecord) -> Self {
        Self {
            worker_id: record.worker_id.clone(),
            status: record.status,
            active_requests: record.active_requests,
            last_seen: record.last_seen,
            tags: record.tags.clone(),
        }
    }
}

#[derive(Default)]
struct RegistryInner {
    workers: HashMap<String, WorkerRecord>,
    /// entityID → worker_id of the last worker to serve it.
    affinity: HashMap<String, String>,
}

/// Shared registry of subscribed workers plus the affinity router.
#[derive(Default)]
pub struct WorkerRegistry {
    inner: RwLock<RegistryInner>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or re-register) a worker as Available. Re-subscription
    /// refreshes every field, including the token.
    pub fn register(
        &self,
        worker_id: &str,
        key_id: &str,
        token: &str,
        grpc_address: &str,
        tags: Vec<String>,
    ) {
        let mut inner = self.inner.write();
        let record = WorkerRecord {
            worker_id: worker_id.to_string(),
            status: WorkerStatus::Available,
            key_id: key_id.to_string(),
            token: token.to_string(),
            grpc_address: grpc_address.to_string(),
            tags,
            last_seen: Utc::now(),
            active_requests: inner
                .workers
                .get(worker_id)
                .map(|w| w.active_requests)
                .unwrap_or(0),
        };
        inner.workers.insert(worker_id.to_string(), record);
    }

    /// Mark a worker Unavailable; it stops receiving traffic but its
    /// affinity entries remain until another worker serves those entities.
    pub fn unregister(&self, worker_id: &str) {
        let mut inner = self.inner.write();
        if let Some(record) = inner.workers.get_mut(worker_id) {
            record.status = WorkerStatus::Unavailable;
        }
    }

    /// Refresh liveness. Returns false for workers the registry does not
    /// know, signalling the caller to re-subscribe.
    pub fn heartbeat(&self, worker_id: &str) -> bool {
        let mut inner = self.inner.write();
        match inner.workers.get_mut(worker_id) {
            Some(record) => {
                record.last_seen = Utc::now();
                record.status = WorkerStatus::Available;
                true
            }
            None => false,
        }
    }

    pub fn increment_load(&self, worker_id: &str) {
        let mut inner = self.inner.write();
        if let Some(record) = inner.workers.get_mut(worker_id) {
            record.active_requests = record.active_requests.saturating_add(1);
        }
    }

    pub fn decrement_load(&self, worker_id: &str) {
        let mut inner = self.inner.write();
        if let Some(record) = inner.workers.get_mut(worker_id) {
            record.active_requests = record.active_requests.saturating_sub(1);
        }
    }

    /// Record that `worker_id` successfully served `entity_id`.
    pub fn update_entity_location(&self, entity_id: &str, worker_id: &str) {
        let mut inner = self.inner.write();
        inner
            .affinity
            .insert(entity_id.to_string(), worker_id.to_string());
    }

    /// The last worker to serve this entity, if it is Available and under
    /// the overload threshold.
    pub fn find_worker_for_entity(&self, entity_id: &str) -> Option<WorkerRecord> {
        let inner = self.inner.read();
        let worker_id = inner.affinity.get(entity_id)?;
        let record = inner.workers.get(worker_id)?;
        if record.status == WorkerStatus::Available && record.active_requests <= MAX_ACTIVE_REQUESTS
        {
            Some(record.clone())
        } else {
            None
        }
    }

    /// The Available worker with the fewest in-flight requests.
    pub fn find_least_loaded_worker(&self) -> Option<WorkerRecord> {
        let inner = self.inner.read();
        inner
            .workers
            .values()
            .filter(|w| w.status == WorkerStatus::Available)
            .min_by_key(|w| w.active_requests)
            .cloned()
    }

    /// Routing decision for one entity operation: affinity first, then
    /// least-loaded, else nothing (caller replies Unavailable).
    pub fn select_worker(&self, entity_id: &str) -> Option<WorkerRecord> {
        self.find_worker_for_entity(entity_id)
            .or_else(|| self.find_least_loaded_worker())
    }

    /// Registry rows for the operator surface, sorted by worker id.
    pub fn list_workers(&self) -> Vec<WorkerView> {
        let inner = self.inner.read();
        let mut views: Vec<WorkerView> = inner.workers.values().map(WorkerView::from).collect();
        views.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));
        views
    }

    /// Mark workers silent for longer than `window` as Unavailable.
    pub fn reap_stale(&self, window: Duration) -> usize {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(window).unwrap_or_else(|_| chrono::Duration::seconds(60));
        let mut inner = self.inner.write();
        let mut reaped = 0;
        for record in inner.workers.values_mut() {
            if record.status == WorkerStatus::Available && record.last_seen < cutoff {
                record.status = WorkerStatus::Unavailable;
                reaped += 1;
                tracing::warn!(worker_id = %record.worker_id, "worker missed heartbeats, marking unavailable");
            }
        }
        reaped
    }

    /// Spawn the heartbeat reaper; runs until `cancel` fires.
    pub fn start_reaper(
        self: Arc<Self>,
        window: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let registry = self;
        let interval = (window / 2).max(Duration::from_secs(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        registry.reap_stale(window);
                    }
                }
            }
        })
    }
}
