//! Invalidation cascade: a new source document purges everything derived
//! from it, locally and remotely, and tells live controllers to reload.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::{debug, info, warn};
use tokio::sync::broadcast;

use crate::cache_entry::{ClearSignal, DocumentKind, DocumentStatus};
use crate::clock::Clock;
use crate::connectivity::ConnectivityMonitor;
use crate::local_cache::LocalCache;
use crate::remote_store::RemoteStore;
use crate::sync_queue::{QueueStamp, SyncQueue};

/// Cross-consumer notifications published by the broadcaster.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// Keys purged at `cleared_at`, each with the queue stamp of its clear.
    /// Controllers for them must reload unless they wrote after that stamp.
    Invalidated {
        document_kind: Option<DocumentKind>,
        cleared: Vec<(String, QueueStamp)>,
        cleared_at: i64,
    },
    /// Periodic reconciliation tick.
    RefreshRequested,
}

impl SyncEvent {
    /// Stamp of the clear this event carries for `key`.
    pub fn cleared_stamp(&self, key: &str) -> Option<QueueStamp> {
        match self {
            SyncEvent::Invalidated { cleared, .. } => cleared
                .iter()
                .find(|(k, _)| k == key)
                .map(|(_, stamp)| *stamp),
            SyncEvent::RefreshRequested => None,
        }
    }
}

/// Static table of which cache keys are derived from which document.
#[derive(Debug, Clone, PartialEq)]
pub struct InvalidationMap {
    dependents: HashMap<DocumentKind, Vec<String>>,
}

impl Default for InvalidationMap {
    fn default() -> Self {
        let table: [(DocumentKind, &[&str]); 4] = [
            (
                DocumentKind::Cv,
                &[
                    "cv_analysis",
                    "skills_analysis",
                    "career_orientation",
                    "compatibility_analysis",
                    "action_plan",
                    "interview_preparation",
                ],
            ),
            (
                DocumentKind::OffreEmploi,
                &[
                    "job_offer_analysis",
                    "compatibility_analysis",
                    "action_plan",
                    "interview_preparation",
                ],
            ),
            (
                DocumentKind::MetierSouhaite,
                &["career_orientation", "action_plan"],
            ),
            (
                DocumentKind::Questionnaire,
                &["questionnaire_analysis", "career_orientation", "action_plan"],
            ),
        ];

        let dependents = table
            .into_iter()
            .map(|(kind, keys)| (kind, keys.iter().map(|k| k.to_string()).collect()))
            .collect();
        Self { dependents }
    }
}

impl InvalidationMap {
    pub fn empty() -> Self {
        Self {
            dependents: HashMap::new(),
        }
    }

    /// Replaces the dependent set of `kind`.
    pub fn with_dependents<I, S>(mut self, kind: DocumentKind, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependents
            .insert(kind, keys.into_iter().map(Into::into).collect());
        self
    }

    pub fn dependents(&self, kind: DocumentKind) -> &[String] {
        self.dependents
            .get(&kind)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct InvalidationReport {
    pub document_kind: Option<DocumentKind>,
    pub keys: Vec<String>,
    pub cleared_at: i64,
    /// Remote `clear_local_storage` answer. `None` when the remote was not
    /// reached (offline or failed).
    pub remote_acknowledged: Option<bool>,
}

pub struct InvalidationBroadcaster {
    map: InvalidationMap,
    cache: Arc<LocalCache>,
    queue: Arc<SyncQueue>,
    remote: Arc<dyn RemoteStore>,
    connectivity: Arc<ConnectivityMonitor>,
    clock: Arc<dyn Clock>,
    events: broadcast::Sender<SyncEvent>,
    /// Bumped when a purge starts and again when it has been published.
    generation: AtomicU64,
}

impl InvalidationBroadcaster {
    pub fn new(
        map: InvalidationMap,
        cache: Arc<LocalCache>,
        queue: Arc<SyncQueue>,
        remote: Arc<dyn RemoteStore>,
        connectivity: Arc<ConnectivityMonitor>,
        clock: Arc<dyn Clock>,
        event_buffer: usize,
    ) -> Self {
        let (events, _) = broadcast::channel(event_buffer.max(1));
        Self {
            map,
            cache,
            queue,
            remote,
            connectivity,
            clock,
            events,
            generation: AtomicU64::new(0),
        }
    }

    pub fn map(&self) -> &InvalidationMap {
        &self.map
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    pub fn publish(&self, event: SyncEvent) {
        let _ = self.events.send(event);
    }

    /// Changes whenever a purge is running or has just completed. A remote
    /// read that spans a change may have fetched a copy the purge removed.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Runs the cascade for `current` only when it is a different document
    /// than `previous`. Re-submitting the same file purges nothing.
    pub async fn on_document_uploaded(
        &self,
        kind: DocumentKind,
        previous: Option<&DocumentStatus>,
        current: &DocumentStatus,
    ) -> Option<InvalidationReport> {
        if previous.is_some_and(|prev| prev.same_document(current)) {
            debug!("Same {kind} document re-submitted; no invalidation");
            return None;
        }
        Some(self.invalidate_document(kind).await)
    }

    /// Purges every key derived from `kind`.
    ///
    /// Local clears and queued remote clears happen first. When online the
    /// remote is then notified best-effort and the queued clears are
    /// flushed, so a reload cannot fetch the purged copies back. Live
    /// controllers are told to reload last.
    pub async fn invalidate_document(&self, kind: DocumentKind) -> InvalidationReport {
        let keys = self.map.dependents(kind).to_vec();
        let (cleared, cleared_at) = self.purge_locally(Some(kind), &keys);

        let remote_acknowledged = if self.connectivity.is_online() {
            let ack = match self.remote.request_invalidation(kind).await {
                Ok(ack) => Some(ack),
                Err(e) => {
                    warn!("Remote invalidation for {kind} failed: {e}");
                    None
                }
            };
            self.queue.drain(self.remote.as_ref()).await;
            ack
        } else {
            debug!("Offline; remote invalidation for {kind} deferred to the queue");
            None
        };

        self.finish(Some(kind), cleared, cleared_at);
        info!("Invalidated {} key(s) derived from {kind}", keys.len());

        InvalidationReport {
            document_kind: Some(kind),
            keys,
            cleared_at,
            remote_acknowledged,
        }
    }

    /// Purges an explicit key list without contacting the remote. The queued
    /// clears go out with the next drain.
    pub fn invalidate_keys(&self, keys: &[String]) -> i64 {
        let (cleared, cleared_at) = self.purge_locally(None, keys);
        self.finish(None, cleared, cleared_at);
        cleared_at
    }

    fn purge_locally(
        &self,
        kind: Option<DocumentKind>,
        keys: &[String],
    ) -> (Vec<(String, QueueStamp)>, i64) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        let cleared = keys
            .iter()
            .map(|key| {
                self.cache.clear(key);
                (key.clone(), self.queue.enqueue_clear(key))
            })
            .collect();
        let cleared_at = self.clock.now_millis();
        self.cache.write_clear_signal(&ClearSignal {
            document_kind: kind,
            keys: keys.to_vec(),
            cleared_at,
        });
        (cleared, cleared_at)
    }

    fn finish(
        &self,
        document_kind: Option<DocumentKind>,
        cleared: Vec<(String, QueueStamp)>,
        cleared_at: i64,
    ) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.publish(SyncEvent::Invalidated {
            document_kind,
            cleared,
            cleared_at,
        });
    }
}
