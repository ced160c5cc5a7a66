//! Ordered, de-duplicated buffer of pending remote writes.
//!
//! At most one item per key is pending: enqueuing a key that is already
//! waiting replaces its payload in place, so distinct keys keep their FIFO
//! position and each key only ever ships its latest value.
//!
//! A clear is queued like any other write, as a `null` payload. It replaces
//! whatever was waiting for the key, and because pushes for one key go out in
//! stamp order, a clear issued after a write is always the last thing the
//! remote sees, even when that write was already inside a running drain.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use log::{debug, info, warn};
use parking_lot::Mutex;
use serde_json::Value as JsonValue;
use tokio::sync::broadcast;

use crate::cache_entry::QueueItem;
use crate::clock::Clock;
use crate::local_cache::LocalCache;
use crate::remote_store::RemoteStore;

/// Logical time of a queue mutation. Ordered by timestamp, then sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct QueueStamp {
    pub at: i64,
    pub seq: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum QueueEvent {
    /// The payload enqueued at `stamp` reached the remote store.
    Delivered { key: String, stamp: QueueStamp },
    /// The push failed; the item is back in the queue.
    Failed { key: String, error: String },
    /// A newer write or clear replaced the payload enqueued at `stamp`
    /// before it was pushed.
    Superseded { key: String, stamp: QueueStamp },
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct DrainReport {
    /// Drain did not run because another one was in progress. That drain
    /// takes the request over.
    pub skipped: bool,
    pub attempted: usize,
    pub delivered: Vec<String>,
    pub failed: Vec<String>,
    pub superseded: Vec<String>,
}

impl DrainReport {
    fn absorb(&mut self, round: DrainReport) {
        self.attempted += round.attempted;
        self.delivered.extend(round.delivered);
        self.failed.extend(round.failed);
        self.superseded.extend(round.superseded);
    }
}

#[derive(Debug, Clone)]
struct Pending {
    item: QueueItem,
    seq: u64,
}

impl Pending {
    fn stamp(&self) -> QueueStamp {
        QueueStamp {
            at: self.item.enqueued_at,
            seq: self.seq,
        }
    }
}

#[derive(Default)]
struct QueueState {
    waiting: Vec<Pending>,
    in_flight: Vec<Pending>,
    next_seq: u64,
}

impl QueueState {
    fn next_stamp(&mut self, at: i64) -> QueueStamp {
        self.next_seq += 1;
        QueueStamp {
            at,
            seq: self.next_seq,
        }
    }

    fn has_waiting(&self, key: &str) -> bool {
        self.waiting.iter().any(|p| p.item.key == key)
    }

    /// Everything not yet delivered, latest payload per key.
    fn snapshot(&self) -> Vec<QueueItem> {
        let mut items: Vec<QueueItem> = self
            .in_flight
            .iter()
            .filter(|p| !self.has_waiting(&p.item.key))
            .map(|p| p.item.clone())
            .collect();
        items.extend(self.waiting.iter().map(|p| p.item.clone()));
        items
    }
}

pub struct SyncQueue {
    state: Mutex<QueueState>,
    drain_guard: tokio::sync::Mutex<()>,
    drain_requested: AtomicBool,
    drain_runs: AtomicUsize,
    events: broadcast::Sender<QueueEvent>,
    cache: Arc<LocalCache>,
    clock: Arc<dyn Clock>,
}

impl SyncQueue {
    /// Builds the queue and restores any snapshot persisted in `cache`.
    pub fn new(cache: Arc<LocalCache>, clock: Arc<dyn Clock>, event_buffer: usize) -> Self {
        let (events, _) = broadcast::channel(event_buffer.max(1));

        let mut state = QueueState::default();
        for item in cache.load_queue() {
            state.next_seq += 1;
            state.waiting.push(Pending {
                item,
                seq: state.next_seq,
            });
        }
        if !state.waiting.is_empty() {
            info!("Restored {} pending sync item(s)", state.waiting.len());
        }

        Self {
            state: Mutex::new(state),
            drain_guard: tokio::sync::Mutex::new(()),
            drain_requested: AtomicBool::new(false),
            drain_runs: AtomicUsize::new(0),
            events,
            cache,
            clock,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.events.subscribe()
    }

    /// Inserts or replaces the pending write for `key`.
    pub fn enqueue(&self, key: &str, payload: JsonValue) -> QueueStamp {
        let now = self.clock.now_millis();
        let (stamp, snapshot) = {
            let mut state = self.state.lock();
            let stamp = state.next_stamp(now);
            let pending = Pending {
                item: QueueItem {
                    key: key.to_string(),
                    payload,
                    enqueued_at: now,
                },
                seq: stamp.seq,
            };
            match state.waiting.iter_mut().find(|p| p.item.key == key) {
                Some(existing) => *existing = pending,
                None => state.waiting.push(pending),
            }
            (stamp, state.snapshot())
        };
        debug!("Enqueued '{key}' at {}", stamp.at);
        self.cache.save_queue(&snapshot);
        stamp
    }

    /// Replaces any pending write for `key` with a remote clear.
    ///
    /// Writes stamped before the returned stamp are never re-enqueued after a
    /// failed push, and the clear itself is delivered after any of them that
    /// are already in flight.
    pub fn enqueue_clear(&self, key: &str) -> QueueStamp {
        self.enqueue(key, JsonValue::Null)
    }

    pub fn pending(&self, key: &str) -> Option<QueueItem> {
        self.state
            .lock()
            .waiting
            .iter()
            .find(|p| p.item.key == key)
            .map(|p| p.item.clone())
    }

    /// Whether the remote copy of `key` is behind the queue: a write or clear
    /// is waiting or being pushed.
    pub fn has_unsent(&self, key: &str) -> bool {
        let state = self.state.lock();
        state.has_waiting(key) || state.in_flight.iter().any(|p| p.item.key == key)
    }

    pub fn pending_keys(&self) -> Vec<String> {
        self.state
            .lock()
            .waiting
            .iter()
            .map(|p| p.item.key.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.state.lock().waiting.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of drain rounds that found items to deliver.
    pub fn drain_runs(&self) -> usize {
        self.drain_runs.load(Ordering::SeqCst)
    }

    /// Attempts delivery of every pending write.
    ///
    /// Only one drain runs at a time. A caller that finds one running leaves
    /// a request behind and returns `skipped`; the running drain goes around
    /// again for it, and re-checks for requests after releasing its guard so
    /// none is stranded. A round with failures ends the loop unless a new
    /// request arrived meanwhile.
    pub async fn drain(&self, remote: &dyn RemoteStore) -> DrainReport {
        self.drain_requested.store(true, Ordering::SeqCst);
        let mut report = DrainReport {
            skipped: true,
            ..DrainReport::default()
        };

        loop {
            let Ok(guard) = self.drain_guard.try_lock() else {
                debug!("Drain already in progress; request handed over");
                return report;
            };
            report.skipped = false;

            while self.drain_requested.swap(false, Ordering::SeqCst) {
                let round = self.drain_round(remote).await;
                let failed = !round.failed.is_empty();
                report.absorb(round);
                if failed {
                    break;
                }
            }

            drop(guard);
            if !self.drain_requested.load(Ordering::SeqCst) {
                return report;
            }
        }
    }

    /// One pass over a snapshot of the queue. Writes enqueued while it runs
    /// stay queued for the next pass. Failed items go back to the front
    /// unless a newer payload for the same key arrived meanwhile.
    async fn drain_round(&self, remote: &dyn RemoteStore) -> DrainReport {
        let batch = {
            let mut state = self.state.lock();
            let batch = std::mem::take(&mut state.waiting);
            state.in_flight = batch.clone();
            batch
        };
        let mut report = DrainReport::default();
        if batch.is_empty() {
            return report;
        }
        self.drain_runs.fetch_add(1, Ordering::SeqCst);

        let mut failed = Vec::new();
        for pending in batch {
            let key = pending.item.key.clone();
            let superseded = self.state.lock().has_waiting(&key);
            if superseded {
                self.settle(&pending);
                self.notify(QueueEvent::Superseded {
                    key: key.clone(),
                    stamp: pending.stamp(),
                });
                report.superseded.push(key);
                continue;
            }

            report.attempted += 1;
            let result = remote
                .push(&key, &pending.item.payload, pending.item.enqueued_at)
                .await;

            match result {
                Ok(()) => {
                    self.settle(&pending);
                    self.notify(QueueEvent::Delivered {
                        key: key.clone(),
                        stamp: pending.stamp(),
                    });
                    report.delivered.push(key);
                }
                Err(e) => {
                    warn!("Push of '{key}' failed, will retry: {e}");
                    self.notify(QueueEvent::Failed {
                        key: key.clone(),
                        error: e.to_string(),
                    });
                    report.failed.push(key);
                    failed.push(pending);
                }
            }
        }

        let snapshot = {
            let mut state = self.state.lock();
            let mut restored: Vec<Pending> = failed
                .into_iter()
                .filter(|p| !state.has_waiting(&p.item.key))
                .collect();
            restored.append(&mut state.waiting);
            state.waiting = restored;
            state.in_flight.clear();
            state.snapshot()
        };
        self.cache.save_queue(&snapshot);

        info!(
            "Drain round finished: {} delivered, {} failed, {} superseded",
            report.delivered.len(),
            report.failed.len(),
            report.superseded.len()
        );
        report
    }

    fn settle(&self, pending: &Pending) {
        let snapshot = {
            let mut state = self.state.lock();
            state.in_flight.retain(|p| p.seq != pending.seq);
            state.snapshot()
        };
        self.cache.save_queue(&snapshot);
    }

    fn notify(&self, event: QueueEvent) {
        // no receivers is fine
        let _ = self.events.send(event);
    }
}
