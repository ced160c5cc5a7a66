//! Per-key controller exposing one logical value with read-through caching
//! and write-through queuing.
//!
//! A controller serves the local copy as soon as it has one and reconciles
//! with the remote store in the background. `update` commits optimistically
//! to memory and the local cache, then hands the value to the sync queue;
//! it never fails from the caller's point of view.
//!
//! ```no_run
//! use std::sync::Arc;
//! use persistent_sync_core::config::SyncConfig;
//! use persistent_sync_core::persistent_value::PersistentValue;
//! use persistent_sync_core::remote_store::HttpRemoteStore;
//! use persistent_sync_core::sync_manager::SyncManager;
//!
//! # async fn run() -> Result<(), persistent_sync_core::app_error::SyncError> {
//! let config = SyncConfig::default();
//! let remote = Arc::new(HttpRemoteStore::new(&config)?);
//! let manager = SyncManager::new(config, remote)?;
//! manager.init();
//!
//! let history = PersistentValue::<Vec<String>>::mount(&manager, "chat_history", Some(Vec::new()));
//! history.ready().await;
//! history.update(vec!["Bonjour".to_string()]);
//! # Ok(())
//! # }
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use log::{debug, warn};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::invalidation::SyncEvent;
use crate::sync_manager::SyncManager;
use crate::sync_queue::{QueueEvent, QueueStamp};

/// Pulls repeated because a purge overlapped them, before giving up.
const MAX_PULL_ATTEMPTS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadState {
    Loading,
    Ready,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteState {
    Clean,
    /// A local write has not been confirmed by the remote store yet.
    Dirty,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueSource {
    Initial,
    LocalCache,
    Remote,
    Update,
}

/// Everything a consumer renders: the value, or a loading indicator, or an
/// explicit empty state.
#[derive(Debug, Clone, PartialEq)]
pub struct ValueState<T> {
    /// `None` only when local, remote and initial value are all missing.
    pub value: Option<T>,
    pub load: LoadState,
    pub write: WriteState,
    pub source: ValueSource,
    /// A remote reconciliation is in flight.
    pub reconciling: bool,
    /// Most recent recovered failure, kept for display and diagnostics.
    pub last_error: Option<String>,
}

impl<T> ValueState<T> {
    pub fn is_loading(&self) -> bool {
        self.load == LoadState::Loading
    }

    pub fn is_empty(&self) -> bool {
        self.load == LoadState::Ready && self.value.is_none()
    }
}

pub struct PersistentValue<T> {
    key: String,
    initial: Option<T>,
    manager: Arc<SyncManager>,
    state: watch::Sender<ValueState<T>>,
    /// Bumped by every local mutation; a pull that started under an older
    /// sequence must not overwrite the value.
    write_seq: AtomicU64,
    last_stamp: Mutex<Option<QueueStamp>>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl<T> PersistentValue<T>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    /// Creates the controller for `key` and starts its load sequence.
    ///
    /// A fresh local entry is served before this returns; reconciliation
    /// with the remote store continues in the background.
    pub fn mount(manager: &Arc<SyncManager>, key: impl Into<String>, initial: Option<T>) -> Arc<Self> {
        let (state, _) = watch::channel(ValueState {
            value: None,
            load: LoadState::Loading,
            write: WriteState::Clean,
            source: ValueSource::Initial,
            // the mount-time reconcile is pending
            reconciling: true,
            last_error: None,
        });

        let controller = Arc::new(Self {
            key: key.into(),
            initial,
            manager: Arc::clone(manager),
            state,
            write_seq: AtomicU64::new(0),
            last_stamp: Mutex::new(None),
            listener: Mutex::new(None),
        });

        controller.load_local();
        let listener = Self::spawn_listener(&controller);
        *controller.listener.lock() = Some(listener);

        let background = Arc::clone(&controller);
        tokio::spawn(async move {
            background.reconcile().await;
        });

        controller
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn value(&self) -> Option<T> {
        self.state.borrow().value.clone()
    }

    pub fn state(&self) -> ValueState<T> {
        self.state.borrow().clone()
    }

    pub fn is_loading(&self) -> bool {
        self.state.borrow().is_loading()
    }

    pub fn subscribe(&self) -> watch::Receiver<ValueState<T>> {
        self.state.subscribe()
    }

    /// Waits until the controller leaves `Loading`.
    pub async fn ready(&self) -> ValueState<T> {
        self.wait_for(|s| s.load == LoadState::Ready).await
    }

    /// Waits until the controller is ready and no reconciliation is in flight.
    pub async fn settled(&self) -> ValueState<T> {
        self.wait_for(|s| s.load == LoadState::Ready && !s.reconciling)
            .await
    }

    async fn wait_for(&self, done: impl FnMut(&ValueState<T>) -> bool) -> ValueState<T> {
        let mut rx = self.state.subscribe();
        let state = match rx.wait_for(done).await {
            Ok(state) => state.clone(),
            Err(_) => self.state(),
        };
        state
    }

    /// Optimistic commit: memory, then local cache, then the sync queue.
    pub fn update(&self, value: T) {
        self.write_seq.fetch_add(1, Ordering::SeqCst);
        self.state.send_modify(|s| {
            s.value = Some(value.clone());
            s.load = LoadState::Ready;
            s.write = WriteState::Dirty;
            s.source = ValueSource::Update;
        });

        let cache = self.manager.local_cache();
        cache.write(&self.key, &value);

        match serde_json::to_value(&value) {
            Ok(payload) => {
                let stamp = self.manager.queue().enqueue(&self.key, payload);
                *self.last_stamp.lock() = Some(stamp);
                self.manager.schedule_drain();
            }
            Err(e) => {
                warn!("Value of '{}' is not serializable; kept local only: {e}", self.key);
                self.record_error(e.to_string());
            }
        }
    }

    /// Re-pulls from the remote store, bypassing local freshness.
    ///
    /// Pending writes and clears for the key are flushed first so the pull
    /// cannot regress to an older remote copy. Returns whether the remote
    /// value was applied.
    pub async fn refresh(&self) -> bool {
        let online = self.manager.connectivity().is_online();
        if online && (self.is_dirty() || self.manager.queue().has_unsent(&self.key)) {
            self.manager.drain_until_settled().await;
            self.sync_write_state();
        }
        if self.is_dirty() {
            debug!("'{}' still has unsent writes; refresh keeps the local value", self.key);
            return false;
        }
        self.reconcile().await
    }

    /// Resets memory to the initial value and drops the local entry.
    /// The remote copy is left alone.
    pub fn clear(&self) {
        self.write_seq.fetch_add(1, Ordering::SeqCst);
        self.manager.local_cache().clear(&self.key);
        *self.last_stamp.lock() = None;
        let initial = self.initial.clone();
        self.state.send_modify(|s| {
            s.value = initial;
            s.load = LoadState::Ready;
            s.write = WriteState::Clean;
            s.source = ValueSource::Initial;
            s.last_error = None;
        });
    }

    /// Stops listening for invalidation and delivery events.
    pub fn dispose(&self) {
        if let Some(listener) = self.listener.lock().take() {
            listener.abort();
        }
    }

    fn is_dirty(&self) -> bool {
        self.state.borrow().write == WriteState::Dirty
    }

    /// Recomputes `write` from the queue itself, for when delivery events
    /// were missed.
    fn sync_write_state(&self) {
        if self.is_dirty() && !self.manager.queue().has_unsent(&self.key) {
            self.state.send_modify(|s| s.write = WriteState::Clean);
        }
    }

    fn load_local(&self) {
        if let Some(entry) = self.manager.local_cache().read_entry::<T>(&self.key) {
            debug!("'{}' served from local cache", self.key);
            self.state.send_modify(|s| {
                s.value = Some(entry.value);
                s.load = LoadState::Ready;
                s.source = ValueSource::LocalCache;
            });
        }
    }

    /// Pulls the remote copy. Failures keep whatever is shown and fall back
    /// to the initial value when nothing is shown yet.
    ///
    /// While the queue still holds a write or clear for the key the remote
    /// copy is behind, so nothing is pulled. A pull that overlapped a purge
    /// is repeated, since it may have fetched a copy the purge removed.
    async fn reconcile(&self) -> bool {
        if !self.manager.connectivity().is_online() {
            debug!("Offline; '{}' not reconciled", self.key);
            self.finish_loading();
            return false;
        }
        let queue = self.manager.queue();
        if queue.has_unsent(&self.key) {
            debug!("'{}' has unsent queue items; remote copy not pulled", self.key);
            self.finish_loading();
            return false;
        }

        let seq = self.write_seq.load(Ordering::SeqCst);
        self.state.send_modify(|s| s.reconciling = true);

        let invalidation = self.manager.invalidation();
        let mut attempts = 0;
        let (result, stale) = loop {
            attempts += 1;
            let generation = invalidation.generation();
            let result = self.manager.remote().pull(&self.key).await;
            let purged = invalidation.generation() != generation;
            if purged && attempts < MAX_PULL_ATTEMPTS {
                debug!("Purge overlapped the pull of '{}'; pulling again", self.key);
                continue;
            }
            break (result, purged || queue.has_unsent(&self.key));
        };
        let raced = self.write_seq.load(Ordering::SeqCst) != seq;

        let applied = match result {
            Ok(Some(json)) => match serde_json::from_value::<T>(json) {
                Ok(_) if raced || stale || self.is_dirty() => {
                    debug!("Remote copy of '{}' predates a local write; ignored", self.key);
                    false
                }
                Ok(value) => {
                    self.manager.local_cache().write(&self.key, &value);
                    self.state.send_modify(|s| {
                        s.value = Some(value);
                        s.load = LoadState::Ready;
                        s.source = ValueSource::Remote;
                        s.last_error = None;
                    });
                    true
                }
                Err(e) => {
                    warn!("Remote copy of '{}' has an unexpected shape: {e}", self.key);
                    self.record_error(e.to_string());
                    false
                }
            },
            Ok(None) => {
                debug!("Remote has nothing for '{}'", self.key);
                false
            }
            Err(e) => {
                warn!("Pull of '{}' failed; keeping local state: {e}", self.key);
                self.record_error(e.to_string());
                false
            }
        };

        self.finish_loading();
        applied
    }

    /// Leaves `Loading`, falling back to the initial value if nothing was found.
    fn finish_loading(&self) {
        let initial = &self.initial;
        self.state.send_modify(|s| {
            s.reconciling = false;
            if s.load == LoadState::Loading {
                s.load = LoadState::Ready;
                if s.value.is_none() {
                    s.value = initial.clone();
                    s.source = ValueSource::Initial;
                }
            }
        });
    }

    fn record_error(&self, error: String) {
        self.state.send_modify(|s| s.last_error = Some(error));
    }

    /// An invalidation purged this key: forget the value and rerun the load
    /// sequence, unless a local write postdates the clear.
    async fn on_invalidated(&self, cleared: QueueStamp) {
        let mine = *self.last_stamp.lock();
        if mine.is_some_and(|mine| mine > cleared) {
            debug!("'{}' was written after its invalidation; kept", self.key);
            return;
        }

        self.write_seq.fetch_add(1, Ordering::SeqCst);
        *self.last_stamp.lock() = None;
        self.state.send_modify(|s| {
            s.value = None;
            s.load = LoadState::Loading;
            s.write = WriteState::Clean;
            s.source = ValueSource::Initial;
        });
        self.load_local();
        self.reconcile().await;
    }

    fn on_queue_event(&self, event: QueueEvent) {
        let (key, stamp) = match event {
            QueueEvent::Delivered { key, stamp } => (key, stamp),
            QueueEvent::Failed { key, error } => {
                if key == self.key {
                    self.record_error(error);
                }
                return;
            }
            QueueEvent::Superseded { .. } => return,
        };
        if key != self.key {
            return;
        }
        let caught_up = self.last_stamp.lock().is_some_and(|mine| stamp >= mine);
        if caught_up {
            self.state.send_modify(|s| s.write = WriteState::Clean);
        }
    }

    fn spawn_listener(controller: &Arc<Self>) -> JoinHandle<()> {
        let mut sync_events = controller.manager.invalidation().subscribe();
        let mut queue_events = controller.manager.queue().subscribe();
        let weak: Weak<Self> = Arc::downgrade(controller);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = sync_events.recv() => {
                        let Some(this) = weak.upgrade() else { break };
                        match event {
                            Ok(event @ SyncEvent::Invalidated { .. }) => {
                                if let Some(cleared) = event.cleared_stamp(&this.key) {
                                    this.on_invalidated(cleared).await;
                                }
                            }
                            Ok(SyncEvent::RefreshRequested) => {
                                if !this.is_dirty() {
                                    this.reconcile().await;
                                }
                            }
                            Err(RecvError::Lagged(missed)) => {
                                debug!("'{}' missed {missed} sync event(s); reconciling", this.key);
                                this.reconcile().await;
                            }
                            Err(RecvError::Closed) => break,
                        }
                    }
                    event = queue_events.recv() => {
                        let Some(this) = weak.upgrade() else { break };
                        match event {
                            Ok(event) => this.on_queue_event(event),
                            Err(RecvError::Lagged(missed)) => {
                                debug!("'{}' missed {missed} queue event(s)", this.key);
                                this.sync_write_state();
                            }
                            Err(RecvError::Closed) => break,
                        }
                    }
                }
            }
        })
    }
}

impl<T> Drop for PersistentValue<T> {
    fn drop(&mut self) {
        if let Some(listener) = self.listener.get_mut().take() {
            listener.abort();
        }
    }
}
