//! The synchronization service: owns the shared cache, queue, monitor and
//! broadcaster, and runs their background tasks between `init` and `dispose`.
//!
//! One instance is meant to be built per application and handed to every
//! [`crate::persistent_value::PersistentValue`] explicitly.

use std::sync::{Arc, Weak};

use log::{debug, info};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::app_error::SyncResult;
use crate::clock::{Clock, SystemClock};
use crate::config::SyncConfig;
use crate::connectivity::{Connectivity, ConnectivityMonitor};
use crate::invalidation::{InvalidationBroadcaster, InvalidationMap, SyncEvent};
use crate::local_cache::LocalCache;
use crate::remote_store::RemoteStore;
use crate::sync_queue::{DrainReport, SyncQueue};

pub struct SyncManager {
    config: SyncConfig,
    clock: Arc<dyn Clock>,
    cache: Arc<LocalCache>,
    queue: Arc<SyncQueue>,
    remote: Arc<dyn RemoteStore>,
    connectivity: Arc<ConnectivityMonitor>,
    invalidation: Arc<InvalidationBroadcaster>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SyncManager {
    pub fn new(config: SyncConfig, remote: Arc<dyn RemoteStore>) -> SyncResult<Arc<Self>> {
        Self::with_parts(config, remote, Arc::new(SystemClock), InvalidationMap::default())
    }

    pub fn with_parts(
        config: SyncConfig,
        remote: Arc<dyn RemoteStore>,
        clock: Arc<dyn Clock>,
        map: InvalidationMap,
    ) -> SyncResult<Arc<Self>> {
        config.validate()?;

        let cache = Arc::new(LocalCache::open(&config, Arc::clone(&clock)));
        let queue = Arc::new(SyncQueue::new(
            Arc::clone(&cache),
            Arc::clone(&clock),
            config.event_buffer,
        ));
        let connectivity = Arc::new(ConnectivityMonitor::new(Connectivity::from_online(
            config.initially_online,
        )));
        let invalidation = Arc::new(InvalidationBroadcaster::new(
            map,
            Arc::clone(&cache),
            Arc::clone(&queue),
            Arc::clone(&remote),
            Arc::clone(&connectivity),
            Arc::clone(&clock),
            config.event_buffer,
        ));

        Ok(Arc::new(Self {
            config,
            clock,
            cache,
            queue,
            remote,
            connectivity,
            invalidation,
            tasks: Mutex::new(Vec::new()),
        }))
    }

    /// Starts the connectivity watcher and the periodic refresh tick.
    ///
    /// Must run inside a tokio runtime. Calling it twice is a no-op.
    pub fn init(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() {
            return;
        }

        tasks.push(self.spawn_connectivity_watcher());
        if let Some(period) = self.config.refresh_interval() {
            tasks.push(self.spawn_refresh_ticker(period));
        }
        info!(
            "Sync manager started ({:?}, {} pending)",
            self.connectivity.current(),
            self.queue.len()
        );
    }

    /// Stops background tasks and closes the local store.
    pub fn dispose(&self) {
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            task.abort();
        }
        self.cache.close();
        info!("Sync manager disposed");
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn local_cache(&self) -> &Arc<LocalCache> {
        &self.cache
    }

    pub fn queue(&self) -> &Arc<SyncQueue> {
        &self.queue
    }

    pub fn remote(&self) -> &Arc<dyn RemoteStore> {
        &self.remote
    }

    pub fn connectivity(&self) -> &Arc<ConnectivityMonitor> {
        &self.connectivity
    }

    pub fn invalidation(&self) -> &Arc<InvalidationBroadcaster> {
        &self.invalidation
    }

    /// Flushes the queue in the background when online.
    pub fn schedule_drain(self: &Arc<Self>) {
        if !self.connectivity.is_online() {
            debug!("Offline; drain deferred until reconnect");
            return;
        }
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            manager.drain_until_settled().await;
        });
    }

    /// Flushes the queue when online.
    ///
    /// A drain already in progress takes this request over, so writes made
    /// before the call are delivered by one drain or the other.
    pub async fn drain_until_settled(&self) -> DrainReport {
        if !self.connectivity.is_online() {
            return DrainReport {
                skipped: true,
                ..DrainReport::default()
            };
        }
        self.queue.drain(self.remote.as_ref()).await
    }

    fn spawn_connectivity_watcher(self: &Arc<Self>) -> JoinHandle<()> {
        let mut reconnects = self.connectivity.subscribe_reconnects();
        let manager: Weak<Self> = Arc::downgrade(self);

        tokio::spawn(async move {
            while reconnects.changed().await.is_ok() {
                let edges = *reconnects.borrow_and_update();
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                info!(
                    "Back online (reconnect #{edges}); draining {} pending item(s)",
                    manager.queue.len()
                );
                manager.drain_until_settled().await;
                manager.invalidation.publish(SyncEvent::RefreshRequested);
            }
        })
    }

    fn spawn_refresh_ticker(self: &Arc<Self>, period: std::time::Duration) -> JoinHandle<()> {
        let manager: Weak<Self> = Arc::downgrade(self);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // the first tick completes immediately
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                if !manager.connectivity.is_online() {
                    continue;
                }
                if !manager.queue.is_empty() {
                    manager.drain_until_settled().await;
                }
                manager.invalidation.publish(SyncEvent::RefreshRequested);
            }
        })
    }
}

impl Drop for SyncManager {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}
