//! # Persistent Sync Core
//!
//! Client-side persistent-state synchronization. Keeps a piece of application
//! state (documents status, chat history, generated analyses) consistent
//! across three tiers: the in-memory value a consumer renders, a durable
//! local cache on LMDB, and the remote authoritative store behind HTTP.
//!
//! ## Features
//!
//! - **Cache-first reads**: a fresh local entry is served immediately while
//!   the remote copy is reconciled in the background
//! - **Optimistic writes**: `update` commits to memory and disk synchronously
//!   and never fails for the caller
//! - **Offline queue**: at most one pending write per key, last write wins,
//!   persisted across restarts and drained on reconnect
//! - **Invalidation cascade**: a new source document purges every cache key
//!   derived from it and makes live controllers reload
//! - **Graceful degradation**: storage and network failures are logged and
//!   recorded, never raised to the consumer
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use persistent_sync_core::{HttpRemoteStore, PersistentValue, SyncConfig, SyncManager};
//!
//! # async fn run() -> Result<(), persistent_sync_core::SyncError> {
//! let config = SyncConfig::default().with_env_overrides()?;
//! let remote = Arc::new(HttpRemoteStore::new(&config)?);
//! remote.set_token("session-token");
//!
//! let manager = SyncManager::new(config, remote)?;
//! manager.init();
//!
//! let analysis = PersistentValue::<serde_json::Value>::mount(&manager, "cv_analysis", None);
//! let state = analysis.ready().await;
//! if state.is_empty() {
//!     // nothing local, nothing remote: render the empty state
//! }
//!
//! manager.dispose();
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - [`local_cache`] - Durable, versioned, timestamped local store
//! - [`remote_store`] - Authenticated remote reads and writes
//! - [`sync_queue`] - De-duplicated pending-write buffer
//! - [`connectivity`] - Online/offline state machine
//! - [`persistent_value`] - Per-key controller
//! - [`invalidation`] - Dependency map and cascade
//! - [`sync_manager`] - Service owning all of the above

pub mod app_error;
pub mod cache_entry;
pub mod clock;
pub mod config;
pub mod connectivity;
pub mod invalidation;
pub mod local_cache;
pub mod persistent_value;
pub mod remote_store;
pub mod sync_manager;
pub mod sync_queue;

pub use crate::app_error::{SyncError, SyncResult};
pub use crate::cache_entry::{CacheEntry, DocumentKind, DocumentStatus, DocumentsStatus};
pub use crate::config::SyncConfig;
pub use crate::connectivity::{Connectivity, ConnectivityMonitor};
pub use crate::invalidation::{InvalidationBroadcaster, InvalidationMap, SyncEvent};
pub use crate::local_cache::LocalCache;
pub use crate::persistent_value::{PersistentValue, ValueState};
pub use crate::remote_store::{HttpRemoteStore, RemoteStore};
pub use crate::sync_manager::SyncManager;
pub use crate::sync_queue::SyncQueue;
