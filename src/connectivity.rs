//! Online/offline state machine fed by the host's platform signal.

use log::info;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connectivity {
    Online,
    Offline,
}

impl Connectivity {
    pub fn from_online(online: bool) -> Self {
        if online {
            Connectivity::Online
        } else {
            Connectivity::Offline
        }
    }

    pub fn is_online(self) -> bool {
        self == Connectivity::Online
    }
}

/// Holds the current connectivity and publishes transitions.
///
/// Repeated reports of the current state are not transitions and wake
/// nobody. Offline→Online edges are also counted on a separate channel: a
/// `watch` keeps only the latest state, so a quick Offline→Online flap would
/// otherwise look like no change at all.
pub struct ConnectivityMonitor {
    state: watch::Sender<Connectivity>,
    reconnects: watch::Sender<u64>,
}

impl ConnectivityMonitor {
    pub fn new(initial: Connectivity) -> Self {
        let (state, _) = watch::channel(initial);
        let (reconnects, _) = watch::channel(0);
        Self { state, reconnects }
    }

    pub fn current(&self) -> Connectivity {
        *self.state.borrow()
    }

    pub fn is_online(&self) -> bool {
        self.current().is_online()
    }

    /// Feeds a platform connectivity signal. Returns whether it changed state.
    pub fn report(&self, next: Connectivity) -> bool {
        let mut reconnected = false;
        let changed = self.state.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            reconnected = *current == Connectivity::Offline && next == Connectivity::Online;
            *current = next;
            true
        });
        if reconnected {
            self.reconnects.send_modify(|count| *count += 1);
        }
        if changed {
            info!("Connectivity changed to {next:?}");
        }
        changed
    }

    pub fn set_online(&self, online: bool) -> bool {
        self.report(Connectivity::from_online(online))
    }

    pub fn subscribe(&self) -> watch::Receiver<Connectivity> {
        self.state.subscribe()
    }

    /// Number of Offline→Online edges reported so far.
    pub fn reconnect_count(&self) -> u64 {
        *self.reconnects.borrow()
    }

    /// Wakes on every Offline→Online edge. Edges reported faster than the
    /// receiver runs collapse into one wake-up, never into none.
    pub fn subscribe_reconnects(&self) -> watch::Receiver<u64> {
        self.reconnects.subscribe()
    }
}
