//! Network reachability signal supplied by the host environment.

use tokio::sync::watch;
use tracing::debug;

/// Reports whether the network is reachable and when that changes.
pub trait Connectivity: Send + Sync {
    /// Returns true if the network is currently reachable.
    fn is_online(&self) -> bool;

    /// Subscribes to online/offline transitions.
    fn subscribe(&self) -> watch::Receiver<bool>;
}

/// A connectivity signal driven by the host (browser events, OS callbacks).
#[derive(Debug)]
pub struct ConnectivityMonitor {
    state: watch::Sender<bool>,
}

impl ConnectivityMonitor {
    /// Creates a monitor with the given initial state.
    pub fn new(online: bool) -> Self {
        let (state, _) = watch::channel(online);
        Self { state }
    }

    /// Records a reachability change. Subscribers are only woken on an
    /// actual transition.
    pub fn set_online(&self, online: bool) {
        let changed = self.state.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });
        if changed {
            debug!(online, "connectivity changed");
        }
    }
}

impl Default for ConnectivityMonitor {
    fn default() -> Self {
        Self::new(true)
    }
}

impl Connectivity for ConnectivityMonitor {
    fn is_online(&self) -> bool {
        *self.state.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.state.subscribe()
    }
}
