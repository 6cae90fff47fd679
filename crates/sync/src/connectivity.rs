use std::fmt;

use tokio::sync::watch;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connectivity {
    Online,
    Offline,
}

impl Connectivity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Connectivity::Online => "online",
            Connectivity::Offline => "offline",
        }
    }

    pub fn is_online(&self) -> bool {
        matches!(self, Connectivity::Online)
    }
}

impl fmt::Display for Connectivity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Goes offline on a failed direct write and back online on the next
/// successful write or on [`ConnectivityTracker::mark_online`].
#[derive(Debug)]
pub struct ConnectivityTracker {
    state: watch::Sender<Connectivity>,
}

impl Default for ConnectivityTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectivityTracker {
    pub fn new() -> Self {
        let (state, _) = watch::channel(Connectivity::Online);
        Self { state }
    }

    pub fn current(&self) -> Connectivity {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<Connectivity> {
        self.state.subscribe()
    }

    pub fn record_success(&self) {
        self.set(Connectivity::Online);
    }

    pub fn record_failure(&self) {
        self.set(Connectivity::Offline);
    }

    /// The backend answered outside a direct write, e.g. a snapshot arrived.
    pub fn mark_online(&self) {
        self.set(Connectivity::Online);
    }

    fn set(&self, next: Connectivity) {
        let changed = self.state.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
        if changed {
            info!(state = next.as_str(), "connectivity changed");
        }
    }
}
