//! Worker lifecycle states and the events the host observes.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Unique identifier for a worker instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ServiceWorkerId(u64);

impl ServiceWorkerId {
    pub(crate) fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ServiceWorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sw-{}", self.0)
    }
}

/// Worker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceWorkerState {
    /// Script parsed, not yet installed.
    #[default]
    Parsed,
    /// Install handler running.
    Installing,
    /// Installed, waiting to activate.
    Installed,
    /// Activate handler running.
    Activating,
    /// Active and intercepting fetches.
    Activated,
    /// Replaced or failed to install.
    Redundant,
}

impl ServiceWorkerState {
    pub fn as_str(self) -> &'static str {
        match self {
            ServiceWorkerState::Parsed => "parsed",
            ServiceWorkerState::Installing => "installing",
            ServiceWorkerState::Installed => "installed",
            ServiceWorkerState::Activating => "activating",
            ServiceWorkerState::Activated => "activated",
            ServiceWorkerState::Redundant => "redundant",
        }
    }

    /// Whether fetches are intercepted in this state.
    pub fn controls_fetches(self) -> bool {
        self == ServiceWorkerState::Activated
    }
}

impl fmt::Display for ServiceWorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle notifications sent to the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// State changed.
    StateChange {
        worker_id: ServiceWorkerId,
        new_state: ServiceWorkerState,
    },
    /// A new worker version started installing.
    UpdateFound { cache_name: String },
    /// A window came under this worker's control.
    ControllerChange { client_id: String },
}
