use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct RootSnapshot {
    pub id: u64,
    pub scheduled: bool,
    pub completed_at: u32,
    pub pending: Vec<u32>,
    pub blocked_at: Vec<u32>,
    pub force_expire: Option<u32>,
    pub pending_callbacks: usize,
    pub has_finished_work: bool,
    pub committed: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct SchedulerMetrics {
    pub passes: u64,
    pub units: u64,
    pub commits: u64,
    pub blocked_commits: u64,
    pub yields: u64,
    pub interruptions: u64,
    pub suspensions: u64,
    pub outstanding_suspensions: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct DevToolsSnapshot {
    pub roots: Vec<RootSnapshot>,
    pub metrics: SchedulerMetrics,
    pub timestamp_ms: f64,
}

impl DevToolsSnapshot {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }
}

#[cfg(debug_assertions)]
mod internal {
    use super::DevToolsSnapshot;
    use std::sync::Mutex;

    pub trait DevBridge: Send + Sync {
        fn send_snapshot(&self, snapshot: &DevToolsSnapshot);
    }

    pub struct DevToolsContext {
        snapshot: Mutex<DevToolsSnapshot>,
        commits: Mutex<u64>,
        bridge: Mutex<Option<Box<dyn DevBridge>>>,
    }

    impl Default for DevToolsContext {
        fn default() -> Self {
            Self::new()
        }
    }

    impl DevToolsContext {
        pub fn new() -> Self {
            Self {
                snapshot: Mutex::new(DevToolsSnapshot::default()),
                commits: Mutex::new(0),
                bridge: Mutex::new(None),
            }
        }

        pub fn set_bridge(&self, bridge: Box<dyn DevBridge>) {
            if let Ok(mut slot) = self.bridge.lock() {
                *slot = Some(bridge);
            }
        }

        pub fn record_commit(&self) {
            if let Ok(mut commits) = self.commits.lock() {
                *commits += 1;
            }
        }

        pub fn commit_count(&self) -> u64 {
            self.commits.lock().map(|c| *c).unwrap_or(0)
        }

        /// Replaces the stored snapshot and pushes it to the bridge, if any.
        pub fn publish(&self, snapshot: DevToolsSnapshot) {
            if let Ok(bridge) = self.bridge.lock() {
                if let Some(bridge) = bridge.as_ref() {
                    bridge.send_snapshot(&snapshot);
                }
            }
            if let Ok(mut stored) = self.snapshot.lock() {
                *stored = snapshot;
            }
        }

        pub fn latest(&self) -> DevToolsSnapshot {
            self.snapshot
                .lock()
                .map(|s| s.clone())
                .unwrap_or_default()
        }

        pub fn export_state(&self) -> String {
            self.latest().to_json().unwrap_or_default()
        }
    }

    use std::sync::OnceLock;
    pub static DEVTOOLS: OnceLock<DevToolsContext> = OnceLock::new();
}

#[cfg(debug_assertions)]
pub use internal::*;

// Production no-op implementation
#[cfg(not(debug_assertions))]
pub mod production {
    use super::DevToolsSnapshot;

    pub trait DevBridge: Send + Sync {
        fn send_snapshot(&self, snapshot: &DevToolsSnapshot);
    }

    pub struct DevToolsContext;
    impl DevToolsContext {
        pub fn set_bridge(&self, _: Box<dyn DevBridge>) {}
        pub fn record_commit(&self) {}
        pub fn commit_count(&self) -> u64 {
            0
        }
        pub fn publish(&self, _: DevToolsSnapshot) {}
        pub fn latest(&self) -> DevToolsSnapshot {
            DevToolsSnapshot::default()
        }
        pub fn export_state(&self) -> String {
            String::new()
        }
    }
    pub static DEVTOOLS: DevToolsContext = DevToolsContext;
}

#[cfg(not(debug_assertions))]
pub use production::*;

pub fn devtools() -> &'static DevToolsContext {
    #[cfg(debug_assertions)]
    {
        DEVTOOLS.get_or_init(DevToolsContext::new)
    }
    #[cfg(not(debug_assertions))]
    {
        &DEVTOOLS
    }
}
