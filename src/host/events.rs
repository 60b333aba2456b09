use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HostEventKind {
    Installed,
    /// Installed but held back until the active instance releases its clients
    Waiting,
    Activated,
    Claimed { clients: usize },
    InstallFailed { reason: String },
    ActivateFailed { reason: String },
    /// Discarded by the host (replaced, superseded while waiting, or unregistered)
    Evicted,
    FetchResolved { status_code: u16 },
    FetchFailed { reason: String },
    /// The instance declined the fetch; the host forwarded it itself
    FetchFallback,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostEvent {
    pub instance_id: String,
    pub version: String,
    pub kind: HostEventKind,
    pub at: DateTime<Utc>,
}

impl HostEvent {
    pub(crate) fn new(instance_id: &str, version: &str, kind: HostEventKind) -> Self {
        Self {
            instance_id: instance_id.to_string(),
            version: version.to_string(),
            kind,
            at: Utc::now(),
        }
    }
}

/// Fetch counters kept by the host
#[derive(Debug, Default)]
pub(crate) struct HostStats {
    dispatched: AtomicU64,
    resolved: AtomicU64,
    failed: AtomicU64,
    fallbacks: AtomicU64,
    passthrough: AtomicU64,
}

impl HostStats {
    pub(crate) fn record_dispatched(&self) {
        self.dispatched.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn record_resolved(&self) {
        self.resolved.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn record_fallback(&self) {
        self.fallbacks.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn record_passthrough(&self) {
        self.passthrough.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn snapshot(&self) -> HostStatsSnapshot {
        HostStatsSnapshot {
            dispatched: self.dispatched.load(Ordering::SeqCst),
            resolved: self.resolved.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
            fallbacks: self.fallbacks.load(Ordering::SeqCst),
            passthrough: self.passthrough.load(Ordering::SeqCst),
        }
    }
}

/// Point-in-time view of the host's fetch counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostStatsSnapshot {
    /// Fetches delivered to an interceptor instance
    pub dispatched: u64,
    /// Dispatched fetches that produced a response
    pub resolved: u64,
    /// Dispatched fetches that produced a failure
    pub failed: u64,
    /// Dispatched fetches the instance declined
    pub fallbacks: u64,
    /// Fetches from uncontrolled clients, sent straight to the network
    pub passthrough: u64,
}
