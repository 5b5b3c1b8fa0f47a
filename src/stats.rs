use std::sync::atomic::{AtomicU64, Ordering};

/// Lock-free counters shared across the capture pipelines.
///
/// Hot paths (slot reservation, submission completion) only touch atomics;
/// `snapshot()` atomically reads and resets for periodic reporting.
pub struct AgentStats {
    /// Events dispatched to visitors in timestamp order.
    pub events_merged: AtomicU64,
    /// Events dropped for violating the cross-source skew bound.
    pub events_discarded: AtomicU64,
    /// Timestamp writes skipped because the slot pool was saturated.
    pub instrumentation_dropped: AtomicU64,
    /// GPU submissions fully read back and retired.
    pub submissions_completed: AtomicU64,
    /// Correlated records handed to the emit collaborator.
    pub records_emitted: AtomicU64,
}

/// Point-in-time copy of all counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub events_merged: u64,
    pub events_discarded: u64,
    pub instrumentation_dropped: u64,
    pub submissions_completed: u64,
    pub records_emitted: u64,
}

impl AgentStats {
    pub fn new() -> Self {
        Self {
            events_merged: AtomicU64::new(0),
            events_discarded: AtomicU64::new(0),
            instrumentation_dropped: AtomicU64::new(0),
            submissions_completed: AtomicU64::new(0),
            records_emitted: AtomicU64::new(0),
        }
    }

    /// Atomically read and reset all counters.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            events_merged: self.events_merged.swap(0, Ordering::Relaxed),
            events_discarded: self.events_discarded.swap(0, Ordering::Relaxed),
            instrumentation_dropped: self.instrumentation_dropped.swap(0, Ordering::Relaxed),
            submissions_completed: self.submissions_completed.swap(0, Ordering::Relaxed),
            records_emitted: self.records_emitted.swap(0, Ordering::Relaxed),
        }
    }
}

impl Default for AgentStats {
    fn default() -> Self {
        Self::new()
    }
}

impl StatsSnapshot {
    pub fn total(&self) -> u64 {
        self.events_merged
            + self.events_discarded
            + self.instrumentation_dropped
            + self.submissions_completed
            + self.records_emitted
    }
}
