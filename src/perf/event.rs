use std::fmt;

/// Identifies the ring buffer an event was read from: the perf_event_open
/// file descriptor.
pub type SourceId = i32;

/// A single timestamped observation read from one perf ring buffer.
///
/// Timestamps are `CLOCK_MONOTONIC` nanoseconds. Events from one source
/// arrive in non-decreasing timestamp order; ordering across sources is
/// established by the merger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PerfEvent {
    pub timestamp_ns: u64,
    pub pid: u32,
    pub tid: u32,
    pub kind: PerfEventKind,
}

/// Typed payload of a perf event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PerfEventKind {
    /// Instruction-pointer sample.
    Sample { ip: u64 },
    /// Context switch; `next_tid` is 0 when switching to an untracked task.
    SchedSwitch { prev_tid: u32, next_tid: u32, cpu: u32 },
    /// Thread exit.
    ThreadExit,
    /// The kernel dropped `count` records from this ring buffer.
    Lost { count: u64 },
}

impl PerfEventKind {
    /// Returns the canonical metric/log label name.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Sample { .. } => "sample",
            Self::SchedSwitch { .. } => "sched_switch",
            Self::ThreadExit => "thread_exit",
            Self::Lost { .. } => "lost",
        }
    }
}

impl fmt::Display for PerfEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Recipient of merged events, invoked in registration order.
///
/// Dispatch is synchronous: all visitors see event N before any visitor
/// sees event N+1.
pub trait EventVisitor: Send {
    fn visit(&mut self, event: &PerfEvent);
}
