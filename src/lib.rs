//! Correlated GPU/CPU trace capture for a profiler UI.
//!
//! Two capture pipelines feed one ordered stream: perf ring-buffer events
//! are merged across sources and released in global timestamp order, and
//! Vulkan command-buffer submissions are instrumented with timestamp
//! queries, correlated with their CPU-side metadata, and emitted once the
//! GPU timers are readable.

pub mod agent;
pub mod clock;
pub mod config;
pub mod emit;
pub mod export;
pub mod perf;
pub mod stats;
pub mod vulkan;
