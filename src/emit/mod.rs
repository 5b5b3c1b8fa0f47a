//! Correlated-record output: the types handed to the transport collaborator
//! and the writer interface it implements.

pub mod jsonl;

use serde::Serialize;

/// CPU-side submission metadata as it appears in the record stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SubmitTiming {
    pub thread_id: u32,
    pub pre_submit_cpu_ns: u64,
    pub post_submit_cpu_ns: Option<u64>,
}

/// GPU time range of one command buffer, in nanoseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CommandBufferTiming {
    pub begin_gpu_ns: u64,
    pub end_gpu_ns: u64,
}

/// One completed debug marker. Either timestamp is absent when capture was
/// off at the time that side was recorded; `begin_meta` points at the
/// submission the marker opened in.
#[derive(Debug, Clone, Serialize)]
pub struct MarkerTiming {
    pub text_key: u64,
    pub depth: u32,
    pub begin_gpu_ns: Option<u64>,
    pub end_gpu_ns: Option<u64>,
    pub begin_meta: Option<SubmitTiming>,
}

/// A fully correlated queue submission: CPU-side metadata, the GPU clock
/// offset to place it on the shared timeline, and the timed ranges.
#[derive(Debug, Clone, Serialize)]
pub struct SubmissionRecord {
    pub meta: SubmitTiming,
    pub gpu_cpu_offset_ns: i64,
    pub command_buffers: Vec<CommandBufferTiming>,
    pub markers: Vec<MarkerTiming>,
    pub num_begin_markers: u32,
}

/// Consumer of correlated records.
///
/// Marker labels are interned once per distinct string; records carry the
/// interned key.
pub trait RecordWriter: Send + Sync {
    fn intern_string(&self, text: &str) -> u64;
    fn write(&self, record: SubmissionRecord);
}
