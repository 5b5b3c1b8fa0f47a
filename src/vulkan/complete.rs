use std::sync::atomic::Ordering;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use ash::vk;
use tracing::debug;

use crate::emit::{CommandBufferTiming, MarkerTiming, RecordWriter, SubmissionRecord, SubmitTiming};
use crate::stats::AgentStats;

use super::dispatch::{DeviceDispatch, DeviceTimebase, DeviceTimebaseRegistry};
use super::slots::{begin_query_index, end_query_index, SlotPool};
use super::tracker::{CommandBufferTracker, QueueSubmission, SubmitMeta};

/// Drains submissions whose GPU timers are readable, emits correlated
/// records, and recycles their query slots.
///
/// Invoked periodically (on queue-present, in practice). Per queue,
/// submissions retire strictly in submission order; a submission whose
/// final timestamp the GPU has not written stalls only its own queue.
pub struct SubmissionCompleter {
    dispatch: Arc<dyn DeviceDispatch>,
    slots: Arc<SlotPool>,
    timebases: Arc<DeviceTimebaseRegistry>,
    writer: Arc<dyn RecordWriter>,
    stats: Arc<AgentStats>,
}

impl SubmissionCompleter {
    pub fn new(
        dispatch: Arc<dyn DeviceDispatch>,
        slots: Arc<SlotPool>,
        timebases: Arc<DeviceTimebaseRegistry>,
        writer: Arc<dyn RecordWriter>,
        stats: Arc<AgentStats>,
    ) -> Self {
        Self {
            dispatch,
            slots,
            timebases,
            writer,
            stats,
        }
    }

    /// Retire every ready submission of `device`.
    ///
    /// A query that fails to read after the readiness probe indicates a
    /// driver inconsistency and is returned as a fatal error.
    pub fn complete_submissions(
        &self,
        tracker: &CommandBufferTracker,
        device: vk::Device,
    ) -> Result<()> {
        let query_pool = self.slots.query_pool_handle(device);

        let ready = tracker.take_ready_submissions(device, |slot| {
            Ok(self
                .dispatch
                .get_query_result_u64(device, query_pool, end_query_index(slot))?
                .is_some())
        })?;

        if ready.is_empty() {
            return Ok(());
        }

        let timebase = self
            .timebases
            .get(device)
            .unwrap_or_else(|| panic!("device {device:?} has no registered timebase"));

        debug!(?device, count = ready.len(), "retiring submissions");

        for submission in ready {
            self.emit_submission(device, query_pool, timebase, submission)
                .context("reading back submission timestamps")?;
        }

        Ok(())
    }

    fn emit_submission(
        &self,
        device: vk::Device,
        query_pool: vk::QueryPool,
        timebase: DeviceTimebase,
        submission: QueueSubmission,
    ) -> Result<()> {
        let mut freed = Vec::new();
        let mut command_buffers = Vec::new();

        for batch in &submission.batches {
            for cb in &batch.command_buffers {
                let begin_gpu_ns =
                    self.read_scaled(device, query_pool, begin_query_index(cb.begin_slot), timebase)?;
                freed.push(cb.begin_slot);

                if let Some(end_slot) = cb.end_slot {
                    let end_gpu_ns =
                        self.read_scaled(device, query_pool, end_query_index(end_slot), timebase)?;
                    freed.push(end_slot);
                    command_buffers.push(CommandBufferTiming {
                        begin_gpu_ns,
                        end_gpu_ns,
                    });
                }
            }
        }

        let mut markers = Vec::with_capacity(submission.completed_markers.len());
        for marker in &submission.completed_markers {
            let begin_gpu_ns = match &marker.begin_info {
                Some(info) => {
                    freed.push(info.slot);
                    Some(self.read_scaled(device, query_pool, begin_query_index(info.slot), timebase)?)
                }
                None => None,
            };
            let end_gpu_ns = match &marker.end_info {
                Some(info) => {
                    freed.push(info.slot);
                    Some(self.read_scaled(device, query_pool, end_query_index(info.slot), timebase)?)
                }
                None => None,
            };

            markers.push(MarkerTiming {
                text_key: self.writer.intern_string(&marker.text),
                depth: marker.depth,
                begin_gpu_ns,
                end_gpu_ns,
                begin_meta: marker.begin_info.as_ref().map(|info| timing(info.meta)),
            });
        }

        self.writer.write(SubmissionRecord {
            meta: timing(submission.meta),
            gpu_cpu_offset_ns: timebase.cpu_gpu_offset_ns,
            command_buffers,
            markers,
            num_begin_markers: submission.num_begin_markers,
        });

        self.stats.submissions_completed.fetch_add(1, Ordering::Relaxed);
        self.stats.records_emitted.fetch_add(1, Ordering::Relaxed);

        self.slots.release(device, &freed);
        Ok(())
    }

    /// Read one ready query and scale GPU ticks to nanoseconds.
    fn read_scaled(
        &self,
        device: vk::Device,
        query_pool: vk::QueryPool,
        query: u32,
        timebase: DeviceTimebase,
    ) -> Result<u64> {
        match self.dispatch.get_query_result_u64(device, query_pool, query)? {
            Some(raw_ticks) => Ok((raw_ticks as f64 * timebase.timestamp_period_ns) as u64),
            None => bail!("query {query} unavailable after its submission signalled ready"),
        }
    }
}

fn timing(meta: SubmitMeta) -> SubmitTiming {
    SubmitTiming {
        thread_id: meta.thread_id,
        pre_submit_cpu_ns: meta.pre_submit_cpu_ns,
        post_submit_cpu_ns: meta.post_submit_cpu_ns,
    }
}
