use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use ash::vk::{self, Handle};
use parking_lot::RwLock;
use tracing::trace;

use crate::clock;
use crate::stats::AgentStats;

use super::dispatch::{CaptureState, DeviceDispatch, DriverError};
use super::slots::{begin_query_index, end_query_index, SlotIndex, SlotPool};

/// Command buffers of one `VkSubmitInfo`, flattened by the layer shim.
#[derive(Debug, Clone, Default)]
pub struct SubmitBatch {
    pub command_buffers: Vec<vk::CommandBuffer>,
}

impl SubmitBatch {
    pub fn new(command_buffers: Vec<vk::CommandBuffer>) -> Self {
        Self { command_buffers }
    }
}

/// A debug marker as it was recorded into a command buffer. Markers are
/// always recorded structurally; the slot is present only when capture was
/// on at the time of that specific call.
#[derive(Debug, Clone)]
enum RecordedMarker {
    Begin {
        text: String,
        slot: Option<SlotIndex>,
    },
    End {
        slot: Option<SlotIndex>,
    },
}

/// Recording state of one command buffer, from begin until submit or reset.
#[derive(Debug, Default)]
struct CommandBufferState {
    begin_slot: Option<SlotIndex>,
    end_slot: Option<SlotIndex>,
    markers: Vec<RecordedMarker>,
}

impl CommandBufferState {
    fn reserved_slots(&self) -> Vec<SlotIndex> {
        let mut slots: Vec<SlotIndex> = self
            .begin_slot
            .into_iter()
            .chain(self.end_slot)
            .collect();
        for marker in &self.markers {
            let (RecordedMarker::Begin { slot, .. } | RecordedMarker::End { slot }) = marker;
            if let Some(slot) = slot {
                slots.push(*slot);
            }
        }
        slots
    }
}

/// CPU-side metadata of one queue submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubmitMeta {
    pub thread_id: u32,
    pub pre_submit_cpu_ns: u64,
    /// Set once the driver's submit call has returned.
    pub post_submit_cpu_ns: Option<u64>,
}

/// Where and when one side of a marker was captured.
#[derive(Debug, Clone, Copy)]
pub struct MarkerTimestampInfo {
    pub meta: SubmitMeta,
    pub slot: SlotIndex,
}

/// A debug marker correlated across its queue's submission stream.
///
/// `depth` is the number of markers already open on the queue when this
/// one began. Begin and end may fall into different submissions; either
/// side may lack a slot if capture was off when it was recorded.
#[derive(Debug, Clone)]
pub struct MarkerState {
    pub text: String,
    pub depth: u32,
    pub begin_info: Option<MarkerTimestampInfo>,
    pub end_info: Option<MarkerTimestampInfo>,
}

/// A command buffer as captured at submission time.
#[derive(Debug, Clone, Copy)]
pub struct SubmittedCommandBuffer {
    pub begin_slot: SlotIndex,
    pub end_slot: Option<SlotIndex>,
}

/// One `VkSubmitInfo` worth of captured command buffers.
#[derive(Debug, Clone, Default)]
pub struct SubmittedBatch {
    pub command_buffers: Vec<SubmittedCommandBuffer>,
}

/// One queue submission awaiting its GPU timestamps.
#[derive(Debug)]
pub struct QueueSubmission {
    pub meta: SubmitMeta,
    pub batches: Vec<SubmittedBatch>,
    pub completed_markers: Vec<MarkerState>,
    pub num_begin_markers: u32,
}

#[derive(Default)]
struct TrackerMaps {
    pool_to_command_buffers: HashMap<vk::CommandPool, HashSet<vk::CommandBuffer>>,
    command_buffer_to_device: HashMap<vk::CommandBuffer, vk::Device>,
    command_buffer_to_state: HashMap<vk::CommandBuffer, CommandBufferState>,
    queue_to_submissions: HashMap<vk::Queue, VecDeque<QueueSubmission>>,
    queue_to_marker_stack: HashMap<vk::Queue, Vec<MarkerState>>,
    queue_to_device: HashMap<vk::Queue, vk::Device>,
}

/// Tracks command-buffer recording and queue submissions.
///
/// Driver callbacks arrive on arbitrary threads; a single reader-writer
/// lock guards all maps. Driver calls (timestamp writes) are issued outside
/// the lock; per-command-buffer fields can only race if the application
/// itself violates Vulkan's external-synchronization rules.
pub struct CommandBufferTracker {
    dispatch: Arc<dyn DeviceDispatch>,
    slots: Arc<SlotPool>,
    capture: Arc<dyn CaptureState>,
    stats: Arc<AgentStats>,
    maps: RwLock<TrackerMaps>,
}

impl CommandBufferTracker {
    pub fn new(
        dispatch: Arc<dyn DeviceDispatch>,
        slots: Arc<SlotPool>,
        capture: Arc<dyn CaptureState>,
        stats: Arc<AgentStats>,
    ) -> Self {
        Self {
            dispatch,
            slots,
            capture,
            stats,
            maps: RwLock::new(TrackerMaps::default()),
        }
    }

    /// Register command buffers allocated from `pool` on `device`.
    pub fn track(&self, device: vk::Device, pool: vk::CommandPool, command_buffers: &[vk::CommandBuffer]) {
        let mut maps = self.maps.write();
        let tracked = maps.pool_to_command_buffers.entry(pool).or_default();
        for &cb in command_buffers {
            assert!(cb != vk::CommandBuffer::null(), "tracking a null command buffer");
            tracked.insert(cb);
        }
        for &cb in command_buffers {
            maps.command_buffer_to_device.insert(cb, device);
        }
    }

    /// Remove registrations for freed command buffers. Any in-flight
    /// recording state is discarded and its slots rolled back.
    pub fn untrack(&self, device: vk::Device, pool: vk::CommandPool, command_buffers: &[vk::CommandBuffer]) {
        let mut abandoned: Vec<SlotIndex> = Vec::new();
        {
            let mut maps = self.maps.write();
            let tracked = maps
                .pool_to_command_buffers
                .get_mut(&pool)
                .unwrap_or_else(|| panic!("pool {pool:?} is not tracked"));
            for &cb in command_buffers {
                tracked.remove(&cb);
            }
            if tracked.is_empty() {
                maps.pool_to_command_buffers.remove(&pool);
            }

            for &cb in command_buffers {
                let registered = maps
                    .command_buffer_to_device
                    .remove(&cb)
                    .unwrap_or_else(|| panic!("command buffer {cb:?} is not tracked"));
                assert_eq!(
                    registered, device,
                    "command buffer {cb:?} freed on a different device",
                );
                if let Some(state) = maps.command_buffer_to_state.remove(&cb) {
                    abandoned.extend(state.reserved_slots());
                }
            }
        }
        self.slots.rollback(device, &abandoned);
    }

    /// Whether the command buffer is registered.
    pub fn is_tracked(&self, command_buffer: vk::CommandBuffer) -> bool {
        self.maps
            .read()
            .command_buffer_to_device
            .contains_key(&command_buffer)
    }

    /// The device the command buffer was allocated on.
    pub fn device_of(&self, command_buffer: vk::CommandBuffer) -> Option<vk::Device> {
        self.maps
            .read()
            .command_buffer_to_device
            .get(&command_buffer)
            .copied()
    }

    /// Driver reported `vkBeginCommandBuffer`: open fresh recording state
    /// and, while capturing, stamp a top-of-pipe timestamp.
    pub fn mark_begin(&self, command_buffer: vk::CommandBuffer) {
        let device = {
            let mut maps = self.maps.write();
            let device = Self::device_of_tracked(&maps, command_buffer);
            let previous = maps
                .command_buffer_to_state
                .insert(command_buffer, CommandBufferState::default());
            assert!(
                previous.is_none(),
                "command buffer {command_buffer:?} began recording twice",
            );
            device
        };

        if !self.capture.is_capturing() {
            return;
        }
        let Some(slot) = self.reserve_slot(device) else {
            return;
        };

        let pool = self.slots.query_pool_handle(device);
        self.dispatch.cmd_write_timestamp(
            command_buffer,
            vk::PipelineStageFlags::TOP_OF_PIPE,
            pool,
            begin_query_index(slot),
        );

        let mut maps = self.maps.write();
        let stored = match maps.command_buffer_to_state.get_mut(&command_buffer) {
            Some(state) => {
                state.begin_slot = Some(slot);
                true
            }
            None => false,
        };
        drop(maps);
        if !stored {
            self.slots.rollback(device, &[slot]);
        }
    }

    /// Driver reported `vkEndCommandBuffer`: while capturing a begun
    /// recording, stamp a bottom-of-pipe timestamp.
    pub fn mark_end(&self, command_buffer: vk::CommandBuffer) {
        let (device, has_begin) = {
            let maps = self.maps.read();
            let state = maps
                .command_buffer_to_state
                .get(&command_buffer)
                .unwrap_or_else(|| panic!("command buffer {command_buffer:?} ended without beginning"));
            (
                Self::device_of_tracked(&maps, command_buffer),
                state.begin_slot.is_some(),
            )
        };

        if !has_begin || !self.capture.is_capturing() {
            return;
        }
        let Some(slot) = self.reserve_slot(device) else {
            return;
        };

        let pool = self.slots.query_pool_handle(device);
        self.dispatch.cmd_write_timestamp(
            command_buffer,
            vk::PipelineStageFlags::BOTTOM_OF_PIPE,
            pool,
            end_query_index(slot),
        );

        let mut maps = self.maps.write();
        let stored = match maps.command_buffer_to_state.get_mut(&command_buffer) {
            Some(state) => {
                state.end_slot = Some(slot);
                true
            }
            None => false,
        };
        drop(maps);
        if !stored {
            self.slots.rollback(device, &[slot]);
        }
    }

    /// A labelled region opened during recording.
    pub fn marker_begin(&self, command_buffer: vk::CommandBuffer, text: &str) {
        let slot = self.stamp_marker(command_buffer, vk::PipelineStageFlags::TOP_OF_PIPE, true);
        let mut maps = self.maps.write();
        if let Some(state) = maps.command_buffer_to_state.get_mut(&command_buffer) {
            state.markers.push(RecordedMarker::Begin {
                text: text.to_string(),
                slot,
            });
        }
    }

    /// A labelled region closed during recording.
    pub fn marker_end(&self, command_buffer: vk::CommandBuffer) {
        let slot = self.stamp_marker(command_buffer, vk::PipelineStageFlags::BOTTOM_OF_PIPE, false);
        let mut maps = self.maps.write();
        if let Some(state) = maps.command_buffer_to_state.get_mut(&command_buffer) {
            state.markers.push(RecordedMarker::End { slot });
        }
    }

    /// While capturing, reserve a slot and write a timestamp for a marker.
    fn stamp_marker(
        &self,
        command_buffer: vk::CommandBuffer,
        stage: vk::PipelineStageFlags,
        begin: bool,
    ) -> Option<SlotIndex> {
        let device = {
            let maps = self.maps.read();
            assert!(
                maps.command_buffer_to_state.contains_key(&command_buffer),
                "marker on command buffer {command_buffer:?} outside recording",
            );
            Self::device_of_tracked(&maps, command_buffer)
        };

        if !self.capture.is_capturing() {
            return None;
        }
        let slot = self.reserve_slot(device)?;

        let pool = self.slots.query_pool_handle(device);
        let query = if begin {
            begin_query_index(slot)
        } else {
            end_query_index(slot)
        };
        self.dispatch
            .cmd_write_timestamp(command_buffer, stage, pool, query);
        Some(slot)
    }

    /// Driver is about to submit: snapshot the recorded command buffers
    /// into a pending submission with CPU-side metadata.
    pub fn pre_submit(&self, queue: vk::Queue, submits: &[SubmitBatch]) {
        if !self.capture.is_capturing() {
            return;
        }

        let meta = SubmitMeta {
            thread_id: clock::current_thread_id(),
            pre_submit_cpu_ns: clock::monotonic_ns(),
            post_submit_cpu_ns: None,
        };

        let mut maps = self.maps.write();
        let mut batches = Vec::with_capacity(submits.len());
        for batch in submits {
            let mut submitted = SubmittedBatch::default();
            for &cb in &batch.command_buffers {
                if let Some(&device) = maps.command_buffer_to_device.get(&cb) {
                    maps.queue_to_device.entry(queue).or_insert(device);
                }
                let Some(state) = maps.command_buffer_to_state.get(&cb) else {
                    continue;
                };
                let Some(begin_slot) = state.begin_slot else {
                    continue;
                };
                submitted.command_buffers.push(SubmittedCommandBuffer {
                    begin_slot,
                    end_slot: state.end_slot,
                });
            }
            batches.push(submitted);
        }

        maps.queue_to_submissions
            .entry(queue)
            .or_default()
            .push_back(QueueSubmission {
                meta,
                batches,
                completed_markers: Vec::new(),
                num_begin_markers: 0,
            });
    }

    /// Driver's submit returned: finalize the submission metadata, thread
    /// the recorded markers through the queue's marker stack, and retire
    /// the command buffers' recording state.
    pub fn post_submit(&self, queue: vk::Queue, submits: &[SubmitBatch]) {
        let now_ns = clock::monotonic_ns();
        let mut orphaned: Vec<(vk::Device, SlotIndex)> = Vec::new();

        {
            let mut maps = self.maps.write();

            // The just-pushed submission is the queue's newest one still
            // missing its post-submit time; absent when capture was off at
            // pre-submit.
            let meta = match maps
                .queue_to_submissions
                .get_mut(&queue)
                .and_then(|submissions| submissions.back_mut())
            {
                Some(submission) if submission.meta.post_submit_cpu_ns.is_none() => {
                    submission.meta.post_submit_cpu_ns = Some(now_ns);
                    Some(submission.meta)
                }
                _ => None,
            };

            let mut completed: Vec<MarkerState> = Vec::new();
            let mut begin_markers: u32 = 0;

            for batch in submits {
                for &cb in &batch.command_buffers {
                    let Some(state) = maps.command_buffer_to_state.remove(&cb) else {
                        continue;
                    };
                    let device = *maps
                        .command_buffer_to_device
                        .get(&cb)
                        .unwrap_or_else(|| panic!("submitted command buffer {cb:?} is not tracked"));

                    if meta.is_none() {
                        // Capture stopped between recording and submit;
                        // nothing will ever read these queries back.
                        if let Some(slot) = state.begin_slot {
                            orphaned.push((device, slot));
                        }
                        if let Some(slot) = state.end_slot {
                            orphaned.push((device, slot));
                        }
                    }

                    let stack = maps.queue_to_marker_stack.entry(queue).or_default();
                    for marker in state.markers {
                        match marker {
                            RecordedMarker::Begin { text, slot } => {
                                let depth = stack.len() as u32;
                                let begin_info = match (meta, slot) {
                                    (Some(meta), Some(slot)) => {
                                        Some(MarkerTimestampInfo { meta, slot })
                                    }
                                    (None, Some(slot)) => {
                                        orphaned.push((device, slot));
                                        None
                                    }
                                    _ => None,
                                };
                                if meta.is_some() {
                                    begin_markers += 1;
                                }
                                stack.push(MarkerState {
                                    text,
                                    depth,
                                    begin_info,
                                    end_info: None,
                                });
                            }
                            RecordedMarker::End { slot } => {
                                let Some(mut open) = stack.pop() else {
                                    // Unmatched end: an application bug,
                                    // tolerated.
                                    trace!(?queue, "marker end on empty stack");
                                    if let Some(slot) = slot {
                                        orphaned.push((device, slot));
                                    }
                                    continue;
                                };
                                if let Some(meta) = meta {
                                    open.end_info =
                                        slot.map(|slot| MarkerTimestampInfo { meta, slot });
                                    completed.push(open);
                                } else {
                                    if let Some(slot) = slot {
                                        orphaned.push((device, slot));
                                    }
                                    if let Some(info) = open.begin_info {
                                        orphaned.push((device, info.slot));
                                    }
                                }
                            }
                        }
                    }
                }
            }

            if let Some(submission) = maps
                .queue_to_submissions
                .get_mut(&queue)
                .and_then(|submissions| submissions.back_mut())
            {
                submission.num_begin_markers += begin_markers;
                submission.completed_markers.extend(completed);
            }
        }

        for (device, slot) in orphaned {
            self.slots.rollback(device, &[slot]);
        }
    }

    /// Driver reset one command buffer: roll back its reserved slots and
    /// drop the recording state. No-op for a buffer that never began.
    pub fn reset_cb(&self, command_buffer: vk::CommandBuffer) {
        let rollback = {
            let mut maps = self.maps.write();
            let Some(state) = maps.command_buffer_to_state.remove(&command_buffer) else {
                return;
            };
            let device = Self::device_of_tracked(&maps, command_buffer);
            Some((device, state.reserved_slots()))
        };
        if let Some((device, slots)) = rollback {
            self.slots.rollback(device, &slots);
        }
    }

    /// Driver reset a whole command pool: reset every buffer allocated
    /// from it.
    pub fn reset_pool(&self, pool: vk::CommandPool) {
        let command_buffers: Vec<vk::CommandBuffer> = {
            let maps = self.maps.read();
            maps.pool_to_command_buffers
                .get(&pool)
                .map(|set| set.iter().copied().collect())
                .unwrap_or_default()
        };
        for cb in command_buffers {
            self.reset_cb(cb);
        }
    }

    /// Submissions still awaiting GPU timestamps, across all queues.
    pub fn pending_submissions(&self) -> usize {
        self.maps
            .read()
            .queue_to_submissions
            .values()
            .map(VecDeque::len)
            .sum()
    }

    /// Detach every submission of `device` whose final timestamp the GPU
    /// has written, preserving per-queue FIFO order: a not-ready head
    /// stalls its queue. Submissions with nothing awaitable are discarded
    /// and their slots rolled back.
    pub(crate) fn take_ready_submissions(
        &self,
        device: vk::Device,
        mut is_ready: impl FnMut(SlotIndex) -> Result<bool, DriverError>,
    ) -> Result<Vec<QueueSubmission>, DriverError> {
        let mut ready = Vec::new();
        let mut abandoned: Vec<SlotIndex> = Vec::new();

        {
            let mut maps = self.maps.write();
            let maps = &mut *maps;
            for (queue, submissions) in maps.queue_to_submissions.iter_mut() {
                if maps.queue_to_device.get(queue).map_or(false, |d| *d != device) {
                    continue;
                }
                loop {
                    let Some(head) = submissions.front() else {
                        break;
                    };
                    match Self::awaitable_slot(head) {
                        Some(slot) => {
                            if !is_ready(slot)? {
                                break;
                            }
                            if let Some(submission) = submissions.pop_front() {
                                ready.push(submission);
                            }
                        }
                        None => {
                            if let Some(submission) = submissions.pop_front() {
                                abandoned.extend(Self::all_slots(&submission));
                            }
                        }
                    }
                }
            }
        }

        self.slots.rollback(device, &abandoned);
        Ok(ready)
    }

    /// The slot whose end query is written last for this submission: the
    /// last command buffer with an end slot, scanning batches in reverse.
    fn awaitable_slot(submission: &QueueSubmission) -> Option<SlotIndex> {
        submission
            .batches
            .iter()
            .rev()
            .flat_map(|batch| batch.command_buffers.iter().rev())
            .find_map(|cb| cb.end_slot)
    }

    fn all_slots(submission: &QueueSubmission) -> Vec<SlotIndex> {
        let mut slots = Vec::new();
        for batch in &submission.batches {
            for cb in &batch.command_buffers {
                slots.push(cb.begin_slot);
                slots.extend(cb.end_slot);
            }
        }
        for marker in &submission.completed_markers {
            slots.extend(marker.begin_info.as_ref().map(|info| info.slot));
            slots.extend(marker.end_info.as_ref().map(|info| info.slot));
        }
        slots
    }

    fn reserve_slot(&self, device: vk::Device) -> Option<SlotIndex> {
        let slot = self.slots.reserve(device);
        if slot.is_none() {
            self.stats
                .instrumentation_dropped
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        }
        slot
    }

    fn device_of_tracked(maps: &TrackerMaps, command_buffer: vk::CommandBuffer) -> vk::Device {
        *maps
            .command_buffer_to_device
            .get(&command_buffer)
            .unwrap_or_else(|| panic!("command buffer {command_buffer:?} is not tracked"))
    }
}
