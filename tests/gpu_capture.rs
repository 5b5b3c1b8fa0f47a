use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use ash::vk::{self, Handle};
use parking_lot::Mutex;

use tracefuse::emit::{RecordWriter, SubmissionRecord};
use tracefuse::stats::AgentStats;
use tracefuse::vulkan::complete::SubmissionCompleter;
use tracefuse::vulkan::dispatch::{
    AtomicCaptureState, CaptureState, DeviceDispatch, DeviceTimebase, DeviceTimebaseRegistry,
    DriverError,
};
use tracefuse::vulkan::slots::{begin_query_index, end_query_index, SlotPool};
use tracefuse::vulkan::tracker::{CommandBufferTracker, SubmitBatch};

/// In-memory driver: records timestamp writes and serves scripted query
/// results keyed by physical query index.
#[derive(Default)]
struct ScriptedDriver {
    next_pool: AtomicU64,
    results: Mutex<HashMap<u32, u64>>,
}

impl ScriptedDriver {
    fn set_result(&self, query: u32, ticks: u64) {
        self.results.lock().insert(query, ticks);
    }
}

impl DeviceDispatch for ScriptedDriver {
    fn create_query_pool(
        &self,
        _device: vk::Device,
        _query_count: u32,
    ) -> Result<vk::QueryPool, DriverError> {
        let raw = self.next_pool.fetch_add(1, Ordering::Relaxed) + 1;
        Ok(vk::QueryPool::from_raw(raw))
    }

    fn destroy_query_pool(&self, _device: vk::Device, _pool: vk::QueryPool) {}

    fn reset_query_pool(
        &self,
        _device: vk::Device,
        _pool: vk::QueryPool,
        first_query: u32,
        query_count: u32,
    ) {
        let mut results = self.results.lock();
        for query in first_query..first_query + query_count {
            results.remove(&query);
        }
    }

    fn cmd_write_timestamp(
        &self,
        _command_buffer: vk::CommandBuffer,
        _stage: vk::PipelineStageFlags,
        _pool: vk::QueryPool,
        _query: u32,
    ) {
    }

    fn get_query_result_u64(
        &self,
        _device: vk::Device,
        _pool: vk::QueryPool,
        query: u32,
    ) -> Result<Option<u64>, DriverError> {
        Ok(self.results.lock().get(&query).copied())
    }
}

/// Collects emitted records; interns labels by insertion order.
#[derive(Default)]
struct CollectingWriter {
    strings: Mutex<Vec<String>>,
    records: Mutex<Vec<SubmissionRecord>>,
}

impl CollectingWriter {
    fn text(&self, key: u64) -> String {
        self.strings.lock()[key as usize].clone()
    }
}

impl RecordWriter for CollectingWriter {
    fn intern_string(&self, text: &str) -> u64 {
        let mut strings = self.strings.lock();
        if let Some(pos) = strings.iter().position(|s| s == text) {
            return pos as u64;
        }
        strings.push(text.to_string());
        (strings.len() - 1) as u64
    }

    fn write(&self, record: SubmissionRecord) {
        self.records.lock().push(record);
    }
}

struct Capture {
    driver: Arc<ScriptedDriver>,
    slots: Arc<SlotPool>,
    capture: Arc<AtomicCaptureState>,
    tracker: CommandBufferTracker,
    completer: SubmissionCompleter,
    writer: Arc<CollectingWriter>,
    device: vk::Device,
    queue: vk::Queue,
    pool: vk::CommandPool,
}

impl Capture {
    /// Full pipeline over a scripted driver, ns-per-tick of 10 and a fixed
    /// CPU/GPU offset.
    fn new() -> Self {
        let driver = Arc::new(ScriptedDriver::default());
        let slots = Arc::new(SlotPool::with_capacity(
            Arc::clone(&driver) as Arc<dyn DeviceDispatch>,
            256,
        ));
        let capture = Arc::new(AtomicCaptureState::new(true));
        let stats = Arc::new(AgentStats::new());
        let timebases = Arc::new(DeviceTimebaseRegistry::new());
        let writer = Arc::new(CollectingWriter::default());

        let tracker = CommandBufferTracker::new(
            Arc::clone(&driver) as Arc<dyn DeviceDispatch>,
            Arc::clone(&slots),
            Arc::clone(&capture) as Arc<dyn CaptureState>,
            Arc::clone(&stats),
        );
        let completer = SubmissionCompleter::new(
            Arc::clone(&driver) as Arc<dyn DeviceDispatch>,
            Arc::clone(&slots),
            Arc::clone(&timebases),
            Arc::clone(&writer) as Arc<dyn RecordWriter>,
            stats,
        );

        let device = vk::Device::from_raw(1);
        slots.register_device(device).expect("register device");
        timebases.register(
            device,
            DeviceTimebase {
                timestamp_period_ns: 10.0,
                cpu_gpu_offset_ns: 7_500,
            },
        );

        let pool = vk::CommandPool::from_raw(10);
        Self {
            driver,
            slots,
            capture,
            tracker,
            completer,
            writer,
            device,
            queue: vk::Queue::from_raw(20),
            pool,
        }
    }

    fn command_buffer(&self, raw: u64) -> vk::CommandBuffer {
        let cb = vk::CommandBuffer::from_raw(raw);
        self.tracker.track(self.device, self.pool, &[cb]);
        cb
    }

    fn submit(&self, cbs: &[vk::CommandBuffer]) {
        let submits = [SubmitBatch::new(cbs.to_vec())];
        self.tracker.pre_submit(self.queue, &submits);
        self.tracker.post_submit(self.queue, &submits);
    }

    fn complete(&self) {
        self.completer
            .complete_submissions(&self.tracker, self.device)
            .expect("complete submissions");
    }
}

#[test]
fn command_buffer_lifecycle_emits_scaled_record_and_frees_slots() {
    let capture = Capture::new();
    let cb = capture.command_buffer(100);

    capture.tracker.mark_begin(cb);
    capture.tracker.mark_end(cb);
    capture.submit(&[cb]);
    assert_eq!(capture.slots.pending_count(capture.device), 2);

    // Begin slot 0 at 1000 ticks, end slot 1 at 3000 ticks.
    capture.driver.set_result(begin_query_index(0), 1_000);
    capture.driver.set_result(end_query_index(1), 3_000);
    capture.complete();

    let records = capture.writer.records.lock();
    assert_eq!(records.len(), 1);
    let record = &records[0];
    assert_eq!(record.command_buffers.len(), 1);
    assert_eq!(record.command_buffers[0].begin_gpu_ns, 10_000);
    assert_eq!(record.command_buffers[0].end_gpu_ns, 30_000);
    assert_eq!(record.gpu_cpu_offset_ns, 7_500);
    assert!(record.meta.pre_submit_cpu_ns > 0);
    assert!(record.meta.post_submit_cpu_ns.expect("post ts") >= record.meta.pre_submit_cpu_ns);

    assert_eq!(capture.slots.pending_count(capture.device), 0);
}

#[test]
fn reset_aborts_recording_and_restores_pool() {
    let capture = Capture::new();
    let cb = capture.command_buffer(100);

    capture.tracker.mark_begin(cb);
    assert_eq!(capture.slots.pending_count(capture.device), 1);

    capture.tracker.reset_cb(cb);
    assert_eq!(capture.slots.pending_count(capture.device), 0);

    capture.complete();
    assert!(capture.writer.records.lock().is_empty());
}

#[test]
fn nested_markers_carry_depth_and_complete_in_end_order() {
    let capture = Capture::new();
    let cb = capture.command_buffer(100);

    capture.tracker.mark_begin(cb);
    capture.tracker.marker_begin(cb, "a");
    capture.tracker.marker_begin(cb, "b");
    capture.tracker.marker_end(cb);
    capture.tracker.marker_end(cb);
    capture.tracker.mark_end(cb);
    capture.submit(&[cb]);

    // Slots in reservation order: cb begin=0, "a"=1, "b"=2, ends=3,4,
    // cb end=5.
    capture.driver.set_result(begin_query_index(0), 100);
    capture.driver.set_result(begin_query_index(1), 110);
    capture.driver.set_result(begin_query_index(2), 120);
    capture.driver.set_result(end_query_index(3), 130);
    capture.driver.set_result(end_query_index(4), 140);
    capture.driver.set_result(end_query_index(5), 150);
    capture.complete();

    let records = capture.writer.records.lock();
    let record = &records[0];
    assert_eq!(record.num_begin_markers, 2);
    assert_eq!(record.markers.len(), 2);

    // Completion order is end order: innermost first.
    assert_eq!(capture.writer.text(record.markers[0].text_key), "b");
    assert_eq!(record.markers[0].depth, 1);
    assert_eq!(record.markers[0].begin_gpu_ns, Some(1_200));
    assert_eq!(record.markers[0].end_gpu_ns, Some(1_300));

    assert_eq!(capture.writer.text(record.markers[1].text_key), "a");
    assert_eq!(record.markers[1].depth, 0);
    assert_eq!(record.markers[1].begin_gpu_ns, Some(1_100));
    assert_eq!(record.markers[1].end_gpu_ns, Some(1_400));

    assert_eq!(capture.slots.pending_count(capture.device), 0);
}

#[test]
fn per_queue_fifo_is_preserved_under_partial_readiness() {
    let capture = Capture::new();
    let first = capture.command_buffer(100);
    let second = capture.command_buffer(101);

    for cb in [first, second] {
        capture.tracker.mark_begin(cb);
        capture.tracker.mark_end(cb);
        capture.submit(&[cb]);
    }

    // Second submission ready, first not: nothing retires.
    capture.driver.set_result(begin_query_index(2), 40);
    capture.driver.set_result(end_query_index(3), 50);
    capture.complete();
    assert!(capture.writer.records.lock().is_empty());
    assert_eq!(capture.tracker.pending_submissions(), 2);

    // First becomes ready: both retire, in submission order.
    capture.driver.set_result(begin_query_index(0), 10);
    capture.driver.set_result(end_query_index(1), 20);
    capture.complete();

    let records = capture.writer.records.lock();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].command_buffers[0].begin_gpu_ns, 100);
    assert_eq!(records[1].command_buffers[0].begin_gpu_ns, 400);
    assert_eq!(capture.tracker.pending_submissions(), 0);
    assert_eq!(capture.slots.pending_count(capture.device), 0);
}

#[test]
fn capture_toggle_yields_structural_markers_without_timestamps() {
    let capture = Capture::new();
    let cb = capture.command_buffer(100);

    // Recording starts with capture off: markers are structural only.
    capture.capture.set(false);
    capture.tracker.mark_begin(cb);
    capture.tracker.marker_begin(cb, "untimed");
    capture.tracker.marker_end(cb);
    capture.tracker.mark_end(cb);

    // Capture comes back before submit; a second buffer provides the
    // awaitable end timestamp.
    capture.capture.set(true);
    let timed = capture.command_buffer(101);
    capture.tracker.mark_begin(timed);
    capture.tracker.mark_end(timed);

    capture.submit(&[cb, timed]);

    capture.driver.set_result(begin_query_index(0), 10);
    capture.driver.set_result(end_query_index(1), 20);
    capture.complete();

    let records = capture.writer.records.lock();
    let record = &records[0];
    assert_eq!(record.command_buffers.len(), 1);
    assert_eq!(record.markers.len(), 1);
    assert_eq!(capture.writer.text(record.markers[0].text_key), "untimed");
    assert_eq!(record.markers[0].begin_gpu_ns, None);
    assert_eq!(record.markers[0].end_gpu_ns, None);
    assert!(record.markers[0].begin_meta.is_none());
    assert_eq!(record.num_begin_markers, 1);
}

#[test]
fn saturated_pool_drops_instrumentation_but_never_state() {
    let driver = Arc::new(ScriptedDriver::default());
    let slots = Arc::new(SlotPool::with_capacity(
        Arc::clone(&driver) as Arc<dyn DeviceDispatch>,
        2,
    ));
    let capture = Arc::new(AtomicCaptureState::new(true));
    let stats = Arc::new(AgentStats::new());
    let tracker = CommandBufferTracker::new(
        Arc::clone(&driver) as Arc<dyn DeviceDispatch>,
        Arc::clone(&slots),
        Arc::clone(&capture) as Arc<dyn CaptureState>,
        Arc::clone(&stats),
    );

    let device = vk::Device::from_raw(1);
    slots.register_device(device).expect("register device");
    let pool = vk::CommandPool::from_raw(10);
    let cb = vk::CommandBuffer::from_raw(100);
    tracker.track(device, pool, &[cb]);

    tracker.mark_begin(cb);
    tracker.mark_end(cb);
    // Pool exhausted: both marker stamps are skipped but the marker
    // structure is still recorded.
    tracker.marker_begin(cb, "starved");
    tracker.marker_end(cb);

    assert_eq!(slots.pending_count(device), 2);
    assert_eq!(stats.snapshot().instrumentation_dropped, 2);

    // The recording is still coherent and can be aborted cleanly.
    tracker.reset_cb(cb);
    assert_eq!(slots.pending_count(device), 0);
}

#[test]
fn every_emitted_slot_is_returned_to_the_pool() {
    let capture = Capture::new();

    // Three frames of work with markers, retired in two waves.
    for frame in 0..3u64 {
        let cb = capture.command_buffer(100 + frame);
        capture.tracker.mark_begin(cb);
        capture.tracker.marker_begin(cb, "frame");
        capture.tracker.marker_end(cb);
        capture.tracker.mark_end(cb);
        capture.submit(&[cb]);
    }
    // Four slots per frame.
    assert_eq!(capture.slots.pending_count(capture.device), 12);

    for slot in 0..12 {
        capture.driver.set_result(begin_query_index(slot), 1_000 + slot as u64);
        capture.driver.set_result(end_query_index(slot), 2_000 + slot as u64);
    }
    capture.complete();

    assert_eq!(capture.writer.records.lock().len(), 3);
    assert_eq!(capture.slots.pending_count(capture.device), 0);
    assert_eq!(capture.tracker.pending_submissions(), 0);
}
