use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use ash::vk;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::Config;
use crate::emit::jsonl::JsonlWriter;
use crate::emit::RecordWriter;
use crate::export::health::HealthMetrics;
use crate::perf::delay::DelayedEventProcessor;
use crate::perf::event::{EventVisitor, PerfEvent, SourceId};
use crate::stats::AgentStats;
use crate::vulkan::complete::SubmissionCompleter;
use crate::vulkan::dispatch::{
    AtomicCaptureState, CaptureState, DeviceDispatch, DeviceTimebase, DeviceTimebaseRegistry,
};
use crate::vulkan::slots::SlotPool;
use crate::vulkan::tracker::CommandBufferTracker;

/// GPU capture pipeline, built once a driver dispatch is attached.
struct GpuPipeline {
    slots: Arc<SlotPool>,
    tracker: Arc<CommandBufferTracker>,
    completer: Arc<SubmissionCompleter>,
    timebases: Arc<DeviceTimebaseRegistry>,
}

/// Agent orchestrates all components: event merging, GPU submission
/// completion, record output, and health metrics.
///
/// Perf sources push `(source, event)` through the channel obtained from
/// [`Agent::event_sender`]; the Vulkan layer shim drives the tracker
/// obtained from [`Agent::tracker`].
pub struct Agent {
    cfg: Config,
    health: Option<Arc<HealthMetrics>>,
    stats: Arc<AgentStats>,
    capture: Arc<AtomicCaptureState>,
    writer: Arc<JsonlWriter>,
    gpu: Option<GpuPipeline>,
    event_tx: mpsc::Sender<(SourceId, PerfEvent)>,
    event_rx: Option<mpsc::Receiver<(SourceId, PerfEvent)>>,
    visitors: Vec<Box<dyn EventVisitor>>,
    cancel: CancellationToken,
    merge_task: Option<JoinHandle<()>>,
    completion_task: Option<JoinHandle<()>>,
}

impl Agent {
    /// Creates a new Agent, opening the record output and health metrics.
    pub fn new(cfg: Config) -> Result<Self> {
        cfg.validate()?;

        let health = if cfg.health.enabled {
            Some(Arc::new(
                HealthMetrics::new(&cfg.health.addr).context("creating health metrics")?,
            ))
        } else {
            None
        };

        let writer =
            Arc::new(JsonlWriter::create(&cfg.emit.output).context("opening record output")?);

        let (event_tx, event_rx) = mpsc::channel(cfg.event_channel_capacity);

        Ok(Self {
            capture: Arc::new(AtomicCaptureState::new(cfg.capture.start_enabled)),
            cfg,
            health,
            stats: Arc::new(AgentStats::new()),
            writer,
            gpu: None,
            event_tx,
            event_rx: Some(event_rx),
            visitors: Vec::new(),
            cancel: CancellationToken::new(),
            merge_task: None,
            completion_task: None,
        })
    }

    /// Build the GPU capture pipeline over a driver dispatch table.
    /// Must be called before `start` for GPU capture to run.
    pub fn attach_gpu(&mut self, dispatch: Arc<dyn DeviceDispatch>) {
        let slots = Arc::new(SlotPool::with_capacity(
            Arc::clone(&dispatch),
            self.cfg.slot_capacity,
        ));
        let timebases = Arc::new(DeviceTimebaseRegistry::new());
        let tracker = Arc::new(CommandBufferTracker::new(
            Arc::clone(&dispatch),
            Arc::clone(&slots),
            Arc::clone(&self.capture) as Arc<dyn CaptureState>,
            Arc::clone(&self.stats),
        ));
        let completer = Arc::new(SubmissionCompleter::new(
            dispatch,
            Arc::clone(&slots),
            Arc::clone(&timebases),
            Arc::clone(&self.writer) as Arc<dyn RecordWriter>,
            Arc::clone(&self.stats),
        ));

        self.gpu = Some(GpuPipeline {
            slots,
            tracker,
            completer,
            timebases,
        });
    }

    /// Create the device's query pool and record its calibrated timebase.
    pub fn register_device(&self, device: vk::Device, timebase: DeviceTimebase) -> Result<()> {
        let gpu = self.gpu.as_ref().context("no GPU dispatch attached")?;
        gpu.slots
            .register_device(device)
            .context("creating device query pool")?;
        gpu.timebases.register(device, timebase);

        if let Some(health) = &self.health {
            health.devices_registered.set(gpu.slots.devices().len() as f64);
        }

        info!(?device, "device registered");
        Ok(())
    }

    /// The command-buffer tracker driven by the layer shim, if GPU capture
    /// is attached.
    pub fn tracker(&self) -> Option<Arc<CommandBufferTracker>> {
        self.gpu.as_ref().map(|gpu| Arc::clone(&gpu.tracker))
    }

    /// Capture toggle shared with the capture-control collaborator.
    pub fn capture_state(&self) -> Arc<AtomicCaptureState> {
        Arc::clone(&self.capture)
    }

    /// Sender half of the perf event channel.
    pub fn event_sender(&self) -> mpsc::Sender<(SourceId, PerfEvent)> {
        self.event_tx.clone()
    }

    /// Register a visitor for the merged event stream. Must be called
    /// before `start`.
    pub fn add_visitor(&mut self, visitor: Box<dyn EventVisitor>) {
        self.visitors.push(visitor);
    }

    /// Start all components and begin capture.
    pub async fn start(&mut self) -> Result<()> {
        if let Some(health) = &self.health {
            health.start().await.context("starting health metrics server")?;
            info!("health metrics server started");
        }

        self.spawn_merge_loop()?;

        if self.gpu.is_some() {
            self.spawn_completion_loop();
        } else {
            info!("no GPU dispatch attached, GPU capture disabled");
        }

        self.spawn_stats_reporter();

        info!(
            capturing = self.capture.is_capturing(),
            output = %self.cfg.emit.output.display(),
            "agent fully started",
        );

        Ok(())
    }

    /// Gracefully stop all components, draining buffered events.
    pub async fn stop(&mut self) -> Result<()> {
        self.cancel.cancel();

        if let Some(task) = self.merge_task.take() {
            let _ = task.await;
        }
        if let Some(task) = self.completion_task.take() {
            let _ = task.await;
        }

        self.writer.flush().context("flushing record output")?;

        if let Some(health) = &self.health {
            health.stop().await?;
        }

        info!("agent stopped");
        Ok(())
    }

    /// Spawn the loop that feeds the delayed processor and releases aged
    /// events to visitors.
    fn spawn_merge_loop(&mut self) -> Result<()> {
        let mut rx = self.event_rx.take().context("agent already started")?;
        let mut processor = DelayedEventProcessor::new(self.cfg.safety_delay);
        for visitor in self.visitors.drain(..) {
            processor.add_visitor(visitor);
        }

        let cancel = self.cancel.clone();
        let stats = Arc::clone(&self.stats);
        let health = self.health.clone();
        let interval = self.cfg.process_interval;

        self.merge_task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            let mut published = (0u64, 0u64);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    received = rx.recv() => {
                        match received {
                            Some((source, event)) => processor.add(source, event),
                            None => break,
                        }
                    }
                    _ = ticker.tick() => {
                        processor.process_old();
                        publish_merge_stats(&processor, &stats, health.as_deref(), &mut published);
                    }
                }
            }

            // Pull in whatever the sources managed to send, then flush
            // everything regardless of age.
            while let Ok((source, event)) = rx.try_recv() {
                processor.add(source, event);
            }
            processor.process_all();
            publish_merge_stats(&processor, &stats, health.as_deref(), &mut published);

            debug!("merge loop stopped");
        }));

        Ok(())
    }

    /// Spawn the loop polling GPU query results for ready submissions.
    fn spawn_completion_loop(&mut self) {
        let Some(gpu) = &self.gpu else {
            return;
        };
        let slots = Arc::clone(&gpu.slots);
        let tracker = Arc::clone(&gpu.tracker);
        let completer = Arc::clone(&gpu.completer);
        let cancel = self.cancel.clone();
        let health = self.health.clone();
        let interval = self.cfg.completion_poll_interval;

        self.completion_task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        for device in slots.devices() {
                            if let Err(e) = completer.complete_submissions(&tracker, device) {
                                error!(error = %e, ?device, "GPU readback failed");
                                cancel.cancel();
                                return;
                            }
                        }

                        if let Some(health) = &health {
                            health
                                .submissions_pending
                                .set(tracker.pending_submissions() as f64);
                            let pending: usize = slots
                                .devices()
                                .iter()
                                .map(|device| slots.pending_count(*device))
                                .sum();
                            health.slots_pending.set(pending as f64);
                        }
                    }
                }
            }

            debug!("completion loop stopped");
        }));
    }

    /// Spawn the periodic stats reporter, mirroring counters into
    /// prometheus.
    fn spawn_stats_reporter(&self) {
        let cancel = self.cancel.clone();
        let stats = Arc::clone(&self.stats);
        let health = self.health.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(60));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        let snap = stats.snapshot();

                        if let Some(health) = &health {
                            health.events_merged.inc_by(snap.events_merged as f64);
                            health.events_discarded.inc_by(snap.events_discarded as f64);
                            health
                                .instrumentation_dropped
                                .inc_by(snap.instrumentation_dropped as f64);
                            health
                                .submissions_completed
                                .inc_by(snap.submissions_completed as f64);
                            health.records_emitted.inc_by(snap.records_emitted as f64);
                        }

                        if snap.total() == 0 {
                            continue;
                        }

                        info!(
                            merged = snap.events_merged,
                            discarded = snap.events_discarded,
                            dropped = snap.instrumentation_dropped,
                            submissions = snap.submissions_completed,
                            records = snap.records_emitted,
                            "capture stats (60s)",
                        );
                    }
                }
            }
        });
    }
}

/// Push merge-loop counter deltas into the shared stats and gauges.
fn publish_merge_stats(
    processor: &DelayedEventProcessor,
    stats: &AgentStats,
    health: Option<&HealthMetrics>,
    published: &mut (u64, u64),
) {
    let merged = processor.processed();
    let discarded = processor.discarded_out_of_order();

    stats
        .events_merged
        .fetch_add(merged - published.0, Ordering::Relaxed);
    stats
        .events_discarded
        .fetch_add(discarded - published.1, Ordering::Relaxed);
    *published = (merged, discarded);

    if let Some(health) = health {
        health.events_buffered.set(processor.buffered() as f64);
    }
}
