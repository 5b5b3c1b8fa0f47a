use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use ash::vk;
use parking_lot::RwLock;
use thiserror::Error;

/// Errors surfaced by the driver dispatch collaborator.
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("query pool creation failed: {0:?}")]
    CreateQueryPool(vk::Result),
    #[error("query result read failed: {0:?}")]
    QueryRead(vk::Result),
}

/// The slice of the device dispatch table the capture layer invokes.
///
/// The layer shim implements this over the table obtained from
/// `vkGetDeviceProcAddr`; tests substitute an in-memory driver. Query
/// indices are physical indices into the device's timestamp query pool.
pub trait DeviceDispatch: Send + Sync {
    /// `vkCreateQueryPool` with `VK_QUERY_TYPE_TIMESTAMP`.
    fn create_query_pool(
        &self,
        device: vk::Device,
        query_count: u32,
    ) -> Result<vk::QueryPool, DriverError>;

    /// `vkDestroyQueryPool`.
    fn destroy_query_pool(&self, device: vk::Device, pool: vk::QueryPool);

    /// Host-side `vkResetQueryPool`.
    fn reset_query_pool(
        &self,
        device: vk::Device,
        pool: vk::QueryPool,
        first_query: u32,
        query_count: u32,
    );

    /// `vkCmdWriteTimestamp` on the given command buffer's stream.
    fn cmd_write_timestamp(
        &self,
        command_buffer: vk::CommandBuffer,
        stage: vk::PipelineStageFlags,
        pool: vk::QueryPool,
        query: u32,
    );

    /// `vkGetQueryPoolResults` for a single 64-bit result without waiting.
    /// `Ok(None)` means the GPU has not written the query yet.
    fn get_query_result_u64(
        &self,
        device: vk::Device,
        pool: vk::QueryPool,
        query: u32,
    ) -> Result<Option<u64>, DriverError>;
}

/// Whether the profiler is currently capturing. Polled independently at
/// every instrumentation entry point; consecutive reads may differ while
/// capture is being toggled.
pub trait CaptureState: Send + Sync {
    fn is_capturing(&self) -> bool;
}

/// Capture flag toggled by the capture-control collaborator.
#[derive(Debug, Default)]
pub struct AtomicCaptureState {
    capturing: AtomicBool,
}

impl AtomicCaptureState {
    pub fn new(capturing: bool) -> Self {
        Self {
            capturing: AtomicBool::new(capturing),
        }
    }

    pub fn set(&self, capturing: bool) {
        self.capturing.store(capturing, Ordering::Relaxed);
    }
}

impl CaptureState for AtomicCaptureState {
    fn is_capturing(&self) -> bool {
        self.capturing.load(Ordering::Relaxed)
    }
}

/// Per-device timestamp scaling and clock correlation, produced by the
/// external calibration collaborator.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DeviceTimebase {
    /// Nanoseconds per GPU timestamp tick (`timestampPeriod`).
    pub timestamp_period_ns: f64,
    /// Approximate `cpu_ts - gpu_ts` offset in nanoseconds.
    pub cpu_gpu_offset_ns: i64,
}

/// Registry of calibrated device timebases.
#[derive(Debug, Default)]
pub struct DeviceTimebaseRegistry {
    devices: RwLock<HashMap<vk::Device, DeviceTimebase>>,
}

impl DeviceTimebaseRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, device: vk::Device, timebase: DeviceTimebase) {
        self.devices.write().insert(device, timebase);
    }

    pub fn unregister(&self, device: vk::Device) {
        self.devices.write().remove(&device);
    }

    pub fn get(&self, device: vk::Device) -> Option<DeviceTimebase> {
        self.devices.read().get(&device).copied()
    }
}
