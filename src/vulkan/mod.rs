//! Vulkan-side capture: timestamp query slot pool, command-buffer tracking,
//! and submission completion.

pub mod complete;
pub mod dispatch;
pub mod slots;
pub mod tracker;

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU64, Ordering};

    use ash::vk;
    use parking_lot::Mutex;

    use super::dispatch::{DeviceDispatch, DriverError};

    /// A recorded `vkCmdWriteTimestamp` call.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TimestampWrite {
        pub command_buffer: vk::CommandBuffer,
        pub stage: vk::PipelineStageFlags,
        pub query: u32,
    }

    /// In-memory driver: records timestamp writes and serves scripted
    /// query results.
    #[derive(Default)]
    pub struct FakeDispatch {
        next_pool: AtomicU64,
        pub writes: Mutex<Vec<TimestampWrite>>,
        pub resets: Mutex<Vec<(u32, u32)>>,
        results: Mutex<HashMap<u32, u64>>,
    }

    impl FakeDispatch {
        pub fn new() -> Self {
            Self::default()
        }

        /// Script a ready query result for a physical query index.
        pub fn set_result(&self, query: u32, ticks: u64) {
            self.results.lock().insert(query, ticks);
        }

        pub fn write_count(&self) -> usize {
            self.writes.lock().len()
        }
    }

    impl DeviceDispatch for FakeDispatch {
        fn create_query_pool(
            &self,
            _device: vk::Device,
            _query_count: u32,
        ) -> Result<vk::QueryPool, DriverError> {
            use ash::vk::Handle;
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
            self.resets.lock().push((first_query, query_count));
            let mut results = self.results.lock();
            for query in first_query..first_query + query_count {
                results.remove(&query);
            }
        }

        fn cmd_write_timestamp(
            &self,
            command_buffer: vk::CommandBuffer,
            stage: vk::PipelineStageFlags,
            _pool: vk::QueryPool,
            query: u32,
        ) {
            self.writes.lock().push(TimestampWrite {
                command_buffer,
                stage,
                query,
            });
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

    pub fn device(raw: u64) -> vk::Device {
        use ash::vk::Handle;
        vk::Device::from_raw(raw)
    }

    pub fn command_buffer(raw: u64) -> vk::CommandBuffer {
        use ash::vk::Handle;
        vk::CommandBuffer::from_raw(raw)
    }

    pub fn command_pool(raw: u64) -> vk::CommandPool {
        use ash::vk::Handle;
        vk::CommandPool::from_raw(raw)
    }

    pub fn queue(raw: u64) -> vk::Queue {
        use ash::vk::Handle;
        vk::Queue::from_raw(raw)
    }
}
