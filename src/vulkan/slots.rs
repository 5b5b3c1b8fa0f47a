use std::collections::HashMap;
use std::sync::Arc;

use ash::vk;
use parking_lot::{Mutex, RwLock};
use tracing::debug;

use super::dispatch::{DeviceDispatch, DriverError};

/// Index of a logical timestamp query slot.
pub type SlotIndex = u32;

/// Logical slots per device. Each logical slot owns two physical queries,
/// so the driver pool is created with twice this count.
pub const NUM_LOGICAL_QUERY_SLOTS: u32 = 16_384;

/// Physical timestamp queries per device pool.
pub const NUM_PHYSICAL_QUERY_SLOTS: u32 = NUM_LOGICAL_QUERY_SLOTS * 2;

/// Physical query index used for begin-of-range timestamps.
pub const fn begin_query_index(slot: SlotIndex) -> u32 {
    slot * 2
}

/// Physical query index used for end-of-range timestamps.
pub const fn end_query_index(slot: SlotIndex) -> u32 {
    slot * 2 + 1
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Free,
    Pending,
}

#[derive(Debug)]
struct DeviceSlots {
    query_pool: vk::QueryPool,
    states: Vec<SlotState>,
    next_free_hint: u32,
    pending: usize,
}

/// Fixed-capacity allocator of timestamp query slots, one pool per logical
/// device.
///
/// A slot is `Pending` from reservation until it is either released (its
/// queries were read back) or rolled back (the recording was abandoned
/// before the GPU could write them). Saturation is reported as `None` and
/// must make the caller skip instrumentation rather than stall the driver.
pub struct SlotPool {
    dispatch: Arc<dyn DeviceDispatch>,
    devices: RwLock<HashMap<vk::Device, Mutex<DeviceSlots>>>,
    capacity: u32,
}

impl SlotPool {
    pub fn new(dispatch: Arc<dyn DeviceDispatch>) -> Self {
        Self::with_capacity(dispatch, NUM_LOGICAL_QUERY_SLOTS)
    }

    /// A pool with a non-default slot count. Smaller pools are useful for
    /// exercising saturation.
    pub fn with_capacity(dispatch: Arc<dyn DeviceDispatch>, capacity: u32) -> Self {
        assert!(capacity > 0, "slot pool capacity must be positive");
        Self {
            dispatch,
            devices: RwLock::new(HashMap::new()),
            capacity,
        }
    }

    /// Create and reset the device's timestamp query pool and mark all
    /// slots free.
    pub fn register_device(&self, device: vk::Device) -> Result<(), DriverError> {
        let query_pool = self.dispatch.create_query_pool(device, self.capacity * 2)?;
        self.dispatch
            .reset_query_pool(device, query_pool, 0, self.capacity * 2);

        debug!(?device, ?query_pool, capacity = self.capacity, "query pool ready");

        self.devices.write().insert(
            device,
            Mutex::new(DeviceSlots {
                query_pool,
                states: vec![SlotState::Free; self.capacity as usize],
                next_free_hint: 0,
                pending: 0,
            }),
        );

        Ok(())
    }

    /// Drop the device's slot state and destroy its query pool.
    pub fn unregister_device(&self, device: vk::Device) {
        if let Some(entry) = self.devices.write().remove(&device) {
            let slots = entry.into_inner();
            self.dispatch.destroy_query_pool(device, slots.query_pool);
        }
    }

    /// Registered devices, in no particular order.
    pub fn devices(&self) -> Vec<vk::Device> {
        self.devices.read().keys().copied().collect()
    }

    /// Reserve a free slot, marking it pending. `None` when every slot is
    /// pending on the GPU.
    pub fn reserve(&self, device: vk::Device) -> Option<SlotIndex> {
        let devices = self.devices.read();
        let mut slots = self.device_slots(&devices, device).lock();

        let start = slots.next_free_hint;
        let mut current = start;
        loop {
            if slots.states[current as usize] == SlotState::Free {
                slots.states[current as usize] = SlotState::Pending;
                slots.next_free_hint = (current + 1) % self.capacity;
                slots.pending += 1;
                return Some(current);
            }
            current = (current + 1) % self.capacity;
            if current == start {
                return None;
            }
        }
    }

    /// Return read-back slots to the pool, resetting their physical
    /// queries for reuse.
    pub fn release(&self, device: vk::Device, released: &[SlotIndex]) {
        if released.is_empty() {
            return;
        }
        let devices = self.devices.read();
        let mut slots = self.device_slots(&devices, device).lock();

        for &slot in released {
            self.transition_to_free(&mut slots, slot);
            self.dispatch
                .reset_query_pool(device, slots.query_pool, begin_query_index(slot), 2);
        }
    }

    /// Return slots whose queries were never written. No reset is issued.
    pub fn rollback(&self, device: vk::Device, abandoned: &[SlotIndex]) {
        if abandoned.is_empty() {
            return;
        }
        let devices = self.devices.read();
        let mut slots = self.device_slots(&devices, device).lock();

        for &slot in abandoned {
            self.transition_to_free(&mut slots, slot);
        }
    }

    /// The device's timestamp query pool handle.
    pub fn query_pool_handle(&self, device: vk::Device) -> vk::QueryPool {
        let devices = self.devices.read();
        let query_pool = self.device_slots(&devices, device).lock().query_pool;
        query_pool
    }

    /// Number of slots currently pending on the GPU.
    pub fn pending_count(&self, device: vk::Device) -> usize {
        let devices = self.devices.read();
        let pending = self.device_slots(&devices, device).lock().pending;
        pending
    }

    fn transition_to_free(&self, slots: &mut DeviceSlots, slot: SlotIndex) {
        assert!(slot < self.capacity, "slot {slot} out of range");
        assert_eq!(
            slots.states[slot as usize],
            SlotState::Pending,
            "slot {slot} returned while not pending",
        );
        slots.states[slot as usize] = SlotState::Free;
        slots.pending -= 1;
    }

    fn device_slots<'a>(
        &self,
        devices: &'a HashMap<vk::Device, Mutex<DeviceSlots>>,
        device: vk::Device,
    ) -> &'a Mutex<DeviceSlots> {
        devices
            .get(&device)
            .unwrap_or_else(|| panic!("device {device:?} has no query pool"))
    }
}
