//! Instrumented device for lifecycle tests.

use super::{Device, SimulatedDevice};
use crate::error::DeviceError;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Shared view of what happened to a [`TrackedDevice`].
#[derive(Debug, Clone, Default)]
pub struct DeviceTracker {
    released: Arc<AtomicBool>,
    refills: Arc<AtomicU64>,
}

impl DeviceTracker {
    /// Whether the capture buffer was destroyed.
    pub fn released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    /// Refills attempted so far.
    pub fn refills(&self) -> u64 {
        self.refills.load(Ordering::SeqCst)
    }
}

/// A simulated device that reports refills and buffer release to a
/// [`DeviceTracker`], and can be made to panic on refill.
#[derive(Debug)]
pub struct TrackedDevice {
    inner: SimulatedDevice,
    tracker: DeviceTracker,
    panic_on_refill: bool,
}

impl TrackedDevice {
    pub fn new(inner: SimulatedDevice) -> (Self, DeviceTracker) {
        let tracker = DeviceTracker::default();
        let device = Self {
            inner,
            tracker: tracker.clone(),
            panic_on_refill: false,
        };
        (device, tracker)
    }

    pub fn panicking(mut self) -> Self {
        self.panic_on_refill = true;
        self
    }
}

impl Device for TrackedDevice {
    fn id(&self) -> &str {
        self.inner.id()
    }

    fn name(&self) -> &str {
        self.inner.name()
    }

    fn read_attr(&self, attr: &str) -> Result<String, DeviceError> {
        self.inner.read_attr(attr)
    }

    fn write_attr(&mut self, attr: &str, value: &str) -> Result<(), DeviceError> {
        self.inner.write_attr(attr, value)
    }

    fn has_channel(&self, channel_id: &str) -> bool {
        self.inner.has_channel(channel_id)
    }

    fn set_channel_enabled(&mut self, channel_id: &str, enabled: bool) -> Result<(), DeviceError> {
        self.inner.set_channel_enabled(channel_id, enabled)
    }

    fn read_channel_attr(&self, channel_id: &str, attr: &str) -> Result<String, DeviceError> {
        self.inner.read_channel_attr(channel_id, attr)
    }

    fn create_buffer(&mut self, samples: usize, cyclic: bool) -> Result<(), DeviceError> {
        self.inner.create_buffer(samples, cyclic)
    }

    fn refill_buffer(&mut self) -> Result<(), DeviceError> {
        self.tracker.refills.fetch_add(1, Ordering::SeqCst);
        if self.panic_on_refill {
            panic!("device lost");
        }
        self.inner.refill_buffer()
    }

    fn read_channel_raw(&self, channel_id: &str) -> Result<Vec<u8>, DeviceError> {
        self.inner.read_channel_raw(channel_id)
    }

    fn destroy_buffer(&mut self) {
        self.tracker.released.store(true, Ordering::SeqCst);
        self.inner.destroy_buffer();
    }
}
