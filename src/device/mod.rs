//! Device-access boundary.
//!
//! The capture engine never performs bus I/O itself. It talks to probes
//! through the [`Device`] trait, and obtains devices from a
//! [`DeviceContext`] that enumerates them in a stable order. Backends:
//! - [`sim`]: the simulated cape, always built
//! - `iio`: a cape reached over the network with libiio, behind the `iio`
//!   cargo feature

#[cfg(feature = "iio")]
pub mod iio;
pub mod sim;
#[cfg(test)]
pub mod tracked;

use crate::error::DeviceError;

#[cfg(feature = "iio")]
pub use self::iio::IioContext;
pub use sim::{SimulatedCape, SimulatedDevice, SimulationConfig};

/// Attribute holding the oversampling ratio.
pub const ATTR_OVERSAMPLING_RATIO: &str = "in_oversampling_ratio";
/// Attribute controlling asynchronous (non-blocking) readout.
pub const ATTR_ASYNC_READOUT: &str = "in_allow_async_readout";
/// Attribute holding the sampling frequency in Hz.
pub const ATTR_SAMPLING_FREQUENCY: &str = "in_sampling_frequency";
/// Channel attribute holding the raw-to-physical scale factor.
pub const CHANNEL_ATTR_SCALE: &str = "scale";

/// One measurement device, exclusively owned by a probe.
///
/// Implementations must be [`Send`] so a probe can be moved onto its
/// capture worker. Buffer operations act on the device's single capture
/// buffer; samples are fixed-width little-endian `i16`.
pub trait Device: Send {
    /// Backend identifier, e.g. `iio:device0`.
    fn id(&self) -> &str;

    /// Driver name, e.g. `ina226`.
    fn name(&self) -> &str;

    fn read_attr(&self, attr: &str) -> Result<String, DeviceError>;

    fn write_attr(&mut self, attr: &str, value: &str) -> Result<(), DeviceError>;

    fn has_channel(&self, channel_id: &str) -> bool;

    fn set_channel_enabled(&mut self, channel_id: &str, enabled: bool) -> Result<(), DeviceError>;

    fn read_channel_attr(&self, channel_id: &str, attr: &str) -> Result<String, DeviceError>;

    /// Allocate a buffer holding `samples` samples per enabled channel.
    fn create_buffer(&mut self, samples: usize, cyclic: bool) -> Result<(), DeviceError>;

    /// Block until the next batch of samples is available.
    fn refill_buffer(&mut self) -> Result<(), DeviceError>;

    /// Raw bytes of one channel from the latest batch.
    fn read_channel_raw(&self, channel_id: &str) -> Result<Vec<u8>, DeviceError>;

    /// Release the buffer. Must be idempotent.
    fn destroy_buffer(&mut self);
}

/// An enumerable set of devices.
///
/// Devices are returned in enumeration order; the registry binds them
/// positionally to populated slots.
pub trait DeviceContext {
    /// Context description, for logging.
    fn description(&self) -> String;

    fn into_devices(self: Box<Self>) -> Vec<Box<dyn Device>>;
}
