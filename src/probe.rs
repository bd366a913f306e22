//! Probe control interface.
//!
//! A [`Probe`] is a measurement module bound to one cape slot and to the
//! device that serves it. Every operation forwards to the device and
//! reports failures as [`ProbeError`]; nothing here panics.

use crate::cape::ProbeDescriptor;
use crate::device::{
    Device, ATTR_ASYNC_READOUT, ATTR_OVERSAMPLING_RATIO, ATTR_SAMPLING_FREQUENCY,
    CHANNEL_ATTR_SCALE,
};
use crate::error::ProbeError;
use crate::models::{Channel, ChannelSamples, ProbeKind};
use std::fmt;
use tracing::{debug, info, trace, warn};

/// Width of one raw sample in bytes.
const SAMPLE_WIDTH: usize = std::mem::size_of::<i16>();

/// A probe plugged into a cape slot.
pub struct Probe {
    slot: usize,
    kind: ProbeKind,
    shunt_uohm: u32,
    power_switch: bool,
    device: Box<dyn Device>,
    buffer_capacity: Option<usize>,
}

impl fmt::Debug for Probe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Probe")
            .field("slot", &self.slot)
            .field("kind", &self.kind)
            .field("shunt_uohm", &self.shunt_uohm)
            .field("power_switch", &self.power_switch)
            .field("device", &self.device.id())
            .field("buffer_capacity", &self.buffer_capacity)
            .finish()
    }
}

impl Probe {
    pub fn new(
        slot: usize,
        kind: ProbeKind,
        shunt_uohm: u32,
        power_switch: bool,
        device: Box<dyn Device>,
    ) -> Self {
        debug!(
            "Probe created: slot {} type {} shunt {} uOhm power switch {} ({} {})",
            slot,
            kind,
            shunt_uohm,
            power_switch,
            device.id(),
            device.name()
        );
        Self {
            slot,
            kind,
            shunt_uohm,
            power_switch,
            device,
            buffer_capacity: None,
        }
    }

    /// Bind a parsed slot description to a device.
    pub fn from_descriptor(slot: usize, descriptor: ProbeDescriptor, device: Box<dyn Device>) -> Self {
        Self::new(
            slot,
            descriptor.kind,
            descriptor.shunt_uohm,
            descriptor.power_switch,
            device,
        )
    }

    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn kind(&self) -> ProbeKind {
        self.kind
    }

    /// Shunt resistance in micro-ohms.
    pub fn shunt_uohm(&self) -> u32 {
        self.shunt_uohm
    }

    pub fn has_power_switch(&self) -> bool {
        self.power_switch
    }

    /// Identifier of the bound device.
    pub fn device_id(&self) -> &str {
        self.device.id()
    }

    pub fn device_name(&self) -> &str {
        self.device.name()
    }

    /// Capacity of the allocated capture buffer, if any.
    #[allow(dead_code)] // Inspected by the worker and probe tests
    pub fn buffer_capacity(&self) -> Option<usize> {
        self.buffer_capacity
    }

    /// Switch the probe's power output.
    ///
    /// The power switch has no control path yet: on probes that have one
    /// this only logs the request.
    #[allow(dead_code)] // No capture step switches rails yet
    pub fn enable_power(&mut self, enable: bool) -> Result<(), ProbeError> {
        if !self.power_switch {
            warn!("Slot {}: no power switch on this probe", self.slot);
            return Err(ProbeError::NoPowerSwitch { slot: self.slot });
        }
        info!(
            "Slot {}: power {}",
            self.slot,
            if enable { "enabled" } else { "disabled" }
        );
        Ok(())
    }

    pub fn set_oversampling_ratio(&mut self, ratio: u32) -> Result<(), ProbeError> {
        self.device
            .write_attr(ATTR_OVERSAMPLING_RATIO, &ratio.to_string())
            .map_err(|source| ProbeError::Oversampling {
                slot: self.slot,
                ratio,
                source,
            })?;
        debug!("Slot {}: oversampling ratio set to {}", self.slot, ratio);
        Ok(())
    }

    pub fn enable_async_reads(&mut self, enable: bool) -> Result<(), ProbeError> {
        let value = if enable { "1" } else { "0" };
        self.device
            .write_attr(ATTR_ASYNC_READOUT, value)
            .map_err(|source| ProbeError::AsyncReads {
                slot: self.slot,
                source,
            })?;
        debug!(
            "Slot {}: asynchronous reads {}",
            self.slot,
            if enable { "enabled" } else { "disabled" }
        );
        Ok(())
    }

    /// Configured sampling frequency in Hz.
    pub fn sampling_frequency(&self) -> Result<u32, ProbeError> {
        let value = self
            .device
            .read_attr(ATTR_SAMPLING_FREQUENCY)
            .map_err(|source| ProbeError::SamplingFrequency {
                slot: self.slot,
                source,
            })?;
        let freq = value
            .trim()
            .parse::<u32>()
            .map_err(|_| ProbeError::InvalidSamplingFrequency {
                slot: self.slot,
                value: value.clone(),
            })?;
        debug!("Slot {}: sampling frequency {} Hz", self.slot, freq);
        Ok(freq)
    }

    pub fn enable_channel(&mut self, channel: Channel, enable: bool) -> Result<(), ProbeError> {
        let raw_id = channel.raw_id();
        if !self.device.has_channel(raw_id) {
            return Err(ProbeError::ChannelNotFound {
                slot: self.slot,
                channel,
                raw_id,
            });
        }
        self.device
            .set_channel_enabled(raw_id, enable)
            .map_err(|source| ProbeError::ChannelToggle {
                slot: self.slot,
                channel,
                action: if enable { "enable" } else { "disable" },
                source,
            })?;
        debug!(
            "Slot {}: channel {} ({}) {}",
            self.slot,
            channel,
            raw_id,
            if enable { "enabled" } else { "disabled" }
        );
        Ok(())
    }

    /// Allocate a buffer of `capacity` samples per enabled channel.
    pub fn allocate_buffer(&mut self, capacity: usize, cyclic: bool) -> Result<(), ProbeError> {
        if capacity == 0 {
            return Err(ProbeError::ZeroCapacity { slot: self.slot });
        }
        self.release_buffer();
        self.device
            .create_buffer(capacity, cyclic)
            .map_err(|source| ProbeError::BufferAllocation {
                slot: self.slot,
                capacity,
                source,
            })?;
        self.buffer_capacity = Some(capacity);
        debug!(
            "Slot {}: buffer allocated (count={}, cyclic={})",
            self.slot, capacity, cyclic
        );
        Ok(())
    }

    /// Block until the next batch of samples is available.
    pub fn refill_buffer(&mut self) -> Result<(), ProbeError> {
        if self.buffer_capacity.is_none() {
            return Err(ProbeError::BufferNotAllocated { slot: self.slot });
        }
        self.device
            .refill_buffer()
            .map_err(|source| ProbeError::Refill {
                slot: self.slot,
                source,
            })?;
        trace!("Slot {}: buffer refilled", self.slot);
        Ok(())
    }

    /// Scaled samples of `channel` from the latest refill.
    pub fn read_channel(&self, channel: Channel) -> Result<ChannelSamples, ProbeError> {
        if self.buffer_capacity.is_none() {
            return Err(ProbeError::BufferNotAllocated { slot: self.slot });
        }
        let raw_id = channel.raw_id();
        let read_error = |source| ProbeError::ChannelRead {
            slot: self.slot,
            channel,
            source,
        };

        let raw = self.device.read_channel_raw(raw_id).map_err(read_error)?;
        let scale_text = self
            .device
            .read_channel_attr(raw_id, CHANNEL_ATTR_SCALE)
            .map_err(read_error)?;
        let scale = scale_text
            .trim()
            .parse::<f64>()
            .map_err(|_| ProbeError::InvalidScale {
                slot: self.slot,
                channel,
                value: scale_text.clone(),
            })?;

        let samples = decode_samples(&raw, scale);
        trace!(
            "Slot {}: {} samples read from {} (scale {})",
            self.slot,
            samples.len(),
            channel,
            scale
        );

        Ok(ChannelSamples {
            channel,
            unit: channel.unit(),
            samples,
        })
    }

    /// Free the capture buffer, if one is allocated.
    pub fn release_buffer(&mut self) {
        if self.buffer_capacity.take().is_some() {
            self.device.destroy_buffer();
            debug!("Slot {}: buffer released", self.slot);
        }
    }
}

impl Drop for Probe {
    fn drop(&mut self) {
        self.release_buffer();
    }
}

/// Decode little-endian `i16` samples and apply `scale`.
///
/// A trailing odd byte is ignored.
fn decode_samples(raw: &[u8], scale: f64) -> Vec<f64> {
    let values = raw
        .chunks_exact(SAMPLE_WIDTH)
        .map(|b| f64::from(i16::from_le_bytes([b[0], b[1]])));

    if scale == 1.0 {
        values.collect()
    } else {
        values.map(|v| v * scale).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{SimulatedDevice, SimulationConfig};
    use crate::error::DeviceError;

    fn probe_with(device: SimulatedDevice, power_switch: bool) -> Probe {
        Probe::new(1, ProbeKind::Jack, 10_000, power_switch, Box::new(device))
    }

    fn device() -> SimulatedDevice {
        SimulatedDevice::new(
            0,
            &SimulationConfig {
                realtime: false,
                ..Default::default()
            },
        )
    }

    #[test]
    fn test_decode_samples() {
        let raw = [0x10, 0x00, 0xff, 0xff, 0x00, 0x80, 0x01];
        assert_eq!(decode_samples(&raw, 1.0), vec![16.0, -1.0, -32768.0]);
        assert_eq!(decode_samples(&raw[..4], 0.5), vec![8.0, -0.5]);
    }

    #[test]
    fn test_configuration_operations() {
        let mut probe = probe_with(device(), true);
        probe.set_oversampling_ratio(1).unwrap();
        probe.enable_async_reads(false).unwrap();
        probe.enable_channel(Channel::Vbat, true).unwrap();
        assert_eq!(probe.sampling_frequency().unwrap(), 1000);
        assert_eq!(probe.device_name(), "ina226");
        assert_eq!(probe.device_id(), "iio:device0");
    }

    #[test]
    fn test_sampling_frequency_errors() {
        let probe = probe_with(device().without_attr(ATTR_SAMPLING_FREQUENCY), true);
        assert!(matches!(
            probe.sampling_frequency(),
            Err(ProbeError::SamplingFrequency { slot: 1, .. })
        ));

        let probe = probe_with(device().with_attr(ATTR_SAMPLING_FREQUENCY, "fast"), true);
        assert!(matches!(
            probe.sampling_frequency(),
            Err(ProbeError::InvalidSamplingFrequency { .. })
        ));

        // A genuine zero is a reading, not an error
        let probe = probe_with(device().with_attr(ATTR_SAMPLING_FREQUENCY, "0"), true);
        assert_eq!(probe.sampling_frequency().unwrap(), 0);
    }

    #[test]
    fn test_enable_missing_channel() {
        let mut probe = probe_with(device().without_channel("current3"), true);
        let err = probe.enable_channel(Channel::Ishunt, true).unwrap_err();
        assert_eq!(
            err,
            ProbeError::ChannelNotFound {
                slot: 1,
                channel: Channel::Ishunt,
                raw_id: "current3",
            }
        );
    }

    #[test]
    fn test_write_failure_is_reported() {
        let mut probe = probe_with(device().fail_writes_to(ATTR_OVERSAMPLING_RATIO), true);
        let err = probe.set_oversampling_ratio(1).unwrap_err();
        assert!(matches!(
            err,
            ProbeError::Oversampling {
                ratio: 1,
                source: DeviceError::WriteFailed { .. },
                ..
            }
        ));
    }

    #[test]
    fn test_read_scaled_channel() {
        let mut probe = probe_with(device(), true);
        probe.enable_channel(Channel::Ishunt, true).unwrap();
        assert_eq!(
            probe.refill_buffer(),
            Err(ProbeError::BufferNotAllocated { slot: 1 })
        );

        probe.allocate_buffer(8, false).unwrap();
        probe.refill_buffer().unwrap();
        let batch = probe.read_channel(Channel::Ishunt).unwrap();

        assert_eq!(batch.unit, "mA");
        assert_eq!(batch.samples.len(), 8);
        // 250 mA at 0.1 mA/LSB, +/- 3 LSB ripple
        assert!(batch.samples.iter().all(|s| (249.6..=250.4).contains(s)));
    }

    #[test]
    fn test_unit_scale_returns_raw_values() {
        let mut probe = probe_with(device().with_scale(Channel::Ishunt.raw_id(), 1.0), true);
        probe.enable_channel(Channel::Ishunt, true).unwrap();
        probe.allocate_buffer(4, false).unwrap();
        probe.refill_buffer().unwrap();

        let batch = probe.read_channel(Channel::Ishunt).unwrap();
        assert!(batch.samples.iter().all(|s| (2497.0..=2503.0).contains(s)));
        assert!(batch.samples.iter().all(|s| s.fract() == 0.0));
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let mut probe = probe_with(device(), true);
        probe.enable_channel(Channel::Vbat, true).unwrap();
        assert_eq!(
            probe.allocate_buffer(0, false),
            Err(ProbeError::ZeroCapacity { slot: 1 })
        );
        assert_eq!(probe.buffer_capacity(), None);
    }

    #[test]
    fn test_enable_power() {
        let mut probe = probe_with(device(), true);
        assert!(probe.enable_power(true).is_ok());

        let mut probe = probe_with(device(), false);
        assert_eq!(
            probe.enable_power(true),
            Err(ProbeError::NoPowerSwitch { slot: 1 })
        );
    }
}
