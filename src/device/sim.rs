//! Simulated ACME cape.
//!
//! Provides a deterministic stand-in for the cape and its INA226-based
//! probes:
//! - slot descriptions in the format served by the cape's discovery service
//! - devices exposing the sampling attributes and raw channels of a probe
//! - paced refills (half a second of samples per cycle, optionally sped up)
//! - fault injection on attribute writes, refills and channel reads
//!
//! Used by the tests and by `acmecap --simulate`.

use super::{
    Device, DeviceContext, ATTR_ASYNC_READOUT, ATTR_OVERSAMPLING_RATIO, ATTR_SAMPLING_FREQUENCY,
    CHANNEL_ATTR_SCALE,
};
use crate::cape::SlotInfoSource;
use crate::error::{DeviceError, DiscoveryError};
use crate::models::{Channel, ProbeKind};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;
use tracing::trace;

/// Bus voltage LSB of the INA226, in mV.
const VBAT_SCALE: f64 = 1.25;
/// Shunt voltage LSB of the INA226, in mV.
const VSHUNT_SCALE: f64 = 0.0025;
/// Current LSB configured by the cape driver, in mA.
const ISHUNT_SCALE: f64 = 0.1;
/// Power LSB (25 x current LSB), in mW.
const POWER_SCALE: f64 = 2.5;
/// Peak-to-peak ripple added to generated samples, in LSB.
const RIPPLE_LSB: i64 = 3;

/// Parameters of the simulated probes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationConfig {
    /// Sampling frequency reported by every probe.
    #[serde(default = "default_sampling_frequency")]
    pub sampling_frequency_hz: u32,

    /// Nominal bus voltage in mV.
    #[serde(default = "default_vbat")]
    pub vbat_mv: f64,

    /// Nominal load current in mA.
    #[serde(default = "default_ishunt")]
    pub ishunt_ma: f64,

    /// Shunt resistance reported by every probe, in micro-ohms.
    #[serde(default = "default_shunt")]
    pub shunt_uohm: u32,

    /// Pace refills like real hardware (buffer duration per cycle).
    #[serde(default = "default_true")]
    pub realtime: bool,

    /// Speed-up factor applied to refill pacing.
    #[serde(default = "default_time_scale")]
    pub time_scale: f64,

    /// Fail every Nth refill.
    #[serde(default)]
    pub fail_refill_every: Option<u64>,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            sampling_frequency_hz: default_sampling_frequency(),
            vbat_mv: default_vbat(),
            ishunt_ma: default_ishunt(),
            shunt_uohm: default_shunt(),
            realtime: true,
            time_scale: default_time_scale(),
            fail_refill_every: None,
        }
    }
}

fn default_sampling_frequency() -> u32 {
    1000
}

fn default_vbat() -> f64 {
    5000.0
}

fn default_ishunt() -> f64 {
    250.0
}

fn default_shunt() -> u32 {
    10_000
}

fn default_true() -> bool {
    true
}

fn default_time_scale() -> f64 {
    1.0
}

#[derive(Debug, Clone)]
struct SimChannel {
    enabled: bool,
    scale: f64,
    /// Nominal raw value; `None` generates a millisecond counter.
    base_raw: Option<i64>,
}

#[derive(Debug)]
struct SimBuffer {
    capacity: usize,
    /// Raw little-endian samples of the latest batch, per channel.
    data: HashMap<&'static str, Vec<u8>>,
}

/// A simulated probe device.
#[derive(Debug)]
pub struct SimulatedDevice {
    id: String,
    name: String,
    attrs: HashMap<String, String>,
    channels: BTreeMap<&'static str, SimChannel>,
    buffer: Option<SimBuffer>,
    realtime: bool,
    time_scale: f64,
    refills: u64,
    samples_produced: u64,
    fail_refill_every: Option<u64>,
    failing_writes: HashSet<String>,
    failing_reads: HashMap<String, u64>,
    failing_buffer: bool,
}

impl SimulatedDevice {
    /// Create a device with the attributes and channels of an ACME probe.
    pub fn new(index: usize, config: &SimulationConfig) -> Self {
        let mut attrs = HashMap::new();
        attrs.insert(ATTR_OVERSAMPLING_RATIO.to_string(), "4".to_string());
        attrs.insert(ATTR_ASYNC_READOUT.to_string(), "1".to_string());
        attrs.insert(
            ATTR_SAMPLING_FREQUENCY.to_string(),
            config.sampling_frequency_hz.to_string(),
        );

        let vshunt_mv = config.ishunt_ma * config.shunt_uohm as f64 / 1_000_000.0;
        let power_mw = config.vbat_mv * config.ishunt_ma / 1000.0;

        let mut channels = BTreeMap::new();
        for channel in Channel::ALL {
            let (scale, base_raw) = match channel {
                Channel::Vshunt => (VSHUNT_SCALE, Some(to_raw(vshunt_mv, VSHUNT_SCALE))),
                Channel::Vbat => (VBAT_SCALE, Some(to_raw(config.vbat_mv, VBAT_SCALE))),
                Channel::Time => (1.0, None),
                Channel::Ishunt => (ISHUNT_SCALE, Some(to_raw(config.ishunt_ma, ISHUNT_SCALE))),
                Channel::Power => (POWER_SCALE, Some(to_raw(power_mw, POWER_SCALE))),
            };
            channels.insert(
                channel.raw_id(),
                SimChannel {
                    enabled: false,
                    scale,
                    base_raw,
                },
            );
        }

        Self {
            id: format!("iio:device{}", index),
            name: "ina226".to_string(),
            attrs,
            channels,
            buffer: None,
            realtime: config.realtime,
            time_scale: config.time_scale,
            refills: 0,
            samples_produced: 0,
            fail_refill_every: config.fail_refill_every,
            failing_writes: HashSet::new(),
            failing_reads: HashMap::new(),
            failing_buffer: false,
        }
    }

    fn sampling_frequency(&self) -> Option<f64> {
        self.attrs
            .get(ATTR_SAMPLING_FREQUENCY)
            .and_then(|f| f.parse::<f64>().ok())
            .filter(|f| *f > 0.0)
    }

    fn generate(&self, channel: &SimChannel, capacity: usize) -> Vec<u8> {
        let freq = self.sampling_frequency().unwrap_or(1000.0);
        let mut bytes = Vec::with_capacity(capacity * 2);

        for i in 0..capacity as u64 {
            let n = self.samples_produced + i;
            let raw = match channel.base_raw {
                Some(base) => base + (n as i64 % (2 * RIPPLE_LSB + 1)) - RIPPLE_LSB,
                None => ((n as f64 * 1000.0 / freq) as i64) % (i16::MAX as i64 + 1),
            };
            let raw = raw.clamp(i16::MIN as i64, i16::MAX as i64) as i16;
            bytes.extend_from_slice(&raw.to_le_bytes());
        }

        bytes
    }
}

// Fault injection and inspection hooks for the test suites.
#[allow(dead_code)]
impl SimulatedDevice {
    /// Set an attribute value, e.g. a custom sampling frequency.
    pub fn with_attr(mut self, attr: &str, value: &str) -> Self {
        self.attrs.insert(attr.to_string(), value.to_string());
        self
    }

    /// Remove an attribute entirely.
    pub fn without_attr(mut self, attr: &str) -> Self {
        self.attrs.remove(attr);
        self
    }

    /// Remove a raw channel entirely.
    pub fn without_channel(mut self, channel_id: &str) -> Self {
        self.channels.remove(channel_id);
        self
    }

    /// Override the scale factor of a raw channel.
    pub fn with_scale(mut self, channel_id: &str, scale: f64) -> Self {
        if let Some(ch) = self.channels.get_mut(channel_id) {
            ch.scale = scale;
        }
        self
    }

    /// Make writes to `attr` fail.
    pub fn fail_writes_to(mut self, attr: &str) -> Self {
        self.failing_writes.insert(attr.to_string());
        self
    }

    /// Make reads of `channel_id` fail on every `every`th refill cycle.
    pub fn fail_reads_of(mut self, channel_id: &str, every: u64) -> Self {
        self.failing_reads.insert(channel_id.to_string(), every.max(1));
        self
    }

    /// Make every `every`th refill fail.
    pub fn fail_refill_every(mut self, every: u64) -> Self {
        self.fail_refill_every = Some(every.max(1));
        self
    }

    /// Make buffer allocation fail.
    pub fn fail_buffer_allocation(mut self) -> Self {
        self.failing_buffer = true;
        self
    }

    /// Whether a buffer is currently allocated.
    pub fn has_buffer(&self) -> bool {
        self.buffer.is_some()
    }

    /// Capacity of the allocated buffer.
    pub fn buffer_capacity(&self) -> Option<usize> {
        self.buffer.as_ref().map(|b| b.capacity)
    }
}

fn to_raw(value: f64, scale: f64) -> i64 {
    (value / scale).round() as i64
}

impl Device for SimulatedDevice {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn read_attr(&self, attr: &str) -> Result<String, DeviceError> {
        self.attrs
            .get(attr)
            .cloned()
            .ok_or_else(|| DeviceError::AttributeNotFound(attr.to_string()))
    }

    fn write_attr(&mut self, attr: &str, value: &str) -> Result<(), DeviceError> {
        if self.failing_writes.contains(attr) {
            return Err(DeviceError::WriteFailed {
                attr: attr.to_string(),
                message: "input/output error".to_string(),
            });
        }
        match self.attrs.get_mut(attr) {
            Some(current) => {
                *current = value.to_string();
                Ok(())
            }
            None => Err(DeviceError::AttributeNotFound(attr.to_string())),
        }
    }

    fn has_channel(&self, channel_id: &str) -> bool {
        self.channels.contains_key(channel_id)
    }

    fn set_channel_enabled(&mut self, channel_id: &str, enabled: bool) -> Result<(), DeviceError> {
        let channel = self
            .channels
            .get_mut(channel_id)
            .ok_or_else(|| DeviceError::ChannelNotFound(channel_id.to_string()))?;
        channel.enabled = enabled;
        Ok(())
    }

    fn read_channel_attr(&self, channel_id: &str, attr: &str) -> Result<String, DeviceError> {
        let channel = self
            .channels
            .get(channel_id)
            .ok_or_else(|| DeviceError::ChannelNotFound(channel_id.to_string()))?;
        if attr == CHANNEL_ATTR_SCALE {
            Ok(channel.scale.to_string())
        } else {
            Err(DeviceError::AttributeNotFound(attr.to_string()))
        }
    }

    fn create_buffer(&mut self, samples: usize, _cyclic: bool) -> Result<(), DeviceError> {
        if self.failing_buffer {
            return Err(DeviceError::BufferAllocation("out of memory".to_string()));
        }
        if samples == 0 {
            return Err(DeviceError::BufferAllocation("zero-sized buffer".to_string()));
        }
        if !self.channels.values().any(|c| c.enabled) {
            return Err(DeviceError::BufferAllocation("no channel enabled".to_string()));
        }
        self.buffer = Some(SimBuffer {
            capacity: samples,
            data: HashMap::new(),
        });
        Ok(())
    }

    fn refill_buffer(&mut self) -> Result<(), DeviceError> {
        let capacity = self.buffer.as_ref().ok_or(DeviceError::NoBuffer)?.capacity;

        if self.realtime {
            if let Some(freq) = self.sampling_frequency() {
                let secs = capacity as f64 / freq / self.time_scale.max(f64::EPSILON);
                std::thread::sleep(Duration::from_secs_f64(secs));
            }
        }

        self.refills += 1;
        if let Some(every) = self.fail_refill_every {
            if self.refills % every == 0 {
                return Err(DeviceError::Refill("timed out".to_string()));
            }
        }

        let data: HashMap<&'static str, Vec<u8>> = self
            .channels
            .iter()
            .filter(|(_, c)| c.enabled)
            .map(|(id, c)| (*id, self.generate(c, capacity)))
            .collect();

        self.samples_produced += capacity as u64;
        if let Some(buffer) = self.buffer.as_mut() {
            buffer.data = data;
        }
        trace!(device = %self.id, refill = self.refills, "Buffer refilled");
        Ok(())
    }

    fn read_channel_raw(&self, channel_id: &str) -> Result<Vec<u8>, DeviceError> {
        let buffer = self.buffer.as_ref().ok_or(DeviceError::NoBuffer)?;
        let channel = self
            .channels
            .get(channel_id)
            .ok_or_else(|| DeviceError::ChannelNotFound(channel_id.to_string()))?;
        if !channel.enabled {
            return Err(DeviceError::ChannelDisabled(channel_id.to_string()));
        }
        if let Some(every) = self.failing_reads.get(channel_id) {
            if self.refills % every == 0 {
                return Err(DeviceError::Io("short read".to_string()));
            }
        }
        Ok(buffer.data.get(channel_id).cloned().unwrap_or_default())
    }

    fn destroy_buffer(&mut self) {
        if self.buffer.take().is_some() {
            trace!(device = %self.id, "Buffer destroyed");
        }
    }
}

/// A probe plugged into a simulated slot.
#[derive(Debug, Clone, PartialEq)]
pub struct SimulatedProbe {
    pub kind: ProbeKind,
    pub shunt_uohm: u32,
    pub power_switch: bool,
}

#[derive(Debug, Clone, PartialEq)]
enum SimulatedSlot {
    Empty,
    Probe(SimulatedProbe),
    /// A populated slot serving a verbatim description.
    Raw(String),
    /// The discovery service answers this slot with a fault.
    Fault,
}

/// A simulated cape: discovery service and device context in one.
#[derive(Debug, Clone)]
pub struct SimulatedCape {
    slots: Vec<SimulatedSlot>,
    config: SimulationConfig,
    reachable: bool,
}

impl SimulatedCape {
    /// An empty cape with `slot_count` slots.
    pub fn new(slot_count: usize, config: SimulationConfig) -> Self {
        Self {
            slots: vec![SimulatedSlot::Empty; slot_count],
            config,
            reachable: true,
        }
    }

    /// A cape whose first `count` slots hold JACK probes.
    pub fn populated(slot_count: usize, count: usize, config: SimulationConfig) -> Self {
        let mut cape = Self::new(slot_count, config);
        for slot in 1..=count.min(slot_count) {
            cape = cape.with_probe(slot, ProbeKind::Jack);
        }
        cape
    }

    /// Plug a probe of `kind` into `slot` (1-based).
    pub fn with_probe(mut self, slot: usize, kind: ProbeKind) -> Self {
        let probe = SimulatedProbe {
            kind,
            shunt_uohm: self.config.shunt_uohm,
            power_switch: kind != ProbeKind::He10,
        };
        self.set(slot, SimulatedSlot::Probe(probe));
        self
    }

    /// Serve a verbatim description for `slot`.
    #[allow(dead_code)] // Malformed-description cases in the registry tests
    pub fn with_description(mut self, slot: usize, description: &str) -> Self {
        self.set(slot, SimulatedSlot::Raw(description.to_string()));
        self
    }

    /// Answer queries for `slot` with a fault.
    #[allow(dead_code)] // Fault cases in the registry tests
    pub fn with_fault(mut self, slot: usize) -> Self {
        self.set(slot, SimulatedSlot::Fault);
        self
    }

    /// Make the discovery service unreachable.
    #[allow(dead_code)] // Unreachable-service cases in the registry tests
    pub fn unreachable(mut self) -> Self {
        self.reachable = false;
        self
    }

    pub fn is_reachable(&self) -> bool {
        self.reachable
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    fn set(&mut self, slot: usize, state: SimulatedSlot) {
        if let Some(entry) = slot.checked_sub(1).and_then(|i| self.slots.get_mut(i)) {
            *entry = state;
        }
    }

    /// Description text of a slot, as served by the discovery service.
    fn describe(&self, slot: usize) -> Result<String, DiscoveryError> {
        match slot.checked_sub(1).and_then(|i| self.slots.get(i)) {
            Some(SimulatedSlot::Empty) => Ok(format!(
                "Failed to read EEPROM of probe @slot {}",
                slot
            )),
            Some(SimulatedSlot::Probe(probe)) => Ok(describe_probe(slot, probe)),
            Some(SimulatedSlot::Raw(text)) => Ok(text.clone()),
            Some(SimulatedSlot::Fault) | None => Err(DiscoveryError::Fault {
                code: 1,
                message: format!("no such slot: {}", slot),
            }),
        }
    }
}

/// Format a probe description like the cape's EEPROM dump tool.
fn describe_probe(slot: usize, probe: &SimulatedProbe) -> String {
    let mut text = format!("PowerProbe {} @slot {}:\tReB\n", probe.kind, slot);
    if probe.power_switch {
        text.push_str("\tHas Power Switch\n");
    }
    text.push_str(&format!("\tR_Shunt: {} uOhm\n", probe.shunt_uohm));
    text.push_str(&format!(
        "\tSerial Number: {:x}-{:x}-{:x}-{:x}\n",
        0xacu32, 0x3e, slot, 0x5a
    ));
    text
}

impl SlotInfoSource for SimulatedCape {
    async fn slot_info(&self, slot: usize) -> Result<String, DiscoveryError> {
        if !self.reachable {
            return Err(DiscoveryError::Unreachable(
                "connection refused".to_string(),
            ));
        }
        self.describe(slot)
    }
}

impl DeviceContext for SimulatedCape {
    fn description(&self) -> String {
        format!("simulated ACME cape ({} slots)", self.slots.len())
    }

    fn into_devices(self: Box<Self>) -> Vec<Box<dyn Device>> {
        let populated = self.slots.iter().filter(|s| match s {
            SimulatedSlot::Probe(_) => true,
            SimulatedSlot::Raw(text) => !text.contains("Failed"),
            SimulatedSlot::Empty | SimulatedSlot::Fault => false,
        });

        populated
            .enumerate()
            .map(|(index, _)| Box::new(SimulatedDevice::new(index, &self.config)) as Box<dyn Device>)
            .collect()
    }
}
