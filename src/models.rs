//! Data models for the capture engine.
//!
//! This module contains the static channel metadata, the per-slot sample
//! containers produced by capture workers, and the report structures
//! produced by the aggregator.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Number of probe slots on an ACME cape.
pub const DEFAULT_SLOT_COUNT: usize = 8;

/// Unit of the derived power channel (mV x mA).
pub const POWER_UNIT: &str = "uW";

/// A measurable quantity on a probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Channel {
    /// Voltage across the shunt resistor
    Vshunt,
    /// Bus (battery) voltage
    Vbat,
    /// Sample timestamp
    Time,
    /// Current through the shunt resistor
    Ishunt,
    /// Power computed by the probe
    Power,
}

impl Channel {
    /// All channels, in raw channel order.
    pub const ALL: [Channel; 5] = [
        Channel::Vshunt,
        Channel::Vbat,
        Channel::Time,
        Channel::Ishunt,
        Channel::Power,
    ];

    /// Identifier of the underlying raw device channel.
    pub fn raw_id(&self) -> &'static str {
        match self {
            Channel::Vshunt => "voltage0",
            Channel::Vbat => "voltage1",
            Channel::Time => "timestamp",
            Channel::Ishunt => "current3",
            Channel::Power => "power2",
        }
    }

    /// Physical unit of the scaled samples.
    pub fn unit(&self) -> &'static str {
        match self {
            Channel::Vshunt | Channel::Vbat => "mV",
            Channel::Time => "ms",
            Channel::Ishunt => "mA",
            Channel::Power => "mW",
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Channel::Vshunt => "Vshunt",
            Channel::Vbat => "Vbat",
            Channel::Time => "Time",
            Channel::Ishunt => "Ishunt",
            Channel::Power => "Power",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Channel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Channel::ALL
            .into_iter()
            .find(|c| c.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown channel '{}'", s))
    }
}

/// Probe hardware variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ProbeKind {
    Jack,
    Usb,
    He10,
}

impl ProbeKind {
    /// Token identifying the probe type in a slot description.
    pub fn token(&self) -> &'static str {
        match self {
            ProbeKind::Jack => "JACK",
            ProbeKind::Usb => "USB",
            ProbeKind::He10 => "HE10",
        }
    }
}

impl fmt::Display for ProbeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.token())
    }
}

/// Scaled samples of one channel from a single refill cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelSamples {
    pub channel: Channel,
    pub unit: &'static str,
    pub samples: Vec<f64>,
}

/// Accumulated samples of one channel over a capture.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleSet {
    /// Channel the samples belong to.
    pub channel: Channel,
    /// Physical unit of the samples.
    pub unit: String,
    /// Scaled samples, in capture order.
    pub samples: Vec<f64>,
    /// Set when any refill or read feeding this set failed.
    pub failed: bool,
    /// Number of cycles whose read of this channel failed.
    pub read_failures: u64,
}

impl SampleSet {
    pub fn new(channel: Channel) -> Self {
        Self {
            channel,
            unit: channel.unit().to_string(),
            samples: Vec::new(),
            failed: false,
            read_failures: 0,
        }
    }

    /// Append one cycle's batch.
    pub fn extend(&mut self, batch: ChannelSamples) {
        debug_assert_eq!(batch.channel, self.channel);
        self.samples.extend(batch.samples);
    }

    /// Record a failed read for this cycle.
    pub fn mark_read_failure(&mut self) {
        self.failed = true;
        self.read_failures += 1;
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }
}

/// Loop statistics of one capture worker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureStats {
    /// Refill cycles attempted.
    pub cycles: u64,
    /// Refill cycles that failed.
    pub refill_failures: u64,
    /// Refilled cycles discarded because a channel read failed.
    #[serde(default)]
    pub dropped_cycles: u64,
    /// Samples per channel per cycle.
    pub batch_size: usize,
}

/// Frozen output of one capture worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureResult {
    /// Cape slot (1-based).
    pub slot: usize,
    /// Channels captured, in configuration order.
    pub channels: Vec<Channel>,
    /// Requested capture duration.
    pub duration: Duration,
    /// Samples per channel.
    pub samples: BTreeMap<Channel, SampleSet>,
    pub stats: CaptureStats,
    /// Why the worker ended without a result, e.g. a panic.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CaptureResult {
    /// Result of a worker that ended abnormally: no samples, only the error.
    pub fn aborted(slot: usize, channels: Vec<Channel>, duration: Duration, error: String) -> Self {
        let samples = channels.iter().map(|&c| (c, SampleSet::new(c))).collect();
        Self {
            slot,
            channels,
            duration,
            samples,
            stats: CaptureStats::default(),
            error: Some(error),
        }
    }

    pub fn channel(&self, channel: Channel) -> Option<&SampleSet> {
        self.samples.get(&channel)
    }

    /// Whether any channel of this slot saw a failure.
    pub fn failed(&self) -> bool {
        self.error.is_some()
            || self.stats.refill_failures > 0
            || self.stats.dropped_cycles > 0
            || self.samples.values().any(|s| s.failed)
    }
}

/// Summary statistics of one series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelStats {
    /// Physical unit.
    pub unit: String,
    /// Number of samples reduced.
    pub count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avg: Option<f64>,
    /// Whether capture of this series reported failures.
    pub failed: bool,
}

/// Per-slot section of the report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlotReport {
    pub slot: usize,
    /// User-provided rail name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    pub voltage: ChannelStats,
    pub current: ChannelStats,
    pub power: ChannelStats,
    /// Refill cycles completed by the worker.
    pub cycles: u64,
    pub refill_failures: u64,
    /// Worker error that left the slot without samples.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SlotReport {
    /// Display title, e.g. `VDD_ARM (slot 2)` or `Slot 2`.
    pub fn title(&self) -> String {
        match self.label {
            Some(ref label) => format!("{} (slot {})", label, self.slot),
            None => format!("Slot {}", self.slot),
        }
    }

    pub fn failed(&self) -> bool {
        self.error.is_some()
            || self.voltage.failed
            || self.current.failed
            || self.power.failed
            || self.refill_failures > 0
    }
}

/// Metadata about a capture run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportMetadata {
    /// Address of the ACME cape.
    pub host: String,
    /// Date and time the capture started.
    pub capture_date: DateTime<Utc>,
    /// Requested capture duration in seconds.
    pub duration_seconds: f64,
    /// Wall-clock time spent capturing, including the final cycle.
    pub elapsed_seconds: f64,
}

/// The complete measurement report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    pub metadata: ReportMetadata,
    pub slots: Vec<SlotReport>,
}

impl Report {
    /// Slots whose capture reported failures.
    pub fn failed_slots(&self) -> Vec<usize> {
        self.slots
            .iter()
            .filter(|s| s.failed())
            .map(|s| s.slot)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_mapping() {
        assert_eq!(Channel::Vbat.raw_id(), "voltage1");
        assert_eq!(Channel::Ishunt.raw_id(), "current3");
        assert_eq!(Channel::Time.unit(), "ms");
        assert_eq!(Channel::Power.unit(), "mW");
    }

    #[test]
    fn test_channel_from_str() {
        assert_eq!("Vbat".parse::<Channel>(), Ok(Channel::Vbat));
        assert_eq!("ishunt".parse::<Channel>(), Ok(Channel::Ishunt));
        assert!("Vfoo".parse::<Channel>().is_err());
    }

    #[test]
    fn test_sample_set_failures() {
        let mut set = SampleSet::new(Channel::Vbat);
        set.extend(ChannelSamples {
            channel: Channel::Vbat,
            unit: "mV",
            samples: vec![1.0, 2.0],
        });
        set.mark_read_failure();

        assert_eq!(set.len(), 2);
        assert!(set.failed);
        assert_eq!(set.read_failures, 1);
        assert_eq!(set.unit, "mV");
    }

    #[test]
    fn test_slot_report_title() {
        let stats = ChannelStats {
            unit: "mV".to_string(),
            count: 0,
            min: None,
            max: None,
            avg: None,
            failed: false,
        };
        let mut slot = SlotReport {
            slot: 2,
            label: None,
            voltage: stats.clone(),
            current: stats.clone(),
            power: stats,
            cycles: 0,
            refill_failures: 0,
            error: None,
        };
        assert_eq!(slot.title(), "Slot 2");
        assert!(!slot.failed());

        slot.label = Some("VDD_ARM".to_string());
        assert_eq!(slot.title(), "VDD_ARM (slot 2)");

        slot.error = Some("worker panicked".to_string());
        assert!(slot.failed());
    }

    #[test]
    fn test_aborted_result() {
        let result = CaptureResult::aborted(
            3,
            vec![Channel::Vbat, Channel::Ishunt],
            Duration::from_secs(2),
            "worker panicked".to_string(),
        );
        assert!(result.failed());
        assert_eq!(result.stats.cycles, 0);
        assert_eq!(result.channel(Channel::Vbat).map(SampleSet::len), Some(0));
        assert_eq!(result.error.as_deref(), Some("worker panicked"));
    }
}
