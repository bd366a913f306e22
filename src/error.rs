//! Error types for the capture engine.
//!
//! Each layer has its own error enum. Errors below the session coordinator
//! are turned into failure flags by the capture workers; only registry and
//! configuration failures reach [`CaptureError`].

use crate::models::Channel;
use thiserror::Error;

/// Errors raised by a device-access backend.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DeviceError {
    #[error("attribute '{0}' not found")]
    AttributeNotFound(String),

    #[error("channel '{0}' not found")]
    ChannelNotFound(String),

    #[error("failed to write attribute '{attr}': {message}")]
    WriteFailed { attr: String, message: String },

    #[error("buffer allocation failed: {0}")]
    BufferAllocation(String),

    #[error("no buffer allocated")]
    NoBuffer,

    #[error("buffer refill failed: {0}")]
    Refill(String),

    #[error("channel '{0}' is not enabled")]
    ChannelDisabled(String),

    #[error("I/O error: {0}")]
    Io(String),
}

/// Errors raised by probe control operations.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProbeError {
    #[error("slot {slot}: failed to set oversampling ratio to {ratio}: {source}")]
    Oversampling {
        slot: usize,
        ratio: u32,
        #[source]
        source: DeviceError,
    },

    #[error("slot {slot}: failed to configure asynchronous reads: {source}")]
    AsyncReads {
        slot: usize,
        #[source]
        source: DeviceError,
    },

    #[error("slot {slot}: failed to read sampling frequency: {source}")]
    SamplingFrequency {
        slot: usize,
        #[source]
        source: DeviceError,
    },

    #[error("slot {slot}: invalid sampling frequency '{value}'")]
    InvalidSamplingFrequency { slot: usize, value: String },

    #[error("slot {slot}: channel {channel} ({raw_id}) not found")]
    ChannelNotFound {
        slot: usize,
        channel: Channel,
        raw_id: &'static str,
    },

    #[error("slot {slot}: failed to {action} channel {channel}: {source}")]
    ChannelToggle {
        slot: usize,
        channel: Channel,
        action: &'static str,
        #[source]
        source: DeviceError,
    },

    #[error("slot {slot}: buffer capacity must be at least one sample")]
    ZeroCapacity { slot: usize },

    #[error("slot {slot}: failed to allocate buffer of {capacity} samples: {source}")]
    BufferAllocation {
        slot: usize,
        capacity: usize,
        #[source]
        source: DeviceError,
    },

    #[error("slot {slot}: no capture buffer allocated")]
    BufferNotAllocated { slot: usize },

    #[error("slot {slot}: buffer refill failed: {source}")]
    Refill {
        slot: usize,
        #[source]
        source: DeviceError,
    },

    #[error("slot {slot}: failed to read channel {channel}: {source}")]
    ChannelRead {
        slot: usize,
        channel: Channel,
        #[source]
        source: DeviceError,
    },

    #[error("slot {slot}: invalid scale '{value}' for channel {channel}")]
    InvalidScale {
        slot: usize,
        channel: Channel,
        value: String,
    },

    #[error("slot {slot}: probe has no power switch")]
    NoPowerSwitch { slot: usize },
}

/// Errors raised by the slot-discovery service client.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DiscoveryError {
    #[error("discovery service unreachable: {0}")]
    Unreachable(String),

    #[error("discovery service fault {code}: {message}")]
    Fault { code: i64, message: String },

    #[error("malformed discovery response: {0}")]
    Malformed(String),
}

/// Errors raised while parsing one slot's free-text description.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SlotParseError {
    #[error("probe type not found")]
    MissingType,

    #[error("shunt resistance not found")]
    MissingShunt,

    #[error("invalid shunt resistance '{0}'")]
    InvalidShunt(String),
}

/// Errors that abort discovery or a capture session.
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("ACME cape at {0} is not reachable")]
    Unreachable(String),

    #[error("slot discovery failed: {0}")]
    DiscoveryUnreachable(#[source] DiscoveryError),

    #[error("{devices} devices enumerated for {populated} populated slots")]
    DeviceCountMismatch { populated: usize, devices: usize },

    #[error("slot {slot} is out of range (1..={capacity})")]
    SlotOutOfRange { slot: usize, capacity: usize },

    #[error("no probe in slot {0}")]
    NoProbeInSlot(usize),

    #[error("failed to configure capture for slot {slot}: {source}")]
    ConfigurationFailed {
        slot: usize,
        #[source]
        source: ProbeError,
    },

    #[error("capture worker for slot {slot} is {state}, expected {expected}")]
    InvalidWorkerState {
        slot: usize,
        state: crate::capture::WorkerState,
        expected: crate::capture::WorkerState,
    },

    #[error("capture worker for slot {slot} panicked: {message}")]
    WorkerPanicked { slot: usize, message: String },

    #[error("no populated slot in 1..={0}")]
    NoProbes(usize),

    #[error("device access backend unavailable: {0}")]
    BackendUnavailable(String),
}
