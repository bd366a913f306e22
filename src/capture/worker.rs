//! Capture worker.
//!
//! One worker owns one probe for the whole capture window:
//!
//! ```text
//!  Created ──configure()──▶ Configured ──start()──▶ Running ──stop()──▶ Stopped
//! ```
//!
//! The running loop lives on a blocking task and polls its probe with no
//! coordination with other workers: refill, then read every enabled
//! channel. A cycle is appended to the sample sets only when every read
//! succeeded, so all channels of a result always hold the same number of
//! samples. Failures are recorded, never retried, and never end the loop.
//! The stop flag is checked between cycles, so a cycle in flight always
//! completes. Dropping a [`RunningWorker`] raises the stop flag too.

use crate::error::{CaptureError, ProbeError};
use crate::models::{CaptureResult, CaptureStats, Channel, SampleSet};
use crate::probe::Probe;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, info, trace, warn};

/// Oversampling ratio used for capture (maximum sample rate).
pub const CAPTURE_OVERSAMPLING_RATIO: u32 = 1;

/// Pause after a failed refill before the next attempt.
const REFILL_BACKOFF: Duration = Duration::from_millis(10);

/// Lifecycle state of a capture worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Created,
    Configured,
    Running,
    Stopped,
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WorkerState::Created => "created",
            WorkerState::Configured => "configured",
            WorkerState::Running => "running",
            WorkerState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Per-probe configuration snapshot, fixed before capture starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureConfig {
    pub oversampling_ratio: u32,
    pub async_reads: bool,
    pub channels: Vec<Channel>,
    /// Sampling frequency read back from the probe, in Hz.
    pub sampling_frequency: u32,
    /// Buffer capacity in samples per channel.
    pub buffer_capacity: usize,
}

/// Buffer capacity holding half a second of samples.
pub fn buffer_capacity_for(sampling_frequency: u32) -> usize {
    (sampling_frequency / 2) as usize
}

/// A capture worker that has not started yet.
pub struct CaptureWorker {
    probe: Probe,
    channels: Vec<Channel>,
    duration: Duration,
    oversampling_ratio: u32,
    state: WorkerState,
    config: Option<CaptureConfig>,
}

impl CaptureWorker {
    pub fn new(probe: Probe, channels: Vec<Channel>, duration: Duration) -> Self {
        debug!(
            slot = probe.slot(),
            "Worker params: channels={:?} duration={:?}", channels, duration
        );
        Self {
            probe,
            channels,
            duration,
            oversampling_ratio: CAPTURE_OVERSAMPLING_RATIO,
            state: WorkerState::Created,
            config: None,
        }
    }

    /// Override the oversampling ratio applied by [`configure`](Self::configure).
    pub fn with_oversampling_ratio(mut self, ratio: u32) -> Self {
        self.oversampling_ratio = ratio;
        self
    }

    pub fn slot(&self) -> usize {
        self.probe.slot()
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    /// Apply the capture configuration to the probe.
    ///
    /// On failure the worker stays in [`WorkerState::Created`].
    pub fn configure(&mut self) -> Result<&CaptureConfig, CaptureError> {
        if self.state != WorkerState::Created {
            return Err(self.unexpected_state(WorkerState::Created));
        }
        let slot = self.slot();
        let config = self
            .apply_config()
            .map_err(|source| CaptureError::ConfigurationFailed { slot, source })?;

        info!(
            slot,
            "Capture configured on {} ({}): {} Hz, buffer of {} samples, channels {:?}",
            self.probe.device_id(),
            self.probe.device_name(),
            config.sampling_frequency,
            config.buffer_capacity,
            config.channels
        );
        self.state = WorkerState::Configured;
        Ok(self.config.insert(config))
    }

    fn apply_config(&mut self) -> Result<CaptureConfig, ProbeError> {
        self.probe.set_oversampling_ratio(self.oversampling_ratio)?;
        self.probe.enable_async_reads(false)?;

        for &channel in &self.channels {
            self.probe.enable_channel(channel, true)?;
        }

        let sampling_frequency = self.probe.sampling_frequency()?;
        let buffer_capacity = buffer_capacity_for(sampling_frequency);
        self.probe.allocate_buffer(buffer_capacity, false)?;

        Ok(CaptureConfig {
            oversampling_ratio: self.oversampling_ratio,
            async_reads: false,
            channels: self.channels.clone(),
            sampling_frequency,
            buffer_capacity,
        })
    }

    /// Start the capture loop on its own blocking task.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(self) -> Result<RunningWorker, CaptureError> {
        if self.state != WorkerState::Configured {
            return Err(self.unexpected_state(WorkerState::Configured));
        }
        let slot = self.slot();
        let batch_size = self.config.as_ref().map_or(0, |c| c.buffer_capacity);
        let stop = Arc::new(AtomicBool::new(false));

        let capture = CaptureLoop {
            probe: self.probe,
            channels: self.channels,
            duration: self.duration,
            batch_size,
            stop: Arc::clone(&stop),
        };
        let handle = tokio::task::spawn_blocking(move || capture.run());
        debug!(slot, "Capture started");

        Ok(RunningWorker {
            slot,
            stop,
            handle: Some(handle),
        })
    }

    fn unexpected_state(&self, expected: WorkerState) -> CaptureError {
        CaptureError::InvalidWorkerState {
            slot: self.slot(),
            state: self.state,
            expected,
        }
    }
}

/// A worker whose capture loop is running.
///
/// Dropping it without calling [`stop`](Self::stop) still stops the loop,
/// but nobody waits for it.
pub struct RunningWorker {
    slot: usize,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<CaptureResult>>,
}

impl RunningWorker {
    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn state(&self) -> WorkerState {
        match self.handle {
            Some(ref handle) if !handle.is_finished() => WorkerState::Running,
            _ => WorkerState::Stopped,
        }
    }

    /// Signal the loop to stop and wait for its result.
    ///
    /// Returns once the in-flight refill/read cycle has completed.
    pub async fn stop(mut self) -> Result<CaptureResult, CaptureError> {
        let slot = self.slot;
        self.stop.store(true, Ordering::SeqCst);
        let handle = self.handle.take().ok_or(CaptureError::InvalidWorkerState {
            slot,
            state: WorkerState::Stopped,
            expected: WorkerState::Running,
        })?;
        handle.await.map_err(|e| CaptureError::WorkerPanicked {
            slot,
            message: panic_message(e),
        })
    }
}

impl Drop for RunningWorker {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.stop.store(true, Ordering::SeqCst);
            debug!(slot = self.slot, "Running worker dropped, stop requested");
        }
    }
}

fn panic_message(error: JoinError) -> String {
    if !error.is_panic() {
        return error.to_string();
    }
    let payload = error.into_panic();
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// State moved onto the capture task.
struct CaptureLoop {
    probe: Probe,
    channels: Vec<Channel>,
    duration: Duration,
    batch_size: usize,
    stop: Arc<AtomicBool>,
}

impl CaptureLoop {
    fn run(mut self) -> CaptureResult {
        let slot = self.probe.slot();
        let mut samples: BTreeMap<Channel, SampleSet> = self
            .channels
            .iter()
            .map(|&c| (c, SampleSet::new(c)))
            .collect();
        let mut stats = CaptureStats {
            batch_size: self.batch_size,
            ..Default::default()
        };

        let mut refill_streak = 0u64;
        while !self.stop.load(Ordering::SeqCst) {
            stats.cycles += 1;

            if let Err(e) = self.probe.refill_buffer() {
                stats.refill_failures += 1;
                refill_streak += 1;
                if refill_streak == 1 {
                    warn!(slot, "Error during buffer refill: {}", e);
                } else {
                    debug!(slot, streak = refill_streak, "Error during buffer refill: {}", e);
                }
                // The buffer still holds the previous batch; skip this cycle.
                for set in samples.values_mut() {
                    set.failed = true;
                }
                std::thread::sleep(REFILL_BACKOFF);
                continue;
            }
            if refill_streak > 1 {
                info!(slot, "Buffer refill recovered after {} failures", refill_streak);
            }
            refill_streak = 0;

            let mut batches = Vec::with_capacity(samples.len());
            for set in samples.values_mut() {
                match self.probe.read_channel(set.channel) {
                    Ok(batch) => batches.push(batch),
                    Err(e) => {
                        warn!(slot, "Error during {} buffer read: {}", set.channel, e);
                        set.mark_read_failure();
                    }
                }
            }

            if batches.len() == samples.len() {
                for (set, batch) in samples.values_mut().zip(batches) {
                    set.extend(batch);
                }
                trace!(slot, cycle = stats.cycles, "Cycle complete");
            } else {
                stats.dropped_cycles += 1;
                debug!(slot, cycle = stats.cycles, "Cycle dropped after a failed read");
            }
        }

        // Free the buffer before handing the result over.
        self.probe.release_buffer();
        info!(
            slot,
            cycles = stats.cycles,
            refill_failures = stats.refill_failures,
            dropped_cycles = stats.dropped_cycles,
            "Capture done"
        );

        CaptureResult {
            slot,
            channels: self.channels,
            duration: self.duration,
            samples,
            stats,
            error: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::tracked::TrackedDevice;
    use crate::device::{Device, SimulatedDevice, SimulationConfig, ATTR_SAMPLING_FREQUENCY};
    use crate::models::ProbeKind;

    const CHANNELS: [Channel; 2] = [Channel::Vbat, Channel::Ishunt];

    fn device(freq: u32) -> SimulatedDevice {
        SimulatedDevice::new(
            0,
            &SimulationConfig {
                sampling_frequency_hz: freq,
                time_scale: 20.0,
                ..Default::default()
            },
        )
    }

    fn worker(device: impl Device + 'static) -> CaptureWorker {
        let probe = Probe::new(1, ProbeKind::Jack, 10_000, true, Box::new(device));
        CaptureWorker::new(probe, CHANNELS.to_vec(), Duration::from_millis(100))
    }

    #[test]
    fn test_buffer_capacity() {
        assert_eq!(buffer_capacity_for(1000), 500);
        assert_eq!(buffer_capacity_for(2000), 1000);
        assert_eq!(buffer_capacity_for(1), 0);
    }

    #[test]
    fn test_configure() {
        let mut worker = worker(device(1000));
        assert_eq!(worker.state(), WorkerState::Created);

        let config = worker.configure().unwrap().clone();
        assert_eq!(
            config,
            CaptureConfig {
                oversampling_ratio: 1,
                async_reads: false,
                channels: CHANNELS.to_vec(),
                sampling_frequency: 1000,
                buffer_capacity: 500,
            }
        );
        assert_eq!(worker.state(), WorkerState::Configured);
        assert_eq!(worker.probe.buffer_capacity(), Some(500));

        // Configuring twice is rejected
        assert!(matches!(
            worker.configure(),
            Err(CaptureError::InvalidWorkerState { .. })
        ));
    }

    #[test]
    fn test_configure_failure_prevents_start() {
        let mut worker = worker(device(1000).without_channel("current3"));
        let err = worker.configure().unwrap_err();
        assert!(matches!(
            err,
            CaptureError::ConfigurationFailed {
                slot: 1,
                source: ProbeError::ChannelNotFound { .. }
            }
        ));
        assert_eq!(worker.state(), WorkerState::Created);
        assert!(matches!(
            worker.start(),
            Err(CaptureError::InvalidWorkerState {
                state: WorkerState::Created,
                expected: WorkerState::Configured,
                ..
            })
        ));
    }

    #[test]
    fn test_zero_frequency_fails_configuration() {
        let mut worker = worker(device(1000).with_attr(ATTR_SAMPLING_FREQUENCY, "1"));
        assert!(matches!(
            worker.configure(),
            Err(CaptureError::ConfigurationFailed {
                source: ProbeError::ZeroCapacity { .. },
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_capture_loop_collects_samples() {
        let mut worker = worker(device(1000));
        worker.configure().unwrap();
        let running = worker.start().unwrap();
        assert_eq!(running.slot(), 1);
        assert_eq!(running.state(), WorkerState::Running);

        tokio::time::sleep(Duration::from_millis(120)).await;
        let result = running.stop().await.unwrap();

        assert_eq!(result.slot, 1);
        assert_eq!(result.channels, CHANNELS.to_vec());
        assert_eq!(result.duration, Duration::from_millis(100));
        assert!(result.stats.cycles >= 1);
        assert_eq!(result.stats.batch_size, 500);
        assert!(!result.failed());

        let vbat = result.channel(Channel::Vbat).unwrap();
        let ishunt = result.channel(Channel::Ishunt).unwrap();
        assert_eq!(vbat.unit, "mV");
        assert_eq!(ishunt.unit, "mA");
        assert_eq!(vbat.len(), ishunt.len());
        assert_eq!(vbat.len() as u64, result.stats.cycles * 500);
    }

    #[tokio::test]
    async fn test_read_failures_are_flagged() {
        let mut worker = worker(device(1000).fail_reads_of("current3", 2));
        worker.configure().unwrap();
        let running = worker.start().unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        let result = running.stop().await.unwrap();

        let vbat = result.channel(Channel::Vbat).unwrap();
        let ishunt = result.channel(Channel::Ishunt).unwrap();
        assert!(result.stats.cycles >= 4);
        assert!(result.failed());
        assert!(!vbat.failed);
        assert!(ishunt.failed);
        assert_eq!(ishunt.read_failures, result.stats.cycles / 2);
        assert_eq!(result.stats.dropped_cycles, ishunt.read_failures);

        // Cycles with a failed read are dropped for every channel.
        assert_eq!(vbat.len(), ishunt.len());
        let kept = result.stats.cycles - result.stats.dropped_cycles;
        assert_eq!(vbat.len() as u64, kept * 500);
    }

    #[tokio::test]
    async fn test_failing_refills_back_off() {
        let unpaced = SimulatedDevice::new(
            0,
            &SimulationConfig {
                realtime: false,
                ..Default::default()
            },
        );
        let mut worker = worker(unpaced.fail_refill_every(1));
        worker.configure().unwrap();
        let running = worker.start().unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        let result = running.stop().await.unwrap();

        // One attempt per back-off period at most.
        assert!(result.stats.cycles >= 1);
        assert!(result.stats.cycles <= 15);
        assert_eq!(result.stats.refill_failures, result.stats.cycles);
        assert!(result.samples.values().all(|set| set.failed && set.len() == 0));
    }

    #[tokio::test]
    async fn test_dropped_worker_stops_and_releases() {
        let (device, tracker) = TrackedDevice::new(device(1000));
        let mut worker = worker(device);
        worker.configure().unwrap();
        let running = worker.start().unwrap();

        tokio::time::sleep(Duration::from_millis(60)).await;
        drop(running);

        // The in-flight cycle takes 25 ms at 20x speed.
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(tracker.released());
        let refills = tracker.refills();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(tracker.refills(), refills);
    }

    #[tokio::test]
    async fn test_panicking_worker_reports_message() {
        let (device, tracker) = TrackedDevice::new(device(1000));
        let mut worker = worker(device.panicking());
        worker.configure().unwrap();
        let running = worker.start().unwrap();

        // Let the loop reach its first refill before stopping.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(running.state(), WorkerState::Stopped);
        let err = running.stop().await.unwrap_err();
        assert!(matches!(
            err,
            CaptureError::WorkerPanicked { slot: 1, ref message } if message == "device lost"
        ));
        // Unwinding dropped the probe and its buffer.
        assert!(tracker.released());
    }

    #[tokio::test]
    async fn test_refill_failures_skip_cycle() {
        let mut worker = worker(device(1000).fail_refill_every(2));
        worker.configure().unwrap();
        let running = worker.start().unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        let result = running.stop().await.unwrap();

        assert!(result.failed());
        assert_eq!(result.stats.refill_failures, result.stats.cycles / 2);
        let good_cycles = result.stats.cycles - result.stats.refill_failures;
        for set in result.samples.values() {
            assert!(set.failed);
            assert_eq!(set.len() as u64, good_cycles * 500);
        }
    }
}
