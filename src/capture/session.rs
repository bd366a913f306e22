//! Session coordinator.
//!
//! Owns one [`CaptureWorker`] per probe. All workers are configured before
//! any of them starts; a single configuration failure aborts the session
//! and drops every worker, releasing the buffers already allocated. Once
//! running, the coordinator only sleeps until the capture window ends and
//! then stops and joins each worker in creation order. A worker that ends
//! abnormally yields an aborted result for its slot; the other slots keep
//! their samples.

use super::worker::{CaptureWorker, RunningWorker, CAPTURE_OVERSAMPLING_RATIO};
use crate::cape::Cape;
use crate::error::CaptureError;
use crate::models::{CaptureResult, Channel};
use chrono::{DateTime, Utc};
use indicatif::{ProgressBar, ProgressStyle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Progress bar refresh period.
const PROGRESS_TICK: Duration = Duration::from_millis(100);

/// Results of a completed session.
#[derive(Debug, Clone)]
pub struct SessionOutcome {
    /// One result per worker, in creation (slot) order.
    pub results: Vec<CaptureResult>,
    pub started_at: DateTime<Utc>,
    /// Time from start of the first worker to the last join.
    pub elapsed: Duration,
}

/// A set of capture workers run over a common window.
pub struct CaptureSession {
    channels: Vec<Channel>,
    duration: Duration,
    workers: Vec<CaptureWorker>,
    oversampling_ratio: u32,
    show_progress: bool,
}

impl CaptureSession {
    pub fn new(channels: Vec<Channel>, duration: Duration) -> Self {
        Self {
            channels,
            duration,
            workers: Vec::new(),
            oversampling_ratio: CAPTURE_OVERSAMPLING_RATIO,
            show_progress: false,
        }
    }

    /// Build a session over the populated slots among `1..=count`.
    ///
    /// Unpopulated slots are skipped with a warning.
    pub fn from_cape(
        cape: &mut Cape,
        count: usize,
        channels: Vec<Channel>,
        duration: Duration,
    ) -> Result<Self, CaptureError> {
        let mut session = Self::new(channels, duration);
        for slot in 1..=count {
            match session.add_slot(cape, slot) {
                Ok(()) => {}
                Err(CaptureError::NoProbeInSlot(slot)) => {
                    warn!("No probe in slot {}, skipping", slot);
                }
                Err(e) => return Err(e),
            }
        }

        if session.is_empty() {
            return Err(CaptureError::NoProbes(count));
        }
        Ok(session)
    }

    /// Take the probe of `slot` from the registry and add a worker for it.
    pub fn add_slot(&mut self, cape: &mut Cape, slot: usize) -> Result<(), CaptureError> {
        let probe = cape.take_probe(slot)?;
        let worker = CaptureWorker::new(probe, self.channels.clone(), self.duration)
            .with_oversampling_ratio(self.oversampling_ratio);
        self.workers.push(worker);
        Ok(())
    }

    /// Oversampling ratio applied to every worker.
    pub fn with_oversampling_ratio(mut self, ratio: u32) -> Self {
        self.oversampling_ratio = ratio;
        self.workers = self
            .workers
            .into_iter()
            .map(|w| w.with_oversampling_ratio(ratio))
            .collect();
        self
    }

    /// Show a progress bar on stderr while capturing.
    pub fn with_progress(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }

    /// Slots covered by this session, in worker order.
    #[allow(dead_code)] // Checked by the session-building tests
    pub fn slots(&self) -> Vec<usize> {
        self.workers.iter().map(|w| w.slot()).collect()
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Configure every worker; fails on the first worker that cannot be
    /// configured.
    pub fn configure(&mut self) -> Result<(), CaptureError> {
        for worker in &mut self.workers {
            worker.configure()?;
            debug!(slot = worker.slot(), state = %worker.state(), "Worker ready");
        }
        debug!("{} worker(s) configured", self.workers.len());
        Ok(())
    }

    /// Configure all workers, capture for the session duration, then stop
    /// and join them.
    pub async fn run(mut self) -> Result<SessionOutcome, CaptureError> {
        self.configure()?;

        let started_at = Utc::now();
        let start = Instant::now();
        let running = start_all(self.workers).await?;
        info!(
            "Capturing on {} slot(s) for {:?}",
            running.len(),
            self.duration
        );

        wait(self.duration, self.show_progress).await;

        let mut results = Vec::with_capacity(running.len());
        for worker in running {
            let slot = worker.slot();
            debug!(slot, state = %worker.state(), "Stopping worker");
            let result = match worker.stop().await {
                Ok(result) => {
                    debug!(
                        slot,
                        "Worker joined after {} cycle(s)", result.stats.cycles
                    );
                    result
                }
                Err(e) => {
                    error!(slot, "{}", e);
                    CaptureResult::aborted(slot, self.channels.clone(), self.duration, e.to_string())
                }
            };
            results.push(result);
        }

        let elapsed = start.elapsed();
        info!("Capture complete in {:.2}s", elapsed.as_secs_f64());
        Ok(SessionOutcome {
            results,
            started_at,
            elapsed,
        })
    }
}

/// Start every worker, stopping and joining those already running if one
/// fails.
async fn start_all(workers: Vec<CaptureWorker>) -> Result<Vec<RunningWorker>, CaptureError> {
    let mut running = Vec::with_capacity(workers.len());
    for worker in workers {
        match worker.start() {
            Ok(w) => running.push(w),
            Err(e) => {
                for w in running {
                    let slot = w.slot();
                    // Results of a partial session are discarded.
                    if let Err(stop_error) = w.stop().await {
                        warn!(slot, "{}", stop_error);
                    }
                }
                return Err(e);
            }
        }
    }
    Ok(running)
}

async fn wait(duration: Duration, show_progress: bool) {
    if !show_progress {
        tokio::time::sleep(duration).await;
        return;
    }

    let pb = ProgressBar::new(duration.as_millis() as u64);
    let style = ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {msg}")
        .map(|s| s.progress_chars("#>-"))
        .unwrap_or_else(|_| ProgressStyle::default_bar());
    pb.set_style(style);
    pb.set_message(format!("capturing {}s", duration.as_secs()));

    let deadline = tokio::time::Instant::now() + duration;
    let mut ticker = tokio::time::interval(PROGRESS_TICK);
    loop {
        ticker.tick().await;
        let now = tokio::time::Instant::now();
        if now >= deadline {
            break;
        }
        let remaining = deadline - now;
        pb.set_position((duration - remaining).as_millis() as u64);
        if remaining < PROGRESS_TICK {
            tokio::time::sleep_until(deadline).await;
            break;
        }
    }
    pb.finish_and_clear();
}
