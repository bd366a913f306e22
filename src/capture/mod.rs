//! Capture workers and the session that drives them.

pub mod session;
pub mod worker;

pub use session::{CaptureSession, SessionOutcome};
pub use worker::{buffer_capacity_for, CaptureConfig, CaptureWorker, RunningWorker, WorkerState};
