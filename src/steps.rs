//! Step-by-step progress output and exit codes.
//!
//! Step results are written to stderr; stdout carries the report alone.

use std::fmt;
use std::io::{self, Write};

pub const EXIT_INVALID_ARGS: i32 = 1;
pub const EXIT_UNREACHABLE: i32 = 2;
pub const EXIT_INIT_FAILED: i32 = 3;
pub const EXIT_MISSING_PROBE: i32 = 4;
pub const EXIT_CAPTURE_FAILED: i32 = 5;

/// A pipeline step failed; the process exits with `code`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepFailure {
    pub code: i32,
    pub step: String,
}

impl StepFailure {
    pub fn new(code: i32, step: impl Into<String>) -> Self {
        Self {
            code,
            step: step.into(),
        }
    }
}

impl fmt::Display for StepFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} failed (exit code {})", self.step, self.code)
    }
}

impl std::error::Error for StepFailure {}

/// Writes `✅`/`❌` step lines.
pub struct Steps<W: Write> {
    out: W,
}

impl Steps<io::Stderr> {
    pub fn stderr() -> Self {
        Self::new(io::stderr())
    }
}

impl<W: Write> Steps<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn ok(&mut self, step: &str) {
        self.line(&format!("✅ {}", step));
    }

    /// Report a failed step and build the error that ends the run.
    pub fn failed(&mut self, code: i32, step: impl Into<String>) -> anyhow::Error {
        let step = step.into();
        self.line(&format!("❌ {}", step));
        StepFailure::new(code, step).into()
    }

    /// Free-form progress line.
    pub fn line(&mut self, text: &str) {
        // Progress output is best effort; a closed stderr must not end the run.
        let _ = writeln!(self.out, "{}", text);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_lines() {
        let mut buf = Vec::new();
        {
            let mut steps = Steps::new(&mut buf);
            steps.ok("Ping ACME");
            steps.line("   Slot 1: JACK probe");
            let err = steps.failed(EXIT_MISSING_PROBE, "Detect probe in slot 2");

            let failure = err.downcast::<StepFailure>().unwrap();
            assert_eq!(failure, StepFailure::new(4, "Detect probe in slot 2"));
        }

        let text = String::from_utf8(buf).unwrap();
        assert_eq!(
            text,
            "✅ Ping ACME\n   Slot 1: JACK probe\n❌ Detect probe in slot 2\n"
        );
    }

    #[test]
    fn test_step_failure_display() {
        let failure = StepFailure::new(EXIT_UNREACHABLE, "Ping ACME");
        assert_eq!(failure.to_string(), "Ping ACME failed (exit code 2)");
    }
}
