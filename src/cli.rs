//! Command-line interface argument parsing.
//!
//! Options that also exist in `.acmecap.toml` are optional here so that an
//! absent flag leaves the file's value in place.

use clap::{ArgAction, Parser};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// acmecap - multi-probe power capture for the BayLibre ACME cape
///
/// Captures min, max and average values of selected power rails
/// (voltage, current, power) from the probes of an ACME cape.
/// Slots are assumed to be populated from slot 1 upwards, with no hole.
///
/// Examples:
///   acmecap --ip baylibre-acme.local --duration 5 -c 2 -n VDD_1,VDD_2
///   acmecap --simulate -c 4 --format markdown
///   acmecap --init-config
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Args {
    /// ACME hostname (e.g. 192.168.1.2 or baylibre-acme.local)
    ///
    /// Default: from config or baylibre-acme.local.
    #[arg(long = "ip", visible_alias = "host", value_name = "HOSTNAME", env = "ACMECAP_HOST")]
    pub ip: Option<String>,

    /// Number of power rails to capture, starting from slot 1
    ///
    /// Default: from config or every slot of the cape.
    #[arg(short, long, value_name = "COUNT")]
    pub count: Option<usize>,

    /// Names of the captured power rails (comma-separated)
    ///
    /// One name per power rail, always starting from slot 1.
    /// Example: --names VDD_BAT,VDD_ARM
    #[arg(short, long, value_name = "LABELS", value_delimiter = ',')]
    pub names: Option<Vec<String>>,

    /// Capture duration in seconds
    ///
    /// Default: from config or 10s.
    #[arg(short, long, value_name = "SEC")]
    pub duration: Option<u64>,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,

    /// Only log errors
    #[arg(short, long)]
    pub quiet: bool,

    /// Report format
    #[arg(long, value_name = "FORMAT")]
    pub format: Option<OutputFormat>,

    /// Path to configuration file
    ///
    /// If not specified, looks for .acmecap.toml in the current directory
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Capture from a simulated cape instead of real hardware
    #[arg(long)]
    pub simulate: bool,

    /// Hide the capture progress bar
    #[arg(long)]
    pub no_progress: bool,

    /// Generate a default .acmecap.toml configuration file
    #[arg(long)]
    pub init_config: bool,
}

/// Output format for the report.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Console summary (default)
    #[default]
    Text,
    /// Markdown document
    Markdown,
    /// JSON document
    Json,
}

impl Args {
    /// Parse command-line arguments.
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Validate the parsed arguments.
    ///
    /// Checks that depend on the cape (slot count, names per rail) are
    /// done on the merged configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.init_config {
            return Ok(());
        }

        if let Some(ref ip) = self.ip {
            if ip.trim().is_empty() {
                return Err("Hostname must not be empty".to_string());
            }
        }

        if self.count == Some(0) {
            return Err("Count must be at least 1".to_string());
        }

        if self.duration == Some(0) {
            return Err("Duration must be at least 1 second".to_string());
        }

        if let Some(ref names) = self.names {
            if names.iter().any(|n| n.trim().is_empty()) {
                return Err("Power rail names must not be empty".to_string());
            }
        }

        if self.verbose > 0 && self.quiet {
            return Err("Cannot use both --verbose and --quiet".to_string());
        }

        Ok(())
    }

    /// Returns the log level based on verbosity settings.
    pub fn log_level(&self) -> tracing::Level {
        if self.quiet {
            return tracing::Level::ERROR;
        }
        match self.verbose {
            0 => tracing::Level::INFO,
            1 => tracing::Level::DEBUG,
            _ => tracing::Level::TRACE,
        }
    }
}
