//! Configuration file handling.
//!
//! This module handles loading and merging configuration from
//! `.acmecap.toml` files.

use crate::cli::{Args, OutputFormat};
use crate::device::SimulationConfig;
use crate::models::{Channel, DEFAULT_SLOT_COUNT, POWER_UNIT};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Name of the configuration file looked up in the working directory.
pub const CONFIG_FILE_NAME: &str = ".acmecap.toml";

/// Root configuration structure.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Cape connection settings.
    #[serde(default)]
    pub cape: CapeConfig,

    /// Capture settings.
    #[serde(default)]
    pub capture: CaptureSettings,

    /// Report settings.
    #[serde(default)]
    pub report: ReportConfig,

    /// Simulated cape used by `--simulate`.
    #[serde(default)]
    pub simulation: SimulationConfig,
}

/// ACME cape connection settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapeConfig {
    /// Hostname or IP address of the cape.
    #[serde(default = "default_host")]
    pub host: String,

    /// Number of probe slots.
    #[serde(default = "default_slot_count")]
    pub slot_count: usize,

    /// Port of the slot discovery service.
    #[serde(default = "default_discovery_port")]
    pub discovery_port: u16,

    /// Path of the slot discovery service.
    #[serde(default = "default_discovery_path")]
    pub discovery_path: String,

    /// Timeout of one discovery request, in seconds.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,
}

impl Default for CapeConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            slot_count: default_slot_count(),
            discovery_port: default_discovery_port(),
            discovery_path: default_discovery_path(),
            request_timeout_seconds: default_request_timeout(),
        }
    }
}

fn default_host() -> String {
    "baylibre-acme.local".to_string()
}

fn default_slot_count() -> usize {
    DEFAULT_SLOT_COUNT
}

fn default_discovery_port() -> u16 {
    8000
}

fn default_discovery_path() -> String {
    "/acme".to_string()
}

fn default_request_timeout() -> u64 {
    5
}

/// Capture settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureSettings {
    /// Number of power rails to capture, from slot 1. Every slot if unset.
    #[serde(default)]
    pub count: Option<usize>,

    /// Capture duration in seconds.
    #[serde(default = "default_duration")]
    pub duration_seconds: u64,

    /// Channels captured on every probe.
    #[serde(default = "default_channels")]
    pub channels: Vec<Channel>,

    /// Oversampling ratio applied before capture.
    #[serde(default = "default_oversampling_ratio")]
    pub oversampling_ratio: u32,

    /// Power rail names, one per slot from slot 1.
    #[serde(default)]
    pub names: Vec<String>,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            count: None,
            duration_seconds: default_duration(),
            channels: default_channels(),
            oversampling_ratio: default_oversampling_ratio(),
            names: Vec::new(),
        }
    }
}

fn default_duration() -> u64 {
    10
}

fn default_channels() -> Vec<Channel> {
    vec![Channel::Vbat, Channel::Ishunt]
}

fn default_oversampling_ratio() -> u32 {
    1
}

/// Report settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportConfig {
    /// Output format.
    #[serde(default)]
    pub format: OutputFormat,

    /// Unit label of the derived power series.
    #[serde(default = "default_power_unit")]
    pub power_unit: String,

    /// Show a progress bar while capturing.
    #[serde(default = "default_true")]
    pub show_progress: bool,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            format: OutputFormat::default(),
            power_unit: default_power_unit(),
            show_progress: true,
        }
    }
}

fn default_power_unit() -> String {
    POWER_UNIT.to_string()
}

fn default_true() -> bool {
    true
}

impl Config {
    /// Load configuration from a file path.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Try to load configuration from the working directory.
    ///
    /// Returns `Ok(None)` if the file doesn't exist, `Err` if it exists but can't be parsed.
    pub fn load_default() -> Result<Option<Self>> {
        Self::load_from_dir(Path::new("."))
    }

    /// Try to load `.acmecap.toml` from a directory.
    pub fn load_from_dir(dir: &Path) -> Result<Option<Self>> {
        let config_path = dir.join(CONFIG_FILE_NAME);

        if config_path.exists() {
            Ok(Some(Self::load(&config_path)?))
        } else {
            Ok(None)
        }
    }

    /// Merge this configuration with CLI arguments.
    ///
    /// CLI arguments take precedence over config file settings.
    pub fn merge_with_args(&mut self, args: &Args) {
        if let Some(ref ip) = args.ip {
            self.cape.host = ip.clone();
        }
        if let Some(count) = args.count {
            self.capture.count = Some(count);
        }
        if let Some(duration) = args.duration {
            self.capture.duration_seconds = duration;
        }
        if let Some(ref names) = args.names {
            self.capture.names = names.iter().map(|n| n.trim().to_string()).collect();
        }
        if let Some(format) = args.format {
            self.report.format = format;
        }

        // Flags always override
        if args.no_progress || args.quiet {
            self.report.show_progress = false;
        }
    }

    /// Number of rails to capture.
    pub fn rail_count(&self) -> usize {
        self.capture.count.unwrap_or(self.cape.slot_count)
    }

    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.capture.duration_seconds)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.cape.request_timeout_seconds)
    }

    /// Check the merged configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.cape.slot_count == 0 {
            return Err("Slot count must be at least 1".to_string());
        }

        let count = self.rail_count();
        if count == 0 || count > self.cape.slot_count {
            return Err(format!(
                "Count must be between 1 and {} (got {})",
                self.cape.slot_count, count
            ));
        }

        if !self.capture.names.is_empty() && self.capture.names.len() != count {
            return Err(format!(
                "Expected {} power rail name(s), got {}",
                count,
                self.capture.names.len()
            ));
        }

        if self.capture.duration_seconds == 0 {
            return Err("Duration must be at least 1 second".to_string());
        }

        if self.capture.channels.is_empty() {
            return Err("At least one channel must be captured".to_string());
        }

        if self.capture.oversampling_ratio == 0 {
            return Err("Oversampling ratio must be at least 1".to_string());
        }

        Ok(())
    }

    /// Generate a default configuration file content.
    pub fn default_toml() -> String {
        let config = Config::default();
        toml::to_string_pretty(&config).unwrap_or_else(|_| String::new())
    }
}
