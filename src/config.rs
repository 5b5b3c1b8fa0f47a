use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::perf::delay::DEFAULT_SAFETY_DELAY;
use crate::vulkan::slots::NUM_LOGICAL_QUERY_SLOTS;

/// Top-level configuration for the tracefuse agent.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Logging verbosity (trace, debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    #[allow(dead_code)]
    pub log_level: String,

    /// Minimum age an event must reach before dispatch; must exceed the
    /// expected cross-source timestamp skew. Default: 100ms.
    #[serde(default = "default_safety_delay", with = "humantime_serde")]
    pub safety_delay: Duration,

    /// How often aged events are released to visitors. Default: 25ms.
    #[serde(default = "default_process_interval", with = "humantime_serde")]
    pub process_interval: Duration,

    /// How often GPU query results are polled for ready submissions.
    /// Default: 10ms.
    #[serde(default = "default_completion_poll_interval", with = "humantime_serde")]
    pub completion_poll_interval: Duration,

    /// Capacity of the source-to-merger event channel. Default: 65536.
    #[serde(default = "default_event_channel_capacity")]
    pub event_channel_capacity: usize,

    /// Logical timestamp query slots per device. Default: 16384.
    #[serde(default = "default_slot_capacity")]
    pub slot_capacity: u32,

    /// Capture control configuration.
    #[serde(default)]
    pub capture: CaptureConfig,

    /// Record output configuration.
    #[serde(default)]
    pub emit: EmitConfig,

    /// Prometheus health metrics server configuration.
    #[serde(default)]
    pub health: HealthConfig,
}

/// Capture control configuration.
#[derive(Debug, Deserialize)]
pub struct CaptureConfig {
    /// Whether capture is on when the agent starts. Default: true.
    #[serde(default = "default_capture_enabled")]
    pub start_enabled: bool,
}

/// Record output configuration.
#[derive(Debug, Deserialize)]
pub struct EmitConfig {
    /// Path of the newline-delimited JSON record stream.
    /// Default: "tracefuse-records.jsonl".
    #[serde(default = "default_emit_output")]
    pub output: PathBuf,
}

/// Prometheus health metrics server configuration.
#[derive(Debug, Deserialize)]
pub struct HealthConfig {
    /// Whether to serve /metrics and /healthz. Default: true.
    #[serde(default = "default_health_enabled")]
    pub enabled: bool,

    /// Listen address; ":port" binds all interfaces. Default: ":9184".
    #[serde(default = "default_health_addr")]
    pub addr: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_safety_delay() -> Duration {
    DEFAULT_SAFETY_DELAY
}

fn default_process_interval() -> Duration {
    Duration::from_millis(25)
}

fn default_completion_poll_interval() -> Duration {
    Duration::from_millis(10)
}

fn default_event_channel_capacity() -> usize {
    65_536
}

fn default_slot_capacity() -> u32 {
    NUM_LOGICAL_QUERY_SLOTS
}

fn default_capture_enabled() -> bool {
    true
}

fn default_emit_output() -> PathBuf {
    PathBuf::from("tracefuse-records.jsonl")
}

fn default_health_enabled() -> bool {
    true
}

fn default_health_addr() -> String {
    ":9184".to_string()
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            safety_delay: default_safety_delay(),
            process_interval: default_process_interval(),
            completion_poll_interval: default_completion_poll_interval(),
            event_channel_capacity: default_event_channel_capacity(),
            slot_capacity: default_slot_capacity(),
            capture: CaptureConfig::default(),
            emit: EmitConfig::default(),
            health: HealthConfig::default(),
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            start_enabled: default_capture_enabled(),
        }
    }
}

impl Default for EmitConfig {
    fn default() -> Self {
        Self {
            output: default_emit_output(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: default_health_enabled(),
            addr: default_health_addr(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.safety_delay.is_zero() {
            bail!("safety_delay must be positive");
        }

        if self.process_interval.is_zero() {
            bail!("process_interval must be positive");
        }

        if self.completion_poll_interval.is_zero() {
            bail!("completion_poll_interval must be positive");
        }

        if self.event_channel_capacity == 0 {
            bail!("event_channel_capacity must be positive");
        }

        if self.slot_capacity == 0 || self.slot_capacity > NUM_LOGICAL_QUERY_SLOTS {
            bail!(
                "slot_capacity must be in 1..={NUM_LOGICAL_QUERY_SLOTS}, got {}",
                self.slot_capacity,
            );
        }

        if self.emit.output.as_os_str().is_empty() {
            bail!("emit.output is required");
        }

        Ok(())
    }
}
