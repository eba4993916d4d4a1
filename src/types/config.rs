//! Configuration structures.
//!
//! Configuration is loaded from a JSON config file and environment variables.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::quota::PeriodType;
use crate::types::{Error, Result};

/// Global engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Server configuration.
    #[serde(default)]
    pub server: ServerConfig,

    /// Observability configuration.
    #[serde(default)]
    pub observability: ObservabilityConfig,

    /// Enforcement and reporting behaviour.
    #[serde(default)]
    pub engine: EngineConfig,

    /// Usage bucket retention.
    #[serde(default)]
    pub retention: RetentionConfig,

    /// IPC transport configuration.
    #[serde(default)]
    pub ipc: IpcConfig,
}

impl Config {
    /// Load configuration from a JSON file. Missing sections take defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config = serde_json::from_str(&raw)?;
        Ok(config)
    }

    /// Apply `QUOTA_ENGINE_*` environment overrides.
    pub fn apply_env(&mut self) -> Result<()> {
        if let Ok(addr) = std::env::var("QUOTA_ENGINE_LISTEN_ADDR") {
            self.server.listen_addr = addr;
        }
        if let Ok(period) = std::env::var("QUOTA_ENGINE_ENFORCEMENT_PERIOD") {
            self.engine.enforcement_period = period.parse().map_err(|_| {
                Error::validation(format!("unknown enforcement period: {period}"))
            })?;
        }
        Ok(())
    }
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// IPC server bind address (TCP).
    pub listen_addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:50061".to_string(),
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Tracing log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable JSON log formatting.
    pub json_logs: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}

/// Enforcement and reporting behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Period whose open bucket is checked by `authorize`.
    pub enforcement_period: PeriodType,

    /// Number of buckets returned by history queries without a date range.
    pub history_window: u32,

    /// How far into the future a consumption timestamp may lie.
    #[serde(with = "humantime_serde")]
    pub max_clock_skew: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            enforcement_period: PeriodType::Daily,
            history_window: 30,
            max_clock_skew: Duration::from_secs(5),
        }
    }
}

/// How long closed buckets are kept per period type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionConfig {
    /// How often the background sweep runs.
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,

    #[serde(with = "humantime_serde")]
    pub hourly: Duration,

    #[serde(with = "humantime_serde")]
    pub daily: Duration,

    #[serde(with = "humantime_serde")]
    pub weekly: Duration,

    #[serde(with = "humantime_serde")]
    pub monthly: Duration,
}

impl RetentionConfig {
    pub fn for_period(&self, period: PeriodType) -> Duration {
        match period {
            PeriodType::Hourly => self.hourly,
            PeriodType::Daily => self.daily,
            PeriodType::Weekly => self.weekly,
            PeriodType::Monthly => self.monthly,
        }
    }
}

impl Default for RetentionConfig {
    fn default() -> Self {
        const DAY: u64 = 86_400;
        Self {
            sweep_interval: Duration::from_secs(300),
            hourly: Duration::from_secs(7 * DAY),
            daily: Duration::from_secs(90 * DAY),
            weekly: Duration::from_secs(365 * DAY),
            monthly: Duration::from_secs(3 * 365 * DAY),
        }
    }
}

/// IPC transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpcConfig {
    /// Maximum frame payload size in bytes.
    pub max_frame_bytes: u32,

    /// Bounded channel capacity for streaming responses.
    pub stream_channel_capacity: usize,

    /// Maximum concurrent TCP connections. Connections beyond this limit
    /// are rejected.
    pub max_connections: usize,

    /// Read timeout in seconds per frame. Connections idle beyond this
    /// duration are dropped.
    pub read_timeout_secs: u64,

    /// Write timeout in seconds per frame.
    pub write_timeout_secs: u64,
}

impl Default for IpcConfig {
    fn default() -> Self {
        Self {
            max_frame_bytes: 1024 * 1024,
            stream_channel_capacity: 64,
            max_connections: 1000,
            read_timeout_secs: 30,
            write_timeout_secs: 10,
        }
    }
}
