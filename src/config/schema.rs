use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub logging: LoggingConfig,
    pub adaptation: AdaptationConfig,
    pub shared_memory: SharedMemConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// EnvFilter directive; `RUST_LOG` overrides it.
    pub filter: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
            format: LogFormat::Text,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Text,
    Json,
}

/// Knobs for the adaptation service registry.
///
/// Durations are written in seconds, matching the directive units.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdaptationConfig {
    /// Session failures tolerated before suspension; -1 disables the limit.
    pub service_failure_limit: i32,
    /// Seconds between suspension and the next probe.
    pub service_revival_delay: u64,
    /// Minimum seconds between two probes of the same service.
    pub min_update_gap: u64,
    /// Conservative estimate of how long one OPTIONS exchange takes; the
    /// next probe is scheduled this far ahead of options expiry.
    pub expected_probe_duration: u64,
    /// One `<identity> <kind> <bypass> <uri>` directive per entry.
    pub services: Vec<String>,
}

impl Default for AdaptationConfig {
    fn default() -> Self {
        Self {
            service_failure_limit: 10,
            service_revival_delay: 180,
            min_update_gap: 30,
            expected_probe_duration: 20,
            services: Vec::new(),
        }
    }
}

impl AdaptationConfig {
    pub fn revival_delay(&self) -> Duration {
        Duration::from_secs(self.service_revival_delay)
    }

    pub fn update_gap(&self) -> Duration {
        Duration::from_secs(self.min_update_gap)
    }

    pub fn probe_lead(&self) -> Duration {
        Duration::from_secs(self.expected_probe_duration)
    }
}

/// Sizing for the shared page pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SharedMemConfig {
    /// Bytes of shared memory for in-flight objects; 0 disables the pool.
    pub memory_limit: u64,
    pub page_size: u32,
    /// Cooperating worker processes; 1 means single-process mode.
    pub workers: u32,
}

impl Default for SharedMemConfig {
    fn default() -> Self {
        Self {
            memory_limit: 256 * 1024 * 1024,
            page_size: 32 * 1024,
            workers: 1,
        }
    }
}

impl SharedMemConfig {
    pub fn smp(&self) -> bool {
        self.workers > 1
    }
}
