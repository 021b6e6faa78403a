//! Stream configuration - every pipeline tunable as a TOML value
//!
//! Each section implements `Default` with the design defaults from
//! [`super::defaults`], so a missing file or a missing key changes nothing.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

use super::defaults;
use crate::types::AggregateWindow;

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV_VAR: &str = "SENSOR_STREAM_CONFIG";

/// Config file looked up in the working directory.
pub const LOCAL_CONFIG_FILE: &str = "stream_config.toml";

// ============================================================================
// Top-Level Config
// ============================================================================

/// Root configuration for one processing instance.
///
/// Load with [`StreamConfig::load()`] which searches:
/// 1. `$SENSOR_STREAM_CONFIG`
/// 2. `./stream_config.toml`
/// 3. Built-in defaults
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamConfig {
    #[serde(default)]
    pub queue: QueueConfig,

    #[serde(default)]
    pub engine: EngineConfig,

    #[serde(default)]
    pub broadcast: BroadcastConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub simulator: SimulatorConfig,
}

impl StreamConfig {
    /// Load configuration using the standard search order. Files that fail to
    /// load or validate are logged and skipped.
    pub fn load() -> Self {
        if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
            let p = PathBuf::from(&path);
            if p.exists() {
                match Self::load_from_file(&p) {
                    Ok(config) => {
                        info!(path = %p.display(), "Loaded stream config from {}", CONFIG_ENV_VAR);
                        return config;
                    }
                    Err(e) => {
                        warn!(path = %p.display(), error = %e, "Failed to load config from {}, falling back", CONFIG_ENV_VAR);
                    }
                }
            } else {
                warn!(path = %path, "{} points to non-existent file, falling back", CONFIG_ENV_VAR);
            }
        }

        let local = PathBuf::from(LOCAL_CONFIG_FILE);
        if local.exists() {
            match Self::load_from_file(&local) {
                Ok(config) => {
                    info!("Loaded stream config from ./{}", LOCAL_CONFIG_FILE);
                    return config;
                }
                Err(e) => {
                    warn!(error = %e, "Failed to load ./{}, using defaults", LOCAL_CONFIG_FILE);
                }
            }
        }

        info!("No {} found - using built-in defaults", LOCAL_CONFIG_FILE);
        Self::default()
    }

    /// Load and validate a specific TOML file.
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
        let config = Self::from_toml_str(&contents)
            .map_err(|e| match e {
                ConfigError::Parse(_, inner) => ConfigError::Parse(path.to_path_buf(), inner),
                other => other,
            })?;
        Ok(config)
    }

    /// Parse and validate TOML text.
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: Self =
            toml::from_str(contents).map_err(|e| ConfigError::Parse(PathBuf::new(), e))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(ConfigError::Serialize)
    }

    /// Check every value for internal consistency, collecting all violations.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors: Vec<String> = Vec::new();

        if self.queue.capacity == 0 {
            errors.push("queue.capacity must be > 0".to_string());
        }

        let e = &self.engine;
        if e.max_batch_size == 0 {
            errors.push("engine.max_batch_size must be > 0".to_string());
        }
        if e.max_batch_wait_ms == 0 {
            errors.push("engine.max_batch_wait_ms must be > 0".to_string());
        }
        if e.windows.is_empty() {
            errors.push("engine.windows must list at least one window".to_string());
        }

        if self.broadcast.flush_interval_ms == 0 {
            errors.push("broadcast.flush_interval_ms must be > 0".to_string());
        }
        if self.broadcast.group_capacity == 0 {
            errors.push("broadcast.group_capacity must be > 0".to_string());
        }

        let s = &self.storage;
        if s.ttl_secs == 0 {
            errors.push("storage.ttl_secs must be > 0".to_string());
        }
        if s.dispatch_capacity == 0 {
            errors.push("storage.dispatch_capacity must be > 0".to_string());
        }
        if s.max_list_len == 0 {
            errors.push("storage.max_list_len must be > 0".to_string());
        }
        if s.prune_interval_secs == 0 {
            errors.push("storage.prune_interval_secs must be > 0".to_string());
        }

        let sim = &self.simulator;
        if sim.sensors == 0 {
            errors.push("simulator.sensors must be > 0".to_string());
        }
        if sim.rate_hz == 0 {
            errors.push("simulator.rate_hz must be > 0".to_string());
        }
        if !sim.has_valid_distribution() {
            errors.push(format!(
                "simulator: mean/std_dev must be finite and std_dev >= 0 (got mean={}, std_dev={})",
                sim.mean, sim.std_dev
            ));
        }
        if !(0.0..=1.0).contains(&sim.spike_probability) {
            errors.push(format!(
                "simulator.spike_probability must be within [0, 1], got {}",
                sim.spike_probability
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(errors))
        }
    }
}

// ============================================================================
// Error Type
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config I/O error ({}): {}", .0.display(), .1)]
    Io(PathBuf, #[source] std::io::Error),
    #[error("config parse error ({}): {}", .0.display(), .1)]
    Parse(PathBuf, #[source] toml::de::Error),
    #[error("config serialization error: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("config validation failed:\n  - {}", .0.join("\n  - "))]
    Validation(Vec<String>),
}

// ============================================================================
// Sections
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Pending readings kept before the oldest is evicted.
    #[serde(default = "default_queue_capacity")]
    pub capacity: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: default_queue_capacity(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,

    #[serde(default = "default_max_batch_wait_ms")]
    pub max_batch_wait_ms: u64,

    #[serde(default = "default_idle_sleep_ms")]
    pub idle_sleep_ms: u64,

    /// Windows aggregated after every batch.
    #[serde(default = "default_windows")]
    pub windows: Vec<AggregateWindow>,
}

impl EngineConfig {
    pub const fn max_batch_wait(&self) -> Duration {
        Duration::from_millis(self.max_batch_wait_ms)
    }

    pub const fn idle_sleep(&self) -> Duration {
        Duration::from_millis(self.idle_sleep_ms)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_batch_size: default_max_batch_size(),
            max_batch_wait_ms: default_max_batch_wait_ms(),
            idle_sleep_ms: default_idle_sleep_ms(),
            windows: default_windows(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BroadcastConfig {
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,

    /// Per-group channel depth in the in-process subscription registry.
    #[serde(default = "default_group_capacity")]
    pub group_capacity: usize,
}

impl BroadcastConfig {
    pub const fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            flush_interval_ms: default_flush_interval_ms(),
            group_capacity: default_group_capacity(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Memory,
    Sled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,

    /// Database path (sled backend only).
    #[serde(default = "default_sled_path")]
    pub path: PathBuf,

    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,

    /// Pending fire-and-forget persistence jobs before new ones are dropped.
    #[serde(default = "default_dispatch_capacity")]
    pub dispatch_capacity: usize,

    #[serde(default = "default_max_list_len")]
    pub max_list_len: usize,

    #[serde(default = "default_prune_interval_secs")]
    pub prune_interval_secs: u64,
}

impl StorageConfig {
    pub const fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            path: default_sled_path(),
            ttl_secs: default_ttl_secs(),
            dispatch_capacity: default_dispatch_capacity(),
            max_list_len: default_max_list_len(),
            prune_interval_secs: default_prune_interval_secs(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_server_addr")]
    pub addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            addr: default_server_addr(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulatorConfig {
    #[serde(default = "default_sim_sensors")]
    pub sensors: usize,

    #[serde(default = "default_sim_rate_hz")]
    pub rate_hz: u32,

    #[serde(default = "default_sim_mean")]
    pub mean: f64,

    #[serde(default = "default_sim_std_dev")]
    pub std_dev: f64,

    #[serde(default = "default_sim_spike_probability")]
    pub spike_probability: f64,
}

impl SimulatorConfig {
    /// Mean and standard deviation are finite and the deviation is non-negative.
    pub fn has_valid_distribution(&self) -> bool {
        self.mean.is_finite() && self.std_dev.is_finite() && self.std_dev >= 0.0
    }
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            sensors: default_sim_sensors(),
            rate_hz: default_sim_rate_hz(),
            mean: default_sim_mean(),
            std_dev: default_sim_std_dev(),
            spike_probability: default_sim_spike_probability(),
        }
    }
}

// ============================================================================
// Serde default helpers
// ============================================================================

const fn default_queue_capacity() -> usize {
    defaults::QUEUE_CAPACITY
}
const fn default_max_batch_size() -> usize {
    defaults::MAX_BATCH_SIZE
}
const fn default_max_batch_wait_ms() -> u64 {
    defaults::MAX_BATCH_WAIT_MS
}
const fn default_idle_sleep_ms() -> u64 {
    defaults::IDLE_SLEEP_MS
}
fn default_windows() -> Vec<AggregateWindow> {
    vec![AggregateWindow::OneMinute]
}
const fn default_flush_interval_ms() -> u64 {
    defaults::FLUSH_INTERVAL_MS
}
const fn default_group_capacity() -> usize {
    defaults::GROUP_CHANNEL_CAPACITY
}
fn default_sled_path() -> PathBuf {
    PathBuf::from(defaults::SLED_PATH)
}
const fn default_ttl_secs() -> u64 {
    defaults::STORAGE_TTL_SECS
}
const fn default_dispatch_capacity() -> usize {
    defaults::PERSISTENCE_QUEUE_CAPACITY
}
const fn default_max_list_len() -> usize {
    defaults::MAX_LIST_LEN
}
const fn default_prune_interval_secs() -> u64 {
    defaults::STORAGE_PRUNE_INTERVAL_SECS
}
const fn default_true() -> bool {
    true
}
fn default_server_addr() -> String {
    defaults::SERVER_ADDR.to_string()
}
const fn default_sim_sensors() -> usize {
    defaults::SIM_SENSORS
}
const fn default_sim_rate_hz() -> u32 {
    defaults::SIM_RATE_HZ
}
const fn default_sim_mean() -> f64 {
    defaults::SIM_MEAN
}
const fn default_sim_std_dev() -> f64 {
    defaults::SIM_STD_DEV
}
const fn default_sim_spike_probability() -> f64 {
    defaults::SIM_SPIKE_PROBABILITY
}
