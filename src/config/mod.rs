//! Stream Configuration Module
//!
//! Per-instance configuration loaded from TOML, covering queue sizing,
//! batching budgets, flush cadence, storage and the simulated source.
//!
//! ## Loading Order
//!
//! 1. `SENSOR_STREAM_CONFIG` environment variable (path to TOML file)
//! 2. `stream_config.toml` in the current working directory
//! 3. Built-in defaults (see [`defaults`])
//!
//! ## Usage
//!
//! ```ignore
//! // In main():
//! config::init(StreamConfig::load());
//!
//! // Anywhere in the binary:
//! let capacity = config::get().queue.capacity;
//! ```

pub mod defaults;
mod stream_config;

pub use stream_config::*;

use std::sync::OnceLock;

static STREAM_CONFIG: OnceLock<StreamConfig> = OnceLock::new();

/// Initialize the global stream configuration.
///
/// Only the first call wins; later calls are logged and ignored.
pub fn init(config: StreamConfig) {
    if STREAM_CONFIG.set(config).is_err() {
        tracing::warn!("config::init() called more than once - ignoring");
    }
}

/// Get a reference to the global stream configuration.
///
/// Falls back to the built-in defaults when `init()` has not been called.
pub fn get() -> &'static StreamConfig {
    STREAM_CONFIG.get_or_init(StreamConfig::default)
}

/// Check whether the config has been initialized.
pub fn is_initialized() -> bool {
    STREAM_CONFIG.get().is_some()
}
