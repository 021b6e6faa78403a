//! System-wide default constants.
//!
//! Centralises the pipeline's magic numbers. Grouped by subsystem for easy
//! discovery. The anomaly constants are fixed at compile time and have no
//! config key.

// ============================================================================
// Ingestion Queue
// ============================================================================

/// Maximum pending readings before drop-oldest eviction kicks in.
pub const QUEUE_CAPACITY: usize = 100_000;

// ============================================================================
// Aggregation Engine
// ============================================================================

/// Upper bound on readings processed per batch.
pub const MAX_BATCH_SIZE: usize = 500;

/// Time budget for draining one batch, measured from the start of the drain (ms).
pub const MAX_BATCH_WAIT_MS: u64 = 50;

/// Back-off when a wait produced no readings (ms).
pub const IDLE_SLEEP_MS: u64 = 5;

/// Samples a sensor must accumulate before its anomaly rule is evaluated.
pub const ANOMALY_MIN_SAMPLES: u64 = 30;

/// z-score at or above which a reading is flagged.
pub const ANOMALY_Z_THRESHOLD: f64 = 3.0;

/// Standard deviations at or below this are treated as a constant signal.
pub const ANOMALY_MIN_STD_DEV: f64 = 1e-9;

// ============================================================================
// Broadcast Coalescer
// ============================================================================

/// Flush cadence (ms). 50 ms = ~20 frames per second per sensor.
pub const FLUSH_INTERVAL_MS: u64 = 50;

/// Frames buffered per subscriber group before slow receivers start lagging.
pub const GROUP_CHANNEL_CAPACITY: usize = 64;

/// Subscriber group key prefix; the group for sensor `x` is `sensor:x`.
pub const GROUP_PREFIX: &str = "sensor:";

// ============================================================================
// Storage
// ============================================================================

/// Time-to-live for stored reading/aggregate/alert lists (seconds). 86 400 = 24 h.
pub const STORAGE_TTL_SECS: u64 = 86_400;

/// Pending persistence jobs before new submissions are dropped.
pub const PERSISTENCE_QUEUE_CAPACITY: usize = 10_000;

/// Maximum entries kept per in-memory list.
pub const MAX_LIST_LEN: usize = 10_000;

/// How often the sled backend sweeps expired records (seconds).
pub const STORAGE_PRUNE_INTERVAL_SECS: u64 = 300;

/// Default sled database path.
pub const SLED_PATH: &str = "./data/sensor_stream.db";

// ============================================================================
// Stream Hub
// ============================================================================

/// Default bind address for the WebSocket stream hub.
pub const SERVER_ADDR: &str = "0.0.0.0:8080";

/// Outbound messages buffered per WebSocket connection.
pub const WS_OUTBOUND_BUFFER: usize = 256;

// ============================================================================
// Supervisor
// ============================================================================

/// How long shutdown waits for tasks to drain after cancellation (seconds).
pub const SHUTDOWN_GRACE_SECS: u64 = 5;

// ============================================================================
// Simulation
// ============================================================================

/// Number of simulated sensors (`sensor-1` .. `sensor-N`).
pub const SIM_SENSORS: usize = 10;

/// Rounds per second; each round emits one reading per sensor.
pub const SIM_RATE_HZ: u32 = 100;

/// Mean and spread of the simulated signal.
pub const SIM_MEAN: f64 = 50.0;
pub const SIM_STD_DEV: f64 = 10.0;

/// Probability that a simulated reading is a spike (for exercising detection).
pub const SIM_SPIKE_PROBABILITY: f64 = 0.001;
