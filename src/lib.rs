//! sensor-stream: streaming sensor pipeline
//!
//! Ingests per-sensor readings, keeps rolling statistics with a z-score
//! anomaly rule, aggregates trailing windows per sensor and globally, and
//! fans coalesced frames out to subscriber groups.
//!
//! ## Architecture
//!
//! - **Ingestion Queue**: bounded, drop-oldest, never blocks producers
//! - **Aggregation Engine**: single-owner batch loop (Welford stats, windows, p95)
//! - **Broadcast Coalescer**: per-sensor buffers flushed as one frame per tick
//! - **Storage**: fire-and-forget persistence behind the `StorageSink` trait

pub mod alerts;
pub mod broadcast;
pub mod config;
pub mod pipeline;
pub mod stats;
pub mod storage;
pub mod types;

// Re-export configuration
pub use config::StreamConfig;

// Re-export commonly used types
pub use types::{Aggregate, AggregateWindow, Alert, Reading, ReadingError, Severity};

// Re-export pipeline components
pub use pipeline::{
    AggregationEngine, AnomalyDetection, BatchOutcome, IngestionQueue, ProcessingLoop,
    ReadingSource, SimulatedSource, StdinSource,
};

// Re-export fan-out
pub use broadcast::{
    BroadcastCoalescer, Frame, FrameSink, FrameTransport, SubscriptionRegistry, TransportError,
};

// Re-export storage
pub use storage::{InMemoryStore, PersistenceDispatcher, SledStore, StorageError, StorageSink};

// Re-export the acknowledgment boundary
pub use alerts::{AckError, AlertAcknowledger, PassThroughAcknowledger};
