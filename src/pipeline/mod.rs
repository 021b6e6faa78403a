//! Processing Pipeline Module
//!
//! ```text
//! ReadingSource ──► IngestionQueue ──► ProcessingLoop ──► AggregationEngine
//!   (producer)      (bounded,           (batch by size     ├─ OnlineStats + anomaly rule
//!                    drop-oldest)        or time budget)   ├─ WindowBuffer aggregates
//!                                                          ├─ FrameSink (coalescer)
//!                                                          └─ PersistenceDispatcher
//! ```
//!
//! Per sensor, readings are processed in arrival order. Per-sensor state is
//! owned by the engine's single loop and needs no locking.

pub mod anomaly;
pub mod engine;
pub mod processing_loop;
pub mod queue;
pub mod source;
pub mod window;

pub use anomaly::{detect, AnomalyDetection, ZSCORE_ALERT_KIND};
pub use engine::{AggregationEngine, BatchOutcome, EngineStats};
pub use processing_loop::ProcessingLoop;
pub use queue::{IngestionQueue, QueueStats};
pub use source::{run_producer, ReadingSource, SimulatedSource, SourceEvent, StdinSource};
pub use window::WindowBuffer;
