//! Shared data structures for the streaming pipeline
//!
//! - [`Reading`]: one sample from one sensor (source -> queue -> engine -> coalescer)
//! - [`Aggregate`]: windowed summary handed to the storage sink
//! - [`Alert`]: the record an anomaly detection would become

mod aggregate;
mod alert;
mod reading;

pub use aggregate::*;
pub use alert::*;
pub use reading::*;
