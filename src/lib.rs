//! Consumes every partition of a topic concurrently, reports when the
//! readers have caught up with the offsets current at start, and returns the
//! final offset of each partition once they stop.

pub mod config;
pub mod consumer;
pub mod handler;
pub mod metrics;
pub mod source;

pub use consumer::{CatchUpBarrier, ConsumeError, Consumption, PartitionOffsets, TopicConsumer};
pub use handler::MessageHandler;
pub use self::metrics::{ConsumerMetrics, RecorderMetrics};
pub use source::{ClickHouseSource, MemorySource, Message, PartitionStream, Source, SourceError};
