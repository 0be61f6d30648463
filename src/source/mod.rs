pub mod memory;
pub mod storage;

use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::Stream;

pub use memory::MemorySource;
pub use storage::ClickHouseSource;

/// A single record read from a partition.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Bytes>,
    pub value: Option<Bytes>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("unknown topic: {0}")]
    UnknownTopic(String),
    #[error("unknown partition {partition} for topic {topic}")]
    UnknownPartition { topic: String, partition: i32 },
    #[error("partition {partition} of topic {topic} is unavailable")]
    Unavailable { topic: String, partition: i32 },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("clickhouse error: {0}")]
    ClickHouse(#[from] clickhouse::error::Error),
}

/// Messages of one partition in offset order. `Err` items are transport
/// errors the reader survives; the end of the stream means the partition
/// source is exhausted or was closed.
pub type PartitionStream = Pin<Box<dyn Stream<Item = Result<Message, SourceError>> + Send>>;

/// Read side of a partitioned log.
///
/// `latest_offset` is the offset the next produced message will get, so a
/// partition whose oldest and latest offsets are equal holds no messages.
#[async_trait]
pub trait Source: Send + Sync + 'static {
    async fn partitions(&self, topic: &str) -> Result<Vec<i32>, SourceError>;

    async fn oldest_offset(&self, topic: &str, partition: i32) -> Result<i64, SourceError>;

    async fn latest_offset(&self, topic: &str, partition: i32) -> Result<i64, SourceError>;

    /// Opens a stream yielding messages with `offset >= from`.
    async fn open_partition(
        &self,
        topic: &str,
        partition: i32,
        from: i64,
    ) -> Result<PartitionStream, SourceError>;
}
