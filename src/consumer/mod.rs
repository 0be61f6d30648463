mod aggregator;
mod barrier;
mod reader;

use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, info};
use ractor::Actor;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

pub use barrier::CatchUpBarrier;

use crate::handler::MessageHandler;
use crate::metrics::{ConsumerMetrics, RecorderMetrics};
use crate::source::{PartitionStream, Source, SourceError};
use aggregator::ResultAggregator;
use reader::PartitionReader;

/// Partition id -> last consumed offset, `-1` when nothing was consumed.
pub type PartitionOffsets = HashMap<i32, i64>;

#[derive(Debug, thiserror::Error)]
pub enum ConsumeError {
    #[error("topic {0} has no partitions")]
    NoPartitions(String),
    #[error("no start offset given for partition {partition} of topic {topic}")]
    MissingOffset { topic: String, partition: i32 },
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error("failed to start result aggregator: {0}")]
    AggregatorSpawn(String),
    #[error("final offsets for topic {0} were lost")]
    ResultsLost(String),
    #[error("consumer is closed")]
    Closed,
}

/// Reads every partition of a topic with one task per partition.
///
/// Each `consume_*` call starts an independent run with its own barrier and
/// result aggregator; [`TopicConsumer::close`] cancels all of them.
pub struct TopicConsumer {
    source: Arc<dyn Source>,
    handler: Arc<dyn MessageHandler>,
    metrics: Arc<dyn ConsumerMetrics>,
    shutdown: CancellationToken,
}

/// Handle on one run started by a [`TopicConsumer`].
pub struct Consumption {
    topic: String,
    partitions: Vec<i32>,
    barrier: CatchUpBarrier,
    final_offsets: oneshot::Receiver<PartitionOffsets>,
    cancel: CancellationToken,
}

impl TopicConsumer {
    pub fn new(source: Arc<dyn Source>, handler: Arc<dyn MessageHandler>) -> Self {
        Self {
            source,
            handler,
            metrics: Arc::new(RecorderMetrics),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn ConsumerMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Starts reading after the given offsets, one entry required per
    /// partition. Returns once every reader is running.
    pub async fn consume_from_offsets(
        &self,
        topic: &str,
        start_offsets: &PartitionOffsets,
        exit_after_caught_up: bool,
    ) -> Result<Consumption, ConsumeError> {
        let partitions = self.partitions(topic).await?;
        self.start(topic, partitions, start_offsets, exit_after_caught_up)
            .await
    }

    /// Starts every partition at its oldest retained message.
    pub async fn consume_from_beginning(
        &self,
        topic: &str,
        exit_after_caught_up: bool,
    ) -> Result<Consumption, ConsumeError> {
        let partitions = self.partitions(topic).await?;
        let mut offsets = PartitionOffsets::new();
        for &partition in &partitions {
            let oldest = self.source.oldest_offset(topic, partition).await?;
            offsets.insert(partition, oldest - 1);
        }
        self.start(topic, partitions, &offsets, exit_after_caught_up)
            .await
    }

    /// Starts every partition after its newest message, so only messages
    /// produced from now on are read. Such a run is caught up immediately.
    pub async fn consume_from_latest(&self, topic: &str) -> Result<Consumption, ConsumeError> {
        let partitions = self.partitions(topic).await?;
        let mut offsets = PartitionOffsets::new();
        for &partition in &partitions {
            let latest = self.source.latest_offset(topic, partition).await?;
            offsets.insert(partition, latest - 1);
        }
        self.start(topic, partitions, &offsets, false).await
    }

    /// Cancels every run of this consumer; readers drop their streams and
    /// report. In-flight handler calls are not awaited. Later `consume_*`
    /// calls fail with [`ConsumeError::Closed`].
    pub fn close(&self) {
        debug!("Closing topic consumer");
        self.shutdown.cancel();
    }

    async fn start(
        &self,
        topic: &str,
        partitions: Vec<i32>,
        start_offsets: &PartitionOffsets,
        exit_after_caught_up: bool,
    ) -> Result<Consumption, ConsumeError> {
        let mut starts = Vec::with_capacity(partitions.len());
        for &partition in &partitions {
            let start = start_offsets.get(&partition).copied().ok_or_else(|| {
                ConsumeError::MissingOffset {
                    topic: topic.to_string(),
                    partition,
                }
            })?;
            starts.push((partition, start));
        }

        // Targets are fixed before any stream opens; later writes don't move them.
        let mut planned = Vec::with_capacity(starts.len());
        for (partition, start) in starts {
            let target = self.source.latest_offset(topic, partition).await? - 1;
            planned.push((partition, start, target));
        }

        // Open everything up front so a failure leaves no reader running.
        let mut opened: Vec<(i32, i64, i64, PartitionStream)> = Vec::with_capacity(planned.len());
        for (partition, start, target) in planned {
            let stream = self
                .source
                .open_partition(topic, partition, start.saturating_add(1))
                .await?;
            opened.push((partition, start, target, stream));
        }

        let (reply, final_offsets) = oneshot::channel();
        let (aggregator, _handle) = Actor::spawn(
            None,
            ResultAggregator,
            aggregator::Args {
                topic: topic.to_string(),
                partitions: partitions.clone(),
                reply,
            },
        )
        .await
        .map_err(|e| ConsumeError::AggregatorSpawn(e.to_string()))?;

        let barrier = CatchUpBarrier::new(partitions.len());
        let cancel = self.shutdown.child_token();

        for (partition, start, target, stream) in opened {
            let reader = PartitionReader::new(
                topic.to_string(),
                partition,
                start,
                target,
                exit_after_caught_up,
                stream,
                self.handler.clone(),
                self.metrics.clone(),
                barrier.clone(),
                aggregator.clone(),
                cancel.clone(),
            );
            tokio::spawn(reader.run());
        }

        info!("Started {} readers for topic {}", partitions.len(), topic);
        Ok(Consumption {
            topic: topic.to_string(),
            partitions,
            barrier,
            final_offsets,
            cancel,
        })
    }

    async fn partitions(&self, topic: &str) -> Result<Vec<i32>, ConsumeError> {
        if self.shutdown.is_cancelled() {
            return Err(ConsumeError::Closed);
        }
        let partitions = self.source.partitions(topic).await?;
        if partitions.is_empty() {
            return Err(ConsumeError::NoPartitions(topic.to_string()));
        }
        Ok(partitions)
    }
}

impl Consumption {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partitions(&self) -> &[i32] {
        &self.partitions
    }

    /// Resolves once every partition reached the offset that was latest when
    /// the run started, or its reader exited before that.
    pub async fn caught_up(&self) {
        self.barrier.wait().await
    }

    pub fn is_caught_up(&self) -> bool {
        self.barrier.remaining() == 0
    }

    /// Stops this run only.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Resolves after every reader exited, with the last offset each one
    /// consumed.
    pub async fn final_offsets(self) -> Result<PartitionOffsets, ConsumeError> {
        self.final_offsets
            .await
            .map_err(|_| ConsumeError::ResultsLost(self.topic))
    }
}
