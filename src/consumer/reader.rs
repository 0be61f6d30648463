use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::{FutureExt, StreamExt};
use log::{debug, error, info};
use ractor::ActorRef;
use tokio_util::sync::CancellationToken;

use super::aggregator;
use super::barrier::CatchUpBarrier;
use crate::handler::MessageHandler;
use crate::metrics::ConsumerMetrics;
use crate::source::{Message, PartitionStream};

/// Drives one partition of a run from an already opened stream.
///
/// Dropping the reader releases its stream, releases the barrier if it never
/// caught up and reports the terminal offset, however the task ends.
pub(crate) struct PartitionReader {
    topic: String,
    partition: i32,
    /// Last offset consumed, the start offset until a message arrives.
    current_offset: i64,
    /// Offset of the last message present when the run started.
    target_offset: i64,
    exit_after_caught_up: bool,
    stream: PartitionStream,
    handler: Arc<dyn MessageHandler>,
    metrics: Arc<dyn ConsumerMetrics>,
    barrier: CatchUpBarrier,
    aggregator: ActorRef<aggregator::Message>,
    cancel: CancellationToken,
    caught_up: bool,
}

/// What the loop does after an event.
enum Flow {
    Continue,
    Exit,
}

impl PartitionReader {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        topic: String,
        partition: i32,
        start_offset: i64,
        target_offset: i64,
        exit_after_caught_up: bool,
        stream: PartitionStream,
        handler: Arc<dyn MessageHandler>,
        metrics: Arc<dyn ConsumerMetrics>,
        barrier: CatchUpBarrier,
        aggregator: ActorRef<aggregator::Message>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            topic,
            partition,
            current_offset: start_offset,
            target_offset,
            exit_after_caught_up,
            stream,
            handler,
            metrics,
            barrier,
            aggregator,
            cancel,
            caught_up: false,
        }
    }

    pub async fn run(mut self) {
        debug!(
            "Starting reader for {}/{} after offset {}, catching up to {}",
            self.topic, self.partition, self.current_offset, self.target_offset
        );

        if self.current_offset >= self.target_offset {
            self.mark_caught_up();
            if self.exit_after_caught_up {
                return;
            }
        }

        loop {
            let event = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => None,
                next = self.stream.next() => Some(next),
            };

            let flow = match event {
                None => {
                    debug!("Reader for {}/{} cancelled", self.topic, self.partition);
                    Flow::Exit
                }
                Some(Some(Ok(message))) => self.process(message).await,
                Some(Some(Err(e))) => {
                    error!("Stream error on {}/{}: {}", self.topic, self.partition, e);
                    self.metrics.stream_error(&self.topic, self.partition);
                    Flow::Continue
                }
                Some(None) => {
                    debug!("Stream for {}/{} ended", self.topic, self.partition);
                    Flow::Exit
                }
            };

            if let Flow::Exit = flow {
                break;
            }
        }
    }

    async fn process(&mut self, message: Message) -> Flow {
        self.current_offset = message.offset;

        let handled = AssertUnwindSafe(self.handler.handle(&self.cancel, &message))
            .catch_unwind()
            .await;
        match handled {
            Ok(Ok(())) => self.metrics.message_processed(&self.topic, self.partition),
            Ok(Err(e)) => {
                error!(
                    "Handler failed for {}/{} at offset {}: {:?}",
                    self.topic, self.partition, message.offset, e
                );
                self.metrics.message_error(&self.topic, self.partition);
            }
            Err(panic) => {
                error!(
                    "Handler panicked for {}/{} at offset {}: {}",
                    self.topic,
                    self.partition,
                    message.offset,
                    panic_message(&*panic)
                );
                self.metrics.message_error(&self.topic, self.partition);
            }
        }

        if !self.caught_up && self.current_offset >= self.target_offset {
            self.mark_caught_up();
            if self.exit_after_caught_up {
                return Flow::Exit;
            }
        }
        Flow::Continue
    }

    fn mark_caught_up(&mut self) {
        if self.caught_up {
            return;
        }
        self.caught_up = true;
        info!(
            "Caught up on {}/{} at offset {}",
            self.topic, self.partition, self.current_offset
        );
        self.metrics.caught_up(&self.topic, self.partition);
        self.barrier.release();
    }
}

impl Drop for PartitionReader {
    fn drop(&mut self) {
        if !self.caught_up {
            self.caught_up = true;
            self.barrier.release();
        }
        self.stream = Box::pin(futures::stream::empty());

        let report = aggregator::Message::ReaderExited {
            partition: self.partition,
            offset: self.current_offset,
        };
        if self.aggregator.send_message(report).is_err() {
            error!(
                "Could not report final offset {} for {}/{}",
                self.current_offset, self.topic, self.partition
            );
        }
        debug!("Reader for {}/{} exited", self.topic, self.partition);
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s
    } else {
        "non-string panic payload"
    }
}
