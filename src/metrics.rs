/// Per-partition counters a [`TopicConsumer`](crate::TopicConsumer) reports
/// into. Calls are fire-and-forget and never influence consumption.
pub trait ConsumerMetrics: Send + Sync + 'static {
    fn message_processed(&self, topic: &str, partition: i32);

    fn message_error(&self, topic: &str, partition: i32);

    fn stream_error(&self, topic: &str, partition: i32);

    fn caught_up(&self, _topic: &str, _partition: i32) {}
}

/// Forwards to whichever `metrics` recorder the process installed.
#[derive(Debug, Default, Clone, Copy)]
pub struct RecorderMetrics;

fn labels(topic: &str, partition: i32) -> [(&'static str, String); 2] {
    [("topic", topic.to_string()), ("partition", partition.to_string())]
}

impl ConsumerMetrics for RecorderMetrics {
    fn message_processed(&self, topic: &str, partition: i32) {
        metrics::counter!("kafka_consumer_messages_total", &labels(topic, partition)).increment(1);
    }

    fn message_error(&self, topic: &str, partition: i32) {
        metrics::counter!("kafka_consumer_message_errors_total", &labels(topic, partition))
            .increment(1);
    }

    fn stream_error(&self, topic: &str, partition: i32) {
        metrics::counter!("kafka_consumer_stream_errors_total", &labels(topic, partition))
            .increment(1);
    }

    fn caught_up(&self, topic: &str, partition: i32) {
        metrics::counter!("kafka_consumer_caught_up_total", &labels(topic, partition)).increment(1);
    }
}
