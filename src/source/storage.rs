use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use clickhouse::{Client, Row};
use log::{debug, error, info};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use super::{Message, PartitionStream, Source, SourceError};

const MESSAGES_TABLE: &str = "kafka.kafka_messages";
const STREAM_BUFFER: usize = 1_000;

#[derive(Debug, Row, Serialize, Deserialize)]
struct MessageRow {
    offset: i64,
    key: String,
    value: String,
    #[serde(with = "clickhouse::serde::chrono::datetime64::millis")]
    ts: DateTime<Utc>,
}

#[derive(Debug, Row, Serialize, Deserialize)]
struct OffsetBounds {
    messages: u64,
    oldest: i64,
    latest: i64,
}

struct ClickHouseClients {
    clients: Vec<Client>,
    next_idx: AtomicUsize,
}

impl ClickHouseClients {
    fn new(urls: &str) -> Self {
        let clients = urls
            .split(',')
            .map(str::trim)
            .filter(|url| !url.is_empty())
            .map(|url| Client::default().with_url(url))
            .collect();
        Self {
            clients,
            next_idx: AtomicUsize::new(0),
        }
    }

    fn get(&self) -> Result<&Client, SourceError> {
        if self.clients.is_empty() {
            return Err(SourceError::Transport("no ClickHouse urls configured".to_string()));
        }
        let idx = self.next_idx.fetch_add(1, Ordering::Relaxed) % self.clients.len();
        Ok(&self.clients[idx])
    }
}

/// Reads the message table a ClickHouse-backed broker writes into. Offsets
/// there are sparse, so `latest_offset` is the highest stored offset plus one.
pub struct ClickHouseSource {
    clients: Arc<ClickHouseClients>,
    poll_interval: Duration,
    batch_size: u64,
}

impl ClickHouseSource {
    pub fn new(clickhouse_url: &str, poll_interval: Duration, batch_size: u64) -> Self {
        Self {
            clients: Arc::new(ClickHouseClients::new(clickhouse_url)),
            poll_interval,
            batch_size,
        }
    }

    async fn bounds(&self, topic: &str, partition: i32) -> Result<OffsetBounds, SourceError> {
        let query = format!(
            "SELECT count() AS messages, min(offset) AS oldest, max(offset) AS latest \
             FROM {MESSAGES_TABLE} WHERE topic = ? AND partition = ?"
        );
        let bounds = self
            .clients
            .get()?
            .query(&query)
            .bind(topic)
            .bind(partition)
            .fetch_one::<OffsetBounds>()
            .await?;
        Ok(bounds)
    }
}

#[async_trait]
impl Source for ClickHouseSource {
    async fn partitions(&self, topic: &str) -> Result<Vec<i32>, SourceError> {
        let query = format!(
            "SELECT DISTINCT partition FROM {MESSAGES_TABLE} WHERE topic = ? ORDER BY partition"
        );
        let partitions: Vec<i32> = self
            .clients
            .get()?
            .query(&query)
            .bind(topic)
            .fetch_all()
            .await?;

        if partitions.is_empty() {
            return Err(SourceError::UnknownTopic(topic.to_string()));
        }
        info!("Discovered {} partitions for topic {}", partitions.len(), topic);
        Ok(partitions)
    }

    async fn oldest_offset(&self, topic: &str, partition: i32) -> Result<i64, SourceError> {
        let bounds = self.bounds(topic, partition).await?;
        Ok(if bounds.messages == 0 { 0 } else { bounds.oldest })
    }

    async fn latest_offset(&self, topic: &str, partition: i32) -> Result<i64, SourceError> {
        let bounds = self.bounds(topic, partition).await?;
        Ok(if bounds.messages == 0 { 0 } else { bounds.latest + 1 })
    }

    async fn open_partition(
        &self,
        topic: &str,
        partition: i32,
        from: i64,
    ) -> Result<PartitionStream, SourceError> {
        // Fail here rather than inside the poller when nothing is reachable.
        self.clients.get()?.query("SELECT 1").execute().await?;

        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        let poller = Poller {
            clients: self.clients.clone(),
            topic: topic.to_string(),
            partition,
            next_offset: from,
            poll_interval: self.poll_interval,
            batch_size: self.batch_size,
        };
        tokio::spawn(poller.run(tx));

        debug!("Opened ClickHouse stream for {}/{} at offset {}", topic, partition, from);
        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}

struct Poller {
    clients: Arc<ClickHouseClients>,
    topic: String,
    partition: i32,
    next_offset: i64,
    poll_interval: Duration,
    batch_size: u64,
}

impl Poller {
    /// Polls until the receiving stream is dropped.
    async fn run(mut self, tx: mpsc::Sender<Result<Message, SourceError>>) {
        let mut interval = tokio::time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = tx.closed() => break,
                _ = interval.tick() => {}
            }

            let rows = match self.fetch().await {
                Ok(rows) => rows,
                Err(e) => {
                    error!("Failed to poll {}/{}: {}", self.topic, self.partition, e);
                    if tx.send(Err(e)).await.is_err() {
                        break;
                    }
                    continue;
                }
            };

            let full_batch = rows.len() as u64 == self.batch_size;
            for row in rows {
                self.next_offset = row.offset + 1;
                let message = Message {
                    topic: self.topic.clone(),
                    partition: self.partition,
                    offset: row.offset,
                    key: (!row.key.is_empty()).then(|| Bytes::from(row.key)),
                    value: Some(Bytes::from(row.value)),
                    timestamp: row.ts,
                };
                if tx.send(Ok(message)).await.is_err() {
                    debug!("Stream for {}/{} dropped", self.topic, self.partition);
                    return;
                }
            }

            if full_batch {
                interval.reset_immediately();
            }
        }
        debug!("Stream for {}/{} dropped", self.topic, self.partition);
    }

    async fn fetch(&self) -> Result<Vec<MessageRow>, SourceError> {
        let query = format!(
            "SELECT offset, key, value, ts FROM {MESSAGES_TABLE} \
             WHERE topic = ? AND partition = ? AND offset >= ? \
             ORDER BY offset ASC LIMIT ?"
        );
        let rows = self
            .clients
            .get()?
            .query(&query)
            .bind(&self.topic)
            .bind(self.partition)
            .bind(self.next_offset)
            .bind(self.batch_size)
            .fetch_all::<MessageRow>()
            .await?;
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use clickhouse::test::{Mock, handlers, status};
    use futures::StreamExt;
    use tokio::time::timeout;

    use super::*;

    const WAIT: Duration = Duration::from_secs(2);
    const SLOW_POLL: Duration = Duration::from_secs(60);

    fn mock_source(mock: &Mock, batch_size: u64) -> ClickHouseSource {
        ClickHouseSource::new(mock.url(), SLOW_POLL, batch_size)
    }

    fn row(offset: i64, key: &str, value: &str) -> MessageRow {
        MessageRow {
            offset,
            key: key.to_string(),
            value: value.to_string(),
            ts: DateTime::from_timestamp_millis(1_700_000_000_000 + offset).unwrap(),
        }
    }

    async fn next_message(stream: &mut PartitionStream) -> Message {
        timeout(WAIT, stream.next())
            .await
            .expect("no message in time")
            .expect("stream ended")
            .expect("stream error")
    }

    #[tokio::test]
    async fn empty_partition_has_zero_bounds() {
        let mock = Mock::new();
        let source = mock_source(&mock, 100);
        for _ in 0..2 {
            mock.add(handlers::provide(vec![OffsetBounds {
                messages: 0,
                oldest: 0,
                latest: 0,
            }]));
        }

        assert_eq!(source.oldest_offset("events", 0).await.unwrap(), 0);
        assert_eq!(source.latest_offset("events", 0).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn latest_offset_is_one_past_the_highest_stored() {
        let mock = Mock::new();
        let source = mock_source(&mock, 100);
        for _ in 0..2 {
            mock.add(handlers::provide(vec![OffsetBounds {
                messages: 3,
                oldest: 100,
                latest: 250,
            }]));
        }

        assert_eq!(source.oldest_offset("events", 2).await.unwrap(), 100);
        assert_eq!(source.latest_offset("events", 2).await.unwrap(), 251);
    }

    #[tokio::test]
    async fn partitions_are_listed_in_order() {
        let mock = Mock::new();
        let source = mock_source(&mock, 100);
        mock.add(handlers::provide(vec![0i32, 1, 2]));

        assert_eq!(source.partitions("events").await.unwrap(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn topic_without_rows_is_unknown() {
        let mock = Mock::new();
        let source = mock_source(&mock, 100);
        mock.add(handlers::provide(Vec::<i32>::new()));

        assert!(matches!(
            source.partitions("missing").await,
            Err(SourceError::UnknownTopic(topic)) if topic == "missing"
        ));
    }

    #[tokio::test]
    async fn stream_delivers_a_batch_in_offset_order() {
        let mock = Mock::new();
        let source = mock_source(&mock, 10);
        let ping = mock.add(handlers::record_ddl());
        mock.add(handlers::provide(vec![
            row(5, "", "first"),
            row(9, "user-1", "second"),
        ]));

        let mut stream = source.open_partition("events", 3, 5).await.unwrap();
        assert!(ping.query().await.contains("SELECT 1"));

        let first = next_message(&mut stream).await;
        assert_eq!(first.topic, "events");
        assert_eq!(first.partition, 3);
        assert_eq!(first.offset, 5);
        assert_eq!(first.key, None);
        assert_eq!(first.value, Some(Bytes::from_static(b"first")));
        assert_eq!(
            first.timestamp,
            DateTime::from_timestamp_millis(1_700_000_000_005).unwrap()
        );

        let second = next_message(&mut stream).await;
        assert_eq!(second.offset, 9);
        assert_eq!(second.key, Some(Bytes::from_static(b"user-1")));
        assert_eq!(second.value, Some(Bytes::from_static(b"second")));
    }

    #[tokio::test]
    async fn full_batch_polls_again_without_waiting() {
        let mock = Mock::new();
        let source = mock_source(&mock, 2);
        mock.add(handlers::record_ddl());
        mock.add(handlers::provide(vec![row(0, "", "a"), row(1, "", "b")]));
        mock.add(handlers::provide(vec![row(2, "", "c")]));

        let mut stream = source.open_partition("events", 0, 0).await.unwrap();
        let mut offsets = Vec::new();
        for _ in 0..3 {
            offsets.push(next_message(&mut stream).await.offset);
        }
        assert_eq!(offsets, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn failed_poll_is_yielded_as_an_error() {
        let mock = Mock::new();
        let source = mock_source(&mock, 10);
        mock.add(handlers::record_ddl());
        mock.add(handlers::failure(status::SERVICE_UNAVAILABLE));

        let mut stream = source.open_partition("events", 0, 0).await.unwrap();
        let item = timeout(WAIT, stream.next()).await.unwrap().unwrap();
        assert!(matches!(item, Err(SourceError::ClickHouse(_))));
    }

    #[tokio::test]
    async fn unreachable_server_fails_open() {
        let mock = Mock::new();
        let source = mock_source(&mock, 10);
        mock.add(handlers::failure(status::SERVICE_UNAVAILABLE));

        assert!(matches!(
            source.open_partition("events", 0, 0).await,
            Err(SourceError::ClickHouse(_))
        ));
    }

    #[test]
    fn urls_are_split_and_trimmed() {
        let clients = ClickHouseClients::new("http://a:8123, http://b:8123,");
        assert_eq!(clients.clients.len(), 2);
        assert!(clients.get().is_ok());
    }

    #[test]
    fn no_urls_is_a_transport_error() {
        let clients = ClickHouseClients::new(" ");
        assert!(matches!(clients.get(), Err(SourceError::Transport(_))));
    }
}
