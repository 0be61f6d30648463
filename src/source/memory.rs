use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use dashmap::DashMap;
use log::debug;
use tokio::sync::watch;

use super::{Message, PartitionStream, Source, SourceError};

/// In-process partitioned log. Streams tail their partition until the topic
/// is sealed, so it behaves like a live broker for consumers.
#[derive(Default)]
pub struct MemorySource {
    topics: DashMap<String, Vec<Arc<Partition>>>,
    opened: AtomicUsize,
    active: Arc<AtomicUsize>,
}

struct Partition {
    log: Mutex<PartitionLog>,
    changed: watch::Sender<u64>,
}

#[derive(Default)]
struct PartitionLog {
    base_offset: i64,
    records: Vec<Message>,
    errors: Vec<String>,
    sealed: bool,
    unavailable: bool,
}

impl PartitionLog {
    fn next_offset(&self) -> i64 {
        self.base_offset + self.records.len() as i64
    }
}

impl Partition {
    fn new() -> Self {
        let (changed, _) = watch::channel(0);
        Self {
            log: Mutex::new(PartitionLog::default()),
            changed,
        }
    }

    fn lock(&self) -> MutexGuard<'_, PartitionLog> {
        self.log.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn update<T>(&self, f: impl FnOnce(&mut PartitionLog) -> T) -> T {
        let result = f(&mut self.lock());
        self.changed.send_modify(|version| *version += 1);
        result
    }
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates (or replaces) `topic` with `partitions` empty partitions
    /// numbered from zero.
    pub fn create_topic(&self, topic: &str, partitions: usize) {
        let logs = (0..partitions).map(|_| Arc::new(Partition::new())).collect();
        self.topics.insert(topic.to_string(), logs);
    }

    /// Appends a message and returns the offset it was written at.
    pub fn produce(
        &self,
        topic: &str,
        partition: i32,
        key: Option<Bytes>,
        value: Option<Bytes>,
    ) -> Result<i64, SourceError> {
        let log = self.partition(topic, partition)?;
        Ok(log.update(|log| {
            let offset = log.next_offset();
            log.records.push(Message {
                topic: topic.to_string(),
                partition,
                offset,
                key,
                value,
                timestamp: Utc::now(),
            });
            offset
        }))
    }

    /// Drops every message below `before`, as retention would.
    pub fn truncate(&self, topic: &str, partition: i32, before: i64) -> Result<(), SourceError> {
        let log = self.partition(topic, partition)?;
        log.update(|log| {
            let before = before.clamp(log.base_offset, log.next_offset());
            let dropped = (before - log.base_offset) as usize;
            log.records.drain(..dropped);
            log.base_offset = before;
        });
        Ok(())
    }

    /// Streams already open on the partition yield one transport error.
    pub fn inject_error(&self, topic: &str, partition: i32, reason: &str) -> Result<(), SourceError> {
        let log = self.partition(topic, partition)?;
        log.update(|log| log.errors.push(reason.to_string()));
        Ok(())
    }

    /// Makes opening a stream on the partition fail.
    pub fn set_unavailable(&self, topic: &str, partition: i32) -> Result<(), SourceError> {
        let log = self.partition(topic, partition)?;
        log.update(|log| log.unavailable = true);
        Ok(())
    }

    /// Ends every stream of `topic` once it has delivered all messages.
    pub fn seal(&self, topic: &str) -> Result<(), SourceError> {
        let logs = self.topic(topic)?;
        for log in logs {
            log.update(|log| log.sealed = true);
        }
        Ok(())
    }

    /// Number of streams successfully opened so far.
    pub fn opened_streams(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    /// Number of streams that have not been dropped yet.
    pub fn active_streams(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    fn topic(&self, topic: &str) -> Result<Vec<Arc<Partition>>, SourceError> {
        self.topics
            .get(topic)
            .map(|logs| logs.clone())
            .ok_or_else(|| SourceError::UnknownTopic(topic.to_string()))
    }

    fn partition(&self, topic: &str, partition: i32) -> Result<Arc<Partition>, SourceError> {
        let logs = self.topic(topic)?;
        usize::try_from(partition)
            .ok()
            .and_then(|index| logs.get(index).cloned())
            .ok_or_else(|| SourceError::UnknownPartition {
                topic: topic.to_string(),
                partition,
            })
    }
}

#[async_trait]
impl Source for MemorySource {
    async fn partitions(&self, topic: &str) -> Result<Vec<i32>, SourceError> {
        let logs = self.topic(topic)?;
        Ok((0..logs.len() as i32).collect())
    }

    async fn oldest_offset(&self, topic: &str, partition: i32) -> Result<i64, SourceError> {
        Ok(self.partition(topic, partition)?.lock().base_offset)
    }

    async fn latest_offset(&self, topic: &str, partition: i32) -> Result<i64, SourceError> {
        Ok(self.partition(topic, partition)?.lock().next_offset())
    }

    async fn open_partition(
        &self,
        topic: &str,
        partition: i32,
        from: i64,
    ) -> Result<PartitionStream, SourceError> {
        let log = self.partition(topic, partition)?;
        let errors_seen = {
            let guard = log.lock();
            if guard.unavailable {
                return Err(SourceError::Unavailable {
                    topic: topic.to_string(),
                    partition,
                });
            }
            guard.errors.len()
        };

        self.opened.fetch_add(1, Ordering::SeqCst);
        debug!("Opened memory stream for {}/{} at offset {}", topic, partition, from);

        let cursor = Cursor {
            changed: log.changed.subscribe(),
            log,
            next_offset: from,
            errors_seen,
            _live: LiveStream::new(self.active.clone()),
        };
        Ok(Box::pin(futures::stream::unfold(cursor, |mut cursor| async move {
            loop {
                cursor.changed.borrow_and_update();
                match cursor.advance() {
                    Step::Yield(item) => return Some((item, cursor)),
                    Step::End => return None,
                    Step::Wait => {
                        if cursor.changed.changed().await.is_err() {
                            return None;
                        }
                    }
                }
            }
        })))
    }
}

struct Cursor {
    log: Arc<Partition>,
    changed: watch::Receiver<u64>,
    next_offset: i64,
    errors_seen: usize,
    _live: LiveStream,
}

enum Step {
    Yield(Result<Message, SourceError>),
    Wait,
    End,
}

impl Cursor {
    fn advance(&mut self) -> Step {
        let log = self.log.lock();
        if let Some(reason) = log.errors.get(self.errors_seen) {
            self.errors_seen += 1;
            return Step::Yield(Err(SourceError::Transport(reason.clone())));
        }

        self.next_offset = self.next_offset.max(log.base_offset);
        if self.next_offset < log.next_offset() {
            let index = (self.next_offset - log.base_offset) as usize;
            self.next_offset += 1;
            return Step::Yield(Ok(log.records[index].clone()));
        }

        if log.sealed { Step::End } else { Step::Wait }
    }
}

/// Tracks how many streams are alive so callers can observe release.
struct LiveStream(Arc<AtomicUsize>);

impl LiveStream {
    fn new(active: Arc<AtomicUsize>) -> Self {
        active.fetch_add(1, Ordering::SeqCst);
        Self(active)
    }
}

impl Drop for LiveStream {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}
