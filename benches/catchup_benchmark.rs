use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use kafka_catchup::{MemorySource, Message, MessageHandler, TopicConsumer};
use tokio::runtime::Builder;
use tokio_util::sync::CancellationToken;

struct DiscardHandler;

#[async_trait]
impl MessageHandler for DiscardHandler {
    async fn handle(&self, _cancel: &CancellationToken, message: &Message) -> anyhow::Result<()> {
        std::hint::black_box(message.offset);
        Ok(())
    }
}

fn filled_source(partitions: usize, per_partition: usize, message_size: usize) -> Arc<MemorySource> {
    let source = Arc::new(MemorySource::new());
    source.create_topic("bench", partitions);
    let payload = Bytes::from("a".repeat(message_size));
    for partition in 0..partitions as i32 {
        for _ in 0..per_partition {
            source
                .produce("bench", partition, None, Some(payload.clone()))
                .unwrap();
        }
    }
    source
}

fn benchmark_catch_up(c: &mut Criterion) {
    env_logger::builder().is_test(true).try_init().ok();

    let rt = Builder::new_multi_thread()
        .worker_threads(8)
        .enable_time()
        .build()
        .unwrap();

    let total_messages = 100_000;
    let message_size = 1000;
    let partition_counts = [1, 8, 32];

    let mut group = c.benchmark_group("catch_up");
    group.measurement_time(Duration::from_secs(10));
    group.sample_size(10);
    group.throughput(Throughput::Elements(total_messages as u64));

    for &partitions in partition_counts.iter() {
        let source = filled_source(partitions, total_messages / partitions, message_size);
        let consumer = TopicConsumer::new(source, Arc::new(DiscardHandler));

        group.bench_with_input(
            BenchmarkId::from_parameter(format!("{}_partitions", partitions)),
            &partitions,
            |b, _| {
                b.to_async(&rt).iter(|| async {
                    let consumption = consumer.consume_from_beginning("bench", true).await.unwrap();
                    consumption.final_offsets().await.unwrap()
                })
            },
        );
    }

    group.finish();
}

criterion_group! {
    name = benches;
    config = Criterion::default()
        .sample_size(10)
        .measurement_time(Duration::from_secs(10))
        .warm_up_time(Duration::from_secs(5))
        .noise_threshold(0.05)
        .significance_level(0.1)
        .without_plots();
    targets = benchmark_catch_up
}
criterion_main!(benches);
