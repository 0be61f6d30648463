use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use envconfig::Envconfig;
use kafka_catchup::config::{Config, StartFrom};
use kafka_catchup::{ClickHouseSource, Message, MessageHandler, TopicConsumer};
use log::{error, info};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

/// Writes each message to stdout as one JSON line.
struct PrintHandler;

#[derive(Serialize)]
struct PrintedMessage<'a> {
    topic: &'a str,
    partition: i32,
    offset: i64,
    key: Option<String>,
    value: Option<String>,
    timestamp: DateTime<Utc>,
}

#[async_trait]
impl MessageHandler for PrintHandler {
    async fn handle(&self, _cancel: &CancellationToken, message: &Message) -> anyhow::Result<()> {
        let printed = PrintedMessage {
            topic: &message.topic,
            partition: message.partition,
            offset: message.offset,
            key: message.key.as_deref().map(|k| String::from_utf8_lossy(k).to_string()),
            value: message.value.as_deref().map(|v| String::from_utf8_lossy(v).to_string()),
            timestamp: message.timestamp,
        };
        println!("{}", serde_json::to_string(&printed)?);
        Ok(())
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let config = Config::init_from_env().context("failed to load configuration")?;
    info!("Consuming topic {} from {:?}", config.topic, config.start_from);

    let source = ClickHouseSource::new(
        &config.clickhouse_url,
        config.poll_interval.0,
        config.fetch_batch_size,
    );
    let consumer = TopicConsumer::new(Arc::new(source), Arc::new(PrintHandler));

    let consumption = match config.start_from {
        StartFrom::Oldest => {
            consumer
                .consume_from_beginning(&config.topic, config.exit_after_caught_up)
                .await?
        }
        StartFrom::Latest => consumer.consume_from_latest(&config.topic).await?,
    };

    let interrupted = tokio::select! {
        _ = consumption.caught_up() => {
            info!("Caught up on all {} partitions", consumption.partitions().len());
            false
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted before catching up");
            true
        }
    };

    if !interrupted && !config.exit_after_caught_up {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
        }
        info!("Shutting down");
    }
    consumer.close();

    let offsets = consumption.final_offsets().await?;
    println!("{}", serde_json::to_string(&offsets)?);
    Ok(())
}
