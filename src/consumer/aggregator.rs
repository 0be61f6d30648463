use std::collections::HashSet;

use log::{debug, info, warn};
use ractor::{Actor, ActorProcessingErr, ActorRef};
use tokio::sync::oneshot;

use super::PartitionOffsets;

/// Collects the terminal offset of every partition reader of one run and
/// hands the assembled map to the caller once all of them have reported.
pub struct ResultAggregator;

pub enum Message {
    ReaderExited { partition: i32, offset: i64 },
}

pub struct Args {
    pub topic: String,
    pub partitions: Vec<i32>,
    pub reply: oneshot::Sender<PartitionOffsets>,
}

pub struct State {
    topic: String,
    expected: HashSet<i32>,
    offsets: PartitionOffsets,
    reply: Option<oneshot::Sender<PartitionOffsets>>,
}

impl State {
    fn record(&mut self, partition: i32, offset: i64) -> bool {
        if !self.expected.contains(&partition) {
            warn!("Ignoring final offset for unknown partition {}/{}", self.topic, partition);
            return false;
        }
        if self.offsets.contains_key(&partition) {
            warn!("Ignoring duplicate final offset for {}/{}", self.topic, partition);
            return false;
        }
        self.offsets.insert(partition, offset);
        self.offsets.len() == self.expected.len()
    }
}

impl Actor for ResultAggregator {
    type Msg = Message;
    type State = State;
    type Arguments = Args;

    async fn pre_start(
        &self,
        _myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        Ok(State {
            topic: args.topic,
            offsets: PartitionOffsets::with_capacity(args.partitions.len()),
            expected: args.partitions.into_iter().collect(),
            reply: Some(args.reply),
        })
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            Message::ReaderExited { partition, offset } => {
                debug!("Reader for {}/{} exited at offset {}", state.topic, partition, offset);
                if !state.record(partition, offset) {
                    return Ok(());
                }

                info!("All {} readers of {} exited", state.expected.len(), state.topic);
                if let Some(reply) = state.reply.take() {
                    if reply.send(std::mem::take(&mut state.offsets)).is_err() {
                        warn!("Final offsets for {} were not awaited", state.topic);
                    }
                }
                myself.stop(None);
            }
        }
        Ok(())
    }
}
