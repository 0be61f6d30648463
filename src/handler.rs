use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::source::Message;

/// Receives every message of a run, once, in partition order.
///
/// A returned error is logged and counted by the reader; the message still
/// counts as consumed and is not redelivered.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle(&self, cancel: &CancellationToken, message: &Message) -> anyhow::Result<()>;
}
