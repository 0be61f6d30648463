use std::sync::Arc;

use log::error;
use tokio::sync::watch;

/// Counts down once per partition reader. `wait` resolves when every reader
/// has released, whether it caught up, found nothing to read, or was cancelled.
///
/// Releasing at most once per reader is the reader's job; the barrier only
/// refuses to go below zero.
#[derive(Clone)]
pub struct CatchUpBarrier {
    remaining: Arc<watch::Sender<usize>>,
}

impl CatchUpBarrier {
    pub fn new(count: usize) -> Self {
        let (remaining, _) = watch::channel(count);
        Self {
            remaining: Arc::new(remaining),
        }
    }

    pub fn release(&self) {
        self.remaining.send_modify(|remaining| match remaining.checked_sub(1) {
            Some(left) => *remaining = left,
            None => error!("Catch-up barrier released more times than it has readers"),
        });
    }

    pub async fn wait(&self) {
        let mut rx = self.remaining.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = rx.wait_for(|remaining| *remaining == 0).await;
    }

    pub fn remaining(&self) -> usize {
        *self.remaining.borrow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn wait_resolves_after_last_release() {
        let barrier = CatchUpBarrier::new(3);
        let waiter = {
            let barrier = barrier.clone();
            tokio::spawn(async move { barrier.wait().await })
        };

        barrier.release();
        barrier.release();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        assert_eq!(barrier.remaining(), 1);

        barrier.release();
        timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
        assert_eq!(barrier.remaining(), 0);
    }

    #[tokio::test]
    async fn released_barrier_does_not_block_late_waiters() {
        let barrier = CatchUpBarrier::new(1);
        barrier.release();
        timeout(Duration::from_secs(1), barrier.wait()).await.unwrap();
        timeout(Duration::from_secs(1), barrier.wait()).await.unwrap();
    }

    #[tokio::test]
    async fn extra_release_does_not_underflow() {
        let barrier = CatchUpBarrier::new(1);
        barrier.release();
        barrier.release();
        assert_eq!(barrier.remaining(), 0);
    }
}
