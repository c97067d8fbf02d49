//! Block height source driving state timing

use crate::{Error, Result};
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Source of the current block height
#[async_trait]
pub trait BlockCounter: Send + Sync {
    async fn current_block(&self) -> Result<u64>;

    /// Resolve once the chain reaches `height`
    async fn wait_for_block_height(&self, height: u64) -> Result<()>;
}

/// Block counter ticking at a fixed interval, starting at height 0
pub struct LocalBlockCounter {
    height: watch::Receiver<u64>,
    ticker: JoinHandle<()>,
}

impl LocalBlockCounter {
    /// Start ticking. Must be called from within a tokio runtime.
    pub fn start(block_time: Duration) -> Self {
        let (sender, height) = watch::channel(0u64);
        let ticker = tokio::spawn(async move {
            let mut interval = tokio::time::interval(block_time);
            interval.tick().await;
            loop {
                interval.tick().await;
                sender.send_modify(|height| *height += 1);
            }
        });

        Self { height, ticker }
    }
}

impl Drop for LocalBlockCounter {
    fn drop(&mut self) {
        self.ticker.abort();
    }
}

#[async_trait]
impl BlockCounter for LocalBlockCounter {
    async fn current_block(&self) -> Result<u64> {
        Ok(*self.height.borrow())
    }

    async fn wait_for_block_height(&self, height: u64) -> Result<()> {
        let mut receiver = self.height.clone();
        receiver
            .wait_for(|current| *current >= height)
            .await
            .map(|_| ())
            .map_err(|_| Error::BlockCounter("block counter stopped".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_local_block_counter_advances() {
        let counter = LocalBlockCounter::start(Duration::from_millis(5));
        let start = counter.current_block().await.unwrap();

        counter.wait_for_block_height(start + 3).await.unwrap();
        assert!(counter.current_block().await.unwrap() >= start + 3);

        // Past heights resolve immediately
        counter.wait_for_block_height(0).await.unwrap();
    }
}
