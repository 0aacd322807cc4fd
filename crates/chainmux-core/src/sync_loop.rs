//! The driver loop pairing a reader with a handler.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::binder::PersistenceBinder;
use crate::error::SyncError;
use crate::handler::BlockHandler;
use crate::reader::BlockReader;
use crate::source::ChainSource;

/// Driver configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// How long to sleep between polling rounds once caught up to the head.
    pub poll_interval_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 2000,
        }
    }
}

/// Owns one `(BlockReader, BlockHandler)` pair and advances them
/// sequentially: read a block, hand it to the handler, seek when asked.
pub struct SyncLoop<S: ChainSource, B: PersistenceBinder> {
    reader: BlockReader<S>,
    handler: BlockHandler<B>,
    config: SyncConfig,
}

impl<S: ChainSource, B: PersistenceBinder> SyncLoop<S, B> {
    pub fn new(reader: BlockReader<S>, handler: BlockHandler<B>, config: SyncConfig) -> Self {
        Self {
            reader,
            handler,
            config,
        }
    }

    pub fn reader(&self) -> &BlockReader<S> {
        &self.reader
    }

    pub fn handler(&self) -> &BlockHandler<B> {
        &self.handler
    }

    pub fn handler_mut(&mut self) -> &mut BlockHandler<B> {
        &mut self.handler
    }

    /// Process blocks until the reader reaches the chain head.
    ///
    /// Returns as soon as the reader has nothing new to deliver; call again
    /// (or use [`watch`]) to keep following the chain.
    ///
    /// [`watch`]: SyncLoop::watch
    pub async fn catch_up(&mut self, is_replay: bool) -> Result<(), SyncError> {
        let mut head_block_number = 0u64;
        while head_block_number == 0
            || self.reader.current_block_number() < head_block_number as i64
        {
            let next = self.reader.next_block().await?;
            if !next.is_new {
                break;
            }
            if let Some(seek_to) = self.handler.handle_block(&next, is_replay).await? {
                tracing::info!(seek_to, "Handler requested seek");
                self.reader.seek_to(seek_to).await?;
            }
            head_block_number = self.reader.head_block_number();
        }
        Ok(())
    }

    /// Follow the chain indefinitely, sleeping between polling rounds.
    pub async fn watch(&mut self) -> Result<(), SyncError> {
        self.run(false).await
    }

    /// One replay pass over already-processed blocks (updaters only, no
    /// effects), then follow the chain live.
    pub async fn replay(&mut self) -> Result<(), SyncError> {
        self.run(true).await
    }

    async fn run(&mut self, mut is_replay: bool) -> Result<(), SyncError> {
        let poll_interval = Duration::from_millis(self.config.poll_interval_ms);
        loop {
            self.catch_up(is_replay).await?;
            is_replay = false;
            tokio::time::sleep(poll_interval).await;
        }
    }
}
