//! The chain-source seam consumed by the reader.

use async_trait::async_trait;

use crate::error::ReaderError;
use crate::types::Block;

/// Trait for fetching chain data from a node or archive.
///
/// Implementations are free to batch, cache, and retry internally; the reader
/// only requires that a returned block actually carries the requested number.
#[async_trait]
pub trait ChainSource: Send + Sync {
    /// Number of the newest block the source knows about.
    async fn get_head_block_number(&self) -> Result<u64, ReaderError>;

    /// Number of the newest block the source guarantees cannot be
    /// reorganized. Sources without a finality concept may return the head
    /// number.
    async fn get_last_irreversible_block_number(&self) -> Result<u64, ReaderError>;

    /// Fetch a block by number.
    async fn get_block(&self, block_number: u64) -> Result<Block, ReaderError>;

    /// Called when a fork walk-back runs out of cached history.
    ///
    /// The default is fatal. Overriding this to return `Ok(())` makes the
    /// reader restart from its configured start block instead. Sources read
    /// with `only_irreversible` never reach this path, because irreversible
    /// blocks cannot fork.
    async fn history_exhausted(&self) -> Result<(), ReaderError> {
        Err(ReaderError::HistoryExhausted)
    }
}

#[async_trait]
impl<S: ChainSource> ChainSource for std::sync::Arc<S> {
    async fn get_head_block_number(&self) -> Result<u64, ReaderError> {
        (**self).get_head_block_number().await
    }

    async fn get_last_irreversible_block_number(&self) -> Result<u64, ReaderError> {
        (**self).get_last_irreversible_block_number().await
    }

    async fn get_block(&self, block_number: u64) -> Result<Block, ReaderError> {
        (**self).get_block(block_number).await
    }

    async fn history_exhausted(&self) -> Result<(), ReaderError> {
        (**self).history_exhausted().await
    }
}
