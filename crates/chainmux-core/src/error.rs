//! Error types for the ingestion pipeline.

use thiserror::Error;

use crate::types::BlockHash;

/// Errors raised by the reader.
#[derive(Debug, Error)]
pub enum ReaderError {
    /// A chain source call failed. Reader state is unchanged; the caller may
    /// retry the operation.
    #[error("Chain source error: {0}")]
    Source(String),

    #[error("Upstream inconsistent: asked for block {expected}, source returned block {actual}")]
    UpstreamInconsistent { expected: u64, actual: u64 },

    #[error("Fork walk-back exhausted the cached block history without finding a common ancestor")]
    HistoryExhausted,

    #[error("Cannot seek to block {target}: reader starts at block {start_at_block}")]
    SeekBeforeStart { target: u64, start_at_block: i64 },

    #[error("Reader invariant violated: {0}")]
    Invariant(&'static str),
}

impl ReaderError {
    /// Returns `true` if retrying the same call may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Source(_))
    }
}

/// Errors raised by the handler or at registry construction.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("No handler versions registered")]
    NoHandlerVersions,

    #[error("Duplicate handler version '{0}'")]
    DuplicateVersion(String),

    #[error("Handler version '{0}' is not registered")]
    UnknownVersion(String),

    #[error(
        "Block {block_number} has previous hash {actual}, \
         expected {expected} from the last processed block"
    )]
    ChainMismatch {
        block_number: u64,
        expected: BlockHash,
        actual: BlockHash,
    },

    #[error("Persistence error: {0}")]
    Persistence(String),
}

/// Top-level error for the driver loop.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Reader(#[from] ReaderError),

    #[error(transparent)]
    Handler(#[from] HandlerError),
}
