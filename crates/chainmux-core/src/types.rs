//! Shared types for the ingestion pipeline.

use serde::{Deserialize, Serialize};

// ─── BlockHash ────────────────────────────────────────────────────────────────

/// A block hash (`0x…` or any chain-native encoding).
///
/// Nominal newtype so hashes cannot be mixed up with the other string-valued
/// fields that travel alongside them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BlockHash(String);

impl BlockHash {
    pub fn new(hash: impl Into<String>) -> Self {
        Self(hash.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// An empty hash is the sentinel for "no block yet processed".
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Display for BlockHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for BlockHash {
    fn from(hash: &str) -> Self {
        Self(hash.to_string())
    }
}

impl From<String> for BlockHash {
    fn from(hash: String) -> Self {
        Self(hash)
    }
}

// ─── Block ────────────────────────────────────────────────────────────────────

/// Position and linkage of a block within the chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockInfo {
    /// Block number (1-based; 0 means "no block yet processed").
    pub block_number: u64,
    /// Hash of this block.
    pub block_hash: BlockHash,
    /// Hash of the parent block.
    pub previous_block_hash: BlockHash,
}

impl BlockInfo {
    /// Returns `true` if `parent` is the direct parent of `self`.
    pub fn extends(&self, parent: &BlockInfo) -> bool {
        self.block_number == parent.block_number + 1
            && self.previous_block_hash == parent.block_hash
    }
}

/// A single action carried by a block, targeted at matching updaters and
/// effects by its type tag. The payload is opaque to the core; updaters
/// decode it themselves.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    pub action_type: String,
    pub payload: serde_json::Value,
}

/// A hash-linked unit of chain data carrying an ordered list of actions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub block_info: BlockInfo,
    pub actions: Vec<Action>,
}

impl Block {
    pub fn block_number(&self) -> u64 {
        self.block_info.block_number
    }

    pub fn block_hash(&self) -> &BlockHash {
        &self.block_info.block_hash
    }

    pub fn previous_block_hash(&self) -> &BlockHash {
        &self.block_info.previous_block_hash
    }
}

// ─── IndexState ───────────────────────────────────────────────────────────────

/// The durably persisted cursor: the last fully-applied block and the handler
/// version that was active at that point.
///
/// A default (all-zero) value means nothing has been applied yet. An empty
/// `handler_version_name` from a fresh store means "no opinion"; the handler
/// keeps its configured start version.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexState {
    pub block_number: u64,
    pub block_hash: BlockHash,
    pub handler_version_name: String,
}

// ─── NextBlock ────────────────────────────────────────────────────────────────

/// What the reader hands the driver on each `next_block` call: the block now
/// considered current plus the flags the handler needs to sequence it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NextBlock {
    pub block: Block,
    /// The reader resolved a fork to produce this block; state at and above
    /// this block number must be rolled back before applying it.
    pub is_rollback: bool,
    /// `false` when the reader is re-delivering its current block because the
    /// head has not moved.
    pub is_new: bool,
    /// This is the reader's configured start block.
    pub is_first_block: bool,
    /// Newest block the source guarantees cannot be reorganized.
    pub last_irreversible_block_number: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(number: u64, hash: &str, parent: &str) -> BlockInfo {
        BlockInfo {
            block_number: number,
            block_hash: hash.into(),
            previous_block_hash: parent.into(),
        }
    }

    #[test]
    fn block_extends_parent() {
        let parent = info(100, "0xaaa", "0x000");
        let child = info(101, "0xbbb", "0xaaa");
        assert!(child.extends(&parent));
        assert!(!parent.extends(&child));
    }

    #[test]
    fn block_extends_false_on_gap() {
        let a = info(100, "0xaaa", "0x000");
        let b = info(102, "0xccc", "0xaaa");
        assert!(!b.extends(&a));
    }

    #[test]
    fn default_index_state_is_sentinel() {
        let index = IndexState::default();
        assert_eq!(index.block_number, 0);
        assert!(index.block_hash.is_empty());
        assert!(index.handler_version_name.is_empty());
    }
}
