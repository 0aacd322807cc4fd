//! Scripted chain source and block constructors for tests and demos.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::ReaderError;
use crate::source::ChainSource;
use crate::types::{Action, Block, BlockInfo};

/// Build a block with the given linkage and actions.
pub fn make_block(number: u64, hash: &str, previous: &str, actions: Vec<Action>) -> Block {
    Block {
        block_info: BlockInfo {
            block_number: number,
            block_hash: hash.into(),
            previous_block_hash: previous.into(),
        },
        actions,
    }
}

/// Build an action with the given type tag and payload.
pub fn make_action(action_type: &str, payload: serde_json::Value) -> Action {
    Action {
        action_type: action_type.to_string(),
        payload,
    }
}

/// Build an empty-action chain from `(number, hash, previous)` triples.
pub fn chain(links: &[(u64, &str, &str)]) -> Vec<Block> {
    links
        .iter()
        .map(|(number, hash, previous)| make_block(*number, hash, previous, vec![]))
        .collect()
}

struct Script {
    /// Canonical chain by height: the i-th entry is returned for block i+1.
    blocks: Vec<Block>,
    last_irreversible: u64,
    reset_on_history_exhausted: bool,
    fetch_counts: HashMap<u64, u32>,
}

/// A chain source driven by an in-memory script.
///
/// The script can be swapped wholesale with [`set_chain`] to simulate a
/// reorg; the head is always the script length. Fetches are counted per
/// block number for assertions.
///
/// [`set_chain`]: ScriptedChain::set_chain
pub struct ScriptedChain {
    script: Mutex<Script>,
}

impl ScriptedChain {
    pub fn new(blocks: Vec<Block>) -> Self {
        Self {
            script: Mutex::new(Script {
                blocks,
                last_irreversible: 0,
                reset_on_history_exhausted: false,
                fetch_counts: HashMap::new(),
            }),
        }
    }

    /// Replace the canonical chain (simulates a reorg or head growth).
    pub fn set_chain(&self, blocks: Vec<Block>) {
        self.script.lock().unwrap().blocks = blocks;
    }

    /// Append a block to the canonical chain.
    pub fn push_block(&self, block: Block) {
        self.script.lock().unwrap().blocks.push(block);
    }

    pub fn set_last_irreversible(&self, block_number: u64) {
        self.script.lock().unwrap().last_irreversible = block_number;
    }

    /// Make `history_exhausted` non-fatal: the reader restarts from its
    /// start block instead of failing.
    pub fn set_reset_on_history_exhausted(&self, reset: bool) {
        self.script.lock().unwrap().reset_on_history_exhausted = reset;
    }

    /// How many times `get_block` was called for `block_number`.
    pub fn fetch_count(&self, block_number: u64) -> u32 {
        self.script
            .lock()
            .unwrap()
            .fetch_counts
            .get(&block_number)
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl ChainSource for ScriptedChain {
    async fn get_head_block_number(&self) -> Result<u64, ReaderError> {
        Ok(self.script.lock().unwrap().blocks.len() as u64)
    }

    async fn get_last_irreversible_block_number(&self) -> Result<u64, ReaderError> {
        Ok(self.script.lock().unwrap().last_irreversible)
    }

    async fn get_block(&self, block_number: u64) -> Result<Block, ReaderError> {
        let mut script = self.script.lock().unwrap();
        *script.fetch_counts.entry(block_number).or_insert(0) += 1;
        let index = match block_number.checked_sub(1) {
            Some(index) => index as usize,
            None => return Err(ReaderError::Source("block 0 requested".to_string())),
        };
        script
            .blocks
            .get(index)
            .cloned()
            .ok_or_else(|| ReaderError::Source(format!("no block {block_number} in script")))
    }

    async fn history_exhausted(&self) -> Result<(), ReaderError> {
        if self.script.lock().unwrap().reset_on_history_exhausted {
            Ok(())
        } else {
            Err(ReaderError::HistoryExhausted)
        }
    }
}
