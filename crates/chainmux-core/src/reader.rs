//! Forward cursor over an occasionally-forking chain.
//!
//! The reader hands out one block per [`BlockReader::next_block`] call,
//! validating hash linkage against the block it delivered last. A linkage
//! mismatch means the chain reorganized underneath us: the reader walks its
//! bounded in-memory history backwards, refetching each height until a
//! refetched block links onto a cached ancestor, then re-delivers from the
//! fork point with `is_rollback` set.

use std::collections::VecDeque;

use futures::future::try_join_all;
use serde::{Deserialize, Serialize};

use crate::error::ReaderError;
use crate::source::ChainSource;
use crate::types::{Block, NextBlock};

/// Reader configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReaderConfig {
    /// First block to deliver. Non-positive values tail the chain: the start
    /// becomes `head + start_at_block` on the first fetch.
    pub start_at_block: i64,
    /// Only deliver blocks the source reports as irreversible. Such blocks
    /// cannot fork, so the history walk-back never runs.
    pub only_irreversible: bool,
    /// Maximum number of delivered blocks kept for fork resolution. Forks
    /// deeper than this are unrecoverable (`HistoryExhausted`).
    pub max_history_length: usize,
    /// How many blocks to fetch concurrently when filling the prefetch
    /// queue. Bounds the fan-out against the chain source.
    pub prefetch_batch_size: u64,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            start_at_block: 1,
            only_irreversible: false,
            max_history_length: 600,
            prefetch_batch_size: 100,
        }
    }
}

/// Status snapshot for monitoring.
#[derive(Debug, Clone, Serialize)]
pub struct ReaderInfo {
    pub current_block_number: i64,
    pub start_at_block: i64,
    pub head_block_number: u64,
    pub last_irreversible_block_number: u64,
    pub only_irreversible: bool,
    pub history_length: usize,
}

/// A forward cursor over a [`ChainSource`] with fork detection and bounded
/// walk-back resolution.
pub struct BlockReader<S> {
    source: S,
    start_at_block: i64,
    only_irreversible: bool,
    max_history_length: usize,
    prefetch_batch_size: u64,
    head_block_number: u64,
    last_irreversible_block_number: u64,
    current_block_number: i64,
    is_first_block: bool,
    current_block_data: Option<Block>,
    /// Delivered blocks, oldest first; a valid hash chain at all times.
    block_history: VecDeque<Block>,
    /// Blocks fetched ahead of the cursor, in ascending number order.
    prefetch_queue: VecDeque<Block>,
}

impl<S: ChainSource> BlockReader<S> {
    pub fn new(source: S, config: ReaderConfig) -> Self {
        Self {
            source,
            start_at_block: config.start_at_block,
            only_irreversible: config.only_irreversible,
            max_history_length: config.max_history_length,
            prefetch_batch_size: config.prefetch_batch_size.max(1),
            head_block_number: 0,
            last_irreversible_block_number: 0,
            current_block_number: config.start_at_block - 1,
            is_first_block: false,
            current_block_data: None,
            block_history: VecDeque::new(),
            prefetch_queue: VecDeque::new(),
        }
    }

    pub fn current_block_number(&self) -> i64 {
        self.current_block_number
    }

    pub fn head_block_number(&self) -> u64 {
        self.head_block_number
    }

    pub fn is_first_block(&self) -> bool {
        self.is_first_block
    }

    pub fn info(&self) -> ReaderInfo {
        ReaderInfo {
            current_block_number: self.current_block_number,
            start_at_block: self.start_at_block,
            head_block_number: self.head_block_number,
            last_irreversible_block_number: self.last_irreversible_block_number,
            only_irreversible: self.only_irreversible,
            history_length: self.block_history.len(),
        }
    }

    /// Advance (or refresh) the cursor and return the block now considered
    /// current.
    ///
    /// `is_new` is `false` when the head has not moved and the same block is
    /// re-delivered; `is_rollback` is `true` when the block replaces
    /// previously delivered blocks after a fork.
    pub async fn next_block(&mut self) -> Result<NextBlock, ReaderError> {
        let mut is_rollback = false;
        let mut is_new = false;

        if self.current_block_number == self.head_block_number as i64
            || self.head_block_number == 0
        {
            self.refresh_head().await?;
        }

        // A negative cursor with no history means we are tailing: resolve
        // the start block against the freshly fetched head. A tail deeper
        // than the chain starts at block 1.
        if self.current_block_number < 0 && self.block_history.is_empty() {
            let absolute_start = (self.head_block_number as i64 + self.start_at_block).max(1);
            self.current_block_number = absolute_start - 1;
            self.start_at_block = absolute_start;
            tracing::info!(start_at_block = absolute_start, "Resolved tail start block");
        }

        while self.current_block_number < self.head_block_number as i64 {
            let unvalidated = self.take_prefetched().await?;
            let linked = match &self.current_block_data {
                Some(current) => unvalidated.block_info.extends(&current.block_info),
                None => false,
            };
            if linked || self.block_history.is_empty() {
                self.accept_block(unvalidated);
                is_new = true;
                break;
            }
            tracing::warn!(
                block = unvalidated.block_number(),
                actual = %unvalidated.previous_block_hash(),
                "Fork detected: previous hash does not link onto the current block"
            );
            self.resolve_fork().await?;
            is_new = true;
            is_rollback = true;
            // The fork may be shorter than the branch it replaced.
            self.refresh_head().await?;
            if self.current_block_data.is_some() {
                break;
            }
            // History-exhausted override restarted the cursor; keep advancing
            // so this call still yields a block.
        }

        self.is_first_block = self.current_block_number == self.start_at_block;

        match &self.current_block_data {
            Some(block) => Ok(NextBlock {
                block: block.clone(),
                is_rollback,
                is_new,
                is_first_block: self.is_first_block,
                last_irreversible_block_number: self.last_irreversible_block_number,
            }),
            None => Err(ReaderError::Invariant("no current block after advance")),
        }
    }

    /// Reposition so that the subsequent `next_block` yields block `target`.
    ///
    /// When `target - 1` is still in history it becomes the current block, so
    /// the next advance hash-validates `target` against it; otherwise
    /// `target - 1` is refetched for the same purpose.
    pub async fn seek_to(&mut self, target: u64) -> Result<(), ReaderError> {
        if (target as i64) < self.start_at_block {
            return Err(ReaderError::SeekBeforeStart {
                target,
                start_at_block: self.start_at_block,
            });
        }

        self.current_block_data = None;
        self.head_block_number = 0;
        self.prefetch_queue.clear();

        if target <= 1 {
            self.block_history.clear();
            self.current_block_number = target as i64 - 1;
            return Ok(());
        }

        match self.block_history.iter().rposition(|b| b.block_number() == target) {
            Some(index) => {
                // Drop the target and everything after it; the new tail is
                // block `target - 1`, which becomes the current block.
                self.block_history.truncate(index);
                self.current_block_data = self.block_history.pop_back();
            }
            None => {
                // Stale branches must not feed the fork walker.
                self.block_history.clear();
                let previous = self.source.get_block(target - 1).await?;
                if previous.block_number() != target - 1 {
                    return Err(ReaderError::UpstreamInconsistent {
                        expected: target - 1,
                        actual: previous.block_number(),
                    });
                }
                self.current_block_data = Some(previous);
            }
        }

        self.current_block_number = target as i64 - 1;
        tracing::info!(target, "Seek complete");
        Ok(())
    }

    async fn refresh_head(&mut self) -> Result<(), ReaderError> {
        self.last_irreversible_block_number =
            self.source.get_last_irreversible_block_number().await?;
        self.head_block_number = if self.only_irreversible {
            self.last_irreversible_block_number
        } else {
            self.source.get_head_block_number().await?
        };
        self.prefetch_queue.clear();
        Ok(())
    }

    /// Pop the next block ahead of the cursor, filling the prefetch queue
    /// with a bounded concurrent fetch when it is empty.
    async fn take_prefetched(&mut self) -> Result<Block, ReaderError> {
        if self.prefetch_queue.is_empty() {
            self.prefetch().await?;
        }
        let expected = (self.current_block_number + 1) as u64;
        let block = self
            .prefetch_queue
            .pop_front()
            .ok_or(ReaderError::Invariant("prefetch produced no blocks below head"))?;
        if block.block_number() != expected {
            return Err(ReaderError::UpstreamInconsistent {
                expected,
                actual: block.block_number(),
            });
        }
        Ok(block)
    }

    async fn prefetch(&mut self) -> Result<(), ReaderError> {
        let from = (self.current_block_number + 1) as u64;
        let to = self
            .head_block_number
            .min(from.saturating_add(self.prefetch_batch_size - 1));
        let blocks = try_join_all((from..=to).map(|n| self.source.get_block(n))).await?;
        for (offset, block) in blocks.iter().enumerate() {
            let requested = from + offset as u64;
            if block.block_number() != requested {
                return Err(ReaderError::UpstreamInconsistent {
                    expected: requested,
                    actual: block.block_number(),
                });
            }
        }
        tracing::debug!(from, to, "Prefetched block range");
        self.prefetch_queue.extend(blocks);
        Ok(())
    }

    fn accept_block(&mut self, block: Block) {
        if let Some(outgoing) = self.current_block_data.take() {
            self.block_history.push_back(outgoing);
            while self.block_history.len() > self.max_history_length {
                self.block_history.pop_front();
            }
        }
        self.current_block_number = block.block_number() as i64;
        self.current_block_data = Some(block);
    }

    /// Walk the in-memory history newest-to-oldest, refetching each height
    /// until a refetched block links onto a cached ancestor.
    async fn resolve_fork(&mut self) -> Result<(), ReaderError> {
        while let Some(prev_hash) = self.block_history.back().map(|b| b.block_hash().clone()) {
            let current_number = match &self.current_block_data {
                Some(block) => block.block_number(),
                None => {
                    return Err(ReaderError::Invariant(
                        "fork resolution requires a current block",
                    ))
                }
            };
            let refetched = self.source.get_block(current_number).await?;
            if refetched.block_number() != current_number {
                return Err(ReaderError::UpstreamInconsistent {
                    expected: current_number,
                    actual: refetched.block_number(),
                });
            }
            let resolved = *refetched.previous_block_hash() == prev_hash;
            self.current_block_data = Some(refetched);
            if resolved {
                break;
            }
            // No link at this height; walk one block further back.
            self.current_block_data = self.block_history.pop_back();
        }

        self.prefetch_queue.clear();

        match self.block_history.back() {
            Some(tail) => {
                self.current_block_number = tail.block_number() as i64 + 1;
                tracing::info!(
                    fork_point = tail.block_number(),
                    resumed_at = self.current_block_number,
                    "Fork resolved"
                );
                Ok(())
            }
            None => {
                self.source.history_exhausted().await?;
                // An overridden hook chose to continue: cold restart.
                tracing::warn!(
                    start_at_block = self.start_at_block,
                    "Block history exhausted; restarting from the start block"
                );
                self.current_block_data = None;
                self.current_block_number = self.start_at_block - 1;
                self.head_block_number = 0;
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{chain, make_block, ScriptedChain};
    use std::sync::Arc;

    fn reader(source: Arc<ScriptedChain>, config: ReaderConfig) -> BlockReader<Arc<ScriptedChain>> {
        BlockReader::new(source, config)
    }

    #[tokio::test]
    async fn advances_linear_chain_in_order() {
        let source = Arc::new(ScriptedChain::new(chain(&[
            (1, "a", ""),
            (2, "b", "a"),
            (3, "c", "b"),
        ])));
        let mut reader = reader(source, ReaderConfig::default());

        for expected in 1..=3u64 {
            let next = reader.next_block().await.unwrap();
            assert!(next.is_new);
            assert!(!next.is_rollback);
            assert_eq!(next.block.block_number(), expected);
            assert_eq!(next.is_first_block, expected == 1);
        }
    }

    #[tokio::test]
    async fn redelivers_current_block_at_head() {
        let source = Arc::new(ScriptedChain::new(chain(&[(1, "a", ""), (2, "b", "a")])));
        let mut reader = reader(source, ReaderConfig::default());

        reader.next_block().await.unwrap();
        reader.next_block().await.unwrap();
        let again = reader.next_block().await.unwrap();
        assert!(!again.is_new);
        assert_eq!(again.block.block_number(), 2);
    }

    #[tokio::test]
    async fn each_block_fetched_exactly_once_on_linear_advance() {
        let source = Arc::new(ScriptedChain::new(chain(&[
            (1, "a", ""),
            (2, "b", "a"),
            (3, "c", "b"),
            (4, "d", "c"),
            (5, "e", "d"),
            (6, "f", "e"),
        ])));
        let mut reader = reader(Arc::clone(&source), ReaderConfig::default());

        for expected in 1..=6u64 {
            let next = reader.next_block().await.unwrap();
            assert_eq!(next.block.block_number(), expected);
        }
        for number in 1..=6u64 {
            assert_eq!(source.fetch_count(number), 1, "block {number} refetched");
        }
    }

    #[tokio::test]
    async fn resolves_fork_by_walking_back() {
        let source = Arc::new(ScriptedChain::new(chain(&[
            (1, "a", ""),
            (2, "b", "a"),
            (3, "c", "b"),
        ])));
        let mut reader = reader(Arc::clone(&source), ReaderConfig::default());
        for _ in 0..3 {
            reader.next_block().await.unwrap();
        }

        // The chain reorganizes below the cursor and grows a new head.
        source.set_chain(chain(&[
            (1, "a", ""),
            (2, "b2", "a"),
            (3, "c2", "b2"),
            (4, "d2", "c2"),
        ]));

        let next = reader.next_block().await.unwrap();
        assert!(next.is_rollback);
        assert!(next.is_new);
        assert_eq!(next.block.block_number(), 2);
        assert_eq!(next.block.block_hash().as_str(), "b2");

        let next = reader.next_block().await.unwrap();
        assert!(!next.is_rollback);
        assert_eq!(next.block.block_hash().as_str(), "c2");
        let next = reader.next_block().await.unwrap();
        assert_eq!(next.block.block_hash().as_str(), "d2");
    }

    #[tokio::test]
    async fn deep_fork_exhausts_history() {
        let source = Arc::new(ScriptedChain::new(chain(&[
            (1, "a", ""),
            (2, "b", "a"),
            (3, "c", "b"),
            (4, "d", "c"),
        ])));
        let config = ReaderConfig {
            max_history_length: 2,
            ..ReaderConfig::default()
        };
        let mut reader = reader(Arc::clone(&source), config);
        for _ in 0..4 {
            reader.next_block().await.unwrap();
        }

        // Replace every block the reader still remembers.
        source.set_chain(chain(&[
            (1, "a2", ""),
            (2, "b2", "a2"),
            (3, "c2", "b2"),
            (4, "d2", "c2"),
            (5, "e2", "d2"),
        ]));

        let result = reader.next_block().await;
        assert!(matches!(result, Err(ReaderError::HistoryExhausted)));
    }

    #[tokio::test]
    async fn history_exhausted_override_restarts_from_start_block() {
        let source = Arc::new(ScriptedChain::new(chain(&[
            (1, "a", ""),
            (2, "b", "a"),
            (3, "c", "b"),
        ])));
        source.set_reset_on_history_exhausted(true);
        let config = ReaderConfig {
            max_history_length: 1,
            ..ReaderConfig::default()
        };
        let mut reader = reader(Arc::clone(&source), config);
        for _ in 0..3 {
            reader.next_block().await.unwrap();
        }

        source.set_chain(chain(&[
            (1, "a2", ""),
            (2, "b2", "a2"),
            (3, "c2", "b2"),
            (4, "d2", "c2"),
        ]));

        // Walk-back runs dry, the override fires, and the reader restarts.
        let next = reader.next_block().await.unwrap();
        assert!(next.is_rollback);
        assert_eq!(next.block.block_number(), 1);
        assert_eq!(next.block.block_hash().as_str(), "a2");
    }

    #[tokio::test]
    async fn history_stays_bounded() {
        let blocks: Vec<_> = (1..=20u64)
            .map(|n| {
                let prev = if n == 1 { String::new() } else { format!("h{}", n - 1) };
                make_block(n, &format!("h{n}"), &prev, vec![])
            })
            .collect();
        let source = Arc::new(ScriptedChain::new(blocks));
        let config = ReaderConfig {
            max_history_length: 3,
            ..ReaderConfig::default()
        };
        let mut reader = reader(source, config);

        for _ in 0..20 {
            reader.next_block().await.unwrap();
            assert!(reader.block_history.len() <= 3);
        }
    }

    #[tokio::test]
    async fn seek_within_history_revalidates_linkage() {
        let source = Arc::new(ScriptedChain::new(chain(&[
            (1, "a", ""),
            (2, "b", "a"),
            (3, "c", "b"),
            (4, "d", "c"),
            (5, "e", "d"),
        ])));
        let mut reader = reader(source, ReaderConfig::default());
        for _ in 0..5 {
            reader.next_block().await.unwrap();
        }

        reader.seek_to(3).await.unwrap();
        let next = reader.next_block().await.unwrap();
        assert!(next.is_new);
        assert!(!next.is_rollback);
        assert_eq!(next.block.block_number(), 3);
        assert_eq!(next.block.block_hash().as_str(), "c");
    }

    #[tokio::test]
    async fn seek_past_history_refetches_predecessor() {
        let blocks: Vec<_> = (1..=12u64)
            .map(|n| {
                let prev = if n == 1 { String::new() } else { format!("h{}", n - 1) };
                make_block(n, &format!("h{n}"), &prev, vec![])
            })
            .collect();
        let source = Arc::new(ScriptedChain::new(blocks));
        let mut reader = reader(Arc::clone(&source), ReaderConfig::default());
        for _ in 0..3 {
            reader.next_block().await.unwrap();
        }

        reader.seek_to(11).await.unwrap();
        let next = reader.next_block().await.unwrap();
        assert_eq!(next.block.block_number(), 11);
        assert!(next.is_new);
        assert!(!next.is_rollback);
    }

    #[tokio::test]
    async fn seek_to_one_restarts_cleanly() {
        let source = Arc::new(ScriptedChain::new(chain(&[
            (1, "a", ""),
            (2, "b", "a"),
            (3, "c", "b"),
        ])));
        let mut reader = reader(source, ReaderConfig::default());
        for _ in 0..3 {
            reader.next_block().await.unwrap();
        }

        reader.seek_to(1).await.unwrap();
        let next = reader.next_block().await.unwrap();
        assert_eq!(next.block.block_number(), 1);
        assert!(next.is_first_block);
    }

    #[tokio::test]
    async fn seek_before_start_rejected() {
        let source = Arc::new(ScriptedChain::new(chain(&[(5, "e", "d")])));
        let config = ReaderConfig {
            start_at_block: 5,
            ..ReaderConfig::default()
        };
        let mut reader = reader(source, config);
        let result = reader.seek_to(3).await;
        assert!(matches!(
            result,
            Err(ReaderError::SeekBeforeStart { target: 3, .. })
        ));
    }

    #[tokio::test]
    async fn negative_start_tails_the_head() {
        let blocks: Vec<_> = (1..=10u64)
            .map(|n| {
                let prev = if n == 1 { String::new() } else { format!("h{}", n - 1) };
                make_block(n, &format!("h{n}"), &prev, vec![])
            })
            .collect();
        let source = Arc::new(ScriptedChain::new(blocks));
        let config = ReaderConfig {
            start_at_block: -2,
            ..ReaderConfig::default()
        };
        let mut reader = reader(source, config);

        let next = reader.next_block().await.unwrap();
        assert_eq!(next.block.block_number(), 8);
        assert!(next.is_first_block);
        let next = reader.next_block().await.unwrap();
        assert_eq!(next.block.block_number(), 9);
        assert!(!next.is_first_block);
    }

    #[tokio::test]
    async fn only_irreversible_caps_the_head() {
        let source = Arc::new(ScriptedChain::new(chain(&[
            (1, "a", ""),
            (2, "b", "a"),
            (3, "c", "b"),
            (4, "d", "c"),
        ])));
        source.set_last_irreversible(2);
        let config = ReaderConfig {
            only_irreversible: true,
            ..ReaderConfig::default()
        };
        let mut reader = reader(source, config);

        reader.next_block().await.unwrap();
        let next = reader.next_block().await.unwrap();
        assert_eq!(next.block.block_number(), 2);
        let again = reader.next_block().await.unwrap();
        assert!(!again.is_new, "must not read past the irreversible block");
        assert_eq!(again.block.block_number(), 2);
    }

    #[tokio::test]
    async fn wrong_block_number_from_source_is_inconsistent() {
        let source = Arc::new(ScriptedChain::new(vec![
            make_block(1, "a", "", vec![]),
            make_block(7, "b", "a", vec![]), // wrong number at height 2
        ]));
        let mut reader = reader(source, ReaderConfig::default());
        let result = reader.next_block().await;
        assert!(matches!(
            result,
            Err(ReaderError::UpstreamInconsistent { expected: 2, actual: 7 })
        ));
    }
}
