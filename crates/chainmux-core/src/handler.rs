//! Block-at-a-time processor: versioned updaters, effects, durable cursor.
//!
//! The handler owns the durable index cursor and decides, per incoming
//! block, whether to apply it, skip it (already applied), ask the reader to
//! seek, or fail (the reader sent a block that does not link). Application
//! runs inside the binder's transaction scope: updaters mutate state, the
//! cursor is persisted with them, and effects fire only on live (non-replay)
//! runs.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use crate::binder::{PersistenceBinder, StateRunner};
use crate::error::HandlerError;
use crate::types::{Action, Block, BlockHash, NextBlock};
use crate::version::{Effect, Updater, VersionRegistry};

/// Status snapshot for monitoring.
#[derive(Debug, Clone, Serialize)]
pub struct HandlerInfo {
    pub last_processed_block_number: u64,
    pub last_processed_block_hash: BlockHash,
    pub handler_version_name: String,
    pub deferred_effect_count: usize,
}

#[derive(Debug, Clone)]
struct HandlerCursor {
    last_processed_block_number: u64,
    last_processed_block_hash: BlockHash,
    handler_version_name: String,
}

struct DeferredEffect<C> {
    effect: Arc<dyn Effect<C>>,
    payload: Value,
    block: Block,
}

/// Applies blocks to an application-defined store through a
/// [`PersistenceBinder`], under the rules of the active handler version.
pub struct BlockHandler<B: PersistenceBinder> {
    binder: B,
    registry: VersionRegistry<B::State, B::Context>,
    cursor: HandlerCursor,
    /// Effect runs queued until their block becomes irreversible, keyed by
    /// block number.
    deferred_effects: BTreeMap<u64, Vec<DeferredEffect<B::Context>>>,
}

impl<B: PersistenceBinder> BlockHandler<B> {
    pub fn new(binder: B, registry: VersionRegistry<B::State, B::Context>) -> Self {
        let cursor = HandlerCursor {
            last_processed_block_number: 0,
            last_processed_block_hash: BlockHash::default(),
            handler_version_name: registry.start_version().to_string(),
        };
        Self {
            binder,
            registry,
            cursor,
            deferred_effects: BTreeMap::new(),
        }
    }

    pub fn binder(&self) -> &B {
        &self.binder
    }

    pub fn info(&self) -> HandlerInfo {
        HandlerInfo {
            last_processed_block_number: self.cursor.last_processed_block_number,
            last_processed_block_hash: self.cursor.last_processed_block_hash.clone(),
            handler_version_name: self.cursor.handler_version_name.clone(),
            deferred_effect_count: self.deferred_effects.values().map(Vec::len).sum(),
        }
    }

    /// Handle one block from the reader.
    ///
    /// Returns `Some(target)` when the reader must `seek_to(target)` before
    /// the handler can make progress, `None` when the block was applied (or
    /// was already applied and skipped).
    pub async fn handle_block(
        &mut self,
        next: &NextBlock,
        is_replay: bool,
    ) -> Result<Option<u64>, HandlerError> {
        let info = &next.block.block_info;

        if next.is_rollback || (is_replay && next.is_first_block) {
            let rollback_target = info.block_number.saturating_sub(1);
            tracing::info!(rollback_target, "Rolling back state");
            self.binder.rollback_to(rollback_target).await?;
            self.rollback_deferred_effects(info.block_number);
            self.refresh_index_state().await?;
        } else if self.cursor.last_processed_block_number == 0
            && self.cursor.last_processed_block_hash.is_empty()
        {
            // Nothing loaded yet: pick up the persisted cursor, if any.
            self.refresh_index_state().await?;
        }

        // Already applied this exact block.
        if info.block_number == self.cursor.last_processed_block_number
            && info.block_hash == self.cursor.last_processed_block_hash
        {
            return Ok(None);
        }

        let next_block_needed = self.cursor.last_processed_block_number + 1;

        // The reader restarted from its first block but the store is further
        // along: skip ahead to where we left off.
        if next.is_first_block && !self.cursor.last_processed_block_hash.is_empty() {
            return Ok(Some(next_block_needed));
        }

        if !next.is_first_block {
            if info.block_number != next_block_needed {
                return Ok(Some(next_block_needed));
            }
            if info.previous_block_hash != self.cursor.last_processed_block_hash {
                return Err(HandlerError::ChainMismatch {
                    block_number: info.block_number,
                    expected: self.cursor.last_processed_block_hash.clone(),
                    actual: info.previous_block_hash.clone(),
                });
            }
        }

        let Self {
            binder,
            registry,
            cursor,
            deferred_effects,
        } = self;
        let binder: &B = binder;
        let mut application = BlockApplication {
            binder,
            registry: &*registry,
            cursor,
            deferred_effects,
            next,
            is_replay,
        };
        binder.handle_with_state(&mut application).await?;

        tracing::debug!(
            block = info.block_number,
            hash = %info.block_hash,
            is_replay,
            "Block applied"
        );
        Ok(None)
    }

    async fn refresh_index_state(&mut self) -> Result<(), HandlerError> {
        let index = self.binder.load_index_state().await?;
        if !index.handler_version_name.is_empty() {
            if !self.registry.contains(&index.handler_version_name) {
                return Err(HandlerError::UnknownVersion(index.handler_version_name));
            }
            self.cursor.handler_version_name = index.handler_version_name;
        }
        self.cursor.last_processed_block_number = index.block_number;
        self.cursor.last_processed_block_hash = index.block_hash;
        tracing::debug!(
            block = self.cursor.last_processed_block_number,
            version = %self.cursor.handler_version_name,
            "Loaded index state"
        );
        Ok(())
    }

    /// Discard queued effect runs for blocks at or above `from_block`; their
    /// blocks are being rolled back and must never fire.
    fn rollback_deferred_effects(&mut self, from_block: u64) {
        let dropped = self.deferred_effects.split_off(&from_block);
        let count: usize = dropped.values().map(Vec::len).sum();
        if count > 0 {
            tracing::info!(from_block, count, "Discarded deferred effects");
        }
    }
}

/// One block's application, run inside the binder's transaction scope.
struct BlockApplication<'h, B: PersistenceBinder> {
    binder: &'h B,
    registry: &'h VersionRegistry<B::State, B::Context>,
    cursor: &'h mut HandlerCursor,
    deferred_effects: &'h mut BTreeMap<u64, Vec<DeferredEffect<B::Context>>>,
    next: &'h NextBlock,
    is_replay: bool,
}

#[async_trait]
impl<'h, B: PersistenceBinder> StateRunner<B::State, B::Context> for BlockApplication<'h, B> {
    async fn run(&mut self, state: &mut B::State, context: &B::Context) -> Result<(), HandlerError> {
        let next = self.next;
        let block = &next.block;
        let versioned = self.apply_updaters(state, context).await?;
        if !self.is_replay {
            self.run_effects(versioned, context).await;
            self.run_deferred_effects(next.last_irreversible_block_number, context)
                .await;
        }
        self.binder
            .update_index_state(
                state,
                block,
                self.is_replay,
                &self.cursor.handler_version_name,
                context,
            )
            .await?;
        self.cursor.last_processed_block_number = block.block_number();
        self.cursor.last_processed_block_hash = block.block_hash().clone();
        Ok(())
    }
}

impl<'h, B: PersistenceBinder> BlockApplication<'h, B> {
    /// Run the active version's updaters over every action in block order,
    /// following version switches as they happen. Returns each action paired
    /// with the version that was active after its updaters ran.
    async fn apply_updaters(
        &mut self,
        state: &mut B::State,
        context: &B::Context,
    ) -> Result<Vec<(&'h Action, String)>, HandlerError> {
        let registry = self.registry;
        let next = self.next;
        let block = &next.block;
        let mut versioned = Vec::with_capacity(block.actions.len());

        for action in &block.actions {
            let version = registry
                .get(&self.cursor.handler_version_name)
                .ok_or_else(|| {
                    HandlerError::UnknownVersion(self.cursor.handler_version_name.clone())
                })?;
            for (index, updater) in version.updaters.iter().enumerate() {
                if updater.action_type() != action.action_type {
                    continue;
                }
                let new_version = updater
                    .apply(state, &action.payload, &block.block_info, context)
                    .await?;
                let Some(new_version) = new_version else {
                    continue;
                };
                if !registry.contains(&new_version) {
                    tracing::warn!(
                        requested = %new_version,
                        current = %self.cursor.handler_version_name,
                        "Updater requested an unregistered handler version; staying on the current version"
                    );
                    continue;
                }
                tracing::info!(
                    from = %self.cursor.handler_version_name,
                    to = %new_version,
                    block = block.block_number(),
                    "Switching handler version"
                );
                let remaining = version.updaters.len() - index - 1;
                if remaining > 0 {
                    tracing::warn!(
                        remaining,
                        action = %action.action_type,
                        "Skipping remaining updaters for this action after the version switch"
                    );
                }
                // Persist the cursor under the new version immediately, so a
                // replay after a crash resumes with the right mapping.
                self.binder
                    .update_index_state(state, block, self.is_replay, &new_version, context)
                    .await?;
                self.cursor.handler_version_name = new_version;
                break;
            }
            versioned.push((action, self.cursor.handler_version_name.clone()));
        }

        Ok(versioned)
    }

    /// Run (or queue) the effects of each action's version.
    async fn run_effects(&mut self, versioned: Vec<(&'h Action, String)>, context: &B::Context) {
        let next = self.next;
        for (action, version_name) in versioned {
            let version = match self.registry.get(&version_name) {
                Some(version) => version,
                None => continue,
            };
            for effect in &version.effects {
                if effect.action_type() != action.action_type {
                    continue;
                }
                let run_now = !effect.defer_until_irreversible()
                    || next.block.block_number() <= next.last_irreversible_block_number;
                if run_now {
                    effect.run(&action.payload, &next.block, context).await;
                } else {
                    self.deferred_effects
                        .entry(next.block.block_number())
                        .or_default()
                        .push(DeferredEffect {
                            effect: Arc::clone(effect),
                            payload: action.payload.clone(),
                            block: next.block.clone(),
                        });
                }
            }
        }
    }

    /// Release queued effect runs for blocks that are now irreversible.
    async fn run_deferred_effects(&mut self, last_irreversible: u64, context: &B::Context) {
        let due: Vec<u64> = self
            .deferred_effects
            .range(..=last_irreversible)
            .map(|(block_number, _)| *block_number)
            .collect();
        for block_number in due {
            if let Some(entries) = self.deferred_effects.remove(&block_number) {
                tracing::debug!(
                    block = block_number,
                    count = entries.len(),
                    "Running deferred effects"
                );
                for entry in entries {
                    entry.effect.run(&entry.payload, &entry.block, context).await;
                }
            }
        }
    }
}
