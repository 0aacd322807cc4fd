//! In-memory persistence binder.
//!
//! Keeps user state, the index cursor, and one snapshot per applied block in
//! RAM. Useful for tests and short-lived indexers that don't need
//! persistence; all data is lost when the process exits.
//!
//! The transaction model is clone-and-swap: `handle_with_state` hands the
//! task a copy of the committed state and only swaps it in (plus a snapshot
//! keyed by the new cursor block) when the task succeeds. There are no
//! savepoints, so a mid-block cursor write coalesces into the enclosing
//! commit; the handler's in-memory version switch stays authoritative and a
//! crashed block is simply re-run on restart.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;

use chainmux_core::binder::{PersistenceBinder, StateRunner};
use chainmux_core::error::HandlerError;
use chainmux_core::types::{Block, IndexState};

/// The state object handed to updaters: a keyed JSON value store with the
/// index cursor embedded, so cursor writes commit together with user writes.
#[derive(Debug, Clone, Default)]
pub struct MemoryState {
    values: HashMap<String, Value>,
    index: IndexState,
}

impl MemoryState {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.values.insert(key.into(), value);
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.values.remove(key)
    }

    pub fn index(&self) -> &IndexState {
        &self.index
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[derive(Debug, Clone)]
struct Snapshot {
    state: MemoryState,
    committed_at: i64,
}

#[derive(Default)]
struct Store {
    committed: MemoryState,
    snapshots: BTreeMap<u64, Snapshot>,
    rollback_targets: Vec<u64>,
}

/// In-memory [`PersistenceBinder`].
#[derive(Default)]
pub struct MemoryBinder {
    store: Mutex<Store>,
}

impl MemoryBinder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the committed state, for inspection.
    pub fn committed(&self) -> MemoryState {
        self.store.lock().unwrap().committed.clone()
    }

    /// Committed value for `key`, if any.
    pub fn value(&self, key: &str) -> Option<Value> {
        self.store.lock().unwrap().committed.values.get(key).cloned()
    }

    /// Every `rollback_to` target seen, in call order.
    pub fn rollback_targets(&self) -> Vec<u64> {
        self.store.lock().unwrap().rollback_targets.clone()
    }

    /// Unix timestamp of the most recent commit.
    pub fn last_committed_at(&self) -> Option<i64> {
        let store = self.store.lock().unwrap();
        store.snapshots.values().map(|s| s.committed_at).max()
    }
}

#[async_trait]
impl PersistenceBinder for MemoryBinder {
    type State = MemoryState;
    type Context = ();

    async fn load_index_state(&self) -> Result<IndexState, HandlerError> {
        Ok(self.store.lock().unwrap().committed.index.clone())
    }

    async fn update_index_state(
        &self,
        state: &mut MemoryState,
        block: &Block,
        _is_replay: bool,
        handler_version_name: &str,
        _context: &(),
    ) -> Result<(), HandlerError> {
        state.index = IndexState {
            block_number: block.block_number(),
            block_hash: block.block_hash().clone(),
            handler_version_name: handler_version_name.to_string(),
        };
        Ok(())
    }

    async fn rollback_to(&self, block_number: u64) -> Result<(), HandlerError> {
        let mut store = self.store.lock().unwrap();
        store.rollback_targets.push(block_number);
        if block_number == 0 {
            store.committed = MemoryState::default();
            store.snapshots.clear();
            tracing::debug!("Rolled back to genesis");
            return Ok(());
        }
        let snapshot = store.snapshots.get(&block_number).cloned().ok_or_else(|| {
            HandlerError::Persistence(format!(
                "no snapshot for block {block_number} to roll back to"
            ))
        })?;
        store.committed = snapshot.state;
        store.snapshots.split_off(&(block_number + 1));
        tracing::debug!(block = block_number, "Rolled back");
        Ok(())
    }

    async fn handle_with_state(
        &self,
        task: &mut dyn StateRunner<MemoryState, ()>,
    ) -> Result<(), HandlerError> {
        // Work on a copy; an erroring task leaves the store untouched.
        let mut working = self.store.lock().unwrap().committed.clone();
        task.run(&mut working, &()).await?;

        let mut store = self.store.lock().unwrap();
        store.snapshots.insert(
            working.index.block_number,
            Snapshot {
                state: working.clone(),
                committed_at: chrono::Utc::now().timestamp(),
            },
        );
        store.committed = working;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chainmux_core::testing::make_block;
    use serde_json::json;

    struct SetValues {
        block: Block,
        version: &'static str,
        fail: bool,
    }

    #[async_trait]
    impl StateRunner<MemoryState, ()> for SetValues {
        async fn run(&mut self, state: &mut MemoryState, _context: &()) -> Result<(), HandlerError> {
            state.set(format!("b{}", self.block.block_number()), json!(true));
            if self.fail {
                return Err(HandlerError::Persistence("boom".to_string()));
            }
            state.index = IndexState {
                block_number: self.block.block_number(),
                block_hash: self.block.block_hash().clone(),
                handler_version_name: self.version.to_string(),
            };
            Ok(())
        }
    }

    async fn commit_block(binder: &MemoryBinder, number: u64, hash: &str) {
        let mut task = SetValues {
            block: make_block(number, hash, "", vec![]),
            version: "v1",
            fail: false,
        };
        binder.handle_with_state(&mut task).await.unwrap();
    }

    #[tokio::test]
    async fn index_state_round_trips() {
        let binder = MemoryBinder::new();
        commit_block(&binder, 7, "h7").await;

        let index = binder.load_index_state().await.unwrap();
        assert_eq!(index.block_number, 7);
        assert_eq!(index.block_hash.as_str(), "h7");
        assert_eq!(index.handler_version_name, "v1");
        assert!(binder.last_committed_at().is_some());
    }

    #[tokio::test]
    async fn failed_task_leaves_store_untouched() {
        let binder = MemoryBinder::new();
        commit_block(&binder, 1, "h1").await;

        let mut failing = SetValues {
            block: make_block(2, "h2", "h1", vec![]),
            version: "v1",
            fail: true,
        };
        let result = binder.handle_with_state(&mut failing).await;
        assert!(result.is_err());

        assert_eq!(binder.load_index_state().await.unwrap().block_number, 1);
        assert!(binder.value("b2").is_none());
    }

    #[tokio::test]
    async fn rollback_restores_snapshot_and_drops_later_ones() {
        let binder = MemoryBinder::new();
        commit_block(&binder, 1, "h1").await;
        commit_block(&binder, 2, "h2").await;
        commit_block(&binder, 3, "h3").await;

        binder.rollback_to(1).await.unwrap();

        let committed = binder.committed();
        assert_eq!(committed.index().block_number, 1);
        assert!(committed.get("b1").is_some());
        assert!(committed.get("b2").is_none());
        assert!(committed.get("b3").is_none());

        // The rolled-back heights can be committed again.
        commit_block(&binder, 2, "h2b").await;
        assert_eq!(
            binder.load_index_state().await.unwrap().block_hash.as_str(),
            "h2b"
        );
    }

    #[tokio::test]
    async fn rollback_to_genesis_clears_everything() {
        let binder = MemoryBinder::new();
        commit_block(&binder, 1, "h1").await;
        binder.rollback_to(0).await.unwrap();

        let index = binder.load_index_state().await.unwrap();
        assert_eq!(index, IndexState::default());
        assert!(binder.committed().is_empty());
        assert_eq!(binder.rollback_targets(), vec![0]);
    }

    #[tokio::test]
    async fn rollback_without_snapshot_is_an_error() {
        let binder = MemoryBinder::new();
        let result = binder.rollback_to(5).await;
        assert!(matches!(result, Err(HandlerError::Persistence(_))));
    }
}
