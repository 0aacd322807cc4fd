//! Minimal wiring demo: a scripted three-block chain, one updater that sums
//! transfer amounts into the store, and one effect that announces each
//! transfer.
//!
//! Run with:
//! ```sh
//! RUST_LOG=info cargo run --bin counter_indexer
//! ```

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing_subscriber::EnvFilter;

use chainmux_core::testing::{make_action, make_block, ScriptedChain};
use chainmux_core::types::{Block, BlockInfo};
use chainmux_core::{
    BlockHandler, BlockReader, Effect, HandlerError, HandlerVersion, PersistenceBinder,
    ReaderConfig, SyncConfig, SyncLoop, Updater, VersionRegistry,
};
use chainmux_storage::{MemoryBinder, MemoryState};

/// Adds each transfer's `amount` to a running total in the store.
struct SumTransfers;

#[async_trait]
impl Updater<MemoryState, ()> for SumTransfers {
    fn action_type(&self) -> &str {
        "transfer"
    }

    async fn apply(
        &self,
        state: &mut MemoryState,
        payload: &Value,
        _block_info: &BlockInfo,
        _context: &(),
    ) -> Result<Option<String>, HandlerError> {
        let amount = payload["amount"].as_i64().unwrap_or(0);
        let total = state.get("total").and_then(Value::as_i64).unwrap_or(0);
        state.set("total", json!(total + amount));
        Ok(None)
    }
}

/// Announces each transfer once it is applied.
struct AnnounceTransfer;

#[async_trait]
impl Effect<()> for AnnounceTransfer {
    fn action_type(&self) -> &str {
        "transfer"
    }

    async fn run(&self, payload: &Value, block: &Block, _context: &()) {
        tracing::info!(
            block = block.block_number(),
            amount = payload["amount"].as_i64().unwrap_or(0),
            "Transfer applied"
        );
    }
}

fn demo_chain() -> Vec<Block> {
    vec![
        make_block(
            1,
            "h1",
            "",
            vec![make_action("transfer", json!({ "amount": 100 }))],
        ),
        make_block(
            2,
            "h2",
            "h1",
            vec![
                make_action("transfer", json!({ "amount": 250 })),
                make_action("transfer", json!({ "amount": 7 })),
            ],
        ),
        make_block(3, "h3", "h2", vec![]),
    ]
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let source = Arc::new(ScriptedChain::new(demo_chain()));
    let binder = Arc::new(MemoryBinder::new());
    let registry = VersionRegistry::new(vec![HandlerVersion::new("v1")
        .updater(Arc::new(SumTransfers))
        .effect(Arc::new(AnnounceTransfer))])?;

    let reader = BlockReader::new(Arc::clone(&source), ReaderConfig::default());
    let handler = BlockHandler::new(Arc::clone(&binder), registry);
    let mut sync = SyncLoop::new(reader, handler, SyncConfig::default());

    sync.catch_up(false).await?;

    let index = binder.load_index_state().await?;
    tracing::info!(
        total = binder.value("total").and_then(|v| v.as_i64()).unwrap_or(0),
        block = index.block_number,
        hash = %index.block_hash,
        "Caught up"
    );
    Ok(())
}
