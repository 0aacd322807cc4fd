//! The persistence seam between the handler and an application-defined store.

use async_trait::async_trait;

use crate::error::HandlerError;
use crate::types::{Block, IndexState};

/// A one-shot unit of work executed inside the binder's transaction scope.
///
/// This is the `handle_with_state` closure seam expressed as an object-safe
/// async trait: the binder receives the task, invokes [`StateRunner::run`]
/// exactly once with a state object and context, and the run must have
/// completed before `handle_with_state` returns.
#[async_trait]
pub trait StateRunner<S, C>: Send {
    async fn run(&mut self, state: &mut S, context: &C) -> Result<(), HandlerError>;
}

/// Trait binding the handler to a transactional store.
///
/// `State` is the application's mutable state object; `Context` carries any
/// per-transaction extras (connection handles, metadata) that updaters and
/// effects receive alongside it. Both are owned exclusively by the single
/// invocation of the task passed to [`handle_with_state`]; the handler never
/// retains references after that call.
///
/// [`handle_with_state`]: PersistenceBinder::handle_with_state
#[async_trait]
pub trait PersistenceBinder: Send + Sync {
    type State: Send + 'static;
    type Context: Send + Sync + 'static;

    /// Load the persisted index cursor. Fresh stores return
    /// [`IndexState::default`].
    async fn load_index_state(&self) -> Result<IndexState, HandlerError>;

    /// Write the index cursor into the in-flight transaction state.
    ///
    /// Called at the end of every block, and additionally mid-block when an
    /// updater switches the handler version, so a replay after a crash
    /// resumes under the right version mapping. Binders that cannot commit an
    /// intermediate cursor (no savepoints) may coalesce the write into the
    /// enclosing transaction; the handler's in-memory version switch is then
    /// authoritative and the whole block is re-run on restart.
    async fn update_index_state(
        &self,
        state: &mut Self::State,
        block: &Block,
        is_replay: bool,
        handler_version_name: &str,
        context: &Self::Context,
    ) -> Result<(), HandlerError>;

    /// Reverse all applied state down to and including `block_number`, so
    /// that after return the store reflects the state right after block
    /// `block_number` was applied. `0` means "before any block".
    async fn rollback_to(&self, block_number: u64) -> Result<(), HandlerError>;

    /// Acquire a transactional state scope and run `task` exactly once inside
    /// it. Commit on success; abort on error, leaving the store unchanged.
    async fn handle_with_state(
        &self,
        task: &mut dyn StateRunner<Self::State, Self::Context>,
    ) -> Result<(), HandlerError>;
}

#[async_trait]
impl<B: PersistenceBinder> PersistenceBinder for std::sync::Arc<B> {
    type State = B::State;
    type Context = B::Context;

    async fn load_index_state(&self) -> Result<IndexState, HandlerError> {
        (**self).load_index_state().await
    }

    async fn update_index_state(
        &self,
        state: &mut Self::State,
        block: &Block,
        is_replay: bool,
        handler_version_name: &str,
        context: &Self::Context,
    ) -> Result<(), HandlerError> {
        (**self)
            .update_index_state(state, block, is_replay, handler_version_name, context)
            .await
    }

    async fn rollback_to(&self, block_number: u64) -> Result<(), HandlerError> {
        (**self).rollback_to(block_number).await
    }

    async fn handle_with_state(
        &self,
        task: &mut dyn StateRunner<Self::State, Self::Context>,
    ) -> Result<(), HandlerError> {
        (**self).handle_with_state(task).await
    }
}
