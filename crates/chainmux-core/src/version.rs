//! Handler versions: named bundles of updaters and effects.
//!
//! The active version decides which updaters and effects see each action.
//! An updater may return the name of another registered version to switch
//! the mapping mid-stream; the switch takes effect for the remainder of the
//! current block and everything after it.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::HandlerError;
use crate::types::{Block, BlockInfo};

/// A deterministic state mutation keyed to one action type.
///
/// Updaters must be replay-safe: all I/O goes through `state`, so that
/// re-running them over the same blocks rebuilds the same state.
#[async_trait]
pub trait Updater<S, C>: Send + Sync {
    /// The action type this updater processes.
    fn action_type(&self) -> &str;

    /// Apply the action to `state`. Returning `Some(name)` requests a switch
    /// to the named handler version.
    async fn apply(
        &self,
        state: &mut S,
        payload: &Value,
        block_info: &BlockInfo,
        context: &C,
    ) -> Result<Option<String>, HandlerError>;
}

/// A side effect keyed to one action type.
///
/// Effects are fire-and-forget: they return nothing, and any error behavior
/// is their own responsibility. They are skipped entirely during replay.
#[async_trait]
pub trait Effect<C>: Send + Sync {
    /// The action type this effect processes.
    fn action_type(&self) -> &str;

    /// When `true`, the run is queued until the block becomes irreversible,
    /// and discarded if a rollback removes the block first.
    fn defer_until_irreversible(&self) -> bool {
        false
    }

    async fn run(&self, payload: &Value, block: &Block, context: &C);
}

/// A named set of processing rules: updaters and effects in declaration
/// order.
pub struct HandlerVersion<S, C> {
    pub version_name: String,
    pub updaters: Vec<Arc<dyn Updater<S, C>>>,
    pub effects: Vec<Arc<dyn Effect<C>>>,
}

impl<S, C> HandlerVersion<S, C> {
    pub fn new(version_name: impl Into<String>) -> Self {
        Self {
            version_name: version_name.into(),
            updaters: Vec::new(),
            effects: Vec::new(),
        }
    }

    /// Append an updater (declaration order is execution order).
    pub fn updater(mut self, updater: Arc<dyn Updater<S, C>>) -> Self {
        self.updaters.push(updater);
        self
    }

    /// Append an effect (declaration order is execution order).
    pub fn effect(mut self, effect: Arc<dyn Effect<C>>) -> Self {
        self.effects.push(effect);
        self
    }
}

/// Validated registry of handler versions.
///
/// The starting version is `"v1"` when registered, otherwise the first
/// version supplied.
pub struct VersionRegistry<S, C> {
    versions: HashMap<String, HandlerVersion<S, C>>,
    start_version: String,
}

impl<S, C> VersionRegistry<S, C> {
    pub fn new(versions: Vec<HandlerVersion<S, C>>) -> Result<Self, HandlerError> {
        let first_version = match versions.first() {
            Some(version) => version.version_name.clone(),
            None => return Err(HandlerError::NoHandlerVersions),
        };

        let mut map = HashMap::with_capacity(versions.len());
        for version in versions {
            let name = version.version_name.clone();
            if map.insert(name.clone(), version).is_some() {
                return Err(HandlerError::DuplicateVersion(name));
            }
        }

        let start_version = if map.contains_key("v1") {
            if first_version != "v1" {
                tracing::warn!(
                    first = %first_version,
                    "Handler version 'v1' is registered but not first; starting with 'v1' anyway"
                );
            }
            "v1".to_string()
        } else {
            tracing::warn!(
                default = %first_version,
                "No handler version named 'v1'; starting with the first registered version"
            );
            first_version
        };

        Ok(Self {
            versions: map,
            start_version,
        })
    }

    pub fn start_version(&self) -> &str {
        &self.start_version
    }

    pub fn contains(&self, version_name: &str) -> bool {
        self.versions.contains_key(version_name)
    }

    pub fn get(&self, version_name: &str) -> Option<&HandlerVersion<S, C>> {
        self.versions.get(version_name)
    }

    pub fn len(&self) -> usize {
        self.versions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.versions.is_empty()
    }
}
