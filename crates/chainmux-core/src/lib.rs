//! chainmux-core — fork-aware block ingestion: a reader that sequences and
//! fork-resolves a chain, and a handler that applies versioned updaters and
//! effects against a transactional store.
//!
//! # Architecture
//!
//! ```text
//! SyncLoop
//!   ├── BlockReader       (cursor, hash-chain validation, fork walk-back, prefetch)
//!   │     └── ChainSource        (head / last-irreversible / block fetch)
//!   └── BlockHandler      (versioned updaters + effects, durable index cursor)
//!         ├── VersionRegistry    (named updater/effect bundles)
//!         └── PersistenceBinder  (transactional state seam)
//! ```

pub mod binder;
pub mod error;
pub mod handler;
pub mod reader;
pub mod source;
pub mod sync_loop;
pub mod testing;
pub mod types;
pub mod version;

pub use binder::{PersistenceBinder, StateRunner};
pub use error::{HandlerError, ReaderError, SyncError};
pub use handler::{BlockHandler, HandlerInfo};
pub use reader::{BlockReader, ReaderConfig, ReaderInfo};
pub use source::ChainSource;
pub use sync_loop::{SyncConfig, SyncLoop};
pub use types::{Action, Block, BlockHash, BlockInfo, IndexState, NextBlock};
pub use version::{Effect, HandlerVersion, Updater, VersionRegistry};
