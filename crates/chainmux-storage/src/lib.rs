//! chainmux-storage — persistence binders for chainmux.
//!
//! Currently ships the in-memory binder; durable backends implement the same
//! [`chainmux_core::PersistenceBinder`] trait.

pub mod memory;

pub use memory::{MemoryBinder, MemoryState};
