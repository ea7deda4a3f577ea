//! Reverie — self-improvement engine for an AI roleplay companion.
//!
//! The model inspects conversations and emits structured change-proposals
//! against the app's own knowledge base (memories, characters, lorebooks,
//! personas, settings). This crate stores those proposals, lets a reviewer
//! resolve them one at a time or in batches, applies accepted changes to the
//! right store exactly once, and sweeps up the debris afterwards.

pub mod collections;
pub mod config;
pub mod error;
pub mod facts;
pub mod inbox;
pub mod maintenance;
pub mod proposals;
pub mod reconciler;
pub mod runtime;
pub mod store;

pub use config::EngineConfig;
pub use error::{EngineError, Result};
pub use runtime::EngineRuntime;
