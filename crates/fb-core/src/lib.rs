//! # fb-core
//!
//! Core crate for the brokerage session system, providing:
//!
//! - **Types** (`types`): enums, quotes, order specs, fills, accounts
//! - **Configuration** (`config`): JSON config deserialization
//! - **Error types** (`error`): the session error taxonomy via thiserror
//! - **Gateway capabilities** (`gateway`): traits the broker SDK adapter implements
//! - **Backoff** (`backoff`): bounded exponential retry policy
//! - **Stale filter** (`dedup`): per-instrument latest-timestamp filter
//! - **Time utilities** (`time_util`): wall-clock timestamps
//! - **Logging** (`logging`): tracing-based structured logging

pub mod backoff;
pub mod config;
pub mod dedup;
pub mod error;
pub mod gateway;
pub mod logging;
pub mod time_util;
pub mod types;

pub use error::{FbError, Result};
// Re-export types at crate root for convenience.
pub use types::*;
