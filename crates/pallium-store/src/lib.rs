//! # pallium-store
//!
//! Durable state for the turn orchestration core:
//!
//! - [`world_store`]: the single-writer `world_state.json` file with atomic
//!   replace semantics
//! - [`chat_log`]: the append-only `chat_history.jsonl` log
//! - [`memory`]: the remote memory store client (no-op when unconfigured)
//!
//! The controller in `pallium-runtime` is the only writer of the two files;
//! tools observe them read-only through `ToolResources`.

#![deny(unsafe_code)]

pub mod chat_log;
pub mod memory;
pub mod world_store;

use thiserror::Error;

/// Errors raised by the persistence layer.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("memory store error ({status}): {message}")]
    Memory { status: u16, message: String },
}
