//! Built-in tools.

pub mod chat_history_tail;
pub mod memory_query;
pub mod memory_store;
pub mod world_apply_ops;
