//! # pallium-tools
//!
//! Tools are the only way stages cause side effects. This crate holds:
//!
//! - [`traits`]: the [`traits::Tool`] trait and the [`traits::ToolResources`]
//!   bundle handlers close over
//! - [`registry`]: the name → tool index
//! - [`skills`]: skill bundles, the stage → skill policy, and toolset
//!   composition (the capability firewall)
//! - [`builtin`]: the four built-in tools
//!
//! A tool for a stage exists only if some enabled skill carries it *and* the
//! stage's allowlist includes that skill. There is no other path.

#![deny(unsafe_code)]

pub mod builtin;
pub mod registry;
pub mod skills;
pub mod traits;

use std::sync::Arc;

use registry::ToolRegistry;
use skills::Toolkit;
use traits::Tool;

/// Build the default registry holding all built-in tools.
#[must_use]
pub fn builtin_registry() -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    let tools: Vec<Arc<dyn Tool>> = vec![
        Arc::new(builtin::chat_history_tail::ChatHistoryTail),
        Arc::new(builtin::memory_query::MemoryQueryTool),
        Arc::new(builtin::memory_store::MemoryStoreTool),
        Arc::new(builtin::world_apply_ops::WorldApplyOps),
    ];
    for tool in tools {
        registry.register(tool);
    }
    registry
}

/// Build a toolkit over the built-in registry with the default enabled
/// skill set, running the startup consistency check.
pub fn builtin_toolkit() -> Result<Toolkit, skills::FirewallError> {
    Toolkit::new(builtin_registry(), skills::default_enabled_skills())
}
