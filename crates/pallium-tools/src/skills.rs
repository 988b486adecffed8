//! Skill bundles and the capability firewall.
//!
//! A *skill* is a curated bundle of tool names. The toolset a stage may use
//! is the union of tools from the skills that are both globally enabled and
//! on that stage's allowlist. Both maps are code-level single sources of
//! truth; the user config can shrink the enabled set but never grow a
//! stage's allowlist.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tracing::debug;

use pallium_core::messages::ToolSchema;

use crate::registry::ToolRegistry;
use crate::traits::Tool;

/// Skill names.
pub const SKILL_CORE_CONTEXT: &str = "core_context";
pub const SKILL_CORE_WORLD: &str = "core_world";
pub const SKILL_MEMORY_READ: &str = "mcp_memory_read";
pub const SKILL_MEMORY_WRITE: &str = "mcp_memory_write";

/// A named bundle of tool names.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Skill {
    pub name: &'static str,
    pub tool_names: &'static [&'static str],
}

/// The statically known skills. Adding a skill means adding it here.
pub const SKILL_CATALOG: &[Skill] = &[
    Skill {
        name: SKILL_CORE_CONTEXT,
        tool_names: &["chat_history_tail"],
    },
    Skill {
        name: SKILL_CORE_WORLD,
        tool_names: &["world_apply_ops"],
    },
    Skill {
        name: SKILL_MEMORY_READ,
        tool_names: &["memory_query"],
    },
    Skill {
        name: SKILL_MEMORY_WRITE,
        tool_names: &["memory_store"],
    },
];

/// Stage → allowed skill names. Stages not listed here get no tools.
pub const STAGE_ALLOWED_SKILLS: &[(&str, &[&str])] = &[
    // Router prefill reads the chat tail and queries memory mechanically.
    ("router", &[SKILL_CORE_CONTEXT, SKILL_MEMORY_READ]),
    // Context builder assembles context from core sources and memory reads.
    ("context_builder", &[SKILL_CORE_CONTEXT, SKILL_MEMORY_READ]),
    // Memory retriever reads memories only.
    ("memory_retriever", &[SKILL_MEMORY_READ]),
    // World modifier gets only world ops.
    ("world_modifier", &[SKILL_CORE_WORLD]),
    // Memory writer writes memories only.
    ("memory_writer", &[SKILL_MEMORY_WRITE]),
];

/// Stages whose tools policy is `loop`; the startup check requires each to
/// end up with a non-empty toolset.
const LOOP_STAGES: &[&str] = &[
    "context_builder",
    "memory_retriever",
    "world_modifier",
    "memory_writer",
];

/// The default enabled skill set.
#[must_use]
pub fn default_enabled_skills() -> BTreeSet<String> {
    SKILL_CATALOG.iter().map(|s| s.name.to_owned()).collect()
}

/// Allowed skills for a stage (empty when unlisted).
#[must_use]
pub fn stage_allowed_skills(stage_id: &str) -> &'static [&'static str] {
    STAGE_ALLOWED_SKILLS
        .iter()
        .find(|(stage, _)| *stage == stage_id)
        .map_or(&[], |(_, skills)| skills)
}

/// Firewall consistency failures detected at startup.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FirewallError {
    #[error("skill '{skill}' references unregistered tool '{tool}'")]
    MissingTool { skill: String, tool: String },

    #[error("unknown enabled skill '{skill}'")]
    UnknownSkill { skill: String },

    #[error("loop stage '{stage}' has no enabled skills")]
    EmptyLoopStage { stage: String },
}

/// The composed toolset for one stage.
#[derive(Clone, Default)]
pub struct ToolSet {
    tools: HashMap<String, Arc<dyn Tool>>,
    schemas: Vec<ToolSchema>,
}

impl ToolSet {
    /// Schemas to send to the provider, sorted by tool name.
    #[must_use]
    pub fn schemas(&self) -> &[ToolSchema] {
        &self.schemas
    }

    /// Look up a tool by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    /// Whether the named tool is in this set.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Whether the set is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Number of tools.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tools.len()
    }
}

/// Assembles per-stage toolsets from the registry, the enabled skill set and
/// the stage policy. Composition is pure, so results are cached.
pub struct Toolkit {
    registry: ToolRegistry,
    enabled: BTreeSet<String>,
    cache: Mutex<HashMap<String, Arc<ToolSet>>>,
}

impl Toolkit {
    /// Build a toolkit and run the startup consistency check.
    pub fn new(registry: ToolRegistry, enabled: BTreeSet<String>) -> Result<Self, FirewallError> {
        for skill_name in &enabled {
            let Some(skill) = SKILL_CATALOG.iter().find(|s| s.name == skill_name) else {
                return Err(FirewallError::UnknownSkill {
                    skill: skill_name.clone(),
                });
            };
            for tool in skill.tool_names {
                if !registry.contains(tool) {
                    return Err(FirewallError::MissingTool {
                        skill: skill_name.clone(),
                        tool: (*tool).to_owned(),
                    });
                }
            }
        }
        for stage in LOOP_STAGES {
            let has_enabled = stage_allowed_skills(stage)
                .iter()
                .any(|s| enabled.contains(*s));
            if !has_enabled {
                return Err(FirewallError::EmptyLoopStage {
                    stage: (*stage).to_owned(),
                });
            }
        }

        Ok(Self {
            registry,
            enabled,
            cache: Mutex::new(HashMap::new()),
        })
    }

    /// The enabled skill names.
    #[must_use]
    pub fn enabled_skills(&self) -> &BTreeSet<String> {
        &self.enabled
    }

    /// Compose (or fetch the cached) toolset for a stage.
    #[must_use]
    pub fn toolset_for_stage(&self, stage_id: &str) -> Arc<ToolSet> {
        if let Some(cached) = self.cache.lock().get(stage_id) {
            return Arc::clone(cached);
        }

        let mut tool_names: BTreeSet<&str> = BTreeSet::new();
        for skill_name in stage_allowed_skills(stage_id) {
            if !self.enabled.contains(*skill_name) {
                continue;
            }
            if let Some(skill) = SKILL_CATALOG.iter().find(|s| s.name == *skill_name) {
                tool_names.extend(skill.tool_names);
            }
        }

        let mut set = ToolSet::default();
        for name in tool_names {
            if let Some(tool) = self.registry.get(name) {
                set.schemas.push(tool.definition());
                let _ = set.tools.insert(name.to_owned(), tool);
            }
        }
        debug!(stage_id, tools = set.len(), "composed stage toolset");

        let set = Arc::new(set);
        let _ = self
            .cache
            .lock()
            .insert(stage_id.to_owned(), Arc::clone(&set));
        set
    }
}
