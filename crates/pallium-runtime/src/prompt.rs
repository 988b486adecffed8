//! Prompt template loading and token substitution.
//!
//! Templates are UTF-8 files named `<stage>.txt` in the configured prompt
//! directory, loaded on every stage invocation so edits take effect without
//! a restart. Substitution is total: any `<<TOKEN>>` left after rendering is
//! a hard stage error naming the offending tokens.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::OnceLock;

use regex::Regex;

use crate::errors::RuntimeError;

fn token_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"<<[A-Z0-9_]+>>").unwrap())
}

/// Token dictionary for one render.
pub type TokenMap = BTreeMap<&'static str, String>;

/// Loads and renders stage prompt templates.
#[derive(Clone)]
pub struct PromptRenderer {
    prompt_dir: PathBuf,
}

impl PromptRenderer {
    #[must_use]
    pub fn new(prompt_dir: impl Into<PathBuf>) -> Self {
        Self {
            prompt_dir: prompt_dir.into(),
        }
    }

    /// Load `<name>.txt` and substitute every `<<TOKEN>>` from `tokens`.
    pub fn render(&self, name: &str, tokens: &TokenMap) -> Result<String, RuntimeError> {
        let path = self.prompt_dir.join(format!("{name}.txt"));
        let template =
            std::fs::read_to_string(&path).map_err(|source| RuntimeError::PromptUnavailable {
                name: name.to_owned(),
                source,
            })?;

        let mut rendered = template;
        for (key, value) in tokens {
            rendered = rendered.replace(&format!("<<{key}>>"), value);
        }

        let mut leftover: Vec<String> = token_pattern()
            .find_iter(&rendered)
            .map(|m| m.as_str().trim_matches(['<', '>']).to_owned())
            .collect();
        if !leftover.is_empty() {
            leftover.sort();
            leftover.dedup();
            return Err(RuntimeError::UnresolvedTokens { tokens: leftover });
        }
        Ok(rendered)
    }
}
