//! Runtime error kinds.
//!
//! Stage-level failures become issues on the turn and reroute to the answer
//! stage; only transport exhaustion in the answer stage, cancellation, the
//! turn deadline, or a failed durable commit terminate a turn early.

use thiserror::Error;

use pallium_llm::provider::ProviderError;
use pallium_store::StoreError;
use pallium_tools::skills::FirewallError;

/// Errors raised inside the orchestration core.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// A rendered template still contained `<<TOKEN>>` placeholders.
    #[error("unresolved prompt tokens: {tokens:?}")]
    UnresolvedTokens { tokens: Vec<String> },

    /// Prompt file missing or unreadable.
    #[error("prompt '{name}' unavailable: {source}")]
    PromptUnavailable {
        name: String,
        #[source]
        source: std::io::Error,
    },

    /// No model configured for a role key.
    #[error("no model configured for role '{0}'")]
    MissingRole(String),

    /// Structured model output could not be parsed.
    #[error("output parse failed: {0}")]
    Parse(String),

    /// Provider transport failure that survived the retry budget.
    #[error(transparent)]
    Provider(#[from] ProviderError),

    /// Persistence failure.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Capability firewall misconfiguration detected at startup.
    #[error(transparent)]
    Firewall(#[from] FirewallError),

    /// A turn is already running for this namespace.
    #[error("turn already active for namespace '{0}'")]
    TurnBusy(String),

    /// The turn's cancel signal fired.
    #[error("turn cancelled")]
    Cancelled,

    /// Invariant violation inside the executor.
    #[error("internal: {0}")]
    Internal(String),

    /// The turn-wide deadline fired.
    #[error("turn deadline exceeded")]
    Deadline,
}

impl RuntimeError {
    /// Whether this error is the cooperative cancel signal.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled | Self::Provider(ProviderError::Cancelled))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancelled_detection() {
        assert!(RuntimeError::Cancelled.is_cancelled());
        assert!(RuntimeError::Provider(ProviderError::Cancelled).is_cancelled());
        assert!(!RuntimeError::Deadline.is_cancelled());
    }

    #[test]
    fn display_names_tokens() {
        let err = RuntimeError::UnresolvedTokens {
            tokens: vec!["WORLD_JSON".into()],
        };
        assert!(err.to_string().contains("WORLD_JSON"));
    }
}
