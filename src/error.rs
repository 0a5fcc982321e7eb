//! Error taxonomy for the orchestration core.
//!
//! Every failure class the supervisor can recover from gets its own variant,
//! so recovery strategy selection is a `match`, not string inspection.
//! Nothing here is allowed to cross the HTTP boundary unhandled except
//! `Internal`, which maps to a 500.

use thiserror::Error;

/// Core error kinds.
#[derive(Debug, Error)]
pub enum AgentError {
    /// Oracle output did not match the expected tool-call grammar.
    #[error("unparseable tool call: {0}")]
    Parse(String),

    /// A call named a tool that is absent from the working registry.
    #[error("tool '{0}' is not in the working registry")]
    UnknownTool(String),

    /// A tool raised during execution.
    #[error("tool '{name}' failed: {message}")]
    Capability { name: String, message: String },

    /// Transient oracle or embedding transport failure. Retried by the
    /// reflection path that observes it, never swallowed.
    #[error("oracle request failed: {0}")]
    Oracle(String),

    /// A pending cache batch contained a vector of the wrong dimension.
    /// The flush fails closed and the buffer is preserved.
    #[error("embedding dimension mismatch: expected {expected}, got {got}")]
    StaleCacheDimension { expected: usize, got: usize },

    /// A reflection or step budget ran out. The query has no answer but the
    /// session stays usable.
    #[error("budget exhausted: {0}")]
    BudgetExhausted(String),

    /// Tool registration rejected (duplicate name, empty description).
    #[error("invalid tool: {0}")]
    InvalidTool(String),

    /// Caller misuse at the session boundary (unknown session, missing
    /// document, clarification state mismatch).
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Truly unexpected condition (malformed persisted artifacts and the
    /// like). Logged and surfaced as a distinct kind, never retried.
    #[error("internal error: {0}")]
    Internal(String),
}

impl AgentError {
    /// Shorthand for a tool execution failure.
    pub fn capability(name: &str, message: impl Into<String>) -> Self {
        Self::Capability {
            name: name.to_string(),
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }
}

/// Result alias used throughout the core.
pub type Result<T, E = AgentError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_includes_context() {
        let err = AgentError::UnknownTool("frobnicate".to_string());
        assert!(err.to_string().contains("frobnicate"));

        let err = AgentError::StaleCacheDimension {
            expected: 8,
            got: 5,
        };
        assert!(err.to_string().contains("expected 8"));
        assert!(err.to_string().contains("got 5"));
    }

    #[test]
    fn test_capability_shorthand() {
        let err = AgentError::capability("web_search", "connection reset");
        match err {
            AgentError::Capability { name, message } => {
                assert_eq!(name, "web_search");
                assert_eq!(message, "connection reset");
            }
            _ => panic!("wrong variant"),
        }
    }
}
