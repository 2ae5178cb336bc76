//! Errors raised by pure row logic: parsing, validation and transitions.

use thiserror::Error;

pub type DomainResult<T> = Result<T, DomainError>;

/// A deterministic failure of row logic.
///
/// Storage and handler failures have their own error types in the engine;
/// anything here would fail again on retry with the same input.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// Malformed input: a bad status string, an unparsable recurrence rule,
    /// an unpublish time before the publish time.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The row is not in a state the requested change can start from.
    #[error("invalid transition: {0}")]
    InvalidTransition(String),

    #[error("invalid identifier: {0}")]
    InvalidId(String),
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invalid_transition(msg: impl Into<String>) -> Self {
        Self::InvalidTransition(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    /// Whether the failure comes from the caller's input rather than the
    /// row's current state.
    pub fn is_input_error(&self) -> bool {
        !matches!(self, Self::InvalidTransition(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transition_errors_are_not_input_errors() {
        assert!(DomainError::validation("x").is_input_error());
        assert!(DomainError::invalid_id("x").is_input_error());
        assert!(!DomainError::invalid_transition("x").is_input_error());
        assert_eq!(
            DomainError::invalid_transition("already published").to_string(),
            "invalid transition: already published"
        );
    }
}
