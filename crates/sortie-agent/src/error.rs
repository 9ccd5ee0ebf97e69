//! Error types for sortie-agent

use thiserror::Error;

/// Result type alias using sortie-agent Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while dispatching conversations
#[derive(Error, Debug)]
pub enum Error {
    /// An error from the AI provider layer
    #[error(transparent)]
    Ai(#[from] sortie_ai::Error),

    /// A malformed request, rejected before any conversation is registered
    #[error("Invalid request: {0}")]
    Validation(String),

    /// Instruction assembly or selection failed
    #[error("Instructions unavailable: {0}")]
    Instructions(String),

    /// The in-flight call was abandoned because the conversation was cancelled
    #[error("Conversation cancelled")]
    Cancelled,

    /// A generic agent error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Whether this error came from a cancellation rather than a failure
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Error::Cancelled | Error::Ai(sortie_ai::Error::Aborted))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_cancellation() {
        assert!(Error::Cancelled.is_cancellation());
        assert!(Error::Ai(sortie_ai::Error::Aborted).is_cancellation());
        assert!(!Error::Ai(sortie_ai::Error::InvalidApiKey).is_cancellation());
        assert!(!Error::Validation("x".into()).is_cancellation());
    }

    #[test]
    fn test_ai_error_is_transparent() {
        let err = Error::from(sortie_ai::Error::api("overloaded_error", "busy"));
        assert_eq!(err.to_string(), "API error: busy (type: overloaded_error)");
    }
}
