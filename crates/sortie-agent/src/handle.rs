//! A cloneable handle for cancelling a conversation from external code.

use tokio_util::sync::CancellationToken;

/// Cancellation capability for one conversation.
///
/// Cloning is cheap; every clone observes the same token. Firing it aborts
/// the in-flight LM or tool call, and the engine finalizes the conversation
/// as cancelled at its next checkpoint.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    token: CancellationToken,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// The underlying token, for passing into provider and tool calls
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Resolves once cancellation has been requested
    pub async fn cancelled(&self) {
        self.token.cancelled().await;
    }
}
