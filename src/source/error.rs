use crate::message::LockToken;

/// Errors reported by a [`BrokerSource`](super::BrokerSource).
///
/// Only `Transient` is retried (by [`RetryingSource`](super::RetryingSource)).
/// `LockLost` and `NotFound` end the current delivery from the engine's point
/// of view; the broker redelivers on its own. `EntityNotFound` and
/// `Unauthorized` are fatal for the processor bound to the entity.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SourceError {
    #[error("transient source error: {0}")]
    Transient(String),

    #[error("lock lost for delivery {lock_token}")]
    LockLost { lock_token: LockToken },

    #[error("delivery {lock_token} is already settled")]
    NotFound { lock_token: LockToken },

    #[error("messaging entity not found: {0}")]
    EntityNotFound(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("source connection closed")]
    Closed,
}

impl SourceError {
    pub fn transient(message: impl Into<String>) -> Self {
        SourceError::Transient(message.into())
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, SourceError::Transient(_))
    }

    pub fn is_lock_lost(&self) -> bool {
        matches!(self, SourceError::LockLost { .. })
    }

    /// Errors after which the processor bound to the entity cannot continue.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SourceError::EntityNotFound(_) | SourceError::Unauthorized(_)
        )
    }
}
