//! Broker source abstraction consumed by the dispatcher, and the shared client
//! that hands out one source per messaging entity.

use super::error::SourceError;
use crate::message::{LockToken, ReceivedMessage};
use futures::future::BoxFuture;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

pub type SourceFuture<'a, T> = BoxFuture<'a, Result<T, SourceError>>;

/// Identity of the entity a processor consumes from.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SourceEntity {
    Queue { name: String },
    Subscription { topic: String, subscription: String },
}

impl SourceEntity {
    pub fn queue(name: impl Into<String>) -> Self {
        SourceEntity::Queue { name: name.into() }
    }

    pub fn subscription(topic: impl Into<String>, subscription: impl Into<String>) -> Self {
        SourceEntity::Subscription {
            topic: topic.into(),
            subscription: subscription.into(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            SourceEntity::Queue { .. } => "queue",
            SourceEntity::Subscription { .. } => "subscription",
        }
    }
}

impl fmt::Display for SourceEntity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceEntity::Queue { name } => f.write_str(name),
            SourceEntity::Subscription {
                topic,
                subscription,
            } => write!(f, "{topic}/subscriptions/{subscription}"),
        }
    }
}

/// Peek-lock access to one messaging entity.
///
/// Implementations must be safe to call concurrently from the receive loop and
/// from every in-flight handler task. `receive` must be cancel-safe: dropping
/// the future before it resolves must not lock a message.
pub trait BrokerSource: Send + Sync {
    fn entity(&self) -> &SourceEntity;

    /// Verifies the entity can be consumed from. Called once at processor start.
    fn open(&self) -> SourceFuture<'_, ()>;

    /// Locks and returns the next available message, waiting at most
    /// `max_wait`. `Ok(None)` means nothing arrived in time.
    fn receive(&self, max_wait: Duration) -> SourceFuture<'_, Option<ReceivedMessage>>;

    /// Extends the lock and returns the new expiry.
    fn renew_lock<'a>(&'a self, lock_token: &'a LockToken) -> SourceFuture<'a, Instant>;

    fn complete<'a>(&'a self, lock_token: &'a LockToken) -> SourceFuture<'a, ()>;

    fn abandon<'a>(&'a self, lock_token: &'a LockToken) -> SourceFuture<'a, ()>;

    fn dead_letter<'a>(
        &'a self,
        lock_token: &'a LockToken,
        reason: &'a str,
        detail: &'a str,
    ) -> SourceFuture<'a, ()>;

    /// Releases the connection. Later calls fail with [`SourceError::Closed`].
    fn close(&self) -> SourceFuture<'_, ()>;
}

/// Shared broker connection. Only used as a factory; holds no per-processor
/// state.
pub trait BrokerClient: Send + Sync {
    fn source(&self, entity: &SourceEntity) -> Arc<dyn BrokerSource>;
}
