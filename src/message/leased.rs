//! Lease-bearing message handle.
//!
//! A `LeasedMessage` wraps one delivery and exposes the four broker
//! capabilities for it. The settlement flag is message-scoped and shared with
//! the renewal supervisor through [`LeasedMessage::settlement_token`]; it is
//! raised before the terminal broker call is issued, so at most one terminal
//! call is ever made per delivery and no renewal is attempted afterwards.

use super::delivery::{LockToken, ReceivedMessage};
use super::envelope::MessageEnvelope;
use crate::source::{BrokerSource, SourceEntity, SourceError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

pub struct LeasedMessage {
    source: Arc<dyn BrokerSource>,
    envelope: MessageEnvelope,
    delivery_count: u32,
    lock_token: LockToken,
    locked_until: Mutex<Instant>,
    settling: AtomicBool,
    settled: CancellationToken,
}

impl LeasedMessage {
    pub fn new(source: Arc<dyn BrokerSource>, received: ReceivedMessage) -> Self {
        let ReceivedMessage { envelope, delivery } = received;
        Self {
            source,
            envelope,
            delivery_count: delivery.delivery_count,
            lock_token: delivery.lock_token,
            locked_until: Mutex::new(delivery.locked_until),
            settling: AtomicBool::new(false),
            settled: CancellationToken::new(),
        }
    }

    pub fn entity(&self) -> &SourceEntity {
        self.source.entity()
    }

    pub fn envelope(&self) -> &MessageEnvelope {
        &self.envelope
    }

    pub fn message_id(&self) -> &str {
        self.envelope.message_id()
    }

    pub fn correlation_id(&self) -> &str {
        self.envelope.correlation_id()
    }

    pub fn delivery_count(&self) -> u32 {
        self.delivery_count
    }

    pub fn lock_token(&self) -> &LockToken {
        &self.lock_token
    }

    /// Local view of the lock expiry, updated by every successful renewal.
    pub fn locked_until(&self) -> Instant {
        *self
            .locked_until
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_lock_expired(&self) -> bool {
        Instant::now() >= self.locked_until()
    }

    /// True once a terminal capability has been invoked (whatever its result).
    pub fn is_settled(&self) -> bool {
        self.settling.load(Ordering::SeqCst)
    }

    /// Token cancelled when the delivery reaches a terminal outcome.
    pub fn settlement_token(&self) -> CancellationToken {
        self.settled.clone()
    }

    pub async fn complete(&self) -> Result<(), SourceError> {
        self.begin_settlement()?;
        self.source.complete(&self.lock_token).await
    }

    pub async fn abandon(&self) -> Result<(), SourceError> {
        self.begin_settlement()?;
        self.source.abandon(&self.lock_token).await
    }

    pub async fn dead_letter(&self, reason: &str, detail: &str) -> Result<(), SourceError> {
        self.begin_settlement()?;
        self.source
            .dead_letter(&self.lock_token, reason, detail)
            .await
    }

    /// Extends the lock. Valid repeatedly until a terminal capability runs.
    pub async fn renew_lock(&self) -> Result<Instant, SourceError> {
        if self.is_settled() {
            return Err(self.already_settled());
        }
        if self.is_lock_expired() {
            return Err(self.lock_lost());
        }

        let renewed = self.source.renew_lock(&self.lock_token).await?;
        let mut locked_until = self
            .locked_until
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if renewed > *locked_until {
            *locked_until = renewed;
        }
        Ok(renewed)
    }

    /// Marks the delivery as settled before any terminal broker call is made.
    ///
    /// A delivery whose lock already expired is marked settled as well: the
    /// engine takes no further action on it and leaves redelivery to the broker.
    fn begin_settlement(&self) -> Result<(), SourceError> {
        if self.settling.swap(true, Ordering::SeqCst) {
            return Err(self.already_settled());
        }
        self.settled.cancel();

        if self.is_lock_expired() {
            return Err(self.lock_lost());
        }
        Ok(())
    }

    fn already_settled(&self) -> SourceError {
        SourceError::NotFound {
            lock_token: self.lock_token.clone(),
        }
    }

    fn lock_lost(&self) -> SourceError {
        SourceError::LockLost {
            lock_token: self.lock_token.clone(),
        }
    }
}

impl std::fmt::Debug for LeasedMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeasedMessage")
            .field("entity", self.source.entity())
            .field("message_id", &self.envelope.message_id())
            .field("correlation_id", &self.envelope.correlation_id())
            .field("delivery_count", &self.delivery_count)
            .field("lock_token", &self.lock_token)
            .field("settled", &self.is_settled())
            .finish()
    }
}
