use super::envelope::MessageEnvelope;
use std::fmt;
use tokio::time::Instant;

/// Opaque broker handle identifying one locked delivery.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockToken(String);

impl LockToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LockToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Broker-owned delivery metadata, mirrored locally for one delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryState {
    pub delivery_count: u32,
    pub lock_token: LockToken,
    pub locked_until: Instant,
}

impl DeliveryState {
    pub fn new(delivery_count: u32, lock_token: LockToken, locked_until: Instant) -> Self {
        Self {
            delivery_count: delivery_count.max(1),
            lock_token,
            locked_until,
        }
    }

    pub fn is_expired_at(&self, now: Instant) -> bool {
        now >= self.locked_until
    }
}

/// A message as handed over by a source: envelope plus its delivery state.
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    pub envelope: MessageEnvelope,
    pub delivery: DeliveryState,
}

impl ReceivedMessage {
    pub fn new(envelope: MessageEnvelope, delivery: DeliveryState) -> Self {
        Self { envelope, delivery }
    }
}

/// Terminal result assigned to one delivery of a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessingOutcome {
    Completed,
    Abandoned { reason: String },
    DeadLettered { reason: String, detail: String },
}

impl ProcessingOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            ProcessingOutcome::Completed => "completed",
            ProcessingOutcome::Abandoned { .. } => "abandoned",
            ProcessingOutcome::DeadLettered { .. } => "dead_lettered",
        }
    }
}
