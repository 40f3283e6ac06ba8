//! Message value types: the received envelope, the broker-owned delivery state
//! mirrored locally, and the lease-bearing handle that exposes the settlement
//! capabilities of one delivery.

pub mod delivery;
pub mod envelope;
pub mod leased;

pub use delivery::{DeliveryState, LockToken, ProcessingOutcome, ReceivedMessage};
pub use envelope::{MessageEnvelope, PropertyValue};
pub use leased::LeasedMessage;
