//! Broker-side plumbing consumed by the processing engine: the source
//! abstraction and its error taxonomy, a transient-retry wrapper, and an
//! in-process broker used by the demo and the test-suite.

pub mod client;
pub mod error;
pub mod memory;
pub mod retry;

pub use client::{BrokerClient, BrokerSource, SourceEntity, SourceFuture};
pub use error::SourceError;
pub use memory::{DeadLetteredMessage, EntityStats, InMemoryBroker, OutgoingMessage};
pub use retry::{RetryingSource, SourceRetryPolicy};
