pub mod handlers;
pub mod message;
pub mod processor;
pub mod runtime;
pub mod source;
pub mod webhook;

pub use handlers::{Order, OrderIngestHandler, OrderItem, OrderStatusUpdate, StatusUpdateHandler};
pub use message::{LeasedMessage, MessageEnvelope, ProcessingOutcome, PropertyValue};
pub use processor::{
    ErrorHandler, Processor, ProcessorError, ProcessorState, RetryPolicy, SourceErrorEvent,
    StopReport,
};
pub use runtime::config::{EngineSettings, ProcessorConfig, ProcessorConfigBuilder};
pub use runtime::handler::{
    handler_fn, HandlerContext, HandlerError, HandlerErrorKind, HandlerFuture, MessageHandler,
};
pub use runtime::runner::Runner;
pub use runtime::telemetry::{init_tracing, Telemetry, TelemetrySnapshot};
pub use source::{BrokerClient, BrokerSource, InMemoryBroker, SourceEntity, SourceError};
pub use webhook::{NotificationIngestor, NotificationResponse};
