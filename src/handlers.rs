//! Business handlers bound to the two processors: order ingestion on the
//! queue, status updates on the topic subscription.

pub mod models;
pub mod orders;
pub mod status;

pub use models::{Order, OrderItem, OrderStatusUpdate};
pub use orders::OrderIngestHandler;
pub use status::StatusUpdateHandler;
