use super::models::OrderStatusUpdate;
use crate::message::MessageEnvelope;
use crate::runtime::handler::{HandlerContext, HandlerError, HandlerFuture, MessageHandler};
use anyhow::{anyhow, Context};
use tracing::info;

/// Applies order status updates published on the order topic.
#[derive(Debug, Default, Clone, Copy)]
pub struct StatusUpdateHandler;

impl StatusUpdateHandler {
    fn apply(envelope: &MessageEnvelope) -> Result<OrderStatusUpdate, HandlerError> {
        let update: OrderStatusUpdate = serde_json::from_slice(envelope.body()).with_context(|| {
            format!(
                "message {} does not carry a status update",
                envelope.message_id()
            )
        })?;
        if update.order_id.trim().is_empty() {
            return Err(anyhow!(
                "status update in message {} has no OrderId",
                envelope.message_id()
            )
            .into());
        }

        info!(
            order_id = %update.order_id,
            status = %update.status,
            subject = envelope.subject().unwrap_or(""),
            "order status updated"
        );
        Ok(update)
    }
}

impl MessageHandler for StatusUpdateHandler {
    fn handle<'a>(
        &'a self,
        envelope: &'a MessageEnvelope,
        _context: HandlerContext,
    ) -> HandlerFuture<'a> {
        Box::pin(async move { Self::apply(envelope).map(|_| ()) })
    }
}
