use super::models::Order;
use crate::message::MessageEnvelope;
use crate::runtime::handler::{HandlerContext, HandlerError, HandlerFuture, MessageHandler};
use anyhow::{anyhow, Context};
use std::time::Duration;
use tracing::info;

/// Processes orders arriving on the order queue.
#[derive(Debug, Clone)]
pub struct OrderIngestHandler {
    processing_delay: Duration,
}

impl Default for OrderIngestHandler {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}

impl OrderIngestHandler {
    pub fn new(processing_delay: Duration) -> Self {
        Self { processing_delay }
    }

    pub fn processing_delay(&self) -> Duration {
        self.processing_delay
    }

    async fn process(
        &self,
        envelope: &MessageEnvelope,
        context: HandlerContext,
    ) -> Result<(), HandlerError> {
        let order = decode_order(envelope)?;
        info!(
            order_id = %order.order_id,
            customer = %order.customer_name,
            total_amount = %order.total_amount,
            items = order.items.len(),
            "processing order"
        );

        if !self.processing_delay.is_zero() {
            tokio::select! {
                _ = context.cancellation().cancelled() => return Err(HandlerError::cancelled()),
                _ = tokio::time::sleep(self.processing_delay) => {}
            }
        }

        info!(order_id = %order.order_id, "order processed");
        Ok(())
    }
}

fn decode_order(envelope: &MessageEnvelope) -> Result<Order, HandlerError> {
    let order: Order = serde_json::from_slice(envelope.body())
        .with_context(|| format!("message {} does not carry an order", envelope.message_id()))?;
    if order.order_id.trim().is_empty() {
        return Err(anyhow!("order in message {} has no OrderId", envelope.message_id()).into());
    }
    Ok(order)
}

impl MessageHandler for OrderIngestHandler {
    fn handle<'a>(
        &'a self,
        envelope: &'a MessageEnvelope,
        context: HandlerContext,
    ) -> HandlerFuture<'a> {
        Box::pin(self.process(envelope, context))
    }
}
