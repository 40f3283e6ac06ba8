use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use orderbus::runtime::handler::HandlerFuture;
use orderbus::source::OutgoingMessage;
use orderbus::{
    HandlerContext, HandlerError, InMemoryBroker, MessageEnvelope, MessageHandler, Order,
    OrderStatusUpdate, ProcessorConfig, SourceEntity,
};
use tokio::time::{sleep, timeout};
use tracing_subscriber::EnvFilter;

pub const ORDER_QUEUE: &str = "order-queue";
pub const STATUS_TOPIC: &str = "order-status-topic";
pub const STATUS_SUBSCRIPTION: &str = "status-processor";

static TRACING_SUBSCRIBER: Lazy<()> = Lazy::new(|| {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
});

pub fn init_tracing() {
    Lazy::force(&TRACING_SUBSCRIBER);
}

pub fn order_queue() -> SourceEntity {
    SourceEntity::queue(ORDER_QUEUE)
}

pub fn status_subscription() -> SourceEntity {
    SourceEntity::subscription(STATUS_TOPIC, STATUS_SUBSCRIPTION)
}

/// Broker with the order queue and the status topic subscription in place.
pub fn broker(lock_duration: Duration) -> InMemoryBroker {
    let broker = InMemoryBroker::new(lock_duration);
    broker.create_queue(ORDER_QUEUE);
    broker.create_topic(STATUS_TOPIC);
    broker.create_subscription(STATUS_TOPIC, STATUS_SUBSCRIPTION);
    broker
}

pub fn queue_config(max_concurrent_handlers: usize) -> Result<ProcessorConfig> {
    ProcessorConfig::builder()
        .queue(ORDER_QUEUE)
        .max_concurrent_handlers(max_concurrent_handlers)
        .receive_wait(Duration::from_millis(200))
        .receive_error_backoff(Duration::from_millis(100))
        .build()
}

pub fn topic_config() -> Result<ProcessorConfig> {
    ProcessorConfig::builder()
        .subscription(STATUS_TOPIC, STATUS_SUBSCRIPTION)
        .receive_wait(Duration::from_millis(200))
        .build()
}

pub fn send_order(broker: &InMemoryBroker, order_id: &str) -> Result<String> {
    let body = serde_json::to_vec(&Order::new(order_id, "Ada Lovelace"))?;
    let message = OutgoingMessage::new(body)
        .with_message_id(format!("msg-{order_id}"))
        .with_subject("OrderCreated");
    Ok(broker.send(&order_queue(), message)?)
}

pub fn publish_status(broker: &InMemoryBroker, order_id: &str, status: &str) -> Result<String> {
    let body = serde_json::to_vec(&OrderStatusUpdate::new(order_id, status))?;
    let message = OutgoingMessage::new(body).with_subject("OrderStatusUpdate");
    Ok(broker.publish(STATUS_TOPIC, message)?)
}

/// Polls `condition` until it holds or `limit` elapses.
pub async fn wait_until<F>(limit: Duration, mut condition: F) -> Result<()>
where
    F: FnMut() -> bool,
{
    timeout(limit, async {
        while !condition() {
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .context("condition was not met in time")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub message_id: String,
    pub delivery_count: u32,
}

type Script = dyn Fn(&MessageEnvelope, u32) -> Option<Duration> + Send + Sync;

/// Records every delivery it sees. The script decides per delivery whether
/// to fail (`None`) or succeed after the returned delay.
pub struct RecordingHandler {
    deliveries: Arc<Mutex<Vec<Delivery>>>,
    script: Box<Script>,
}

impl RecordingHandler {
    pub fn succeeding() -> Self {
        Self::scripted(|_, _| Some(Duration::ZERO))
    }

    pub fn scripted<F>(script: F) -> Self
    where
        F: Fn(&MessageEnvelope, u32) -> Option<Duration> + Send + Sync + 'static,
    {
        Self {
            deliveries: Arc::new(Mutex::new(Vec::new())),
            script: Box::new(script),
        }
    }

    pub fn deliveries(&self) -> Arc<Mutex<Vec<Delivery>>> {
        self.deliveries.clone()
    }
}

impl MessageHandler for RecordingHandler {
    fn handle<'a>(
        &'a self,
        envelope: &'a MessageEnvelope,
        context: HandlerContext,
    ) -> HandlerFuture<'a> {
        Box::pin(async move {
            self.deliveries.lock().unwrap().push(Delivery {
                message_id: envelope.message_id().to_string(),
                delivery_count: context.delivery_count(),
            });

            match (self.script)(envelope, context.delivery_count()) {
                Some(delay) if delay.is_zero() => Ok(()),
                Some(delay) => {
                    sleep(delay).await;
                    Ok(())
                }
                None => Err(HandlerError::msg(format!(
                    "rejected delivery {} of {}",
                    context.delivery_count(),
                    envelope.message_id()
                ))),
            }
        })
    }
}
