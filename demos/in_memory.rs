use std::time::Duration;

use anyhow::{bail, Result};
use orderbus::runtime::config::{DEFAULT_QUEUE_NAME, DEFAULT_SUBSCRIPTION_NAME, DEFAULT_TOPIC_NAME};
use orderbus::source::OutgoingMessage;
use orderbus::{
    init_tracing, EngineSettings, InMemoryBroker, Order, OrderItem, OrderStatusUpdate,
    ProcessorConfig, Runner, SourceEntity,
};
use rust_decimal::Decimal;
use tokio::time::{sleep, Instant};
use tracing::info;

const LOCK_DURATION: Duration = Duration::from_secs(30);
const SETTLE_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let broker = InMemoryBroker::new(LOCK_DURATION);
    broker.create_queue(DEFAULT_QUEUE_NAME);
    broker.create_topic(DEFAULT_TOPIC_NAME);
    broker.create_subscription(DEFAULT_TOPIC_NAME, DEFAULT_SUBSCRIPTION_NAME);

    let settings = EngineSettings {
        broker_namespace: Some("in-memory".into()),
        queue: Some(
            ProcessorConfig::builder()
                .queue(DEFAULT_QUEUE_NAME)
                .metrics_interval(Duration::from_secs(2))
                .build()?,
        ),
        topic: Some(
            ProcessorConfig::builder()
                .subscription(DEFAULT_TOPIC_NAME, DEFAULT_SUBSCRIPTION_NAME)
                .metrics_interval(Duration::from_secs(2))
                .build()?,
        ),
        shutdown_timeout: Duration::from_secs(10),
        order_processing_delay: Duration::from_millis(250),
    };

    let mut runner = Runner::from_settings(&settings, &broker);
    runner.start().await?;

    let queue = SourceEntity::queue(DEFAULT_QUEUE_NAME);
    let subscription = SourceEntity::subscription(DEFAULT_TOPIC_NAME, DEFAULT_SUBSCRIPTION_NAME);

    for (index, customer) in ["Ada Lovelace", "Grace Hopper", "Edsger Dijkstra"]
        .into_iter()
        .enumerate()
    {
        let order_id = format!("ORD-{:04}", index + 1);
        let order = Order::new(&order_id, customer).with_item(OrderItem {
            product_id: format!("SKU-{}", 100 + index),
            product_name: "Mechanical keyboard".into(),
            quantity: index as u32 + 1,
            price: Decimal::new(8_999, 2),
        });
        broker.send(
            &queue,
            OutgoingMessage::new(serde_json::to_vec(&order)?).with_subject("OrderCreated"),
        )?;
        broker.publish(
            DEFAULT_TOPIC_NAME,
            OutgoingMessage::new(serde_json::to_vec(&OrderStatusUpdate::new(&order_id, "Shipped"))?)
                .with_subject("OrderStatusUpdate"),
        )?;
    }

    broker.send(
        &queue,
        OutgoingMessage::new("{\"CustomerName\": \"nobody\"}")
            .with_message_id("poison-order")
            .with_subject("OrderCreated"),
    )?;

    let started = Instant::now();
    loop {
        let orders = broker.stats(&queue);
        let updates = broker.stats(&subscription);
        if orders.completes == 3 && orders.dead_letters == 1 && updates.completes == 3 {
            break;
        }
        if started.elapsed() > SETTLE_TIMEOUT {
            runner.stop().await?;
            bail!("messages did not settle within {SETTLE_TIMEOUT:?}");
        }
        sleep(Duration::from_millis(100)).await;
    }

    for dead in broker.dead_letters(&queue) {
        info!(
            message_id = %dead.message_id,
            reason = %dead.reason,
            detail = %dead.detail,
            delivery_count = dead.delivery_count,
            "dead-lettered"
        );
    }

    runner.stop().await?;

    for processor in runner.processors() {
        let snapshot = processor.telemetry().snapshot();
        info!(
            processor = processor.name(),
            completed = snapshot.completed,
            abandoned = snapshot.abandoned,
            dead_lettered = snapshot.dead_lettered,
            "processor summary"
        );
    }
    Ok(())
}
