use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::support::{
    faulty_source::FaultyClient,
    helpers::{
        broker, init_tracing, order_queue, queue_config, send_order, wait_until, Delivery,
        RecordingHandler,
    },
};
use anyhow::Result;
use orderbus::processor::SourceOperation;
use orderbus::source::OutgoingMessage;
use orderbus::{OrderIngestHandler, Processor, ProcessorConfig, SourceErrorEvent};
use tokio::time::sleep;

const SHUTDOWN: Duration = Duration::from_secs(30);

#[tokio::test(start_paused = true)]
async fn every_delivery_gets_exactly_one_terminal_call() -> Result<()> {
    init_tracing();
    let broker = broker(Duration::from_secs(30));
    for index in 0..20 {
        send_order(&broker, &format!("order-{index}"))?;
    }

    let client = FaultyClient::new(broker.clone());
    let handler = RecordingHandler::scripted(|envelope, delivery_count| {
        let odd = envelope
            .message_id()
            .ends_with(|c: char| matches!(c, '1' | '3' | '5' | '7' | '9'));
        if odd && delivery_count == 1 {
            None
        } else {
            Some(Duration::from_millis(50))
        }
    });
    let mut processor = Processor::new("queue-processor", queue_config(4)?, &client, Arc::new(handler));

    processor.start().await?;
    wait_until(Duration::from_secs(60), || broker.stats(&order_queue()).completes == 20).await?;
    processor.stop(SHUTDOWN).await?;

    let audit = client.faulty(&order_queue());
    let terminal_calls = audit.terminal_calls();
    assert_eq!(terminal_calls.len(), 30, "20 first deliveries plus 10 redeliveries");
    assert!(terminal_calls.values().all(|&calls| calls == 1));
    assert_eq!(audit.renewals_after_terminal(), 0);

    let stats = broker.stats(&order_queue());
    assert_eq!(stats.abandons, 10);
    assert_eq!(stats.dead_letters, 0);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn concurrency_bound_holds_under_backlog() -> Result<()> {
    init_tracing();
    let broker = broker(Duration::from_secs(30));
    for index in 0..25 {
        send_order(&broker, &format!("order-{index}"))?;
    }

    let config = ProcessorConfig::builder()
        .queue("order-queue")
        .receive_wait(Duration::from_millis(200))
        .build()?;
    let handler = OrderIngestHandler::new(Duration::from_secs(1));
    let mut processor = Processor::new("queue-processor", config, &broker, Arc::new(handler));

    processor.start().await?;
    wait_until(Duration::from_secs(60), || broker.stats(&order_queue()).completes == 25).await?;
    processor.stop(SHUTDOWN).await?;

    assert_eq!(processor.in_flight().peak(), 5);
    assert_eq!(processor.telemetry().snapshot().completed, 25);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn poison_message_is_dead_lettered_on_third_delivery() -> Result<()> {
    init_tracing();
    let broker = broker(Duration::from_secs(30));
    broker.send(
        &order_queue(),
        OutgoingMessage::new("definitely not json").with_message_id("poison"),
    )?;
    send_order(&broker, "order-1")?;

    let handler = OrderIngestHandler::new(Duration::ZERO);
    let mut processor = Processor::new("queue-processor", queue_config(2)?, &broker, Arc::new(handler));

    processor.start().await?;
    wait_until(Duration::from_secs(60), || {
        let stats = broker.stats(&order_queue());
        stats.dead_letters == 1 && stats.completes == 1
    })
    .await?;
    processor.stop(SHUTDOWN).await?;

    let stats = broker.stats(&order_queue());
    assert_eq!(stats.abandons, 2);

    let dead = broker.dead_letters(&order_queue());
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].message_id, "poison");
    assert_eq!(dead[0].reason, "MaxDeliveryCountExceeded");
    assert_eq!(dead[0].delivery_count, 3);
    assert!(
        dead[0].detail.contains("does not carry an order"),
        "unexpected detail: {}",
        dead[0].detail
    );

    let snapshot = processor.telemetry().snapshot();
    assert_eq!(snapshot.handler_errors, 3);
    assert_eq!(snapshot.dead_lettered, 1);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn redelivery_increments_delivery_count() -> Result<()> {
    init_tracing();
    let broker = broker(Duration::from_secs(30));
    send_order(&broker, "order-7")?;

    let handler = RecordingHandler::scripted(|_, delivery_count| {
        (delivery_count >= 2).then_some(Duration::ZERO)
    });
    let deliveries = handler.deliveries();
    let mut processor = Processor::new("queue-processor", queue_config(1)?, &broker, Arc::new(handler));

    processor.start().await?;
    wait_until(Duration::from_secs(60), || broker.stats(&order_queue()).completes == 1).await?;
    processor.stop(SHUTDOWN).await?;

    let seen = deliveries.lock().unwrap().clone();
    assert_eq!(
        seen,
        vec![
            Delivery {
                message_id: "msg-order-7".into(),
                delivery_count: 1
            },
            Delivery {
                message_id: "msg-order-7".into(),
                delivery_count: 2
            },
        ]
    );
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn lapsed_lock_leaves_redelivery_to_the_broker() -> Result<()> {
    init_tracing();
    let broker = broker(Duration::from_secs(10));
    send_order(&broker, "order-slow")?;

    let config = ProcessorConfig::builder()
        .queue("order-queue")
        .max_concurrent_handlers(1)
        .max_lock_renewal(Duration::ZERO)
        .receive_wait(Duration::from_millis(200))
        .build()?;
    let handler = RecordingHandler::scripted(|_, delivery_count| {
        Some(if delivery_count == 1 {
            Duration::from_secs(30)
        } else {
            Duration::ZERO
        })
    });
    let deliveries = handler.deliveries();
    let events = Arc::new(Mutex::new(Vec::new()));
    let mut processor = Processor::new("queue-processor", config, &broker, Arc::new(handler))
        .with_error_handler(Arc::new({
            let events = events.clone();
            move |event: &SourceErrorEvent| events.lock().unwrap().push(event.clone())
        }));

    processor.start().await?;
    wait_until(Duration::from_secs(120), || broker.stats(&order_queue()).completes == 1).await?;
    processor.stop(SHUTDOWN).await?;

    let stats = broker.stats(&order_queue());
    assert_eq!(stats.abandons, 0);
    assert_eq!(stats.dead_letters, 0);
    assert_eq!(stats.renewals, 0);
    assert!(stats.lock_expirations >= 1);
    assert_eq!(deliveries.lock().unwrap().len(), 2);
    assert_eq!(processor.telemetry().snapshot().lock_lost, 1);

    let events = events.lock().unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].operation, SourceOperation::Complete);
    assert!(events[0].error.is_lock_lost());
    assert_eq!(events[0].message_id.as_deref(), Some("msg-order-slow"));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn long_handlers_keep_their_lease() -> Result<()> {
    init_tracing();
    let broker = broker(Duration::from_secs(10));
    send_order(&broker, "order-long")?;

    let client = FaultyClient::new(broker.clone());
    let handler = RecordingHandler::scripted(|_, _| Some(Duration::from_secs(45)));
    let deliveries = handler.deliveries();
    let mut processor = Processor::new("queue-processor", queue_config(1)?, &client, Arc::new(handler));

    processor.start().await?;
    wait_until(Duration::from_secs(120), || broker.stats(&order_queue()).completes == 1).await?;
    sleep(Duration::from_secs(60)).await;
    processor.stop(SHUTDOWN).await?;

    let stats = broker.stats(&order_queue());
    assert!(stats.renewals >= 4, "expected renewals, got {}", stats.renewals);
    assert_eq!(stats.lock_expirations, 0);
    assert_eq!(deliveries.lock().unwrap().len(), 1);
    assert_eq!(client.faulty(&order_queue()).renewals_after_terminal(), 0);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn transient_receive_errors_are_absorbed() -> Result<()> {
    init_tracing();
    let broker = broker(Duration::from_secs(30));
    send_order(&broker, "order-1")?;

    let client = FaultyClient::new(broker.clone());
    // Five failures: the first receive exhausts its three attempts, the
    // second succeeds on its third.
    client.faulty(&order_queue()).fail_next_receives(5);

    let events = Arc::new(Mutex::new(Vec::new()));
    let mut processor = Processor::new(
        "queue-processor",
        queue_config(1)?,
        &client,
        Arc::new(RecordingHandler::succeeding()),
    )
    .with_error_handler(Arc::new({
        let events = events.clone();
        move |event: &SourceErrorEvent| events.lock().unwrap().push(event.clone())
    }));

    processor.start().await?;
    wait_until(Duration::from_secs(60), || broker.stats(&order_queue()).completes == 1).await?;
    processor.stop(SHUTDOWN).await?;

    let events = events.lock().unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].operation, SourceOperation::Receive);
    assert!(events[0].error.is_transient());
    assert_eq!(processor.telemetry().snapshot().source_errors, 1);
    Ok(())
}
