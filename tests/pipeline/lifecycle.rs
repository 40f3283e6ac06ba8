use std::sync::Arc;
use std::time::Duration;

use crate::support::helpers::{
    broker, init_tracing, order_queue, queue_config, send_order, wait_until, RecordingHandler,
};
use anyhow::Result;
use orderbus::{OrderIngestHandler, Processor, ProcessorError, ProcessorState, SourceError};
use tokio::time::sleep;

#[tokio::test(start_paused = true)]
async fn stop_abandons_orders_still_in_progress() -> Result<()> {
    init_tracing();
    let broker = broker(Duration::from_secs(30));
    send_order(&broker, "order-1")?;
    send_order(&broker, "order-2")?;

    let handler = OrderIngestHandler::new(Duration::from_secs(3_600));
    let mut processor = Processor::new("queue-processor", queue_config(5)?, &broker, Arc::new(handler));

    processor.start().await?;
    let in_flight = processor.in_flight();
    wait_until(Duration::from_secs(10), || in_flight.active() == 2).await?;

    let report = processor.stop(Duration::from_secs(30)).await?;

    assert!(report.drained);
    assert_eq!(report.in_flight_remaining, 0);
    let stats = broker.stats(&order_queue());
    assert_eq!(stats.abandons, 2);
    assert_eq!(stats.completes, 0);
    assert_eq!(broker.pending(&order_queue()), 2);
    assert_eq!(processor.state(), ProcessorState::Stopped);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn stop_deadline_releases_source_with_handlers_in_flight() -> Result<()> {
    init_tracing();
    let broker = broker(Duration::from_secs(30));
    send_order(&broker, "order-stuck")?;

    // Ignores cancellation entirely.
    let handler = RecordingHandler::scripted(|_, _| Some(Duration::from_secs(600)));
    let mut processor = Processor::new("queue-processor", queue_config(1)?, &broker, Arc::new(handler));

    processor.start().await?;
    let in_flight = processor.in_flight();
    wait_until(Duration::from_secs(10), || in_flight.active() == 1).await?;

    let report = processor.stop(Duration::from_secs(1)).await?;

    assert!(!report.drained);
    assert_eq!(report.in_flight_remaining, 1);
    assert_eq!(processor.state(), ProcessorState::Stopped);
    assert_eq!(broker.stats(&order_queue()).completes, 0);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn stopped_processor_receives_nothing() -> Result<()> {
    init_tracing();
    let broker = broker(Duration::from_secs(30));
    let mut processor = Processor::new(
        "queue-processor",
        queue_config(2)?,
        &broker,
        Arc::new(RecordingHandler::succeeding()),
    );

    processor.start().await?;
    send_order(&broker, "order-1")?;
    wait_until(Duration::from_secs(10), || broker.stats(&order_queue()).completes == 1).await?;
    processor.stop(Duration::from_secs(5)).await?;

    send_order(&broker, "order-2")?;
    sleep(Duration::from_secs(5)).await;

    assert_eq!(broker.stats(&order_queue()).received, 1);
    assert_eq!(broker.pending(&order_queue()), 1);

    let err = processor.start().await.unwrap_err();
    assert!(matches!(
        err,
        ProcessorError::SourceUnavailable {
            source: SourceError::Closed,
            ..
        }
    ));
    Ok(())
}
