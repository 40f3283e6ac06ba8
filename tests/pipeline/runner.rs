use std::time::Duration;

use crate::support::{
    faulty_source::FaultyClient,
    helpers::{
        broker, init_tracing, order_queue, publish_status, queue_config, send_order,
        status_subscription, topic_config, wait_until,
    },
};
use anyhow::{Context, Result};
use orderbus::runtime::runner::{QUEUE_PROCESSOR_NAME, TOPIC_PROCESSOR_NAME};
use orderbus::{EngineSettings, ProcessorState, Runner};
use tokio::time::{sleep, timeout};

fn settings(with_topic: bool) -> Result<EngineSettings> {
    Ok(EngineSettings {
        broker_namespace: Some("memory".into()),
        queue: Some(queue_config(5)?),
        topic: if with_topic { Some(topic_config()?) } else { None },
        shutdown_timeout: Duration::from_secs(10),
        order_processing_delay: Duration::from_millis(100),
    })
}

#[tokio::test(start_paused = true)]
async fn fatal_error_stops_only_the_affected_processor() -> Result<()> {
    init_tracing();
    let broker = broker(Duration::from_secs(30));
    let client = FaultyClient::new(broker.clone());
    let mut runner = Runner::from_settings(&settings(true)?, &client);
    runner.start().await?;
    let shutdown = runner.cancellation_token();

    let run = tokio::spawn(async move {
        let outcome = runner.run_until_ctrl_c().await;
        (runner, outcome)
    });

    send_order(&broker, "order-1")?;
    publish_status(&broker, "order-1", "Shipped")?;
    wait_until(Duration::from_secs(30), || {
        broker.stats(&order_queue()).completes == 1
            && broker.stats(&status_subscription()).completes == 1
    })
    .await?;

    client.faulty(&order_queue()).revoke();
    sleep(Duration::from_secs(2)).await;

    send_order(&broker, "order-2")?;
    publish_status(&broker, "order-1", "Delivered")?;
    wait_until(Duration::from_secs(30), || {
        broker.stats(&status_subscription()).completes == 2
    })
    .await?;
    sleep(Duration::from_secs(2)).await;
    assert_eq!(broker.pending(&order_queue()), 1, "queue processor kept consuming");

    shutdown.cancel();
    let (runner, outcome) = timeout(Duration::from_secs(30), run)
        .await
        .context("runner should stop after cancellation")??;
    let err = outcome.expect_err("the queue processor abort should be reported");
    assert!(format!("{err:#}").contains(QUEUE_PROCESSOR_NAME), "{err:#}");

    assert_eq!(
        runner.processor(QUEUE_PROCESSOR_NAME).map(|p| p.state()),
        Some(ProcessorState::Stopped)
    );
    assert_eq!(
        runner.processor(TOPIC_PROCESSOR_NAME).map(|p| p.state()),
        Some(ProcessorState::Stopped)
    );
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn runner_fails_once_every_processor_aborted() -> Result<()> {
    init_tracing();
    let broker = broker(Duration::from_secs(30));
    let client = FaultyClient::new(broker.clone());
    let mut runner = Runner::from_settings(&settings(false)?, &client);
    runner.start().await?;

    client.faulty(&order_queue()).revoke();

    let err = timeout(Duration::from_secs(30), runner.run_until_ctrl_c())
        .await
        .context("runner should return when no processor is left")?
        .expect_err("a fatal source error must not end the run cleanly");
    let message = format!("{err:#}");
    assert!(message.contains("aborted"), "{message}");
    assert!(message.contains("unauthorized"), "{message}");
    assert_eq!(runner.processors().len(), 1);
    assert_eq!(runner.processors()[0].state(), ProcessorState::Stopped);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn cancellation_drains_in_flight_orders() -> Result<()> {
    init_tracing();
    let broker = broker(Duration::from_secs(30));
    for index in 0..3 {
        send_order(&broker, &format!("order-{index}"))?;
    }
    let mut runner = Runner::from_settings(&settings(true)?, &broker);
    let shutdown = runner.cancellation_token();

    let run = tokio::spawn(async move { runner.run_until_ctrl_c().await });
    wait_until(Duration::from_secs(30), || {
        broker.stats(&order_queue()).completes == 3
    })
    .await?;
    shutdown.cancel();

    timeout(Duration::from_secs(30), run)
        .await
        .context("runner should stop after cancellation")???;
    Ok(())
}
