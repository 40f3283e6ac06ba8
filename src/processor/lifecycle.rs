//! Start/stop state machine owning one dispatcher.
//!
//! `Stopped -> Starting -> Running -> Stopping -> Stopped`. Each processor
//! holds its own shutdown root; a fatal error cancels that root only, so a
//! sibling processor sharing the same broker client keeps running.

use super::dispatcher::{
    Dispatcher, DispatcherParams, ErrorHandler, LogErrors, SourceErrorEvent, SourceOperation,
};
use super::in_flight::InFlightTracker;
use crate::runtime::config::ProcessorConfig;
use crate::runtime::fatal::FatalErrorHandler;
use crate::runtime::handler::MessageHandler;
use crate::runtime::telemetry::{self, Telemetry};
use crate::source::{BrokerClient, BrokerSource, RetryingSource, SourceEntity, SourceError};
use anyhow::{anyhow, Result};
use futures::FutureExt;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessorState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl fmt::Display for ProcessorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ProcessorState::Stopped => "stopped",
            ProcessorState::Starting => "starting",
            ProcessorState::Running => "running",
            ProcessorState::Stopping => "stopping",
        };
        f.write_str(label)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProcessorError {
    #[error("source {entity} is unavailable")]
    SourceUnavailable {
        entity: SourceEntity,
        #[source]
        source: SourceError,
    },

    #[error("processor for {entity} is already {state}")]
    AlreadyRunning {
        entity: SourceEntity,
        state: ProcessorState,
    },
}

/// Result of a graceful stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopReport {
    /// Every in-flight handler reached a terminal outcome before the deadline.
    pub drained: bool,
    /// Handlers still running when the source connection was released.
    pub in_flight_remaining: usize,
}

struct RunningHandles {
    run_token: CancellationToken,
    fatal_handler: FatalErrorHandler,
    dispatcher: JoinHandle<()>,
    metrics: JoinHandle<()>,
}

/// Lifecycle controller for one dispatcher bound to one source.
pub struct Processor {
    name: String,
    config: ProcessorConfig,
    source: Arc<dyn BrokerSource>,
    handler: Arc<dyn MessageHandler>,
    errors: Arc<dyn ErrorHandler>,
    telemetry: Arc<Telemetry>,
    in_flight: Arc<InFlightTracker>,
    state: watch::Sender<ProcessorState>,
    shutdown_root: CancellationToken,
    source_retries: CancellationToken,
    running: Option<RunningHandles>,
}

impl Processor {
    /// Builds a processor consuming from the configured entity of `client`.
    /// Transient source errors are retried per the configured source policy
    /// until the processor aborts or its stop deadline passes.
    pub fn new(
        name: impl Into<String>,
        config: ProcessorConfig,
        client: &dyn BrokerClient,
        handler: Arc<dyn MessageHandler>,
    ) -> Self {
        let source_retries = CancellationToken::new();
        let source: Arc<dyn BrokerSource> = Arc::new(
            RetryingSource::new(client.source(config.entity()), config.source_retry_policy())
                .with_cancellation(source_retries.clone()),
        );
        let mut processor = Self::with_source(name, config, source, handler);
        processor.source_retries = source_retries;
        processor
    }

    /// Builds a processor over an explicit source, used as-is.
    pub fn with_source(
        name: impl Into<String>,
        config: ProcessorConfig,
        source: Arc<dyn BrokerSource>,
        handler: Arc<dyn MessageHandler>,
    ) -> Self {
        let (state, _) = watch::channel(ProcessorState::Stopped);
        Self {
            name: name.into(),
            config,
            source,
            handler,
            errors: Arc::new(LogErrors),
            telemetry: Arc::new(Telemetry::default()),
            in_flight: Arc::new(InFlightTracker::new()),
            state,
            shutdown_root: CancellationToken::new(),
            source_retries: CancellationToken::new(),
            running: None,
        }
    }

    /// Routes source errors to `errors` instead of the default logger.
    pub fn with_error_handler(mut self, errors: Arc<dyn ErrorHandler>) -> Self {
        self.errors = errors;
        self
    }

    /// Uses `token` as this processor's shutdown root.
    pub fn with_cancellation_token(mut self, token: CancellationToken) -> Self {
        self.shutdown_root = token;
        self
    }

    /// Swaps the shutdown root used by the next start.
    pub fn replace_shutdown_root(&mut self, token: CancellationToken) {
        self.shutdown_root = token;
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn entity(&self) -> &SourceEntity {
        self.config.entity()
    }

    pub fn config(&self) -> &ProcessorConfig {
        &self.config
    }

    pub fn state(&self) -> ProcessorState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ProcessorState> {
        self.state.subscribe()
    }

    pub fn telemetry(&self) -> Arc<Telemetry> {
        self.telemetry.clone()
    }

    pub fn in_flight(&self) -> Arc<InFlightTracker> {
        self.in_flight.clone()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.shutdown_root.clone()
    }

    /// Fatal handler of the current run, if the processor was started.
    pub fn fatal_handler(&self) -> Option<FatalErrorHandler> {
        self.running
            .as_ref()
            .map(|running| running.fatal_handler.clone())
    }

    pub fn is_aborted(&self) -> bool {
        self.running
            .as_ref()
            .map(|running| running.fatal_handler.is_triggered())
            .unwrap_or(false)
    }

    /// Opens the source and starts the receive loop. Returns once the loop is
    /// active.
    pub async fn start(&mut self) -> Result<(), ProcessorError> {
        let state = self.state();
        if state != ProcessorState::Stopped {
            return Err(ProcessorError::AlreadyRunning {
                entity: self.entity().clone(),
                state,
            });
        }

        if self.shutdown_root.is_cancelled() {
            self.shutdown_root = CancellationToken::new();
        }

        self.set_state(ProcessorState::Starting);

        if let Err(err) = self.source.open().await {
            self.errors.on_error(&SourceErrorEvent::new(
                self.entity().clone(),
                SourceOperation::Open,
                err.clone(),
            ));
            self.set_state(ProcessorState::Stopped);
            return Err(ProcessorError::SourceUnavailable {
                entity: self.entity().clone(),
                source: err,
            });
        }

        let run_token = self.shutdown_root.child_token();
        let fatal_handler = FatalErrorHandler::new(self.shutdown_root.clone(), run_token.clone());

        let dispatcher = Dispatcher::new(DispatcherParams {
            source: self.source.clone(),
            handler: self.handler.clone(),
            settings: self.config.dispatch_settings(),
            telemetry: self.telemetry.clone(),
            in_flight: self.in_flight.clone(),
            errors: self.errors.clone(),
        });

        let (ready_tx, ready_rx) = oneshot::channel();
        let dispatcher = {
            let run_token = run_token.clone();
            let fatal_handler = fatal_handler.clone();
            let entity = self.entity().clone();
            tokio::spawn(async move {
                let result = AssertUnwindSafe(dispatcher.run(run_token, Some(ready_tx)))
                    .catch_unwind()
                    .await;

                match result {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        fatal_handler.trigger(&entity, err);
                    }
                    Err(_) => {
                        let context = format!("dispatcher for {entity} panicked");
                        fatal_handler.trigger_external(&context, anyhow!(context.clone()));
                    }
                }
            })
        };

        let metrics = telemetry::spawn_metrics_reporter(
            self.entity().to_string(),
            self.telemetry.clone(),
            self.in_flight.clone(),
            run_token.clone(),
            self.config.metrics_interval(),
        );

        self.running = Some(RunningHandles {
            run_token,
            fatal_handler,
            dispatcher,
            metrics,
        });

        if ready_rx.await.is_err() {
            warn!(processor = %self.name, "dispatcher exited before its receive loop started");
        }

        self.set_state(ProcessorState::Running);
        info!(
            processor = %self.name,
            entity = %self.entity(),
            max_concurrent_handlers = self.config.max_concurrent_handlers(),
            "processor running"
        );
        Ok(())
    }

    /// Cancels the receive loop and waits up to `deadline` for in-flight
    /// handlers to settle, then releases the source connection regardless.
    ///
    /// Fails if the processor was aborted by a fatal source error.
    pub async fn stop(&mut self, deadline: Duration) -> Result<StopReport> {
        let Some(mut running) = self.running.take() else {
            self.set_state(ProcessorState::Stopped);
            return Ok(StopReport {
                drained: true,
                in_flight_remaining: 0,
            });
        };

        self.set_state(ProcessorState::Stopping);
        info!(
            processor = %self.name,
            in_flight = self.in_flight.active(),
            deadline_ms = deadline.as_millis() as u64,
            "stopping processor"
        );
        running.run_token.cancel();
        if running.fatal_handler.is_triggered() {
            self.source_retries.cancel();
        }

        let drained = match timeout(deadline, &mut running.dispatcher).await {
            Ok(Ok(())) => true,
            Ok(Err(err)) => {
                warn!(processor = %self.name, error = %err, "dispatcher task failed");
                true
            }
            Err(_) => {
                warn!(
                    processor = %self.name,
                    in_flight = self.in_flight.active(),
                    "shutdown deadline elapsed; releasing source with handlers in flight"
                );
                false
            }
        };

        self.source_retries.cancel();

        if let Err(err) = running.metrics.await {
            warn!(processor = %self.name, error = %err, "metrics reporter task panicked");
        }

        if let Err(err) = self.source.close().await {
            self.errors.on_error(&SourceErrorEvent::new(
                self.entity().clone(),
                SourceOperation::Close,
                err,
            ));
        }

        let report = StopReport {
            drained,
            in_flight_remaining: self.in_flight.active(),
        };
        self.set_state(ProcessorState::Stopped);
        info!(
            processor = %self.name,
            drained = report.drained,
            in_flight_remaining = report.in_flight_remaining,
            "processor stopped"
        );

        if let Some(err) = running.fatal_handler.error() {
            return Err(err.context(format!("processor {} aborted", self.name)));
        }
        Ok(report)
    }

    fn set_state(&self, state: ProcessorState) {
        self.state.send_replace(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageEnvelope;
    use crate::runtime::handler::{handler_fn, HandlerContext, HandlerError};
    use crate::source::{InMemoryBroker, OutgoingMessage};

    fn config() -> ProcessorConfig {
        ProcessorConfig::builder()
            .queue("order-queue")
            .max_concurrent_handlers(2)
            .receive_wait(Duration::from_millis(50))
            .build()
            .unwrap()
    }

    fn ok_handler() -> Arc<dyn MessageHandler> {
        Arc::new(handler_fn(
            |_envelope: MessageEnvelope, _context: HandlerContext| async { Ok(()) },
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn walks_through_states() {
        let broker = InMemoryBroker::default();
        broker.create_queue("order-queue");
        let mut processor = Processor::new("queue-processor", config(), &broker, ok_handler());
        let states = processor.subscribe_state();
        assert_eq!(processor.state(), ProcessorState::Stopped);

        processor.start().await.unwrap();
        assert_eq!(processor.state(), ProcessorState::Running);
        assert!(states.has_changed().unwrap());

        let err = processor.start().await.unwrap_err();
        assert!(matches!(err, ProcessorError::AlreadyRunning { .. }));

        let report = processor.stop(Duration::from_secs(5)).await.unwrap();
        assert!(report.drained);
        assert_eq!(report.in_flight_remaining, 0);
        assert_eq!(processor.state(), ProcessorState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_entity_fails_start() {
        let broker = InMemoryBroker::default();
        let mut processor = Processor::new("queue-processor", config(), &broker, ok_handler());

        let err = processor.start().await.unwrap_err();

        match err {
            ProcessorError::SourceUnavailable { entity, source } => {
                assert_eq!(entity, SourceEntity::queue("order-queue"));
                assert!(source.is_fatal());
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(processor.state(), ProcessorState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_waits_for_in_flight_handlers() {
        let broker = InMemoryBroker::default();
        broker.create_queue("order-queue");
        broker
            .send(&SourceEntity::queue("order-queue"), OutgoingMessage::new("{}"))
            .unwrap();
        let handler = Arc::new(handler_fn(
            |_envelope: MessageEnvelope, _context: HandlerContext| async {
                tokio::time::sleep(Duration::from_secs(2)).await;
                Ok::<(), HandlerError>(())
            },
        ));
        let mut processor = Processor::new("queue-processor", config(), &broker, handler);
        processor.start().await.unwrap();

        while processor.in_flight().active() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let report = processor.stop(Duration::from_secs(10)).await.unwrap();

        assert!(report.drained);
        assert_eq!(
            broker.stats(&SourceEntity::queue("order-queue")).completes,
            1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn stopped_processor_releases_its_source() {
        let broker = InMemoryBroker::default();
        broker.create_queue("order-queue");
        let mut processor = Processor::with_source(
            "queue-processor",
            config(),
            broker.source(&SourceEntity::queue("order-queue")),
            ok_handler(),
        );

        processor.start().await.unwrap();
        processor.stop(Duration::from_secs(1)).await.unwrap();
        let err = processor.start().await.unwrap_err();
        assert!(matches!(
            err,
            ProcessorError::SourceUnavailable {
                source: SourceError::Closed,
                ..
            }
        ));
    }
}
