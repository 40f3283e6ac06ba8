use crate::handlers::{OrderIngestHandler, StatusUpdateHandler};
use crate::processor::{Processor, ProcessorState};
use crate::runtime::config::EngineSettings;
use crate::runtime::fatal::FatalErrorHandler;
use crate::source::BrokerClient;
use anyhow::{anyhow, Result};
use futures::future::{self, BoxFuture, FutureExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

pub const QUEUE_PROCESSOR_NAME: &str = "queue-processor";
pub const TOPIC_PROCESSOR_NAME: &str = "topic-processor";

/// Hosts the processors of one service and handles OS signals for graceful
/// shutdowns.
///
/// Every processor gets its own child of the runner's shutdown token, so a
/// fatal source error cancels only the processor that hit it.
pub struct Runner {
    processors: Vec<Processor>,
    shutdown: CancellationToken,
    shutdown_timeout: Duration,
}

impl Runner {
    pub fn new(shutdown_timeout: Duration) -> Self {
        Self {
            processors: Vec::new(),
            shutdown: CancellationToken::new(),
            shutdown_timeout,
        }
    }

    /// Builds the order queue processor and the status topic processor from
    /// `settings`. Processors without a configuration are skipped.
    pub fn from_settings(settings: &EngineSettings, client: &dyn BrokerClient) -> Self {
        let mut runner = Self::new(settings.shutdown_timeout);

        match &settings.queue {
            Some(config) => runner.add_processor(Processor::new(
                QUEUE_PROCESSOR_NAME,
                config.clone(),
                client,
                Arc::new(OrderIngestHandler::new(settings.order_processing_delay)),
            )),
            None => info!("queue processor is not configured"),
        }

        match &settings.topic {
            Some(config) => runner.add_processor(Processor::new(
                TOPIC_PROCESSOR_NAME,
                config.clone(),
                client,
                Arc::new(StatusUpdateHandler),
            )),
            None => info!("topic processor is not configured"),
        }

        runner
    }

    pub fn add_processor(&mut self, mut processor: Processor) {
        processor.replace_shutdown_root(self.shutdown.child_token());
        self.processors.push(processor);
    }

    /// Returns a clone of the root shutdown token so external callers can integrate
    /// with their own signal handlers or cancellation strategies.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn shutdown_timeout(&self) -> Duration {
        self.shutdown_timeout
    }

    pub fn processors(&self) -> &[Processor] {
        &self.processors
    }

    pub fn processor(&self, name: &str) -> Option<&Processor> {
        self.processors
            .iter()
            .find(|processor| processor.name() == name)
    }

    /// Starts every stopped processor. A processor whose source cannot be
    /// opened is logged and left stopped; the others start regardless.
    ///
    /// Fails only when processors are registered and none of them is running.
    pub async fn start(&mut self) -> Result<()> {
        for processor in &mut self.processors {
            if processor.state() != ProcessorState::Stopped {
                continue;
            }
            if let Err(err) = processor.start().await {
                error!(
                    processor = %processor.name(),
                    error = %err,
                    "processor failed to start; it stays stopped until the service is restarted"
                );
            }
        }

        if !self.processors.is_empty() && self.running_count() == 0 {
            return Err(anyhow!("no message processor could be started"));
        }
        Ok(())
    }

    /// Stops all processors, each bounded by the shutdown timeout.
    pub async fn stop(&mut self) -> Result<()> {
        self.shutdown.cancel();

        let mut first_error = None;
        for processor in &mut self.processors {
            if let Err(err) = processor.stop(self.shutdown_timeout).await {
                error!(processor = %processor.name(), error = ?err, "processor stopped with an error");
                first_error.get_or_insert(err);
            }
        }

        self.reinitialize_shutdown_token();
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Runs until a Ctrl-C (SIGINT) is received or the shutdown token is cancelled elsewhere.
    ///
    /// A processor that aborts on a fatal source error is stopped on its own
    /// while the remaining processors keep running. The first abort error is
    /// returned once the runner shuts down.
    pub async fn run_until_ctrl_c(&mut self) -> Result<()> {
        self.start().await?;
        info!(
            processors = self.running_count(),
            "runner started; waiting for Ctrl-C (SIGINT) to initiate shutdown"
        );

        let ctrl_c = signal::ctrl_c();
        tokio::pin!(ctrl_c);

        let shutdown = self.shutdown.clone();
        let mut abort_error = None;
        loop {
            let aborted = next_abort(self.running_fatal_handlers());
            let event = tokio::select! {
                _ = &mut ctrl_c => RunnerEvent::CtrlC,
                _ = shutdown.cancelled() => RunnerEvent::Cancelled,
                index = aborted => RunnerEvent::Aborted(index),
            };

            match event {
                RunnerEvent::CtrlC => {
                    info!("Ctrl-C received; shutting down runner");
                    break;
                }
                RunnerEvent::Cancelled => {
                    info!("runner shutdown token cancelled");
                    break;
                }
                RunnerEvent::Aborted(index) => {
                    if let Err(err) = self.stop_aborted(index).await {
                        abort_error.get_or_insert(err);
                    }
                    if self.running_count() == 0 {
                        warn!("no message processor is left running");
                        break;
                    }
                }
            }
        }

        let stopped = self.stop().await;
        match abort_error {
            Some(err) => Err(err),
            None => stopped,
        }
    }

    fn running_count(&self) -> usize {
        self.processors
            .iter()
            .filter(|processor| processor.state() == ProcessorState::Running)
            .count()
    }

    fn running_fatal_handlers(&self) -> Vec<(usize, FatalErrorHandler)> {
        self.processors
            .iter()
            .enumerate()
            .filter(|(_, processor)| processor.state() == ProcessorState::Running)
            .filter_map(|(index, processor)| {
                processor.fatal_handler().map(|handler| (index, handler))
            })
            .collect()
    }

    async fn stop_aborted(&mut self, index: usize) -> Result<()> {
        let Some(processor) = self.processors.get_mut(index) else {
            return Ok(());
        };
        match processor.stop(self.shutdown_timeout).await {
            Ok(_) => {
                warn!(processor = %processor.name(), "processor stopped after abort");
                Ok(())
            }
            Err(err) => {
                error!(
                    processor = %processor.name(),
                    error = ?err,
                    "processor aborted; other processors keep running"
                );
                Err(err)
            }
        }
    }

    fn reinitialize_shutdown_token(&mut self) {
        self.shutdown = CancellationToken::new();
        for processor in &mut self.processors {
            processor.replace_shutdown_root(self.shutdown.child_token());
        }
    }
}

enum RunnerEvent {
    CtrlC,
    Cancelled,
    Aborted(usize),
}

/// Resolves with the index of the first processor whose fatal handler fires.
fn next_abort(handlers: Vec<(usize, FatalErrorHandler)>) -> BoxFuture<'static, usize> {
    if handlers.is_empty() {
        return future::pending().boxed();
    }

    let waits = handlers.into_iter().map(|(index, handler)| {
        async move {
            handler.triggered().await;
            index
        }
        .boxed()
    });
    future::select_all(waits)
        .map(|(index, _, _)| index)
        .boxed()
}
