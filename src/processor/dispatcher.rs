//! Concurrent dispatch of received messages to a business handler.
//!
//! The receive loop acquires a concurrency permit before every receive call,
//! so the source is never asked for a message that could not be dispatched.
//! Each received message runs on its own task together with a renewal
//! supervisor; the handler result is resolved to exactly one terminal
//! capability call on the message.

use super::in_flight::{InFlightGuard, InFlightTracker};
use super::policy::{Disposition, RetryPolicy};
use super::renewal::RenewalSupervisor;
use crate::message::{LeasedMessage, ProcessingOutcome, ReceivedMessage};
use crate::runtime::handler::{HandlerContext, HandlerError, MessageHandler};
use crate::runtime::telemetry::Telemetry;
use crate::source::{BrokerSource, SourceEntity, SourceError};
use futures::FutureExt;
use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Broker operation during which a source error was observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceOperation {
    Open,
    Receive,
    RenewLock,
    Complete,
    Abandon,
    DeadLetter,
    Close,
}

impl SourceOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceOperation::Open => "open",
            SourceOperation::Receive => "receive",
            SourceOperation::RenewLock => "renew_lock",
            SourceOperation::Complete => "complete",
            SourceOperation::Abandon => "abandon",
            SourceOperation::DeadLetter => "dead_letter",
            SourceOperation::Close => "close",
        }
    }
}

impl fmt::Display for SourceOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A source error delivered to the error side channel.
#[derive(Debug, Clone)]
pub struct SourceErrorEvent {
    pub entity: SourceEntity,
    pub operation: SourceOperation,
    pub message_id: Option<String>,
    pub correlation_id: Option<String>,
    pub error: SourceError,
}

impl SourceErrorEvent {
    pub fn new(entity: SourceEntity, operation: SourceOperation, error: SourceError) -> Self {
        Self {
            entity,
            operation,
            message_id: None,
            correlation_id: None,
            error,
        }
    }

    pub fn for_message(
        message: &LeasedMessage,
        operation: SourceOperation,
        error: SourceError,
    ) -> Self {
        Self {
            entity: message.entity().clone(),
            operation,
            message_id: Some(message.message_id().to_owned()),
            correlation_id: Some(message.correlation_id().to_owned()),
            error,
        }
    }
}

/// Side channel receiving every source error the engine observes.
///
/// Invoked inline from the receive loop and from message tasks; it must not
/// block.
pub trait ErrorHandler: Send + Sync + 'static {
    fn on_error(&self, event: &SourceErrorEvent);
}

impl<F> ErrorHandler for F
where
    F: Fn(&SourceErrorEvent) + Send + Sync + 'static,
{
    fn on_error(&self, event: &SourceErrorEvent) {
        self(event)
    }
}

/// Default side channel: logs each event at `error`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogErrors;

impl ErrorHandler for LogErrors {
    fn on_error(&self, event: &SourceErrorEvent) {
        error!(
            entity = %event.entity,
            operation = %event.operation,
            message_id = event.message_id.as_deref().unwrap_or(""),
            correlation_id = event.correlation_id.as_deref().unwrap_or(""),
            error = %event.error,
            "source error"
        );
    }
}

/// Dispatch tunables derived from a processor configuration.
#[derive(Debug, Clone)]
pub struct DispatchSettings {
    pub max_concurrent_handlers: usize,
    pub policy: RetryPolicy,
    pub max_lock_renewal: Duration,
    pub receive_wait: Duration,
    pub receive_error_backoff: Duration,
}

pub struct DispatcherParams {
    pub source: Arc<dyn BrokerSource>,
    pub handler: Arc<dyn MessageHandler>,
    pub settings: DispatchSettings,
    pub telemetry: Arc<Telemetry>,
    pub in_flight: Arc<InFlightTracker>,
    pub errors: Arc<dyn ErrorHandler>,
}

/// Receive loop bound to one source.
pub struct Dispatcher {
    shared: Arc<DispatchShared>,
    max_concurrent_handlers: usize,
    receive_wait: Duration,
    receive_error_backoff: Duration,
}

struct DispatchShared {
    source: Arc<dyn BrokerSource>,
    handler: Arc<dyn MessageHandler>,
    policy: RetryPolicy,
    max_lock_renewal: Duration,
    telemetry: Arc<Telemetry>,
    in_flight: Arc<InFlightTracker>,
    errors: Arc<dyn ErrorHandler>,
}

impl Dispatcher {
    pub fn new(params: DispatcherParams) -> Self {
        let DispatcherParams {
            source,
            handler,
            settings,
            telemetry,
            in_flight,
            errors,
        } = params;

        Self {
            shared: Arc::new(DispatchShared {
                source,
                handler,
                policy: settings.policy,
                max_lock_renewal: settings.max_lock_renewal,
                telemetry,
                in_flight,
                errors,
            }),
            max_concurrent_handlers: settings.max_concurrent_handlers.max(1),
            receive_wait: settings.receive_wait,
            receive_error_backoff: settings.receive_error_backoff,
        }
    }

    pub fn entity(&self) -> &SourceEntity {
        self.shared.source.entity()
    }

    /// Runs until `cancellation` fires or the source reports a fatal error,
    /// then waits for every dispatched message to reach a terminal outcome.
    ///
    /// `ready` is signalled once the receive loop is active. Handler failures
    /// never escape; only a fatal source error is returned.
    pub async fn run(
        self,
        cancellation: CancellationToken,
        ready: Option<oneshot::Sender<()>>,
    ) -> Result<(), SourceError> {
        let entity = self.entity().clone();
        let semaphore = Arc::new(Semaphore::new(self.max_concurrent_handlers));
        let mut tasks = JoinSet::new();
        let mut outcome = Ok(());

        info!(
            %entity,
            max_concurrent_handlers = self.max_concurrent_handlers,
            max_delivery_attempts = self.shared.policy.max_attempts(),
            "dispatcher receive loop started"
        );
        if let Some(ready) = ready {
            let _ = ready.send(());
        }

        loop {
            while let Some(joined) = tasks.try_join_next() {
                log_join_result(&entity, joined);
            }

            let permit = tokio::select! {
                biased;
                _ = cancellation.cancelled() => break,
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let received = tokio::select! {
                biased;
                _ = cancellation.cancelled() => break,
                received = self.shared.source.receive(self.receive_wait) => received,
            };

            match received {
                Ok(Some(received)) => {
                    self.shared.telemetry.record_received();
                    let guard = self.shared.in_flight.enter();
                    let shared = self.shared.clone();
                    let handler_cancellation = cancellation.clone();
                    tasks.spawn(async move {
                        shared
                            .process(received, handler_cancellation, permit, guard)
                            .await
                    });
                }
                Ok(None) => {}
                Err(SourceError::Closed) => {
                    warn!(%entity, "source closed underneath the receive loop");
                    break;
                }
                Err(err) => {
                    self.shared.telemetry.record_source_error();
                    self.shared.errors.on_error(&SourceErrorEvent::new(
                        entity.clone(),
                        SourceOperation::Receive,
                        err.clone(),
                    ));

                    if err.is_fatal() {
                        outcome = Err(err);
                        break;
                    }

                    tokio::select! {
                        _ = cancellation.cancelled() => break,
                        _ = tokio::time::sleep(self.receive_error_backoff) => {}
                    }
                }
            }
        }

        let pending = tasks.len();
        if pending > 0 {
            info!(%entity, pending, "receive loop stopped; draining in-flight messages");
        }
        while let Some(joined) = tasks.join_next().await {
            log_join_result(&entity, joined);
        }
        info!(%entity, "dispatcher stopped");

        outcome
    }
}

impl DispatchShared {
    #[tracing::instrument(
        name = "message",
        skip_all,
        fields(
            entity = %self.source.entity(),
            message_id = %received.envelope.message_id(),
            correlation_id = %received.envelope.correlation_id(),
            delivery_count = received.delivery.delivery_count,
        )
    )]
    async fn process(
        &self,
        received: ReceivedMessage,
        cancellation: CancellationToken,
        _permit: OwnedSemaphorePermit,
        _guard: InFlightGuard,
    ) -> Option<ProcessingOutcome> {
        let message = Arc::new(LeasedMessage::new(self.source.clone(), received));
        debug!("message received");

        let renewal = RenewalSupervisor::new(
            message.clone(),
            self.max_lock_renewal,
            self.telemetry.clone(),
            self.errors.clone(),
        )
        .spawn();

        let context = HandlerContext::new(message.delivery_count(), cancellation);
        let result = AssertUnwindSafe(self.handler.handle(message.envelope(), context))
            .catch_unwind()
            .await
            .unwrap_or_else(|payload| Err(HandlerError::panicked(panic_message(payload.as_ref()))));

        let outcome = self.settle(&message, result).await;

        let renewal_exit = renewal.stop().await;
        debug!(renewal = ?renewal_exit, "lock renewal stopped");
        outcome
    }

    /// Resolves the handler result to one terminal call. Returns `None` when
    /// the terminal call failed; the broker then redelivers on its own.
    async fn settle(
        &self,
        message: &LeasedMessage,
        result: Result<(), HandlerError>,
    ) -> Option<ProcessingOutcome> {
        match result {
            Ok(()) => {
                self.terminal(message, SourceOperation::Complete, message.complete().await)?;
                self.telemetry.record_completed();
                info!("message completed");
                Some(ProcessingOutcome::Completed)
            }
            Err(err) if err.is_cancelled() => {
                let reason = err.detail();
                self.terminal(message, SourceOperation::Abandon, message.abandon().await)?;
                self.telemetry.record_abandoned();
                info!(reason = %reason, "handler cancelled; message abandoned");
                Some(ProcessingOutcome::Abandoned { reason })
            }
            Err(err) => {
                self.telemetry.record_handler_error();
                let delivery_count = message.delivery_count();
                match self.policy.decide(&err, delivery_count) {
                    Disposition::Retry => {
                        warn!(
                            error = %err,
                            max_delivery_attempts = self.policy.max_attempts(),
                            "handler failed; abandoning for redelivery"
                        );
                        let reason = err.detail();
                        self.terminal(message, SourceOperation::Abandon, message.abandon().await)?;
                        self.telemetry.record_abandoned();
                        Some(ProcessingOutcome::Abandoned { reason })
                    }
                    Disposition::DeadLetter { reason, detail } => {
                        error!(
                            error = %err,
                            reason = %reason,
                            "handler failed on final attempt; dead-lettering"
                        );
                        self.terminal(
                            message,
                            SourceOperation::DeadLetter,
                            message.dead_letter(&reason, &detail).await,
                        )?;
                        self.telemetry.record_dead_lettered();
                        Some(ProcessingOutcome::DeadLettered { reason, detail })
                    }
                }
            }
        }
    }

    fn terminal(
        &self,
        message: &LeasedMessage,
        operation: SourceOperation,
        result: Result<(), SourceError>,
    ) -> Option<()> {
        let err = match result {
            Ok(()) => return Some(()),
            Err(err) => err,
        };

        if err.is_lock_lost() {
            self.telemetry.record_lock_lost();
            warn!(
                operation = %operation,
                error = %err,
                "lock lost before settlement; leaving message for broker redelivery"
            );
        } else {
            self.telemetry.record_source_error();
            error!(operation = %operation, error = %err, "settlement failed");
        }
        self.errors
            .on_error(&SourceErrorEvent::for_message(message, operation, err));
        None
    }
}

fn log_join_result(
    entity: &SourceEntity,
    joined: Result<Option<ProcessingOutcome>, tokio::task::JoinError>,
) {
    match joined {
        Ok(Some(outcome)) => {
            debug!(%entity, outcome = outcome.label(), "message settled");
        }
        Ok(None) => {}
        Err(err) => {
            error!(%entity, error = %err, "message task failed");
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
