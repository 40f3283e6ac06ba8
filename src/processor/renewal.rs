//! Per-message lock renewal.
//!
//! The supervisor runs beside the handler and extends the lease when half of
//! the remaining lock time has elapsed. It exits as soon as the message's
//! settlement token fires, so no renewal is issued once a terminal capability
//! has been invoked.

use super::dispatcher::{ErrorHandler, SourceErrorEvent, SourceOperation};
use crate::message::LeasedMessage;
use crate::runtime::telemetry::Telemetry;
use crate::source::SourceError;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn, Instrument};

/// Why a renewal supervisor stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenewalExit {
    /// The message reached a terminal outcome.
    Settled,
    /// Told to stop by the dispatcher, or the source connection was released.
    Stopped,
    /// Another renewal would keep the message alive past the configured cap.
    MaxRenewalExceeded,
    /// The lease lapsed before it could be renewed.
    LockLost,
    /// Renewal is disabled for this processor.
    Disabled,
}

pub struct RenewalSupervisor {
    message: Arc<LeasedMessage>,
    max_duration: Duration,
    telemetry: Arc<Telemetry>,
    errors: Arc<dyn ErrorHandler>,
}

/// Handle to a running supervisor.
pub struct RenewalHandle {
    stop: CancellationToken,
    task: JoinHandle<RenewalExit>,
}

impl RenewalHandle {
    /// Stops the supervisor and waits for it to exit.
    pub async fn stop(self) -> RenewalExit {
        self.stop.cancel();
        match self.task.await {
            Ok(exit) => exit,
            Err(err) => {
                warn!(error = %err, "lock renewal task panicked");
                RenewalExit::Stopped
            }
        }
    }
}

impl RenewalSupervisor {
    pub fn new(
        message: Arc<LeasedMessage>,
        max_duration: Duration,
        telemetry: Arc<Telemetry>,
        errors: Arc<dyn ErrorHandler>,
    ) -> Self {
        Self {
            message,
            max_duration,
            telemetry,
            errors,
        }
    }

    /// Spawns the supervisor inside the caller's current span.
    pub fn spawn(self) -> RenewalHandle {
        let stop = CancellationToken::new();
        let task = tokio::spawn(
            self.run(stop.clone())
                .instrument(tracing::Span::current()),
        );
        RenewalHandle { stop, task }
    }

    pub async fn run(self, stop: CancellationToken) -> RenewalExit {
        if self.max_duration.is_zero() {
            return RenewalExit::Disabled;
        }

        let settled = self.message.settlement_token();
        let renew_until = Instant::now() + self.max_duration;

        loop {
            let now = Instant::now();
            let remaining = self.message.locked_until().saturating_duration_since(now);
            let wake_at = now + remaining / 2;

            if wake_at >= renew_until {
                debug!(
                    max_lock_renewal_secs = self.max_duration.as_secs(),
                    "lock renewal cap reached; letting the lease lapse"
                );
                return RenewalExit::MaxRenewalExceeded;
            }

            tokio::select! {
                biased;
                _ = settled.cancelled() => return RenewalExit::Settled,
                _ = stop.cancelled() => return RenewalExit::Stopped,
                _ = sleep_until(wake_at) => {}
            }

            let result = tokio::select! {
                biased;
                _ = settled.cancelled() => return RenewalExit::Settled,
                _ = stop.cancelled() => return RenewalExit::Stopped,
                result = self.message.renew_lock() => result,
            };

            match result {
                Ok(locked_until) => {
                    self.telemetry.record_renewal();
                    debug!(
                        lock_remaining_ms = locked_until
                            .saturating_duration_since(Instant::now())
                            .as_millis() as u64,
                        "lock renewed"
                    );
                }
                Err(SourceError::NotFound { .. }) => return RenewalExit::Settled,
                Err(SourceError::Closed) => return RenewalExit::Stopped,
                Err(err) => {
                    self.telemetry.record_renewal_failure();
                    let lock_lost = err.is_lock_lost();
                    warn!(error = %err, "lock renewal failed");
                    self.errors.on_error(&SourceErrorEvent::for_message(
                        &self.message,
                        SourceOperation::RenewLock,
                        err,
                    ));
                    if lock_lost {
                        return RenewalExit::LockLost;
                    }
                }
            }
        }
    }
}
