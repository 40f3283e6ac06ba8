use crate::processor::in_flight::InFlightTracker;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio::{select, time};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// Default interval used by the metrics reporter task.
pub const DEFAULT_METRICS_INTERVAL: Duration = Duration::from_secs(30);

static TRACING_INIT: OnceLock<()> = OnceLock::new();

/// Installs a basic tracing subscriber (if one is not already active).
///
/// The subscriber honours `RUST_LOG` if it is present, otherwise it falls back to `info`.
/// Calling this function multiple times is harmless.
pub fn init_tracing() {
    if TRACING_INIT.get().is_some() {
        return;
    }

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .try_init();

    let _ = TRACING_INIT.set(());
}

/// Per-processor counters of delivery outcomes and source activity.
#[derive(Default, Debug)]
pub struct Telemetry {
    received: AtomicU64,
    completed: AtomicU64,
    abandoned: AtomicU64,
    dead_lettered: AtomicU64,
    lock_lost: AtomicU64,
    renewals: AtomicU64,
    renewal_failures: AtomicU64,
    handler_errors: AtomicU64,
    source_errors: AtomicU64,
}

impl Telemetry {
    pub fn record_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_completed(&self) {
        self.completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_abandoned(&self) {
        self.abandoned.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dead_lettered(&self) {
        self.dead_lettered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_lock_lost(&self) {
        self.lock_lost.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_renewal(&self) {
        self.renewals.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_renewal_failure(&self) {
        self.renewal_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_handler_error(&self) {
        self.handler_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_source_error(&self) {
        self.source_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        TelemetrySnapshot {
            received: self.received.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            abandoned: self.abandoned.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            lock_lost: self.lock_lost.load(Ordering::Relaxed),
            renewals: self.renewals.load(Ordering::Relaxed),
            renewal_failures: self.renewal_failures.load(Ordering::Relaxed),
            handler_errors: self.handler_errors.load(Ordering::Relaxed),
            source_errors: self.source_errors.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct TelemetrySnapshot {
    pub received: u64,
    pub completed: u64,
    pub abandoned: u64,
    pub dead_lettered: u64,
    pub lock_lost: u64,
    pub renewals: u64,
    pub renewal_failures: u64,
    pub handler_errors: u64,
    pub source_errors: u64,
}

impl TelemetrySnapshot {
    /// Deliveries that reached a terminal outcome (lost locks included).
    pub fn settled(&self) -> u64 {
        self.completed + self.abandoned + self.dead_lettered + self.lock_lost
    }
}

/// Spawns a background task that periodically logs throughput, outcome counters and the
/// number of handlers in flight for one processor.
pub fn spawn_metrics_reporter(
    entity: String,
    telemetry: Arc<Telemetry>,
    in_flight: Arc<InFlightTracker>,
    shutdown: CancellationToken,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut last_snapshot = telemetry.snapshot();
        let mut last_tick = Instant::now();

        loop {
            select! {
                _ = shutdown.cancelled() => {
                    tracing::info!(target: "orderbus::metrics", %entity, "metrics reporter shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    let current_snapshot = telemetry.snapshot();
                    let settled_delta = current_snapshot
                        .settled()
                        .saturating_sub(last_snapshot.settled());
                    let elapsed = last_tick.elapsed().as_secs_f64();
                    let throughput = if elapsed <= f64::EPSILON {
                        0.0
                    } else {
                        settled_delta as f64 / elapsed
                    };

                    tracing::info!(
                        target: "orderbus::metrics",
                        %entity,
                        throughput = format!("{throughput:.2}"),
                        in_flight = in_flight.active(),
                        peak_in_flight = in_flight.peak(),
                        received = current_snapshot.received,
                        completed = current_snapshot.completed,
                        abandoned = current_snapshot.abandoned,
                        dead_lettered = current_snapshot.dead_lettered,
                        lock_lost = current_snapshot.lock_lost,
                        renewals = current_snapshot.renewals,
                        renewal_failures = current_snapshot.renewal_failures,
                        handler_errors = current_snapshot.handler_errors,
                        source_errors = current_snapshot.source_errors,
                        "processor metrics snapshot"
                    );

                    last_snapshot = current_snapshot;
                    last_tick = Instant::now();
                }
            }
        }
    })
}
