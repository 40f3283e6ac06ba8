use super::client::{BrokerSource, SourceEntity, SourceFuture};
use super::error::SourceError;
use crate::message::{LockToken, ReceivedMessage};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::yield_now;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Bounded exponential backoff applied to transient source errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceRetryPolicy {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub max_attempts: usize,
}

impl Default for SourceRetryPolicy {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(2),
            max_attempts: 3,
        }
    }
}

impl SourceRetryPolicy {
    pub fn new(initial_backoff: Duration, max_backoff: Duration, max_attempts: usize) -> Self {
        Self {
            initial_backoff,
            max_backoff,
            max_attempts: max_attempts.max(1),
        }
    }
}

pub(crate) enum RetryDisposition {
    Retry,
    Abort,
}

/// Runs `operation` until it succeeds, `classify_error` aborts, the attempt
/// budget is spent or `cancellation` fires during a backoff. The last error is
/// returned in every failing case.
pub(crate) async fn retry_with_backoff<T, F, Fut, L, C>(
    policy: SourceRetryPolicy,
    cancellation: &CancellationToken,
    mut operation: F,
    mut on_retry: L,
    mut classify_error: C,
) -> Result<T, SourceError>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T, SourceError>>,
    L: FnMut(usize, Duration, &SourceError, bool),
    C: FnMut(usize, &SourceError) -> RetryDisposition,
{
    let mut attempt = 0;
    let mut backoff = policy.initial_backoff;

    loop {
        attempt += 1;

        match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) => match classify_error(attempt, &err) {
                RetryDisposition::Abort => return Err(err),
                RetryDisposition::Retry => {
                    let exhausted = attempt >= policy.max_attempts;
                    on_retry(attempt, backoff, &err, !exhausted);

                    if exhausted || !sleep_with_cancellation(backoff, cancellation).await {
                        return Err(err);
                    }
                    backoff = next_backoff(backoff, policy.max_backoff);
                }
            },
        }
    }
}

/// Returns `false` when `cancellation` fired before `delay` elapsed.
async fn sleep_with_cancellation(delay: Duration, cancellation: &CancellationToken) -> bool {
    if cancellation.is_cancelled() {
        return false;
    }
    if delay.is_zero() {
        yield_now().await;
        return true;
    }

    tokio::select! {
        _ = cancellation.cancelled() => false,
        _ = sleep(delay) => true,
    }
}

fn next_backoff(current: Duration, max_backoff: Duration) -> Duration {
    if current.is_zero() {
        return max_backoff.min(Duration::from_millis(1));
    }
    current.saturating_mul(2).min(max_backoff)
}

fn classify(_attempt: usize, err: &SourceError) -> RetryDisposition {
    if err.is_transient() {
        RetryDisposition::Retry
    } else {
        RetryDisposition::Abort
    }
}

/// Wraps a source so transient errors never reach the dispatcher until the
/// retry budget is spent. Every other error category passes through on the
/// first occurrence.
///
/// Once the cancellation token fires, pending backoffs end early and the last
/// transient error is returned.
pub struct RetryingSource {
    inner: Arc<dyn BrokerSource>,
    policy: SourceRetryPolicy,
    cancellation: CancellationToken,
}

impl RetryingSource {
    pub fn new(inner: Arc<dyn BrokerSource>, policy: SourceRetryPolicy) -> Self {
        Self {
            inner,
            policy,
            cancellation: CancellationToken::new(),
        }
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    pub fn policy(&self) -> SourceRetryPolicy {
        self.policy
    }

    async fn retry<'a, T, F, Fut>(&'a self, operation: &'static str, call: F) -> Result<T, SourceError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, SourceError>> + 'a,
    {
        let entity = self.inner.entity();
        retry_with_backoff(
            self.policy,
            &self.cancellation,
            |_| call(),
            |attempt, delay, err, will_retry| {
                if will_retry {
                    warn!(
                        %entity,
                        operation,
                        attempt,
                        retry_in_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient source error; retrying"
                    );
                } else {
                    warn!(
                        %entity,
                        operation,
                        attempt,
                        error = %err,
                        "transient source error; retry budget exhausted"
                    );
                }
            },
            classify,
        )
        .await
    }
}

impl BrokerSource for RetryingSource {
    fn entity(&self) -> &SourceEntity {
        self.inner.entity()
    }

    fn open(&self) -> SourceFuture<'_, ()> {
        Box::pin(self.retry("open", || self.inner.open()))
    }

    fn receive(&self, max_wait: Duration) -> SourceFuture<'_, Option<ReceivedMessage>> {
        Box::pin(self.retry("receive", move || self.inner.receive(max_wait)))
    }

    fn renew_lock<'a>(&'a self, lock_token: &'a LockToken) -> SourceFuture<'a, Instant> {
        Box::pin(self.retry("renew_lock", move || self.inner.renew_lock(lock_token)))
    }

    fn complete<'a>(&'a self, lock_token: &'a LockToken) -> SourceFuture<'a, ()> {
        Box::pin(self.retry("complete", move || self.inner.complete(lock_token)))
    }

    fn abandon<'a>(&'a self, lock_token: &'a LockToken) -> SourceFuture<'a, ()> {
        Box::pin(self.retry("abandon", move || self.inner.abandon(lock_token)))
    }

    fn dead_letter<'a>(
        &'a self,
        lock_token: &'a LockToken,
        reason: &'a str,
        detail: &'a str,
    ) -> SourceFuture<'a, ()> {
        Box::pin(self.retry("dead_letter", move || {
            self.inner.dead_letter(lock_token, reason, detail)
        }))
    }

    fn close(&self) -> SourceFuture<'_, ()> {
        self.inner.close()
    }
}
