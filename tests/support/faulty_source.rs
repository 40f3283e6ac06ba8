use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use orderbus::message::{LockToken, ReceivedMessage};
use orderbus::source::SourceFuture;
use orderbus::{BrokerClient, BrokerSource, InMemoryBroker, SourceEntity, SourceError};
use tokio::time::Instant;

/// Wraps a real source, injects receive faults, and audits every call made
/// against a lock token.
pub struct FaultySource {
    inner: Arc<dyn BrokerSource>,
    transient_receives: AtomicUsize,
    revoked: AtomicBool,
    audit: Mutex<Audit>,
}

#[derive(Debug, Default)]
struct Audit {
    terminal_calls: HashMap<LockToken, usize>,
    renewals_after_terminal: usize,
}

impl FaultySource {
    pub fn new(inner: Arc<dyn BrokerSource>) -> Self {
        Self {
            inner,
            transient_receives: AtomicUsize::new(0),
            revoked: AtomicBool::new(false),
            audit: Mutex::new(Audit::default()),
        }
    }

    /// The next `count` receives fail with a transient error.
    pub fn fail_next_receives(&self, count: usize) {
        self.transient_receives.store(count, Ordering::SeqCst);
    }

    /// Every later receive fails as if the credential had been revoked.
    pub fn revoke(&self) {
        self.revoked.store(true, Ordering::SeqCst);
    }

    /// Number of terminal calls issued per lock token.
    pub fn terminal_calls(&self) -> HashMap<LockToken, usize> {
        self.audit.lock().unwrap().terminal_calls.clone()
    }

    pub fn renewals_after_terminal(&self) -> usize {
        self.audit.lock().unwrap().renewals_after_terminal
    }

    fn record_terminal(&self, lock_token: &LockToken) {
        *self
            .audit
            .lock()
            .unwrap()
            .terminal_calls
            .entry(lock_token.clone())
            .or_default() += 1;
    }
}

impl BrokerSource for FaultySource {
    fn entity(&self) -> &SourceEntity {
        self.inner.entity()
    }

    fn open(&self) -> SourceFuture<'_, ()> {
        self.inner.open()
    }

    fn receive(&self, max_wait: Duration) -> SourceFuture<'_, Option<ReceivedMessage>> {
        Box::pin(async move {
            if self.revoked.load(Ordering::SeqCst) {
                return Err(SourceError::Unauthorized("credential revoked".into()));
            }
            let injected = self
                .transient_receives
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
                .is_ok();
            if injected {
                return Err(SourceError::transient("connection reset"));
            }
            self.inner.receive(max_wait).await
        })
    }

    fn renew_lock<'a>(&'a self, lock_token: &'a LockToken) -> SourceFuture<'a, Instant> {
        Box::pin(async move {
            {
                let mut audit = self.audit.lock().unwrap();
                if audit.terminal_calls.contains_key(lock_token) {
                    audit.renewals_after_terminal += 1;
                }
            }
            self.inner.renew_lock(lock_token).await
        })
    }

    fn complete<'a>(&'a self, lock_token: &'a LockToken) -> SourceFuture<'a, ()> {
        self.record_terminal(lock_token);
        self.inner.complete(lock_token)
    }

    fn abandon<'a>(&'a self, lock_token: &'a LockToken) -> SourceFuture<'a, ()> {
        self.record_terminal(lock_token);
        self.inner.abandon(lock_token)
    }

    fn dead_letter<'a>(
        &'a self,
        lock_token: &'a LockToken,
        reason: &'a str,
        detail: &'a str,
    ) -> SourceFuture<'a, ()> {
        self.record_terminal(lock_token);
        self.inner.dead_letter(lock_token, reason, detail)
    }

    fn close(&self) -> SourceFuture<'_, ()> {
        self.inner.close()
    }
}

/// Client handing out one [`FaultySource`] per entity of an in-memory broker.
pub struct FaultyClient {
    broker: InMemoryBroker,
    sources: Mutex<HashMap<SourceEntity, Arc<FaultySource>>>,
}

impl FaultyClient {
    pub fn new(broker: InMemoryBroker) -> Self {
        Self {
            broker,
            sources: Mutex::new(HashMap::new()),
        }
    }

    pub fn faulty(&self, entity: &SourceEntity) -> Arc<FaultySource> {
        self.sources
            .lock()
            .unwrap()
            .entry(entity.clone())
            .or_insert_with(|| Arc::new(FaultySource::new(self.broker.source(entity))))
            .clone()
    }
}

impl BrokerClient for FaultyClient {
    fn source(&self, entity: &SourceEntity) -> Arc<dyn BrokerSource> {
        self.faulty(entity)
    }
}
