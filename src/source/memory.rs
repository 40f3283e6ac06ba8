//! In-process peek-lock broker.
//!
//! Queues and topic subscriptions are modelled as entities holding an
//! available list, a table of locked deliveries and a dead-letter sub-queue.
//! A lock is granted for the broker's lock duration; when it lapses the
//! delivery returns to the available list and the next receive observes an
//! incremented delivery count. Publishing to a topic copies the message into
//! every subscription of that topic.

use super::client::{BrokerClient, BrokerSource, SourceEntity, SourceFuture};
use super::error::SourceError;
use crate::message::envelope::generate_correlation_id;
use crate::message::{DeliveryState, LockToken, MessageEnvelope, PropertyValue, ReceivedMessage};
use bytes::Bytes;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::{sleep_until, Instant};
use uuid::Uuid;

/// Lock duration applied when none is given.
pub const DEFAULT_LOCK_DURATION: Duration = Duration::from_secs(60);

/// Producer-side message accepted by [`InMemoryBroker::send`] and
/// [`InMemoryBroker::publish`].
#[derive(Debug, Clone)]
pub struct OutgoingMessage {
    message_id: Option<String>,
    correlation_id: Option<String>,
    subject: Option<String>,
    body: Bytes,
    properties: HashMap<String, PropertyValue>,
}

impl OutgoingMessage {
    pub fn new(body: impl Into<Bytes>) -> Self {
        Self {
            message_id: None,
            correlation_id: None,
            subject: None,
            body: body.into(),
            properties: HashMap::new(),
        }
    }

    pub fn with_message_id(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = Some(message_id.into());
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<PropertyValue>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }
}

/// A message moved to an entity's dead-letter sub-queue.
#[derive(Debug, Clone, PartialEq)]
pub struct DeadLetteredMessage {
    pub message_id: String,
    /// Same id every delivery of the message carried, generated at send time
    /// when the producer supplied none.
    pub correlation_id: String,
    pub reason: String,
    pub detail: String,
    pub delivery_count: u32,
    pub body: Bytes,
}

/// Per-entity operation counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct EntityStats {
    pub sent: u64,
    pub received: u64,
    pub completes: u64,
    pub abandons: u64,
    pub dead_letters: u64,
    pub renewals: u64,
    pub lock_expirations: u64,
}

#[derive(Debug, Clone)]
struct StoredMessage {
    message_id: String,
    correlation_id: String,
    subject: Option<String>,
    body: Bytes,
    properties: HashMap<String, PropertyValue>,
    delivery_count: u32,
}

#[derive(Debug)]
struct LockedMessage {
    message: StoredMessage,
    locked_until: Instant,
}

/// Most recently lapsed lock tokens, kept so late settlements can be told
/// apart from unknown tokens. Older tokens are forgotten past the capacity.
#[derive(Debug)]
struct LostLocks {
    capacity: usize,
    order: VecDeque<LockToken>,
    tokens: HashSet<LockToken>,
}

const LOST_LOCK_CAPACITY: usize = 1024;

impl Default for LostLocks {
    fn default() -> Self {
        Self::with_capacity(LOST_LOCK_CAPACITY)
    }
}

impl LostLocks {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            order: VecDeque::new(),
            tokens: HashSet::new(),
        }
    }

    fn remember(&mut self, token: LockToken) {
        if !self.tokens.insert(token.clone()) {
            return;
        }
        self.order.push_back(token);
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.tokens.remove(&oldest);
            }
        }
    }

    fn contains(&self, token: &LockToken) -> bool {
        self.tokens.contains(token)
    }
}

#[derive(Debug, Default)]
struct EntityState {
    available: VecDeque<StoredMessage>,
    locked: HashMap<LockToken, LockedMessage>,
    lost_locks: LostLocks,
    dead_letters: Vec<DeadLetteredMessage>,
    stats: EntityStats,
    notify: Arc<Notify>,
}

impl EntityState {
    /// Returns every delivery whose lock lapsed at `now` to the available list.
    fn reclaim_expired(&mut self, now: Instant) {
        let expired: Vec<LockToken> = self
            .locked
            .iter()
            .filter(|(_, locked)| locked.locked_until <= now)
            .map(|(token, _)| token.clone())
            .collect();

        for token in expired {
            if let Some(locked) = self.locked.remove(&token) {
                self.available.push_front(locked.message);
                self.lost_locks.remember(token);
                self.stats.lock_expirations += 1;
            }
        }
    }

    fn next_lock_expiry(&self) -> Option<Instant> {
        self.locked.values().map(|locked| locked.locked_until).min()
    }

    /// Removes a live lock, classifying missing tokens as lost or unknown.
    fn take_lock(&mut self, token: &LockToken, now: Instant) -> Result<LockedMessage, SourceError> {
        self.reclaim_expired(now);
        match self.locked.remove(token) {
            Some(locked) => Ok(locked),
            None if self.lost_locks.contains(token) => Err(SourceError::LockLost {
                lock_token: token.clone(),
            }),
            None => Err(SourceError::NotFound {
                lock_token: token.clone(),
            }),
        }
    }
}

#[derive(Debug, Default)]
struct BrokerState {
    entities: HashMap<SourceEntity, EntityState>,
    topics: HashMap<String, Vec<String>>,
}

#[derive(Debug)]
struct BrokerInner {
    lock_duration: Duration,
    state: Mutex<BrokerState>,
    next_lock: AtomicU64,
}

impl BrokerInner {
    fn state(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn with_entity<T>(
        &self,
        entity: &SourceEntity,
        f: impl FnOnce(&mut EntityState) -> Result<T, SourceError>,
    ) -> Result<T, SourceError> {
        let mut state = self.state();
        let entity_state = state
            .entities
            .get_mut(entity)
            .ok_or_else(|| SourceError::EntityNotFound(entity.to_string()))?;
        f(entity_state)
    }

    fn next_lock_token(&self) -> LockToken {
        let sequence = self.next_lock.fetch_add(1, Ordering::Relaxed);
        LockToken::new(format!("lock-{sequence}"))
    }
}

/// In-process broker shared by every source it hands out.
#[derive(Debug, Clone)]
pub struct InMemoryBroker {
    inner: Arc<BrokerInner>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new(DEFAULT_LOCK_DURATION)
    }
}

impl InMemoryBroker {
    pub fn new(lock_duration: Duration) -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                lock_duration,
                state: Mutex::new(BrokerState::default()),
                next_lock: AtomicU64::new(1),
            }),
        }
    }

    pub fn lock_duration(&self) -> Duration {
        self.inner.lock_duration
    }

    pub fn create_queue(&self, name: &str) {
        self.inner
            .state()
            .entities
            .entry(SourceEntity::queue(name))
            .or_default();
    }

    pub fn create_topic(&self, topic: &str) {
        self.inner.state().topics.entry(topic.to_owned()).or_default();
    }

    /// Creates the subscription (and its topic if needed).
    pub fn create_subscription(&self, topic: &str, subscription: &str) {
        let mut state = self.inner.state();
        let subscriptions = state.topics.entry(topic.to_owned()).or_default();
        if !subscriptions.iter().any(|existing| existing == subscription) {
            subscriptions.push(subscription.to_owned());
        }
        state
            .entities
            .entry(SourceEntity::subscription(topic, subscription))
            .or_default();
    }

    /// Deletes an entity together with its messages. Sources bound to it start
    /// failing with [`SourceError::EntityNotFound`].
    pub fn remove_entity(&self, entity: &SourceEntity) {
        let mut state = self.inner.state();
        if let Some(removed) = state.entities.remove(entity) {
            removed.notify.notify_waiters();
        }
        if let SourceEntity::Subscription {
            topic,
            subscription,
        } = entity
        {
            if let Some(subscriptions) = state.topics.get_mut(topic) {
                subscriptions.retain(|existing| existing != subscription);
            }
        }
    }

    /// Sends directly to one entity and returns the message id.
    pub fn send(
        &self,
        entity: &SourceEntity,
        message: OutgoingMessage,
    ) -> Result<String, SourceError> {
        let stored = stored_from(message);
        let message_id = stored.message_id.clone();
        let notify = self.inner.with_entity(entity, |state| {
            state.available.push_back(stored);
            state.stats.sent += 1;
            Ok(state.notify.clone())
        })?;
        notify.notify_waiters();
        Ok(message_id)
    }

    /// Publishes to every subscription of `topic` and returns the message id.
    pub fn publish(&self, topic: &str, message: OutgoingMessage) -> Result<String, SourceError> {
        let stored = stored_from(message);
        let message_id = stored.message_id.clone();
        let mut notifies = Vec::new();
        {
            let mut state = self.inner.state();
            let subscriptions = state
                .topics
                .get(topic)
                .cloned()
                .ok_or_else(|| SourceError::EntityNotFound(topic.to_owned()))?;
            for subscription in subscriptions {
                let entity = SourceEntity::subscription(topic, subscription);
                if let Some(entity_state) = state.entities.get_mut(&entity) {
                    entity_state.available.push_back(stored.clone());
                    entity_state.stats.sent += 1;
                    notifies.push(entity_state.notify.clone());
                }
            }
        }
        for notify in notifies {
            notify.notify_waiters();
        }
        Ok(message_id)
    }

    pub fn stats(&self, entity: &SourceEntity) -> EntityStats {
        self.inner
            .state()
            .entities
            .get(entity)
            .map(|state| state.stats)
            .unwrap_or_default()
    }

    pub fn dead_letters(&self, entity: &SourceEntity) -> Vec<DeadLetteredMessage> {
        self.inner
            .state()
            .entities
            .get(entity)
            .map(|state| state.dead_letters.clone())
            .unwrap_or_default()
    }

    /// Messages waiting to be received (lapsed locks included).
    pub fn pending(&self, entity: &SourceEntity) -> usize {
        let now = Instant::now();
        let mut state = self.inner.state();
        match state.entities.get_mut(entity) {
            Some(entity_state) => {
                entity_state.reclaim_expired(now);
                entity_state.available.len()
            }
            None => 0,
        }
    }

    /// Deliveries currently holding a live lock.
    pub fn locked(&self, entity: &SourceEntity) -> usize {
        let now = Instant::now();
        let mut state = self.inner.state();
        match state.entities.get_mut(entity) {
            Some(entity_state) => {
                entity_state.reclaim_expired(now);
                entity_state.locked.len()
            }
            None => 0,
        }
    }
}

impl BrokerClient for InMemoryBroker {
    fn source(&self, entity: &SourceEntity) -> Arc<dyn BrokerSource> {
        Arc::new(MemorySource {
            broker: self.inner.clone(),
            entity: entity.clone(),
            closed: AtomicBool::new(false),
        })
    }
}

fn stored_from(message: OutgoingMessage) -> StoredMessage {
    StoredMessage {
        message_id: message
            .message_id
            .unwrap_or_else(|| Uuid::new_v4().to_string()),
        correlation_id: message
            .correlation_id
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(generate_correlation_id),
        subject: message.subject,
        body: message.body,
        properties: message.properties,
        delivery_count: 0,
    }
}

struct MemorySource {
    broker: Arc<BrokerInner>,
    entity: SourceEntity,
    closed: AtomicBool,
}

enum LockAttempt {
    Locked(ReceivedMessage),
    Empty {
        notify: Arc<Notify>,
        next_expiry: Option<Instant>,
    },
}

impl MemorySource {
    fn ensure_open(&self) -> Result<(), SourceError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SourceError::Closed);
        }
        Ok(())
    }

    fn try_lock_next(&self) -> Result<LockAttempt, SourceError> {
        let now = Instant::now();
        let lock_token = self.broker.next_lock_token();
        let locked_until = now + self.broker.lock_duration;

        self.broker.with_entity(&self.entity, |state| {
            state.reclaim_expired(now);
            let Some(mut message) = state.available.pop_front() else {
                return Ok(LockAttempt::Empty {
                    notify: state.notify.clone(),
                    next_expiry: state.next_lock_expiry(),
                });
            };

            message.delivery_count += 1;
            state.stats.received += 1;
            let envelope = MessageEnvelope::new(
                message.message_id.clone(),
                Some(message.correlation_id.clone()),
                message.subject.clone(),
                message.body.clone(),
                message.properties.clone(),
            );
            let delivery =
                DeliveryState::new(message.delivery_count, lock_token.clone(), locked_until);
            state.locked.insert(
                lock_token,
                LockedMessage {
                    message,
                    locked_until,
                },
            );
            Ok(LockAttempt::Locked(ReceivedMessage::new(envelope, delivery)))
        })
    }
}

impl BrokerSource for MemorySource {
    fn entity(&self) -> &SourceEntity {
        &self.entity
    }

    fn open(&self) -> SourceFuture<'_, ()> {
        Box::pin(async move {
            self.ensure_open()?;
            self.broker.with_entity(&self.entity, |_| Ok(()))
        })
    }

    fn receive(&self, max_wait: Duration) -> SourceFuture<'_, Option<ReceivedMessage>> {
        Box::pin(async move {
            let deadline = Instant::now() + max_wait;
            loop {
                self.ensure_open()?;
                let (notify, next_expiry) = match self.try_lock_next()? {
                    LockAttempt::Locked(message) => return Ok(Some(message)),
                    LockAttempt::Empty {
                        notify,
                        next_expiry,
                    } => (notify, next_expiry),
                };

                let notified = notify.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();

                // A send may have landed between the attempt and registration.
                if let LockAttempt::Locked(message) = self.try_lock_next()? {
                    return Ok(Some(message));
                }

                if Instant::now() >= deadline {
                    return Ok(None);
                }
                let wake_at = next_expiry
                    .map(|expiry| expiry.min(deadline))
                    .unwrap_or(deadline);

                tokio::select! {
                    _ = &mut notified => {}
                    _ = sleep_until(wake_at) => {}
                }
            }
        })
    }

    fn renew_lock<'a>(&'a self, lock_token: &'a LockToken) -> SourceFuture<'a, Instant> {
        Box::pin(async move {
            self.ensure_open()?;
            let now = Instant::now();
            let lock_duration = self.broker.lock_duration;
            self.broker.with_entity(&self.entity, |state| {
                state.reclaim_expired(now);
                match state.locked.get_mut(lock_token) {
                    Some(locked) => {
                        locked.locked_until = now + lock_duration;
                        state.stats.renewals += 1;
                        Ok(locked.locked_until)
                    }
                    None if state.lost_locks.contains(lock_token) => Err(SourceError::LockLost {
                        lock_token: lock_token.clone(),
                    }),
                    None => Err(SourceError::NotFound {
                        lock_token: lock_token.clone(),
                    }),
                }
            })
        })
    }

    fn complete<'a>(&'a self, lock_token: &'a LockToken) -> SourceFuture<'a, ()> {
        Box::pin(async move {
            self.ensure_open()?;
            let now = Instant::now();
            self.broker.with_entity(&self.entity, |state| {
                state.take_lock(lock_token, now)?;
                state.stats.completes += 1;
                Ok(())
            })
        })
    }

    fn abandon<'a>(&'a self, lock_token: &'a LockToken) -> SourceFuture<'a, ()> {
        Box::pin(async move {
            self.ensure_open()?;
            let now = Instant::now();
            let notify = self.broker.with_entity(&self.entity, |state| {
                let locked = state.take_lock(lock_token, now)?;
                state.available.push_front(locked.message);
                state.stats.abandons += 1;
                Ok(state.notify.clone())
            })?;
            notify.notify_waiters();
            Ok(())
        })
    }

    fn dead_letter<'a>(
        &'a self,
        lock_token: &'a LockToken,
        reason: &'a str,
        detail: &'a str,
    ) -> SourceFuture<'a, ()> {
        Box::pin(async move {
            self.ensure_open()?;
            let now = Instant::now();
            self.broker.with_entity(&self.entity, |state| {
                let locked = state.take_lock(lock_token, now)?;
                let message = locked.message;
                state.dead_letters.push(DeadLetteredMessage {
                    message_id: message.message_id,
                    correlation_id: message.correlation_id,
                    reason: reason.to_owned(),
                    detail: detail.to_owned(),
                    delivery_count: message.delivery_count,
                    body: message.body,
                });
                state.stats.dead_letters += 1;
                Ok(())
            })
        })
    }

    fn close(&self) -> SourceFuture<'_, ()> {
        Box::pin(async move {
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        })
    }
}
