use crate::processor::dispatcher::DispatchSettings;
use crate::processor::policy::{
    RetryPolicy, DEFAULT_MAX_DELIVERY_ATTEMPTS, MAX_DELIVERY_COUNT_EXCEEDED,
};
use crate::runtime::telemetry;
use crate::source::{SourceEntity, SourceRetryPolicy};
use anyhow::{bail, Context, Result};
use std::str::FromStr;
use std::time::Duration;

const DEFAULT_MAX_CONCURRENT_HANDLERS: usize = 5;
const DEFAULT_MAX_LOCK_RENEWAL_SECS: u64 = 5 * 60;
const DEFAULT_RECEIVE_WAIT_SECS: u64 = 1;
const DEFAULT_RECEIVE_ERROR_BACKOFF_SECS: u64 = 1;
const DEFAULT_SOURCE_RETRY_INITIAL_BACKOFF_MS: u64 = 100;
const DEFAULT_SOURCE_RETRY_MAX_BACKOFF_MS: u64 = 2_000;
const DEFAULT_SOURCE_RETRY_MAX_ATTEMPTS: usize = 3;
const DEFAULT_SHUTDOWN_TIMEOUT_SECS: u64 = 30;
const DEFAULT_ORDER_PROCESSING_DELAY_MS: u64 = 1_000;

pub const DEFAULT_QUEUE_NAME: &str = "order-queue";
pub const DEFAULT_TOPIC_NAME: &str = "order-topic";
pub const DEFAULT_SUBSCRIPTION_NAME: &str = "order-subscription";

/// Configuration of one processor instance.
///
/// All instances must be constructed via [`ProcessorConfig::builder`] or
/// [`ProcessorConfig::new`] so invariants are validated before any consumer
/// observes the values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessorConfig {
    entity: SourceEntity,
    max_concurrent_handlers: usize,
    max_delivery_attempts: u32,
    dead_letter_reason: String,
    auto_complete: bool,
    max_lock_renewal: Duration,
    receive_wait: Duration,
    receive_error_backoff: Duration,
    metrics_interval: Duration,
    source_retry_initial_backoff: Duration,
    source_retry_max_backoff: Duration,
    source_retry_max_attempts: usize,
}

pub struct ProcessorConfigParams {
    pub entity: SourceEntity,
    pub max_concurrent_handlers: usize,
    pub max_delivery_attempts: u32,
    pub dead_letter_reason: String,
    pub auto_complete: bool,
    pub max_lock_renewal: Duration,
    pub receive_wait: Duration,
    pub receive_error_backoff: Duration,
    pub metrics_interval: Duration,
    pub source_retry_initial_backoff: Duration,
    pub source_retry_max_backoff: Duration,
    pub source_retry_max_attempts: usize,
}

impl ProcessorConfig {
    /// Returns a builder to incrementally construct and validate a configuration.
    pub fn builder() -> ProcessorConfigBuilder {
        ProcessorConfigBuilder::default()
    }

    /// Constructs a configuration directly from the provided values.
    pub fn new(params: ProcessorConfigParams) -> Result<Self> {
        let ProcessorConfigParams {
            entity,
            max_concurrent_handlers,
            max_delivery_attempts,
            dead_letter_reason,
            auto_complete,
            max_lock_renewal,
            receive_wait,
            receive_error_backoff,
            metrics_interval,
            source_retry_initial_backoff,
            source_retry_max_backoff,
            source_retry_max_attempts,
        } = params;

        let config = Self {
            entity: trimmed_entity(entity),
            max_concurrent_handlers,
            max_delivery_attempts,
            dead_letter_reason: dead_letter_reason.trim().to_owned(),
            auto_complete,
            max_lock_renewal,
            receive_wait,
            receive_error_backoff,
            metrics_interval,
            source_retry_initial_backoff,
            source_retry_max_backoff,
            source_retry_max_attempts,
        };

        config.validate()?;
        Ok(config)
    }

    /// Queue or topic subscription the processor consumes from.
    pub fn entity(&self) -> &SourceEntity {
        &self.entity
    }

    /// Upper bound on concurrently running handler invocations.
    pub fn max_concurrent_handlers(&self) -> usize {
        self.max_concurrent_handlers
    }

    /// Delivery count at which a failing message is dead-lettered.
    pub fn max_delivery_attempts(&self) -> u32 {
        self.max_delivery_attempts
    }

    pub fn dead_letter_reason(&self) -> &str {
        &self.dead_letter_reason
    }

    /// Always false; completion is explicit and follows successful handling.
    pub fn auto_complete(&self) -> bool {
        self.auto_complete
    }

    /// Longest time a single message is kept alive through renewal. Zero
    /// disables renewal.
    pub fn max_lock_renewal(&self) -> Duration {
        self.max_lock_renewal
    }

    /// Longest time one receive call waits for a message.
    pub fn receive_wait(&self) -> Duration {
        self.receive_wait
    }

    /// Pause after a non-fatal receive error.
    pub fn receive_error_backoff(&self) -> Duration {
        self.receive_error_backoff
    }

    pub fn metrics_interval(&self) -> Duration {
        self.metrics_interval
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_delivery_attempts, self.dead_letter_reason.clone())
    }

    pub fn source_retry_policy(&self) -> SourceRetryPolicy {
        SourceRetryPolicy::new(
            self.source_retry_initial_backoff,
            self.source_retry_max_backoff,
            self.source_retry_max_attempts,
        )
    }

    pub fn dispatch_settings(&self) -> DispatchSettings {
        DispatchSettings {
            max_concurrent_handlers: self.max_concurrent_handlers,
            policy: self.retry_policy(),
            max_lock_renewal: self.max_lock_renewal,
            receive_wait: self.receive_wait,
            receive_error_backoff: self.receive_error_backoff,
        }
    }

    /// Performs validation on an existing configuration instance.
    pub fn validate(&self) -> Result<()> {
        match &self.entity {
            SourceEntity::Queue { name } => ensure_not_empty(name, "queue name")?,
            SourceEntity::Subscription {
                topic,
                subscription,
            } => {
                ensure_not_empty(topic, "topic name")?;
                ensure_not_empty(subscription, "subscription name")?;
            }
        }

        if self.max_concurrent_handlers == 0 {
            bail!("max_concurrent_handlers must be greater than 0");
        }

        if self.max_delivery_attempts == 0 {
            bail!("max_delivery_attempts must be greater than 0");
        }

        ensure_not_empty(&self.dead_letter_reason, "dead_letter_reason")?;

        if self.auto_complete {
            bail!("auto_complete must be false; messages are completed explicitly after handling");
        }

        if self.receive_wait.is_zero() {
            bail!("receive_wait must be greater than 0");
        }

        if self.receive_error_backoff.is_zero() {
            bail!("receive_error_backoff must be greater than 0");
        }

        if self.metrics_interval.is_zero() {
            bail!("metrics_interval must be greater than 0");
        }

        if self.source_retry_max_attempts == 0 {
            bail!("source_retry_max_attempts must be greater than 0");
        }

        if self.source_retry_initial_backoff > self.source_retry_max_backoff {
            bail!(
                "source_retry_initial_backoff ({:?}) must not exceed source_retry_max_backoff ({:?})",
                self.source_retry_initial_backoff,
                self.source_retry_max_backoff,
            );
        }

        Ok(())
    }
}

#[derive(Debug, Default, Clone)]
pub struct ProcessorConfigBuilder {
    entity: Option<SourceEntity>,
    max_concurrent_handlers: Option<usize>,
    max_delivery_attempts: Option<u32>,
    dead_letter_reason: Option<String>,
    auto_complete: Option<bool>,
    max_lock_renewal: Option<Duration>,
    receive_wait: Option<Duration>,
    receive_error_backoff: Option<Duration>,
    metrics_interval: Option<Duration>,
    source_retry_initial_backoff: Option<Duration>,
    source_retry_max_backoff: Option<Duration>,
    source_retry_max_attempts: Option<usize>,
}

impl ProcessorConfigBuilder {
    pub fn queue(mut self, name: impl Into<String>) -> Self {
        self.entity = Some(SourceEntity::queue(name));
        self
    }

    pub fn subscription(mut self, topic: impl Into<String>, subscription: impl Into<String>) -> Self {
        self.entity = Some(SourceEntity::subscription(topic, subscription));
        self
    }

    pub fn entity(mut self, entity: SourceEntity) -> Self {
        self.entity = Some(entity);
        self
    }

    pub fn max_concurrent_handlers(mut self, count: usize) -> Self {
        self.max_concurrent_handlers = Some(count);
        self
    }

    pub fn max_delivery_attempts(mut self, attempts: u32) -> Self {
        self.max_delivery_attempts = Some(attempts);
        self
    }

    pub fn dead_letter_reason(mut self, reason: impl Into<String>) -> Self {
        self.dead_letter_reason = Some(reason.into());
        self
    }

    pub fn auto_complete(mut self, enabled: bool) -> Self {
        self.auto_complete = Some(enabled);
        self
    }

    pub fn max_lock_renewal(mut self, duration: Duration) -> Self {
        self.max_lock_renewal = Some(duration);
        self
    }

    pub fn receive_wait(mut self, wait: Duration) -> Self {
        self.receive_wait = Some(wait);
        self
    }

    pub fn receive_error_backoff(mut self, backoff: Duration) -> Self {
        self.receive_error_backoff = Some(backoff);
        self
    }

    pub fn metrics_interval(mut self, interval: Duration) -> Self {
        self.metrics_interval = Some(interval);
        self
    }

    pub fn source_retry(
        mut self,
        initial_backoff: Duration,
        max_backoff: Duration,
        max_attempts: usize,
    ) -> Self {
        self.source_retry_initial_backoff = Some(initial_backoff);
        self.source_retry_max_backoff = Some(max_backoff);
        self.source_retry_max_attempts = Some(max_attempts);
        self
    }

    pub fn build(self) -> Result<ProcessorConfig> {
        let params = ProcessorConfigParams {
            entity: self
                .entity
                .context("a queue or topic subscription is required")?,
            max_concurrent_handlers: self
                .max_concurrent_handlers
                .unwrap_or(DEFAULT_MAX_CONCURRENT_HANDLERS),
            max_delivery_attempts: self
                .max_delivery_attempts
                .unwrap_or(DEFAULT_MAX_DELIVERY_ATTEMPTS),
            dead_letter_reason: self
                .dead_letter_reason
                .unwrap_or_else(|| MAX_DELIVERY_COUNT_EXCEEDED.to_owned()),
            auto_complete: self.auto_complete.unwrap_or(false),
            max_lock_renewal: self
                .max_lock_renewal
                .unwrap_or_else(|| Duration::from_secs(DEFAULT_MAX_LOCK_RENEWAL_SECS)),
            receive_wait: self
                .receive_wait
                .unwrap_or_else(|| Duration::from_secs(DEFAULT_RECEIVE_WAIT_SECS)),
            receive_error_backoff: self
                .receive_error_backoff
                .unwrap_or_else(|| Duration::from_secs(DEFAULT_RECEIVE_ERROR_BACKOFF_SECS)),
            metrics_interval: self
                .metrics_interval
                .unwrap_or(telemetry::DEFAULT_METRICS_INTERVAL),
            source_retry_initial_backoff: self
                .source_retry_initial_backoff
                .unwrap_or_else(|| Duration::from_millis(DEFAULT_SOURCE_RETRY_INITIAL_BACKOFF_MS)),
            source_retry_max_backoff: self
                .source_retry_max_backoff
                .unwrap_or_else(|| Duration::from_millis(DEFAULT_SOURCE_RETRY_MAX_BACKOFF_MS)),
            source_retry_max_attempts: self
                .source_retry_max_attempts
                .unwrap_or(DEFAULT_SOURCE_RETRY_MAX_ATTEMPTS),
        };

        ProcessorConfig::new(params)
    }
}

/// Process-wide settings: which processors to run and how to stop them.
///
/// A processor whose configuration is `None` is never constructed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineSettings {
    pub broker_namespace: Option<String>,
    pub queue: Option<ProcessorConfig>,
    pub topic: Option<ProcessorConfig>,
    pub shutdown_timeout: Duration,
    pub order_processing_delay: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            broker_namespace: None,
            queue: None,
            topic: None,
            shutdown_timeout: Duration::from_secs(DEFAULT_SHUTDOWN_TIMEOUT_SECS),
            order_processing_delay: Duration::from_millis(DEFAULT_ORDER_PROCESSING_DELAY_MS),
        }
    }
}

impl EngineSettings {
    /// Loads settings from `ORDERBUS_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Loads settings through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_owned())
                .filter(|value| !value.is_empty())
        };

        let shutdown_timeout = Duration::from_secs(
            parse_var(&var, "ORDERBUS_SHUTDOWN_TIMEOUT_SECS")?
                .unwrap_or(DEFAULT_SHUTDOWN_TIMEOUT_SECS),
        );
        let order_processing_delay = Duration::from_millis(
            parse_var(&var, "ORDERBUS_ORDER_PROCESSING_DELAY_MS")?
                .unwrap_or(DEFAULT_ORDER_PROCESSING_DELAY_MS),
        );

        let Some(broker_namespace) = var("ORDERBUS_BROKER_NAMESPACE") else {
            tracing::warn!(
                "ORDERBUS_BROKER_NAMESPACE is not set; message processors are disabled"
            );
            return Ok(Self {
                shutdown_timeout,
                order_processing_delay,
                ..Self::default()
            });
        };

        let queue_name = var("ORDERBUS_QUEUE_NAME").unwrap_or_else(|| DEFAULT_QUEUE_NAME.into());
        let topic_name = var("ORDERBUS_TOPIC_NAME").unwrap_or_else(|| DEFAULT_TOPIC_NAME.into());
        let subscription_name = var("ORDERBUS_SUBSCRIPTION_NAME")
            .unwrap_or_else(|| DEFAULT_SUBSCRIPTION_NAME.into());

        let queue = source_config(&var, "QUEUE", SourceEntity::queue(queue_name))?;
        let topic = source_config(
            &var,
            "TOPIC",
            SourceEntity::subscription(topic_name, subscription_name),
        )?;

        Ok(Self {
            broker_namespace: Some(broker_namespace),
            queue: Some(queue),
            topic: Some(topic),
            shutdown_timeout,
            order_processing_delay,
        })
    }
}

fn source_config<V>(var: &V, prefix: &str, entity: SourceEntity) -> Result<ProcessorConfig>
where
    V: Fn(&str) -> Option<String>,
{
    let mut builder = ProcessorConfig::builder().entity(entity);

    if let Some(count) = parse_var(var, &format!("ORDERBUS_{prefix}_MAX_CONCURRENT_CALLS"))? {
        builder = builder.max_concurrent_handlers(count);
    }
    if let Some(attempts) = parse_var(var, &format!("ORDERBUS_{prefix}_MAX_DELIVERY_ATTEMPTS"))? {
        builder = builder.max_delivery_attempts(attempts);
    }
    if let Some(secs) = parse_var(var, &format!("ORDERBUS_{prefix}_MAX_LOCK_RENEWAL_SECS"))? {
        builder = builder.max_lock_renewal(Duration::from_secs(secs));
    }

    builder
        .build()
        .with_context(|| format!("invalid {} processor configuration", prefix.to_lowercase()))
}

fn parse_var<V, T>(var: &V, key: &str) -> Result<Option<T>>
where
    V: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    var(key)
        .map(|raw| {
            raw.parse::<T>()
                .with_context(|| format!("{key} has an invalid value: {raw:?}"))
        })
        .transpose()
}

fn trimmed_entity(entity: SourceEntity) -> SourceEntity {
    match entity {
        SourceEntity::Queue { name } => SourceEntity::queue(name.trim()),
        SourceEntity::Subscription {
            topic,
            subscription,
        } => SourceEntity::subscription(topic.trim(), subscription.trim()),
    }
}

fn ensure_not_empty(value: &str, field: &str) -> Result<()> {
    if value.trim().is_empty() {
        bail!("{field} cannot be empty");
    }
    Ok(())
}
