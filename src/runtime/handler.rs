use crate::message::MessageEnvelope;
use anyhow::Error as AnyError;
use core::future::Future;
use core::pin::Pin;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub type HandlerFuture<'a> = Pin<Box<dyn Future<Output = Result<(), HandlerError>> + Send + 'a>>;

/// How a handler invocation failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerErrorKind {
    /// Business failure; routed through the retry/dead-letter policy.
    Failed,
    /// The handler panicked; treated like a business failure.
    Panicked,
    /// The handler gave up because its processor is shutting down.
    Cancelled,
}

/// Error returned by a [`MessageHandler`].
#[derive(Debug)]
pub struct HandlerError {
    kind: HandlerErrorKind,
    source: AnyError,
}

impl HandlerError {
    pub fn new(kind: HandlerErrorKind, source: AnyError) -> Self {
        Self { kind, source }
    }

    pub fn failed(source: impl Into<AnyError>) -> Self {
        Self::new(HandlerErrorKind::Failed, source.into())
    }

    pub fn msg(message: impl std::fmt::Display + std::fmt::Debug + Send + Sync + 'static) -> Self {
        Self::new(HandlerErrorKind::Failed, anyhow::anyhow!(message))
    }

    pub fn cancelled() -> Self {
        Self::new(
            HandlerErrorKind::Cancelled,
            anyhow::anyhow!("handler cancelled by processor shutdown"),
        )
    }

    pub fn panicked(message: impl Into<String>) -> Self {
        Self::new(
            HandlerErrorKind::Panicked,
            anyhow::anyhow!("handler panicked: {}", message.into()),
        )
    }

    pub fn kind(&self) -> HandlerErrorKind {
        self.kind
    }

    pub fn is_cancelled(&self) -> bool {
        self.kind == HandlerErrorKind::Cancelled
    }

    /// Text recorded as the dead-letter detail. Includes the error chain.
    pub fn detail(&self) -> String {
        format!("{:#}", self.source)
    }

    pub fn into_source(self) -> AnyError {
        self.source
    }
}

impl core::fmt::Display for HandlerError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:#}", self.source)
    }
}

impl std::error::Error for HandlerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.source.as_ref())
    }
}

impl From<AnyError> for HandlerError {
    fn from(source: AnyError) -> Self {
        Self::new(HandlerErrorKind::Failed, source)
    }
}

/// Per-invocation context passed alongside the envelope.
#[derive(Debug, Clone)]
pub struct HandlerContext {
    delivery_count: u32,
    cancellation: CancellationToken,
}

impl HandlerContext {
    pub fn new(delivery_count: u32, cancellation: CancellationToken) -> Self {
        Self {
            delivery_count,
            cancellation,
        }
    }

    pub fn delivery_count(&self) -> u32 {
        self.delivery_count
    }

    /// Cancelled when the owning processor begins to stop. Handlers may honour
    /// it at their own suspension points by returning [`HandlerError::cancelled`].
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }
}

/// Business logic invoked once per delivered message.
///
/// Implementations must be safe to call concurrently for distinct envelopes
/// and must not keep the envelope beyond the returned future.
pub trait MessageHandler: Send + Sync + 'static {
    fn handle<'a>(
        &'a self,
        envelope: &'a MessageEnvelope,
        context: HandlerContext,
    ) -> HandlerFuture<'a>;
}

impl<H: MessageHandler + ?Sized> MessageHandler for Arc<H> {
    fn handle<'a>(
        &'a self,
        envelope: &'a MessageEnvelope,
        context: HandlerContext,
    ) -> HandlerFuture<'a> {
        (**self).handle(envelope, context)
    }
}

/// Adapts a closure returning a future into a [`MessageHandler`].
///
/// The closure receives an owned envelope clone so the returned future can be
/// `'static`.
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(MessageEnvelope, HandlerContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    FnHandler { f }
}

pub struct FnHandler<F> {
    f: F,
}

impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(MessageEnvelope, HandlerContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    fn handle<'a>(
        &'a self,
        envelope: &'a MessageEnvelope,
        context: HandlerContext,
    ) -> HandlerFuture<'a> {
        Box::pin((self.f)(envelope.clone(), context))
    }
}
