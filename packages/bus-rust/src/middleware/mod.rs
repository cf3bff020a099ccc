//! Middleware chain applied to every dispatch.
//!
//! Middleware is continuation-passing: each one receives the [`Dispatch`] and a
//! [`Next`] that runs the rest of the chain and finally the handler. Not
//! running `next` short-circuits the dispatch with whatever the middleware
//! returns.
//!
//! Built-in middleware:
//! - [`load_shed`]: concurrency limiting
//! - [`timeout`]: per-dispatch deadline
//! - [`trace`]: timing and outcome via `tracing` spans
//! - [`pipeline`]: composes the built-ins from a [`BusConfig`](crate::BusConfig)

pub mod load_shed;
pub mod pipeline;
pub mod timeout;
pub mod trace;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use courier_core::{Message, MessageKind};

use crate::error::BusError;

pub use load_shed::LoadShedMiddleware;
pub use pipeline::build_dispatch_pipeline;
pub use timeout::TimeoutMiddleware;
pub use trace::TraceMiddleware;

/// Boxed, sendable future used at the type-erased seams of the chain.
pub type BoxedFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Final continuation of a chain: invokes the handler.
pub(crate) type Terminal<'a> = Box<dyn FnOnce() -> BoxedFuture<'a, Result<(), BusError>> + Send + 'a>;

/// Boxes a closure producing the handler future as a [`Terminal`].
pub(crate) fn terminal<'a, F, Fut>(f: F) -> Terminal<'a>
where
    F: FnOnce() -> Fut + Send + 'a,
    Fut: Future<Output = Result<(), BusError>> + Send + 'a,
{
    Box::new(move || -> BoxedFuture<'a, Result<(), BusError>> { Box::pin(f()) })
}

/// Shared middleware as stored in the bus.
pub type SharedMiddleware = Arc<dyn Middleware>;

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

/// The message being dispatched plus its delivery kind.
#[derive(Debug, Clone, Copy)]
pub struct Dispatch<'a> {
    kind: MessageKind,
    message: &'a Message,
}

impl<'a> Dispatch<'a> {
    #[must_use]
    pub fn new(kind: MessageKind, message: &'a Message) -> Self {
        Self { kind, message }
    }

    #[must_use]
    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    #[must_use]
    pub fn message(&self) -> &'a Message {
        self.message
    }

    #[must_use]
    pub fn message_type(&self) -> &'a str {
        self.message.message_type()
    }
}

// ---------------------------------------------------------------------------
// Middleware trait
// ---------------------------------------------------------------------------

/// Cross-cutting step wrapped around handler execution.
#[async_trait]
pub trait Middleware: Send + Sync {
    /// Inspect the dispatch and usually call `next.run().await`.
    async fn call<'a>(&self, dispatch: Dispatch<'a>, next: Next<'a>) -> Result<(), BusError>;
}

// ---------------------------------------------------------------------------
// Next
// ---------------------------------------------------------------------------

/// Continuation for the remainder of the chain.
///
/// Consumed by [`Next::run`], so each middleware can continue at most once.
pub struct Next<'a> {
    chain: &'a [SharedMiddleware],
    dispatch: Dispatch<'a>,
    terminal: Terminal<'a>,
}

impl<'a> Next<'a> {
    pub(crate) fn new(
        chain: &'a [SharedMiddleware],
        dispatch: Dispatch<'a>,
        terminal: Terminal<'a>,
    ) -> Self {
        Self {
            chain,
            dispatch,
            terminal,
        }
    }

    /// Run the next middleware, or the handler once the chain is exhausted.
    pub async fn run(self) -> Result<(), BusError> {
        match self.chain.split_first() {
            Some((head, rest)) => {
                let next = Next::new(rest, self.dispatch, self.terminal);
                head.call(self.dispatch, next).await
            }
            None => (self.terminal)().await,
        }
    }
}

// ---------------------------------------------------------------------------
// Closure middleware
// ---------------------------------------------------------------------------

/// Middleware backed by a closure. Built with [`from_fn`].
pub struct FnMiddleware<F> {
    f: F,
}

/// Wraps a closure as a [`Middleware`].
///
/// ```ignore
/// bus.use_middleware(from_fn(|dispatch, next| Box::pin(async move {
///     tracing::debug!(message_type = dispatch.message_type(), "before");
///     next.run().await
/// })));
/// ```
pub fn from_fn<F>(f: F) -> FnMiddleware<F>
where
    F: for<'a> Fn(Dispatch<'a>, Next<'a>) -> BoxedFuture<'a, Result<(), BusError>> + Send + Sync,
{
    FnMiddleware { f }
}

#[async_trait]
impl<F> Middleware for FnMiddleware<F>
where
    F: for<'a> Fn(Dispatch<'a>, Next<'a>) -> BoxedFuture<'a, Result<(), BusError>> + Send + Sync,
{
    async fn call<'a>(&self, dispatch: Dispatch<'a>, next: Next<'a>) -> Result<(), BusError> {
        (self.f)(dispatch, next).await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
