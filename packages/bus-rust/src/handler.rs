use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use courier_core::Dispatchable;

use crate::error::BusError;

/// Processes one kind of message.
///
/// Resilience decorators implement this same trait around another handler,
/// so a decorated handler registers with the bus like any other.
#[async_trait]
pub trait Handler<M: Dispatchable>: Send + Sync {
    /// Cheap eligibility check made before the middleware chain is built.
    fn can_handle(&self, _message: &M) -> bool {
        true
    }

    /// Handle the message. Must eventually resolve.
    async fn handle(&self, message: &M) -> Result<M::Reply, BusError>;
}

/// Shared, type-erased handler as stored in the bus registries.
pub type SharedHandler<M> = Arc<dyn Handler<M>>;

#[async_trait]
impl<M, H> Handler<M> for Arc<H>
where
    M: Dispatchable,
    H: Handler<M> + ?Sized,
{
    fn can_handle(&self, message: &M) -> bool {
        (**self).can_handle(message)
    }

    async fn handle(&self, message: &M) -> Result<M::Reply, BusError> {
        (**self).handle(message).await
    }
}

// ---------------------------------------------------------------------------
// Closure handlers
// ---------------------------------------------------------------------------

/// Handler backed by an async closure. Built with [`handler_fn`].
pub struct FnHandler<M, F> {
    f: F,
    _marker: PhantomData<fn(M)>,
}

/// Wraps an async closure as a [`Handler`]. The closure receives its own clone
/// of the message.
pub fn handler_fn<M, F, Fut>(f: F) -> FnHandler<M, F>
where
    M: Dispatchable + Clone,
    F: Fn(M) -> Fut + Send + Sync,
    Fut: Future<Output = Result<M::Reply, BusError>> + Send,
{
    FnHandler {
        f,
        _marker: PhantomData,
    }
}

#[async_trait]
impl<M, F, Fut> Handler<M> for FnHandler<M, F>
where
    M: Dispatchable + Clone,
    F: Fn(M) -> Fut + Send + Sync,
    Fut: Future<Output = Result<M::Reply, BusError>> + Send,
{
    async fn handle(&self, message: &M) -> Result<M::Reply, BusError> {
        (self.f)(message.clone()).await
    }
}
