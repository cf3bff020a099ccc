//! Load-shedding middleware for dispatches.
//!
//! Rejects dispatches with `BusError::Overloaded` when the number in flight
//! already equals the configured limit.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Semaphore;

use super::{Dispatch, Middleware, Next};
use crate::error::BusError;

/// Middleware that limits concurrent dispatches via a semaphore.
///
/// When all permits are taken, incoming dispatches are rejected immediately
/// rather than queued.
#[derive(Debug, Clone)]
pub struct LoadShedMiddleware {
    semaphore: Arc<Semaphore>,
}

impl LoadShedMiddleware {
    #[must_use]
    pub fn new(max_concurrent: u32) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent as usize)),
        }
    }

    /// Permits currently free.
    #[must_use]
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }
}

#[async_trait]
impl Middleware for LoadShedMiddleware {
    async fn call<'a>(&self, dispatch: Dispatch<'a>, next: Next<'a>) -> Result<(), BusError> {
        let Ok(permit) = self.semaphore.clone().try_acquire_owned() else {
            tracing::debug!(message_type = dispatch.message_type(), "shedding dispatch");
            return Err(BusError::Overloaded);
        };

        // Held until the rest of the chain finishes.
        let result = next.run().await;
        drop(permit);
        result
    }
}
