//! Bounded retry decorator.

use std::time::Duration;

use async_trait::async_trait;
use courier_core::Dispatchable;

use crate::error::BusError;
use crate::handler::Handler;

/// How many extra attempts a failed call gets, and how long to wait between them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum additional attempts after the first failure.
    pub retries: u32,
    /// Delay before each additional attempt.
    pub interval: Duration,
}

impl RetryPolicy {
    #[must_use]
    pub fn new(retries: u32, interval: Duration) -> Self {
        Self { retries, interval }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 3,
            interval: Duration::from_millis(100),
        }
    }
}

/// Handler decorator that retries failures of the wrapped handler.
///
/// Every `Err` is retried, whatever its variant, until `retries` extra
/// attempts have been made; the last failure is then returned unchanged.
/// Attempt counting is local to each `handle` call, so concurrent calls on a
/// shared instance never see each other's attempts. The delay is a tokio
/// sleep and does not block other dispatches.
#[derive(Debug)]
pub struct RetryableHandler<H> {
    inner: H,
    policy: RetryPolicy,
}

impl<H> RetryableHandler<H> {
    #[must_use]
    pub fn new(inner: H, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    #[must_use]
    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    #[must_use]
    pub fn inner(&self) -> &H {
        &self.inner
    }
}

#[async_trait]
impl<M, H> Handler<M> for RetryableHandler<H>
where
    M: Dispatchable,
    H: Handler<M>,
{
    fn can_handle(&self, message: &M) -> bool {
        self.inner.can_handle(message)
    }

    async fn handle(&self, message: &M) -> Result<M::Reply, BusError> {
        let mut attempts = 0;
        loop {
            match self.inner.handle(message).await {
                Ok(reply) => return Ok(reply),
                Err(err) if attempts < self.policy.retries => {
                    attempts += 1;
                    tracing::debug!(
                        message_type = message.message_type(),
                        attempt = attempts,
                        retries = self.policy.retries,
                        error = %err,
                        "handler failed, retrying"
                    );
                    tokio::time::sleep(self.policy.interval).await;
                }
                Err(err) => {
                    if attempts > 0 {
                        tracing::warn!(
                            message_type = message.message_type(),
                            attempts = attempts + 1,
                            error = %err,
                            "handler failed after retries"
                        );
                    }
                    return Err(err);
                }
            }
        }
    }
}
