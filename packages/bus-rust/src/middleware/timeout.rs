//! Timeout middleware for dispatches.
//!
//! Fails dispatches that exceed their deadline with `BusError::Timeout`. The
//! deadline is the middleware default unless the message carries a
//! `timeoutMs` metadata entry.

use std::time::Duration;

use async_trait::async_trait;

use super::{Dispatch, Middleware, Next};
use crate::error::BusError;

/// Metadata key for a per-message timeout override, in milliseconds.
pub const TIMEOUT_MS_KEY: &str = "timeoutMs";

/// Middleware that enforces a deadline on the rest of the chain.
#[derive(Debug, Clone)]
pub struct TimeoutMiddleware {
    default_timeout: Duration,
}

impl TimeoutMiddleware {
    #[must_use]
    pub fn new(default_timeout: Duration) -> Self {
        Self { default_timeout }
    }

    fn timeout_for(&self, dispatch: &Dispatch<'_>) -> Duration {
        dispatch
            .message()
            .metadata()
            .get(TIMEOUT_MS_KEY)
            .and_then(courier_core::Value::as_i64)
            .and_then(|ms| u64::try_from(ms).ok())
            .map_or(self.default_timeout, Duration::from_millis)
    }
}

#[async_trait]
impl Middleware for TimeoutMiddleware {
    async fn call<'a>(&self, dispatch: Dispatch<'a>, next: Next<'a>) -> Result<(), BusError> {
        let duration = self.timeout_for(&dispatch);
        match tokio::time::timeout(duration, next.run()).await {
            Ok(result) => result,
            Err(_elapsed) => {
                #[allow(clippy::cast_possible_truncation)]
                let timeout_ms = duration.as_millis() as u64;
                Err(BusError::Timeout { timeout_ms })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use courier_core::{Message, MessageKind};

    use super::*;
    use crate::middleware::{terminal, SharedMiddleware};

    async fn run_slow(chain: &[SharedMiddleware], msg: &Message, delay_ms: u64) -> Result<(), BusError> {
        Next::new(
            chain,
            Dispatch::new(MessageKind::Command, msg),
            terminal(move || async move {
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                Ok(())
            }),
        )
        .run()
        .await
    }

    #[tokio::test(start_paused = true)]
    async fn completes_within_timeout() {
        let chain: Vec<SharedMiddleware> =
            vec![Arc::new(TimeoutMiddleware::new(Duration::from_millis(1000)))];
        let msg = Message::builder("slow").build().unwrap();

        assert!(run_slow(&chain, &msg, 10).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn exceeds_timeout_returns_error() {
        let chain: Vec<SharedMiddleware> =
            vec![Arc::new(TimeoutMiddleware::new(Duration::from_millis(50)))];
        let msg = Message::builder("slow").build().unwrap();

        let err = run_slow(&chain, &msg, 200).await.unwrap_err();
        assert!(matches!(err, BusError::Timeout { timeout_ms: 50 }));
    }

    #[tokio::test(start_paused = true)]
    async fn metadata_overrides_default() {
        let chain: Vec<SharedMiddleware> =
            vec![Arc::new(TimeoutMiddleware::new(Duration::from_millis(1000)))];
        let msg = Message::builder("slow")
            .metadata(TIMEOUT_MS_KEY, 20_i64)
            .build()
            .unwrap();

        let err = run_slow(&chain, &msg, 100).await.unwrap_err();
        assert!(matches!(err, BusError::Timeout { timeout_ms: 20 }));
    }
}
