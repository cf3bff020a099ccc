//! Tracing middleware for dispatches.
//!
//! Records dispatch duration and outcome on a `tracing` span and emits one
//! event per completed dispatch.

use std::time::Instant;

use async_trait::async_trait;
use tracing::{info_span, Instrument};

use super::{Dispatch, Middleware, Next};
use crate::error::BusError;

/// Middleware that instruments every dispatch with a `dispatch` span.
#[derive(Debug, Clone, Copy, Default)]
pub struct TraceMiddleware;

#[async_trait]
impl Middleware for TraceMiddleware {
    async fn call<'a>(&self, dispatch: Dispatch<'a>, next: Next<'a>) -> Result<(), BusError> {
        let message = dispatch.message();
        let kind = dispatch.kind();

        let span = info_span!(
            "dispatch",
            kind = %kind,
            message_type = message.message_type(),
            message_id = message.id(),
            correlation_id = message.correlation_id().unwrap_or_default(),
            duration_ms = tracing::field::Empty,
            outcome = tracing::field::Empty,
        );

        async move {
            let start = Instant::now();
            let result = next.run().await;

            #[allow(clippy::cast_possible_truncation)]
            let duration_ms = start.elapsed().as_millis() as u64;
            let outcome = match &result {
                Ok(()) => "ok",
                Err(_) => "error",
            };

            tracing::Span::current().record("duration_ms", duration_ms);
            tracing::Span::current().record("outcome", outcome);

            match &result {
                Ok(()) => tracing::info!(
                    kind = %kind,
                    message_type = message.message_type(),
                    duration_ms,
                    outcome,
                    "dispatch complete"
                ),
                Err(err) => tracing::warn!(
                    kind = %kind,
                    message_type = message.message_type(),
                    duration_ms,
                    outcome,
                    error = %err,
                    "dispatch failed"
                ),
            }

            result
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use courier_core::{Message, MessageKind};

    use super::*;
    use crate::middleware::{terminal, SharedMiddleware};

    #[tokio::test]
    async fn passes_through_outcome() {
        let chain: Vec<SharedMiddleware> = vec![Arc::new(TraceMiddleware)];
        let msg = Message::builder("report.build").build().unwrap();

        let ok = Next::new(
            &chain,
            Dispatch::new(MessageKind::Command, &msg),
            terminal(|| async { Ok(()) }),
        )
        .run()
        .await;
        assert!(ok.is_ok());

        let err = Next::new(
            &chain,
            Dispatch::new(MessageKind::Command, &msg),
            terminal(|| async { Err(BusError::failure("render failed")) }),
        )
        .run()
        .await
        .unwrap_err();
        assert_eq!(err.to_string(), "handler failed: render failed");
    }
}
