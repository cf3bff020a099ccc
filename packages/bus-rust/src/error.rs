use courier_core::MessageKind;

/// Errors returned by handlers, middleware and the bus itself.
///
/// Every failure a caller can observe goes through this one channel, whether
/// it came from the bus (missing handler, absent query result), a resilience
/// decorator, a middleware, or the handler body.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("no handler registered for {kind} type {message_type}")]
    HandlerNotFound {
        kind: MessageKind,
        message_type: String,
    },
    #[error("query handler for {message_type} did not return a result")]
    NoResultProduced { message_type: String },
    #[error("circuit breaker is open, retry after {retry_after_ms}ms")]
    CircuitOpen { retry_after_ms: u64 },
    #[error("handler failed: {0}")]
    HandlerFailure(#[from] anyhow::Error),
    #[error("dispatch timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
    #[error("bus overloaded, try again later")]
    Overloaded,
    #[error("dispatch rejected: {reason}")]
    Rejected { reason: String },
    #[error("{} of {total} handlers failed for event {event_type}", .failures.len())]
    EventHandlersFailed {
        event_type: String,
        total: usize,
        failures: Vec<EventHandlerFailure>,
    },
}

/// One failed delivery inside a publish.
#[derive(Debug)]
pub struct EventHandlerFailure {
    /// Zero-based registration position of the handler that failed.
    pub position: usize,
    pub error: BusError,
}

impl BusError {
    /// Shorthand for a handler failure with a plain message.
    pub fn failure(msg: impl std::fmt::Display + std::fmt::Debug + Send + Sync + 'static) -> Self {
        BusError::HandlerFailure(anyhow::Error::msg(msg))
    }
}
