//! Resilience decorators: handlers that wrap another handler and add a
//! failure-recovery policy.
//!
//! - [`retry`]: bounded retry with a fixed interval
//! - [`circuit_breaker`]: closed / open / half-open breaker
//!
//! Both implement [`Handler`](crate::Handler) and nest freely, e.g.
//! `RetryableHandler::new(CircuitBreakerHandler::new(h, cb), retry)`.

pub mod circuit_breaker;
pub mod retry;

pub use circuit_breaker::{CircuitBreakerHandler, CircuitBreakerPolicy, CircuitState};
pub use retry::{RetryPolicy, RetryableHandler};
