//! Courier bus: in-process dispatch of commands, queries and events through an
//! ordered middleware chain, with retry and circuit-breaker handler decorators.

pub mod bus;
pub mod config;
pub mod error;
pub mod handler;
pub mod middleware;
pub mod resilience;
pub mod service;

pub use bus::MessageBus;
pub use config::BusConfig;
pub use error::{BusError, EventHandlerFailure};
pub use handler::{handler_fn, FnHandler, Handler, SharedHandler};
pub use middleware::{from_fn, Dispatch, FnMiddleware, Middleware, Next, SharedMiddleware};
pub use resilience::{
    CircuitBreakerHandler, CircuitBreakerPolicy, CircuitState, RetryPolicy, RetryableHandler,
};
pub use service::{BusService, Envelope, Reply};
