//! Message bus: handler registries, the middleware chain, and dispatch.

use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use arc_swap::ArcSwap;
use courier_core::{Command, Dispatchable, Event, Query, Value};
use dashmap::DashMap;
use futures_util::FutureExt;
use parking_lot::Mutex;

use crate::config::BusConfig;
use crate::error::{BusError, EventHandlerFailure};
use crate::handler::{Handler, SharedHandler};
use crate::middleware::{
    build_dispatch_pipeline, terminal, Dispatch, Middleware, Next, SharedMiddleware, Terminal,
};

// ---------------------------------------------------------------------------
// MessageBus
// ---------------------------------------------------------------------------

/// In-process bus routing commands, queries and events to their handlers.
///
/// Registries are keyed by message type:
/// - **Commands / queries**: one handler per type, last registration wins
/// - **Events**: ordered list per type, appended on every registration
///
/// Every dispatch runs through the middleware chain, first registered
/// outermost. Registration and dispatch may happen concurrently: each dispatch
/// works on the handlers and chain it saw when it started.
pub struct MessageBus {
    command_handlers: DashMap<String, SharedHandler<Command>>,
    query_handlers: DashMap<String, SharedHandler<Query>>,
    event_handlers: DashMap<String, Vec<SharedHandler<Event>>>,
    middleware: ArcSwap<Vec<SharedMiddleware>>,
}

impl MessageBus {
    /// Creates a bus with no handlers and an empty middleware chain.
    #[must_use]
    pub fn new() -> Self {
        Self {
            command_handlers: DashMap::new(),
            query_handlers: DashMap::new(),
            event_handlers: DashMap::new(),
            middleware: ArcSwap::from_pointee(Vec::new()),
        }
    }

    /// Creates a bus whose chain starts with the built-in middleware enabled in `config`.
    #[must_use]
    pub fn with_config(config: &BusConfig) -> Self {
        let bus = Self::new();
        for middleware in build_dispatch_pipeline(config) {
            bus.use_shared_middleware(middleware);
        }
        bus
    }

    // -- middleware ---------------------------------------------------------

    /// Appends a middleware to the chain.
    pub fn use_middleware<M: Middleware + 'static>(&self, middleware: M) {
        self.use_shared_middleware(Arc::new(middleware));
    }

    /// Appends an already shared middleware to the chain.
    pub fn use_shared_middleware(&self, middleware: SharedMiddleware) {
        self.middleware.rcu(|chain| {
            let mut next = Vec::clone(chain);
            next.push(middleware.clone());
            next
        });
    }

    #[must_use]
    pub fn middleware_count(&self) -> usize {
        self.middleware.load().len()
    }

    // -- registration -------------------------------------------------------

    /// Registers the handler for a command type, replacing any previous one.
    pub fn register_command_handler<H>(&self, command_type: impl Into<String>, handler: H)
    where
        H: Handler<Command> + 'static,
    {
        let command_type = command_type.into();
        if self
            .command_handlers
            .insert(command_type.clone(), Arc::new(handler))
            .is_some()
        {
            tracing::debug!(command_type, "replaced command handler");
        }
    }

    /// Registers the handler for a query type, replacing any previous one.
    pub fn register_query_handler<H>(&self, query_type: impl Into<String>, handler: H)
    where
        H: Handler<Query> + 'static,
    {
        let query_type = query_type.into();
        if self
            .query_handlers
            .insert(query_type.clone(), Arc::new(handler))
            .is_some()
        {
            tracing::debug!(query_type, "replaced query handler");
        }
    }

    /// Appends a handler for an event type. The same handler may be added twice.
    pub fn register_event_handler<H>(&self, event_type: impl Into<String>, handler: H)
    where
        H: Handler<Event> + 'static,
    {
        self.event_handlers
            .entry(event_type.into())
            .or_default()
            .push(Arc::new(handler));
    }

    #[must_use]
    pub fn has_command_handler(&self, command_type: &str) -> bool {
        self.command_handlers.contains_key(command_type)
    }

    #[must_use]
    pub fn has_query_handler(&self, query_type: &str) -> bool {
        self.query_handlers.contains_key(query_type)
    }

    #[must_use]
    pub fn event_handler_count(&self, event_type: &str) -> usize {
        self.event_handlers
            .get(event_type)
            .map_or(0, |handlers| handlers.len())
    }

    // -- dispatch -----------------------------------------------------------

    /// Sends a command to its handler through the middleware chain.
    ///
    /// # Errors
    ///
    /// `HandlerNotFound` when no eligible handler is registered (no middleware
    /// runs), otherwise whatever the chain or handler returned.
    pub async fn send_command(&self, command: &Command) -> Result<(), BusError> {
        let handler = resolve(&self.command_handlers, command)?;
        let chain = self.middleware.load_full();

        run_chain(
            &chain,
            command,
            terminal(move || async move { handler.handle(command).await }),
        )
        .await
    }

    /// Sends a query to its handler and returns the handler's value.
    ///
    /// # Errors
    ///
    /// `HandlerNotFound` when no eligible handler is registered,
    /// `NoResultProduced` when the chain completes without a value (the
    /// handler returned `None`, or a middleware short-circuited), otherwise
    /// whatever the chain or handler returned.
    pub async fn send_query(&self, query: &Query) -> Result<Value, BusError> {
        let handler = resolve(&self.query_handlers, query)?;
        let chain = self.middleware.load_full();
        let slot: Mutex<Option<Value>> = Mutex::new(None);
        let result_slot = &slot;

        run_chain(
            &chain,
            query,
            terminal(move || async move {
                let reply = handler.handle(query).await?;
                *result_slot.lock() = reply;
                Ok(())
            }),
        )
        .await?;

        slot.into_inner().ok_or_else(|| BusError::NoResultProduced {
            message_type: query.message_type().to_string(),
        })
    }

    /// Publishes an event to every handler registered for its type.
    ///
    /// Handlers run one after another in registration order, each through its
    /// own pass of the middleware chain. A failing handler does not stop the
    /// ones after it, and neither does one that panics: the panic is caught
    /// and reported as that delivery's `HandlerFailure`.
    ///
    /// # Errors
    ///
    /// `EventHandlersFailed` listing every failed delivery. Publishing to a
    /// type with no handlers succeeds.
    pub async fn publish_event(&self, event: &Event) -> Result<(), BusError> {
        let event_type = event.message_type();
        let handlers: Vec<SharedHandler<Event>> = self
            .event_handlers
            .get(event_type)
            .map(|entry| entry.value().clone())
            .unwrap_or_default();
        let chain = self.middleware.load_full();
        let total = handlers.len();
        let mut failures = Vec::new();

        for (position, handler) in handlers.into_iter().enumerate() {
            if !handler.can_handle(event) {
                tracing::trace!(event_type, position, "event handler declined");
                continue;
            }

            let delivery = run_chain(
                &chain,
                event,
                terminal(move || async move { handler.handle(event).await }),
            );
            let result = AssertUnwindSafe(delivery)
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| Err(BusError::failure(panic_message(panic.as_ref()))));

            if let Err(error) = result {
                tracing::warn!(event_type, position, error = %error, "event handler failed");
                failures.push(EventHandlerFailure { position, error });
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(BusError::EventHandlersFailed {
                event_type: event_type.to_string(),
                total,
                failures,
            })
        }
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for MessageBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageBus")
            .field("command_handlers", &self.command_handlers.len())
            .field("query_handlers", &self.query_handlers.len())
            .field("event_types", &self.event_handlers.len())
            .field("middleware", &self.middleware_count())
            .finish()
    }
}

/// Looks up the single handler for a command or query.
fn resolve<M: Dispatchable>(
    registry: &DashMap<String, SharedHandler<M>>,
    message: &M,
) -> Result<SharedHandler<M>, BusError> {
    registry
        .get(message.message_type())
        .map(|entry| entry.value().clone())
        .filter(|handler| handler.can_handle(message))
        .ok_or_else(|| BusError::HandlerNotFound {
            kind: M::KIND,
            message_type: message.message_type().to_string(),
        })
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    let detail = panic
        .downcast_ref::<&str>()
        .map(|msg| (*msg).to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string payload".to_string());
    format!("handler panicked: {detail}")
}

async fn run_chain<'a, M: Dispatchable>(
    chain: &'a [SharedMiddleware],
    message: &'a M,
    terminal: Terminal<'a>,
) -> Result<(), BusError> {
    Next::new(chain, Dispatch::new(M::KIND, message.message()), terminal)
        .run()
        .await
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use courier_core::{Message, MessageKind};
    use proptest::prelude::*;

    use super::*;
    use crate::handler::handler_fn;
    use crate::middleware::{from_fn, TimeoutMiddleware};
    use crate::resilience::{
        CircuitBreakerHandler, CircuitBreakerPolicy, CircuitState, RetryPolicy, RetryableHandler,
    };

    type Log = Arc<Mutex<Vec<String>>>;

    /// Logs its label for every message; optionally fails.
    struct Recording {
        label: &'static str,
        log: Log,
        fail: bool,
    }

    impl Recording {
        fn ok(label: &'static str, log: &Log) -> Self {
            Self {
                label,
                log: log.clone(),
                fail: false,
            }
        }

        fn failing(label: &'static str, log: &Log) -> Self {
            Self {
                label,
                log: log.clone(),
                fail: true,
            }
        }

        fn record(&self) -> Result<(), BusError> {
            self.log.lock().push(self.label.to_string());
            if self.fail {
                Err(BusError::failure(format!("{} failed", self.label)))
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl Handler<Command> for Recording {
        async fn handle(&self, _cmd: &Command) -> Result<(), BusError> {
            self.record()
        }
    }

    #[async_trait]
    impl Handler<Event> for Recording {
        async fn handle(&self, _event: &Event) -> Result<(), BusError> {
            self.record()
        }
    }

    /// Logs `name:in` before continuing.
    struct Tag {
        name: String,
        log: Log,
    }

    #[async_trait]
    impl Middleware for Tag {
        async fn call<'a>(&self, _dispatch: Dispatch<'a>, next: Next<'a>) -> Result<(), BusError> {
            self.log.lock().push(format!("{}:in", self.name));
            next.run().await
        }
    }

    /// Returns `Ok(())` without continuing.
    struct Swallow;

    #[async_trait]
    impl Middleware for Swallow {
        async fn call<'a>(&self, _dispatch: Dispatch<'a>, _next: Next<'a>) -> Result<(), BusError> {
            Ok(())
        }
    }

    fn tag(name: &str, log: &Log) -> Tag {
        Tag {
            name: name.to_string(),
            log: log.clone(),
        }
    }

    fn new_log() -> Log {
        Arc::new(Mutex::new(Vec::new()))
    }

    fn command(message_type: &str) -> Command {
        Command::new(Message::builder(message_type).build().unwrap())
    }

    fn query(message_type: &str) -> Query {
        Query::new(Message::builder(message_type).build().unwrap())
    }

    fn event(message_type: &str) -> Event {
        Event::new(Message::builder(message_type).build().unwrap())
    }

    // -- commands -----------------------------------------------------------

    #[tokio::test]
    async fn unknown_command_is_not_found_and_runs_no_middleware() {
        let log = new_log();
        let bus = MessageBus::new();
        bus.use_middleware(tag("outer", &log));
        bus.register_command_handler("known", Recording::ok("h", &log));

        let err = bus.send_command(&command("unknown")).await.unwrap_err();
        assert!(matches!(
            err,
            BusError::HandlerNotFound { kind: MessageKind::Command, ref message_type }
                if message_type == "unknown"
        ));
        assert!(log.lock().is_empty());
    }

    #[tokio::test]
    async fn command_runs_through_middleware_to_handler() {
        let log = new_log();
        let bus = MessageBus::new();
        bus.use_middleware(tag("auth", &log));
        bus.use_middleware(tag("audit", &log));
        bus.register_command_handler("user.create", Recording::ok("handler", &log));

        bus.send_command(&command("user.create")).await.unwrap();
        assert_eq!(*log.lock(), vec!["auth:in", "audit:in", "handler"]);
    }

    #[tokio::test]
    async fn command_failure_is_returned_verbatim() {
        let log = new_log();
        let bus = MessageBus::new();
        bus.register_command_handler("user.create", Recording::failing("handler", &log));

        let err = bus.send_command(&command("user.create")).await.unwrap_err();
        assert_eq!(err.to_string(), "handler failed: handler failed");
    }

    #[tokio::test]
    async fn last_command_registration_wins() {
        let log = new_log();
        let bus = MessageBus::new();
        bus.register_command_handler("user.create", Recording::ok("first", &log));
        bus.register_command_handler("user.create", Recording::ok("second", &log));

        bus.send_command(&command("user.create")).await.unwrap();
        bus.send_command(&command("user.create")).await.unwrap();
        assert_eq!(*log.lock(), vec!["second", "second"]);
        assert!(bus.has_command_handler("user.create"));
    }

    #[tokio::test]
    async fn declining_command_handler_counts_as_missing() {
        struct OnlyAdmins;

        #[async_trait]
        impl Handler<Command> for OnlyAdmins {
            fn can_handle(&self, cmd: &Command) -> bool {
                cmd.metadata().get("role").and_then(Value::as_str) == Some("admin")
            }

            async fn handle(&self, _cmd: &Command) -> Result<(), BusError> {
                Ok(())
            }
        }

        let bus = MessageBus::new();
        bus.register_command_handler("user.delete", OnlyAdmins);

        let guest = Command::new(Message::builder("user.delete").build().unwrap());
        assert!(matches!(
            bus.send_command(&guest).await,
            Err(BusError::HandlerNotFound { .. })
        ));

        let admin = Command::new(
            Message::builder("user.delete")
                .metadata("role", "admin")
                .build()
                .unwrap(),
        );
        bus.send_command(&admin).await.unwrap();
    }

    // -- middleware ---------------------------------------------------------

    #[tokio::test]
    async fn short_circuit_skips_handler_and_later_middleware() {
        let log = new_log();
        let bus = MessageBus::new();
        bus.use_middleware(tag("first", &log));
        bus.use_middleware(Swallow);
        bus.use_middleware(tag("third", &log));
        bus.register_command_handler("job.run", Recording::ok("handler", &log));

        bus.send_command(&command("job.run")).await.unwrap();
        assert_eq!(*log.lock(), vec!["first:in"]);
    }

    #[tokio::test]
    async fn rejecting_middleware_fails_dispatch() {
        let bus = MessageBus::new();
        bus.use_middleware(from_fn(|dispatch, _next| {
            Box::pin(async move {
                Err(BusError::Rejected {
                    reason: format!("{} requires a session", dispatch.message_type()),
                })
            })
        }));
        bus.register_command_handler("job.run", handler_fn(|_cmd: Command| async { Ok(()) }));

        let err = bus.send_command(&command("job.run")).await.unwrap_err();
        assert_eq!(err.to_string(), "dispatch rejected: job.run requires a session");
    }

    #[tokio::test]
    async fn middleware_sees_kind_of_each_dispatch() {
        let kinds = Arc::new(Mutex::new(Vec::new()));
        let seen = kinds.clone();
        let bus = MessageBus::new();
        bus.use_middleware(from_fn(move |dispatch, next| {
            seen.lock().push(dispatch.kind());
            Box::pin(next.run())
        }));
        bus.register_command_handler("c", handler_fn(|_cmd: Command| async { Ok(()) }));
        bus.register_query_handler("q", handler_fn(|_q: Query| async { Ok(Some(Value::Null)) }));
        bus.register_event_handler("e", handler_fn(|_e: Event| async { Ok(()) }));

        bus.send_command(&command("c")).await.unwrap();
        bus.send_query(&query("q")).await.unwrap();
        bus.publish_event(&event("e")).await.unwrap();

        assert_eq!(
            *kinds.lock(),
            vec![MessageKind::Command, MessageKind::Query, MessageKind::Event]
        );
    }

    proptest! {
        #[test]
        fn middleware_runs_in_registration_order(len in 0usize..8) {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            let log = new_log();
            let bus = MessageBus::new();
            for i in 0..len {
                bus.use_middleware(tag(&i.to_string(), &log));
            }
            bus.register_command_handler("op", Recording::ok("handler", &log));

            runtime.block_on(bus.send_command(&command("op"))).unwrap();

            let mut expected: Vec<String> = (0..len).map(|i| format!("{i}:in")).collect();
            expected.push("handler".to_string());
            prop_assert_eq!(log.lock().clone(), expected);
        }
    }

    // -- queries ------------------------------------------------------------

    #[tokio::test]
    async fn query_returns_handler_value() {
        let bus = MessageBus::new();
        bus.use_middleware(tag("outer", &new_log()));
        bus.register_query_handler(
            "user.get",
            handler_fn(|q: Query| async move {
                Ok(Some(Value::from(format!("user for {}", q.message_type()))))
            }),
        );

        let value = bus.send_query(&query("user.get")).await.unwrap();
        assert_eq!(value, Value::from("user for user.get"));
    }

    #[tokio::test]
    async fn unknown_query_is_not_found_and_runs_no_middleware() {
        let log = new_log();
        let bus = MessageBus::new();
        bus.use_middleware(tag("outer", &log));

        let err = bus.send_query(&query("user.get")).await.unwrap_err();
        assert!(matches!(
            err,
            BusError::HandlerNotFound { kind: MessageKind::Query, .. }
        ));
        assert!(log.lock().is_empty());
    }

    #[tokio::test]
    async fn last_query_registration_wins() {
        let bus = MessageBus::new();
        bus.register_query_handler(
            "user.get",
            handler_fn(|_q: Query| async { Ok(Some(Value::from("v1"))) }),
        );
        bus.register_query_handler(
            "user.get",
            handler_fn(|_q: Query| async { Ok(Some(Value::from("v2"))) }),
        );

        assert_eq!(bus.send_query(&query("user.get")).await.unwrap(), Value::from("v2"));
        assert!(bus.has_query_handler("user.get"));
    }

    #[tokio::test]
    async fn absent_query_result_is_no_result_produced() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let bus = MessageBus::new();
        bus.register_query_handler(
            "user.get",
            handler_fn(move |_q: Query| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(None)
                }
            }),
        );

        let err = bus.send_query(&query("user.get")).await.unwrap_err();
        assert!(matches!(
            err,
            BusError::NoResultProduced { ref message_type } if message_type == "user.get"
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn short_circuited_query_has_no_result() {
        let bus = MessageBus::new();
        bus.use_middleware(Swallow);
        bus.register_query_handler(
            "user.get",
            handler_fn(|_q: Query| async { Ok(Some(Value::Bool(true))) }),
        );

        assert!(matches!(
            bus.send_query(&query("user.get")).await,
            Err(BusError::NoResultProduced { .. })
        ));
    }

    // -- events -------------------------------------------------------------

    #[tokio::test]
    async fn event_fans_out_in_order_despite_failures() {
        let log = new_log();
        let bus = MessageBus::new();
        bus.register_event_handler("order.placed", Recording::failing("h1", &log));
        bus.register_event_handler("order.placed", Recording::ok("h2", &log));
        bus.register_event_handler("order.placed", Recording::ok("h3", &log));

        let err = bus.publish_event(&event("order.placed")).await.unwrap_err();
        assert_eq!(*log.lock(), vec!["h1", "h2", "h3"]);

        let BusError::EventHandlersFailed {
            event_type,
            total,
            failures,
        } = err
        else {
            panic!("expected aggregate failure");
        };
        assert_eq!(event_type, "order.placed");
        assert_eq!(total, 3);
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].position, 0);
        assert_eq!(failures[0].error.to_string(), "handler failed: h1 failed");
    }

    #[tokio::test]
    async fn panicking_event_handler_does_not_stop_later_ones() {
        struct LedgerOffline;

        #[async_trait]
        impl Handler<Event> for LedgerOffline {
            async fn handle(&self, _event: &Event) -> Result<(), BusError> {
                panic!("ledger offline")
            }
        }

        let log = new_log();
        let bus = MessageBus::new();
        bus.register_event_handler("order.placed", LedgerOffline);
        bus.register_event_handler("order.placed", Recording::ok("mailer", &log));

        let err = bus.publish_event(&event("order.placed")).await.unwrap_err();
        assert_eq!(*log.lock(), vec!["mailer"]);

        let BusError::EventHandlersFailed { failures, .. } = err else {
            panic!("expected aggregate failure");
        };
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].position, 0);
        assert_eq!(
            failures[0].error.to_string(),
            "handler failed: handler panicked: ledger offline"
        );
    }

    #[tokio::test]
    async fn event_without_handlers_succeeds() {
        let log = new_log();
        let bus = MessageBus::new();
        bus.use_middleware(tag("outer", &log));

        bus.publish_event(&event("nobody.listens")).await.unwrap();
        assert!(log.lock().is_empty());
        assert_eq!(bus.event_handler_count("nobody.listens"), 0);
    }

    #[tokio::test]
    async fn each_event_handler_gets_its_own_chain_pass() {
        let log = new_log();
        let bus = MessageBus::new();
        bus.use_middleware(tag("mw", &log));
        bus.register_event_handler("tick", Recording::ok("a", &log));
        bus.register_event_handler("tick", Recording::ok("b", &log));

        bus.publish_event(&event("tick")).await.unwrap();
        assert_eq!(*log.lock(), vec!["mw:in", "a", "mw:in", "b"]);
    }

    #[tokio::test]
    async fn duplicate_event_registrations_are_kept() {
        let log = new_log();
        let bus = MessageBus::new();
        let shared = Arc::new(Recording::ok("same", &log));
        bus.register_event_handler("tick", shared.clone());
        bus.register_event_handler("tick", shared);

        bus.publish_event(&event("tick")).await.unwrap();
        assert_eq!(bus.event_handler_count("tick"), 2);
        assert_eq!(*log.lock(), vec!["same", "same"]);
    }

    #[tokio::test]
    async fn handlers_run_sequentially() {
        let active = Arc::new(AtomicU32::new(0));
        let overlap = Arc::new(AtomicU32::new(0));
        let bus = MessageBus::new();
        for _ in 0..3 {
            let active = active.clone();
            let overlap = overlap.clone();
            bus.register_event_handler(
                "tick",
                handler_fn(move |_e: Event| {
                    let active = active.clone();
                    let overlap = overlap.clone();
                    async move {
                        if active.fetch_add(1, Ordering::SeqCst) > 0 {
                            overlap.fetch_add(1, Ordering::SeqCst);
                        }
                        tokio::task::yield_now().await;
                        active.fetch_sub(1, Ordering::SeqCst);
                        Ok(())
                    }
                }),
            );
        }

        bus.publish_event(&event("tick")).await.unwrap();
        assert_eq!(overlap.load(Ordering::SeqCst), 0);
    }

    // -- composition & concurrency -----------------------------------------

    #[tokio::test(start_paused = true)]
    async fn decorated_handler_registers_like_any_other() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let flaky = handler_fn(move |_cmd: Command| {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(BusError::failure("transient"))
                } else {
                    Ok(())
                }
            }
        });
        let breaker = Arc::new(CircuitBreakerHandler::new(
            flaky,
            CircuitBreakerPolicy {
                failure_threshold: 5,
                ..CircuitBreakerPolicy::default()
            },
        ));

        let bus = MessageBus::new();
        bus.register_command_handler(
            "payment.charge",
            RetryableHandler::new(breaker.clone(), RetryPolicy::new(2, Duration::from_millis(10))),
        );

        bus.send_command(&command("payment.charge")).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.failure_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn timed_out_dispatches_open_the_circuit() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let hung = handler_fn(move |_cmd: Command| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                std::future::pending::<()>().await;
                Ok(())
            }
        });
        let breaker = Arc::new(CircuitBreakerHandler::new(
            hung,
            CircuitBreakerPolicy {
                failure_threshold: 3,
                cooldown_period: Duration::from_secs(60),
                reset_timeout: None,
            },
        ));

        let bus = MessageBus::new();
        bus.use_middleware(TimeoutMiddleware::new(Duration::from_millis(50)));
        bus.register_command_handler("inventory.sync", breaker.clone());

        let mut errors = Vec::new();
        for _ in 0..6 {
            errors.push(bus.send_command(&command("inventory.sync")).await.unwrap_err());
        }

        assert!(errors[..3]
            .iter()
            .all(|err| matches!(err, BusError::Timeout { timeout_ms: 50 })));
        assert!(errors[3..]
            .iter()
            .all(|err| matches!(err, BusError::CircuitOpen { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_dispatches_all_complete() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let bus = Arc::new(MessageBus::new());
        bus.register_command_handler(
            "inc",
            handler_fn(move |_cmd: Command| {
                let counter = counter.clone();
                async move {
                    tokio::task::yield_now().await;
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }),
        );

        let tasks: Vec<_> = (0..50)
            .map(|_| {
                let bus = bus.clone();
                tokio::spawn(async move { bus.send_command(&command("inc")).await })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 50);
    }

    #[test]
    fn with_config_installs_builtin_pipeline() {
        let config = BusConfig {
            dispatch_timeout: Some(Duration::from_secs(1)),
            max_concurrent_dispatches: Some(8),
            trace_dispatches: true,
        };
        let bus = MessageBus::with_config(&config);
        assert_eq!(bus.middleware_count(), 3);
        assert_eq!(MessageBus::default().middleware_count(), 0);
    }
}
