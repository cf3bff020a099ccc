//! Tower adapter: exposes a [`MessageBus`] as a `tower::Service<Envelope>`.
//!
//! Lets the bus sit behind tower layers (buffering, rate limits, ...) or be
//! driven by code that already speaks `Service`.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use courier_core::{Command, Event, MessageKind, Query, Value};
use tower::Service;

use crate::bus::MessageBus;
use crate::error::BusError;

// ---------------------------------------------------------------------------
// Envelope / Reply
// ---------------------------------------------------------------------------

/// A message tagged with how it should be delivered.
#[derive(Debug, Clone)]
pub enum Envelope {
    Command(Command),
    Query(Query),
    Event(Event),
}

impl Envelope {
    #[must_use]
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Command(_) => MessageKind::Command,
            Self::Query(_) => MessageKind::Query,
            Self::Event(_) => MessageKind::Event,
        }
    }
}

impl From<Command> for Envelope {
    fn from(command: Command) -> Self {
        Self::Command(command)
    }
}

impl From<Query> for Envelope {
    fn from(query: Query) -> Self {
        Self::Query(query)
    }
}

impl From<Event> for Envelope {
    fn from(event: Event) -> Self {
        Self::Event(event)
    }
}

/// Result of a successful envelope dispatch.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// A command or event completed.
    Done,
    /// A query produced a value.
    Value(Value),
}

impl MessageBus {
    /// Dispatches an envelope with the matching `send_*` / `publish_*` call.
    ///
    /// # Errors
    ///
    /// Same as the underlying dispatch operation.
    pub async fn dispatch(&self, envelope: &Envelope) -> Result<Reply, BusError> {
        match envelope {
            Envelope::Command(command) => self.send_command(command).await.map(|()| Reply::Done),
            Envelope::Query(query) => self.send_query(query).await.map(Reply::Value),
            Envelope::Event(event) => self.publish_event(event).await.map(|()| Reply::Done),
        }
    }
}

// ---------------------------------------------------------------------------
// BusService
// ---------------------------------------------------------------------------

type BoxedFuture = Pin<Box<dyn Future<Output = Result<Reply, BusError>> + Send>>;

/// `tower::Service` backed by a shared [`MessageBus`]. Always ready; back
/// pressure comes from the bus's own middleware.
#[derive(Debug, Clone)]
pub struct BusService {
    bus: Arc<MessageBus>,
}

impl BusService {
    #[must_use]
    pub fn new(bus: Arc<MessageBus>) -> Self {
        Self { bus }
    }

    #[must_use]
    pub fn bus(&self) -> &Arc<MessageBus> {
        &self.bus
    }
}

impl Service<Envelope> for BusService {
    type Response = Reply;
    type Error = BusError;
    type Future = BoxedFuture;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, envelope: Envelope) -> Self::Future {
        let bus = Arc::clone(&self.bus);
        Box::pin(async move { bus.dispatch(&envelope).await })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
