//! Message model shared by commands, queries and events.
//!
//! All three kinds have the same shape; they differ only in how many handlers
//! receive them and whether a reply is expected. The kind is carried by the
//! newtype wrapper ([`Command`], [`Query`], [`Event`]) rather than by the
//! message itself.

use std::fmt;
use std::ops::Deref;

use serde::{Deserialize, Serialize};

use crate::clock::{ClockSource, SystemClock};
use crate::types::{Bag, Value};

/// Metadata key under which the correlation id travels.
pub const CORRELATION_ID_KEY: &str = "correlationId";

/// Delivery category of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    /// Intent to change state, exactly one handler.
    Command,
    /// Request for data, exactly one handler, must produce a value.
    Query,
    /// Notification of a fact, zero or more handlers.
    Event,
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageKind::Command => write!(f, "command"),
            MessageKind::Query => write!(f, "query"),
            MessageKind::Event => write!(f, "event"),
        }
    }
}

/// Errors from constructing a [`Message`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MessageError {
    #[error("message type must not be empty")]
    EmptyType,
}

/// Raw message fields, used for serialization and for building a message
/// from parts that were produced elsewhere.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageProps {
    pub id: String,
    #[serde(rename = "type")]
    pub message_type: String,
    #[serde(default)]
    pub payload: Bag,
    #[serde(default)]
    pub metadata: Bag,
    pub timestamp: u64,
}

/// Immutable message value.
///
/// `message_type` is the routing key used for handler lookup and is
/// guaranteed non-empty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "MessageProps", into = "MessageProps")]
pub struct Message {
    id: String,
    message_type: String,
    payload: Bag,
    metadata: Bag,
    timestamp: u64,
}

impl Message {
    /// Starts building a message of the given type.
    #[must_use]
    pub fn builder(message_type: impl Into<String>) -> MessageBuilder {
        MessageBuilder::new(message_type)
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn message_type(&self) -> &str {
        &self.message_type
    }

    #[must_use]
    pub fn payload(&self) -> &Bag {
        &self.payload
    }

    #[must_use]
    pub fn metadata(&self) -> &Bag {
        &self.metadata
    }

    /// Producer-assigned timestamp in milliseconds since Unix epoch.
    #[must_use]
    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    /// Correlation id from metadata, if one was attached.
    #[must_use]
    pub fn correlation_id(&self) -> Option<&str> {
        self.metadata.get(CORRELATION_ID_KEY).and_then(Value::as_str)
    }
}

impl TryFrom<MessageProps> for Message {
    type Error = MessageError;

    fn try_from(props: MessageProps) -> Result<Self, Self::Error> {
        if props.message_type.is_empty() {
            return Err(MessageError::EmptyType);
        }
        Ok(Self {
            id: props.id,
            message_type: props.message_type,
            payload: props.payload,
            metadata: props.metadata,
            timestamp: props.timestamp,
        })
    }
}

impl From<Message> for MessageProps {
    fn from(msg: Message) -> Self {
        Self {
            id: msg.id,
            message_type: msg.message_type,
            payload: msg.payload,
            metadata: msg.metadata,
            timestamp: msg.timestamp,
        }
    }
}

// ---------------------------------------------------------------------------
// MessageBuilder
// ---------------------------------------------------------------------------

/// Builder for [`Message`]. Defaults to a random v4 UUID id and the current
/// system time.
#[derive(Debug)]
pub struct MessageBuilder {
    id: Option<String>,
    message_type: String,
    payload: Bag,
    metadata: Bag,
    timestamp: Option<u64>,
}

impl MessageBuilder {
    fn new(message_type: impl Into<String>) -> Self {
        Self {
            id: None,
            message_type: message_type.into(),
            payload: Bag::new(),
            metadata: Bag::new(),
            timestamp: None,
        }
    }

    #[must_use]
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Adds one payload entry, replacing any previous value for `key`.
    #[must_use]
    pub fn payload(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.payload.insert(key.into(), value.into());
        self
    }

    /// Replaces the whole payload bag.
    #[must_use]
    pub fn payload_bag(mut self, payload: Bag) -> Self {
        self.payload = payload;
        self
    }

    #[must_use]
    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn correlation_id(self, correlation_id: impl Into<String>) -> Self {
        self.metadata(CORRELATION_ID_KEY, correlation_id.into())
    }

    /// Links this message to the one that caused it: the parent's correlation
    /// id is reused, or the parent's id when it had none.
    #[must_use]
    pub fn caused_by(self, parent: &Message) -> Self {
        let correlation = parent.correlation_id().unwrap_or(parent.id()).to_string();
        self.correlation_id(correlation)
    }

    #[must_use]
    pub fn timestamp(mut self, millis: u64) -> Self {
        self.timestamp = Some(millis);
        self
    }

    /// Stamps the message with the given clock instead of the system clock.
    #[must_use]
    pub fn clock(mut self, clock: &dyn ClockSource) -> Self {
        self.timestamp = Some(clock.now());
        self
    }

    /// Finishes the message.
    ///
    /// # Errors
    ///
    /// Returns [`MessageError::EmptyType`] if the message type is empty.
    pub fn build(self) -> Result<Message, MessageError> {
        Message::try_from(MessageProps {
            id: self
                .id
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            message_type: self.message_type,
            payload: self.payload,
            metadata: self.metadata,
            timestamp: self.timestamp.unwrap_or_else(|| SystemClock.now()),
        })
    }
}

// ---------------------------------------------------------------------------
// Kinds
// ---------------------------------------------------------------------------

/// A message wrapper that fixes its delivery kind and reply type.
pub trait Dispatchable: Send + Sync + 'static {
    /// What a handler produces for this kind.
    type Reply: Send + 'static;

    const KIND: MessageKind;

    fn message(&self) -> &Message;

    fn message_type(&self) -> &str {
        self.message().message_type()
    }
}

macro_rules! message_kind {
    ($(#[$doc:meta])* $name:ident, $kind:expr, $reply:ty) => {
        $(#[$doc])*
        #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Message);

        impl $name {
            #[must_use]
            pub fn new(message: Message) -> Self {
                Self(message)
            }

            #[must_use]
            pub fn into_message(self) -> Message {
                self.0
            }
        }

        impl From<Message> for $name {
            fn from(message: Message) -> Self {
                Self(message)
            }
        }

        impl Deref for $name {
            type Target = Message;

            fn deref(&self) -> &Message {
                &self.0
            }
        }

        impl Dispatchable for $name {
            type Reply = $reply;

            const KIND: MessageKind = $kind;

            fn message(&self) -> &Message {
                &self.0
            }
        }
    };
}

message_kind!(
    /// Intent to change state. Handled by exactly one handler, no reply.
    Command,
    MessageKind::Command,
    ()
);

message_kind!(
    /// Request for data. Handled by exactly one handler; `None` is an absent
    /// result and is rejected by the bus.
    Query,
    MessageKind::Query,
    Option<Value>
);

message_kind!(
    /// Announcement of a fact. Delivered to every registered handler.
    Event,
    MessageKind::Event,
    ()
);
