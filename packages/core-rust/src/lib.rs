//! Courier core: message model, untyped value bags, and clock sources.

pub mod clock;
pub mod message;
pub mod types;

pub use clock::{ClockSource, ManualClock, SystemClock};
pub use message::{
    Command, Dispatchable, Event, Message, MessageBuilder, MessageError, MessageKind,
    MessageProps, Query, CORRELATION_ID_KEY,
};
pub use types::{Bag, Value};
