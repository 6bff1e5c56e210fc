//! # murmur-shared
//!
//! Types shared by the network layer and the client: the chat domain model,
//! the event-stream protocol, fetch API records and the errors raised while
//! decoding or applying them. No I/O lives here.

pub mod constants;
pub mod error;
pub mod protocol;
pub mod records;
pub mod types;

pub use error::{ProtocolError, RecordError, StateError};
pub use protocol::{EventKind, InboundEvent, NewMessage, OutboundEvent, TypingUpdate};
pub use types::*;
