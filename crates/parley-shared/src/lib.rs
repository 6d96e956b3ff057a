//! # parley-shared
//!
//! Types shared by the Parley store and server: user and connection
//! identifiers, deterministic conversation ids, sequence keys, the canonical
//! chat [`Message`] and the JSON events pushed over live connections.

pub mod constants;
pub mod error;
pub mod message;
pub mod protocol;
pub mod types;

pub use error::SharedError;
pub use message::{Message, MessageKind, OutgoingMessage};
pub use types::{ConnectionId, ConversationId, SequenceClock, SequenceKey, UserId};
