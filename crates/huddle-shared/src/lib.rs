//! # huddle-shared
//!
//! Types shared by the Huddle store and server: identifiers, the JSON wire
//! protocol spoken over each WebSocket, and protocol constants.

pub mod constants;
pub mod error;
pub mod protocol;
pub mod types;

pub use error::ProtocolError;
pub use types::{ConnectionId, ConversationId, EventId, UserId};
