//! Shared types for the threshold signing service.
//!
//! Everything here is plain data: peer identities, session identifiers,
//! the wire message type registry and the service-level error kinds that
//! every other crate reports through.

pub mod error;
pub mod message;
pub mod peer;

pub use error::{Error, Result};
pub use message::{MessageType, UnknownMessageType};
pub use peer::{PeerId, PeerIdError, SessionId};
