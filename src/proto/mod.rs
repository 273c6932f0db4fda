//! Wire Layer
//!
//! Everything that crosses a socket lives here: the length-prefixed frame
//! transport, the typed request/response payloads, and the ticket codec.

pub mod framing;
pub mod message;
pub mod ticket;
