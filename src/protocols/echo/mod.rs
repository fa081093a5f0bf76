//! Echo protocol.
//!
//! Each frame is returned unchanged (`echo`) or reversed (`reverse`), framed
//! the same way. With a decimal length header:
//!
//! ```text
//! Request:  5\r\nhello
//! Response: 5\r\nhello        (echo)
//! Response: 5\r\nolleh        (reverse)
//! ```
//!
//! Over UDP each datagram is one payload and the reply is the bare payload.

pub mod handler;

pub use handler::{EchoDispatcher, EchoMode};
