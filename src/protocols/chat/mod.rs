//! Chat message protocol.
//!
//! Each length-prefixed frame carries one chat message, as JSON by default:
//!
//! ```text
//! {"username":"Gracie","text":"Hello, World!","timestamp":"2024-03-01 12:00:00.000000"}
//! ```
//!
//! or as XML with the same fields under a `message` root element. Either
//! format may be zlib-compressed.
//!
//! The server answers every frame with an acknowledgement in the same
//! encoding, or with an error object when the frame does not decode.
//! Either way the connection stays open.

pub mod codec;
pub mod handler;
pub mod message;

pub use codec::{PayloadCodec, PayloadFormat};
pub use handler::ChatDispatcher;
pub use message::{ChatError, ChatMessage};
