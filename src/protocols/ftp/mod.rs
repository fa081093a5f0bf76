//! FTP-style command protocol.
//!
//! The reference command/response protocol for the runtime:
//!
//! ```text
//! S: 220 Service ready
//! C: USER alice              S: 331 Username OK, need password
//! C: PASS secret             S: 230 User logged in
//! C: DELE notes.txt          S: 250 File deleted successfully
//! C: QUIT                    S: 221 Goodbye   (connection closed)
//! ```
//!
//! Unknown verbs get `502 Command not implemented` in any phase. Commands
//! other than USER/PASS/NOOP/QUIT require a login.

pub mod handler;
pub mod store;

pub use handler::{FtpDispatcher, FtpSession};
pub use store::{DirStore, FileStore, MemoryStore, StoreError};
