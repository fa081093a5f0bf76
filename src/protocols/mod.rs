//! Protocol implementations.
//!
//! Each protocol is a `Dispatcher` the runtime drives frame by frame.
//!
//! ## Command Protocols
//! - `ftp`: login and file deletion (`USER`, `PASS`, `DELE`, `QUIT`)
//! - `smtp`: mail submission with a `DATA` transfer phase
//!
//! ## Message Protocols
//! - `echo`: echo and reverse services
//! - `hash`: SHA-256 digest service
//! - `chat`: JSON chat messages with timestamps

pub mod chat;
pub mod command;
pub mod echo;
pub mod ftp;
pub mod hash;
pub mod smtp;
