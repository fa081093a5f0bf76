//! muxline: a multiplexed line and message protocol server.
//!
//! One thread serves many TCP connections (and optionally UDP datagrams)
//! from a single readiness loop. Every connection owns a frame assembler,
//! a protocol phase and a write queue; protocol logic plugs in through the
//! `Dispatcher` trait.
//!
//! Protocols:
//! - FTP-style login and `DELE`
//! - SMTP-style mail submission
//! - Echo, reverse and hash (MD5 or SHA-256) services
//! - JSON or XML chat messages, optionally zlib-compressed
//!
//! Configuration via CLI arguments or TOML file.

pub mod config;
pub mod protocols;
pub mod runtime;

use config::{Config, Protocol};
use protocols::chat::ChatDispatcher;
use protocols::echo::{EchoDispatcher, EchoMode};
use protocols::ftp::{DirStore, FtpDispatcher};
use protocols::hash::HashDispatcher;
use protocols::smtp::SmtpDispatcher;
use std::io;

/// Serve the configured protocol until shutdown.
pub fn run(config: &Config) -> io::Result<()> {
    let framing = config.framing();
    match config.protocol {
        Protocol::Ftp => {
            let store = DirStore::new(config.ftp_root.clone());
            let users = config.ftp_users.clone();
            runtime::serve(config, FtpDispatcher::new(framing, users, store))
        }
        Protocol::Smtp => runtime::serve(config, SmtpDispatcher::new(framing)),
        Protocol::Echo => runtime::serve(config, EchoDispatcher::new(framing, EchoMode::Echo)),
        Protocol::Reverse => {
            runtime::serve(config, EchoDispatcher::new(framing, EchoMode::Reverse))
        }
        Protocol::Hash => {
            runtime::serve(config, HashDispatcher::new(framing, config.hash_algorithm))
        }
        Protocol::Chat => {
            runtime::serve(config, ChatDispatcher::new(framing, config.chat_codec()))
        }
    }
}
