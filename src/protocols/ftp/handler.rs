//! FTP-style dispatcher.

use crate::protocols::command::{reply, Command};
use crate::protocols::ftp::store::{FileStore, StoreError};
use crate::runtime::{ConnId, Dispatch, Dispatcher, FrameError, Framing, Phase};
use bytes::Bytes;
use std::collections::HashMap;
use std::net::SocketAddr;
use tracing::{debug, info};

/// Per-connection login state.
#[derive(Debug, Default)]
pub struct FtpSession {
    /// Name given by `USER`, waiting for `PASS`.
    user: Option<String>,
    /// Name of the logged-in user.
    logged_in: Option<String>,
}

/// Dispatcher for the FTP-style command protocol.
pub struct FtpDispatcher<F> {
    framing: Framing,
    /// Accepted credentials; empty accepts any password.
    users: HashMap<String, String>,
    store: F,
}

impl<F: FileStore> FtpDispatcher<F> {
    pub fn new(framing: Framing, users: HashMap<String, String>, store: F) -> Self {
        Self {
            framing,
            users,
            store,
        }
    }

    pub fn store(&self) -> &F {
        &self.store
    }

    fn reply(&self, phase: Phase, code: u16, text: &str) -> Dispatch {
        Dispatch::reply(phase, reply(&self.framing, code, text))
    }

    fn check_password(&self, user: &str, password: &str) -> bool {
        self.users.is_empty() || self.users.get(user).is_some_and(|p| p == password)
    }

    fn delete(&mut self, phase: Phase, name: Option<&str>, id: ConnId) -> Dispatch {
        let Some(name) = name else {
            return self.reply(phase, 501, "Syntax error in parameters");
        };
        match self.store.delete(name) {
            Ok(()) => {
                info!(conn_id = id, file = name, "File deleted");
                self.reply(phase, 250, "File deleted successfully")
            }
            Err(StoreError::NotFound) => self.reply(phase, 550, "File not found"),
            Err(e) => {
                debug!(conn_id = id, file = name, error = %e, "Delete refused");
                self.reply(phase, 550, "Requested action not taken")
            }
        }
    }
}

impl<F: FileStore> Dispatcher for FtpDispatcher<F> {
    type Session = FtpSession;

    fn framing(&self) -> Framing {
        self.framing.clone()
    }

    fn open(&mut self, _id: ConnId, _peer: SocketAddr) -> (FtpSession, Option<Bytes>) {
        let greeting = reply(&self.framing, 220, "Service ready");
        (FtpSession::default(), Some(greeting))
    }

    fn handle(&mut self, phase: Phase, session: &mut FtpSession, frame: Bytes, id: ConnId) -> Dispatch {
        let Some(command) = Command::parse(&frame) else {
            return self.reply(phase, 500, "Syntax error, command unrecognized");
        };
        debug!(conn_id = id, verb = %command.verb, "Command");

        match command.verb.as_str() {
            "USER" => match command.arg {
                Some(name) => {
                    session.user = Some(name.to_string());
                    session.logged_in = None;
                    self.reply(Phase::New, 331, "Username OK, need password")
                }
                None => self.reply(phase, 501, "Syntax error in parameters"),
            },
            "PASS" => match session.user.take() {
                Some(user) => {
                    if self.check_password(&user, command.arg.unwrap_or("")) {
                        info!(conn_id = id, user = %user, "User logged in");
                        session.logged_in = Some(user);
                        self.reply(Phase::AwaitingCommand, 230, "User logged in")
                    } else {
                        debug!(conn_id = id, user = %user, "Login incorrect");
                        self.reply(Phase::New, 530, "Login incorrect")
                    }
                }
                None => self.reply(phase, 503, "Login with USER first"),
            },
            "QUIT" => Dispatch::close_with(reply(&self.framing, 221, "Goodbye")),
            "NOOP" => self.reply(phase, 200, "OK"),
            "DELE" if session.logged_in.is_none() => self.reply(phase, 530, "Not logged in"),
            "DELE" => self.delete(phase, command.arg, id),
            _ => self.reply(phase, 502, "Command not implemented"),
        }
    }

    fn frame_error(&mut self, error: &FrameError) -> Option<Bytes> {
        match error {
            FrameError::Oversize { .. } => Some(reply(&self.framing, 500, "Line too long")),
            FrameError::InvalidHeader | FrameError::EmptyDelimiter => {
                Some(reply(&self.framing, 500, "Syntax error, command unrecognized"))
            }
        }
    }
}
