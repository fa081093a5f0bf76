//! SMTP-style dispatcher.

use crate::protocols::command::{keyword_value, reply, Command};
use crate::runtime::{ConnId, Dispatch, Dispatcher, FrameError, Framing, Phase};
use bytes::Bytes;
use std::net::SocketAddr;
use tracing::{debug, info};

/// A message accepted for delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mail {
    pub from: String,
    pub to: Vec<String>,
    /// Body lines joined with `\r\n`, dot-unstuffed.
    pub body: String,
}

/// Per-connection transaction state.
#[derive(Debug, Default)]
pub struct SmtpSession {
    client: Option<String>,
    from: Option<String>,
    to: Vec<String>,
    body: Vec<String>,
}

impl SmtpSession {
    fn reset(&mut self) {
        self.from = None;
        self.to.clear();
        self.body.clear();
    }
}

/// Dispatcher for the SMTP-style protocol. Accepted mail is kept in memory.
pub struct SmtpDispatcher {
    framing: Framing,
    delivered: Vec<Mail>,
}

impl SmtpDispatcher {
    pub fn new(framing: Framing) -> Self {
        Self {
            framing,
            delivered: Vec::new(),
        }
    }

    /// Messages accepted so far.
    pub fn delivered(&self) -> &[Mail] {
        &self.delivered
    }

    fn reply(&self, phase: Phase, code: u16, text: &str) -> Dispatch {
        Dispatch::reply(phase, reply(&self.framing, code, text))
    }

    fn body_line(&mut self, session: &mut SmtpSession, frame: &[u8], id: ConnId) -> Dispatch {
        if frame == b"." {
            let mail = Mail {
                from: session.from.take().unwrap_or_default(),
                to: std::mem::take(&mut session.to),
                body: session.body.join("\r\n"),
            };
            session.reset();
            info!(conn_id = id, from = %mail.from, recipients = mail.to.len(), "Message accepted");
            self.delivered.push(mail);
            return self.reply(Phase::AwaitingCommand, 250, "OK: message accepted for delivery");
        }

        // A body line starting with `.` had one extra `.` added by the sender.
        let line = frame.strip_prefix(b".").unwrap_or(frame);
        session.body.push(String::from_utf8_lossy(line).into_owned());
        Dispatch::stay(Phase::InTransfer)
    }
}

impl Dispatcher for SmtpDispatcher {
    type Session = SmtpSession;

    fn framing(&self) -> Framing {
        self.framing.clone()
    }

    fn open(&mut self, _id: ConnId, _peer: SocketAddr) -> (SmtpSession, Option<Bytes>) {
        let greeting = reply(&self.framing, 220, "Welcome to Simple SMTP Server");
        (SmtpSession::default(), Some(greeting))
    }

    fn handle(&mut self, phase: Phase, session: &mut SmtpSession, frame: Bytes, id: ConnId) -> Dispatch {
        if phase == Phase::InTransfer {
            return self.body_line(session, &frame, id);
        }

        let Some(command) = Command::parse(&frame) else {
            return self.reply(phase, 500, "Syntax error, command unrecognized");
        };
        debug!(conn_id = id, verb = %command.verb, "Command");

        match command.verb.as_str() {
            "HELO" | "EHLO" => match command.arg {
                Some(host) => {
                    session.client = Some(host.to_string());
                    session.reset();
                    self.reply(Phase::AwaitingCommand, 250, &format!("Hello {host}"))
                }
                None => self.reply(phase, 501, "Syntax: HELO hostname"),
            },
            "QUIT" => Dispatch::close_with(reply(&self.framing, 221, "Bye")),
            "NOOP" => self.reply(phase, 250, "OK"),
            "RSET" => {
                session.reset();
                self.reply(phase, 250, "OK")
            }
            "MAIL" | "RCPT" | "DATA" if session.client.is_none() => {
                self.reply(phase, 503, "Bad sequence of commands")
            }
            "MAIL" => {
                if session.from.is_some() {
                    return self.reply(phase, 503, "Bad sequence of commands");
                }
                match command.arg.and_then(|a| keyword_value(a, "FROM:")) {
                    Some(from) => {
                        session.from = Some(from.to_string());
                        self.reply(phase, 250, "OK")
                    }
                    None => self.reply(phase, 501, "Syntax: MAIL FROM:<address>"),
                }
            }
            "RCPT" => {
                if session.from.is_none() {
                    return self.reply(phase, 503, "Bad sequence of commands");
                }
                match command.arg.and_then(|a| keyword_value(a, "TO:")) {
                    Some(to) if !to.is_empty() => {
                        session.to.push(to.to_string());
                        self.reply(phase, 250, "OK")
                    }
                    _ => self.reply(phase, 501, "Syntax: RCPT TO:<address>"),
                }
            }
            "DATA" if session.to.is_empty() => self.reply(phase, 503, "Bad sequence of commands"),
            "DATA" => self.reply(Phase::InTransfer, 354, "End data with <CR><LF>.<CR><LF>"),
            _ => self.reply(phase, 502, "Command not implemented"),
        }
    }

    fn frame_error(&mut self, _error: &FrameError) -> Option<Bytes> {
        Some(reply(&self.framing, 500, "Line too long"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Feed lines through the dispatcher, threading the phase.
    fn converse(d: &mut SmtpDispatcher, lines: &[&'static str]) -> (Vec<Bytes>, Phase) {
        let mut session = SmtpSession::default();
        let mut phase = Phase::New;
        let mut responses = Vec::new();
        for line in lines {
            let out = d.handle(phase, &mut session, Bytes::from_static(line.as_bytes()), 1);
            responses.extend(out.responses);
            phase = out.phase;
        }
        (responses, phase)
    }

    #[test]
    fn test_full_transaction() {
        let mut d = SmtpDispatcher::new(Framing::crlf());
        let (responses, phase) = converse(
            &mut d,
            &[
                "EHLO example.com",
                "MAIL FROM:<test@example.com>",
                "RCPT TO:<recipient@example.com>",
                "DATA",
                "Subject: hi",
                "",
                "..leading dot",
                ".x",
                ".",
                "QUIT",
            ],
        );
        assert_eq!(
            responses,
            vec![
                "250 Hello example.com\r\n",
                "250 OK\r\n",
                "250 OK\r\n",
                "354 End data with <CR><LF>.<CR><LF>\r\n",
                "250 OK: message accepted for delivery\r\n",
                "221 Bye\r\n",
            ]
        );
        assert_eq!(phase, Phase::Closing);
        assert_eq!(
            d.delivered(),
            &[Mail {
                from: "test@example.com".into(),
                to: vec!["recipient@example.com".into()],
                body: "Subject: hi\r\n\r\n.leading dot\r\nx".into(),
            }]
        );
    }

    #[test]
    fn test_out_of_sequence() {
        let mut d = SmtpDispatcher::new(Framing::crlf());
        let (responses, phase) = converse(&mut d, &["MAIL FROM:<a@b>", "EHLO x", "DATA", "RCPT TO:<c@d>"]);
        assert_eq!(
            responses,
            vec![
                "503 Bad sequence of commands\r\n",
                "250 Hello x\r\n",
                "503 Bad sequence of commands\r\n",
                "503 Bad sequence of commands\r\n",
            ]
        );
        assert_eq!(phase, Phase::AwaitingCommand);
        assert!(d.delivered().is_empty());
    }

    #[test]
    fn test_unknown_and_malformed() {
        let mut d = SmtpDispatcher::new(Framing::crlf());
        let (responses, _) = converse(&mut d, &["VRFY x", "HELO", "EHLO h", "MAIL TO:<x>"]);
        assert_eq!(
            responses,
            vec![
                "502 Command not implemented\r\n",
                "501 Syntax: HELO hostname\r\n",
                "250 Hello h\r\n",
                "501 Syntax: MAIL FROM:<address>\r\n",
            ]
        );
    }
}
