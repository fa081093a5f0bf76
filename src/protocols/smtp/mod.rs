//! SMTP-style mail submission protocol.
//!
//! Exercises the `InTransfer` phase: after `DATA`, frames are message body
//! lines until a lone `.` arrives.
//!
//! ```text
//! S: 220 Welcome to Simple SMTP Server
//! C: EHLO example.com            S: 250 Hello example.com
//! C: MAIL FROM:<a@example.com>   S: 250 OK
//! C: RCPT TO:<b@example.com>     S: 250 OK
//! C: DATA                        S: 354 End data with <CR><LF>.<CR><LF>
//! C: Subject: hi
//! C: .                           S: 250 OK: message accepted for delivery
//! C: QUIT                        S: 221 Bye
//! ```

pub mod handler;

pub use handler::{Mail, SmtpDispatcher, SmtpSession};
