//! Echo dispatcher.

use crate::runtime::{ConnId, Dispatch, Dispatcher, FrameError, Framing, Phase};
use bytes::Bytes;
use std::net::SocketAddr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EchoMode {
    Echo,
    Reverse,
}

pub struct EchoDispatcher {
    framing: Framing,
    mode: EchoMode,
}

impl EchoDispatcher {
    pub fn new(framing: Framing, mode: EchoMode) -> Self {
        Self { framing, mode }
    }

    fn transform(&self, frame: Bytes) -> Bytes {
        match self.mode {
            EchoMode::Echo => frame,
            EchoMode::Reverse => Bytes::from(reverse(&frame)),
        }
    }
}

/// Reverse by character when the payload is UTF-8, by byte otherwise.
fn reverse(payload: &[u8]) -> Vec<u8> {
    match std::str::from_utf8(payload) {
        Ok(text) => text.chars().rev().collect::<String>().into_bytes(),
        Err(_) => payload.iter().rev().copied().collect(),
    }
}

impl Dispatcher for EchoDispatcher {
    type Session = ();

    fn framing(&self) -> Framing {
        self.framing.clone()
    }

    fn open(&mut self, _id: ConnId, _peer: SocketAddr) -> ((), Option<Bytes>) {
        ((), None)
    }

    fn handle(&mut self, _phase: Phase, _session: &mut (), frame: Bytes, _id: ConnId) -> Dispatch {
        let payload = self.transform(frame);
        match self.framing.encode(&payload) {
            Ok(reply) => Dispatch::reply(Phase::AwaitingCommand, reply),
            Err(error) => {
                let reply = self.frame_error(&error).unwrap_or_default();
                Dispatch::reply(Phase::AwaitingCommand, reply)
            }
        }
    }

    fn frame_error(&mut self, error: &FrameError) -> Option<Bytes> {
        let message: &[u8] = match error {
            FrameError::Oversize { .. } => b"ERROR payload too large",
            FrameError::InvalidHeader => b"ERROR invalid length",
            FrameError::EmptyDelimiter => b"ERROR invalid framing",
        };
        self.framing.encode(message).ok()
    }

    fn datagram(&mut self, frame: Bytes, _peer: SocketAddr) -> Vec<Bytes> {
        vec![self.transform(frame)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::LengthHeader;

    fn peer() -> SocketAddr {
        "127.0.0.1:12345".parse().unwrap()
    }

    #[test]
    fn test_echo_frames_reply() {
        let mut d = EchoDispatcher::new(Framing::LengthPrefixed(LengthHeader::Decimal), EchoMode::Echo);
        let out = d.handle(Phase::New, &mut (), Bytes::from_static(b"hello"), 0);
        assert_eq!(out.responses, vec!["5\r\nhello"]);
    }

    #[test]
    fn test_reverse() {
        let mut d = EchoDispatcher::new(Framing::crlf(), EchoMode::Reverse);
        let out = d.handle(Phase::New, &mut (), Bytes::from("héllo"), 0);
        assert_eq!(out.responses, vec![Bytes::from("olléh\r\n")]);
        assert_eq!(reverse(&[0xff, 0x01]), vec![0x01, 0xff]);
    }

    #[test]
    fn test_datagram_is_bare() {
        let mut d = EchoDispatcher::new(Framing::LengthPrefixed(LengthHeader::U32), EchoMode::Reverse);
        assert_eq!(d.datagram(Bytes::from_static(b"abc"), peer()), vec!["cba"]);
    }

    #[test]
    fn test_frame_error_messages() {
        let mut d = EchoDispatcher::new(Framing::LengthPrefixed(LengthHeader::Decimal), EchoMode::Echo);
        assert_eq!(
            d.frame_error(&FrameError::InvalidHeader),
            Some(Bytes::from_static(b"20\r\nERROR invalid length"))
        );
    }
}
