//! Chat dispatcher.

use crate::protocols::chat::codec::PayloadCodec;
use crate::protocols::chat::message::{ChatMessage, TIMESTAMP_FORMAT};
use crate::runtime::{ConnId, Dispatch, Dispatcher, FrameError, Framing, Phase};
use bytes::Bytes;
use serde::Serialize;
use std::collections::VecDeque;
use std::net::SocketAddr;
use tracing::{debug, info, warn};

/// Messages kept for inspection.
const HISTORY_LIMIT: usize = 256;

/// Answer to one message: `{"status":"ok",...}` or `<ack><status>error</status>...</ack>`.
#[derive(Debug, Serialize)]
#[serde(rename = "ack")]
struct Ack<'a> {
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    username: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    timestamp: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<String>,
}

impl<'a> Ack<'a> {
    fn ok(username: &'a str, timestamp: String) -> Self {
        Self {
            status: "ok",
            username: Some(username),
            timestamp: Some(timestamp),
            reason: None,
        }
    }

    fn error(reason: impl ToString) -> Self {
        Self {
            status: "error",
            username: None,
            timestamp: None,
            reason: Some(reason.to_string()),
        }
    }
}

pub struct ChatDispatcher {
    framing: Framing,
    codec: PayloadCodec,
    history: VecDeque<ChatMessage>,
}

impl ChatDispatcher {
    pub fn new(framing: Framing, codec: PayloadCodec) -> Self {
        Self {
            framing,
            codec,
            history: VecDeque::new(),
        }
    }

    /// Most recent messages, oldest first.
    pub fn history(&self) -> impl Iterator<Item = &ChatMessage> {
        self.history.iter()
    }

    fn ack_bytes(&self, ack: &Ack<'_>) -> Vec<u8> {
        self.codec.encode(ack).unwrap_or_else(|e| {
            warn!(error = %e, "Failed to encode chat ack");
            Vec::new()
        })
    }

    /// Decode, stamp and record one message; returns the encoded ack.
    fn receive(&mut self, frame: &[u8], peer: Option<SocketAddr>) -> Vec<u8> {
        match self.codec.decode(frame) {
            Ok(mut message) => {
                let timestamp = *message
                    .timestamp
                    .get_or_insert_with(|| chrono::Local::now().naive_local());
                info!(
                    username = %message.username,
                    peer = ?peer,
                    text = %message.text,
                    "Chat message"
                );
                let answer = self.ack_bytes(&Ack::ok(
                    &message.username,
                    timestamp.format(TIMESTAMP_FORMAT).to_string(),
                ));
                if self.history.len() == HISTORY_LIMIT {
                    self.history.pop_front();
                }
                self.history.push_back(message);
                answer
            }
            Err(e) => {
                debug!(error = %e, "Undecodable chat message");
                self.ack_bytes(&Ack::error(e))
            }
        }
    }

    /// Frame an answer; one the framing cannot carry becomes an error ack.
    fn frame_answer(&self, answer: &[u8]) -> Bytes {
        match self.framing.encode(answer) {
            Ok(reply) => reply,
            Err(error) => {
                warn!(len = answer.len(), error = %error, "Chat reply does not fit the framing");
                self.framing
                    .encode(&self.ack_bytes(&Ack::error(error)))
                    .unwrap_or_default()
            }
        }
    }
}

impl Dispatcher for ChatDispatcher {
    type Session = ();

    fn framing(&self) -> Framing {
        self.framing.clone()
    }

    fn open(&mut self, _id: ConnId, _peer: SocketAddr) -> ((), Option<Bytes>) {
        ((), None)
    }

    fn handle(&mut self, _phase: Phase, _session: &mut (), frame: Bytes, _id: ConnId) -> Dispatch {
        let answer = self.receive(&frame, None);
        Dispatch::reply(Phase::AwaitingCommand, self.frame_answer(&answer))
    }

    fn frame_error(&mut self, error: &FrameError) -> Option<Bytes> {
        let answer = self.ack_bytes(&Ack::error(error));
        Some(self.frame_answer(&answer))
    }

    fn datagram(&mut self, frame: Bytes, peer: SocketAddr) -> Vec<Bytes> {
        vec![Bytes::from(self.receive(&frame, Some(peer)))]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocols::chat::codec::PayloadFormat;
    use crate::runtime::{FrameAssembler, LengthHeader};

    fn decode_reply(framing: &Framing, wire: &Bytes) -> serde_json::Value {
        let mut asm = FrameAssembler::new(framing.clone(), 1 << 20);
        let frame = asm.feed(wire).next().unwrap().unwrap();
        assert_eq!(asm.buffered(), 0);
        serde_json::from_slice(&frame).unwrap()
    }

    #[test]
    fn test_ack_and_history() {
        let framing = Framing::LengthPrefixed(LengthHeader::U32);
        let mut d = ChatDispatcher::new(framing.clone(), PayloadCodec::default());
        let frame = Bytes::from_static(
            br#"{"username":"Gracie","text":"Hello, World!","timestamp":"2024-03-01 12:00:00.000000"}"#,
        );

        let out = d.handle(Phase::New, &mut (), frame, 0);
        let ack = decode_reply(&framing, &out.responses[0]);
        assert_eq!(ack["status"], "ok");
        assert_eq!(ack["username"], "Gracie");
        assert_eq!(ack["timestamp"], "2024-03-01 12:00:00.000000");
        assert_eq!(d.history().count(), 1);
    }

    #[test]
    fn test_stamps_missing_timestamp() {
        let mut d = ChatDispatcher::new(Framing::crlf(), PayloadCodec::default());
        d.handle(Phase::New, &mut (), Bytes::from_static(br#"{"username":"a","text":"b"}"#), 0);
        assert!(d.history().next().unwrap().timestamp.is_some());
    }

    #[test]
    fn test_malformed_keeps_connection() {
        let framing = Framing::LengthPrefixed(LengthHeader::Decimal);
        let mut d = ChatDispatcher::new(framing.clone(), PayloadCodec::default());
        let out = d.handle(Phase::AwaitingCommand, &mut (), Bytes::from_static(b"<xml/>"), 0);
        assert!(!out.close);
        assert_eq!(out.phase, Phase::AwaitingCommand);
        let ack = decode_reply(&framing, &out.responses[0]);
        assert_eq!(ack["status"], "error");
        assert_eq!(d.history().count(), 0);
    }

    #[test]
    fn test_ack_too_large_for_header_becomes_error() {
        let framing = Framing::LengthPrefixed(LengthHeader::U16);
        let mut d = ChatDispatcher::new(framing.clone(), PayloadCodec::default());
        let username = "a".repeat(65_500);
        let frame = Bytes::from(format!(r#"{{"username":"{username}","text":"hi"}}"#));

        let out = d.handle(Phase::AwaitingCommand, &mut (), frame, 0);
        let ack = decode_reply(&framing, &out.responses[0]);
        assert_eq!(ack["status"], "error");
        assert_eq!(ack["reason"], "frame exceeds 65535 bytes");
    }

    #[test]
    fn test_xml_acks() {
        let framing = Framing::LengthPrefixed(LengthHeader::Decimal);
        let codec = PayloadCodec::new(PayloadFormat::Xml, false);
        let mut d = ChatDispatcher::new(framing, codec);
        let frame = Bytes::from_static(
            b"<message><username>Gracie</username><text>hi</text>\
              <timestamp>2024-03-01 12:00:00.000000</timestamp></message>",
        );
        let out = d.handle(Phase::New, &mut (), frame, 0);
        let expected = "<ack><status>ok</status><username>Gracie</username>\
                        <timestamp>2024-03-01 12:00:00.000000</timestamp></ack>";
        assert_eq!(out.responses, vec![Bytes::from(format!("{}\r\n{expected}", expected.len()))]);

        let out = d.handle(Phase::New, &mut (), Bytes::from_static(b"{}"), 0);
        let reply = String::from_utf8(out.responses[0].to_vec()).unwrap();
        assert!(reply.contains("<ack><status>error</status><reason>"), "{reply}");
    }
}
