//! Pluggable protocol logic.
//!
//! The reactor knows nothing about commands or payloads. For every complete
//! frame it asks the `Dispatcher` what to answer and which phase comes next.

use crate::runtime::connection::{ConnId, Phase};
use crate::runtime::framing::{FrameError, Framing};
use bytes::Bytes;
use std::net::SocketAddr;

/// Outcome of handling one frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dispatch {
    /// Phase after this frame.
    pub phase: Phase,
    /// Responses in write order, already in wire form.
    pub responses: Vec<Bytes>,
    /// Flush the responses, then close the connection.
    pub close: bool,
}

impl Dispatch {
    /// Stay in `phase` with no response.
    pub fn stay(phase: Phase) -> Self {
        Self {
            phase,
            responses: Vec::new(),
            close: false,
        }
    }

    /// Move to `phase` with a single response.
    pub fn reply(phase: Phase, response: Bytes) -> Self {
        Self {
            phase,
            responses: vec![response],
            close: false,
        }
    }

    /// Send a final response and close.
    pub fn close_with(response: Bytes) -> Self {
        Self {
            phase: Phase::Closing,
            responses: vec![response],
            close: true,
        }
    }
}

/// Protocol handler driven by the reactor.
///
/// Implementations must not fail: a malformed frame is answered with an
/// error response and the connection carries on.
pub trait Dispatcher {
    /// Per-connection protocol data, owned by the connection state.
    type Session;

    /// How this protocol's byte stream is cut into frames.
    fn framing(&self) -> Framing;

    /// A connection was accepted. Returns its session and an optional
    /// greeting to queue before any input is read.
    fn open(&mut self, id: ConnId, peer: SocketAddr) -> (Self::Session, Option<Bytes>);

    /// Handle one complete frame.
    fn handle(
        &mut self,
        phase: Phase,
        session: &mut Self::Session,
        frame: Bytes,
        id: ConnId,
    ) -> Dispatch;

    /// Response to send when framing fails (oversize or bad header).
    fn frame_error(&mut self, _error: &FrameError) -> Option<Bytes> {
        None
    }

    /// The connection was evicted.
    fn close(&mut self, _id: ConnId, _session: Self::Session) {}

    /// Handle a single datagram. There is no per-peer state: a fresh
    /// session is opened for each datagram and dropped afterwards.
    fn datagram(&mut self, frame: Bytes, peer: SocketAddr) -> Vec<Bytes> {
        let (mut session, _) = self.open(usize::MAX, peer);
        let dispatch = self.handle(Phase::AwaitingCommand, &mut session, frame, usize::MAX);
        self.close(usize::MAX, session);
        dispatch.responses
    }
}
