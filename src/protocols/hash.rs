//! Hash exchange protocol.
//!
//! Each frame (or datagram) is answered with the lowercase hex digest of
//! its bytes. MD5 unless configured otherwise.

use crate::runtime::{ConnId, Dispatch, Dispatcher, FrameError, Framing, Phase};
use bytes::Bytes;
use md5::Md5;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::net::SocketAddr;

/// Digest used for replies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    #[default]
    Md5,
    Sha256,
}

impl HashAlgorithm {
    /// Lowercase hex digest of `data`.
    pub fn digest_hex(self, data: &[u8]) -> String {
        match self {
            HashAlgorithm::Md5 => hex::encode(Md5::digest(data)),
            HashAlgorithm::Sha256 => hex::encode(Sha256::digest(data)),
        }
    }
}

pub struct HashDispatcher {
    framing: Framing,
    algorithm: HashAlgorithm,
}

impl HashDispatcher {
    pub fn new(framing: Framing, algorithm: HashAlgorithm) -> Self {
        Self { framing, algorithm }
    }
}

impl Dispatcher for HashDispatcher {
    type Session = ();

    fn framing(&self) -> Framing {
        self.framing.clone()
    }

    fn open(&mut self, _id: ConnId, _peer: SocketAddr) -> ((), Option<Bytes>) {
        ((), None)
    }

    fn handle(&mut self, _phase: Phase, _session: &mut (), frame: Bytes, _id: ConnId) -> Dispatch {
        let digest = self.algorithm.digest_hex(&frame);
        let reply = self.framing.encode(digest.as_bytes()).unwrap_or_default();
        Dispatch::reply(Phase::AwaitingCommand, reply)
    }

    fn frame_error(&mut self, error: &FrameError) -> Option<Bytes> {
        self.framing.encode(format!("ERROR {error}").as_bytes()).ok()
    }

    fn datagram(&mut self, frame: Bytes, _peer: SocketAddr) -> Vec<Bytes> {
        vec![Bytes::from(self.algorithm.digest_hex(&frame))]
    }
}
