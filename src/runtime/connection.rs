//! Connection state machine and registry.
//!
//! Each connection tracks its protocol phase, the assembler holding
//! unframed input, and the queue of responses awaiting write.

use crate::runtime::framing::FrameAssembler;
use bytes::{Buf, Bytes};
use slab::Slab;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::Instant;

/// Connection identifier: the registry slot, also used as the poll token.
pub type ConnId = usize;

/// Position of a connection in its protocol state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Accepted; greeting queued, not yet authenticated or introduced.
    New,
    /// Idle and ready for the next command.
    AwaitingCommand,
    /// Inside a multi-line body until its terminator frame arrives.
    InTransfer,
    /// Close requested. Pending writes are flushed, then the connection is
    /// evicted. Terminal.
    Closing,
}

/// Mutable per-connection record.
#[derive(Debug)]
pub struct ConnectionState<S> {
    pub assembler: FrameAssembler,
    pub phase: Phase,
    /// Responses awaiting write. A partially written head holds only its
    /// unwritten remainder.
    pub outbound: VecDeque<Bytes>,
    /// Time of accept or of the last complete frame.
    pub last_activity: Instant,
    /// Dispatcher-defined per-connection data.
    pub session: S,
}

impl<S> ConnectionState<S> {
    pub fn new(assembler: FrameAssembler, session: S, now: Instant) -> Self {
        Self {
            assembler,
            phase: Phase::New,
            outbound: VecDeque::new(),
            last_activity: now,
            session,
        }
    }

    /// Queue a response for writing. Empty responses are dropped.
    pub fn enqueue(&mut self, response: Bytes) {
        if !response.is_empty() {
            self.outbound.push_back(response);
        }
    }

    pub fn has_pending_writes(&self) -> bool {
        !self.outbound.is_empty()
    }

    /// Record that `n` bytes of the queue head were written.
    pub fn consume_written(&mut self, mut n: usize) {
        while n > 0 {
            let Some(head) = self.outbound.front_mut() else {
                break;
            };
            if n >= head.len() {
                n -= head.len();
                self.outbound.pop_front();
            } else {
                head.advance(n);
                n = 0;
            }
        }
    }

    pub fn is_closing(&self) -> bool {
        self.phase == Phase::Closing
    }

    pub fn pending_bytes(&self) -> usize {
        self.outbound.iter().map(Bytes::len).sum()
    }
}

/// A single client connection.
#[derive(Debug)]
pub struct Connection<T, S> {
    pub stream: T,
    pub peer: SocketAddr,
    pub state: ConnectionState<S>,
    /// Whether write interest is currently registered.
    pub write_interest: bool,
}

/// Registry of active connections using slab allocation.
///
/// Provides O(1) insert, lookup, and remove operations.
pub struct ConnectionRegistry<T, S> {
    connections: Slab<Connection<T, S>>,
    max_connections: usize,
}

impl<T, S> ConnectionRegistry<T, S> {
    /// Create a new registry with specified maximum capacity.
    pub fn new(max_connections: usize) -> Self {
        Self {
            connections: Slab::with_capacity(max_connections.min(4096)),
            max_connections,
        }
    }

    /// Whether another connection can be admitted.
    pub fn has_room(&self) -> bool {
        self.connections.len() < self.max_connections
    }

    /// Id that the next `insert` will use.
    pub fn next_id(&self) -> ConnId {
        self.connections.vacant_key()
    }

    /// Insert a new connection into the registry.
    ///
    /// Returns `None` if the registry is at capacity.
    pub fn insert(&mut self, conn: Connection<T, S>) -> Option<ConnId> {
        if !self.has_room() {
            return None;
        }
        Some(self.connections.insert(conn))
    }

    pub fn get(&self, id: ConnId) -> Option<&Connection<T, S>> {
        self.connections.get(id)
    }

    pub fn get_mut(&mut self, id: ConnId) -> Option<&mut Connection<T, S>> {
        self.connections.get_mut(id)
    }

    /// Remove a connection from the registry.
    pub fn remove(&mut self, id: ConnId) -> Option<Connection<T, S>> {
        self.connections.try_remove(id)
    }

    pub fn contains(&self, id: ConnId) -> bool {
        self.connections.contains(id)
    }

    /// Number of active connections.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Maximum number of connections allowed.
    pub fn capacity(&self) -> usize {
        self.max_connections
    }

    /// Ids of all registered connections.
    pub fn ids(&self) -> Vec<ConnId> {
        self.connections.iter().map(|(id, _)| id).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ConnId, &Connection<T, S>)> {
        self.connections.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::framing::Framing;

    fn state() -> ConnectionState<()> {
        ConnectionState::new(FrameAssembler::new(Framing::crlf(), 64), (), Instant::now())
    }

    fn conn(port: u16) -> Connection<u16, ()> {
        Connection {
            stream: port,
            peer: SocketAddr::from(([127, 0, 0, 1], port)),
            state: state(),
            write_interest: false,
        }
    }

    #[test]
    fn test_phase_transitions() {
        let mut state = state();
        assert_eq!(state.phase, Phase::New);

        state.phase = Phase::AwaitingCommand;
        state.phase = Phase::InTransfer;
        assert!(!state.is_closing());

        state.phase = Phase::Closing;
        assert!(state.is_closing());
    }

    #[test]
    fn test_partial_writes_keep_remainder() {
        let mut state = state();
        state.enqueue(Bytes::from_static(b"331 need password\r\n"));
        state.enqueue(Bytes::new());
        state.enqueue(Bytes::from_static(b"230 ok\r\n"));
        assert_eq!(state.outbound.len(), 2);

        state.consume_written(4);
        assert_eq!(state.outbound[0], "need password\r\n");

        state.consume_written(15 + 3);
        assert_eq!(state.outbound.len(), 1);
        assert_eq!(state.outbound[0], " ok\r\n");

        state.consume_written(5);
        assert!(!state.has_pending_writes());
    }

    #[test]
    fn test_connection_registry() {
        let mut registry = ConnectionRegistry::new(2);

        let id1 = registry.insert(conn(10)).unwrap();
        assert_eq!(registry.next_id(), 1);
        let id2 = registry.insert(conn(11)).unwrap();

        // At capacity
        assert!(!registry.has_room());
        assert!(registry.insert(conn(12)).is_none());

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.get(id1).unwrap().stream, 10);
        assert_eq!(registry.get(id2).unwrap().peer.port(), 11);

        registry.remove(id1);
        assert!(!registry.contains(id1));
        assert!(registry.remove(id1).is_none());
        assert_eq!(registry.ids(), vec![id2]);
    }
}
