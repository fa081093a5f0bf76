//! In-memory driver for deterministic reactor tests.
//!
//! `MemoryDriver` implements the same contract as `MioDriver` without
//! sockets. A `MemoryNetwork` handle, shared with the driver, lets a test
//! open client connections, push bytes, close halves, inject faults and
//! inspect what the server wrote.
//!
//! Readiness is level-triggered: every poll reports each registered
//! stream that can make progress. Polls never block.

use crate::runtime::connection::ConnId;
use crate::runtime::driver::{Driver, Readiness, Source};
use mio::Interest;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::rc::{Rc, Weak};
use std::time::Duration;

const FIRST_CLIENT_PORT: u16 = 40000;

/// One client/server byte pipe.
#[derive(Debug, Default)]
struct Pipe {
    /// Client to server bytes not yet read.
    inbound: VecDeque<u8>,
    /// Everything the server wrote and the client has not taken.
    outbound: Vec<u8>,
    /// Client closed its write half; reads return EOF once drained.
    client_closed: bool,
    /// Server side dropped (evicted).
    server_dropped: bool,
    /// Fail the next read with this error.
    read_error: Option<io::ErrorKind>,
    /// Fail every write with this error.
    write_error: Option<io::ErrorKind>,
    /// Maximum bytes accepted per write call.
    write_chunk: Option<usize>,
    /// Bytes the server may still write before `WouldBlock`.
    write_budget: Option<usize>,
    registered: Option<(ConnId, Interest)>,
}

impl Pipe {
    fn readable(&self) -> bool {
        !self.inbound.is_empty() || self.client_closed || self.read_error.is_some()
    }

    fn writable(&self) -> bool {
        self.write_error.is_some() || self.write_budget != Some(0)
    }
}

type SharedPipe = Rc<RefCell<Pipe>>;

#[derive(Debug, Default)]
struct Network {
    backlog: VecDeque<(SharedPipe, SocketAddr)>,
    pipes: Vec<Weak<RefCell<Pipe>>>,
    accept_errors: VecDeque<io::ErrorKind>,
    datagrams_in: VecDeque<(Vec<u8>, SocketAddr)>,
    datagrams_out: Vec<(Vec<u8>, SocketAddr)>,
    next_port: u16,
}

/// Test-side handle to the in-memory network.
#[derive(Debug, Clone)]
pub struct MemoryNetwork {
    net: Rc<RefCell<Network>>,
}

impl MemoryNetwork {
    /// Queue a new client connection for the listener.
    pub fn connect(&self) -> MemoryClient {
        let mut net = self.net.borrow_mut();
        let port = FIRST_CLIENT_PORT + net.next_port;
        net.next_port += 1;
        let peer = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), port);

        let pipe = SharedPipe::default();
        net.pipes.push(Rc::downgrade(&pipe));
        net.backlog.push_back((Rc::clone(&pipe), peer));
        MemoryClient { pipe, peer }
    }

    /// Make the next accept fail with `kind`.
    pub fn fail_next_accept(&self, kind: io::ErrorKind) {
        self.net.borrow_mut().accept_errors.push_back(kind);
    }

    /// Deliver a datagram to the server's datagram socket.
    pub fn send_datagram(&self, payload: &[u8], from: SocketAddr) {
        self.net
            .borrow_mut()
            .datagrams_in
            .push_back((payload.to_vec(), from));
    }

    /// Take the datagrams the server sent so far.
    pub fn take_datagrams(&self) -> Vec<(Vec<u8>, SocketAddr)> {
        std::mem::take(&mut self.net.borrow_mut().datagrams_out)
    }
}

/// Client end of an in-memory connection.
#[derive(Debug, Clone)]
pub struct MemoryClient {
    pipe: SharedPipe,
    peer: SocketAddr,
}

impl MemoryClient {
    /// Address the server sees for this client.
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn send(&self, bytes: &[u8]) {
        self.pipe.borrow_mut().inbound.extend(bytes.iter().copied());
    }

    /// Close the client's write half; the server reads EOF.
    pub fn shutdown_write(&self) {
        self.pipe.borrow_mut().client_closed = true;
    }

    /// Take everything the server wrote since the last call.
    pub fn take_received(&self) -> Vec<u8> {
        std::mem::take(&mut self.pipe.borrow_mut().outbound)
    }

    /// `take_received` as lossy UTF-8.
    pub fn take_text(&self) -> String {
        String::from_utf8_lossy(&self.take_received()).into_owned()
    }

    /// Whether the server has dropped its end.
    pub fn is_closed(&self) -> bool {
        self.pipe.borrow().server_dropped
    }

    pub fn fail_next_read(&self, kind: io::ErrorKind) {
        self.pipe.borrow_mut().read_error = Some(kind);
    }

    pub fn fail_writes(&self, kind: io::ErrorKind) {
        self.pipe.borrow_mut().write_error = Some(kind);
    }

    /// Accept at most `chunk` bytes per server write call.
    pub fn limit_write_chunk(&self, chunk: usize) {
        self.pipe.borrow_mut().write_chunk = Some(chunk);
    }

    /// Allow at most `budget` more bytes before writes block; `None` lifts
    /// the limit.
    pub fn set_write_budget(&self, budget: Option<usize>) {
        self.pipe.borrow_mut().write_budget = budget;
    }
}

/// Server end of an in-memory connection.
#[derive(Debug)]
pub struct MemoryStream {
    pipe: SharedPipe,
}

impl Read for MemoryStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut pipe = self.pipe.borrow_mut();
        if let Some(kind) = pipe.read_error.take() {
            return Err(kind.into());
        }
        if pipe.inbound.is_empty() {
            return if pipe.client_closed {
                Ok(0)
            } else {
                Err(io::ErrorKind::WouldBlock.into())
            };
        }
        let n = buf.len().min(pipe.inbound.len());
        for (slot, byte) in buf.iter_mut().zip(pipe.inbound.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }
}

impl Write for MemoryStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut pipe = self.pipe.borrow_mut();
        if let Some(kind) = pipe.write_error {
            return Err(kind.into());
        }
        let mut n = buf.len();
        if let Some(chunk) = pipe.write_chunk {
            n = n.min(chunk);
        }
        if let Some(budget) = pipe.write_budget {
            if budget == 0 {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            n = n.min(budget);
            pipe.write_budget = Some(budget - n);
        }
        pipe.outbound.extend_from_slice(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for MemoryStream {
    fn drop(&mut self) {
        let mut pipe = self.pipe.borrow_mut();
        pipe.server_dropped = true;
        pipe.registered = None;
    }
}

/// Driver over a `MemoryNetwork`.
#[derive(Debug)]
pub struct MemoryDriver {
    net: Rc<RefCell<Network>>,
}

impl MemoryDriver {
    /// Create a driver and the network handle tests use to drive it.
    pub fn new() -> (Self, MemoryNetwork) {
        let net = Rc::new(RefCell::new(Network::default()));
        (
            Self {
                net: Rc::clone(&net),
            },
            MemoryNetwork { net },
        )
    }
}

impl Driver for MemoryDriver {
    type Stream = MemoryStream;

    fn poll(&mut self, ready: &mut Vec<Readiness>, _timeout: Option<Duration>) -> io::Result<()> {
        ready.clear();
        let mut net = self.net.borrow_mut();

        if !net.backlog.is_empty() || !net.accept_errors.is_empty() {
            ready.push(Readiness {
                source: Source::Listener,
                readable: true,
                writable: false,
            });
        }
        if !net.datagrams_in.is_empty() {
            ready.push(Readiness {
                source: Source::Datagram,
                readable: true,
                writable: false,
            });
        }

        net.pipes.retain(|weak| weak.strong_count() > 0);
        for weak in &net.pipes {
            let Some(pipe) = weak.upgrade() else {
                continue;
            };
            let pipe = pipe.borrow();
            let Some((id, interest)) = pipe.registered else {
                continue;
            };
            let readable = interest.is_readable() && pipe.readable();
            let writable = interest.is_writable() && pipe.writable();
            if readable || writable {
                ready.push(Readiness {
                    source: Source::Connection(id),
                    readable,
                    writable,
                });
            }
        }
        Ok(())
    }

    fn accept(&mut self) -> io::Result<(MemoryStream, SocketAddr)> {
        let mut net = self.net.borrow_mut();
        if let Some(kind) = net.accept_errors.pop_front() {
            return Err(kind.into());
        }
        match net.backlog.pop_front() {
            Some((pipe, peer)) => Ok((MemoryStream { pipe }, peer)),
            None => Err(io::ErrorKind::WouldBlock.into()),
        }
    }

    fn register(&mut self, stream: &mut MemoryStream, id: ConnId, interest: Interest) -> io::Result<()> {
        stream.pipe.borrow_mut().registered = Some((id, interest));
        Ok(())
    }

    fn reregister(
        &mut self,
        stream: &mut MemoryStream,
        id: ConnId,
        interest: Interest,
    ) -> io::Result<()> {
        self.register(stream, id, interest)
    }

    fn deregister(&mut self, stream: &mut MemoryStream) -> io::Result<()> {
        stream.pipe.borrow_mut().registered = None;
        Ok(())
    }

    fn recv_datagram(&mut self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        match self.net.borrow_mut().datagrams_in.pop_front() {
            Some((payload, from)) => {
                // Excess bytes are discarded, as with a real datagram socket.
                let n = payload.len().min(buf.len());
                buf[..n].copy_from_slice(&payload[..n]);
                Ok((n, from))
            }
            None => Err(io::ErrorKind::WouldBlock.into()),
        }
    }

    fn send_datagram(&mut self, buf: &[u8], peer: SocketAddr) -> io::Result<usize> {
        self.net
            .borrow_mut()
            .datagrams_out
            .push((buf.to_vec(), peer));
        Ok(buf.len())
    }
}
