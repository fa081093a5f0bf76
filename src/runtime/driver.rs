//! Readiness and transport capability used by the reactor.
//!
//! `Driver` abstracts the listener, the optional datagram socket and the
//! poller. `MioDriver` is the real implementation (epoll on Linux, kqueue on
//! macOS); `MemoryDriver` in `runtime::memory` is a deterministic double.

use crate::runtime::connection::ConnId;
use mio::net::{TcpListener, TcpStream, UdpSocket};
use mio::{Events, Interest, Poll, Token, Waker};
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

pub(crate) const LISTENER_TOKEN: Token = Token(usize::MAX);
pub(crate) const DATAGRAM_TOKEN: Token = Token(usize::MAX - 1);
pub(crate) const WAKER_TOKEN: Token = Token(usize::MAX - 2);

/// What became ready.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    Listener,
    Datagram,
    Connection(ConnId),
    /// The poll was interrupted by a waker (shutdown).
    Waker,
}

impl Source {
    pub(crate) fn from_token(token: Token) -> Self {
        match token {
            LISTENER_TOKEN => Source::Listener,
            DATAGRAM_TOKEN => Source::Datagram,
            WAKER_TOKEN => Source::Waker,
            Token(id) => Source::Connection(id),
        }
    }
}

/// One readiness notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Readiness {
    pub source: Source,
    /// Readable, or the peer closed its write half, or an error is pending.
    /// In each case a read makes progress.
    pub readable: bool,
    pub writable: bool,
}

/// Transport and readiness capability.
pub trait Driver {
    type Stream: Read + Write;

    /// Wait for readiness, at most `timeout` (forever when `None`).
    fn poll(&mut self, ready: &mut Vec<Readiness>, timeout: Option<Duration>) -> io::Result<()>;

    /// Accept one pending connection; `WouldBlock` when none is pending.
    fn accept(&mut self) -> io::Result<(Self::Stream, SocketAddr)>;

    fn register(&mut self, stream: &mut Self::Stream, id: ConnId, interest: Interest)
        -> io::Result<()>;

    fn reregister(
        &mut self,
        stream: &mut Self::Stream,
        id: ConnId,
        interest: Interest,
    ) -> io::Result<()>;

    fn deregister(&mut self, stream: &mut Self::Stream) -> io::Result<()>;

    /// Receive one datagram; `WouldBlock` when none is pending or no
    /// datagram socket is configured.
    fn recv_datagram(&mut self, _buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        Err(io::ErrorKind::WouldBlock.into())
    }

    fn send_datagram(&mut self, _buf: &[u8], _peer: SocketAddr) -> io::Result<usize> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "no datagram socket configured",
        ))
    }

    /// Waker that interrupts `poll`, if the driver supports one.
    fn waker(&self) -> Option<Arc<Waker>> {
        None
    }
}

/// mio-backed driver over a TCP listener and an optional UDP socket.
pub struct MioDriver {
    poll: Poll,
    events: Events,
    listener: TcpListener,
    datagram: Option<UdpSocket>,
    waker: Arc<Waker>,
}

impl MioDriver {
    /// Bind the listener (and the datagram socket, if given) and register
    /// both for readability.
    pub fn bind(
        listen: SocketAddr,
        udp_listen: Option<SocketAddr>,
        event_capacity: usize,
    ) -> io::Result<Self> {
        let poll = Poll::new()?;

        let mut listener = TcpListener::from_std(create_listener(listen)?);
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;

        let datagram = match udp_listen {
            Some(addr) => {
                let mut socket = UdpSocket::bind(addr)?;
                poll.registry()
                    .register(&mut socket, DATAGRAM_TOKEN, Interest::READABLE)?;
                Some(socket)
            }
            None => None,
        };

        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);

        Ok(Self {
            poll,
            events: Events::with_capacity(event_capacity),
            listener,
            datagram,
            waker,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn datagram_addr(&self) -> Option<io::Result<SocketAddr>> {
        self.datagram.as_ref().map(UdpSocket::local_addr)
    }
}

impl Driver for MioDriver {
    type Stream = TcpStream;

    fn poll(&mut self, ready: &mut Vec<Readiness>, timeout: Option<Duration>) -> io::Result<()> {
        ready.clear();
        self.poll.poll(&mut self.events, timeout)?;
        for event in self.events.iter() {
            ready.push(Readiness {
                source: Source::from_token(event.token()),
                readable: event.is_readable() || event.is_read_closed() || event.is_error(),
                writable: event.is_writable() || event.is_write_closed(),
            });
        }
        Ok(())
    }

    fn accept(&mut self) -> io::Result<(TcpStream, SocketAddr)> {
        let (stream, peer) = self.listener.accept()?;
        stream.set_nodelay(true)?;
        Ok((stream, peer))
    }

    fn register(&mut self, stream: &mut TcpStream, id: ConnId, interest: Interest) -> io::Result<()> {
        self.poll.registry().register(stream, Token(id), interest)
    }

    fn reregister(
        &mut self,
        stream: &mut TcpStream,
        id: ConnId,
        interest: Interest,
    ) -> io::Result<()> {
        self.poll.registry().reregister(stream, Token(id), interest)
    }

    fn deregister(&mut self, stream: &mut TcpStream) -> io::Result<()> {
        self.poll.registry().deregister(stream)
    }

    fn recv_datagram(&mut self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        match &self.datagram {
            Some(socket) => socket.recv_from(buf),
            None => Err(io::ErrorKind::WouldBlock.into()),
        }
    }

    fn send_datagram(&mut self, buf: &[u8], peer: SocketAddr) -> io::Result<usize> {
        match &self.datagram {
            Some(socket) => socket.send_to(buf, peer),
            None => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "no datagram socket configured",
            )),
        }
    }

    fn waker(&self) -> Option<Arc<Waker>> {
        Some(Arc::clone(&self.waker))
    }
}

/// Create a non-blocking TCP listener with `SO_REUSEADDR`.
fn create_listener(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;

    Ok(socket.into())
}
