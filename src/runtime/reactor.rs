//! The multiplexing event loop.
//!
//! Readiness-based model: the driver tells us which sources are ready, then
//! we perform non-blocking accept/read/write calls. One thread owns the
//! reactor and every connection, so no locking is needed.
//!
//! ## Cycle
//!
//! ```text
//! poll ──▶ listener ready?   accept until WouldBlock, queue greeting
//!      ──▶ datagram ready?   recv until WouldBlock, one frame per datagram
//!      ──▶ client readable?  bounded reads ─▶ assemble ─▶ dispatch ─▶ queue
//!      ──▶ client writable?  write queue head until empty or WouldBlock
//!      ──▶ housekeeping      idle eviction, once per tick
//!      ──▶ evictions         applied last, never while iterating
//! ```
//!
//! A connection's faults never leave its own slot: read, write and framing
//! errors evict that connection only.

use crate::runtime::clock::{Clock, SystemClock};
use crate::runtime::connection::{
    ConnId, Connection, ConnectionRegistry, ConnectionState, Phase,
};
use crate::runtime::dispatcher::Dispatcher;
use crate::runtime::driver::{Driver, Readiness, Source};
use crate::runtime::framing::FrameAssembler;
use crate::runtime::shutdown::Shutdown;
use bytes::Bytes;
use mio::Interest;
use std::io::{self, Read, Write};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

/// Largest datagram payload we receive.
const MAX_DATAGRAM: usize = 64 * 1024;

/// Tunables for a reactor instance.
#[derive(Debug, Clone)]
pub struct ReactorSettings {
    pub max_connections: usize,
    pub max_frame_size: usize,
    /// Bytes per read call.
    pub read_size: usize,
    /// Read calls per connection per cycle before yielding to others.
    pub reads_per_event: usize,
    /// Evict connections without a complete frame for this long.
    pub idle_timeout: Option<Duration>,
    /// Housekeeping period; also bounds how long a poll may block.
    pub tick_interval: Duration,
    pub event_capacity: usize,
}

impl Default for ReactorSettings {
    fn default() -> Self {
        Self {
            max_connections: 1024,
            max_frame_size: 64 * 1024,
            read_size: 4096,
            reads_per_event: 16,
            idle_timeout: Some(Duration::from_secs(300)),
            tick_interval: Duration::from_secs(1),
            event_capacity: 1024,
        }
    }
}

/// Why a connection was evicted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictReason {
    /// Orderly EOF from the peer.
    PeerClosed,
    ReadError,
    WriteError,
    /// The dispatcher (or a fatal framing error) closed it and the
    /// queue was flushed.
    Closed,
    IdleTimeout,
    /// Poll registration failed.
    Registration,
    Shutdown,
}

/// Counters maintained by the reactor.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReactorStats {
    pub accepted: u64,
    /// Connections dropped at accept because of the connection limit.
    pub rejected: u64,
    pub evicted: u64,
    pub frames: u64,
    pub datagrams: u64,
}

/// Evictions staged during a cycle.
#[derive(Debug, Default)]
struct Evictions(Vec<(ConnId, EvictReason)>);

impl Evictions {
    /// Stage `id`; the first reason wins.
    fn stage(&mut self, id: ConnId, reason: EvictReason) {
        if !self.contains(id) {
            self.0.push((id, reason));
        }
    }

    fn contains(&self, id: ConnId) -> bool {
        self.0.iter().any(|&(staged, _)| staged == id)
    }
}

/// Single-threaded multiplexing server core.
pub struct Reactor<D: Driver, P: Dispatcher> {
    driver: D,
    dispatcher: P,
    connections: ConnectionRegistry<D::Stream, P::Session>,
    settings: ReactorSettings,
    clock: Box<dyn Clock>,
    shutdown: Shutdown,
    ready: Vec<Readiness>,
    read_buf: Vec<u8>,
    datagram_buf: Vec<u8>,
    /// Connections whose read budget ran out with input possibly pending.
    carried: Vec<ConnId>,
    evictions: Evictions,
    last_housekeeping: Instant,
    stats: ReactorStats,
}

impl<D: Driver, P: Dispatcher> Reactor<D, P> {
    pub fn new(driver: D, dispatcher: P, settings: ReactorSettings) -> Self {
        let clock: Box<dyn Clock> = Box::new(SystemClock);
        let shutdown = Shutdown::with_waker(driver.waker());
        Self {
            connections: ConnectionRegistry::new(settings.max_connections),
            ready: Vec::with_capacity(settings.event_capacity),
            read_buf: vec![0u8; settings.read_size.max(1)],
            datagram_buf: Vec::new(),
            carried: Vec::new(),
            evictions: Evictions::default(),
            last_housekeeping: clock.now(),
            stats: ReactorStats::default(),
            driver,
            dispatcher,
            settings,
            clock,
            shutdown,
        }
    }

    /// Replace the time source.
    pub fn with_clock(mut self, clock: impl Clock + 'static) -> Self {
        self.last_housekeeping = clock.now();
        self.clock = Box::new(clock);
        self
    }

    /// Handle that stops `run` from outside the loop.
    pub fn shutdown_handle(&self) -> Shutdown {
        self.shutdown.clone()
    }

    pub fn stats(&self) -> ReactorStats {
        self.stats
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Current phase of a connection.
    pub fn phase(&self, id: ConnId) -> Option<Phase> {
        self.connections.get(id).map(|conn| conn.state.phase)
    }

    pub fn dispatcher(&self) -> &P {
        &self.dispatcher
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    /// Run until shutdown is requested, then evict every connection.
    pub fn run(&mut self) -> io::Result<()> {
        info!(
            max_connections = self.settings.max_connections,
            max_frame_size = self.settings.max_frame_size,
            idle_timeout = ?self.settings.idle_timeout,
            "Reactor started"
        );
        while !self.shutdown.is_triggered() {
            self.turn()?;
        }
        self.close_all();
        info!("Reactor stopped");
        Ok(())
    }

    /// Run at most `cycles` cycles, stopping early on shutdown.
    pub fn run_cycles(&mut self, cycles: usize) -> io::Result<()> {
        for _ in 0..cycles {
            if self.shutdown.is_triggered() {
                self.close_all();
                break;
            }
            self.turn()?;
        }
        Ok(())
    }

    /// Drive one readiness cycle.
    ///
    /// Only a failing poll is returned as an error; every connection fault
    /// is contained by evicting that connection.
    pub fn turn(&mut self) -> io::Result<()> {
        let timeout = if !self.carried.is_empty() {
            Some(Duration::ZERO)
        } else if self.settings.idle_timeout.is_some() {
            Some(self.settings.tick_interval)
        } else {
            None
        };

        let mut ready = std::mem::take(&mut self.ready);
        match self.driver.poll(&mut ready, timeout) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => ready.clear(),
            Err(e) => {
                error!(error = %e, "Poll failed");
                self.ready = ready;
                return Err(e);
            }
        }

        let mut carried = std::mem::take(&mut self.carried);
        for readiness in &ready {
            match readiness.source {
                Source::Listener => self.accept_connections(),
                Source::Datagram => self.receive_datagrams(),
                Source::Waker => trace!("Woken"),
                Source::Connection(id) => {
                    if readiness.readable {
                        carried.retain(|&c| c != id);
                        self.service_read(id);
                    }
                    if readiness.writable {
                        self.flush(id);
                    }
                }
            }
        }
        for id in carried {
            self.service_read(id);
        }
        self.ready = ready;

        self.housekeeping();
        self.apply_evictions();
        Ok(())
    }

    fn accept_connections(&mut self) {
        loop {
            match self.driver.accept() {
                Ok((mut stream, peer)) => {
                    if !self.connections.has_room() {
                        warn!(
                            peer = %peer,
                            max_connections = self.connections.capacity(),
                            "Connection limit reached, rejecting"
                        );
                        self.stats.rejected += 1;
                        continue;
                    }

                    let id = self.connections.next_id();
                    if let Err(e) = self.driver.register(&mut stream, id, Interest::READABLE) {
                        warn!(peer = %peer, error = %e, "Failed to register connection");
                        continue;
                    }

                    let (session, greeting) = self.dispatcher.open(id, peer);
                    let assembler =
                        FrameAssembler::new(self.dispatcher.framing(), self.settings.max_frame_size);
                    let mut state = ConnectionState::new(assembler, session, self.clock.now());
                    if let Some(greeting) = greeting {
                        state.enqueue(greeting);
                    }

                    self.connections.insert(Connection {
                        stream,
                        peer,
                        state,
                        write_interest: false,
                    });
                    self.stats.accepted += 1;
                    debug!(conn_id = id, peer = %peer, "Accepted connection");

                    self.flush(id);
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!(error = %e, "Accept failed");
                    break;
                }
            }
        }
    }

    /// Read, assemble and dispatch for one readable connection.
    fn service_read(&mut self, id: ConnId) {
        if self.evictions.contains(id) {
            return;
        }

        let mut reads = 0;
        loop {
            let Some(conn) = self.connections.get_mut(id) else {
                return;
            };
            if conn.state.is_closing() {
                break;
            }
            if reads == self.settings.reads_per_event {
                self.carried.push(id);
                break;
            }

            match conn.stream.read(&mut self.read_buf) {
                Ok(0) => {
                    self.evictions.stage(id, EvictReason::PeerClosed);
                    return;
                }
                Ok(n) => {
                    reads += 1;
                    trace!(conn_id = id, bytes = n, "Read");
                    self.process_input(id, n);
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(conn_id = id, error = %e, "Read failed");
                    self.evictions.stage(id, EvictReason::ReadError);
                    return;
                }
            }
        }

        self.flush(id);
    }

    /// Feed `read_buf[..n]` to the connection's assembler and dispatch every
    /// frame it completes.
    fn process_input(&mut self, id: ConnId, n: usize) {
        let now = self.clock.now();
        let Some(conn) = self.connections.get_mut(id) else {
            return;
        };
        let ConnectionState {
            assembler,
            phase,
            outbound,
            last_activity,
            session,
        } = &mut conn.state;

        for result in assembler.feed(&self.read_buf[..n]) {
            match result {
                Ok(frame) => {
                    *last_activity = now;
                    self.stats.frames += 1;
                    trace!(conn_id = id, phase = ?phase, len = frame.len(), "Frame");

                    let dispatch = self.dispatcher.handle(*phase, session, frame, id);
                    outbound.extend(dispatch.responses.into_iter().filter(|r| !r.is_empty()));
                    *phase = if dispatch.close {
                        Phase::Closing
                    } else {
                        dispatch.phase
                    };
                }
                Err(e) => {
                    if let Some(response) = self.dispatcher.frame_error(&e) {
                        outbound.push_back(response);
                    }
                    if e.is_recoverable() {
                        debug!(conn_id = id, error = %e, "Framing error");
                    } else {
                        warn!(conn_id = id, peer = %conn.peer, error = %e, "Framing error, closing");
                        *phase = Phase::Closing;
                    }
                }
            }
            if *phase == Phase::Closing {
                // Frames after a close are discarded.
                break;
            }
        }
    }

    /// Write queued responses until the queue is empty or the transport
    /// would block. Partial writes keep the remainder at the queue head.
    fn flush(&mut self, id: ConnId) {
        if self.evictions.contains(id) {
            return;
        }
        let Some(conn) = self.connections.get_mut(id) else {
            return;
        };

        while let Some(head) = conn.state.outbound.front() {
            match conn.stream.write(head) {
                Ok(0) => {
                    debug!(conn_id = id, "Write returned 0");
                    self.evictions.stage(id, EvictReason::WriteError);
                    return;
                }
                Ok(n) => conn.state.consume_written(n),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(conn_id = id, error = %e, "Write failed");
                    self.evictions.stage(id, EvictReason::WriteError);
                    return;
                }
            }
        }

        let pending = conn.state.has_pending_writes();
        if !pending && conn.state.is_closing() {
            self.evictions.stage(id, EvictReason::Closed);
            return;
        }

        if pending != conn.write_interest {
            let interest = if pending {
                Interest::READABLE | Interest::WRITABLE
            } else {
                Interest::READABLE
            };
            if let Err(e) = self.driver.reregister(&mut conn.stream, id, interest) {
                warn!(conn_id = id, error = %e, "Failed to update interest");
                self.evictions.stage(id, EvictReason::Registration);
                return;
            }
            conn.write_interest = pending;
            trace!(conn_id = id, pending = conn.state.pending_bytes(), "Write interest changed");
        }
    }

    fn receive_datagrams(&mut self) {
        if self.datagram_buf.is_empty() {
            self.datagram_buf = vec![0u8; MAX_DATAGRAM];
        }

        loop {
            match self.driver.recv_datagram(&mut self.datagram_buf) {
                Ok((n, peer)) => {
                    self.stats.datagrams += 1;
                    if n > self.settings.max_frame_size {
                        warn!(peer = %peer, len = n, "Datagram too large, dropped");
                        continue;
                    }
                    let frame = Bytes::copy_from_slice(&self.datagram_buf[..n]);
                    for response in self.dispatcher.datagram(frame, peer) {
                        if let Err(e) = self.driver.send_datagram(&response, peer) {
                            warn!(peer = %peer, error = %e, "Datagram send failed");
                            break;
                        }
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(error = %e, "Datagram receive failed");
                    break;
                }
            }
        }
    }

    /// Stage idle connections for eviction, at most once per tick.
    fn housekeeping(&mut self) {
        let Some(idle_timeout) = self.settings.idle_timeout else {
            return;
        };
        let now = self.clock.now();
        if now.duration_since(self.last_housekeeping) < self.settings.tick_interval {
            return;
        }
        self.last_housekeeping = now;
        if self.connections.is_empty() {
            return;
        }

        for (id, conn) in self.connections.iter() {
            if now.duration_since(conn.state.last_activity) >= idle_timeout {
                debug!(conn_id = id, peer = %conn.peer, "Idle timeout");
                self.evictions.stage(id, EvictReason::IdleTimeout);
            }
        }
    }

    fn apply_evictions(&mut self) {
        for (id, reason) in std::mem::take(&mut self.evictions.0) {
            let Some(Connection {
                mut stream,
                peer,
                state,
                ..
            }) = self.connections.remove(id)
            else {
                continue;
            };

            if let Err(e) = self.driver.deregister(&mut stream) {
                debug!(conn_id = id, error = %e, "Deregister failed");
            }
            self.dispatcher.close(id, state.session);
            self.stats.evicted += 1;
            debug!(conn_id = id, peer = %peer, reason = ?reason, "Connection evicted");
        }

        let connections = &self.connections;
        self.carried.retain(|&id| connections.contains(id));
    }

    fn close_all(&mut self) {
        for id in self.connections.ids() {
            self.evictions.stage(id, EvictReason::Shutdown);
        }
        self.apply_evictions();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::clock::ManualClock;
    use crate::runtime::dispatcher::Dispatch;
    use crate::runtime::framing::{FrameError, Framing};
    use crate::runtime::memory::MemoryDriver;
    use std::net::SocketAddr;

    /// Upper-cases each line; `BYE` closes.
    struct Shout {
        closed: Vec<ConnId>,
    }

    impl Dispatcher for Shout {
        type Session = u32;

        fn framing(&self) -> Framing {
            Framing::crlf()
        }

        fn open(&mut self, _id: ConnId, _peer: SocketAddr) -> (u32, Option<Bytes>) {
            (0, Some(Bytes::from_static(b"hi\r\n")))
        }

        fn handle(&mut self, _phase: Phase, count: &mut u32, frame: Bytes, _id: ConnId) -> Dispatch {
            *count += 1;
            if frame.as_ref() == b"BYE" {
                return Dispatch::close_with(Bytes::from_static(b"bye\r\n"));
            }
            let reply = Framing::crlf().encode(&frame.to_ascii_uppercase()).unwrap();
            Dispatch::reply(Phase::AwaitingCommand, reply)
        }

        fn frame_error(&mut self, _error: &FrameError) -> Option<Bytes> {
            Some(Bytes::from_static(b"too long\r\n"))
        }

        fn close(&mut self, id: ConnId, _count: u32) {
            self.closed.push(id);
        }
    }

    fn reactor(settings: ReactorSettings) -> (Reactor<MemoryDriver, Shout>, crate::runtime::memory::MemoryNetwork) {
        let (driver, net) = MemoryDriver::new();
        let reactor = Reactor::new(driver, Shout { closed: Vec::new() }, settings);
        (reactor, net)
    }

    #[test]
    fn test_greeting_and_reply() {
        let (mut reactor, net) = reactor(ReactorSettings::default());
        let client = net.connect();

        reactor.turn().unwrap();
        assert_eq!(client.take_text(), "hi\r\n");
        assert_eq!(reactor.phase(0), Some(Phase::New));

        client.send(b"abc\r\nde");
        reactor.turn().unwrap();
        assert_eq!(client.take_text(), "ABC\r\n");

        client.send(b"f\r\n");
        reactor.turn().unwrap();
        assert_eq!(client.take_text(), "DEF\r\n");
        assert_eq!(reactor.phase(0), Some(Phase::AwaitingCommand));
        assert_eq!(reactor.stats().frames, 2);
    }

    #[test]
    fn test_close_flushes_then_evicts() {
        let (mut reactor, net) = reactor(ReactorSettings::default());
        let client = net.connect();
        reactor.turn().unwrap();
        client.take_received();

        client.send(b"BYE\r\nignored\r\n");
        reactor.turn().unwrap();
        assert_eq!(client.take_text(), "bye\r\n");
        assert!(client.is_closed());
        assert_eq!(reactor.connection_count(), 0);
        assert_eq!(reactor.dispatcher().closed, vec![0]);
    }

    #[test]
    fn test_peer_eof_evicts() {
        let (mut reactor, net) = reactor(ReactorSettings::default());
        let client = net.connect();
        reactor.turn().unwrap();

        client.shutdown_write();
        reactor.turn().unwrap();
        assert!(client.is_closed());
        assert_eq!(reactor.stats().evicted, 1);
    }

    #[test]
    fn test_read_error_isolated() {
        let (mut reactor, net) = reactor(ReactorSettings::default());
        let bad = net.connect();
        let good = net.connect();
        reactor.turn().unwrap();
        good.take_received();

        bad.fail_next_read(io::ErrorKind::ConnectionReset);
        good.send(b"ok\r\n");
        reactor.turn().unwrap();

        assert!(bad.is_closed());
        assert!(!good.is_closed());
        assert_eq!(good.take_text(), "OK\r\n");
    }

    #[test]
    fn test_partial_writes_resume_in_order() {
        let (mut reactor, net) = reactor(ReactorSettings::default());
        let client = net.connect();
        client.set_write_budget(Some(1));
        reactor.turn().unwrap();
        assert_eq!(client.take_text(), "h");

        client.send(b"one\r\ntwo\r\n");
        reactor.turn().unwrap();
        assert_eq!(client.take_text(), "");

        client.set_write_budget(None);
        client.limit_write_chunk(3);
        reactor.turn().unwrap();
        assert_eq!(client.take_text(), "i\r\nONE\r\nTWO\r\n");
    }

    #[test]
    fn test_oversize_frame_answers_and_closes() {
        let settings = ReactorSettings {
            max_frame_size: 8,
            ..ReactorSettings::default()
        };
        let (mut reactor, net) = reactor(settings);
        let client = net.connect();
        reactor.turn().unwrap();
        client.take_received();

        client.send(b"0123456789abcdef");
        reactor.turn().unwrap();
        assert_eq!(client.take_text(), "too long\r\n");
        assert!(client.is_closed());
    }

    #[test]
    fn test_connection_limit_rejects() {
        let settings = ReactorSettings {
            max_connections: 1,
            ..ReactorSettings::default()
        };
        let (mut reactor, net) = reactor(settings);
        let first = net.connect();
        let second = net.connect();
        reactor.turn().unwrap();

        assert!(!first.is_closed());
        assert!(second.is_closed());
        assert_eq!(reactor.stats().rejected, 1);
    }

    #[test]
    fn test_accept_error_does_not_stop_loop() {
        let (mut reactor, net) = reactor(ReactorSettings::default());
        net.fail_next_accept(io::ErrorKind::Other);
        let client = net.connect();

        reactor.turn().unwrap();
        assert_eq!(reactor.connection_count(), 0);
        reactor.turn().unwrap();
        assert_eq!(client.take_text(), "hi\r\n");
    }

    #[test]
    fn test_idle_timeout_evicts_silently() {
        let settings = ReactorSettings {
            idle_timeout: Some(Duration::from_secs(10)),
            tick_interval: Duration::from_secs(1),
            ..ReactorSettings::default()
        };
        let clock = ManualClock::new();
        let (reactor, net) = reactor(settings);
        let mut reactor = reactor.with_clock(clock.clone());
        let idle = net.connect();
        let busy = net.connect();
        reactor.turn().unwrap();
        idle.take_received();
        busy.take_received();

        clock.advance(Duration::from_secs(6));
        busy.send(b"ping\r\n");
        reactor.turn().unwrap();
        clock.advance(Duration::from_secs(6));
        reactor.turn().unwrap();

        assert!(idle.is_closed());
        assert_eq!(idle.take_text(), "");
        assert!(!busy.is_closed());
    }

    #[test]
    fn test_read_budget_carries_over() {
        let settings = ReactorSettings {
            read_size: 4,
            reads_per_event: 1,
            ..ReactorSettings::default()
        };
        let (mut reactor, net) = reactor(settings);
        let client = net.connect();
        reactor.turn().unwrap();
        client.take_received();

        client.send(b"abcdef\r\n");
        reactor.turn().unwrap();
        assert_eq!(client.take_text(), "");
        reactor.turn().unwrap();
        assert_eq!(client.take_text(), "ABCDEF\r\n");
    }

    #[test]
    fn test_shutdown_stops_run() {
        let (mut reactor, net) = reactor(ReactorSettings::default());
        let client = net.connect();
        reactor.turn().unwrap();

        reactor.shutdown_handle().trigger();
        reactor.run().unwrap();
        assert!(client.is_closed());
        assert_eq!(reactor.connection_count(), 0);
    }
}
