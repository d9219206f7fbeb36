//! Real sockets driven by a mio event loop
//!
//! All endpoints created by one [`MioNetwork`] share a single `Poll`.
//! `Network::poll` runs it once per tick with a short timeout and records
//! which tokens became readable or writable. Endpoints only attempt I/O
//! while their token is marked ready, and clear the mark on `WouldBlock`
//! (mio readiness is edge-triggered).

use std::cell::RefCell;
use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::rc::Rc;
use std::time::Duration;

use mio::event::Source;
use mio::net::{TcpListener, TcpStream, UdpSocket};
use mio::{Events, Interest, Poll, Token};

use super::{
    DatagramTransport, Network, StreamListener, StreamTransport, TransportStats,
};
use crate::error::TransportError;

/// Event buffer capacity per poll
const EVENTS_CAPACITY: usize = 1024;

// ============================================================================
// Reactor
// ============================================================================

#[derive(Debug, Default, Clone, Copy)]
struct Readiness {
    readable: bool,
    writable: bool,
    error: bool,
}

struct Reactor {
    poll: Poll,
    events: Events,
    readiness: HashMap<Token, Readiness>,
    next_token: usize,
}

/// An endpoint's slot in the shared reactor
struct Registration {
    reactor: Rc<RefCell<Reactor>>,
    token: Token,
}

impl Registration {
    fn register<S: Source>(
        reactor: &Rc<RefCell<Reactor>>,
        source: &mut S,
        interest: Interest,
    ) -> io::Result<Self> {
        let mut r = reactor.borrow_mut();
        let token = Token(r.next_token);
        r.next_token += 1;
        r.poll.registry().register(source, token, interest)?;
        r.readiness.insert(token, Readiness::default());

        Ok(Registration {
            reactor: reactor.clone(),
            token,
        })
    }

    fn readiness(&self) -> Readiness {
        self.reactor
            .borrow()
            .readiness
            .get(&self.token)
            .copied()
            .unwrap_or_default()
    }

    fn update(&self, f: impl FnOnce(&mut Readiness)) {
        if let Some(r) = self.reactor.borrow_mut().readiness.get_mut(&self.token) {
            f(r);
        }
    }

    fn deregister<S: Source>(&self, source: &mut S) {
        let mut r = self.reactor.borrow_mut();
        if let Err(e) = r.poll.registry().deregister(source) {
            log::trace!("Deregister {:?} failed: {}", self.token, e);
        }
        r.readiness.remove(&self.token);
    }
}

// ============================================================================
// Network
// ============================================================================

/// Endpoint factory backed by real TCP/UDP sockets
pub struct MioNetwork {
    reactor: Rc<RefCell<Reactor>>,
    bind_ip: IpAddr,
}

impl MioNetwork {
    /// Create a network that binds on all IPv4 interfaces
    pub fn new() -> Result<Self, TransportError> {
        Self::with_bind_ip(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
    }

    pub fn with_bind_ip(bind_ip: IpAddr) -> Result<Self, TransportError> {
        let reactor = Reactor {
            poll: Poll::new()?,
            events: Events::with_capacity(EVENTS_CAPACITY),
            readiness: HashMap::new(),
            next_token: 0,
        };

        Ok(MioNetwork {
            reactor: Rc::new(RefCell::new(reactor)),
            bind_ip,
        })
    }
}

impl Network for MioNetwork {
    fn listen(&mut self, port: u16) -> Result<Box<dyn StreamListener>, TransportError> {
        let addr = SocketAddr::new(self.bind_ip, port);
        let mut listener =
            TcpListener::bind(addr).map_err(|source| TransportError::Bind { addr, source })?;
        let reg = Registration::register(&self.reactor, &mut listener, Interest::READABLE)?;
        let local = listener.local_addr().unwrap_or(addr);

        Ok(Box::new(MioListener {
            listener,
            reg,
            local,
        }))
    }

    fn connect(&mut self, addr: SocketAddr) -> Result<Box<dyn StreamTransport>, TransportError> {
        let mut stream =
            TcpStream::connect(addr).map_err(|source| TransportError::Connect { addr, source })?;
        let reg = Registration::register(
            &self.reactor,
            &mut stream,
            Interest::READABLE | Interest::WRITABLE,
        )?;

        log::debug!("Connecting to {}", addr);

        Ok(Box::new(MioStream::new(stream, reg, addr)))
    }

    fn bind_datagram(
        &mut self,
        port: u16,
    ) -> Result<Box<dyn DatagramTransport>, TransportError> {
        let addr = SocketAddr::new(self.bind_ip, port);
        let mut socket =
            UdpSocket::bind(addr).map_err(|source| TransportError::Bind { addr, source })?;
        let reg = Registration::register(
            &self.reactor,
            &mut socket,
            Interest::READABLE | Interest::WRITABLE,
        )?;
        let local = socket.local_addr().unwrap_or(addr);

        Ok(Box::new(MioDatagram {
            socket,
            reg,
            local,
            deleted: false,
            last_error: None,
            stats: TransportStats::new(),
        }))
    }

    fn poll(&mut self, timeout: Duration) -> Result<(), TransportError> {
        let mut guard = self.reactor.borrow_mut();
        let Reactor {
            poll,
            events,
            readiness,
            ..
        } = &mut *guard;

        match poll.poll(events, Some(timeout)) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(e) => return Err(e.into()),
        }

        for event in events.iter() {
            let entry = readiness.entry(event.token()).or_default();
            if event.is_readable() || event.is_read_closed() {
                entry.readable = true;
            }
            if event.is_writable() || event.is_write_closed() {
                entry.writable = true;
            }
            if event.is_error() {
                entry.error = true;
                entry.readable = true;
                entry.writable = true;
            }
        }

        Ok(())
    }
}

// ============================================================================
// Listener
// ============================================================================

struct MioListener {
    listener: TcpListener,
    reg: Registration,
    local: SocketAddr,
}

impl StreamListener for MioListener {
    fn accept(&mut self) -> Option<Box<dyn StreamTransport>> {
        if !self.reg.readiness().readable {
            return None;
        }

        match self.listener.accept() {
            Ok((mut stream, addr)) => {
                let reg = match Registration::register(
                    &self.reg.reactor,
                    &mut stream,
                    Interest::READABLE | Interest::WRITABLE,
                ) {
                    Ok(reg) => reg,
                    Err(e) => {
                        log::warn!("Failed to register accepted stream from {}: {}", addr, e);
                        return None;
                    }
                };
                log::debug!("Accepted connection from {}", addr);
                Some(Box::new(MioStream::new(stream, reg, addr)))
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                self.reg.update(|r| r.readable = false);
                None
            }
            Err(e) => {
                log::warn!("Accept failed on {}: {}", self.local, e);
                None
            }
        }
    }

    fn local_addr(&self) -> SocketAddr {
        self.local
    }
}

impl Drop for MioListener {
    fn drop(&mut self) {
        self.reg.deregister(&mut self.listener);
    }
}

// ============================================================================
// Stream
// ============================================================================

struct MioStream {
    stream: TcpStream,
    reg: Registration,
    peer: SocketAddr,
    deleted: bool,
    last_error: Option<String>,
    stats: TransportStats,
}

impl MioStream {
    fn new(stream: TcpStream, reg: Registration, peer: SocketAddr) -> Self {
        MioStream {
            stream,
            reg,
            peer,
            deleted: false,
            last_error: None,
            stats: TransportStats::new(),
        }
    }

    fn fail(&mut self, reason: String) {
        log::debug!("Stream to {} failed: {}", self.peer, reason);
        self.deleted = true;
        self.last_error = Some(reason);
    }

    /// Surface a pending socket error (e.g. a refused connect)
    fn check_socket_error(&mut self) -> bool {
        if !self.reg.readiness().error {
            return false;
        }
        self.reg.update(|r| r.error = false);

        match self.stream.take_error() {
            Ok(None) => false,
            Ok(Some(e)) | Err(e) => {
                self.fail(e.to_string());
                true
            }
        }
    }
}

impl StreamTransport for MioStream {
    fn write(&mut self, buf: &[u8]) -> usize {
        if self.deleted || buf.is_empty() || self.check_socket_error() {
            return 0;
        }
        if !self.reg.readiness().writable {
            return 0;
        }

        match self.stream.write(buf) {
            Ok(n) => {
                self.stats.record_sent(n);
                n
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                self.reg.update(|r| r.writable = false);
                0
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => 0,
            Err(e) => {
                self.fail(e.to_string());
                0
            }
        }
    }

    fn read(&mut self, buf: &mut [u8]) -> usize {
        if self.deleted || buf.is_empty() || self.check_socket_error() {
            return 0;
        }
        if !self.reg.readiness().readable {
            return 0;
        }

        match self.stream.read(buf) {
            Ok(0) => {
                self.fail("connection closed by peer".to_string());
                0
            }
            Ok(n) => {
                self.stats.record_received(n);
                n
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                self.reg.update(|r| r.readable = false);
                0
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => 0,
            Err(e) => {
                self.fail(e.to_string());
                0
            }
        }
    }

    fn is_deleted(&self) -> bool {
        self.deleted
    }

    fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    fn stats(&self) -> &TransportStats {
        &self.stats
    }
}

impl Drop for MioStream {
    fn drop(&mut self) {
        self.reg.deregister(&mut self.stream);
    }
}

// ============================================================================
// Datagram
// ============================================================================

struct MioDatagram {
    socket: UdpSocket,
    reg: Registration,
    local: SocketAddr,
    deleted: bool,
    last_error: Option<String>,
    stats: TransportStats,
}

impl MioDatagram {
    fn fail(&mut self, reason: String) {
        log::warn!("Datagram endpoint {} failed: {}", self.local, reason);
        self.deleted = true;
        self.last_error = Some(reason);
    }
}

impl DatagramTransport for MioDatagram {
    fn send_to(&mut self, buf: &[u8], to: SocketAddr) -> usize {
        if self.deleted || !self.reg.readiness().writable {
            return 0;
        }

        match self.socket.send_to(buf, to) {
            Ok(n) => {
                self.stats.record_sent(n);
                n
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                self.reg.update(|r| r.writable = false);
                0
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => 0,
            Err(e) => {
                // ICMP-driven errors on an unconnected UDP socket concern
                // one destination only, not the endpoint
                log::debug!("Datagram send to {} failed: {}", to, e);
                self.last_error = Some(e.to_string());
                0
            }
        }
    }

    fn recv_from(&mut self, buf: &mut [u8]) -> Option<(usize, SocketAddr)> {
        if self.deleted || !self.reg.readiness().readable {
            return None;
        }

        match self.socket.recv_from(buf) {
            Ok((n, from)) => {
                self.stats.record_received(n);
                Some((n, from))
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                self.reg.update(|r| r.readable = false);
                None
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => None,
            Err(e) if e.kind() == io::ErrorKind::ConnectionReset => None,
            Err(e) => {
                self.fail(e.to_string());
                None
            }
        }
    }

    fn is_deleted(&self) -> bool {
        self.deleted
    }

    fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    fn local_addr(&self) -> SocketAddr {
        self.local
    }

    fn stats(&self) -> &TransportStats {
        &self.stats
    }
}

impl Drop for MioDatagram {
    fn drop(&mut self) {
        self.reg.deregister(&mut self.socket);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn loopback() -> MioNetwork {
        MioNetwork::with_bind_ip(IpAddr::V4(Ipv4Addr::LOCALHOST)).unwrap()
    }

    #[test]
    fn test_loopback_stream_exchange() {
        let mut net = loopback();
        let mut listener = net.listen(0).unwrap();
        let addr = listener.local_addr();
        let mut client = net.connect(addr).unwrap();

        let mut server = None;
        let mut received = Vec::new();
        let mut written = 0;
        let mut buf = [0u8; 64];

        for _ in 0..500 {
            net.poll(Duration::from_millis(5)).unwrap();
            if server.is_none() {
                server = listener.accept();
            }
            if written == 0 {
                written = client.write(b"hello");
            }
            if let Some(s) = server.as_mut() {
                let n = s.read(&mut buf);
                received.extend_from_slice(&buf[..n]);
            }
            if received.len() == 5 {
                break;
            }
        }

        assert_eq!(received, b"hello");
        assert!(!client.is_deleted());
    }

    #[test]
    fn test_loopback_datagram_exchange() {
        let mut net = loopback();
        let mut a = net.bind_datagram(0).unwrap();
        let mut b = net.bind_datagram(0).unwrap();
        let b_addr = b.local_addr();

        let mut buf = [0u8; 64];
        let mut got = None;
        let mut sent = false;

        for _ in 0..500 {
            net.poll(Duration::from_millis(5)).unwrap();
            if !sent {
                sent = a.send_to(b"probe", b_addr) == 5;
            }
            if let Some((n, from)) = b.recv_from(&mut buf) {
                got = Some((buf[..n].to_vec(), from));
                break;
            }
        }

        let (data, from) = got.expect("datagram delivered");
        assert_eq!(data, b"probe");
        assert_eq!(from.port(), a.local_addr().port());
    }

    #[test]
    fn test_not_ready_returns_zero() {
        let mut net = loopback();
        let mut listener = net.listen(0).unwrap();
        let mut client = net.connect(listener.local_addr()).unwrap();

        // No poll yet, so nothing is marked ready
        assert!(listener.accept().is_none());
        assert_eq!(client.write(b"x"), 0);
        assert!(!client.is_deleted());
    }
}
