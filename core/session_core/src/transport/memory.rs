//! In-process network for deterministic tests
//!
//! A [`MemoryNetwork`] is one host on a shared switchboard. Create the first
//! host with [`MemoryNetwork::new`] and further hosts with
//! [`MemoryNetwork::host`]; every host gets its own IP, so sessions on
//! different hosts see distinct peer addresses.
//!
//! ```text
//!  host 10.0.0.1 ──┐                      ┌── host 10.0.0.2
//!                  ├──── Switchboard ─────┤
//!  host 10.0.0.3 ──┘  listeners, pipes,   └── ...
//!                     datagram queues
//! ```
//!
//! Streams are pairs of byte queues; writes are always accepted until the
//! pipe is closed. Faults can be injected with [`MemoryNetwork::sever`]
//! (closes every stream between two hosts),
//! [`MemoryNetwork::block_datagrams`] (one-directional datagram loss) and
//! [`MemoryNetwork::fail_datagram`] (a datagram endpoint errors out).

use std::cell::RefCell;
use std::collections::{HashMap, HashSet, VecDeque};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::rc::{Rc, Weak};
use std::time::Duration;

use super::{
    DatagramTransport, Network, StreamListener, StreamTransport, TransportStats,
};
use crate::error::TransportError;

/// First port handed out for port-0 binds and outbound connections
const EPHEMERAL_PORT_START: u16 = 40_000;

// ============================================================================
// Switchboard
// ============================================================================

type Backlog = Rc<RefCell<VecDeque<MemoryStream>>>;
type DatagramQueue = Rc<RefCell<VecDeque<(SocketAddr, Vec<u8>)>>>;

struct Switchboard {
    listeners: HashMap<SocketAddr, Backlog>,
    datagrams: HashMap<SocketAddr, DatagramQueue>,
    pipes: Vec<Weak<RefCell<Pipe>>>,
    blocked: HashSet<(IpAddr, IpAddr)>,
    /// Datagram endpoints whose next I/O fails
    failed: HashSet<SocketAddr>,
    next_port: u16,
    next_host: u8,
}

impl Switchboard {
    fn allocate_port(&mut self) -> u16 {
        let port = self.next_port;
        self.next_port = self.next_port.wrapping_add(1).max(EPHEMERAL_PORT_START);
        port
    }

    /// Streams and datagrams have separate port spaces, as TCP and UDP do
    fn is_bound(&self, addr: &SocketAddr, kind: PortKind) -> bool {
        match kind {
            PortKind::Stream => self.listeners.contains_key(addr),
            PortKind::Datagram => self.datagrams.contains_key(addr),
        }
    }
}

/// Shared state of one stream: a byte queue per direction
struct Pipe {
    to_acceptor: VecDeque<u8>,
    to_connector: VecDeque<u8>,
    connector_addr: SocketAddr,
    acceptor_addr: SocketAddr,
    closed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PortKind {
    Stream,
    Datagram,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Connector,
    Acceptor,
}

// ============================================================================
// Network Handle
// ============================================================================

/// One host on an in-process switchboard
#[derive(Clone)]
pub struct MemoryNetwork {
    switchboard: Rc<RefCell<Switchboard>>,
    ip: IpAddr,
}

impl MemoryNetwork {
    /// Create a new switchboard and its first host (10.0.0.1)
    pub fn new() -> Self {
        let switchboard = Switchboard {
            listeners: HashMap::new(),
            datagrams: HashMap::new(),
            pipes: Vec::new(),
            blocked: HashSet::new(),
            failed: HashSet::new(),
            next_port: EPHEMERAL_PORT_START,
            next_host: 2,
        };
        Self {
            switchboard: Rc::new(RefCell::new(switchboard)),
            ip: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
        }
    }

    /// Add another host to the same switchboard
    pub fn host(&self) -> MemoryNetwork {
        let mut board = self.switchboard.borrow_mut();
        let ip = IpAddr::V4(Ipv4Addr::new(10, 0, 0, board.next_host));
        board.next_host = board.next_host.wrapping_add(1);
        MemoryNetwork {
            switchboard: self.switchboard.clone(),
            ip,
        }
    }

    pub fn local_ip(&self) -> IpAddr {
        self.ip
    }

    /// Close every stream between hosts `a` and `b`
    pub fn sever(&self, a: IpAddr, b: IpAddr) {
        let mut board = self.switchboard.borrow_mut();
        board.pipes.retain(|weak| weak.strong_count() > 0);
        for pipe in board.pipes.iter().filter_map(Weak::upgrade) {
            let mut pipe = pipe.borrow_mut();
            let (x, y) = (pipe.connector_addr.ip(), pipe.acceptor_addr.ip());
            if (x == a && y == b) || (x == b && y == a) {
                log::debug!("Severing stream {} <-> {}", pipe.connector_addr, pipe.acceptor_addr);
                pipe.closed = true;
            }
        }
    }

    /// Silently drop datagrams sent from host `from` to host `to`
    pub fn block_datagrams(&self, from: IpAddr, to: IpAddr) {
        self.switchboard.borrow_mut().blocked.insert((from, to));
    }

    pub fn unblock_datagrams(&self, from: IpAddr, to: IpAddr) {
        self.switchboard.borrow_mut().blocked.remove(&(from, to));
    }

    /// Make the datagram endpoint bound at `addr` fail on its next I/O
    pub fn fail_datagram(&self, addr: SocketAddr) {
        log::debug!("Failing datagram endpoint {}", addr);
        self.switchboard.borrow_mut().failed.insert(addr);
    }

    fn bind_addr(&self, port: u16, kind: PortKind) -> Result<SocketAddr, TransportError> {
        let mut board = self.switchboard.borrow_mut();
        let port = if port == 0 { board.allocate_port() } else { port };
        let addr = SocketAddr::new(self.ip, port);
        if board.is_bound(&addr, kind) {
            return Err(TransportError::AddrInUse(addr));
        }
        Ok(addr)
    }
}

impl Default for MemoryNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl Network for MemoryNetwork {
    fn listen(&mut self, port: u16) -> Result<Box<dyn StreamListener>, TransportError> {
        let addr = self.bind_addr(port, PortKind::Stream)?;
        let backlog: Backlog = Rc::new(RefCell::new(VecDeque::new()));
        self.switchboard
            .borrow_mut()
            .listeners
            .insert(addr, backlog.clone());

        Ok(Box::new(MemoryListener {
            switchboard: self.switchboard.clone(),
            addr,
            backlog,
        }))
    }

    fn connect(&mut self, addr: SocketAddr) -> Result<Box<dyn StreamTransport>, TransportError> {
        let mut board = self.switchboard.borrow_mut();
        let backlog = board
            .listeners
            .get(&addr)
            .cloned()
            .ok_or(TransportError::Refused(addr))?;

        let local = SocketAddr::new(self.ip, board.allocate_port());
        let pipe = Rc::new(RefCell::new(Pipe {
            to_acceptor: VecDeque::new(),
            to_connector: VecDeque::new(),
            connector_addr: local,
            acceptor_addr: addr,
            closed: false,
        }));
        board.pipes.push(Rc::downgrade(&pipe));

        backlog
            .borrow_mut()
            .push_back(MemoryStream::new(pipe.clone(), Side::Acceptor, local));

        Ok(Box::new(MemoryStream::new(pipe, Side::Connector, addr)))
    }

    fn bind_datagram(
        &mut self,
        port: u16,
    ) -> Result<Box<dyn DatagramTransport>, TransportError> {
        let addr = self.bind_addr(port, PortKind::Datagram)?;
        let queue: DatagramQueue = Rc::new(RefCell::new(VecDeque::new()));
        self.switchboard
            .borrow_mut()
            .datagrams
            .insert(addr, queue.clone());

        Ok(Box::new(MemoryDatagram {
            switchboard: self.switchboard.clone(),
            addr,
            queue,
            deleted: false,
            last_error: None,
            stats: TransportStats::new(),
        }))
    }

    fn poll(&mut self, _timeout: Duration) -> Result<(), TransportError> {
        // Everything is ready immediately
        Ok(())
    }
}

// ============================================================================
// Listener
// ============================================================================

struct MemoryListener {
    switchboard: Rc<RefCell<Switchboard>>,
    addr: SocketAddr,
    backlog: Backlog,
}

impl StreamListener for MemoryListener {
    fn accept(&mut self) -> Option<Box<dyn StreamTransport>> {
        let stream = self.backlog.borrow_mut().pop_front()?;
        Some(Box::new(stream))
    }

    fn local_addr(&self) -> SocketAddr {
        self.addr
    }
}

impl Drop for MemoryListener {
    fn drop(&mut self) {
        // Dropping queued streams closes them, refusing the connectors
        self.backlog.borrow_mut().clear();
        self.switchboard.borrow_mut().listeners.remove(&self.addr);
    }
}

// ============================================================================
// Stream
// ============================================================================

struct MemoryStream {
    pipe: Rc<RefCell<Pipe>>,
    side: Side,
    peer: SocketAddr,
    deleted: bool,
    last_error: Option<String>,
    stats: TransportStats,
}

impl MemoryStream {
    fn new(pipe: Rc<RefCell<Pipe>>, side: Side, peer: SocketAddr) -> Self {
        Self {
            pipe,
            side,
            peer,
            deleted: false,
            last_error: None,
            stats: TransportStats::new(),
        }
    }

    fn fail(&mut self, reason: &str) {
        if !self.deleted {
            log::debug!("Memory stream to {} failed: {}", self.peer, reason);
        }
        self.deleted = true;
        self.last_error = Some(reason.to_string());
    }
}

impl StreamTransport for MemoryStream {
    fn write(&mut self, buf: &[u8]) -> usize {
        if self.deleted {
            return 0;
        }

        let mut pipe = self.pipe.borrow_mut();
        if pipe.closed {
            drop(pipe);
            self.fail("connection reset by peer");
            return 0;
        }

        let queue = match self.side {
            Side::Connector => &mut pipe.to_acceptor,
            Side::Acceptor => &mut pipe.to_connector,
        };
        queue.extend(buf.iter().copied());
        drop(pipe);

        self.stats.record_sent(buf.len());
        buf.len()
    }

    fn read(&mut self, buf: &mut [u8]) -> usize {
        if self.deleted {
            return 0;
        }

        let mut pipe = self.pipe.borrow_mut();
        let closed = pipe.closed;
        let queue = match self.side {
            Side::Connector => &mut pipe.to_connector,
            Side::Acceptor => &mut pipe.to_acceptor,
        };

        if queue.is_empty() {
            drop(pipe);
            if closed {
                self.fail("connection closed by peer");
            }
            return 0;
        }

        let n = buf.len().min(queue.len());
        for (slot, byte) in buf.iter_mut().zip(queue.drain(..n)) {
            *slot = byte;
        }
        drop(pipe);

        self.stats.record_received(n);
        n
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

impl Drop for MemoryStream {
    fn drop(&mut self) {
        self.pipe.borrow_mut().closed = true;
    }
}

// ============================================================================
// Datagram
// ============================================================================

struct MemoryDatagram {
    switchboard: Rc<RefCell<Switchboard>>,
    addr: SocketAddr,
    queue: DatagramQueue,
    deleted: bool,
    last_error: Option<String>,
    stats: TransportStats,
}

impl MemoryDatagram {
    /// Pick up an injected failure; true once the endpoint is dead
    fn check_failed(&mut self) -> bool {
        if !self.deleted && self.switchboard.borrow().failed.contains(&self.addr) {
            log::debug!("Memory datagram endpoint {} failed", self.addr);
            self.deleted = true;
            self.last_error = Some("network unreachable".to_string());
        }
        self.deleted
    }
}

impl DatagramTransport for MemoryDatagram {
    fn send_to(&mut self, buf: &[u8], to: SocketAddr) -> usize {
        if self.check_failed() {
            return 0;
        }

        let board = self.switchboard.borrow();
        if board.blocked.contains(&(self.addr.ip(), to.ip())) {
            log::trace!("Dropping datagram {} -> {} (blocked)", self.addr, to);
        } else if let Some(queue) = board.datagrams.get(&to) {
            queue.borrow_mut().push_back((self.addr, buf.to_vec()));
        } else {
            log::trace!("Dropping datagram {} -> {} (nobody bound)", self.addr, to);
        }
        drop(board);

        // Best effort: the sender cannot tell a dropped datagram apart
        self.stats.record_sent(buf.len());
        buf.len()
    }

    fn recv_from(&mut self, buf: &mut [u8]) -> Option<(usize, SocketAddr)> {
        if self.check_failed() {
            return None;
        }

        let (from, data) = self.queue.borrow_mut().pop_front()?;
        let n = data.len().min(buf.len());
        buf[..n].copy_from_slice(&data[..n]);
        self.stats.record_received(n);
        Some((n, from))
    }

    fn is_deleted(&self) -> bool {
        self.deleted
    }

    fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    fn stats(&self) -> &TransportStats {
        &self.stats
    }
}

impl Drop for MemoryDatagram {
    fn drop(&mut self) {
        let mut board = self.switchboard.borrow_mut();
        board.datagrams.remove(&self.addr);
        board.failed.remove(&self.addr);
    }
}
