//! Sessions: peers, transports and the per-tick driver
//!
//! A [`Session`] owns everything one participant needs: the listening
//! endpoint (when hosting), an optional datagram endpoint, a table of
//! reliable transports ("links") and a table of peers. What is said over
//! those transports is decided by a [`Protocol`] (signaling or game); the
//! session only moves bytes, tracks ownership and reports lifecycle events.
//!
//! # Tick
//!
//! The application calls [`Session::advance`] once per frame:
//!
//! ```text
//! poll readiness ──► accept (≤ 1) ──► reap dead/stale links ──► read + decode
//!                                                               │
//!      flush outbound ◄── protocol tick ◄── read datagrams ◄────┘
//! ```
//!
//! Nothing in a tick blocks and no error escapes it: faults become a
//! reason string (`last_error`, `SessionHandler::on_fault`).

use std::collections::VecDeque;
use std::net::{IpAddr, SocketAddr};

use crate::config::{LocalIdentity, NetConfig};
use crate::error::{SessionError, TransportError, WireError};
use crate::peer::{Peer, PeerId};
use crate::slots::{SlotId, Slots};
use crate::transport::{
    DatagramTransport, Network, StreamListener, StreamTransport, TransportStats,
};
use crate::wire::{Framing, Packet};

/// Scratch buffer size for one read call
const READ_BUF_SIZE: usize = 64 * 1024;

/// Datagrams handled per tick before yielding to the rest of the tick
const MAX_DATAGRAMS_PER_TICK: usize = 256;

pub type LinkId = SlotId<Link>;

// ============================================================================
// State
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    /// Listening for peers
    Hosting,
    /// Joined a host
    Connected,
    /// The link to our host was lost
    Disconnected,
    Stopped,
}

impl SessionState {
    fn is_active(self) -> bool {
        matches!(
            self,
            SessionState::Hosting | SessionState::Connected | SessionState::Disconnected
        )
    }
}

/// Where an outbound packet goes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    /// Every valid peer when hosting, the host otherwise
    Everyone,
    Peer(PeerId),
}

/// Everything a session needs from its surroundings
pub struct NetContext {
    pub network: Box<dyn Network>,
    pub config: NetConfig,
    pub identity: LocalIdentity,
}

impl NetContext {
    pub fn new(network: impl Network + 'static, config: NetConfig, identity: LocalIdentity) -> Self {
        Self {
            network: Box::new(network),
            config,
            identity,
        }
    }
}

// ============================================================================
// Callbacks
// ============================================================================

/// Application callbacks, invoked from inside `advance`
pub trait SessionHandler {
    /// A packet the protocol does not consume itself
    fn on_packet_decoded(&mut self, _packet: &Packet, _sender: Option<&Peer>) {}

    /// A peer completed its handshake
    fn on_peer_registered(&mut self, _id: PeerId, _peer: &Peer) {}

    /// A peer left or lost its last transport
    fn on_peer_disconnected(&mut self, _id: PeerId, _peer: &Peer) {}

    /// Client only: the link to the host is gone
    fn on_host_disconnected(&mut self) {}

    fn on_fault(&mut self, _reason: &str) {}
}

impl SessionHandler for () {}

/// What is spoken over a session's transports
pub trait Protocol {
    fn framing(&self) -> Framing;

    /// The session just started hosting or connecting
    fn on_started(&mut self, _core: &mut SessionCore) -> Result<(), SessionError> {
        Ok(())
    }

    /// Last chance to queue packets before `stop` releases every transport
    fn on_stopping(&mut self, _core: &mut SessionCore) {}

    fn on_stopped(&mut self) {}

    /// A packet decoded from a reliable link
    fn on_packet(
        &mut self,
        core: &mut SessionCore,
        link: LinkId,
        packet: Packet,
        handler: &mut dyn SessionHandler,
    );

    /// A frame on `link` that did not parse as a packet
    fn on_malformed(
        &mut self,
        core: &mut SessionCore,
        link: LinkId,
        error: WireError,
        handler: &mut dyn SessionHandler,
    ) {
        let from = core.link_addr(link);
        core.fault(format!("malformed packet from {:?}: {}", from, error), handler);
    }

    /// A packet decoded from the datagram endpoint
    fn on_datagram(
        &mut self,
        _core: &mut SessionCore,
        _from: SocketAddr,
        _packet: Packet,
        _handler: &mut dyn SessionHandler,
    ) {
    }

    fn on_tick(&mut self, _core: &mut SessionCore, _handler: &mut dyn SessionHandler) {}

    /// The datagram endpoint failed and is gone; `unsent` never left
    fn on_datagram_lost(
        &mut self,
        _core: &mut SessionCore,
        _unsent: Vec<(SocketAddr, Packet)>,
        _handler: &mut dyn SessionHandler,
    ) {
    }

    /// A peer lost its last transport; it is already out of the table
    fn on_peer_disconnected(
        &mut self,
        _core: &mut SessionCore,
        _id: PeerId,
        _peer: &Peer,
        _handler: &mut dyn SessionHandler,
    ) {
    }

    /// Queue an application packet
    fn route(&mut self, core: &mut SessionCore, target: Target, mut packet: Packet) {
        core.send_reliable(target, &mut packet);
    }
}

// ============================================================================
// Links
// ============================================================================

/// One reliable transport and its buffers
pub struct Link {
    stream: Box<dyn StreamTransport>,
    peer: Option<PeerId>,
    inbound: Vec<u8>,
    backlog: Vec<u8>,
    /// We opened it (as opposed to accepting it)
    outbound: bool,
    /// Drop once the backlog drains
    closing: bool,
    opened_ms: u64,
}

impl Link {
    fn new(stream: Box<dyn StreamTransport>, outbound: bool, opened_ms: u64) -> Self {
        Self {
            stream,
            peer: None,
            inbound: Vec::new(),
            backlog: Vec::new(),
            outbound,
            closing: false,
            opened_ms,
        }
    }

    pub fn peer(&self) -> Option<PeerId> {
        self.peer
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.stream.peer_addr()
    }

    pub fn is_outbound(&self) -> bool {
        self.outbound
    }

    pub fn stats(&self) -> &TransportStats {
        self.stream.stats()
    }

    fn is_reapable(&self) -> bool {
        self.stream.is_deleted() || (self.closing && self.backlog.is_empty())
    }

    /// Accepted, still nameless, and older than `timeout_ms`
    fn is_stale(&self, now_ms: u64, timeout_ms: u64) -> bool {
        !self.outbound
            && !self.closing
            && self.peer.is_none()
            && now_ms.saturating_sub(self.opened_ms) >= timeout_ms
    }
}

/// Aggregate transport counters for one session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub peers: usize,
    pub valid_peers: usize,
    pub links: usize,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub sent_per_second: u64,
    pub received_per_second: u64,
    pub datagram_bytes_sent: u64,
    pub datagram_bytes_received: u64,
}

// ============================================================================
// Session Core
// ============================================================================

/// Tables and transports shared with the protocol
pub struct SessionCore {
    state: SessionState,
    net: Box<dyn Network>,
    config: NetConfig,
    me: LocalIdentity,
    framing: Framing,
    listener: Option<Box<dyn StreamListener>>,
    datagram: Option<Box<dyn DatagramTransport>>,
    datagram_queue: VecDeque<(SocketAddr, Packet)>,
    links: Slots<Link>,
    peers: Slots<Peer>,
    host_link: Option<LinkId>,
    read_buf: Vec<u8>,
    now_ms: u64,
    last_error: Option<String>,
}

impl SessionCore {
    fn new(ctx: NetContext, framing: Framing) -> Self {
        Self {
            state: SessionState::Idle,
            net: ctx.network,
            config: ctx.config,
            me: ctx.identity,
            framing,
            listener: None,
            datagram: None,
            datagram_queue: VecDeque::new(),
            links: Slots::new(),
            peers: Slots::new(),
            host_link: None,
            read_buf: vec![0u8; READ_BUF_SIZE],
            now_ms: 0,
            last_error: None,
        }
    }

    // ------------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------------

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_hosting(&self) -> bool {
        self.state == SessionState::Hosting
    }

    pub fn identity(&self) -> &LocalIdentity {
        &self.me
    }

    pub fn config(&self) -> &NetConfig {
        &self.config
    }

    pub fn now_ms(&self) -> u64 {
        self.now_ms
    }

    pub fn framing(&self) -> Framing {
        self.framing
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn host_link(&self) -> Option<LinkId> {
        self.host_link
    }

    pub fn listen_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().map(|l| l.local_addr())
    }

    pub fn datagram_addr(&self) -> Option<SocketAddr> {
        self.datagram.as_ref().map(|d| d.local_addr())
    }

    /// A new packet stamped with our name and the current tick time
    pub fn new_packet(&self, kind: u16, kind_name: &str) -> Packet {
        Packet::new(self.framing, kind, kind_name, self.me.name.as_str(), self.now_ms)
    }

    /// Record a fault and report it to the application
    pub fn fault(&mut self, reason: impl Into<String>, handler: &mut dyn SessionHandler) {
        let reason = reason.into();
        log::warn!("{}", reason);
        handler.on_fault(&reason);
        self.last_error = Some(reason);
    }

    pub fn stats(&self) -> SessionStats {
        let mut stats = SessionStats {
            peers: self.peers.len(),
            valid_peers: self.peers.iter().filter(|(_, p)| p.valid).count(),
            links: self.links.len(),
            ..SessionStats::default()
        };
        for (_, link) in self.links.iter() {
            let s = link.stats();
            stats.bytes_sent += s.bytes_sent();
            stats.bytes_received += s.bytes_received();
            stats.sent_per_second += s.sent_per_second();
            stats.received_per_second += s.received_per_second();
        }
        if let Some(datagram) = &self.datagram {
            stats.datagram_bytes_sent = datagram.stats().bytes_sent();
            stats.datagram_bytes_received = datagram.stats().bytes_received();
        }
        stats
    }

    // ------------------------------------------------------------------------
    // Peers
    // ------------------------------------------------------------------------

    pub fn peers(&self) -> &Slots<Peer> {
        &self.peers
    }

    pub fn peer(&self, id: PeerId) -> Option<&Peer> {
        self.peers.get(id)
    }

    pub fn peer_mut(&mut self, id: PeerId) -> Option<&mut Peer> {
        self.peers.get_mut(id)
    }

    pub fn peer_by_name(&self, name: &str) -> Option<PeerId> {
        if name.is_empty() {
            return None;
        }
        self.peers
            .iter()
            .find(|(_, p)| p.name == name)
            .map(|(id, _)| id)
    }

    pub fn peer_by_address(&self, address: IpAddr, port: u16) -> Option<PeerId> {
        self.peers
            .iter()
            .find(|(_, p)| p.address == address && p.port == port)
            .map(|(id, _)| id)
    }

    pub fn valid_peers(&self) -> Vec<PeerId> {
        self.peers
            .iter()
            .filter(|(_, p)| p.valid)
            .map(|(id, _)| id)
            .collect()
    }

    /// Add a peer; `None` when the session is full
    pub fn add_peer(&mut self, peer: Peer) -> Option<PeerId> {
        if self.peers.len() >= self.config.max_peers {
            return None;
        }
        debug_assert!(
            peer.name.is_empty()
                || !self
                    .peers
                    .iter()
                    .any(|(_, p)| p.is(&peer.name, peer.address, peer.port)),
            "duplicate peer identity {}",
            peer.name
        );
        log::debug!("Adding peer '{}' at {}", peer.name, peer.socket_addr());
        Some(self.peers.insert(peer))
    }

    /// Remove a peer, closing its links once their backlogs drain
    ///
    /// The caller reports the departure; no callbacks fire from here.
    pub fn remove_peer(&mut self, id: PeerId) -> Option<Peer> {
        let peer = self.peers.remove(id)?;
        for link_id in peer.links() {
            if let Some(link) = self.links.get_mut(link_id) {
                link.peer = None;
                link.closing = true;
            }
        }
        log::info!("Removed peer '{}' ({})", peer.name, peer.socket_addr());
        Some(peer)
    }

    // ------------------------------------------------------------------------
    // Links
    // ------------------------------------------------------------------------

    pub fn link(&self, id: LinkId) -> Option<&Link> {
        self.links.get(id)
    }

    pub fn link_peer(&self, id: LinkId) -> Option<PeerId> {
        self.links.get(id).and_then(|l| l.peer)
    }

    pub fn link_addr(&self, id: LinkId) -> Option<SocketAddr> {
        self.links.get(id).map(|l| l.remote_addr())
    }

    /// Present and not being closed locally
    fn accepts_input(&self, id: LinkId) -> bool {
        self.links.get(id).map_or(false, |l| !l.closing)
    }

    /// Present, not flagged and not being closed
    pub fn is_link_open(&self, id: LinkId) -> bool {
        self.links
            .get(id)
            .map_or(false, |l| !l.closing && !l.stream.is_deleted())
    }

    /// Bind `link` to `peer`, as its primary transport or an extra one
    pub fn attach(&mut self, link: LinkId, peer: PeerId, primary: bool) {
        let previous = match self.links.get_mut(link) {
            Some(l) => l.peer.replace(peer),
            None => return,
        };
        if let Some(old) = previous.filter(|&old| old != peer) {
            if let Some(old_peer) = self.peers.get_mut(old) {
                old_peer.detach(link);
            }
        }
        if let Some(p) = self.peers.get_mut(peer) {
            if primary {
                p.set_primary(link);
            } else {
                p.add_auxiliary(link);
            }
        }
    }

    /// Detach `link` from its peer and close it once its backlog drains
    pub fn close_link(&mut self, id: LinkId) {
        let Some(link) = self.links.get_mut(id) else {
            return;
        };
        link.closing = true;
        if let Some(peer) = link.peer.take() {
            if let Some(p) = self.peers.get_mut(peer) {
                p.detach(id);
            }
        }
    }

    /// Open an outbound reliable link
    pub fn connect(&mut self, addr: SocketAddr) -> Result<LinkId, TransportError> {
        let stream = self.net.connect(addr)?;
        log::info!("Opened transport to {}", addr);
        Ok(self.links.insert(Link::new(stream, true, self.now_ms)))
    }

    /// Start accepting inbound links on `port`
    pub fn listen(&mut self, port: u16) -> Result<SocketAddr, TransportError> {
        let listener = self.net.listen(port)?;
        let addr = listener.local_addr();
        log::info!("Listening on {}", addr);
        self.listener = Some(listener);
        Ok(addr)
    }

    pub fn bind_datagram(&mut self, port: u16) -> Result<SocketAddr, TransportError> {
        let datagram = self.net.bind_datagram(port)?;
        let addr = datagram.local_addr();
        log::info!("Datagram endpoint bound on {}", addr);
        self.datagram = Some(datagram);
        Ok(addr)
    }

    // ------------------------------------------------------------------------
    // Sending
    // ------------------------------------------------------------------------

    /// Queue `packet` on `link`; false if the link is gone or closing
    pub fn send_on(&mut self, link: LinkId, packet: &mut Packet) -> bool {
        match self.links.get_mut(link) {
            Some(l) if !l.closing => {
                l.backlog.extend_from_slice(packet.encoded());
                true
            }
            _ => false,
        }
    }

    /// Queue `packet` on the peer's primary link
    pub fn send_to_peer(&mut self, peer: PeerId, packet: &mut Packet) -> bool {
        let link = match self.peers.get(peer) {
            Some(p) => {
                debug_assert!(!p.name.is_empty(), "sending to a peer without identity");
                p.primary()
            }
            None => None,
        };
        match link {
            Some(link) => self.send_on(link, packet),
            None => false,
        }
    }

    /// Queue `packet` over reliable transports
    pub fn send_reliable(&mut self, target: Target, packet: &mut Packet) {
        match target {
            Target::Peer(peer) => {
                if !self.send_to_peer(peer, packet) {
                    log::debug!("Dropping {} for unreachable peer {:?}", packet.kind_name(), peer);
                }
            }
            Target::Everyone if self.is_hosting() => {
                for peer in self.valid_peers() {
                    self.send_to_peer(peer, packet);
                }
            }
            Target::Everyone => match self.host_link {
                Some(link) => {
                    self.send_on(link, packet);
                }
                None => log::debug!("No host link; dropping {}", packet.kind_name()),
            },
        }
    }

    /// Queue `packet` as one datagram to `to`; false without a live endpoint
    pub fn send_datagram(&mut self, to: SocketAddr, packet: &mut Packet) -> bool {
        if !self.datagram.as_ref().map_or(false, |d| !d.is_deleted()) {
            return false;
        }
        packet.encoded();
        self.datagram_queue.push_back((to, packet.clone()));
        true
    }

    // ------------------------------------------------------------------------
    // Tick phases
    // ------------------------------------------------------------------------

    fn accept_one(&mut self) {
        let Some(listener) = self.listener.as_mut() else {
            return;
        };
        if let Some(stream) = listener.accept() {
            log::info!("Accepted transport from {}", stream.peer_addr());
            self.links.insert(Link::new(stream, false, self.now_ms));
        }
    }

    /// Close accepted links that never completed a handshake
    fn close_stale_links(&mut self) {
        let (now, timeout) = (self.now_ms, self.config.handshake_timeout_ms);
        for (_, link) in self.links.iter_mut() {
            if link.is_stale(now, timeout) {
                log::info!(
                    "No handshake from {} within {} ms; closing",
                    link.remote_addr(),
                    timeout
                );
                link.closing = true;
            }
        }
    }

    fn reapable_links(&self) -> Vec<LinkId> {
        self.links
            .iter()
            .filter(|(_, l)| l.is_reapable())
            .map(|(id, _)| id)
            .collect()
    }

    /// Drain the link's stream and decode what is complete
    fn read_link(
        &mut self,
        id: LinkId,
        handler: &mut dyn SessionHandler,
    ) -> Vec<Result<Packet, WireError>> {
        let budget = self.config.decode_line_budget;
        let max_pending = self.config.max_pending_bytes;
        let framing = self.framing;

        let Some(link) = self.links.get_mut(id) else {
            return Vec::new();
        };
        if link.closing {
            return Vec::new();
        }

        loop {
            let n = link.stream.read(&mut self.read_buf);
            if n == 0 {
                break;
            }
            link.inbound.extend_from_slice(&self.read_buf[..n]);
        }
        if link.inbound.is_empty() {
            return Vec::new();
        }

        let (packets, decoded) = Packet::decode_all(framing, &link.inbound, budget);
        link.inbound.drain(..decoded.consumed);

        let addr = link.stream.peer_addr();
        let mut fault = None;
        if decoded.garbled {
            fault = Some(format!(
                "garbled stream from {}: discarded {} bytes",
                addr, decoded.consumed
            ));
        }
        if link.inbound.len() > max_pending {
            fault = Some(format!(
                "partial message from {} exceeds {} bytes; discarded",
                addr, max_pending
            ));
            link.inbound.clear();
        }

        if let Some(reason) = fault {
            self.fault(reason, handler);
        }
        packets
    }

    fn recv_datagram(&mut self) -> Option<(SocketAddr, Vec<Result<Packet, WireError>>)> {
        let datagram = self.datagram.as_mut()?;
        let (n, from) = datagram.recv_from(&mut self.read_buf)?;
        let (packets, _) =
            Packet::decode_all(self.framing, &self.read_buf[..n], self.config.decode_line_budget);
        Some((from, packets))
    }

    fn flush(&mut self) {
        for (_, link) in self.links.iter_mut() {
            if link.backlog.is_empty() || link.stream.is_deleted() {
                continue;
            }
            let n = link.stream.write(&link.backlog);
            link.backlog.drain(..n);
        }

        if let Some(datagram) = self.datagram.as_mut() {
            while let Some((to, packet)) = self.datagram_queue.front_mut() {
                if datagram.send_to(packet.encoded(), *to) == 0 {
                    break;
                }
                self.datagram_queue.pop_front();
            }
        }
    }

    /// Drop every transport and peer
    fn release(&mut self) {
        self.listener = None;
        self.datagram = None;
        self.datagram_queue.clear();
        self.host_link = None;
        self.links.drain();
        self.peers.drain();
    }
}

// ============================================================================
// Session
// ============================================================================

/// One participant: core tables plus the protocol spoken over them
pub struct Session<P: Protocol> {
    core: SessionCore,
    protocol: P,
}

impl<P: Protocol> Session<P> {
    pub fn new(ctx: NetContext, protocol: P) -> Self {
        let framing = protocol.framing();
        Self {
            core: SessionCore::new(ctx, framing),
            protocol,
        }
    }

    pub fn core(&self) -> &SessionCore {
        &self.core
    }

    pub fn protocol(&self) -> &P {
        &self.protocol
    }

    pub(crate) fn parts_mut(&mut self) -> (&mut SessionCore, &mut P) {
        (&mut self.core, &mut self.protocol)
    }

    pub fn state(&self) -> SessionState {
        self.core.state
    }

    pub fn identity(&self) -> &LocalIdentity {
        &self.core.me
    }

    pub fn last_error(&self) -> Option<&str> {
        self.core.last_error()
    }

    pub fn peer(&self, id: PeerId) -> Option<&Peer> {
        self.core.peer(id)
    }

    pub fn peer_by_name(&self, name: &str) -> Option<PeerId> {
        self.core.peer_by_name(name)
    }

    pub fn peer_by_address(&self, address: IpAddr, port: u16) -> Option<PeerId> {
        self.core.peer_by_address(address, port)
    }

    pub fn peer_count(&self) -> usize {
        self.core.peers.len()
    }

    pub fn stats(&self) -> SessionStats {
        self.core.stats()
    }

    /// A packet stamped with our name and the current tick time
    pub fn packet(&self, kind: u16, kind_name: &str) -> Packet {
        self.core.new_packet(kind, kind_name)
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    fn ensure_startable(&self) -> Result<(), SessionError> {
        match self.core.state {
            SessionState::Idle | SessionState::Stopped => Ok(()),
            state => Err(SessionError::InvalidState(state)),
        }
    }

    /// Start hosting on `port`
    pub fn host(&mut self, port: u16) -> Result<(), SessionError> {
        self.ensure_startable()?;
        let previous = self.core.state;

        let addr = self.core.listen(port)?;
        self.core.state = SessionState::Hosting;
        log::info!("'{}' hosting on {}", self.core.me.name, addr);

        if let Err(e) = self.protocol.on_started(&mut self.core) {
            self.core.release();
            self.core.state = previous;
            return Err(e);
        }
        Ok(())
    }

    /// Join the host at `addr`
    pub fn connect_to(&mut self, addr: SocketAddr) -> Result<(), SessionError> {
        self.ensure_startable()?;
        let previous = self.core.state;

        let link = self.core.connect(addr)?;
        self.core.host_link = Some(link);
        self.core.state = SessionState::Connected;
        log::info!("'{}' connecting to {}", self.core.me.name, addr);

        if let Err(e) = self.protocol.on_started(&mut self.core) {
            self.core.release();
            self.core.state = previous;
            return Err(e);
        }
        Ok(())
    }

    /// Release every transport and peer; safe to call repeatedly
    pub fn stop(&mut self) {
        if self.core.state == SessionState::Stopped {
            return;
        }
        if self.core.state.is_active() {
            self.protocol.on_stopping(&mut self.core);
            self.core.flush();
        }

        log::info!(
            "'{}' stopping ({} peers, {} transports)",
            self.core.me.name,
            self.core.peers.len(),
            self.core.links.len()
        );
        self.core.release();
        self.protocol.on_stopped();
        self.core.state = SessionState::Stopped;
    }

    // ------------------------------------------------------------------------
    // Sending
    // ------------------------------------------------------------------------

    /// Send to every valid peer (host) or to the host (client)
    pub fn send(&mut self, packet: Packet) {
        self.protocol.route(&mut self.core, Target::Everyone, packet);
    }

    pub fn send_to(&mut self, peer: PeerId, packet: Packet) {
        self.protocol.route(&mut self.core, Target::Peer(peer), packet);
    }

    // ------------------------------------------------------------------------
    // Tick
    // ------------------------------------------------------------------------

    /// Run one tick at time `now_ms`
    pub fn advance(&mut self, now_ms: u64, handler: &mut dyn SessionHandler) {
        if !self.core.state.is_active() {
            return;
        }
        self.core.now_ms = now_ms;

        let timeout = self.core.config.readiness_timeout();
        if let Err(e) = self.core.net.poll(timeout) {
            self.core.fault(format!("readiness poll failed: {}", e), handler);
        }

        if self.core.listener.is_some() {
            self.core.accept_one();
        }
        self.core.close_stale_links();
        self.reap(handler);
        self.read_links(handler);
        self.read_datagrams(handler);
        self.protocol.on_tick(&mut self.core, handler);
        self.core.flush();
    }

    fn reap(&mut self, handler: &mut dyn SessionHandler) {
        for link_id in self.core.reapable_links() {
            let Some(link) = self.core.links.remove(link_id) else {
                continue;
            };

            if link.stream.is_deleted() {
                let reason = link
                    .stream
                    .last_error()
                    .unwrap_or("transport closed")
                    .to_string();
                log::info!("Transport to {} closed: {}", link.remote_addr(), reason);
                self.core.last_error = Some(reason);
            } else {
                log::debug!("Closed transport to {}", link.remote_addr());
            }

            if let Some(peer_id) = link.peer {
                self.detach(peer_id, link_id, handler);
            }

            if self.core.host_link == Some(link_id) {
                self.core.host_link = None;
                if self.core.state == SessionState::Connected {
                    log::warn!("Lost the link to our host");
                    self.core.state = SessionState::Disconnected;
                    handler.on_host_disconnected();
                }
            }
        }

        let datagram_failed = self.core.datagram.as_ref().map_or(false, |d| d.is_deleted());
        if datagram_failed {
            let reason = self
                .core
                .datagram
                .as_ref()
                .and_then(|d| d.last_error())
                .unwrap_or("datagram endpoint failed")
                .to_string();
            self.core.datagram = None;
            let unsent: Vec<_> = self.core.datagram_queue.drain(..).collect();
            self.core.fault(reason, handler);
            self.protocol.on_datagram_lost(&mut self.core, unsent, handler);
        }
    }

    fn detach(&mut self, peer_id: PeerId, link_id: LinkId, handler: &mut dyn SessionHandler) {
        let orphaned = match self.core.peers.get_mut(peer_id) {
            Some(peer) => {
                peer.detach(link_id);
                !peer.has_links()
            }
            None => false,
        };
        if !orphaned {
            return;
        }
        if let Some(peer) = self.core.peers.remove(peer_id) {
            log::info!("Peer '{}' disconnected", peer.name);
            handler.on_peer_disconnected(peer_id, &peer);
            self.protocol
                .on_peer_disconnected(&mut self.core, peer_id, &peer, handler);
        }
    }

    fn read_links(&mut self, handler: &mut dyn SessionHandler) {
        for link_id in self.core.links.ids() {
            let packets = self.core.read_link(link_id, handler);
            for result in packets {
                // An earlier packet may have closed the link
                if !self.core.accepts_input(link_id) {
                    break;
                }
                match result {
                    Ok(packet) => {
                        log::trace!("{} from {}", packet.kind_name(), packet.sender());
                        self.protocol
                            .on_packet(&mut self.core, link_id, packet, handler);
                    }
                    Err(e) => self.protocol.on_malformed(&mut self.core, link_id, e, handler),
                }
            }
        }
    }

    fn read_datagrams(&mut self, handler: &mut dyn SessionHandler) {
        for _ in 0..MAX_DATAGRAMS_PER_TICK {
            let Some((from, packets)) = self.core.recv_datagram() else {
                break;
            };
            for result in packets {
                match result {
                    Ok(packet) => self.protocol.on_datagram(&mut self.core, from, packet, handler),
                    Err(e) => log::debug!("Dropping malformed datagram from {}: {}", from, e),
                }
            }
        }
    }
}

impl<P: Protocol> Drop for Session<P> {
    fn drop(&mut self) {
        self.stop();
    }
}
