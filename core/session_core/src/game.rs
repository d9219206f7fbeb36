//! Game sessions
//!
//! A star: one host, any number of clients. Each side pairs its reliable
//! link with a datagram endpoint and runs the viability negotiator per
//! peer, so latency-sensitive packet types can move to datagrams once the
//! path is proven both ways.
//!
//! ```text
//! client                                  host
//!   │ ── JOIN (UdpPort) ────────────────► │  duplicate name / full → DECLINE
//!   │ ◄─────────────── WELCOME (UdpPort) ─│
//!   │ ◄═══ TEST / CONFIRM datagrams ════► │
//!   │ ── READY / PLAYERS ───────────────► │
//!   │ ── LEAVE ─────────────────────────► │
//! ```
//!
//! Packet kinds from [`FIRST_APPLICATION_KIND`] upward belong to the
//! application and are handed to `SessionHandler::on_packet_decoded`.

use std::collections::HashSet;
use std::net::SocketAddr;

use crate::config::TransportMode;
use crate::error::SessionError;
use crate::peer::{Peer, PeerId};
use crate::session::{LinkId, Protocol, Session, SessionCore, SessionHandler, SessionState, Target};
use crate::viability::{Viability, ViabilityState};
use crate::wire::{Framing, Packet, GAME_FRAMING};

/// Lowest packet kind reserved for the application
pub const FIRST_APPLICATION_KIND: u16 = 100;

pub const UDP_PORT_KEY: &str = "UdpPort";
pub const READY_KEY: &str = "Ready";
pub const REASON_KEY: &str = "Reason";

// ============================================================================
// Kinds
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GameKind {
    Join,
    Welcome,
    Decline,
    Ready,
    Players,
    Test,
    Confirm,
    Leave,
}

impl GameKind {
    pub const ALL: [GameKind; 8] = [
        GameKind::Join,
        GameKind::Welcome,
        GameKind::Decline,
        GameKind::Ready,
        GameKind::Players,
        GameKind::Test,
        GameKind::Confirm,
        GameKind::Leave,
    ];

    pub fn code(self) -> u16 {
        match self {
            GameKind::Join => 1,
            GameKind::Welcome => 2,
            GameKind::Decline => 3,
            GameKind::Ready => 4,
            GameKind::Players => 5,
            GameKind::Test => 6,
            GameKind::Confirm => 7,
            GameKind::Leave => 8,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            GameKind::Join => "JOIN",
            GameKind::Welcome => "WELCOME",
            GameKind::Decline => "DECLINE",
            GameKind::Ready => "READY",
            GameKind::Players => "PLAYERS",
            GameKind::Test => "TEST",
            GameKind::Confirm => "CONFIRM",
            GameKind::Leave => "LEAVE",
        }
    }

    pub fn from_code(code: u16) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.code() == code)
    }
}

// ============================================================================
// Transport choice
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Reliable,
    Unreliable,
}

/// Which transport a packet takes
///
/// | mode         | latency-sensitive | pair state | channel    |
/// |--------------|-------------------|------------|------------|
/// | ReliableOnly | any               | any        | Reliable   |
/// | Auto         | no                | any        | Reliable   |
/// | Auto         | yes               | Probing    | Reliable   |
/// | Auto         | yes               | Exhausted  | Reliable   |
/// | Auto         | yes               | Working    | Unreliable |
pub fn choose_channel(mode: TransportMode, latency_sensitive: bool, state: ViabilityState) -> Channel {
    match (mode, latency_sensitive, state) {
        (TransportMode::Auto, true, ViabilityState::Working) => Channel::Unreliable,
        _ => Channel::Reliable,
    }
}

/// The stricter of two modes
fn ceiling(a: TransportMode, b: TransportMode) -> TransportMode {
    if a == TransportMode::ReliableOnly || b == TransportMode::ReliableOnly {
        TransportMode::ReliableOnly
    } else {
        TransportMode::Auto
    }
}

// ============================================================================
// Per-peer State
// ============================================================================

/// Game state for one peer
#[derive(Debug, Clone, Default)]
pub struct GameData {
    pub ready: bool,
    /// Player ids this peer owns
    pub players: Vec<u32>,
    /// Per-peer ceiling on datagram use
    pub preference: TransportMode,
    /// The peer's datagram endpoint
    pub udp_addr: Option<SocketAddr>,
    pub viability: Viability,
}

// ============================================================================
// Protocol
// ============================================================================

#[derive(Default)]
pub struct GameProtocol {
    latency_sensitive: HashSet<u16>,
    ready: bool,
    players: Vec<u32>,
}

impl GameProtocol {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub fn players(&self) -> &[u32] {
        &self.players
    }

    pub fn is_latency_sensitive(&self, kind: u16) -> bool {
        self.latency_sensitive.contains(&kind)
    }

    fn packet(core: &SessionCore, kind: GameKind) -> Packet {
        core.new_packet(kind.code(), kind.name())
    }

    fn ready_packet(&self, core: &SessionCore) -> Packet {
        Self::packet(core, GameKind::Ready).with_field(READY_KEY, if self.ready { 1 } else { 0 })
    }

    fn players_packet(&self, core: &SessionCore) -> Packet {
        Self::packet(core, GameKind::Players).with_body(self.players.iter().map(|p| p.to_string()))
    }

    /// Refuse a JOIN and close the link once the refusal is flushed
    fn decline(core: &mut SessionCore, link: LinkId, reason: &str) {
        let mut packet = Self::packet(core, GameKind::Decline).with_field(REASON_KEY, reason);
        core.send_on(link, &mut packet);
        core.close_link(link);
    }

    /// Channel a packet of `kind` takes to `peer`, with the datagram address
    fn channel_for(&self, core: &SessionCore, peer: PeerId, kind: u16) -> (Channel, Option<SocketAddr>) {
        let Some(data) = core.peer(peer).and_then(|p| p.game_ref()) else {
            return (Channel::Reliable, None);
        };
        let Some(addr) = data.udp_addr else {
            return (Channel::Reliable, None);
        };
        if core.datagram_addr().is_none() {
            return (Channel::Reliable, None);
        }

        let mode = ceiling(core.config().transport_mode, data.preference);
        let state = data.viability.state(core.config().max_probe_attempts);
        (choose_channel(mode, self.is_latency_sensitive(kind), state), Some(addr))
    }

    /// Share our ready flag and player list with a freshly joined peer
    fn share_state(&self, core: &mut SessionCore, link: LinkId) {
        if self.ready {
            let mut packet = self.ready_packet(core);
            core.send_on(link, &mut packet);
        }
        if !self.players.is_empty() {
            let mut packet = self.players_packet(core);
            core.send_on(link, &mut packet);
        }
    }

    // ------------------------------------------------------------------------
    // Handshake
    // ------------------------------------------------------------------------

    fn on_join(
        &mut self,
        core: &mut SessionCore,
        link: LinkId,
        packet: &Packet,
        handler: &mut dyn SessionHandler,
    ) {
        if !core.is_hosting() {
            core.fault(format!("JOIN from '{}' but we are not hosting", packet.sender()), handler);
            return;
        }
        let Some(remote) = core.link_addr(link) else {
            return;
        };

        let name = packet.sender().to_string();
        if let Some(existing) = core.peer_by_name(&name) {
            let live_elsewhere = core.link_peer(link) != Some(existing)
                && core
                    .peer(existing)
                    .map_or(false, |p| p.links().any(|l| core.is_link_open(l)));
            if live_elsewhere {
                Self::decline(core, link, "name already in use");
                core.fault(format!("declined duplicate join of '{}'", name), handler);
                return;
            }
        }

        let peer = match core.link_peer(link).or_else(|| core.peer_by_name(&name)) {
            Some(peer) => peer,
            None => match core.add_peer(Peer::new(name.as_str(), remote.ip(), remote.port())) {
                Some(peer) => peer,
                None => {
                    Self::decline(core, link, "session full");
                    core.fault(format!("session full; declined '{}'", name), handler);
                    return;
                }
            },
        };
        core.attach(link, peer, true);

        let udp_addr = packet
            .field(UDP_PORT_KEY)
            .and_then(|p| p.trim().parse::<u16>().ok())
            .map(|port| SocketAddr::new(remote.ip(), port));
        if let Some(p) = core.peer_mut(peer) {
            p.valid = true;
            let data = p.game();
            data.udp_addr = udp_addr;
            data.viability.reset();
        }

        let udp_port = core.datagram_addr().map_or(0, |a| a.port());
        let mut welcome = Self::packet(core, GameKind::Welcome).with_field(UDP_PORT_KEY, udp_port);
        core.send_on(link, &mut welcome);
        self.share_state(core, link);

        if let Some(p) = core.peer(peer) {
            log::info!("'{}' joined from {} (datagrams at {:?})", p.name, remote, udp_addr);
            handler.on_peer_registered(peer, p);
        }
    }

    fn on_welcome(
        &mut self,
        core: &mut SessionCore,
        link: LinkId,
        packet: &Packet,
        handler: &mut dyn SessionHandler,
    ) {
        if core.host_link() != Some(link) {
            core.fault(format!("unexpected WELCOME from '{}'", packet.sender()), handler);
            return;
        }
        let Some(remote) = core.link_addr(link) else {
            return;
        };

        let peer = match core.link_peer(link) {
            Some(peer) => peer,
            None => match core.add_peer(Peer::new(packet.sender(), remote.ip(), remote.port())) {
                Some(peer) => peer,
                None => return,
            },
        };
        core.attach(link, peer, true);

        let udp_addr = packet
            .field(UDP_PORT_KEY)
            .and_then(|p| p.trim().parse::<u16>().ok())
            .map(|port| SocketAddr::new(remote.ip(), port));
        if let Some(p) = core.peer_mut(peer) {
            p.valid = true;
            let data = p.game();
            data.udp_addr = udp_addr;
            data.viability.reset();
        }
        self.share_state(core, link);

        if let Some(p) = core.peer(peer) {
            log::info!("Joined '{}' at {}", p.name, remote);
            handler.on_peer_registered(peer, p);
        }
    }

    fn on_leave(&mut self, core: &mut SessionCore, peer: PeerId, handler: &mut dyn SessionHandler) {
        if let Some(p) = core.remove_peer(peer) {
            log::info!("'{}' left the game", p.name);
            handler.on_peer_disconnected(peer, &p);
        }
    }

    // ------------------------------------------------------------------------
    // Viability
    // ------------------------------------------------------------------------

    fn on_probe(
        &mut self,
        core: &mut SessionCore,
        from: SocketAddr,
        peer: PeerId,
        kind: GameKind,
    ) {
        let Some(p) = core.peer_mut(peer) else {
            return;
        };
        let name = p.name.clone();
        let data = p.game();
        if data.udp_addr.is_none() {
            data.udp_addr = Some(from);
        }

        let was_working = data.viability.is_working();
        let owe_confirm = match kind {
            GameKind::Test => data.viability.on_test(),
            _ => {
                data.viability.on_confirm();
                false
            }
        };
        if !was_working && data.viability.is_working() {
            log::info!("Datagram path to '{}' is working", name);
        }

        if owe_confirm {
            let mut confirm = Self::packet(core, GameKind::Confirm);
            core.send_datagram(from, &mut confirm);
        }
    }
}

impl Protocol for GameProtocol {
    fn framing(&self) -> Framing {
        GAME_FRAMING
    }

    fn on_started(&mut self, core: &mut SessionCore) -> Result<(), SessionError> {
        match core.state() {
            SessionState::Hosting => {
                let port = core.listen_addr().map_or(0, |a| a.port());
                core.bind_datagram(port)?;
            }
            SessionState::Connected => {
                let udp = core.bind_datagram(0)?;
                if let Some(link) = core.host_link() {
                    let mut join = Self::packet(core, GameKind::Join).with_field(UDP_PORT_KEY, udp.port());
                    core.send_on(link, &mut join);
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn on_stopping(&mut self, core: &mut SessionCore) {
        let mut leave = Self::packet(core, GameKind::Leave);
        for peer in core.valid_peers() {
            core.send_to_peer(peer, &mut leave);
        }
    }

    fn on_stopped(&mut self) {
        self.ready = false;
    }

    fn on_packet(
        &mut self,
        core: &mut SessionCore,
        link: LinkId,
        packet: Packet,
        handler: &mut dyn SessionHandler,
    ) {
        let Some(kind) = GameKind::from_code(packet.kind()) else {
            if packet.kind() >= FIRST_APPLICATION_KIND {
                let sender = core.link_peer(link).and_then(|id| core.peer(id));
                handler.on_packet_decoded(&packet, sender);
            } else {
                core.fault(
                    format!("unknown game packet {} {}", packet.kind(), packet.kind_name()),
                    handler,
                );
            }
            return;
        };

        match kind {
            GameKind::Join => return self.on_join(core, link, &packet, handler),
            GameKind::Welcome => return self.on_welcome(core, link, &packet, handler),
            GameKind::Decline => {
                let reason = packet.field(REASON_KEY).unwrap_or("no reason given");
                core.fault(format!("'{}' declined us: {}", packet.sender(), reason), handler);
                return;
            }
            _ => {}
        }

        let Some(peer) = core.link_peer(link) else {
            log::debug!("{} before JOIN from {:?}; ignoring", kind.name(), core.link_addr(link));
            return;
        };

        match kind {
            GameKind::Ready => {
                let ready = matches!(packet.field(READY_KEY).map(str::trim), Some("1") | Some("true"));
                if let Some(p) = core.peer_mut(peer) {
                    log::debug!("'{}' ready: {}", p.name, ready);
                    p.game().ready = ready;
                }
            }
            GameKind::Players => {
                let players = packet
                    .body()
                    .iter()
                    .filter_map(|line| line.trim().parse::<u32>().ok())
                    .collect();
                if let Some(p) = core.peer_mut(peer) {
                    p.game().players = players;
                }
            }
            GameKind::Leave => self.on_leave(core, peer, handler),
            GameKind::Test | GameKind::Confirm => {
                log::debug!("{} over the reliable link; ignoring", kind.name());
            }
            GameKind::Join | GameKind::Welcome | GameKind::Decline => {}
        }
    }

    fn on_datagram(
        &mut self,
        core: &mut SessionCore,
        from: SocketAddr,
        packet: Packet,
        handler: &mut dyn SessionHandler,
    ) {
        let Some(peer) = core.peer_by_name(packet.sender()).filter(|&id| {
            core.peer(id).map_or(false, |p| p.valid)
        }) else {
            log::trace!("Datagram from unknown sender '{}' at {}", packet.sender(), from);
            return;
        };

        match GameKind::from_code(packet.kind()) {
            Some(kind @ (GameKind::Test | GameKind::Confirm)) => {
                self.on_probe(core, from, peer, kind);
            }
            None if packet.kind() >= FIRST_APPLICATION_KIND => {
                handler.on_packet_decoded(&packet, core.peer(peer));
            }
            _ => log::debug!("Ignoring {} datagram from {}", packet.kind_name(), from),
        }
    }

    fn on_tick(&mut self, core: &mut SessionCore, _handler: &mut dyn SessionHandler) {
        if core.config().transport_mode == TransportMode::ReliableOnly
            || core.datagram_addr().is_none()
        {
            return;
        }
        let max_attempts = core.config().max_probe_attempts;

        for peer in core.valid_peers() {
            let Some(p) = core.peer_mut(peer) else {
                continue;
            };
            let data = p.game();
            let Some(addr) = data.udp_addr else {
                continue;
            };
            if data.preference == TransportMode::ReliableOnly {
                continue;
            }

            let before = data.viability.state(max_attempts);
            let probes = data.viability.tick(max_attempts);
            let after = data.viability.state(max_attempts);
            if before != after && after == ViabilityState::Exhausted {
                log::warn!("Giving up on datagrams to '{}'; staying reliable", p.name);
            }

            if probes.test {
                let mut test = Self::packet(core, GameKind::Test);
                core.send_datagram(addr, &mut test);
            }
            if probes.confirm {
                let mut confirm = Self::packet(core, GameKind::Confirm);
                core.send_datagram(addr, &mut confirm);
            }
        }
    }

    fn route(&mut self, core: &mut SessionCore, target: Target, mut packet: Packet) {
        let peers = match target {
            Target::Peer(peer) => vec![peer],
            Target::Everyone if core.is_hosting() => core.valid_peers(),
            Target::Everyone => match core.host_link().and_then(|l| core.link_peer(l)) {
                Some(host) => vec![host],
                // Not welcomed yet; the host link is all we have
                None => return core.send_reliable(Target::Everyone, &mut packet),
            },
        };

        for peer in peers {
            let sent = match self.channel_for(core, peer, packet.kind()) {
                (Channel::Unreliable, Some(addr)) => core.send_datagram(addr, &mut packet),
                _ => false,
            };
            if !sent {
                core.send_to_peer(peer, &mut packet);
            }
        }
    }

    fn on_datagram_lost(
        &mut self,
        core: &mut SessionCore,
        unsent: Vec<(SocketAddr, Packet)>,
        _handler: &mut dyn SessionHandler,
    ) {
        for peer in core.valid_peers() {
            if let Some(p) = core.peer_mut(peer) {
                p.game().viability.reset();
            }
        }

        // Probes are moot; application packets still owed go reliable
        for (addr, mut packet) in unsent {
            if packet.kind() < FIRST_APPLICATION_KIND {
                continue;
            }
            let peer = core.valid_peers().into_iter().find(|&id| {
                core.peer(id)
                    .and_then(|p| p.game_ref())
                    .map_or(false, |d| d.udp_addr == Some(addr))
            });
            match peer {
                Some(peer) => {
                    core.send_to_peer(peer, &mut packet);
                }
                None => log::debug!("Dropping {} for {}: no peer owns it", packet.kind_name(), addr),
            }
        }
    }
}

// ============================================================================
// Session API
// ============================================================================

pub type GameSession = Session<GameProtocol>;

impl Session<GameProtocol> {
    /// Set our ready flag and tell the other side
    pub fn set_ready(&mut self, ready: bool) {
        let (core, protocol) = self.parts_mut();
        protocol.ready = ready;
        let mut packet = protocol.ready_packet(core);
        core.send_reliable(Target::Everyone, &mut packet);
    }

    /// Replace the list of players we own and tell the other side
    pub fn set_players(&mut self, players: Vec<u32>) {
        let (core, protocol) = self.parts_mut();
        protocol.players = players;
        let mut packet = protocol.players_packet(core);
        core.send_reliable(Target::Everyone, &mut packet);
    }

    /// We and every valid peer are ready
    pub fn all_ready(&self) -> bool {
        self.protocol().is_ready()
            && self
                .core()
                .peers()
                .iter()
                .filter(|(_, p)| p.valid)
                .all(|(_, p)| p.game_ref().map_or(false, |d| d.ready))
    }

    /// Let packets of `kind` use datagrams once a pair converges
    pub fn mark_latency_sensitive(&mut self, kind: u16) {
        let (_, protocol) = self.parts_mut();
        protocol.latency_sensitive.insert(kind);
    }

    pub fn set_peer_preference(&mut self, peer: PeerId, mode: TransportMode) {
        let (core, _) = self.parts_mut();
        if let Some(p) = core.peer_mut(peer) {
            p.game().preference = mode;
        }
    }

    /// Channel the next packet of `kind` to `peer` would take
    pub fn channel_for(&self, peer: PeerId, kind: u16) -> Channel {
        self.protocol().channel_for(self.core(), peer, kind).0
    }

    pub fn viability(&self, peer: PeerId) -> Option<&Viability> {
        self.peer(peer).and_then(|p| p.game_ref()).map(|d| &d.viability)
    }

    pub fn players_of(&self, peer: PeerId) -> Option<&[u32]> {
        self.peer(peer)
            .and_then(|p| p.game_ref())
            .map(|d| d.players.as_slice())
    }
}
