//! Signaling: mutual registration and subscribe/notify peer discovery
//!
//! # Registration
//!
//! Each side of a pair registers with the other. A peer is valid only once
//! both directions are done:
//!
//! ```text
//! outbound:  Unregistered ──REGISTER sent──► RegisterSent ──OK──► RegisteredWithPeer
//! inbound:   Unregistered ──► AwaitingTheirRegister ──REGISTER rcvd──► RegisteredByPeer
//! ```
//!
//! A REGISTER for a name that is already bound to a live transport is
//! declined unless it carries the same tag, in which case the new
//! transport supersedes the old one (a reconnect).
//!
//! # Discovery
//!
//! After registering, a session subscribes to `peer-discovery` on the peer.
//! The subscribed side answers with a NOTIFY listing every other registered
//! peer and sends a fresh one whenever the roster changes. A session that
//! learns of an unknown peer dials it when its own name sorts first, so a
//! pair that discovers each other opens exactly one transport.

use std::net::{IpAddr, SocketAddr};

use ring::rand::{SecureRandom, SystemRandom};

use crate::error::SessionError;
use crate::peer::{Peer, PeerId};
use crate::session::{LinkId, Protocol, Session, SessionCore, SessionHandler, SessionState};
use crate::wire::{Framing, NameAddr, Packet, SIGNALING_FRAMING};

pub mod message;
pub mod subscription;

pub use message::{CSeq, SignalingKind, PEER_DISCOVERY};
pub use subscription::EventSubscription;

use message::{EVENT_KEY, EXPIRES_KEY, REASON_KEY};

// ============================================================================
// Per-peer State
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutboundRegistration {
    #[default]
    Unregistered,
    RegisterSent,
    RegisteredWithPeer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InboundRegistration {
    #[default]
    Unregistered,
    AwaitingTheirRegister,
    RegisteredByPeer,
}

/// A request of ours still waiting for its reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRequest {
    pub seq: u32,
    pub kind: SignalingKind,
    /// Event name, for SUBSCRIBE and NOTIFY
    pub event: Option<String>,
    /// Requested subscription length, for SUBSCRIBE
    pub expires_ms: Option<u64>,
    /// Forgotten once `request_timeout_ms` passes without a reply
    pub sent_ms: u64,
}

/// Signaling state for one peer
#[derive(Debug, Clone, Default)]
pub struct SignalingData {
    pub outbound: OutboundRegistration,
    pub inbound: InboundRegistration,
    /// Tag the peer registered with
    pub remote_tag: Option<String>,
    pub pending: Vec<PendingRequest>,
    /// Their subscriptions to our events
    pub their_subscriptions: Vec<EventSubscription>,
    /// Our subscriptions to their events
    pub our_subscriptions: Vec<EventSubscription>,
}

impl SignalingData {
    pub fn is_registered(&self) -> bool {
        self.outbound == OutboundRegistration::RegisteredWithPeer
            && self.inbound == InboundRegistration::RegisteredByPeer
    }

    fn take_pending(&mut self, seq: u32) -> Option<PendingRequest> {
        let index = self.pending.iter().position(|p| p.seq == seq)?;
        Some(self.pending.remove(index))
    }

    fn is_pending(&self, kind: SignalingKind, event: &str) -> bool {
        self.pending
            .iter()
            .any(|p| p.kind == kind && p.event.as_deref() == Some(event))
    }

    /// Remove requests sent at or before `cutoff_ms`
    fn expire_pending(&mut self, cutoff_ms: u64) -> Vec<PendingRequest> {
        let (expired, live) = std::mem::take(&mut self.pending)
            .into_iter()
            .partition(|p| p.sent_ms <= cutoff_ms);
        self.pending = live;
        expired
    }

    /// Back to a fresh pair, keeping nothing from an earlier transport
    fn restart(&mut self) {
        *self = Self::default();
    }
}

// ============================================================================
// Protocol
// ============================================================================

/// Random 8-hex-digit tag identifying one session instance
fn generate_tag() -> String {
    let rng = SystemRandom::new();
    let mut bytes = [0u8; 4];
    // Fall back to zeros on error (extremely unlikely)
    let _ = rng.fill(&mut bytes);
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Name a peer goes by in an address field
fn addr_name(addr: &NameAddr) -> &str {
    if addr.user.is_empty() {
        &addr.display
    } else {
        &addr.user
    }
}

pub struct SignalingProtocol {
    tag: String,
    next_seq: u32,
}

impl SignalingProtocol {
    pub fn new() -> Self {
        Self {
            tag: generate_tag(),
            next_seq: 1,
        }
    }

    /// Use a fixed tag instead of a random one
    pub fn with_tag(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            next_seq: 1,
        }
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    fn next_seq(&mut self) -> u32 {
        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1).max(1);
        seq
    }

    fn local_addr(&self, core: &SessionCore) -> NameAddr {
        let me = core.identity();
        NameAddr::new(me.name.clone(), me.address.to_string(), me.port).with_tag(self.tag.clone())
    }

    fn peer_addr(core: &SessionCore, peer: PeerId) -> NameAddr {
        match core.peer(peer) {
            Some(p) => {
                let addr = NameAddr::new(p.name.clone(), p.address.to_string(), p.port);
                match p.signaling_ref().and_then(|d| d.remote_tag.clone()) {
                    Some(tag) => addr.with_tag(tag),
                    None => addr,
                }
            }
            None => NameAddr::new("", "0.0.0.0", 0),
        }
    }

    fn is_allowed(core: &SessionCore, event: &str) -> bool {
        event == PEER_DISCOVERY || core.config().allowed_events.iter().any(|e| e == event)
    }

    // ------------------------------------------------------------------------
    // Sending
    // ------------------------------------------------------------------------

    /// Send a request to `peer` over its primary link and remember it
    fn send_request(
        &mut self,
        core: &mut SessionCore,
        peer: PeerId,
        kind: SignalingKind,
        build: impl FnOnce(Packet) -> Packet,
    ) -> bool {
        let Some(link) = core.peer(peer).and_then(|p| p.primary()) else {
            return false;
        };

        let seq = self.next_seq();
        let packet = message::request(core, kind, seq, &self.local_addr(core), &Self::peer_addr(core, peer));
        let mut packet = build(packet);

        if !core.send_on(link, &mut packet) {
            return false;
        }

        let pending = PendingRequest {
            seq,
            kind,
            event: message::event(&packet).map(str::to_string),
            expires_ms: message::expires(&packet),
            sent_ms: core.now_ms(),
        };
        if let Some(p) = core.peer_mut(peer) {
            p.signaling().pending.push(pending);
        }
        true
    }

    fn reply(
        &self,
        core: &mut SessionCore,
        link: LinkId,
        kind: SignalingKind,
        request: &Packet,
        build: impl FnOnce(Packet) -> Packet,
    ) {
        let packet = message::reply(core, kind, request, &self.local_addr(core));
        let mut packet = build(packet);
        if !core.send_on(link, &mut packet) {
            log::debug!("Could not send {} to {:?}", kind, core.link_addr(link));
        }
    }

    fn reply_with_reason(
        &self,
        core: &mut SessionCore,
        link: LinkId,
        kind: SignalingKind,
        request: &Packet,
        reason: &str,
    ) {
        self.reply(core, link, kind, request, |p| p.with_field(REASON_KEY, reason));
    }

    /// Answer with an error; a link that never named a peer is then closed
    fn refuse(
        &self,
        core: &mut SessionCore,
        link: LinkId,
        kind: SignalingKind,
        request: &Packet,
        reason: &str,
    ) {
        self.reply_with_reason(core, link, kind, request, reason);
        if core.link_peer(link).is_none() {
            core.close_link(link);
        }
    }

    /// Send our REGISTER to `peer`
    fn register_with(&mut self, core: &mut SessionCore, peer: PeerId) {
        if !self.send_request(core, peer, SignalingKind::Register, |p| p) {
            return;
        }
        if let Some(p) = core.peer_mut(peer) {
            let data = p.signaling();
            data.outbound = OutboundRegistration::RegisterSent;
            if data.inbound == InboundRegistration::Unregistered {
                data.inbound = InboundRegistration::AwaitingTheirRegister;
            }
        }
    }

    fn subscribe(&mut self, core: &mut SessionCore, peer: PeerId, event: &str) -> bool {
        let expires = core.config().subscription_ms;
        self.send_request(core, peer, SignalingKind::Subscribe, |p| {
            p.with_field(EVENT_KEY, event).with_field(EXPIRES_KEY, expires)
        })
    }

    /// Open a transport to `addr` for a peer we only know by address
    fn dial(
        &mut self,
        core: &mut SessionCore,
        name: &str,
        address: IpAddr,
        port: u16,
        handler: &mut dyn SessionHandler,
    ) -> Option<PeerId> {
        let addr = SocketAddr::new(address, port);
        let link = match core.connect(addr) {
            Ok(link) => link,
            Err(e) => {
                core.fault(format!("could not reach '{}': {}", name, e), handler);
                return None;
            }
        };

        let Some(peer) = core.add_peer(Peer::new(name, address, port)) else {
            core.close_link(link);
            core.fault(format!("session full; not dialing '{}'", name), handler);
            return None;
        };
        core.attach(link, peer, true);
        self.register_with(core, peer);
        Some(peer)
    }

    // ------------------------------------------------------------------------
    // Roster
    // ------------------------------------------------------------------------

    fn roster_for(core: &SessionCore, recipient: PeerId) -> Vec<String> {
        core.peers()
            .iter()
            .filter(|(id, p)| *id != recipient && p.valid)
            .map(|(id, _)| Self::peer_addr(core, id).to_string())
            .collect()
    }

    /// Send the current roster to every peer subscribed to discovery
    fn notify_roster(&mut self, core: &mut SessionCore) {
        let now = core.now_ms();
        let subscribers: Vec<PeerId> = core
            .peers()
            .iter()
            .filter(|(_, p)| {
                p.valid
                    && p.signaling_ref().map_or(false, |d| {
                        subscription::is_subscribed(&d.their_subscriptions, PEER_DISCOVERY, now)
                    })
            })
            .map(|(id, _)| id)
            .collect();

        for peer in subscribers {
            self.send_roster(core, peer);
        }
    }

    fn send_roster(&mut self, core: &mut SessionCore, peer: PeerId) {
        let roster = Self::roster_for(core, peer);
        log::debug!("Sending roster of {} peers to {:?}", roster.len(), peer);
        self.send_request(core, peer, SignalingKind::Notify, |p| {
            p.with_field(EVENT_KEY, PEER_DISCOVERY).with_body(roster)
        });
    }

    // ------------------------------------------------------------------------
    // Peer lifecycle
    // ------------------------------------------------------------------------

    /// Mark `peer` valid once both directions are registered
    fn check_valid(
        &mut self,
        core: &mut SessionCore,
        peer: PeerId,
        handler: &mut dyn SessionHandler,
    ) {
        let became_valid = match core.peer_mut(peer) {
            Some(p) if !p.valid && p.signaling_ref().map_or(false, |d| d.is_registered()) => {
                p.valid = true;
                true
            }
            _ => false,
        };
        if !became_valid {
            return;
        }

        if let Some(p) = core.peer(peer) {
            log::info!("Peer '{}' registered ({})", p.name, p.socket_addr());
            handler.on_peer_registered(peer, p);
        }
        self.notify_roster(core);
    }

    /// Drop a peer that said goodbye (or whose goodbye we sent)
    fn drop_peer(
        &mut self,
        core: &mut SessionCore,
        peer: PeerId,
        handler: &mut dyn SessionHandler,
    ) {
        if let Some(p) = core.remove_peer(peer) {
            handler.on_peer_disconnected(peer, &p);
            if p.valid {
                self.notify_roster(core);
            }
        }
    }

    /// The registered peer behind `link`, if any
    fn registered_peer(core: &mut SessionCore, link: LinkId) -> Option<PeerId> {
        let peer = core.link_peer(link)?;
        let registered = core
            .peer_mut(peer)
            .map_or(false, |p| p.signaling().inbound == InboundRegistration::RegisteredByPeer);
        registered.then_some(peer)
    }

    // ------------------------------------------------------------------------
    // Requests
    // ------------------------------------------------------------------------

    fn on_register(
        &mut self,
        core: &mut SessionCore,
        link: LinkId,
        packet: &Packet,
        handler: &mut dyn SessionHandler,
    ) {
        let from = match message::from_addr(packet) {
            Ok(from) => from,
            Err(e) => {
                self.refuse(core, link, SignalingKind::BadRequest, packet, &e.to_string());
                core.fault(format!("REGISTER with bad From: {}", e), handler);
                return;
            }
        };

        let name = addr_name(&from).to_string();
        if name.is_empty() {
            self.refuse(core, link, SignalingKind::BadRequest, packet, "empty name");
            core.fault("REGISTER without a name", handler);
            return;
        }

        let remote_ip = core.link_addr(link).map(|a| a.ip());
        let address = match (from.host.parse::<IpAddr>(), remote_ip) {
            (Ok(ip), _) if !ip.is_unspecified() => ip,
            (_, Some(ip)) => ip,
            (Ok(ip), None) => ip,
            (Err(_), None) => return,
        };

        let link_peer = core.link_peer(link);
        let peer = match core.peer_by_name(&name) {
            Some(existing) if Some(existing) == link_peer => existing,
            Some(existing) => {
                let (known_tag, live) = match core.peer(existing) {
                    Some(p) => (
                        p.signaling_ref().and_then(|d| d.remote_tag.clone()),
                        p.links().filter(|&l| core.is_link_open(l)).collect::<Vec<_>>(),
                    ),
                    None => (None, Vec::new()),
                };

                match known_tag {
                    Some(known) if !live.is_empty() && Some(&known) != from.tag.as_ref() => {
                        self.refuse(
                            core,
                            link,
                            SignalingKind::Decline,
                            packet,
                            "name already registered",
                        );
                        // A placeholder from our own dial goes with the link
                        if let Some(provisional) = link_peer {
                            core.remove_peer(provisional);
                        }
                        core.fault(
                            format!("declined duplicate registration of '{}'", name),
                            handler,
                        );
                        return;
                    }
                    Some(_) => {
                        // Same instance reconnecting: the new transport wins
                        log::info!("Peer '{}' reconnected; superseding old transport", name);
                        for old in live.into_iter().filter(|&l| l != link) {
                            core.close_link(old);
                        }
                        // Both directions register again over the new transport
                        if let Some(p) = core.peer_mut(existing) {
                            p.valid = false;
                            p.signaling().restart();
                        }
                    }
                    None => {}
                }

                core.attach(link, existing, true);
                if let Some(provisional) = link_peer {
                    self.merge_provisional(core, provisional, existing);
                }
                existing
            }
            None => match link_peer {
                Some(provisional) => provisional,
                None => match core.add_peer(Peer::new(name.as_str(), address, from.port)) {
                    Some(peer) => {
                        core.attach(link, peer, true);
                        peer
                    }
                    None => {
                        self.refuse(core, link, SignalingKind::Decline, packet, "session full");
                        core.fault(format!("session full; declined '{}'", name), handler);
                        return;
                    }
                },
            },
        };

        let needs_register = match core.peer_mut(peer) {
            Some(p) => {
                p.name = name;
                p.address = address;
                p.port = from.port;
                let data = p.signaling();
                data.remote_tag = from.tag.clone();
                data.inbound = InboundRegistration::RegisteredByPeer;
                data.outbound == OutboundRegistration::Unregistered
            }
            None => return,
        };

        self.reply(core, link, SignalingKind::Ok, packet, |p| p);
        if needs_register {
            self.register_with(core, peer);
        }
        self.check_valid(core, peer, handler);
    }

    /// Fold a placeholder peer (created when we dialed) into the real one
    fn merge_provisional(&mut self, core: &mut SessionCore, provisional: PeerId, into: PeerId) {
        if provisional == into {
            return;
        }
        let Some(old) = core.remove_peer(provisional) else {
            return;
        };
        if let (Some(data), Some(p)) = (old.signaling_ref(), core.peer_mut(into)) {
            let target = p.signaling();
            target.pending.extend(data.pending.iter().cloned());
            if data.outbound != OutboundRegistration::Unregistered
                && target.outbound == OutboundRegistration::Unregistered
            {
                target.outbound = data.outbound;
            }
        }
    }

    fn on_subscribe(
        &mut self,
        core: &mut SessionCore,
        link: LinkId,
        peer: PeerId,
        packet: &Packet,
    ) {
        let event = message::event(packet).unwrap_or_default().to_string();
        if !Self::is_allowed(core, &event) {
            log::info!("Rejecting subscription to unknown event '{}'", event);
            self.reply_with_reason(core, link, SignalingKind::BadEvent, packet, "event not allowed");
            return;
        }

        let config = core.config();
        let requested = message::expires(packet).unwrap_or(config.subscription_ms);
        let granted = requested.min(config.max_subscription_ms);
        let now = core.now_ms();

        if let Some(p) = core.peer_mut(peer) {
            let subs = &mut p.signaling().their_subscriptions;
            if granted == 0 {
                subscription::remove(subs, &event);
            } else {
                subscription::replace(subs, EventSubscription::new(event.as_str(), granted, now));
            }
        }

        self.reply(core, link, SignalingKind::Ok, packet, |p| {
            p.with_field(EVENT_KEY, &event).with_field(EXPIRES_KEY, granted)
        });

        let valid = core.peer(peer).map_or(false, |p| p.valid);
        if event == PEER_DISCOVERY && granted > 0 && valid {
            self.send_roster(core, peer);
        }
    }

    fn on_notify(
        &mut self,
        core: &mut SessionCore,
        link: LinkId,
        peer: PeerId,
        packet: Packet,
        handler: &mut dyn SessionHandler,
    ) {
        self.reply(core, link, SignalingKind::Ok, &packet, |p| p);

        if message::event(&packet) != Some(PEER_DISCOVERY) {
            handler.on_packet_decoded(&packet, core.peer(peer));
            return;
        }

        let my_name = core.identity().name.clone();
        for line in packet.body() {
            let addr = match NameAddr::parse(line) {
                Ok(addr) => addr,
                Err(e) => {
                    log::debug!("Skipping roster line '{}': {}", line, e);
                    continue;
                }
            };
            let name = addr_name(&addr);
            if name.is_empty() || name == my_name || core.peer_by_name(name).is_some() {
                continue;
            }
            // The pair's first name in sort order dials
            if my_name.as_str() > name {
                continue;
            }
            let Ok(address) = addr.host.parse::<IpAddr>() else {
                log::debug!("Roster entry '{}' has no IP address", line);
                continue;
            };
            log::info!("Discovered peer '{}' at {}:{}", name, address, addr.port);
            self.dial(core, name, address, addr.port, handler);
        }
    }

    // ------------------------------------------------------------------------
    // Replies
    // ------------------------------------------------------------------------

    fn on_reply(
        &mut self,
        core: &mut SessionCore,
        link: LinkId,
        kind: SignalingKind,
        packet: &Packet,
        handler: &mut dyn SessionHandler,
    ) {
        let seq = message::cseq(packet).map(|c| c.seq);
        let peer = core.link_peer(link);
        let pending = match (peer, seq) {
            (Some(peer), Some(seq)) => core
                .peer_mut(peer)
                .and_then(|p| p.signaling().take_pending(seq)),
            _ => None,
        };

        let (Some(peer), Some(pending)) = (peer, pending) else {
            core.fault(
                format!("{} from '{}' matches no request", kind, packet.sender()),
                handler,
            );
            // Only OK is answered; a DECLINE is never answered
            if kind == SignalingKind::Ok {
                self.reply_with_reason(core, link, SignalingKind::Decline, packet, "no matching request");
            }
            return;
        };

        let reason = message::reason(packet).unwrap_or("no reason given");
        match (pending.kind, kind) {
            (SignalingKind::Register, SignalingKind::Ok) => {
                if let Some(p) = core.peer_mut(peer) {
                    p.signaling().outbound = OutboundRegistration::RegisteredWithPeer;
                }
                let mut events = vec![PEER_DISCOVERY.to_string()];
                events.extend(core.config().discovery_events.iter().cloned());
                for event in events {
                    self.subscribe(core, peer, &event);
                }
                self.check_valid(core, peer, handler);
            }
            (SignalingKind::Register, _) => {
                if let Some(p) = core.peer_mut(peer) {
                    p.signaling().outbound = OutboundRegistration::Unregistered;
                }
                core.fault(
                    format!("registration with '{}' refused: {}", packet.sender(), reason),
                    handler,
                );
            }
            (SignalingKind::Subscribe, SignalingKind::Ok) => {
                let event = pending.event.unwrap_or_default();
                let granted = message::expires(packet)
                    .or(pending.expires_ms)
                    .unwrap_or(core.config().subscription_ms);
                let now = core.now_ms();
                log::debug!("Subscribed to '{}' on '{}' for {} ms", event, packet.sender(), granted);
                if let Some(p) = core.peer_mut(peer) {
                    subscription::replace(
                        &mut p.signaling().our_subscriptions,
                        EventSubscription::new(event, granted, now),
                    );
                }
            }
            (SignalingKind::Subscribe, _) => {
                core.fault(
                    format!(
                        "subscription to '{}' refused by '{}': {}",
                        pending.event.unwrap_or_default(),
                        packet.sender(),
                        reason
                    ),
                    handler,
                );
            }
            (SignalingKind::Bye, SignalingKind::Ok) => {
                self.drop_peer(core, peer, handler);
            }
            (_, SignalingKind::Ok) => {
                log::trace!("{} {} acknowledged", pending.kind, pending.seq);
            }
            (request, _) => {
                core.fault(
                    format!("{} refused by '{}': {}", request, packet.sender(), reason),
                    handler,
                );
            }
        }
    }

    // ------------------------------------------------------------------------
    // Application requests
    // ------------------------------------------------------------------------

    /// Publish `event` to every peer subscribed to it; returns the count
    pub fn notify(&mut self, core: &mut SessionCore, event: &str, body: &[String]) -> usize {
        let now = core.now_ms();
        let subscribers: Vec<PeerId> = core
            .peers()
            .iter()
            .filter(|(_, p)| {
                p.valid
                    && p.signaling_ref().map_or(false, |d| {
                        subscription::is_subscribed(&d.their_subscriptions, event, now)
                    })
            })
            .map(|(id, _)| id)
            .collect();

        subscribers
            .into_iter()
            .filter(|&peer| {
                self.send_request(core, peer, SignalingKind::Notify, |p| {
                    p.with_field(EVENT_KEY, event).with_body(body.iter().cloned())
                })
            })
            .count()
    }

    /// Forget requests nobody answered; a lost REGISTER is a fault
    fn expire_requests(
        &mut self,
        core: &mut SessionCore,
        cutoff_ms: u64,
        handler: &mut dyn SessionHandler,
    ) {
        for peer in core.peers().ids() {
            let Some(p) = core.peer_mut(peer) else {
                continue;
            };
            let data = p.signaling();
            let expired = data.expire_pending(cutoff_ms);
            if expired.is_empty() {
                continue;
            }
            let register_lost = expired.iter().any(|r| r.kind == SignalingKind::Register);
            if register_lost && data.outbound == OutboundRegistration::RegisterSent {
                data.outbound = OutboundRegistration::Unregistered;
            }
            let name = p.name.clone();
            log::debug!("{} requests to '{}' went unanswered", expired.len(), name);
            if register_lost {
                core.fault(format!("'{}' never answered our REGISTER", name), handler);
            }
        }
    }

    fn send_to_valid(
        &mut self,
        core: &mut SessionCore,
        peer: PeerId,
        kind: SignalingKind,
        body: &[String],
    ) -> bool {
        if !core.peer(peer).map_or(false, |p| p.valid) {
            return false;
        }
        self.send_request(core, peer, kind, |p| p.with_body(body.iter().cloned()))
    }
}

impl Default for SignalingProtocol {
    fn default() -> Self {
        Self::new()
    }
}

impl Protocol for SignalingProtocol {
    fn framing(&self) -> Framing {
        SIGNALING_FRAMING
    }

    fn on_started(&mut self, core: &mut SessionCore) -> Result<(), SessionError> {
        if core.state() != SessionState::Connected {
            return Ok(());
        }

        // Discovered peers dial us on our advertised port
        let port = core.identity().port;
        if let Err(e) = core.listen(port) {
            log::warn!("Not accepting discovered peers: {}", e);
        }

        let Some(link) = core.host_link() else {
            return Ok(());
        };
        let Some(addr) = core.link_addr(link) else {
            return Ok(());
        };
        let host = core
            .add_peer(Peer::new("", addr.ip(), addr.port()))
            .ok_or(SessionError::InvalidState(SessionState::Connected))?;
        core.attach(link, host, true);
        self.register_with(core, host);
        Ok(())
    }

    fn on_stopping(&mut self, core: &mut SessionCore) {
        for peer in core.valid_peers() {
            self.send_request(core, peer, SignalingKind::Bye, |p| p);
        }
    }

    fn on_packet(
        &mut self,
        core: &mut SessionCore,
        link: LinkId,
        packet: Packet,
        handler: &mut dyn SessionHandler,
    ) {
        let Some(kind) = message::kind(&packet) else {
            // Not signaling: an application message riding the same framing
            let sender = core.link_peer(link).and_then(|id| core.peer(id));
            handler.on_packet_decoded(&packet, sender);
            return;
        };

        if !kind.is_request() {
            self.on_reply(core, link, kind, &packet, handler);
            return;
        }

        if message::cseq(&packet).is_none() {
            self.refuse(core, link, SignalingKind::BadRequest, &packet, "missing CSeq");
            core.fault(format!("{} from '{}' without CSeq", kind, packet.sender()), handler);
            return;
        }

        if kind == SignalingKind::Register {
            self.on_register(core, link, &packet, handler);
            return;
        }

        let Some(peer) = Self::registered_peer(core, link) else {
            self.refuse(core, link, SignalingKind::Decline, &packet, "not registered");
            return;
        };

        match kind {
            SignalingKind::Subscribe => self.on_subscribe(core, link, peer, &packet),
            SignalingKind::Notify => self.on_notify(core, link, peer, packet, handler),
            SignalingKind::Info | SignalingKind::Invite => {
                self.reply(core, link, SignalingKind::Ok, &packet, |p| p);
                handler.on_packet_decoded(&packet, core.peer(peer));
            }
            SignalingKind::Bye => {
                self.reply(core, link, SignalingKind::Ok, &packet, |p| p);
                self.drop_peer(core, peer, handler);
            }
            _ => {}
        }
    }

    fn on_tick(&mut self, core: &mut SessionCore, handler: &mut dyn SessionHandler) {
        let now = core.now_ms();
        let margin = core.config().subscription_refresh_ms;

        if let Some(cutoff) = now.checked_sub(core.config().request_timeout_ms) {
            self.expire_requests(core, cutoff, handler);
        }

        let mut refresh = Vec::new();
        for peer in core.valid_peers() {
            let Some(p) = core.peer_mut(peer) else {
                continue;
            };
            let data = p.signaling();
            let expired = subscription::prune(&mut data.their_subscriptions, now);
            if expired > 0 {
                log::debug!("{} subscriptions from '{}' expired", expired, p.name);
            }
            let data = p.signaling();
            for sub in &data.our_subscriptions {
                if sub.needs_refresh(now, margin) && !data.is_pending(SignalingKind::Subscribe, &sub.event) {
                    refresh.push((peer, sub.event.clone()));
                }
            }
        }

        for (peer, event) in refresh {
            log::debug!("Refreshing subscription to '{}'", event);
            self.subscribe(core, peer, &event);
        }
    }

    fn on_peer_disconnected(
        &mut self,
        core: &mut SessionCore,
        _id: PeerId,
        peer: &Peer,
        _handler: &mut dyn SessionHandler,
    ) {
        if peer.valid {
            self.notify_roster(core);
        }
    }
}

// ============================================================================
// Session API
// ============================================================================

pub type SignalingSession = Session<SignalingProtocol>;

impl Session<SignalingProtocol> {
    pub fn tag(&self) -> &str {
        self.protocol().tag()
    }

    /// Publish an application event to its subscribers
    pub fn notify(&mut self, event: &str, body: &[String]) -> usize {
        let (core, protocol) = self.parts_mut();
        protocol.notify(core, event, body)
    }

    pub fn info(&mut self, peer: PeerId, body: &[String]) -> bool {
        let (core, protocol) = self.parts_mut();
        protocol.send_to_valid(core, peer, SignalingKind::Info, body)
    }

    pub fn invite(&mut self, peer: PeerId, body: &[String]) -> bool {
        let (core, protocol) = self.parts_mut();
        protocol.send_to_valid(core, peer, SignalingKind::Invite, body)
    }

    /// Say goodbye; the peer is dropped when it acknowledges
    pub fn bye(&mut self, peer: PeerId) -> bool {
        let (core, protocol) = self.parts_mut();
        protocol.send_to_valid(core, peer, SignalingKind::Bye, &[])
    }

    /// Subscribe to `event` on a registered peer
    pub fn subscribe(&mut self, peer: PeerId, event: &str) -> bool {
        let (core, protocol) = self.parts_mut();
        core.peer(peer).map_or(false, |p| p.valid) && protocol.subscribe(core, peer, event)
    }
}
