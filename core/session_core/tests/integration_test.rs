//! Integration tests for signaling and game sessions
//!
//! Every session runs on its own host of a shared in-memory network, so the
//! whole exchange is deterministic and needs no sockets.

use std::net::{IpAddr, SocketAddr};

use session_core::transport::{Network, StreamListener, StreamTransport};
use session_core::{
    Channel, GameProtocol, GameSession, LocalIdentity, MemoryNetwork, NetConfig, NetContext,
    Packet, Peer, PeerId, Protocol, Session, SessionHandler, SessionState, SignalingProtocol,
    SignalingSession, TransportMode, ViabilityState, SIGNALING_FRAMING,
};

const SIGNALING_PORT: u16 = 5000;
const GAME_PORT: u16 = 6000;
const FRAME_MS: u64 = 16;

// ============================================================================
// Harness
// ============================================================================

/// Everything a session reported through its callbacks
#[derive(Default)]
struct Recorder {
    registered: Vec<String>,
    disconnected: Vec<String>,
    decoded: Vec<(String, Option<String>)>,
    faults: Vec<String>,
    host_disconnected: bool,
}

impl SessionHandler for Recorder {
    fn on_packet_decoded(&mut self, packet: &Packet, sender: Option<&Peer>) {
        self.decoded
            .push((packet.kind_name().to_string(), sender.map(|p| p.name.clone())));
    }

    fn on_peer_registered(&mut self, _id: PeerId, peer: &Peer) {
        self.registered.push(peer.name.clone());
    }

    fn on_peer_disconnected(&mut self, _id: PeerId, peer: &Peer) {
        self.disconnected.push(peer.name.clone());
    }

    fn on_host_disconnected(&mut self) {
        self.host_disconnected = true;
    }

    fn on_fault(&mut self, reason: &str) {
        self.faults.push(reason.to_string());
    }
}

struct Node<P: Protocol> {
    session: Session<P>,
    events: Recorder,
    ip: IpAddr,
}

impl<P: Protocol> Node<P> {
    fn advance(&mut self, now_ms: u64) {
        self.session.advance(now_ms, &mut self.events);
    }

    fn valid_peer(&self, name: &str) -> Option<PeerId> {
        self.session
            .peer_by_name(name)
            .filter(|&id| self.session.peer(id).map_or(false, |p| p.valid))
    }
}

trait Tick {
    fn tick(&mut self, now_ms: u64);
}

impl<P: Protocol> Tick for Node<P> {
    fn tick(&mut self, now_ms: u64) {
        self.advance(now_ms);
    }
}

/// Advance every node `rounds` times, starting after `*clock`
fn pump(clock: &mut u64, rounds: usize, nodes: &mut [&mut dyn Tick]) {
    for _ in 0..rounds {
        *clock += FRAME_MS;
        for node in nodes.iter_mut() {
            node.tick(*clock);
        }
    }
}

fn signaling_node(net: MemoryNetwork, name: &str, tag: &str) -> Node<SignalingProtocol> {
    signaling_node_with(net, name, tag, NetConfig::default())
}

fn signaling_node_with(
    net: MemoryNetwork,
    name: &str,
    tag: &str,
    config: NetConfig,
) -> Node<SignalingProtocol> {
    let ip = net.local_ip();
    let identity = LocalIdentity::new(name, ip, SIGNALING_PORT);
    let ctx = NetContext::new(net, config, identity);
    Node {
        session: SignalingSession::new(ctx, SignalingProtocol::with_tag(tag)),
        events: Recorder::default(),
        ip,
    }
}

fn game_node(net: MemoryNetwork, name: &str, config: NetConfig) -> Node<GameProtocol> {
    let ip = net.local_ip();
    let identity = LocalIdentity::new(name, ip, GAME_PORT);
    let ctx = NetContext::new(net, config, identity);
    Node {
        session: GameSession::new(ctx, GameProtocol::new()),
        events: Recorder::default(),
        ip,
    }
}

fn signaling_addr(node: &Node<SignalingProtocol>) -> SocketAddr {
    SocketAddr::new(node.ip, SIGNALING_PORT)
}

fn game_addr(node: &Node<GameProtocol>) -> SocketAddr {
    SocketAddr::new(node.ip, GAME_PORT)
}

/// A signaling endpoint driven by hand, one frame at a time
struct RawPeer {
    stream: Box<dyn StreamTransport>,
    inbox: Vec<u8>,
    ip: IpAddr,
}

impl RawPeer {
    fn connect(mut net: MemoryNetwork, to: SocketAddr) -> Self {
        let ip = net.local_ip();
        RawPeer {
            stream: net.connect(to).unwrap(),
            inbox: Vec::new(),
            ip,
        }
    }

    fn from_field(&self, name: &str) -> String {
        format!("<{}@{}:{}>;tag=dddd0001", name, self.ip, SIGNALING_PORT)
    }

    fn request(&self, kind: u16, kind_name: &str, cseq: Option<&str>) -> Packet {
        let packet = Packet::new(SIGNALING_FRAMING, kind, kind_name, "dave", 0)
            .with_field("From", self.from_field("dave"));
        match cseq {
            Some(cseq) => packet.with_field("CSeq", cseq),
            None => packet,
        }
    }

    fn send(&mut self, mut packet: Packet) {
        let bytes = packet.encoded().to_vec();
        assert_eq!(self.stream.write(&bytes), bytes.len());
    }

    /// Every complete packet received since the last call
    fn recv(&mut self) -> Vec<Packet> {
        let mut buf = [0u8; 4096];
        loop {
            let n = self.stream.read(&mut buf);
            if n == 0 {
                break;
            }
            self.inbox.extend_from_slice(&buf[..n]);
        }
        let (packets, decoded) = Packet::decode_all(SIGNALING_FRAMING, &self.inbox, 500);
        self.inbox.drain(..decoded.consumed);
        packets.into_iter().filter_map(Result::ok).collect()
    }
}

// ============================================================================
// Signaling
// ============================================================================

#[test]
fn test_mutual_registration() {
    let net = MemoryNetwork::new();
    let mut alice = signaling_node(net.host(), "alice", "aaaa0001");
    let mut bob = signaling_node(net.host(), "bob", "bbbb0001");
    let mut clock = 0;

    alice.session.host(SIGNALING_PORT).unwrap();
    bob.session.connect_to(signaling_addr(&alice)).unwrap();
    pump(&mut clock, 10, &mut [&mut alice, &mut bob]);

    assert!(alice.valid_peer("bob").is_some());
    assert!(bob.valid_peer("alice").is_some());
    assert_eq!(alice.events.registered, vec!["bob".to_string()]);
    assert_eq!(bob.events.registered, vec!["alice".to_string()]);
    assert_eq!(alice.session.peer_count(), 1);
    assert_eq!(bob.session.peer_count(), 1);
    assert!(alice.events.faults.is_empty(), "{:?}", alice.events.faults);
    assert!(bob.events.faults.is_empty(), "{:?}", bob.events.faults);

    // Bob's record on alice carries the identity he registered with
    let peer = alice.valid_peer("bob").and_then(|id| alice.session.peer(id)).unwrap();
    assert_eq!(peer.address, bob.ip);
    assert_eq!(peer.port, SIGNALING_PORT);
}

#[test]
fn test_duplicate_name_declined() {
    let net = MemoryNetwork::new();
    let mut alice = signaling_node(net.host(), "alice", "aaaa0001");
    let mut bob = signaling_node(net.host(), "bob", "bbbb0001");
    let mut imposter = signaling_node(net.host(), "bob", "bbbb0002");
    let mut clock = 0;

    alice.session.host(SIGNALING_PORT).unwrap();
    bob.session.connect_to(signaling_addr(&alice)).unwrap();
    pump(&mut clock, 10, &mut [&mut alice, &mut bob]);
    assert!(alice.valid_peer("bob").is_some());

    imposter.session.connect_to(signaling_addr(&alice)).unwrap();
    pump(&mut clock, 10, &mut [&mut alice, &mut bob, &mut imposter]);

    // Still exactly one "bob", and it is the original
    assert_eq!(alice.session.peer_count(), 1);
    let peer = alice.valid_peer("bob").and_then(|id| alice.session.peer(id)).unwrap();
    assert_eq!(peer.address, bob.ip);

    assert!(imposter.valid_peer("alice").is_none());
    assert!(imposter.events.faults.iter().any(|f| f.contains("refused")));
    assert!(alice.events.faults.iter().any(|f| f.contains("duplicate")));

    // The refused transport is closed on both ends
    assert_eq!(alice.session.stats().links, 1);
    assert_eq!(imposter.session.state(), SessionState::Disconnected);
}

#[test]
fn test_same_tag_reconnect_registers_again() {
    let net = MemoryNetwork::new();
    let mut alice = signaling_node(net.host(), "alice", "aaaa0001");
    let mut bob = signaling_node(net.host(), "bob", "bbbb0001");
    let mut bob_again = signaling_node(net.host(), "bob", "bbbb0001");
    let mut clock = 0;

    alice.session.host(SIGNALING_PORT).unwrap();
    bob.session.connect_to(signaling_addr(&alice)).unwrap();
    pump(&mut clock, 10, &mut [&mut alice, &mut bob]);
    assert!(alice.valid_peer("bob").is_some());

    bob_again.session.connect_to(signaling_addr(&alice)).unwrap();
    pump(&mut clock, 20, &mut [&mut alice, &mut bob, &mut bob_again]);

    assert!(bob_again.valid_peer("alice").is_some());
    assert_eq!(alice.session.peer_count(), 1);
    let peer = alice.valid_peer("bob").and_then(|id| alice.session.peer(id)).unwrap();
    assert_eq!(peer.address, bob_again.ip);
    assert_eq!(
        alice.events.registered,
        vec!["bob".to_string(), "bob".to_string()]
    );
    assert!(alice.events.disconnected.is_empty());

    // The old transport was superseded, not kept alongside
    assert_eq!(alice.session.stats().links, 1);
    assert_eq!(bob.session.state(), SessionState::Disconnected);
}

#[test]
fn test_signaling_session_full() {
    let net = MemoryNetwork::new();
    let config = NetConfig {
        max_peers: 1,
        ..NetConfig::default()
    };
    let mut alice = signaling_node_with(net.host(), "alice", "aaaa0001", config);
    let mut bob = signaling_node(net.host(), "bob", "bbbb0001");
    let mut carol = signaling_node(net.host(), "carol", "cccc0001");
    let mut clock = 0;

    alice.session.host(SIGNALING_PORT).unwrap();
    bob.session.connect_to(signaling_addr(&alice)).unwrap();
    carol.session.connect_to(signaling_addr(&alice)).unwrap();
    pump(&mut clock, 10, &mut [&mut alice, &mut bob, &mut carol]);

    assert_eq!(alice.session.peer_count(), 1);
    assert!(alice.valid_peer("bob").is_some());
    assert!(alice
        .events
        .faults
        .iter()
        .any(|f| f.contains("session full") && f.contains("carol")));
    assert!(carol.events.faults.iter().any(|f| f.contains("session full")));
    assert_eq!(carol.session.state(), SessionState::Disconnected);
    assert_eq!(alice.session.stats().links, 1);
}

#[test]
fn test_request_without_cseq_is_bad_request() {
    let net = MemoryNetwork::new();
    let mut alice = signaling_node(net.host(), "alice", "aaaa0001");
    alice.session.host(SIGNALING_PORT).unwrap();

    let mut raw = RawPeer::connect(net.host(), signaling_addr(&alice));
    let register = raw.request(1, "REGISTER", None);
    raw.send(register);
    alice.advance(16);
    alice.advance(32);

    let replies = raw.recv();
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].kind_name(), "BAD-REQUEST");
    assert_eq!(replies[0].field("Reason"), Some("missing CSeq"));
    assert!(alice.events.faults.iter().any(|f| f.contains("without CSeq")));

    // Nothing was registered and the transport is dropped
    assert_eq!(alice.session.peer_count(), 0);
    assert_eq!(alice.session.stats().links, 0);
}

#[test]
fn test_register_with_bad_from_is_bad_request() {
    let net = MemoryNetwork::new();
    let mut alice = signaling_node(net.host(), "alice", "aaaa0001");
    alice.session.host(SIGNALING_PORT).unwrap();

    let mut raw = RawPeer::connect(net.host(), signaling_addr(&alice));
    let mut register = raw.request(1, "REGISTER", Some("1 REGISTER"));
    register.set_field("From", "dave at nowhere");
    raw.send(register);
    alice.advance(16);
    alice.advance(32);

    let replies = raw.recv();
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].kind_name(), "BAD-REQUEST");
    assert_eq!(replies[0].field("CSeq"), Some("1 REGISTER"));
    assert!(alice.events.faults.iter().any(|f| f.contains("bad From")));
    assert_eq!(alice.session.peer_count(), 0);
}

#[test]
fn test_unmatched_ok_is_declined_once() {
    let net = MemoryNetwork::new();
    let mut alice = signaling_node(net.host(), "alice", "aaaa0001");
    alice.session.host(SIGNALING_PORT).unwrap();

    let mut raw = RawPeer::connect(net.host(), signaling_addr(&alice));
    let ok = raw.request(2, "OK", Some("77 REGISTER"));
    raw.send(ok);
    alice.advance(16);

    let replies = raw.recv();
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].kind_name(), "DECLINE");
    assert_eq!(replies[0].field("CSeq"), Some("77 REGISTER"));
    assert!(alice.events.faults.iter().any(|f| f.contains("matches no request")));

    // A DECLINE that matches nothing is never answered
    let decline = raw.request(3, "DECLINE", Some("78 REGISTER"));
    raw.send(decline);
    alice.advance(32);
    alice.advance(48);
    assert!(raw.recv().is_empty());
}

#[test]
fn test_oversized_partial_message_discarded() {
    let net = MemoryNetwork::new();
    let config = NetConfig {
        max_pending_bytes: 1024,
        ..NetConfig::default()
    };
    let mut alice = signaling_node_with(net.host(), "alice", "aaaa0001", config);
    alice.session.host(SIGNALING_PORT).unwrap();

    let mut raw = RawPeer::connect(net.host(), signaling_addr(&alice));
    let mut partial = b"NETSIP 2.0\n1 REGISTER\nSender: dave\nTime: 0\nNote: ".to_vec();
    partial.extend(std::iter::repeat(b'x').take(4096));
    assert_eq!(raw.stream.write(&partial), partial.len());
    alice.advance(16);

    assert!(alice
        .events
        .faults
        .iter()
        .any(|f| f.contains("exceeds 1024 bytes")));

    // The stream resynchronises on the next complete message
    let register = raw.request(1, "REGISTER", Some("1 REGISTER"));
    raw.send(register);
    alice.advance(32);
    alice.advance(48);
    assert!(raw.recv().iter().any(|p| p.kind_name() == "OK"));
    assert!(alice.session.peer_by_name("dave").is_some());
}

#[test]
fn test_silent_transport_closed_after_handshake_timeout() {
    let net = MemoryNetwork::new();
    let mut alice = signaling_node(net.host(), "alice", "aaaa0001");
    alice.session.host(SIGNALING_PORT).unwrap();

    let mut raw = RawPeer::connect(net.host(), signaling_addr(&alice));
    alice.advance(16);
    assert_eq!(alice.session.stats().links, 1);

    let timeout = NetConfig::default().handshake_timeout_ms;
    alice.advance(timeout);
    assert_eq!(alice.session.stats().links, 1);

    alice.advance(16 + timeout);
    assert_eq!(alice.session.stats().links, 0);
    assert!(raw.recv().is_empty());
    assert!(raw.stream.is_deleted());
}

#[test]
fn test_unanswered_register_expires() {
    let net = MemoryNetwork::new();
    let mut bob = signaling_node(net.host(), "bob", "bbbb0001");
    let mut mute = net.host();
    let mut listener = mute.listen(SIGNALING_PORT).unwrap();
    let to = SocketAddr::new(mute.local_ip(), SIGNALING_PORT);

    bob.session.connect_to(to).unwrap();
    bob.advance(16);
    let _silent = listener.accept().unwrap();

    bob.advance(20_000);
    assert!(bob.events.faults.is_empty());

    bob.advance(40_000);
    bob.advance(40_016);
    let lost: Vec<_> = bob
        .events
        .faults
        .iter()
        .filter(|f| f.contains("never answered our REGISTER"))
        .collect();
    assert_eq!(lost.len(), 1);
    assert_eq!(bob.session.state(), SessionState::Connected);
}

#[test]
fn test_roster_notify_after_disconnect() {
    let net = MemoryNetwork::new();
    let mut alice = signaling_node(net.host(), "alice", "aaaa0001");
    let mut bob = signaling_node(net.host(), "bob", "bbbb0001");
    let mut clock = 0;

    alice.session.host(SIGNALING_PORT).unwrap();
    bob.session.connect_to(signaling_addr(&alice)).unwrap();
    pump(&mut clock, 10, &mut [&mut alice, &mut bob]);

    // dave registers by hand and subscribes to discovery
    let mut raw = RawPeer::connect(net.host(), signaling_addr(&alice));
    let register = raw.request(1, "REGISTER", Some("1 REGISTER"));
    raw.send(register);
    pump(&mut clock, 2, &mut [&mut alice, &mut bob]);

    let their_register = raw
        .recv()
        .into_iter()
        .find(|p| p.kind_name() == "REGISTER")
        .unwrap();
    let ok = raw.request(2, "OK", their_register.field("CSeq"));
    raw.send(ok);
    let subscribe = raw
        .request(4, "SUBSCRIBE", Some("2 SUBSCRIBE"))
        .with_field("Event", "peer-discovery")
        .with_field("Expires", 60_000);
    raw.send(subscribe);
    pump(&mut clock, 3, &mut [&mut alice, &mut bob]);

    assert!(alice.valid_peer("dave").is_some());
    let rosters: Vec<Packet> = raw
        .recv()
        .into_iter()
        .filter(|p| p.kind_name() == "NOTIFY")
        .collect();
    let roster = rosters.last().unwrap();
    assert!(roster.body().iter().any(|line| line.contains("bob@")));

    bob.session.stop();
    pump(&mut clock, 3, &mut [&mut alice, &mut bob]);

    assert_eq!(alice.events.disconnected, vec!["bob".to_string()]);
    let rosters: Vec<Packet> = raw
        .recv()
        .into_iter()
        .filter(|p| p.kind_name() == "NOTIFY")
        .collect();
    let roster = rosters.last().unwrap();
    assert!(roster.body().iter().all(|line| !line.contains("bob@")));
}

#[test]
fn test_subscription_refreshed_before_expiry() {
    let net = MemoryNetwork::new();
    let config = NetConfig {
        subscription_ms: 1_000,
        subscription_refresh_ms: 300,
        ..NetConfig::default()
    };
    let mut alice = signaling_node(net.host(), "alice", "aaaa0001");
    let mut bob = signaling_node_with(net.host(), "bob", "bbbb0001", config);
    let mut clock = 0;

    alice.session.host(SIGNALING_PORT).unwrap();
    bob.session.connect_to(signaling_addr(&alice)).unwrap();
    pump(&mut clock, 10, &mut [&mut alice, &mut bob]);

    // Well past the first subscription's lifetime
    pump(&mut clock, 200, &mut [&mut alice, &mut bob]);
    assert!(clock > 3_000);

    let bob_id = alice.valid_peer("bob").unwrap();
    let data = alice.session.peer(bob_id).and_then(|p| p.signaling_ref()).unwrap();
    let sub = data
        .their_subscriptions
        .iter()
        .find(|s| s.event == "peer-discovery")
        .unwrap();
    assert!(sub.is_active(clock));
    assert!(sub.start_ms > 1_000);
    assert_eq!(sub.duration_ms, 1_000);
}

#[test]
fn test_discovery_connects_third_peer() {
    let net = MemoryNetwork::new();
    let mut alice = signaling_node(net.host(), "alice", "aaaa0001");
    let mut bob = signaling_node(net.host(), "bob", "bbbb0001");
    let mut carol = signaling_node(net.host(), "carol", "cccc0001");
    let mut clock = 0;

    alice.session.host(SIGNALING_PORT).unwrap();
    bob.session.connect_to(signaling_addr(&alice)).unwrap();
    carol.session.connect_to(signaling_addr(&alice)).unwrap();
    pump(&mut clock, 30, &mut [&mut alice, &mut bob, &mut carol]);

    assert_eq!(alice.session.peer_count(), 2);
    assert!(bob.valid_peer("carol").is_some());
    assert!(carol.valid_peer("bob").is_some());

    // One transport per pair: bob dialed, carol did not
    assert_eq!(bob.session.peer_count(), 2);
    assert_eq!(carol.session.peer_count(), 2);
    assert_eq!(
        carol.events.registered.iter().filter(|n| *n == "bob").count(),
        1
    );
}

#[test]
fn test_notify_reaches_subscriber() {
    let net = MemoryNetwork::new();
    let mut alice = signaling_node(net.host(), "alice", "aaaa0001");
    let mut bob = signaling_node(net.host(), "bob", "bbbb0001");
    let mut clock = 0;

    alice.session.host(SIGNALING_PORT).unwrap();
    bob.session.connect_to(signaling_addr(&alice)).unwrap();
    pump(&mut clock, 10, &mut [&mut alice, &mut bob]);

    let alice_id = bob.valid_peer("alice").unwrap();
    assert!(bob.session.subscribe(alice_id, "peer-discovery"));
    pump(&mut clock, 5, &mut [&mut alice, &mut bob]);

    // Only subscribers of an event hear about it
    assert_eq!(alice.session.notify("chat", &["hello".to_string()]), 0);

    let bob_id = alice.valid_peer("bob").unwrap();
    assert!(alice.session.info(bob_id, &["ping".to_string()]));
    pump(&mut clock, 5, &mut [&mut alice, &mut bob]);

    assert!(bob
        .events
        .decoded
        .iter()
        .any(|(kind, sender)| kind == "INFO" && sender.as_deref() == Some("alice")));
}

#[test]
fn test_unknown_event_subscription_rejected() {
    let net = MemoryNetwork::new();
    let mut alice = signaling_node(net.host(), "alice", "aaaa0001");
    let mut bob = signaling_node(net.host(), "bob", "bbbb0001");
    let mut clock = 0;

    alice.session.host(SIGNALING_PORT).unwrap();
    bob.session.connect_to(signaling_addr(&alice)).unwrap();
    pump(&mut clock, 10, &mut [&mut alice, &mut bob]);

    let alice_id = bob.valid_peer("alice").unwrap();
    assert!(bob.session.subscribe(alice_id, "scores"));
    pump(&mut clock, 5, &mut [&mut alice, &mut bob]);

    assert!(bob
        .events
        .faults
        .iter()
        .any(|f| f.contains("scores") && f.contains("refused")));
}

#[test]
fn test_stop_is_idempotent_and_reported_to_client() {
    let net = MemoryNetwork::new();
    let mut alice = signaling_node(net.host(), "alice", "aaaa0001");
    let mut bob = signaling_node(net.host(), "bob", "bbbb0001");
    let mut clock = 0;

    alice.session.host(SIGNALING_PORT).unwrap();
    bob.session.connect_to(signaling_addr(&alice)).unwrap();
    pump(&mut clock, 10, &mut [&mut alice, &mut bob]);

    alice.session.stop();
    alice.session.stop();
    assert_eq!(alice.session.state(), SessionState::Stopped);
    assert_eq!(alice.session.peer_count(), 0);

    pump(&mut clock, 3, &mut [&mut alice, &mut bob]);
    assert!(bob.events.disconnected.contains(&"alice".to_string()));
    assert!(bob.events.host_disconnected);
    assert_eq!(bob.session.state(), SessionState::Disconnected);

    bob.session.stop();
    bob.session.stop();
    assert_eq!(bob.session.state(), SessionState::Stopped);
}

#[test]
fn test_severed_host_reported() {
    let net = MemoryNetwork::new();
    let mut alice = signaling_node(net.host(), "alice", "aaaa0001");
    let mut bob = signaling_node(net.host(), "bob", "bbbb0001");
    let mut clock = 0;

    alice.session.host(SIGNALING_PORT).unwrap();
    bob.session.connect_to(signaling_addr(&alice)).unwrap();
    pump(&mut clock, 10, &mut [&mut alice, &mut bob]);

    net.sever(alice.ip, bob.ip);
    pump(&mut clock, 3, &mut [&mut alice, &mut bob]);

    assert!(bob.events.host_disconnected);
    assert_eq!(bob.session.state(), SessionState::Disconnected);
    assert!(alice.events.disconnected.contains(&"bob".to_string()));
    assert_eq!(alice.session.peer_count(), 0);
    assert!(bob.session.last_error().is_some());
}

#[test]
fn test_start_twice_is_rejected() {
    let net = MemoryNetwork::new();
    let mut alice = signaling_node(net.host(), "alice", "aaaa0001");

    alice.session.host(SIGNALING_PORT).unwrap();
    assert!(alice.session.host(SIGNALING_PORT + 1).is_err());
    assert_eq!(alice.session.state(), SessionState::Hosting);

    alice.session.stop();
    assert!(alice.session.host(SIGNALING_PORT).is_ok());
}

// ============================================================================
// Game
// ============================================================================

#[test]
fn test_game_join_ready_players() {
    let net = MemoryNetwork::new();
    let mut alice = game_node(net.host(), "alice", NetConfig::default());
    let mut bob = game_node(net.host(), "bob", NetConfig::default());
    let mut clock = 0;

    alice.session.host(GAME_PORT).unwrap();
    bob.session.connect_to(game_addr(&alice)).unwrap();
    pump(&mut clock, 5, &mut [&mut alice, &mut bob]);

    let bob_id = alice.valid_peer("bob").unwrap();
    assert!(bob.valid_peer("alice").is_some());
    assert_eq!(alice.events.registered, vec!["bob".to_string()]);

    bob.session.set_players(vec![3, 7]);
    bob.session.set_ready(true);
    pump(&mut clock, 3, &mut [&mut alice, &mut bob]);

    assert_eq!(alice.session.players_of(bob_id), Some(&[3, 7][..]));
    assert!(!alice.session.all_ready());

    alice.session.set_ready(true);
    pump(&mut clock, 3, &mut [&mut alice, &mut bob]);

    assert!(alice.session.all_ready());
    assert!(bob.session.all_ready());
}

#[test]
fn test_game_duplicate_join_declined() {
    let net = MemoryNetwork::new();
    let mut alice = game_node(net.host(), "alice", NetConfig::default());
    let mut bob = game_node(net.host(), "bob", NetConfig::default());
    let mut imposter = game_node(net.host(), "bob", NetConfig::default());
    let mut clock = 0;

    alice.session.host(GAME_PORT).unwrap();
    bob.session.connect_to(game_addr(&alice)).unwrap();
    pump(&mut clock, 5, &mut [&mut alice, &mut bob]);

    imposter.session.connect_to(game_addr(&alice)).unwrap();
    pump(&mut clock, 5, &mut [&mut alice, &mut bob, &mut imposter]);

    assert_eq!(alice.session.peer_count(), 1);
    assert!(imposter.valid_peer("alice").is_none());
    assert!(imposter.events.faults.iter().any(|f| f.contains("declined")));
    assert_eq!(alice.session.stats().links, 1);
    assert_eq!(imposter.session.state(), SessionState::Disconnected);
}

#[test]
fn test_game_session_full() {
    let net = MemoryNetwork::new();
    let config = NetConfig {
        max_peers: 1,
        ..NetConfig::default()
    };
    let mut alice = game_node(net.host(), "alice", config);
    let mut bob = game_node(net.host(), "bob", NetConfig::default());
    let mut carol = game_node(net.host(), "carol", NetConfig::default());
    let mut clock = 0;

    alice.session.host(GAME_PORT).unwrap();
    bob.session.connect_to(game_addr(&alice)).unwrap();
    carol.session.connect_to(game_addr(&alice)).unwrap();
    pump(&mut clock, 5, &mut [&mut alice, &mut bob, &mut carol]);

    assert_eq!(alice.session.peer_count(), 1);
    assert!(carol.events.faults.iter().any(|f| f.contains("session full")));
}

#[test]
fn test_leave_drops_peer() {
    let net = MemoryNetwork::new();
    let mut alice = game_node(net.host(), "alice", NetConfig::default());
    let mut bob = game_node(net.host(), "bob", NetConfig::default());
    let mut clock = 0;

    alice.session.host(GAME_PORT).unwrap();
    bob.session.connect_to(game_addr(&alice)).unwrap();
    pump(&mut clock, 5, &mut [&mut alice, &mut bob]);

    bob.session.stop();
    pump(&mut clock, 3, &mut [&mut alice, &mut bob]);

    assert_eq!(alice.events.disconnected, vec!["bob".to_string()]);
    assert_eq!(alice.session.peer_count(), 0);
}

#[test]
fn test_viability_converges_and_moves_traffic() {
    let net = MemoryNetwork::new();
    let mut alice = game_node(net.host(), "alice", NetConfig::default());
    let mut bob = game_node(net.host(), "bob", NetConfig::default());
    let mut clock = 0;

    alice.session.host(GAME_PORT).unwrap();
    bob.session.connect_to(game_addr(&alice)).unwrap();
    alice.session.mark_latency_sensitive(200);
    pump(&mut clock, 10, &mut [&mut alice, &mut bob]);

    let bob_id = alice.valid_peer("bob").unwrap();
    let alice_id = bob.valid_peer("alice").unwrap();
    assert!(alice.session.viability(bob_id).unwrap().is_working());
    assert!(bob.session.viability(alice_id).unwrap().is_working());

    // Latency-sensitive kinds use datagrams, everything else stays reliable
    assert_eq!(alice.session.channel_for(bob_id, 200), Channel::Unreliable);
    assert_eq!(alice.session.channel_for(bob_id, 201), Channel::Reliable);

    let before = alice.session.stats().datagram_bytes_sent;
    let packet = alice.session.packet(200, "STATE");
    alice.session.send(packet);
    pump(&mut clock, 2, &mut [&mut alice, &mut bob]);

    assert!(alice.session.stats().datagram_bytes_sent > before);
    assert!(bob
        .events
        .decoded
        .iter()
        .any(|(kind, sender)| kind == "STATE" && sender.as_deref() == Some("alice")));
}

#[test]
fn test_lost_datagram_endpoint_falls_back_to_reliable() {
    let net = MemoryNetwork::new();
    let mut alice = game_node(net.host(), "alice", NetConfig::default());
    let mut bob = game_node(net.host(), "bob", NetConfig::default());
    let mut clock = 0;

    alice.session.host(GAME_PORT).unwrap();
    bob.session.connect_to(game_addr(&alice)).unwrap();
    alice.session.mark_latency_sensitive(200);
    pump(&mut clock, 10, &mut [&mut alice, &mut bob]);

    let bob_id = alice.valid_peer("bob").unwrap();
    assert_eq!(alice.session.channel_for(bob_id, 200), Channel::Unreliable);

    // Queued for the datagram path just as the endpoint dies
    net.fail_datagram(game_addr(&alice));
    let packet = alice.session.packet(200, "STATE");
    alice.session.send(packet);
    pump(&mut clock, 4, &mut [&mut alice, &mut bob]);

    assert_eq!(alice.session.last_error(), Some("network unreachable"));
    assert!(!alice.session.viability(bob_id).unwrap().is_working());
    assert_eq!(alice.session.channel_for(bob_id, 200), Channel::Reliable);

    let packet = alice.session.packet(200, "STATE");
    alice.session.send(packet);
    pump(&mut clock, 2, &mut [&mut alice, &mut bob]);

    let delivered = bob
        .events
        .decoded
        .iter()
        .filter(|(kind, sender)| kind == "STATE" && sender.as_deref() == Some("alice"))
        .count();
    assert_eq!(delivered, 2);
}

#[test]
fn test_viability_blocked_path_never_converges() {
    let net = MemoryNetwork::new();
    let config = NetConfig {
        max_probe_attempts: 5,
        ..NetConfig::default()
    };
    let mut alice = game_node(net.host(), "alice", config.clone());
    let mut bob = game_node(net.host(), "bob", config);
    let mut clock = 0;

    net.block_datagrams(bob.ip, alice.ip);
    alice.session.host(GAME_PORT).unwrap();
    bob.session.connect_to(game_addr(&alice)).unwrap();
    alice.session.mark_latency_sensitive(200);
    pump(&mut clock, 30, &mut [&mut alice, &mut bob]);

    let bob_id = alice.valid_peer("bob").unwrap();
    let alice_id = bob.valid_peer("alice").unwrap();
    let at_alice = alice.session.viability(bob_id).unwrap();
    let at_bob = bob.session.viability(alice_id).unwrap();

    assert!(!at_alice.is_working());
    assert!(!at_bob.is_working());
    assert_eq!(at_alice.state(5), ViabilityState::Exhausted);
    assert_eq!(at_alice.test_packets_sent, 5);
    assert_eq!(alice.session.channel_for(bob_id, 200), Channel::Reliable);
}

#[test]
fn test_reliable_only_never_probes() {
    let net = MemoryNetwork::new();
    let config = NetConfig {
        transport_mode: TransportMode::ReliableOnly,
        ..NetConfig::default()
    };
    let mut alice = game_node(net.host(), "alice", config);
    let mut bob = game_node(net.host(), "bob", NetConfig::default());
    let mut clock = 0;

    alice.session.host(GAME_PORT).unwrap();
    bob.session.connect_to(game_addr(&alice)).unwrap();
    alice.session.mark_latency_sensitive(200);
    pump(&mut clock, 10, &mut [&mut alice, &mut bob]);

    let bob_id = alice.valid_peer("bob").unwrap();
    assert_eq!(alice.session.viability(bob_id).unwrap().test_packets_sent, 0);
    assert_eq!(alice.session.channel_for(bob_id, 200), Channel::Reliable);
}
