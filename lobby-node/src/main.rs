//! Lobby Node
//!
//! Hosts or joins one session over real TCP/UDP sockets:
//! - `signaling`: mutual registration and peer discovery
//! - `game`: join/ready handshake with datagram viability probing
//!
//! Runs a fixed-rate loop until SIGINT/SIGTERM, then says goodbye to every
//! peer before exiting.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use session_core::{
    GameProtocol, GameSession, LocalIdentity, MioNetwork, NetConfig, NetContext, Packet, Peer,
    PeerId, Protocol, Session, SessionHandler, SessionState, SignalingProtocol, SignalingSession,
};

mod metrics;

use metrics::Metrics;

// ============================================================================
// Constants
// ============================================================================

/// Default signaling/game port
const DEFAULT_PORT: u16 = 5060;

/// Target frame time of the main loop (~60 Hz)
const FRAME_TIME: Duration = Duration::from_millis(16);

/// How often the metrics snapshot is logged
const METRICS_INTERVAL: Duration = Duration::from_secs(10);

// ============================================================================
// Main Entry Point
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Signaling,
    Game,
}

#[derive(Debug, Clone, Copy)]
enum Role {
    Host(u16),
    Join(SocketAddr),
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("info"),
    )
    .init();

    // Parse command line arguments
    let args: Vec<String> = std::env::args().collect();

    // --name <name>          Name we register under (required)
    // --host <port>          Host a session on <port>
    // --connect <addr:port>  Join the host at <addr:port>
    // --mode <mode>          signaling (default) or game
    // --config <path>        JSON NetConfig (optional)
    // --address <ip>         Address we advertise to peers (default 127.0.0.1)
    // --port <port>          Port we advertise and accept discovered peers on
    // --ready                Game mode: mark ourselves ready once joined

    let name = parse_arg(&args, "--name").ok_or("Missing --name <name>")?;
    let role = match (parse_arg(&args, "--host"), parse_arg(&args, "--connect")) {
        (Some(port), None) => Role::Host(port.parse().map_err(|_| "Invalid --host port")?),
        (None, Some(addr)) => Role::Join(addr.parse().map_err(|_| "Invalid --connect address")?),
        (None, None) => Role::Host(DEFAULT_PORT),
        (Some(_), Some(_)) => return Err("--host and --connect are mutually exclusive".into()),
    };
    let mode = match parse_arg(&args, "--mode").as_deref() {
        None | Some("signaling") => Mode::Signaling,
        Some("game") => Mode::Game,
        Some(other) => return Err(format!("Unknown mode '{}'", other).into()),
    };
    let address: IpAddr = match parse_arg(&args, "--address") {
        Some(ip) => ip.parse().map_err(|_| "Invalid --address")?,
        None => IpAddr::V4(Ipv4Addr::LOCALHOST),
    };
    let port: u16 = match (parse_arg(&args, "--port"), role) {
        (Some(port), _) => port.parse().map_err(|_| "Invalid --port")?,
        (None, Role::Host(port)) => port,
        (None, Role::Join(_)) => DEFAULT_PORT + 1,
    };
    let ready = args.iter().any(|a| a == "--ready");

    let config = match parse_arg(&args, "--config") {
        Some(path) => NetConfig::load(&path)?,
        None => NetConfig::default(),
    };

    log::info!("Lobby node starting...");
    log::info!("  Name:    {}", name);
    log::info!("  Mode:    {:?}", mode);
    log::info!("  Role:    {:?}", role);
    log::info!("  Address: {}:{}", address, port);
    log::info!("  Datagrams: {:?}", config.transport_mode);

    // Graceful shutdown on SIGINT/SIGTERM
    let shutdown = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&shutdown))?;
    signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&shutdown))?;

    let identity = LocalIdentity::new(name, address, port);
    let ctx = NetContext::new(MioNetwork::new()?, config, identity);

    match mode {
        Mode::Signaling => {
            let session = SignalingSession::new(ctx, SignalingProtocol::new());
            log::info!("  Tag:     {}", session.tag());
            run(session, role, &shutdown, |_| {})
        }
        Mode::Game => {
            let mut announced = false;
            run(GameSession::new(ctx, GameProtocol::new()), role, &shutdown, |session| {
                if ready && !session.protocol().is_ready() && session.peer_count() > 0 {
                    session.set_ready(true);
                }
                let all_ready = session.peer_count() > 0 && session.all_ready();
                if all_ready && !announced {
                    log::info!("Everyone is ready");
                }
                announced = all_ready;
            })
        }
    }
}

/// Parse a flag value from command line arguments
fn parse_arg(args: &[String], flag: &str) -> Option<String> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .cloned()
}

// ============================================================================
// Main Loop
// ============================================================================

fn run<P: Protocol>(
    mut session: Session<P>,
    role: Role,
    shutdown: &AtomicBool,
    mut on_frame: impl FnMut(&mut Session<P>),
) -> Result<(), Box<dyn std::error::Error>> {
    match role {
        Role::Host(port) => session.host(port)?,
        Role::Join(addr) => session.connect_to(addr)?,
    }

    let mut handler = NodeHandler {
        metrics: Metrics::new(),
    };
    let start = Instant::now();
    let mut last_metrics = Instant::now();

    while !shutdown.load(Ordering::Relaxed) {
        let frame_start = Instant::now();
        let now_ms = start.elapsed().as_millis() as u64;

        session.advance(now_ms, &mut handler);
        if session.state() == SessionState::Disconnected {
            log::warn!("Host went away; exiting");
            break;
        }
        on_frame(&mut session);

        if last_metrics.elapsed() >= METRICS_INTERVAL {
            log::debug!("Metrics:\n{}", handler.metrics.render(&session.stats()));
            last_metrics = Instant::now();
        }

        if let Some(rest) = FRAME_TIME.checked_sub(frame_start.elapsed()) {
            std::thread::sleep(rest);
        }
    }

    log::info!("Shutting down...");
    session.stop();
    log::info!("Final metrics:\n{}", handler.metrics.render(&session.stats()));
    Ok(())
}

// ============================================================================
// Callbacks
// ============================================================================

struct NodeHandler {
    metrics: Metrics,
}

impl SessionHandler for NodeHandler {
    fn on_packet_decoded(&mut self, packet: &Packet, sender: Option<&Peer>) {
        self.metrics.packets_decoded_total.fetch_add(1, Ordering::Relaxed);
        let from = sender.map_or(packet.sender(), |p| p.name.as_str());
        log::info!("{} from '{}': {:?}", packet.kind_name(), from, packet.body());
    }

    fn on_peer_registered(&mut self, _id: PeerId, peer: &Peer) {
        self.metrics.peers_registered_total.fetch_add(1, Ordering::Relaxed);
        log::info!("Peer '{}' joined from {}", peer.name, peer.socket_addr());
    }

    fn on_peer_disconnected(&mut self, _id: PeerId, peer: &Peer) {
        self.metrics.peers_disconnected_total.fetch_add(1, Ordering::Relaxed);
        log::info!("Peer '{}' left", peer.name);
    }

    fn on_host_disconnected(&mut self) {
        log::warn!("Lost connection to host");
    }

    fn on_fault(&mut self, reason: &str) {
        self.metrics.faults_total.fetch_add(1, Ordering::Relaxed);
        log::warn!("Session fault: {}", reason);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_arg() {
        let argv = args(&["lobby-node", "--name", "alice", "--host", "6000"]);
        assert_eq!(parse_arg(&argv, "--name").as_deref(), Some("alice"));
        assert_eq!(parse_arg(&argv, "--host").as_deref(), Some("6000"));
        assert_eq!(parse_arg(&argv, "--connect"), None);
    }

    #[test]
    fn test_parse_arg_missing_value() {
        let argv = args(&["lobby-node", "--name"]);
        assert_eq!(parse_arg(&argv, "--name"), None);
    }
}
