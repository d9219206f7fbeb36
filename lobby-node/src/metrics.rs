//! Lightweight Prometheus-compatible metrics for the lobby node.
//!
//! Event counters are bumped from session callbacks; transport gauges come
//! from a `SessionStats` snapshot at render time.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use session_core::SessionStats;

pub struct Metrics {
    /// Application packets handed to the node (counter)
    pub packets_decoded_total: AtomicU64,
    /// Peers that completed their handshake (counter)
    pub peers_registered_total: AtomicU64,
    /// Peers that left or lost their transport (counter)
    pub peers_disconnected_total: AtomicU64,
    /// Faults reported by the session (counter)
    pub faults_total: AtomicU64,
    /// Node start time (for uptime calculation)
    pub start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            packets_decoded_total: AtomicU64::new(0),
            peers_registered_total: AtomicU64::new(0),
            peers_disconnected_total: AtomicU64::new(0),
            faults_total: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    /// Render metrics in Prometheus text exposition format.
    pub fn render(&self, stats: &SessionStats) -> String {
        let uptime = self.start_time.elapsed().as_secs();
        format!(
            "# HELP lobby_packets_decoded_total Application packets delivered\n\
             # TYPE lobby_packets_decoded_total counter\n\
             lobby_packets_decoded_total {}\n\
             # HELP lobby_peers_registered_total Peers that completed their handshake\n\
             # TYPE lobby_peers_registered_total counter\n\
             lobby_peers_registered_total {}\n\
             # HELP lobby_peers_disconnected_total Peers that left or were lost\n\
             # TYPE lobby_peers_disconnected_total counter\n\
             lobby_peers_disconnected_total {}\n\
             # HELP lobby_faults_total Faults reported by the session\n\
             # TYPE lobby_faults_total counter\n\
             lobby_faults_total {}\n\
             # HELP lobby_peers Peers currently known\n\
             # TYPE lobby_peers gauge\n\
             lobby_peers {}\n\
             # HELP lobby_valid_peers Peers currently valid\n\
             # TYPE lobby_valid_peers gauge\n\
             lobby_valid_peers {}\n\
             # HELP lobby_stream_bytes_sent_total Bytes written to reliable transports\n\
             # TYPE lobby_stream_bytes_sent_total counter\n\
             lobby_stream_bytes_sent_total {}\n\
             # HELP lobby_stream_bytes_received_total Bytes read from reliable transports\n\
             # TYPE lobby_stream_bytes_received_total counter\n\
             lobby_stream_bytes_received_total {}\n\
             # HELP lobby_datagram_bytes_sent_total Bytes sent as datagrams\n\
             # TYPE lobby_datagram_bytes_sent_total counter\n\
             lobby_datagram_bytes_sent_total {}\n\
             # HELP lobby_datagram_bytes_received_total Bytes received as datagrams\n\
             # TYPE lobby_datagram_bytes_received_total counter\n\
             lobby_datagram_bytes_received_total {}\n\
             # HELP lobby_uptime_seconds Node uptime in seconds\n\
             # TYPE lobby_uptime_seconds gauge\n\
             lobby_uptime_seconds {}\n",
            self.packets_decoded_total.load(Ordering::Relaxed),
            self.peers_registered_total.load(Ordering::Relaxed),
            self.peers_disconnected_total.load(Ordering::Relaxed),
            self.faults_total.load(Ordering::Relaxed),
            stats.peers,
            stats.valid_peers,
            stats.bytes_sent,
            stats.bytes_received,
            stats.datagram_bytes_sent,
            stats.datagram_bytes_received,
            uptime,
        )
    }
}
