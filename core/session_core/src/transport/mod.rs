//! Transport abstraction
//!
//! Sessions never touch sockets directly. They talk to a [`Network`], which
//! hands out three kinds of endpoint:
//!
//! ```text
//! ┌──────────────────┬──────────────────────────────────────────────┐
//! │ StreamListener   │ accepts inbound reliable endpoints (host)    │
//! │ StreamTransport  │ ordered, connection-oriented (TCP)           │
//! │ DatagramTransport│ connectionless, addressed per send (UDP)     │
//! └──────────────────┴──────────────────────────────────────────────┘
//! ```
//!
//! Every I/O call is non-blocking: it does what it can right now and returns
//! 0 / `None` otherwise. A fatal error sets the endpoint's sticky delete flag;
//! the owning session reaps flagged endpoints on its next tick.
//!
//! Implementations:
//! - [`mio_net`] - real TCP/UDP sockets driven by a mio `Poll`
//! - [`memory`]  - in-process switchboard for deterministic tests

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use crate::error::TransportError;

pub mod memory;
pub mod mio_net;

pub use memory::MemoryNetwork;
pub use mio_net::MioNetwork;

// ============================================================================
// Endpoint Traits
// ============================================================================

/// Reliable, ordered byte stream
pub trait StreamTransport {
    /// Write as much of `buf` as the endpoint accepts right now
    ///
    /// Returns 0 when the endpoint is not writable.
    fn write(&mut self, buf: &[u8]) -> usize;

    /// Read whatever is pending into `buf`
    ///
    /// Returns 0 when nothing is pending. An orderly close by the remote
    /// sets the delete flag.
    fn read(&mut self, buf: &mut [u8]) -> usize;

    /// Sticky flag set on the first fatal error
    fn is_deleted(&self) -> bool;

    /// Reason for the most recent fault, if any
    fn last_error(&self) -> Option<&str>;

    fn peer_addr(&self) -> SocketAddr;

    fn stats(&self) -> &TransportStats;
}

/// Listening endpoint producing inbound `StreamTransport`s
pub trait StreamListener {
    /// Accept one pending connection, if any
    fn accept(&mut self) -> Option<Box<dyn StreamTransport>>;

    fn local_addr(&self) -> SocketAddr;
}

/// Best-effort datagram endpoint
pub trait DatagramTransport {
    /// Send one datagram; returns bytes sent, or 0 if not writable
    fn send_to(&mut self, buf: &[u8], to: SocketAddr) -> usize;

    /// Receive one pending datagram, if any
    fn recv_from(&mut self, buf: &mut [u8]) -> Option<(usize, SocketAddr)>;

    fn is_deleted(&self) -> bool;

    fn last_error(&self) -> Option<&str>;

    fn local_addr(&self) -> SocketAddr;

    fn stats(&self) -> &TransportStats;
}

/// Factory for endpoints plus the per-tick readiness probe
pub trait Network {
    /// Bind a listening endpoint on `port` (0 picks any free port)
    fn listen(&mut self, port: u16) -> Result<Box<dyn StreamListener>, TransportError>;

    /// Open a reliable endpoint to `addr`
    fn connect(&mut self, addr: SocketAddr) -> Result<Box<dyn StreamTransport>, TransportError>;

    /// Bind a datagram endpoint on `port` (0 picks any free port)
    fn bind_datagram(&mut self, port: u16)
        -> Result<Box<dyn DatagramTransport>, TransportError>;

    /// Wait up to `timeout` for readiness changes on every endpoint
    fn poll(&mut self, timeout: Duration) -> Result<(), TransportError>;
}

// ============================================================================
// Throughput Accounting
// ============================================================================

/// Sampling window for per-second rates
const RATE_WINDOW: Duration = Duration::from_secs(1);

/// Cumulative and per-second byte counts for one endpoint
///
/// Rates are derived when bytes are recorded, so an idle endpoint keeps
/// reporting the rate of its last active window.
#[derive(Debug, Clone, Default)]
pub struct TransportStats {
    bytes_sent: u64,
    bytes_received: u64,
    sent_per_second: u64,
    received_per_second: u64,
    window_start: Option<Instant>,
    window_sent: u64,
    window_received: u64,
}

impl TransportStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_sent(&mut self, bytes: usize) {
        self.record_sent_at(bytes, Instant::now());
    }

    pub fn record_received(&mut self, bytes: usize) {
        self.record_received_at(bytes, Instant::now());
    }

    pub fn record_sent_at(&mut self, bytes: usize, now: Instant) {
        self.roll_window(now);
        self.bytes_sent += bytes as u64;
        self.window_sent += bytes as u64;
    }

    pub fn record_received_at(&mut self, bytes: usize, now: Instant) {
        self.roll_window(now);
        self.bytes_received += bytes as u64;
        self.window_received += bytes as u64;
    }

    fn roll_window(&mut self, now: Instant) {
        let start = match self.window_start {
            Some(start) => start,
            None => {
                self.window_start = Some(now);
                return;
            }
        };

        let elapsed = now.saturating_duration_since(start);
        if elapsed < RATE_WINDOW {
            return;
        }

        let secs = elapsed.as_secs_f64();
        self.sent_per_second = (self.window_sent as f64 / secs) as u64;
        self.received_per_second = (self.window_received as f64 / secs) as u64;
        self.window_start = Some(now);
        self.window_sent = 0;
        self.window_received = 0;
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received
    }

    pub fn sent_per_second(&self) -> u64 {
        self.sent_per_second
    }

    pub fn received_per_second(&self) -> u64 {
        self.received_per_second
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cumulative_counts() {
        let mut stats = TransportStats::new();
        stats.record_sent(100);
        stats.record_sent(50);
        stats.record_received(7);

        assert_eq!(stats.bytes_sent(), 150);
        assert_eq!(stats.bytes_received(), 7);
    }

    #[test]
    fn test_rate_sampled_on_window_roll() {
        let mut stats = TransportStats::new();
        let t0 = Instant::now();

        stats.record_sent_at(0, t0);
        stats.record_sent_at(1000, t0 + Duration::from_millis(500));
        stats.record_received_at(400, t0 + Duration::from_millis(900));

        // Window not yet complete
        assert_eq!(stats.sent_per_second(), 0);

        stats.record_sent_at(0, t0 + Duration::from_secs(2));
        assert_eq!(stats.sent_per_second(), 500);
        assert_eq!(stats.received_per_second(), 200);
    }
}
