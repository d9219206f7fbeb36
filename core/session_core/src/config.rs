//! Session configuration and local identity
//!
//! Every field has a default, so a config file only needs to list the
//! values it changes.

use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

// ============================================================================
// Defaults
// ============================================================================

/// Lines scanned per decode call before a stream is treated as garbled
pub const DEFAULT_DECODE_LINE_BUDGET: usize = 500;

/// Largest partial message kept per transport while waiting for the rest
pub const DEFAULT_MAX_PENDING_BYTES: usize = 256 * 1024;

/// Readiness probe timeout used once per tick
pub const DEFAULT_READINESS_TIMEOUT_MS: u64 = 1;

/// Upper bound on TEST/CONFIRM probes sent to one peer
pub const DEFAULT_MAX_PROBE_ATTEMPTS: u32 = 10_000;

/// Longest subscription a session will grant
pub const DEFAULT_MAX_SUBSCRIPTION_MS: u64 = 3_600_000;

/// Subscription length requested when none is given
pub const DEFAULT_SUBSCRIPTION_MS: u64 = 600_000;

/// Re-subscribe this long before our own subscription runs out
pub const DEFAULT_SUBSCRIPTION_REFRESH_MS: u64 = 30_000;

/// Inbound transports that name no peer within this long are closed
pub const DEFAULT_HANDSHAKE_TIMEOUT_MS: u64 = 10_000;

/// Requests unanswered for this long are forgotten
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;

// ============================================================================
// Local Identity
// ============================================================================

/// Who this session is on the wire ("me")
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalIdentity {
    pub name: String,
    pub address: IpAddr,
    pub port: u16,
}

impl LocalIdentity {
    pub fn new(name: impl Into<String>, address: IpAddr, port: u16) -> Self {
        Self {
            name: name.into(),
            address,
            port,
        }
    }
}

// ============================================================================
// Transport Mode
// ============================================================================

/// Application-wide ceiling on unreliable transport use
///
/// `Auto` lets latency-sensitive packet types use the datagram path once the
/// pair has converged; it can never force datagrams onto a pair that has not.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportMode {
    ReliableOnly,
    #[default]
    Auto,
}

// ============================================================================
// Net Config
// ============================================================================

/// Tunables shared by every session kind
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetConfig {
    /// Maximum number of peers a session will hold
    pub max_peers: usize,
    /// Lines scanned per decode call
    pub decode_line_budget: usize,
    /// Pending partial-message ceiling per transport
    pub max_pending_bytes: usize,
    /// Readiness probe timeout (ms)
    pub readiness_timeout_ms: u64,
    /// Viability probe ceiling per peer
    pub max_probe_attempts: u32,
    /// Global ceiling on datagram use
    pub transport_mode: TransportMode,
    /// Events peers may SUBSCRIBE to, besides peer discovery
    pub allowed_events: Vec<String>,
    /// Events we subscribe to on every newly registered peer
    pub discovery_events: Vec<String>,
    /// Longest subscription we grant (ms)
    pub max_subscription_ms: u64,
    /// Subscription length we request (ms)
    pub subscription_ms: u64,
    /// How early we refresh our own subscriptions (ms)
    pub subscription_refresh_ms: u64,
    /// Close inbound transports still unassociated after this long (ms)
    pub handshake_timeout_ms: u64,
    /// Forget our requests left unanswered this long (ms)
    pub request_timeout_ms: u64,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            max_peers: 32,
            decode_line_budget: DEFAULT_DECODE_LINE_BUDGET,
            max_pending_bytes: DEFAULT_MAX_PENDING_BYTES,
            readiness_timeout_ms: DEFAULT_READINESS_TIMEOUT_MS,
            max_probe_attempts: DEFAULT_MAX_PROBE_ATTEMPTS,
            transport_mode: TransportMode::Auto,
            allowed_events: Vec::new(),
            discovery_events: Vec::new(),
            max_subscription_ms: DEFAULT_MAX_SUBSCRIPTION_MS,
            subscription_ms: DEFAULT_SUBSCRIPTION_MS,
            subscription_refresh_ms: DEFAULT_SUBSCRIPTION_REFRESH_MS,
            handshake_timeout_ms: DEFAULT_HANDSHAKE_TIMEOUT_MS,
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
        }
    }
}

impl NetConfig {
    /// Parse a config from JSON text
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Load a config from a JSON file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&text)
    }

    pub fn readiness_timeout(&self) -> Duration {
        Duration::from_millis(self.readiness_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = NetConfig::default();
        assert_eq!(config.decode_line_budget, 500);
        assert_eq!(config.max_probe_attempts, 10_000);
        assert_eq!(config.transport_mode, TransportMode::Auto);
        assert_eq!(config.readiness_timeout(), Duration::from_millis(1));
        assert_eq!(config.handshake_timeout_ms, DEFAULT_HANDSHAKE_TIMEOUT_MS);
        assert_eq!(config.request_timeout_ms, DEFAULT_REQUEST_TIMEOUT_MS);
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = NetConfig::from_json(
            r#"{ "max_peers": 4, "transport_mode": "reliable_only", "allowed_events": ["chat"] }"#,
        )
        .unwrap();

        assert_eq!(config.max_peers, 4);
        assert_eq!(config.transport_mode, TransportMode::ReliableOnly);
        assert_eq!(config.allowed_events, vec!["chat".to_string()]);
        assert_eq!(config.decode_line_budget, DEFAULT_DECODE_LINE_BUDGET);
    }

    #[test]
    fn test_invalid_json() {
        assert!(matches!(
            NetConfig::from_json("{ max_peers: }"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_missing_file() {
        assert!(matches!(
            NetConfig::load("/nonexistent/session.json"),
            Err(ConfigError::Read { .. })
        ));
    }
}
