//! Error types for the session core
//!
//! Setup calls (bind, connect, host) return these as `Result`s. Faults that
//! happen during a tick never propagate out of `advance`; they are turned
//! into a reason string instead (see `Session::last_error`).

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

use crate::session::SessionState;

/// Errors raised while creating or using a transport endpoint
#[derive(Debug, Error)]
pub enum TransportError {
    /// Could not bind a listening or datagram endpoint
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// Could not open a reliable endpoint to a remote host
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// Nothing is listening at the requested address
    #[error("connection refused by {0}")]
    Refused(SocketAddr),

    /// The address is already taken by another endpoint
    #[error("address {0} already in use")]
    AddrInUse(SocketAddr),

    /// Readiness registration or polling failed
    #[error("poll error: {0}")]
    Poll(#[from] io::Error),
}

/// Errors raised while parsing a framed message into a packet
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WireError {
    #[error("message has no type line")]
    MissingTypeLine,

    #[error("malformed type line '{0}'")]
    BadTypeLine(String),

    #[error("missing or malformed Sender line")]
    MissingSender,

    #[error("missing or malformed Time line")]
    MissingTime,

    #[error("malformed header line '{0}'")]
    MalformedField(String),
}

/// Errors raised while parsing a signaling address field
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddressError {
    #[error("address field has no '<...>' section: '{0}'")]
    MissingBrackets(String),

    #[error("address '{0}' has no port")]
    MissingPort(String),

    #[error("invalid port in '{0}'")]
    BadPort(String),

    #[error("address '{0}' has an empty host")]
    EmptyHost(String),
}

/// Errors raised by session lifecycle calls
#[derive(Debug, Error)]
pub enum SessionError {
    /// `host`/`connect_to` called while the session is already active
    #[error("session is {0:?}; stop it first")]
    InvalidState(SessionState),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Errors raised while loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("invalid config: {0}")]
    Parse(#[from] serde_json::Error),
}
