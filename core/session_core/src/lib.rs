//! Session core for peer-to-peer game networking
//!
//! This crate provides the networking layer of a game engine, handling:
//! - Reliable (stream) and unreliable (datagram) transports behind one trait set
//! - Sentinel-framed text messages with resynchronising decode
//! - A peer registry with generational ids
//! - SIP-like signaling: mutual registration, subscribe/notify discovery
//! - Game sessions with per-peer datagram viability negotiation
//!
//! Everything is single-threaded and poll-driven. The application owns each
//! session and calls `advance(now_ms, handler)` once per frame; callbacks
//! fire from inside that call.
//!
//! ```text
//!   application ──advance(now)──► Session<P: Protocol>
//!        ▲                           │
//!        │ SessionHandler            ├── SessionCore (peers, links, queues)
//!        └───────────────────────────┤        │
//!                                    │        ▼
//!                                    │   dyn Network ── MioNetwork | MemoryNetwork
//!                                    │
//!                                    └── SignalingProtocol | GameProtocol
//! ```

// ============================================================================
// Modules
// ============================================================================

pub mod config;
pub mod error;
pub mod game;
pub mod peer;
pub mod session;
pub mod signaling;
pub mod slots;
pub mod transport;
pub mod viability;
pub mod wire;

pub use config::{LocalIdentity, NetConfig, TransportMode};
pub use error::{AddressError, ConfigError, SessionError, TransportError, WireError};
pub use game::{Channel, GameKind, GameProtocol, GameSession};
pub use peer::{Peer, PeerId, SessionData, SessionKey, SessionKind};
pub use session::{
    LinkId, NetContext, Protocol, Session, SessionCore, SessionHandler, SessionState, SessionStats,
    Target,
};
pub use signaling::{SignalingKind, SignalingProtocol, SignalingSession};
pub use slots::{SlotId, Slots};
pub use transport::{MemoryNetwork, MioNetwork, Network};
pub use viability::{Viability, ViabilityState};
pub use wire::{Framing, NameAddr, Packet, GAME_FRAMING, SIGNALING_FRAMING};
