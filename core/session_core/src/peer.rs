//! Peer registry records
//!
//! A [`Peer`] is one remote participant: its identity triple, a validity
//! flag, the transports bound to it and one [`SessionData`] record per
//! protocol that has touched it. Peers live in the session's `Slots<Peer>`
//! and are only ever referred to by [`PeerId`].

use std::net::{IpAddr, SocketAddr};

use crate::game::GameData;
use crate::session::LinkId;
use crate::signaling::SignalingData;
use crate::slots::SlotId;

pub type PeerId = SlotId<Peer>;

// ============================================================================
// Session Data
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionKind {
    Signaling,
    Game,
}

/// Key of one extension record: (kind, sub-kind)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub kind: SessionKind,
    pub sub_kind: u16,
}

impl SessionKey {
    pub const SIGNALING: SessionKey = SessionKey {
        kind: SessionKind::Signaling,
        sub_kind: 0,
    };

    pub const GAME: SessionKey = SessionKey {
        kind: SessionKind::Game,
        sub_kind: 0,
    };

    pub fn new(kind: SessionKind, sub_kind: u16) -> Self {
        Self { kind, sub_kind }
    }
}

/// Per-peer state owned by one protocol
#[derive(Debug, Clone)]
pub enum SessionData {
    Signaling(SignalingData),
    Game(GameData),
}

impl SessionData {
    fn for_kind(kind: SessionKind) -> Self {
        match kind {
            SessionKind::Signaling => SessionData::Signaling(SignalingData::default()),
            SessionKind::Game => SessionData::Game(GameData::default()),
        }
    }
}

// ============================================================================
// Peer
// ============================================================================

#[derive(Debug, Clone)]
pub struct Peer {
    pub name: String,
    pub address: IpAddr,
    pub port: u16,
    /// Identity confirmed by a handshake
    pub valid: bool,
    primary: Option<LinkId>,
    auxiliary: Vec<LinkId>,
    data: Vec<(SessionKey, SessionData)>,
}

impl Peer {
    pub fn new(name: impl Into<String>, address: IpAddr, port: u16) -> Self {
        Self {
            name: name.into(),
            address,
            port,
            valid: false,
            primary: None,
            auxiliary: Vec::new(),
            data: Vec::new(),
        }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }

    /// Whether this peer matches an identity triple
    pub fn is(&self, name: &str, address: IpAddr, port: u16) -> bool {
        self.name == name && self.address == address && self.port == port
    }

    // ------------------------------------------------------------------------
    // Transports
    // ------------------------------------------------------------------------

    pub fn primary(&self) -> Option<LinkId> {
        self.primary
    }

    pub fn auxiliary(&self) -> &[LinkId] {
        &self.auxiliary
    }

    pub fn links(&self) -> impl Iterator<Item = LinkId> + '_ {
        self.primary.into_iter().chain(self.auxiliary.iter().copied())
    }

    pub fn has_links(&self) -> bool {
        self.primary.is_some() || !self.auxiliary.is_empty()
    }

    /// Bind `link` as the primary transport; a previous primary becomes auxiliary
    pub(crate) fn set_primary(&mut self, link: LinkId) {
        self.auxiliary.retain(|&l| l != link);
        if let Some(old) = self.primary.replace(link) {
            if old != link {
                self.auxiliary.push(old);
            }
        }
    }

    pub(crate) fn add_auxiliary(&mut self, link: LinkId) {
        if self.primary.is_none() {
            self.primary = Some(link);
        } else if self.primary != Some(link) && !self.auxiliary.contains(&link) {
            self.auxiliary.push(link);
        }
    }

    /// Forget `link`; the oldest auxiliary is promoted if it was primary
    pub(crate) fn detach(&mut self, link: LinkId) {
        if self.primary == Some(link) {
            self.primary = if self.auxiliary.is_empty() {
                None
            } else {
                Some(self.auxiliary.remove(0))
            };
        } else {
            self.auxiliary.retain(|&l| l != link);
        }
    }

    // ------------------------------------------------------------------------
    // Session data
    // ------------------------------------------------------------------------

    /// The record for `key`, created on first access
    pub fn session_data(&mut self, key: SessionKey) -> &mut SessionData {
        let index = match self.data.iter().position(|(k, _)| *k == key) {
            Some(index) => index,
            None => {
                self.data.push((key, SessionData::for_kind(key.kind)));
                self.data.len() - 1
            }
        };
        &mut self.data[index].1
    }

    /// The record for `key`, if it exists
    pub fn find_session_data(&self, key: SessionKey) -> Option<&SessionData> {
        self.data.iter().find(|(k, _)| *k == key).map(|(_, d)| d)
    }

    pub fn session_data_len(&self) -> usize {
        self.data.len()
    }

    pub fn signaling(&mut self) -> &mut SignalingData {
        match self.session_data(SessionKey::SIGNALING) {
            SessionData::Signaling(data) => data,
            SessionData::Game(_) => unreachable!("signaling key holds signaling data"),
        }
    }

    pub fn game(&mut self) -> &mut GameData {
        match self.session_data(SessionKey::GAME) {
            SessionData::Game(data) => data,
            SessionData::Signaling(_) => unreachable!("game key holds game data"),
        }
    }

    pub fn signaling_ref(&self) -> Option<&SignalingData> {
        match self.find_session_data(SessionKey::SIGNALING) {
            Some(SessionData::Signaling(data)) => Some(data),
            _ => None,
        }
    }

    pub fn game_ref(&self) -> Option<&GameData> {
        match self.find_session_data(SessionKey::GAME) {
            Some(SessionData::Game(data)) => Some(data),
            _ => None,
        }
    }
}
