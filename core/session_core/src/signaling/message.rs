//! Signaling message kinds, fields and builders
//!
//! Every signaling packet carries, after the three fixed lines:
//!
//! | Line | Field                         |
//! |------|-------------------------------|
//! | 3    | `CSeq: <n> <METHOD>`          |
//! | 4    | `From: <address>`             |
//! | 5    | `To: <address>`               |
//!
//! followed by optional `Event`, `Expires` and `Reason` fields. Replies echo
//! the CSeq of the request they answer.

use std::fmt;

use crate::error::AddressError;
use crate::session::SessionCore;
use crate::wire::{NameAddr, Packet};

pub const CSEQ_KEY: &str = "CSeq";
pub const FROM_KEY: &str = "From";
pub const TO_KEY: &str = "To";
pub const EVENT_KEY: &str = "Event";
pub const EXPIRES_KEY: &str = "Expires";
pub const REASON_KEY: &str = "Reason";

/// Built-in event carrying the roster of registered peers
pub const PEER_DISCOVERY: &str = "peer-discovery";

// ============================================================================
// Kinds
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalingKind {
    Register,
    Ok,
    Decline,
    Subscribe,
    Notify,
    Info,
    Invite,
    Bye,
    BadRequest,
    BadEvent,
}

impl SignalingKind {
    pub const ALL: [SignalingKind; 10] = [
        SignalingKind::Register,
        SignalingKind::Ok,
        SignalingKind::Decline,
        SignalingKind::Subscribe,
        SignalingKind::Notify,
        SignalingKind::Info,
        SignalingKind::Invite,
        SignalingKind::Bye,
        SignalingKind::BadRequest,
        SignalingKind::BadEvent,
    ];

    pub fn code(self) -> u16 {
        match self {
            SignalingKind::Register => 1,
            SignalingKind::Ok => 2,
            SignalingKind::Decline => 3,
            SignalingKind::Subscribe => 4,
            SignalingKind::Notify => 5,
            SignalingKind::Info => 6,
            SignalingKind::Invite => 7,
            SignalingKind::Bye => 8,
            SignalingKind::BadRequest => 9,
            SignalingKind::BadEvent => 10,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            SignalingKind::Register => "REGISTER",
            SignalingKind::Ok => "OK",
            SignalingKind::Decline => "DECLINE",
            SignalingKind::Subscribe => "SUBSCRIBE",
            SignalingKind::Notify => "NOTIFY",
            SignalingKind::Info => "INFO",
            SignalingKind::Invite => "INVITE",
            SignalingKind::Bye => "BYE",
            SignalingKind::BadRequest => "BAD-REQUEST",
            SignalingKind::BadEvent => "BAD-EVENT",
        }
    }

    pub fn from_code(code: u16) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.code() == code)
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.name() == name)
    }

    /// Requests expect a reply; everything else is a reply
    pub fn is_request(self) -> bool {
        matches!(
            self,
            SignalingKind::Register
                | SignalingKind::Subscribe
                | SignalingKind::Notify
                | SignalingKind::Info
                | SignalingKind::Invite
                | SignalingKind::Bye
        )
    }
}

impl fmt::Display for SignalingKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ============================================================================
// CSeq
// ============================================================================

/// Request sequence number plus the method it belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CSeq {
    pub seq: u32,
    pub method: SignalingKind,
}

impl CSeq {
    pub fn parse(s: &str) -> Option<CSeq> {
        let (seq, method) = s.trim().split_once(' ')?;
        Some(CSeq {
            seq: seq.parse().ok()?,
            method: SignalingKind::from_name(method.trim())?,
        })
    }
}

impl fmt::Display for CSeq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.seq, self.method)
    }
}

// ============================================================================
// Field accessors
// ============================================================================

pub fn kind(packet: &Packet) -> Option<SignalingKind> {
    SignalingKind::from_code(packet.kind())
}

pub fn cseq(packet: &Packet) -> Option<CSeq> {
    packet.field(CSEQ_KEY).and_then(CSeq::parse)
}

pub fn from_addr(packet: &Packet) -> Result<NameAddr, AddressError> {
    let value = packet
        .field(FROM_KEY)
        .ok_or_else(|| AddressError::MissingBrackets(String::new()))?;
    NameAddr::parse(value)
}

pub fn event(packet: &Packet) -> Option<&str> {
    packet.field(EVENT_KEY).map(str::trim)
}

pub fn expires(packet: &Packet) -> Option<u64> {
    packet.field(EXPIRES_KEY).and_then(|v| v.trim().parse().ok())
}

pub fn reason(packet: &Packet) -> Option<&str> {
    packet.field(REASON_KEY)
}

// ============================================================================
// Builders
// ============================================================================

/// A request from `from` to `to`
pub fn request(
    core: &SessionCore,
    kind: SignalingKind,
    seq: u32,
    from: &NameAddr,
    to: &NameAddr,
) -> Packet {
    debug_assert!(kind.is_request());
    core.new_packet(kind.code(), kind.name())
        .with_field(CSEQ_KEY, CSeq { seq, method: kind })
        .with_field(FROM_KEY, from)
        .with_field(TO_KEY, to)
}

/// A reply to `request`, echoing its CSeq
///
/// A request without a CSeq is answered with sequence number 0.
pub fn reply(core: &SessionCore, kind: SignalingKind, request: &Packet, from: &NameAddr) -> Packet {
    let cseq = cseq(request).unwrap_or(CSeq {
        seq: 0,
        method: self::kind(request).unwrap_or(kind),
    });

    let mut packet = core
        .new_packet(kind.code(), kind.name())
        .with_field(CSEQ_KEY, cseq)
        .with_field(FROM_KEY, from);
    if let Some(to) = request.field(FROM_KEY) {
        packet.set_field(TO_KEY, to);
    }
    packet
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::SIGNALING_FRAMING;

    #[test]
    fn test_kind_codes_unique() {
        for kind in SignalingKind::ALL {
            assert_eq!(SignalingKind::from_code(kind.code()), Some(kind));
            assert_eq!(SignalingKind::from_name(kind.name()), Some(kind));
        }
        assert_eq!(SignalingKind::from_code(100), None);
    }

    #[test]
    fn test_request_reply_split() {
        assert!(SignalingKind::Register.is_request());
        assert!(SignalingKind::Bye.is_request());
        assert!(!SignalingKind::Ok.is_request());
        assert!(!SignalingKind::BadEvent.is_request());
    }

    #[test]
    fn test_cseq_parse() {
        let cseq = CSeq::parse("42 SUBSCRIBE").unwrap();
        assert_eq!(cseq.seq, 42);
        assert_eq!(cseq.method, SignalingKind::Subscribe);
        assert_eq!(cseq.to_string(), "42 SUBSCRIBE");

        assert_eq!(CSeq::parse("x REGISTER"), None);
        assert_eq!(CSeq::parse("1 HELLO"), None);
        assert_eq!(CSeq::parse("7"), None);
    }

    #[test]
    fn test_field_accessors() {
        let packet = Packet::new(SIGNALING_FRAMING, 4, "SUBSCRIBE", "bob", 1)
            .with_field(CSEQ_KEY, "3 SUBSCRIBE")
            .with_field(FROM_KEY, "\"bob\" <bob@10.0.0.2:5000>;tag=aa")
            .with_field(EVENT_KEY, "peer-discovery")
            .with_field(EXPIRES_KEY, "60000");

        assert_eq!(kind(&packet), Some(SignalingKind::Subscribe));
        assert_eq!(cseq(&packet).map(|c| c.seq), Some(3));
        assert_eq!(from_addr(&packet).unwrap().tag.as_deref(), Some("aa"));
        assert_eq!(event(&packet), Some(PEER_DISCOVERY));
        assert_eq!(expires(&packet), Some(60_000));
        assert_eq!(reason(&packet), None);
    }

    #[test]
    fn test_missing_from() {
        let packet = Packet::new(SIGNALING_FRAMING, 1, "REGISTER", "x", 1);
        assert!(from_addr(&packet).is_err());
    }
}
