//! Packets: typed view over a frame
//!
//! The first three header lines are fixed and parsed by position:
//!
//! | Line | Content                    |
//! |------|----------------------------|
//! | 0    | `<type-int> <type-name>`   |
//! | 1    | `Sender: <name>`           |
//! | 2    | `Time: <epoch-ms>`         |
//!
//! Everything after that is an ordered list of `Key: Value` fields. The
//! header lines are rebuilt from these fields whenever the packet is
//! encoded, and every mutator drops the cached encoding.

use super::{decode, encode_into, Decoded, Frame, Framing};
use crate::error::WireError;

pub const SENDER_KEY: &str = "Sender";
pub const TIME_KEY: &str = "Time";

/// Number of fixed, positional header lines
pub const FIXED_HEADER_LINES: usize = 3;

#[derive(Debug, Clone)]
pub struct Packet {
    framing: Framing,
    kind: u16,
    kind_name: String,
    sender: String,
    time_ms: u64,
    fields: Vec<(String, String)>,
    body: Vec<String>,
    encoded: Option<Vec<u8>>,
}

impl Packet {
    pub fn new(
        framing: Framing,
        kind: u16,
        kind_name: impl Into<String>,
        sender: impl Into<String>,
        time_ms: u64,
    ) -> Self {
        Self {
            framing,
            kind,
            kind_name: kind_name.into(),
            sender: sender.into(),
            time_ms,
            fields: Vec::new(),
            body: Vec::new(),
            encoded: None,
        }
    }

    // ------------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------------

    pub fn framing(&self) -> &Framing {
        &self.framing
    }

    pub fn kind(&self) -> u16 {
        self.kind
    }

    pub fn kind_name(&self) -> &str {
        &self.kind_name
    }

    pub fn sender(&self) -> &str {
        &self.sender
    }

    pub fn time_ms(&self) -> u64 {
        self.time_ms
    }

    pub fn fields(&self) -> &[(String, String)] {
        &self.fields
    }

    pub fn body(&self) -> &[String] {
        &self.body
    }

    /// Value of the first field named `key` (case-insensitive)
    pub fn field(&self, key: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    /// Field at header line `FIXED_HEADER_LINES + index`
    pub fn field_at(&self, index: usize) -> Option<(&str, &str)> {
        self.fields
            .get(index)
            .map(|(k, v)| (k.as_str(), v.as_str()))
    }

    // ------------------------------------------------------------------------
    // Mutators (all invalidate the cached encoding)
    // ------------------------------------------------------------------------

    pub fn set_sender(&mut self, sender: impl Into<String>) {
        self.sender = sender.into();
        self.encoded = None;
    }

    pub fn set_time(&mut self, time_ms: u64) {
        self.time_ms = time_ms;
        self.encoded = None;
    }

    /// Replace the first field named `key`, or append it
    pub fn set_field(&mut self, key: impl Into<String>, value: impl ToString) {
        let key = key.into();
        let value = value.to_string();
        match self.fields.iter_mut().find(|(k, _)| k.eq_ignore_ascii_case(&key)) {
            Some(slot) => slot.1 = value,
            None => self.fields.push((key, value)),
        }
        self.encoded = None;
    }

    pub fn remove_field(&mut self, key: &str) -> Option<String> {
        let index = self
            .fields
            .iter()
            .position(|(k, _)| k.eq_ignore_ascii_case(key))?;
        self.encoded = None;
        Some(self.fields.remove(index).1)
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.set_field(key, value);
        self
    }

    pub fn push_body(&mut self, line: impl Into<String>) {
        self.body.push(line.into());
        self.encoded = None;
    }

    pub fn with_body<I, S>(mut self, lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.body.extend(lines.into_iter().map(Into::into));
        self.encoded = None;
        self
    }

    // ------------------------------------------------------------------------
    // Encoding
    // ------------------------------------------------------------------------

    /// Rebuild the header lines from the packet's fields
    pub fn header_lines(&self) -> Vec<String> {
        let mut lines = Vec::with_capacity(FIXED_HEADER_LINES + self.fields.len());
        lines.push(format!("{} {}", self.kind, self.kind_name));
        lines.push(format!("{}: {}", SENDER_KEY, self.sender));
        lines.push(format!("{}: {}", TIME_KEY, self.time_ms));
        for (key, value) in &self.fields {
            lines.push(format!("{}: {}", key, value));
        }
        lines
    }

    /// Encoded bytes, built on first use
    pub fn encoded(&mut self) -> &[u8] {
        if self.encoded.is_none() {
            let mut out = Vec::new();
            encode_into(&self.framing, &self.header_lines(), &self.body, &mut out);
            self.encoded = Some(out);
        }
        self.encoded.as_deref().unwrap_or_default()
    }

    pub fn to_frame(&self) -> Frame {
        Frame::new(self.header_lines(), self.body.clone())
    }

    // ------------------------------------------------------------------------
    // Decoding
    // ------------------------------------------------------------------------

    /// Interpret a decoded frame
    pub fn from_frame(framing: Framing, frame: Frame) -> Result<Packet, WireError> {
        let mut header = frame.header.into_iter();

        let type_line = header.next().ok_or(WireError::MissingTypeLine)?;
        let (kind, kind_name) = type_line
            .split_once(' ')
            .and_then(|(k, n)| Some((k.parse::<u16>().ok()?, n.trim())))
            .filter(|(_, n)| !n.is_empty())
            .ok_or_else(|| WireError::BadTypeLine(type_line.clone()))?;
        let kind_name = kind_name.to_string();

        let sender = header
            .next()
            .and_then(|l| parse_field(&l))
            .filter(|(k, _)| k.eq_ignore_ascii_case(SENDER_KEY))
            .map(|(_, v)| v)
            .ok_or(WireError::MissingSender)?;

        let time_ms = header
            .next()
            .and_then(|l| parse_field(&l))
            .filter(|(k, _)| k.eq_ignore_ascii_case(TIME_KEY))
            .and_then(|(_, v)| v.parse::<u64>().ok())
            .ok_or(WireError::MissingTime)?;

        let fields = header
            .map(|l| parse_field(&l).ok_or(WireError::MalformedField(l)))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Packet {
            framing,
            kind,
            kind_name,
            sender,
            time_ms,
            fields,
            body: frame.body,
            encoded: None,
        })
    }

    /// Decode every complete message in `input` into packets
    ///
    /// Frames that fail to parse are returned as errors in stream order so
    /// the caller can answer them.
    pub fn decode_all(
        framing: Framing,
        input: &[u8],
        line_budget: usize,
    ) -> (Vec<Result<Packet, WireError>>, Decoded) {
        let mut decoded = decode(&framing, input, line_budget);
        let packets = std::mem::take(&mut decoded.frames)
            .into_iter()
            .map(|frame| Packet::from_frame(framing, frame))
            .collect();
        (packets, decoded)
    }
}

/// Split a `Key: Value` line
fn parse_field(line: &str) -> Option<(String, String)> {
    let (key, value) = line.split_once(':')?;
    let key = key.trim();
    if key.is_empty() || key.contains(' ') {
        return None;
    }
    let value = value.strip_prefix(' ').unwrap_or(value);
    Some((key.to_string(), value.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{decode, GAME_FRAMING};

    fn sample() -> Packet {
        Packet::new(GAME_FRAMING, 100, "CHAT", "alice", 1_700_000_000_000)
            .with_field("Channel", "lobby")
            .with_body(["hello there", "second: line"])
    }

    #[test]
    fn test_header_layout() {
        let lines = sample().header_lines();
        assert_eq!(
            lines,
            vec![
                "100 CHAT",
                "Sender: alice",
                "Time: 1700000000000",
                "Channel: lobby",
            ]
        );
    }

    #[test]
    fn test_encode_decode() {
        let mut packet = sample();
        let bytes = packet.encoded().to_vec();

        let decoded = decode(&GAME_FRAMING, &bytes, 500);
        let parsed = Packet::from_frame(GAME_FRAMING, decoded.frames[0].clone()).unwrap();

        assert_eq!(parsed.kind(), 100);
        assert_eq!(parsed.kind_name(), "CHAT");
        assert_eq!(parsed.sender(), "alice");
        assert_eq!(parsed.time_ms(), 1_700_000_000_000);
        assert_eq!(parsed.field("channel"), Some("lobby"));
        assert_eq!(parsed.field_at(0), Some(("Channel", "lobby")));
        assert_eq!(parsed.body(), packet.body());
    }

    #[test]
    fn test_mutation_invalidates_encoding() {
        let mut packet = sample();
        let before = packet.encoded().to_vec();

        packet.set_time(42);
        let after = packet.encoded().to_vec();
        assert_ne!(before, after);
        assert!(String::from_utf8(after).unwrap().contains("Time: 42\n"));

        packet.set_field("Channel", "team");
        assert!(String::from_utf8(packet.encoded().to_vec())
            .unwrap()
            .contains("Channel: team\n"));
        assert_eq!(packet.fields().len(), 1);
    }

    #[test]
    fn test_bad_type_line() {
        let frame = Frame::new(vec!["CHAT".into(), "Sender: a".into(), "Time: 1".into()], vec![]);
        assert_eq!(
            Packet::from_frame(GAME_FRAMING, frame).unwrap_err(),
            WireError::BadTypeLine("CHAT".into())
        );
    }

    #[test]
    fn test_missing_sender_and_time() {
        let frame = Frame::new(vec!["1 JOIN".into(), "Time: 1".into()], vec![]);
        assert_eq!(
            Packet::from_frame(GAME_FRAMING, frame).unwrap_err(),
            WireError::MissingSender
        );

        let frame = Frame::new(
            vec!["1 JOIN".into(), "Sender: a".into(), "Time: soon".into()],
            vec![],
        );
        assert_eq!(
            Packet::from_frame(GAME_FRAMING, frame).unwrap_err(),
            WireError::MissingTime
        );
    }

    #[test]
    fn test_malformed_field() {
        let frame = Frame::new(
            vec![
                "1 JOIN".into(),
                "Sender: a".into(),
                "Time: 1".into(),
                "no separator here".into(),
            ],
            vec![],
        );
        assert!(matches!(
            Packet::from_frame(GAME_FRAMING, frame),
            Err(WireError::MalformedField(_))
        ));
    }

    #[test]
    fn test_decode_all_keeps_order_and_errors() {
        let mut bytes = sample().encoded().to_vec();
        bytes.extend(b"NETGAME 1.0\nbroken\n#HEADER-END\n#END NETGAME\n");
        let mut second = Packet::new(GAME_FRAMING, 4, "READY", "bob", 9);
        bytes.extend(second.encoded());

        let (packets, decoded) = Packet::decode_all(GAME_FRAMING, &bytes, 500);
        assert_eq!(decoded.consumed, bytes.len());
        assert_eq!(packets.len(), 3);
        assert!(packets[0].is_ok());
        assert!(packets[1].is_err());
        assert_eq!(packets[2].as_ref().unwrap().sender(), "bob");
    }
}
