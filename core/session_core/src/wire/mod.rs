//! Line-oriented message framing
//!
//! # Format
//!
//! ```text
//! NETSIP 2.0                  ← start sentinel "<PROTOCOL> <VERSION>"
//! 1 REGISTER                  ← header line 0: "<type-int> <type-name>"
//! Sender: alice               ← header line 1
//! Time: 1700000000000         ← header line 2
//! CSeq: 1 REGISTER            ← further "Key: Value" header lines
//! #HEADER-END                 ← header-end sentinel
//! ...opaque body lines...
//! #END NETSIP                 ← end sentinel
//! ```
//!
//! Messages are concatenated without a length prefix, so the decoder
//! resynchronises purely on sentinel text. It is a single forward scan over
//! complete lines with four states:
//!
//! ```text
//! BeforeHeader ──start──► InHeader ──header-end──► InBody ──end──► Done
//!      ▲                     │ start (restart)        │ start (resync)  │
//!      └─────────────────────┴────────────────────────┴─────────────────┘
//! ```
//!
//! A line budget bounds the work done per call so a garbled stream cannot
//! starve the session.

use std::ops::Range;

pub mod address;
pub mod packet;

pub use address::NameAddr;
pub use packet::Packet;

/// Line separator written after every line
pub const LINE_SEPARATOR: &str = "\n";

// ============================================================================
// Framing
// ============================================================================

/// Sentinel lines for one protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Framing {
    pub protocol: &'static str,
    pub version: &'static str,
    pub header_end: &'static str,
    pub end: &'static str,
}

impl Framing {
    /// The start sentinel line, `"<PROTOCOL> <VERSION>"`
    pub fn start_line(&self) -> String {
        format!("{} {}", self.protocol, self.version)
    }

    fn is_start(&self, line: &str) -> bool {
        line.len() == self.protocol.len() + 1 + self.version.len()
            && line.starts_with(self.protocol)
            && line[self.protocol.len()..].starts_with(' ')
            && line.ends_with(self.version)
    }

    /// Whether `line` could be mistaken for a sentinel
    pub fn is_sentinel(&self, line: &str) -> bool {
        self.is_start(line) || line == self.header_end || line == self.end
    }
}

/// Framing used by the signaling protocol
pub const SIGNALING_FRAMING: Framing = Framing {
    protocol: "NETSIP",
    version: "2.0",
    header_end: "#HEADER-END",
    end: "#END NETSIP",
};

/// Framing used by game sessions
pub const GAME_FRAMING: Framing = Framing {
    protocol: "NETGAME",
    version: "1.0",
    header_end: "#HEADER-END",
    end: "#END NETGAME",
};

// ============================================================================
// Frames
// ============================================================================

/// One decoded message: raw header and body lines
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Frame {
    pub header: Vec<String>,
    pub body: Vec<String>,
}

impl Frame {
    pub fn new(header: Vec<String>, body: Vec<String>) -> Self {
        Self { header, body }
    }
}

/// Encode one frame, appending to `out`
///
/// Header and body lines must not contain line breaks or sentinel text.
pub fn encode_into(framing: &Framing, header: &[String], body: &[String], out: &mut Vec<u8>) {
    debug_assert!(
        header.iter().chain(body).all(|l| !l.contains('\n') && !framing.is_sentinel(l)),
        "frame line contains a line break or sentinel text"
    );

    let mut push = |line: &str| {
        out.extend_from_slice(line.as_bytes());
        out.extend_from_slice(LINE_SEPARATOR.as_bytes());
    };

    push(&framing.start_line());
    for line in header {
        push(line);
    }
    push(framing.header_end);
    for line in body {
        push(line);
    }
    push(framing.end);
}

/// Encode one frame into a fresh buffer
pub fn encode(framing: &Framing, frame: &Frame) -> Vec<u8> {
    let mut out = Vec::new();
    encode_into(framing, &frame.header, &frame.body, &mut out);
    out
}

// ============================================================================
// Decoding
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodeState {
    BeforeHeader,
    InHeader,
    InBody,
    Done,
}

/// Result of one decode call
#[derive(Debug, Default)]
pub struct Decoded {
    /// Complete messages, in stream order
    pub frames: Vec<Frame>,
    /// Bytes the caller may drop from the front of its buffer
    pub consumed: usize,
    /// The line budget ran out before any message completed; the scanned
    /// bytes were counted as consumed and discarded
    pub garbled: bool,
}

/// Decode every complete message in `input`
///
/// `input` is not modified. Bytes after the last complete message (a
/// partial message, or garbage being skipped) are left unconsumed unless
/// they are known garbage. A message interrupted by a new start sentinel
/// is dropped and decoding restarts at that sentinel.
pub fn decode(framing: &Framing, input: &[u8], line_budget: usize) -> Decoded {
    let mut decoded = Decoded::default();
    let mut state = DecodeState::BeforeHeader;
    let mut header = Vec::new();
    let mut body = Vec::new();
    let mut lines = 0usize;
    let mut pos = 0usize;

    while let Some(range) = next_line(input, pos) {
        let line_end = range.end + 1;

        lines += 1;
        if lines > line_budget {
            if decoded.frames.is_empty() {
                decoded.garbled = true;
                decoded.consumed = pos;
            }
            return decoded;
        }

        // Non-UTF-8 lines can never be sentinels and are dropped from frames
        let line = std::str::from_utf8(&input[range.clone()])
            .ok()
            .map(|l| l.strip_suffix('\r').unwrap_or(l));

        match (state, line) {
            (DecodeState::BeforeHeader, Some(l)) if framing.is_start(l) => {
                header.clear();
                body.clear();
                state = DecodeState::InHeader;
            }
            (DecodeState::BeforeHeader, _) => {
                // Garbage before a message: safe to drop
                decoded.consumed = line_end;
            }
            (DecodeState::InHeader | DecodeState::InBody, Some(l)) if framing.is_start(l) => {
                log::debug!("Start sentinel inside a message; resynchronising");
                header.clear();
                body.clear();
                state = DecodeState::InHeader;
            }
            (DecodeState::InHeader, Some(l)) if l == framing.header_end => {
                state = DecodeState::InBody;
            }
            (DecodeState::InHeader, Some(l)) => header.push(l.to_string()),
            (DecodeState::InBody, Some(l)) if l == framing.end => {
                state = DecodeState::Done;
            }
            (DecodeState::InBody, Some(l)) => body.push(l.to_string()),
            (DecodeState::InHeader | DecodeState::InBody, None) => {
                log::trace!("Skipping non-UTF-8 line inside a message");
            }
            (DecodeState::Done, _) => unreachable!("Done is left before reading the next line"),
        }

        if state == DecodeState::Done {
            decoded.frames.push(Frame::new(
                std::mem::take(&mut header),
                std::mem::take(&mut body),
            ));
            decoded.consumed = line_end;
            state = DecodeState::BeforeHeader;
        }

        pos = line_end;
    }

    decoded
}

/// Range of the next complete line starting at `pos`, excluding the `\n`
fn next_line(input: &[u8], pos: usize) -> Option<Range<usize>> {
    let rest = input.get(pos..)?;
    let offset = rest.iter().position(|&b| b == b'\n')?;
    Some(pos..pos + offset)
}

#[cfg(test)]
mod tests {
    use super::*;

    const BUDGET: usize = 500;

    fn frame(header: &[&str], body: &[&str]) -> Frame {
        Frame::new(
            header.iter().map(|s| s.to_string()).collect(),
            body.iter().map(|s| s.to_string()).collect(),
        )
    }

    #[test]
    fn test_encode_layout() {
        let bytes = encode(&GAME_FRAMING, &frame(&["1 JOIN", "Sender: a"], &["hi"]));
        assert_eq!(
            String::from_utf8(bytes).unwrap(),
            "NETGAME 1.0\n1 JOIN\nSender: a\n#HEADER-END\nhi\n#END NETGAME\n"
        );
    }

    #[test]
    fn test_roundtrip_single() {
        let f = frame(&["1 JOIN", "Sender: a", "Time: 5"], &["line one", "", "line three"]);
        let bytes = encode(&GAME_FRAMING, &f);

        let decoded = decode(&GAME_FRAMING, &bytes, BUDGET);
        assert_eq!(decoded.frames, vec![f]);
        assert_eq!(decoded.consumed, bytes.len());
        assert!(!decoded.garbled);
    }

    #[test]
    fn test_partial_message_left_for_next_read() {
        let f = frame(&["1 JOIN"], &["body"]);
        let bytes = encode(&GAME_FRAMING, &f);
        let cut = bytes.len() - 4;

        let decoded = decode(&GAME_FRAMING, &bytes[..cut], BUDGET);
        assert!(decoded.frames.is_empty());
        assert_eq!(decoded.consumed, 0);

        let decoded = decode(&GAME_FRAMING, &bytes, BUDGET);
        assert_eq!(decoded.frames.len(), 1);
    }

    #[test]
    fn test_leading_garbage_skipped() {
        let f = frame(&["2 READY"], &[]);
        let mut bytes = b"garbage\nmore garbage\n".to_vec();
        bytes.extend(encode(&GAME_FRAMING, &f));

        let decoded = decode(&GAME_FRAMING, &bytes, BUDGET);
        assert_eq!(decoded.frames, vec![f]);
        assert_eq!(decoded.consumed, bytes.len());
    }

    #[test]
    fn test_resync_on_start_inside_message() {
        let good = frame(&["3 PLAYERS"], &["7"]);
        let mut bytes = b"NETGAME 1.0\n1 JOIN\nSender: cut-off\n".to_vec();
        bytes.extend(encode(&GAME_FRAMING, &good));

        let decoded = decode(&GAME_FRAMING, &bytes, BUDGET);
        assert_eq!(decoded.frames, vec![good]);
    }

    #[test]
    fn test_crlf_tolerated() {
        let bytes = b"NETGAME 1.0\r\n1 JOIN\r\n#HEADER-END\r\nx\r\n#END NETGAME\r\n";
        let decoded = decode(&GAME_FRAMING, bytes, BUDGET);
        assert_eq!(decoded.frames, vec![frame(&["1 JOIN"], &["x"])]);
    }

    #[test]
    fn test_other_protocol_ignored() {
        let bytes = encode(&SIGNALING_FRAMING, &frame(&["1 REGISTER"], &[]));
        let decoded = decode(&GAME_FRAMING, &bytes, BUDGET);
        assert!(decoded.frames.is_empty());
        assert_eq!(decoded.consumed, bytes.len());
    }

    #[test]
    fn test_line_budget_discards_garbled_stream() {
        let mut bytes = b"NETGAME 1.0\n".to_vec();
        for i in 0..20 {
            bytes.extend(format!("Junk: {}\n", i).as_bytes());
        }

        let decoded = decode(&GAME_FRAMING, &bytes, 10);
        assert!(decoded.garbled);
        assert!(decoded.frames.is_empty());
        assert!(decoded.consumed > 0);
        assert!(decoded.consumed < bytes.len());
    }

    #[test]
    fn test_line_budget_keeps_completed_frames() {
        let f = frame(&["1 JOIN"], &[]);
        let mut bytes = encode(&GAME_FRAMING, &f);
        let first_len = bytes.len();
        bytes.extend(encode(&GAME_FRAMING, &f));

        // Enough lines for the first message only
        let decoded = decode(&GAME_FRAMING, &bytes, 6);
        assert_eq!(decoded.frames.len(), 1);
        assert_eq!(decoded.consumed, first_len);
        assert!(!decoded.garbled);
    }

    #[test]
    fn test_similar_start_line_is_not_sentinel() {
        assert!(GAME_FRAMING.is_sentinel("NETGAME 1.0"));
        assert!(!GAME_FRAMING.is_sentinel("NETGAME 1.01"));
        assert!(!GAME_FRAMING.is_sentinel("NETGAMEX1.0"));
        assert!(!GAME_FRAMING.is_sentinel("NETGAME  1.0"));
    }
}
