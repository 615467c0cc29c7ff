//! Wire envelope shared by every protocol layer.
//!
//! A datagram carries exactly one [`Envelope`], encoded as ASCII: five
//! space-separated header integers followed by the payload. The payload may
//! itself contain spaces and runs to the end of the datagram.

use core::fmt;
use std::collections::BTreeSet;

use crate::directory::ProcessId;

/// Largest datagram accepted on the wire.
pub const MAX_DATAGRAM: usize = 65_536;

/// Wire discriminant of an [`Envelope`].
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum Kind {
    /// Link-level acknowledgement.
    PlAck,
    /// Broadcast data; FIFO payloads ride uniform reliable broadcast.
    UrbMsg,
    /// Lattice agreement proposal.
    LaProposal,
    /// Lattice agreement acceptance.
    LaAck,
    /// Lattice agreement rejection carrying the responder's merged set.
    LaNack,
}

impl Kind {
    fn from_wire(value: u32) -> Option<Self> {
        match value {
            0 => Some(Self::PlAck),
            1 => Some(Self::UrbMsg),
            2 => Some(Self::LaProposal),
            3 => Some(Self::LaAck),
            4 => Some(Self::LaNack),
            _ => None,
        }
    }

    fn to_wire(self) -> u32 {
        match self {
            Self::PlAck => 0,
            Self::UrbMsg => 1,
            Self::LaProposal => 2,
            Self::LaAck => 3,
            Self::LaNack => 4,
        }
    }
}

/// Marker error for datagrams that do not parse as an [`Envelope`].
#[derive(Debug)]
pub struct DecodeError;

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("malformed datagram")
    }
}

impl core::error::Error for DecodeError {}

/// The one wire object.
///
/// `origin` and `origin_seq` identify a broadcast by its originator and the
/// originator's sequence number. Lattice agreement traffic never traverses
/// the broadcast layers and reuses the same two fields as slot number and
/// proposal number.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Envelope {
    pub kind: Kind,
    /// Last-hop sender; stamped by the link on the way out.
    pub sender: ProcessId,
    /// Link-level sequence number; stamped by the link on the way out.
    pub seq: u64,
    /// Broadcast originator, or the agreement slot.
    pub origin: u32,
    /// Originator sequence, or the agreement proposal number.
    pub origin_seq: u64,
    pub payload: String,
}

impl Envelope {
    /// Broadcast data envelope; the link fills in `sender` and `seq`.
    #[must_use]
    pub fn data(origin: u32, origin_seq: u64, payload: String) -> Self {
        Self {
            kind: Kind::UrbMsg,
            sender: ProcessId::new(0),
            seq: 0,
            origin,
            origin_seq,
            payload,
        }
    }

    /// Agreement envelope for `slot`/`proposal_number`.
    #[must_use]
    pub fn agreement(kind: Kind, slot: u32, proposal_number: u64, payload: String) -> Self {
        Self {
            kind,
            sender: ProcessId::new(0),
            seq: 0,
            origin: slot,
            origin_seq: proposal_number,
            payload,
        }
    }

    /// Acknowledgement mirroring the identifying fields of `received`.
    ///
    /// The mirrored `(seq, origin, origin_seq)` tuple is what the sender
    /// matches against its pending entries when cancelling retransmission.
    #[must_use]
    pub fn ack_for(received: &Self, sender: ProcessId) -> Self {
        Self {
            kind: Kind::PlAck,
            sender,
            seq: received.seq,
            origin: received.origin,
            origin_seq: received.origin_seq,
            payload: String::new(),
        }
    }

    #[must_use]
    pub fn encode(&self) -> String {
        format!(
            "{} {} {} {} {} {}",
            self.kind.to_wire(),
            self.sender,
            self.seq,
            self.origin,
            self.origin_seq,
            self.payload
        )
    }

    /// Parse one datagram.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError`] if the datagram is not UTF-8, is missing
    /// header fields, or carries an unknown kind. The payload is optional;
    /// a missing payload decodes as the empty string.
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let text = core::str::from_utf8(bytes).map_err(|_| DecodeError)?;
        let mut parts = text.splitn(6, ' ');
        let mut field = || parts.next().ok_or(DecodeError);

        let kind = Kind::from_wire(field()?.parse().map_err(|_| DecodeError)?).ok_or(DecodeError)?;
        let sender = ProcessId::new(field()?.parse().map_err(|_| DecodeError)?);
        let seq = field()?.parse().map_err(|_| DecodeError)?;
        let origin = field()?.parse().map_err(|_| DecodeError)?;
        let origin_seq = field()?.parse().map_err(|_| DecodeError)?;
        let payload = parts.next().unwrap_or_default().to_owned();

        Ok(Self {
            kind,
            sender,
            seq,
            origin,
            origin_seq,
            payload,
        })
    }
}

/// Integer set as it travels in agreement payloads and decision lines:
/// ascending decimals separated by single spaces.
#[must_use]
pub fn encode_set(set: &BTreeSet<u32>) -> String {
    let mut out = String::new();
    for value in set {
        if !out.is_empty() {
            out.push(' ');
        }
        out.push_str(&value.to_string());
    }
    out
}

/// Parse a space-separated integer set; `None` on any non-integer token.
#[must_use]
pub fn parse_set(text: &str) -> Option<BTreeSet<u32>> {
    text.split_whitespace().map(|token| token.parse().ok()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_payload_with_spaces() {
        let envelope = Envelope {
            kind: Kind::LaNack,
            sender: ProcessId::new(3),
            seq: 17,
            origin: 2,
            origin_seq: 5,
            payload: "1 2 3".to_owned(),
        };
        let decoded = Envelope::decode(envelope.encode().as_bytes()).unwrap();
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn decodes_empty_payload() {
        let decoded = Envelope::decode(b"0 1 9 1 4 ").unwrap();
        assert_eq!(decoded.kind, Kind::PlAck);
        assert_eq!(decoded.payload, "");
    }

    #[test]
    fn rejects_malformed_datagrams() {
        assert!(Envelope::decode(b"").is_err());
        assert!(Envelope::decode(b"1 2 3").is_err());
        assert!(Envelope::decode(b"not numbers at all go").is_err());
        // Unknown kind discriminant.
        assert!(Envelope::decode(b"9 1 1 1 1 x").is_err());
        assert!(Envelope::decode(&[0xff, 0xfe, 0x20, 0x20]).is_err());
    }

    #[test]
    fn ack_mirrors_identifying_tuple() {
        let data = Envelope {
            kind: Kind::UrbMsg,
            sender: ProcessId::new(2),
            seq: 41,
            origin: 2,
            origin_seq: 7,
            payload: "7".to_owned(),
        };
        let ack = Envelope::ack_for(&data, ProcessId::new(1));
        assert_eq!(ack.kind, Kind::PlAck);
        assert_eq!(ack.sender, ProcessId::new(1));
        assert_eq!((ack.seq, ack.origin, ack.origin_seq), (41, 2, 7));
    }

    #[test]
    fn set_wire_format_is_sorted_and_strict() {
        let set: BTreeSet<u32> = [30, 1, 12].into_iter().collect();
        assert_eq!(encode_set(&set), "1 12 30");
        assert_eq!(parse_set("30 1 12"), Some(set));
        assert_eq!(parse_set(""), Some(BTreeSet::new()));
        assert_eq!(parse_set("1 two 3"), None);
    }
}
