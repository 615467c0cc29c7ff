//! Stubborn point-to-point link with delivery deduplication.
//!
//! Sits directly on the datagram transport. Every data envelope is
//! retransmitted on a fixed interval until the peer acknowledges it; the
//! receive side acknowledges everything it sees and surfaces each
//! `(sender, seq)` pair at most once. The link is a pure state machine:
//! operations return the datagrams to put on the wire and the driver
//! performs the sends, so every rule here is testable without I/O.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use tokio::time::Instant;
use tracing::trace;

use crate::directory::ProcessId;
use crate::message::{Envelope, Kind};

/// Fixed retransmission interval for unacknowledged envelopes.
pub const RESEND_INTERVAL: Duration = Duration::from_millis(1000);

/// A datagram ready for the transport.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Outgoing {
    pub to: ProcessId,
    pub envelope: Envelope,
}

/// Result of ingesting one datagram.
#[derive(Debug, Default)]
pub struct Received {
    /// Envelope to surface to the layer above, if new.
    pub deliver: Option<(ProcessId, Envelope)>,
    /// Acknowledgement to put on the wire.
    pub ack: Option<Outgoing>,
}

struct PendingEntry {
    envelope: Envelope,
    last_sent: Instant,
}

/// Reliable at-most-once link between this process and every peer.
pub struct PerfectLink {
    self_id: ProcessId,
    next_seq: u64,
    pending: BTreeMap<ProcessId, Vec<PendingEntry>>,
    delivered: BTreeSet<(ProcessId, u64)>,
}

impl PerfectLink {
    #[must_use]
    pub fn new(self_id: ProcessId) -> Self {
        Self {
            self_id,
            next_seq: 0,
            pending: BTreeMap::new(),
            delivered: BTreeSet::new(),
        }
    }

    /// Schedule `envelope` for reliable delivery to `to` and return the
    /// initial transmission. The link stamps `sender` and a fresh `seq`;
    /// whatever the caller put there is overwritten.
    pub fn send(&mut self, to: ProcessId, mut envelope: Envelope, now: Instant) -> Outgoing {
        envelope.sender = self.self_id;
        self.next_seq += 1;
        envelope.seq = self.next_seq;
        self.pending.entry(to).or_default().push(PendingEntry {
            envelope: envelope.clone(),
            last_sent: now,
        });
        Outgoing { to, envelope }
    }

    /// Ingest one raw datagram attributed to `from` by the transport.
    ///
    /// Undecodable datagrams are dropped silently. Acknowledgements cancel
    /// matching pending entries and surface nothing; data envelopes are
    /// acknowledged unconditionally and surfaced once per `(sender, seq)`.
    pub fn on_datagram(&mut self, from: ProcessId, bytes: &[u8]) -> Received {
        let Ok(envelope) = Envelope::decode(bytes) else {
            trace!(%from, "dropping undecodable datagram");
            return Received::default();
        };

        if envelope.kind == Kind::PlAck {
            self.on_ack(&envelope);
            return Received::default();
        }

        let ack = Outgoing {
            to: envelope.sender,
            envelope: Envelope::ack_for(&envelope, self.self_id),
        };
        let deliver = self
            .delivered
            .insert((envelope.sender, envelope.seq))
            .then(|| (envelope.sender, envelope));
        Received {
            deliver,
            ack: Some(ack),
        }
    }

    /// Cancel pending entries matching the full `(seq, origin, origin_seq)`
    /// tuple. Matching on `seq` alone would cross-cancel when sequence
    /// numbers overlap between layers.
    fn on_ack(&mut self, ack: &Envelope) {
        let Some(pending) = self.pending.get_mut(&ack.sender) else {
            return;
        };
        pending.retain(|entry| {
            entry.envelope.seq != ack.seq
                || entry.envelope.origin != ack.origin
                || entry.envelope.origin_seq != ack.origin_seq
        });
    }

    /// Retransmit every pending envelope older than [`RESEND_INTERVAL`].
    pub fn tick(&mut self, now: Instant) -> Vec<Outgoing> {
        let mut out = Vec::new();
        for (&to, entries) in &mut self.pending {
            for entry in entries {
                if now.duration_since(entry.last_sent) >= RESEND_INTERVAL {
                    entry.last_sent = now;
                    out.push(Outgoing {
                        to,
                        envelope: entry.envelope.clone(),
                    });
                }
            }
        }
        out
    }

    /// Envelopes still awaiting acknowledgement, across all peers.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending.values().map(Vec::len).sum()
    }
}
