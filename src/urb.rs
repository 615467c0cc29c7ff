//! Uniform reliable broadcast: majority-witnessed flooding over the link.
//!
//! A broadcast is relayed by every process the first time it is seen and
//! delivered once a strict majority has witnessed it. Majorities intersect,
//! so if any process delivers, every correct process eventually does.

use std::collections::{BTreeMap, BTreeSet};

use tokio::time::Instant;
use tracing::trace;

use crate::directory::ProcessId;
use crate::link::{Outgoing, PerfectLink};
use crate::message::Envelope;

/// A broadcast identity: `(origin, origin_seq)`.
type MessageId = (u32, u64);

/// Result of ingesting one link delivery.
#[derive(Debug, Default)]
pub struct UrbOutput {
    /// First-sight relay fan-out, one transmission per process.
    pub relay: Vec<Outgoing>,
    /// Envelope whose witness set just reached a majority.
    pub deliver: Option<Envelope>,
}

pub struct UniformBroadcast {
    self_id: ProcessId,
    peers: Vec<ProcessId>,
    quorum: usize,
    forwarded: BTreeSet<MessageId>,
    acks: BTreeMap<MessageId, BTreeSet<ProcessId>>,
    pending: BTreeMap<MessageId, Envelope>,
    delivered: BTreeSet<MessageId>,
}

impl UniformBroadcast {
    /// `peers` is the full roster, self included.
    #[must_use]
    pub fn new(self_id: ProcessId, peers: Vec<ProcessId>) -> Self {
        let quorum = peers.len() / 2 + 1;
        Self {
            self_id,
            peers,
            quorum,
            forwarded: BTreeSet::new(),
            acks: BTreeMap::new(),
            pending: BTreeMap::new(),
            delivered: BTreeSet::new(),
        }
    }

    /// Originate a broadcast. The caller has filled in `origin` and
    /// `origin_seq`; the flood goes to every process including self, and
    /// delivery happens when the self-addressed copy loops back with enough
    /// witnesses.
    pub fn broadcast(
        &mut self,
        envelope: Envelope,
        link: &mut PerfectLink,
        now: Instant,
    ) -> Vec<Outgoing> {
        let id = (envelope.origin, envelope.origin_seq);
        if !self.forwarded.insert(id) {
            return Vec::new();
        }
        self.acks.entry(id).or_default().insert(self.self_id);
        self.pending.insert(id, envelope.clone());
        self.flood(&envelope, link, now)
    }

    /// Ingest a broadcast envelope the link delivered from `from`.
    pub fn on_deliver(
        &mut self,
        from: ProcessId,
        envelope: Envelope,
        link: &mut PerfectLink,
        now: Instant,
    ) -> UrbOutput {
        let id = (envelope.origin, envelope.origin_seq);

        let acks = self.acks.entry(id).or_default();
        acks.insert(from);
        acks.insert(self.self_id);
        let witnesses = acks.len();

        self.pending.entry(id).or_insert_with(|| envelope.clone());

        let relay = if self.forwarded.insert(id) {
            trace!(origin = id.0, origin_seq = id.1, "relaying new broadcast");
            self.flood(&envelope, link, now)
        } else {
            Vec::new()
        };

        let deliver = if witnesses >= self.quorum && self.delivered.insert(id) {
            Some(self.pending.get(&id).cloned().unwrap_or(envelope))
        } else {
            None
        };

        UrbOutput { relay, deliver }
    }

    fn flood(&self, envelope: &Envelope, link: &mut PerfectLink, now: Instant) -> Vec<Outgoing> {
        self.peers
            .iter()
            .map(|&to| link.send(to, envelope.clone(), now))
            .collect()
    }
}
