//! Multi-shot lattice agreement over the perfect link.
//!
//! Each numbered slot runs an independent instance. A proposer floods its
//! set and counts acceptances; any rejection carries the responder's merged
//! set, which the proposer folds in before retrying under a fresh proposal
//! number. A strict majority of acceptances decides. The acceptor side
//! keeps a monotonically growing set per slot and answers late retries for
//! as long as the process lives.

use std::collections::{BTreeMap, BTreeSet};

use tokio::time::Instant;
use tracing::{debug, trace};

use crate::directory::ProcessId;
use crate::link::{Outgoing, PerfectLink};
use crate::message::{self, Envelope, Kind};

/// A decided slot and its value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Decision {
    pub slot: u32,
    pub value: BTreeSet<u32>,
}

/// Result of ingesting one agreement message.
#[derive(Debug, Default)]
pub struct LaOutput {
    /// Replies and retry fan-outs to transmit.
    pub outgoing: Vec<Outgoing>,
    /// Decision reached by this message, if any.
    pub decision: Option<Decision>,
}

/// Per-slot proposer and acceptor state. Both roles share the instance,
/// and the instance outlives its decision.
#[derive(Debug, Default)]
struct SlotState {
    // Proposer role.
    active: bool,
    decided: bool,
    active_pn: u64,
    ack_count: usize,
    nack_count: usize,
    proposed: BTreeSet<u32>,
    // Acceptor role: the greatest lower bound accepted so far.
    accepted: BTreeSet<u32>,
}

enum Outcome {
    Wait,
    Decide(BTreeSet<u32>),
    Retry { pn: u64, payload: String },
}

pub struct LatticeAgreement {
    peers: Vec<ProcessId>,
    quorum: usize,
    slots: BTreeMap<u32, SlotState>,
}

impl LatticeAgreement {
    /// `peers` is the full roster, self included. The link stamps the local
    /// identity on everything that goes out.
    #[must_use]
    pub fn new(peers: Vec<ProcessId>) -> Self {
        let quorum = peers.len() / 2 + 1;
        Self {
            peers,
            quorum,
            slots: BTreeMap::new(),
        }
    }

    /// Start agreement for `slot` with the initial set `value`.
    pub fn propose(
        &mut self,
        slot: u32,
        value: BTreeSet<u32>,
        link: &mut PerfectLink,
        now: Instant,
    ) -> Vec<Outgoing> {
        let state = self.slots.entry(slot).or_default();
        if state.decided {
            return Vec::new();
        }
        state.active = true;
        state.proposed = value;
        state.active_pn += 1;
        state.ack_count = 0;
        state.nack_count = 0;
        let pn = state.active_pn;
        let payload = message::encode_set(&state.proposed);
        debug!(slot, pn, "proposing");
        self.flood(slot, pn, payload, link, now)
    }

    /// Ingest an agreement envelope the link delivered from `from`.
    pub fn on_deliver(
        &mut self,
        from: ProcessId,
        envelope: &Envelope,
        link: &mut PerfectLink,
        now: Instant,
    ) -> LaOutput {
        let slot = envelope.origin;
        let pn = envelope.origin_seq;
        match envelope.kind {
            Kind::LaProposal => self.on_proposal(from, slot, pn, &envelope.payload, link, now),
            Kind::LaAck => self.on_ack(slot, pn, link, now),
            Kind::LaNack => self.on_nack(slot, pn, &envelope.payload, link, now),
            Kind::PlAck | Kind::UrbMsg => LaOutput::default(),
        }
    }

    /// Acceptor role. Behaviour is independent of the proposal number; it
    /// is echoed back only so the proposer can match the response to its
    /// current attempt.
    fn on_proposal(
        &mut self,
        from: ProcessId,
        slot: u32,
        pn: u64,
        payload: &str,
        link: &mut PerfectLink,
        now: Instant,
    ) -> LaOutput {
        let Some(value) = message::parse_set(payload) else {
            trace!(%from, slot, "dropping proposal with unparsable set");
            return LaOutput::default();
        };

        let state = self.slots.entry(slot).or_default();
        let reply = if state.accepted.is_subset(&value) {
            state.accepted = value;
            Envelope::agreement(Kind::LaAck, slot, pn, String::new())
        } else {
            state.accepted.extend(value);
            Envelope::agreement(
                Kind::LaNack,
                slot,
                pn,
                message::encode_set(&state.accepted),
            )
        };

        LaOutput {
            outgoing: vec![link.send(from, reply, now)],
            decision: None,
        }
    }

    fn on_ack(&mut self, slot: u32, pn: u64, link: &mut PerfectLink, now: Instant) -> LaOutput {
        let outcome = {
            let state = self.slots.entry(slot).or_default();
            if !state.active || pn != state.active_pn {
                trace!(slot, pn, "ignoring stale acceptance");
                return LaOutput::default();
            }
            state.ack_count += 1;
            Self::evaluate(state, self.quorum)
        };
        self.conclude(slot, outcome, link, now)
    }

    fn on_nack(
        &mut self,
        slot: u32,
        pn: u64,
        payload: &str,
        link: &mut PerfectLink,
        now: Instant,
    ) -> LaOutput {
        let Some(value) = message::parse_set(payload) else {
            trace!(slot, "dropping rejection with unparsable set");
            return LaOutput::default();
        };
        let outcome = {
            let state = self.slots.entry(slot).or_default();
            if !state.active || pn != state.active_pn {
                trace!(slot, pn, "ignoring stale rejection");
                return LaOutput::default();
            }
            state.proposed.extend(value);
            state.nack_count += 1;
            Self::evaluate(state, self.quorum)
        };
        self.conclude(slot, outcome, link, now)
    }

    /// Termination check, run after every counted response. A majority of
    /// acceptances decides; a majority of responses with at least one
    /// rejection retries under the next proposal number, carrying the
    /// merged set.
    fn evaluate(state: &mut SlotState, quorum: usize) -> Outcome {
        if state.ack_count >= quorum {
            state.decided = true;
            state.active = false;
            return Outcome::Decide(state.proposed.clone());
        }
        if state.nack_count > 0 && state.ack_count + state.nack_count >= quorum {
            state.active_pn += 1;
            state.ack_count = 0;
            state.nack_count = 0;
            return Outcome::Retry {
                pn: state.active_pn,
                payload: message::encode_set(&state.proposed),
            };
        }
        Outcome::Wait
    }

    fn conclude(
        &mut self,
        slot: u32,
        outcome: Outcome,
        link: &mut PerfectLink,
        now: Instant,
    ) -> LaOutput {
        match outcome {
            Outcome::Wait => LaOutput::default(),
            Outcome::Decide(value) => {
                debug!(slot, "decided");
                LaOutput {
                    outgoing: Vec::new(),
                    decision: Some(Decision { slot, value }),
                }
            }
            Outcome::Retry { pn, payload } => {
                debug!(slot, pn, "retrying with merged proposal");
                LaOutput {
                    outgoing: self.flood(slot, pn, payload, link, now),
                    decision: None,
                }
            }
        }
    }

    fn flood(
        &self,
        slot: u32,
        pn: u64,
        payload: String,
        link: &mut PerfectLink,
        now: Instant,
    ) -> Vec<Outgoing> {
        let envelope = Envelope::agreement(Kind::LaProposal, slot, pn, payload);
        self.peers
            .iter()
            .map(|&to| link.send(to, envelope.clone(), now))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(values: &[u32]) -> BTreeSet<u32> {
        values.iter().copied().collect()
    }

    fn instance(id: u32, n: u32) -> (LatticeAgreement, PerfectLink) {
        (
            LatticeAgreement::new((1..=n).map(ProcessId::new).collect()),
            PerfectLink::new(ProcessId::new(id)),
        )
    }

    fn ack(slot: u32, pn: u64) -> Envelope {
        Envelope::agreement(Kind::LaAck, slot, pn, String::new())
    }

    fn nack(slot: u32, pn: u64, values: &[u32]) -> Envelope {
        Envelope::agreement(Kind::LaNack, slot, pn, message::encode_set(&set(values)))
    }

    #[test]
    fn decides_on_majority_of_acceptances() {
        let (mut la, mut link) = instance(1, 3);
        let now = Instant::now();

        let flood = la.propose(0, set(&[1, 2]), &mut link, now);
        assert_eq!(flood.len(), 3);
        assert_eq!(flood[0].envelope.kind, Kind::LaProposal);

        let p2 = ProcessId::new(2);
        let p3 = ProcessId::new(3);
        assert!(la.on_deliver(p2, &ack(0, 1), &mut link, now).decision.is_none());
        let out = la.on_deliver(p3, &ack(0, 1), &mut link, now);
        assert_eq!(
            out.decision,
            Some(Decision {
                slot: 0,
                value: set(&[1, 2]),
            })
        );
    }

    #[test]
    fn rejection_merges_and_retries_with_next_proposal_number() {
        let (mut la, mut link) = instance(1, 3);
        let now = Instant::now();
        la.propose(0, set(&[1]), &mut link, now);

        let p2 = ProcessId::new(2);
        let p3 = ProcessId::new(3);
        assert!(
            la.on_deliver(p2, &ack(0, 1), &mut link, now).decision.is_none()
        );
        let retry = la.on_deliver(p3, &nack(0, 1, &[2, 3]), &mut link, now);
        assert!(retry.decision.is_none());
        assert_eq!(retry.outgoing.len(), 3);
        let refloat = &retry.outgoing[0].envelope;
        assert_eq!(refloat.origin_seq, 2);
        assert_eq!(refloat.payload, "1 2 3");

        // Acceptances for the new attempt decide on the merged set.
        assert!(
            la.on_deliver(p2, &ack(0, 2), &mut link, now).decision.is_none()
        );
        let decided = la.on_deliver(p3, &ack(0, 2), &mut link, now);
        assert_eq!(decided.decision.unwrap().value, set(&[1, 2, 3]));
    }

    #[test]
    fn stale_responses_are_not_counted() {
        let (mut la, mut link) = instance(1, 3);
        let now = Instant::now();
        la.propose(0, set(&[1]), &mut link, now);

        let p2 = ProcessId::new(2);
        let p3 = ProcessId::new(3);
        // Response for a proposal number that is not the active attempt.
        assert!(la.on_deliver(p2, &ack(0, 9), &mut link, now).decision.is_none());
        assert!(la.on_deliver(p2, &ack(0, 1), &mut link, now).decision.is_none());
        // One counted acceptance is still short of the quorum of 2.
        assert!(la.on_deliver(p3, &ack(0, 9), &mut link, now).decision.is_none());
    }

    #[test]
    fn acceptor_adopts_supersets_and_merges_otherwise() {
        let (mut la, mut link) = instance(2, 3);
        let now = Instant::now();
        let p1 = ProcessId::new(1);

        let proposal = Envelope::agreement(Kind::LaProposal, 0, 1, "1 2".to_owned());
        let first = la.on_deliver(p1, &proposal, &mut link, now);
        assert_eq!(first.outgoing[0].envelope.kind, Kind::LaAck);

        // Not a superset of {1, 2}: merge and reject with the union.
        let sideways = Envelope::agreement(Kind::LaProposal, 0, 1, "3".to_owned());
        let second = la.on_deliver(p1, &sideways, &mut link, now);
        let reply = &second.outgoing[0].envelope;
        assert_eq!(reply.kind, Kind::LaNack);
        assert_eq!(reply.payload, "1 2 3");
    }

    #[test]
    fn acceptor_answers_late_retries_after_deciding() {
        let (mut la, mut link) = instance(1, 3);
        let now = Instant::now();
        la.propose(0, set(&[1]), &mut link, now);
        let p2 = ProcessId::new(2);
        let p3 = ProcessId::new(3);
        la.on_deliver(p2, &ack(0, 1), &mut link, now);
        let decided = la.on_deliver(p3, &ack(0, 1), &mut link, now);
        assert!(decided.decision.is_some());

        // A laggard's proposal for the decided slot still gets a response.
        let late = Envelope::agreement(Kind::LaProposal, 0, 4, "1 5".to_owned());
        let out = la.on_deliver(p2, &late, &mut link, now);
        assert_eq!(out.outgoing.len(), 1);
        assert!(out.decision.is_none());
    }

    #[test]
    fn slots_are_independent() {
        let (mut la, mut link) = instance(1, 3);
        let now = Instant::now();
        la.propose(0, set(&[1]), &mut link, now);
        la.propose(1, set(&[7]), &mut link, now);

        let p2 = ProcessId::new(2);
        let p3 = ProcessId::new(3);
        la.on_deliver(p2, &ack(1, 1), &mut link, now);
        let decided = la.on_deliver(p3, &ack(1, 1), &mut link, now);
        assert_eq!(decided.decision.unwrap(), Decision { slot: 1, value: set(&[7]) });
        // Slot 0 is still waiting for its own quorum.
        let still = la.on_deliver(p2, &ack(0, 1), &mut link, now);
        assert!(still.decision.is_none());
    }
}
