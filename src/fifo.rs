//! Per-originator FIFO ordering on top of uniform reliable broadcast.

use std::collections::BTreeMap;

use tokio::time::Instant;

use crate::directory::ProcessId;
use crate::link::{Outgoing, PerfectLink};
use crate::message::Envelope;
use crate::urb::UniformBroadcast;

/// Buffers out-of-order broadcasts and releases them per originator in
/// contiguous ascending `origin_seq`, starting at 1.
pub struct FifoBroadcast {
    self_id: ProcessId,
    my_seq: u64,
    next_seq: BTreeMap<ProcessId, u64>,
    buffer: BTreeMap<ProcessId, BTreeMap<u64, Envelope>>,
}

impl FifoBroadcast {
    #[must_use]
    pub fn new(self_id: ProcessId) -> Self {
        Self {
            self_id,
            my_seq: 0,
            next_seq: BTreeMap::new(),
            buffer: BTreeMap::new(),
        }
    }

    /// Originate a FIFO broadcast: stamp the next own sequence number and
    /// hand the envelope to the broadcast layer.
    pub fn broadcast(
        &mut self,
        payload: String,
        urb: &mut UniformBroadcast,
        link: &mut PerfectLink,
        now: Instant,
    ) -> Vec<Outgoing> {
        self.my_seq += 1;
        let envelope = Envelope::data(self.self_id.get(), self.my_seq, payload);
        urb.broadcast(envelope, link, now)
    }

    /// Ingest a broadcast delivery and return the envelopes that are now
    /// releasable in order, possibly none.
    pub fn on_deliver(&mut self, envelope: Envelope) -> Vec<Envelope> {
        let origin = ProcessId::new(envelope.origin);
        let next = self.next_seq.entry(origin).or_insert(1);

        // The broadcast layer already deduplicates; anything below the
        // cursor is a stale duplicate.
        if envelope.origin_seq < *next {
            return Vec::new();
        }

        let buffered = self.buffer.entry(origin).or_default();
        buffered.insert(envelope.origin_seq, envelope);

        let mut ready = Vec::new();
        while let Some(released) = buffered.remove(next) {
            ready.push(released);
            *next += 1;
        }
        ready
    }
}
