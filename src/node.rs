//! Node driver: one task owning every layer, the transport, and the log.
//!
//! ```text
//! Node
//!   ├─► PerfectLink ──► Transport (UDP or in-memory)
//!   ├─► UniformBroadcast ──► FifoBroadcast ──► OutputLog   (broadcast mode)
//!   └─► LatticeAgreement ──► DecisionQueue ──► OutputLog   (agreement mode)
//! ```
//!
//! Inbound datagrams enter through the link and are routed upward by
//! envelope kind; every layer hands back the datagrams to transmit, so the
//! whole stack runs synchronously inside the one task and needs no locks.

use std::future::Future;
use std::io;
use std::time::Duration;

use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, instrument, trace, warn};

use crate::config::Mode;
use crate::directory::{Directory, ProcessId};
use crate::fifo::FifoBroadcast;
use crate::lattice::{Decision, LatticeAgreement};
use crate::link::{Outgoing, PerfectLink};
use crate::message::{Envelope, Kind};
use crate::output::{DecisionQueue, OutputLog};
use crate::transport::Transport;
use crate::urb::UniformBroadcast;

/// Granularity of the retransmission timer.
const TICK_INTERVAL: Duration = Duration::from_millis(10);

pub struct Node<T> {
    self_id: ProcessId,
    mode: Mode,
    transport: T,
    link: PerfectLink,
    urb: UniformBroadcast,
    fifo: FifoBroadcast,
    lattice: LatticeAgreement,
    output: OutputLog,
    decisions: DecisionQueue,
}

impl<T: Transport> Node<T> {
    #[must_use]
    pub fn new(
        self_id: ProcessId,
        directory: &Directory,
        mode: Mode,
        transport: T,
        output: OutputLog,
    ) -> Self {
        let peers: Vec<ProcessId> = directory.ids().collect();
        Self {
            self_id,
            mode,
            transport,
            link: PerfectLink::new(self_id),
            urb: UniformBroadcast::new(self_id, peers.clone()),
            fifo: FifoBroadcast::new(self_id),
            lattice: LatticeAgreement::new(peers),
            output,
            decisions: DecisionQueue::default(),
        }
    }

    /// Originate this process's workload, then serve the event loop until
    /// `shutdown` resolves, then flush the output log.
    ///
    /// # Errors
    ///
    /// Only the final flush can fail; everything at runtime is logged and
    /// survived.
    #[instrument(skip_all, fields(id = %self.self_id))]
    pub async fn run(mut self, shutdown: impl Future<Output = ()>) -> io::Result<()> {
        self.start().await;

        let mut tick = time::interval(TICK_INTERVAL);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                () = &mut shutdown => {
                    debug!("shutdown requested");
                    break;
                }
                received = self.transport.recv() => match received {
                    Ok((from, bytes)) => self.on_datagram(from, &bytes).await,
                    Err(error) => warn!(%error, "transport receive failed"),
                },
                _ = tick.tick() => {
                    for out in self.link.tick(Instant::now()) {
                        self.transmit(out).await;
                    }
                }
            }
        }

        self.output.flush()
    }

    async fn start(&mut self) {
        let now = Instant::now();
        match self.mode.clone() {
            Mode::Send { count, target } => {
                if target == self.self_id {
                    info!("configured target is this process; skipping send phase");
                    return;
                }
                info!(count, %target, "sending");
                for i in 1..=count {
                    self.log_broadcast(i);
                    let out = self
                        .link
                        .send(target, Envelope::data(self.self_id.get(), i, i.to_string()), now);
                    self.transmit(out).await;
                }
            }
            Mode::Broadcast { count } => {
                info!(count, "broadcasting");
                for i in 1..=count {
                    self.log_broadcast(i);
                    let outs =
                        self.fifo
                            .broadcast(i.to_string(), &mut self.urb, &mut self.link, now);
                    for out in outs {
                        self.transmit(out).await;
                    }
                }
            }
            Mode::Agreement { proposals } => {
                info!(slots = proposals.len(), "proposing");
                for (slot, value) in (0u32..).zip(proposals) {
                    let outs = self.lattice.propose(slot, value, &mut self.link, now);
                    for out in outs {
                        self.transmit(out).await;
                    }
                }
            }
        }
    }

    async fn on_datagram(&mut self, from: ProcessId, bytes: &[u8]) {
        let received = self.link.on_datagram(from, bytes);
        if let Some(ack) = received.ack {
            self.transmit(ack).await;
        }
        let Some((from, envelope)) = received.deliver else {
            return;
        };
        trace!(%from, kind = ?envelope.kind, "link delivered");
        match envelope.kind {
            // Acknowledgements are consumed inside the link.
            Kind::PlAck => {}
            Kind::UrbMsg => self.on_data(from, envelope).await,
            Kind::LaProposal | Kind::LaAck | Kind::LaNack => {
                self.on_agreement(from, &envelope).await;
            }
        }
    }

    async fn on_data(&mut self, from: ProcessId, envelope: Envelope) {
        match self.mode {
            Mode::Send { .. } => self.log_delivery(from, &envelope.payload),
            Mode::Broadcast { .. } => {
                let out = self
                    .urb
                    .on_deliver(from, envelope, &mut self.link, Instant::now());
                for relay in out.relay {
                    self.transmit(relay).await;
                }
                if let Some(delivered) = out.deliver {
                    for released in self.fifo.on_deliver(delivered) {
                        let origin = ProcessId::new(released.origin);
                        self.log_delivery(origin, &released.payload);
                    }
                }
            }
            Mode::Agreement { .. } => trace!("ignoring broadcast data in agreement mode"),
        }
    }

    async fn on_agreement(&mut self, from: ProcessId, envelope: &Envelope) {
        if !matches!(self.mode, Mode::Agreement { .. }) {
            trace!("ignoring agreement traffic outside agreement mode");
            return;
        }
        let out = self
            .lattice
            .on_deliver(from, envelope, &mut self.link, Instant::now());
        for outgoing in out.outgoing {
            self.transmit(outgoing).await;
        }
        if let Some(Decision { slot, value }) = out.decision {
            for ready in self.decisions.push(slot, value) {
                if let Err(error) = self.output.decision(&ready) {
                    warn!(%error, "output write failed");
                }
            }
        }
    }

    async fn transmit(&mut self, out: Outgoing) {
        let wire = out.envelope.encode();
        if let Err(error) = self.transport.send(out.to, wire.as_bytes()).await {
            warn!(%error, to = %out.to, "send failed");
        }
    }

    fn log_broadcast(&mut self, seq: u64) {
        if let Err(error) = self.output.broadcast(seq) {
            warn!(%error, "output write failed");
        }
    }

    fn log_delivery(&mut self, from: ProcessId, payload: &str) {
        if let Err(error) = self.output.deliver(from, payload) {
            warn!(%error, "output write failed");
        }
    }
}
