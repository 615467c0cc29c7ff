//! Shared harness: an in-memory datagram network with a programmable loss
//! policy, plus helpers for spawning whole nodes and reading their logs.

#![allow(dead_code)]

use std::collections::{BTreeSet, HashMap};
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use braid::config::Mode;
use braid::directory::{Directory, Host, ProcessId};
use braid::node::Node;
use braid::output::OutputLog;
use braid::transport::Transport;
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;

/// Returns true when a packet from the first process to the second should
/// be dropped.
pub type LossPolicy = Box<dyn FnMut(ProcessId, ProcessId) -> bool + Send>;

struct Inner {
    inboxes: Mutex<HashMap<ProcessId, mpsc::UnboundedSender<(ProcessId, Vec<u8>)>>>,
    drop_packet: Mutex<LossPolicy>,
}

/// The simulated network. Cloning shares the same wires.
#[derive(Clone)]
pub struct LossyNet {
    inner: Arc<Inner>,
}

impl LossyNet {
    pub fn reliable(n: u32) -> (Self, Vec<ChannelTransport>) {
        Self::with_policy(n, Box::new(|_, _| false))
    }

    pub fn with_policy(n: u32, policy: LossPolicy) -> (Self, Vec<ChannelTransport>) {
        let net = Self {
            inner: Arc::new(Inner {
                inboxes: Mutex::new(HashMap::new()),
                drop_packet: Mutex::new(policy),
            }),
        };
        let transports = (1..=n).map(|id| net.attach(ProcessId::new(id))).collect();
        (net, transports)
    }

    fn attach(&self, id: ProcessId) -> ChannelTransport {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.inboxes.lock().unwrap().insert(id, tx);
        ChannelTransport {
            self_id: id,
            rx,
            net: Arc::clone(&self.inner),
        }
    }

    /// Simulate a crash: all future traffic to `id` vanishes.
    pub fn disconnect(&self, id: ProcessId) {
        self.inner.inboxes.lock().unwrap().remove(&id);
    }
}

pub struct ChannelTransport {
    self_id: ProcessId,
    rx: mpsc::UnboundedReceiver<(ProcessId, Vec<u8>)>,
    net: Arc<Inner>,
}

impl Transport for ChannelTransport {
    async fn recv(&mut self) -> io::Result<(ProcessId, Vec<u8>)> {
        match self.rx.recv().await {
            Some(datagram) => Ok(datagram),
            // Disconnected from the network; behave like a dead socket.
            None => std::future::pending().await,
        }
    }

    async fn send(&mut self, to: ProcessId, bytes: &[u8]) -> io::Result<()> {
        if (self.net.drop_packet.lock().unwrap())(self.self_id, to) {
            return Ok(());
        }
        if let Some(tx) = self.net.inboxes.lock().unwrap().get(&to) {
            let _ = tx.send((self.self_id, bytes.to_vec()));
        }
        Ok(())
    }
}

/// Roster with throwaway endpoints; channel transports never dial them.
pub fn directory(n: u32) -> Directory {
    Directory::from_hosts(
        (1..=n)
            .map(|id| Host {
                id: ProcessId::new(id),
                addr: SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 9000 + id as u16)),
            })
            .collect(),
    )
    .unwrap()
}

pub fn output_path(test: &str, id: u32) -> PathBuf {
    std::env::temp_dir().join(format!("braid-{}-{test}-{id}.log", std::process::id()))
}

pub fn spawn_node(
    dir: &Directory,
    id: u32,
    mode: Mode,
    transport: ChannelTransport,
    path: &Path,
    shutdown: &Arc<Notify>,
) -> JoinHandle<io::Result<()>> {
    let node = Node::new(
        ProcessId::new(id),
        dir,
        mode,
        transport,
        OutputLog::create(path).unwrap(),
    );
    let notify = Arc::clone(shutdown);
    tokio::spawn(node.run(async move { notify.notified().await }))
}

pub fn read_log(path: &Path) -> Vec<String> {
    std::fs::read_to_string(path)
        .unwrap()
        .lines()
        .map(str::to_owned)
        .collect()
}

/// Parse a `d <from> <payload>` line.
pub fn delivery(line: &str) -> Option<(u32, String)> {
    let mut parts = line.splitn(3, ' ');
    if parts.next()? != "d" {
        return None;
    }
    let from = parts.next()?.parse().ok()?;
    Some((from, parts.next().unwrap_or("").to_owned()))
}

/// Payloads delivered from `origin`, in log order.
pub fn deliveries_from(lines: &[String], origin: u32) -> Vec<String> {
    lines
        .iter()
        .filter_map(|line| delivery(line))
        .filter(|(from, _)| *from == origin)
        .map(|(_, payload)| payload)
        .collect()
}

pub fn parse_set_line(line: &str) -> BTreeSet<u32> {
    line.split_whitespace()
        .map(|token| token.parse().unwrap())
        .collect()
}
