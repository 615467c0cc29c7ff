//! Process roster: stable integer identifiers mapped to UDP endpoints.

use core::fmt;
use std::fs;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::path::Path;

use error_stack::{Report, ResultExt};

/// Stable identifier of a participant. Rosters number processes `1..=n`.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct ProcessId(u32);

impl ProcessId {
    #[must_use]
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// One roster entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Host {
    pub id: ProcessId,
    pub addr: SocketAddr,
}

/// Marker error for roster loading and validation failures.
#[derive(Debug)]
pub struct HostsError;

impl fmt::Display for HostsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("invalid hosts file")
    }
}

impl core::error::Error for HostsError {}

/// Ordered roster of every participant, self included.
#[derive(Clone, Debug)]
pub struct Directory {
    hosts: Vec<Host>,
}

impl Directory {
    /// Load a hosts file with one `<id> <ipv4> <port>` entry per line.
    ///
    /// # Errors
    ///
    /// Returns [`HostsError`] if the file cannot be read, a line is
    /// malformed, or the ids are not contiguous from 1.
    pub fn load(path: &Path) -> Result<Self, Report<HostsError>> {
        let contents = fs::read_to_string(path)
            .change_context(HostsError)
            .attach_with(|| format!("reading {}", path.display()))?;

        let mut hosts = Vec::new();
        for (index, line) in contents.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let mut fields = line.split_whitespace();
            let (Some(id), Some(ip), Some(port), None) =
                (fields.next(), fields.next(), fields.next(), fields.next())
            else {
                return Err(Report::new(HostsError)
                    .attach(format!("line {}: expected `<id> <ipv4> <port>`", index + 1)));
            };
            let id: u32 = id
                .parse()
                .change_context(HostsError)
                .attach_with(|| format!("line {}: bad id", index + 1))?;
            let ip: Ipv4Addr = ip
                .parse()
                .change_context(HostsError)
                .attach_with(|| format!("line {}: bad address", index + 1))?;
            let port: u16 = port
                .parse()
                .change_context(HostsError)
                .attach_with(|| format!("line {}: bad port", index + 1))?;
            hosts.push(Host {
                id: ProcessId::new(id),
                addr: SocketAddr::V4(SocketAddrV4::new(ip, port)),
            });
        }

        Self::from_hosts(hosts)
    }

    /// Build a roster from in-memory entries, validating id contiguity.
    ///
    /// # Errors
    ///
    /// Returns [`HostsError`] if the roster is empty or the sorted ids are
    /// not exactly `1..=n`.
    pub fn from_hosts(mut hosts: Vec<Host>) -> Result<Self, Report<HostsError>> {
        if hosts.is_empty() {
            return Err(Report::new(HostsError).attach("empty roster"));
        }
        hosts.sort_by_key(|host| host.id);
        if (1u32..).zip(&hosts).any(|(want, host)| host.id.get() != want) {
            return Err(
                Report::new(HostsError).attach("ids must be contiguous from 1")
            );
        }
        Ok(Self { hosts })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    #[must_use]
    pub fn contains(&self, id: ProcessId) -> bool {
        self.addr_of(id).is_some()
    }

    /// Endpoint of process `id`, if it is in the roster.
    #[must_use]
    pub fn addr_of(&self, id: ProcessId) -> Option<SocketAddr> {
        self.hosts
            .iter()
            .find(|host| host.id == id)
            .map(|host| host.addr)
    }

    /// Reverse lookup used to tag inbound datagrams with their sender.
    #[must_use]
    pub fn id_of(&self, addr: SocketAddr) -> Option<ProcessId> {
        self.hosts
            .iter()
            .find(|host| host.addr == addr)
            .map(|host| host.id)
    }

    /// All process ids in ascending order.
    pub fn ids(&self) -> impl Iterator<Item = ProcessId> + '_ {
        self.hosts.iter().map(|host| host.id)
    }
}
