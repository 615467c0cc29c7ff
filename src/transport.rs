//! Datagram transport seam.
//!
//! Layers deal only in process ids; the transport owns the socket and the
//! roster and translates ids to endpoints on the way out and back. Keeping
//! this behind a trait lets the whole stack run over an in-memory network
//! in tests.

use std::io;
use std::net::Ipv4Addr;

use tokio::net::UdpSocket;
use tracing::{debug, warn};

use crate::directory::{Directory, ProcessId};
use crate::message::MAX_DATAGRAM;

/// Sends byte buffers to peers by id and receives them tagged with the
/// sending peer's id.
#[expect(async_fn_in_trait)]
pub trait Transport {
    /// Receive the next datagram from a known peer.
    async fn recv(&mut self) -> io::Result<(ProcessId, Vec<u8>)>;

    /// Send `bytes` to `to`. Traffic for ids outside the roster is dropped.
    async fn send(&mut self, to: ProcessId, bytes: &[u8]) -> io::Result<()>;
}

/// UDP transport bound to the local process's port.
pub struct UdpTransport {
    socket: UdpSocket,
    directory: Directory,
    buf: Vec<u8>,
}

impl UdpTransport {
    /// Bind the wildcard address on the port the roster assigns to
    /// `self_id`.
    ///
    /// # Errors
    ///
    /// Fails if `self_id` is not in the roster or the bind itself fails.
    pub async fn bind(directory: Directory, self_id: ProcessId) -> io::Result<Self> {
        let addr = directory
            .addr_of(self_id)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "self id not in the roster"))?;
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, addr.port())).await?;
        debug!(port = addr.port(), "socket bound");
        Ok(Self {
            socket,
            directory,
            buf: vec![0; MAX_DATAGRAM],
        })
    }
}

impl Transport for UdpTransport {
    async fn recv(&mut self) -> io::Result<(ProcessId, Vec<u8>)> {
        loop {
            let (len, addr) = self.socket.recv_from(&mut self.buf).await?;
            match self.directory.id_of(addr) {
                Some(from) => return Ok((from, self.buf[..len].to_vec())),
                None => warn!(%addr, "dropping datagram from unknown endpoint"),
            }
        }
    }

    async fn send(&mut self, to: ProcessId, bytes: &[u8]) -> io::Result<()> {
        let Some(addr) = self.directory.addr_of(to) else {
            warn!(%to, "dropping send to unknown process");
            return Ok(());
        };
        self.socket.send_to(bytes, addr).await.map(|_| ())
    }
}
