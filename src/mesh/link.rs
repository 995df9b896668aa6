/**
 * mesh/link.rs
 *
 * Datagram links a session runs over: a punched UDP socket, or a TURN
 * relay (see nat_traversal/turn.rs)
 */

use async_trait::async_trait;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tracing::trace;

/// A connected, unreliable datagram path to one peer
#[async_trait]
pub trait Datagram: Send + Sync {
    async fn send(&self, data: &[u8]) -> io::Result<()>;

    /// Receive the next datagram from the peer
    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Address datagrams are sent to
    fn peer_addr(&self) -> SocketAddr;

    fn local_addr(&self) -> io::Result<SocketAddr>;

    /// Short description for logs
    fn kind(&self) -> &'static str;
}

/// UDP socket with a punched path to a single peer
pub struct PunchedSocket {
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
}

impl PunchedSocket {
    pub fn new(socket: Arc<UdpSocket>, peer: SocketAddr) -> Self {
        Self { socket, peer }
    }
}

#[async_trait]
impl Datagram for PunchedSocket {
    async fn send(&self, data: &[u8]) -> io::Result<()> {
        self.socket.send_to(data, self.peer).await?;
        Ok(())
    }

    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match self.socket.recv_from(buf).await {
                Ok((len, from)) if from == self.peer => return Ok(len),
                Ok((_, from)) => trace!(%from, peer = %self.peer, "dropping datagram from stranger"),
                Err(e) if matches!(e.kind(), io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionRefused) => continue,
                Err(e) => return Err(e),
            }
        }
    }

    fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    fn kind(&self) -> &'static str {
        "direct"
    }
}
