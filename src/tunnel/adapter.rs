/**
 * tunnel/adapter.rs
 *
 * Virtual network adapter interface and an in-process implementation
 */

use async_trait::async_trait;
use bytes::Bytes;
use std::io;
use tokio::sync::{mpsc, Mutex};

/// Packet interface of a virtual network adapter. Addressing and routing
/// are configured outside this crate.
#[async_trait]
pub trait VirtualAdapter: Send + Sync {
    /// Read the next outbound packet. Must be cancel-safe.
    async fn read(&self) -> io::Result<Bytes>;

    /// Deliver an inbound packet to the local stack
    async fn write(&self, packet: &[u8]) -> io::Result<()>;

    fn mtu(&self) -> usize;
}

/// Adapter backed by channels. The paired [`AdapterHandle`] plays the
/// operating system side.
pub struct ChannelAdapter {
    outbound: Mutex<mpsc::Receiver<Bytes>>,
    inbound: mpsc::Sender<Bytes>,
    mtu: usize,
}

pub struct AdapterHandle {
    to_adapter: mpsc::Sender<Bytes>,
    from_adapter: mpsc::Receiver<Bytes>,
}

impl ChannelAdapter {
    pub fn pair(mtu: usize, capacity: usize) -> (ChannelAdapter, AdapterHandle) {
        let (to_adapter, outbound) = mpsc::channel(capacity);
        let (inbound, from_adapter) = mpsc::channel(capacity);
        (
            ChannelAdapter {
                outbound: Mutex::new(outbound),
                inbound,
                mtu,
            },
            AdapterHandle {
                to_adapter,
                from_adapter,
            },
        )
    }
}

fn closed() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "adapter closed")
}

#[async_trait]
impl VirtualAdapter for ChannelAdapter {
    async fn read(&self) -> io::Result<Bytes> {
        self.outbound.lock().await.recv().await.ok_or_else(closed)
    }

    async fn write(&self, packet: &[u8]) -> io::Result<()> {
        self.inbound
            .send(Bytes::copy_from_slice(packet))
            .await
            .map_err(|_| closed())
    }

    fn mtu(&self) -> usize {
        self.mtu
    }
}

impl AdapterHandle {
    /// Hand a packet to the adapter as if the local stack sent it
    pub async fn inject(&self, packet: Bytes) -> io::Result<()> {
        self.to_adapter.send(packet).await.map_err(|_| closed())
    }

    /// Next packet the adapter delivered to the local stack
    pub async fn next(&mut self) -> Option<Bytes> {
        self.from_adapter.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn channel_adapter_moves_packets_both_ways() {
        let (adapter, mut handle) = ChannelAdapter::pair(1500, 4);
        assert_eq!(adapter.mtu(), 1500);

        handle.inject(Bytes::from_static(b"out")).await.unwrap();
        assert_eq!(adapter.read().await.unwrap(), Bytes::from_static(b"out"));

        adapter.write(b"in").await.unwrap();
        assert_eq!(handle.next().await.unwrap(), Bytes::from_static(b"in"));

        drop(handle);
        assert_eq!(adapter.read().await.unwrap_err().kind(), io::ErrorKind::BrokenPipe);
    }
}
