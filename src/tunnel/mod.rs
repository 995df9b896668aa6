/**
 * tunnel/mod.rs
 *
 * Virtual adapter bridge over a mesh session
 */

pub mod adapter;
pub mod bridge;
pub mod fragment;

use thiserror::Error;

pub use adapter::{AdapterHandle, ChannelAdapter, VirtualAdapter};
pub use bridge::{BridgeStats, TunnelBridge, TunnelConfig};
pub use fragment::{Fragmenter, Reassembler};

#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("packet of {len} bytes exceeds the fragmentable maximum of {max}")]
    PacketTooLarge { len: usize, max: usize },

    #[error("session payload of {0} bytes cannot carry a fragment")]
    PayloadTooSmall(usize),

    #[error("malformed fragment: {0}")]
    Malformed(&'static str),

    #[error("virtual adapter error: {0}")]
    Adapter(#[from] std::io::Error),
}
