/**
 * mesh/frame.rs
 *
 * Session frame layout and the Hello payload
 *
 *   version(1) | type(1) | seq(4) | tag(16) | ciphertext
 */

use std::net::Ipv4Addr;
use thiserror::Error;

pub const FRAME_VERSION: u8 = 1;
pub const HEADER_LEN: usize = 6;
pub const TAG_LEN: usize = 16;
pub const FRAME_OVERHEAD: usize = HEADER_LEN + TAG_LEN;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame too short: {0} bytes")]
    TooShort(usize),

    #[error("unsupported frame version {0}")]
    UnsupportedVersion(u8),

    #[error("unknown frame type {0}")]
    UnknownType(u8),

    #[error("frame failed authentication")]
    Authentication,

    #[error("frame encryption failed")]
    Encryption,

    #[error("malformed hello: {0}")]
    MalformedHello(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    Hello = 1,
    KeepAlive = 2,
    Data = 3,
    Close = 4,
}

impl TryFrom<u8> for FrameType {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(FrameType::Hello),
            2 => Ok(FrameType::KeepAlive),
            3 => Ok(FrameType::Data),
            4 => Ok(FrameType::Close),
            other => Err(FrameError::UnknownType(other)),
        }
    }
}

/// Cleartext frame header, used as AEAD associated data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub version: u8,
    pub frame_type: FrameType,
    pub seq: u32,
}

impl FrameHeader {
    pub fn new(frame_type: FrameType, seq: u32) -> Self {
        Self {
            version: FRAME_VERSION,
            frame_type,
            seq,
        }
    }

    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut bytes = [0u8; HEADER_LEN];
        bytes[0] = self.version;
        bytes[1] = self.frame_type as u8;
        bytes[2..].copy_from_slice(&self.seq.to_be_bytes());
        bytes
    }
}

/// A frame split into its parts, borrowed from the receive buffer
#[derive(Debug)]
pub struct RawFrame<'a> {
    pub header: FrameHeader,
    pub header_bytes: &'a [u8],
    pub tag: &'a [u8],
    pub ciphertext: &'a [u8],
}

impl<'a> RawFrame<'a> {
    pub fn parse(data: &'a [u8]) -> Result<Self, FrameError> {
        if data.len() < FRAME_OVERHEAD {
            return Err(FrameError::TooShort(data.len()));
        }
        if data[0] != FRAME_VERSION {
            return Err(FrameError::UnsupportedVersion(data[0]));
        }

        let frame_type = FrameType::try_from(data[1])?;
        let seq = u32::from_be_bytes([data[2], data[3], data[4], data[5]]);

        Ok(Self {
            header: FrameHeader {
                version: data[0],
                frame_type,
                seq,
            },
            header_bytes: &data[..HEADER_LEN],
            tag: &data[HEADER_LEN..FRAME_OVERHEAD],
            ciphertext: &data[FRAME_OVERHEAD..],
        })
    }
}

/// Handshake payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hello {
    pub peer_id: String,
    pub virtual_ip: Ipv4Addr,
    pub sender_nonce: u64,
    pub receiver_nonce: u64,
    /// The sender has already authenticated a frame from us
    pub ack: bool,
}

impl Hello {
    /// Serialize to bytes
    pub fn to_bytes(&self) -> Vec<u8> {
        let id = self.peer_id.as_bytes();
        let id_len = id.len().min(u8::MAX as usize);

        let mut bytes = Vec::with_capacity(22 + id_len);

        // Session nonces (8 + 8 bytes)
        bytes.extend_from_slice(&self.sender_nonce.to_be_bytes());
        bytes.extend_from_slice(&self.receiver_nonce.to_be_bytes());

        // Virtual IPv4 address (4 bytes)
        bytes.extend_from_slice(&self.virtual_ip.octets());

        // Ack flag (1 byte)
        bytes.push(u8::from(self.ack));

        // Peer id, length-prefixed
        bytes.push(id_len as u8);
        bytes.extend_from_slice(&id[..id_len]);

        bytes
    }

    /// Deserialize from bytes
    pub fn from_bytes(data: &[u8]) -> Result<Self, FrameError> {
        if data.len() < 22 {
            return Err(FrameError::MalformedHello("too short"));
        }

        let sender_nonce = u64::from_be_bytes(
            data[0..8]
                .try_into()
                .map_err(|_| FrameError::MalformedHello("sender nonce"))?,
        );
        let receiver_nonce = u64::from_be_bytes(
            data[8..16]
                .try_into()
                .map_err(|_| FrameError::MalformedHello("receiver nonce"))?,
        );
        let virtual_ip = Ipv4Addr::new(data[16], data[17], data[18], data[19]);

        let ack = match data[20] {
            0 => false,
            1 => true,
            _ => return Err(FrameError::MalformedHello("ack flag")),
        };

        let id_len = data[21] as usize;
        if data.len() != 22 + id_len {
            return Err(FrameError::MalformedHello("peer id length"));
        }
        let peer_id = std::str::from_utf8(&data[22..])
            .map_err(|_| FrameError::MalformedHello("peer id is not utf-8"))?
            .to_string();

        Ok(Self {
            peer_id,
            virtual_ip,
            sender_nonce,
            receiver_nonce,
            ack,
        })
    }
}
