/**
 * tunnel/fragment.rs
 *
 * Packet encapsulation, fragmentation and reassembly
 *
 *   proto(1) | packet_id(4) | index(1) | count(1) | len(2) | bytes
 */

use bytes::{BufMut, Bytes, BytesMut};
use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::tunnel::TunnelError;

pub const TUNNEL_HEADER_LEN: usize = 9;

/// Protocol tags
pub const PROTO_RAW: u8 = 0;
pub const PROTO_IPV4: u8 = 4;
pub const PROTO_IPV6: u8 = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentHeader {
    pub proto: u8,
    pub packet_id: u32,
    pub index: u8,
    pub count: u8,
    pub len: u16,
}

impl FragmentHeader {
    pub fn parse(data: &[u8]) -> Result<(Self, &[u8]), TunnelError> {
        if data.len() < TUNNEL_HEADER_LEN {
            return Err(TunnelError::Malformed("fragment shorter than header"));
        }

        let header = Self {
            proto: data[0],
            packet_id: u32::from_be_bytes([data[1], data[2], data[3], data[4]]),
            index: data[5],
            count: data[6],
            len: u16::from_be_bytes([data[7], data[8]]),
        };

        let body = &data[TUNNEL_HEADER_LEN..];
        if body.len() != header.len as usize {
            return Err(TunnelError::Malformed("fragment length mismatch"));
        }
        if header.count == 0 || header.index >= header.count {
            return Err(TunnelError::Malformed("fragment index out of range"));
        }
        Ok((header, body))
    }

    fn write(&self, buf: &mut BytesMut) {
        buf.put_u8(self.proto);
        buf.put_u32(self.packet_id);
        buf.put_u8(self.index);
        buf.put_u8(self.count);
        buf.put_u16(self.len);
    }
}

/// Protocol tag from the IP version nibble
pub fn protocol_of(packet: &[u8]) -> u8 {
    match packet.first().map(|b| b >> 4) {
        Some(4) => PROTO_IPV4,
        Some(6) => PROTO_IPV6,
        _ => PROTO_RAW,
    }
}

/// Splits packets into session payloads
pub struct Fragmenter {
    next_id: u32,
    chunk: usize,
}

impl Fragmenter {
    /// `max_payload` is the largest session payload
    pub fn new(max_payload: usize) -> Result<Self, TunnelError> {
        let chunk = max_payload
            .checked_sub(TUNNEL_HEADER_LEN)
            .filter(|c| *c > 0)
            .ok_or(TunnelError::PayloadTooSmall(max_payload))?;
        Ok(Self {
            next_id: rand::random(),
            chunk: chunk.min(u16::MAX as usize),
        })
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk
    }

    pub fn max_packet(&self) -> usize {
        self.chunk * u8::MAX as usize
    }

    pub fn split(&mut self, packet: &[u8]) -> Result<Vec<Bytes>, TunnelError> {
        if packet.len() > self.max_packet() {
            return Err(TunnelError::PacketTooLarge {
                len: packet.len(),
                max: self.max_packet(),
            });
        }

        let packet_id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);
        let proto = protocol_of(packet);

        let chunks: Vec<&[u8]> = if packet.is_empty() {
            vec![packet]
        } else {
            packet.chunks(self.chunk).collect()
        };
        let count = chunks.len() as u8;

        Ok(chunks
            .into_iter()
            .enumerate()
            .map(|(index, chunk)| {
                let mut buf = BytesMut::with_capacity(TUNNEL_HEADER_LEN + chunk.len());
                FragmentHeader {
                    proto,
                    packet_id,
                    index: index as u8,
                    count,
                    len: chunk.len() as u16,
                }
                .write(&mut buf);
                buf.put_slice(chunk);
                buf.freeze()
            })
            .collect())
    }
}

struct Partial {
    proto: u8,
    fragments: Vec<Option<Bytes>>,
    received: usize,
    first_seen: Instant,
}

/// Reassembled packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub proto: u8,
    pub data: Bytes,
}

/// Collects fragments by packet id. Bounded in both time and count.
pub struct Reassembler {
    timeout: Duration,
    max_open: usize,
    open: HashMap<u32, Partial>,
    evicted: u64,
}

impl Reassembler {
    pub fn new(timeout: Duration, max_open: usize) -> Self {
        Self {
            timeout,
            max_open: max_open.max(1),
            open: HashMap::new(),
            evicted: 0,
        }
    }

    pub fn open_count(&self) -> usize {
        self.open.len()
    }

    /// Partial packets pushed out to make room
    pub fn evicted(&self) -> u64 {
        self.evicted
    }

    pub fn push(&mut self, data: &[u8], now: Instant) -> Result<Option<Packet>, TunnelError> {
        let (header, body) = FragmentHeader::parse(data)?;

        if header.count == 1 {
            return Ok(Some(Packet {
                proto: header.proto,
                data: Bytes::copy_from_slice(body),
            }));
        }

        if !self.open.contains_key(&header.packet_id) && self.open.len() >= self.max_open {
            self.evict_oldest();
        }

        let partial = self.open.entry(header.packet_id).or_insert_with(|| Partial {
            proto: header.proto,
            fragments: vec![None; header.count as usize],
            received: 0,
            first_seen: now,
        });

        if partial.fragments.len() != header.count as usize || partial.proto != header.proto {
            self.open.remove(&header.packet_id);
            return Err(TunnelError::Malformed("fragment disagrees with its packet"));
        }

        let slot = &mut partial.fragments[header.index as usize];
        if slot.is_some() {
            return Ok(None);
        }
        *slot = Some(Bytes::copy_from_slice(body));
        partial.received += 1;

        if partial.received < partial.fragments.len() {
            return Ok(None);
        }

        let Some(partial) = self.open.remove(&header.packet_id) else {
            return Ok(None);
        };
        let mut packet = BytesMut::new();
        for fragment in partial.fragments.into_iter().flatten() {
            packet.put_slice(&fragment);
        }
        Ok(Some(Packet {
            proto: partial.proto,
            data: packet.freeze(),
        }))
    }

    /// Drop partial packets older than the timeout; returns how many
    pub fn expire(&mut self, now: Instant) -> usize {
        let before = self.open.len();
        let timeout = self.timeout;
        self.open
            .retain(|_, p| now.saturating_duration_since(p.first_seen) < timeout);
        before - self.open.len()
    }

    fn evict_oldest(&mut self) {
        let oldest = self
            .open
            .iter()
            .min_by_key(|(_, p)| p.first_seen)
            .map(|(id, _)| *id);
        if let Some(id) = oldest {
            self.open.remove(&id);
            self.evicted += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn ipv4_packet(len: usize) -> Vec<u8> {
        let mut packet: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        if let Some(first) = packet.first_mut() {
            *first = 0x45;
        }
        packet
    }

    #[test]
    fn small_packet_is_one_fragment() {
        let mut f = Fragmenter::new(1378).unwrap();
        let mut r = Reassembler::new(Duration::from_secs(5), 8);
        let packet = ipv4_packet(60);

        let frags = f.split(&packet).unwrap();
        assert_eq!(frags.len(), 1);
        assert_eq!(frags[0].len(), TUNNEL_HEADER_LEN + 60);
        assert_eq!(frags[0][0], PROTO_IPV4);

        let out = r.push(&frags[0], Instant::now()).unwrap().unwrap();
        assert_eq!(out.data, packet);
        assert_eq!(out.proto, PROTO_IPV4);
    }

    #[test]
    fn header_layout() {
        let mut f = Fragmenter::new(100).unwrap();
        let frags = f.split(&[0x60; 200]).unwrap();
        assert_eq!(frags.len(), 3);
        let (header, body) = FragmentHeader::parse(&frags[2]).unwrap();
        assert_eq!(header.proto, PROTO_IPV6);
        assert_eq!(header.index, 2);
        assert_eq!(header.count, 3);
        assert_eq!(header.len as usize, 200 - 2 * 91);
        assert_eq!(body.len(), header.len as usize);
    }

    #[test]
    fn rejects_oversized_and_bad_fragments() {
        let mut f = Fragmenter::new(20).unwrap();
        assert!(matches!(
            f.split(&vec![0u8; 11 * 255 + 1]),
            Err(TunnelError::PacketTooLarge { .. })
        ));
        assert!(Fragmenter::new(9).is_err());

        let mut r = Reassembler::new(Duration::from_secs(5), 8);
        assert!(r.push(&[0u8; 4], Instant::now()).is_err());
        // index >= count
        assert!(r.push(&[4, 0, 0, 0, 1, 3, 3, 0, 0], Instant::now()).is_err());
    }

    #[test]
    fn incomplete_set_expires() {
        let mut f = Fragmenter::new(100).unwrap();
        let mut r = Reassembler::new(Duration::from_secs(5), 8);
        let t0 = Instant::now();

        let frags = f.split(&ipv4_packet(500)).unwrap();
        for frag in &frags[1..] {
            assert!(r.push(frag, t0).unwrap().is_none());
        }
        assert_eq!(r.open_count(), 1);
        assert_eq!(r.expire(t0 + Duration::from_secs(4)), 0);
        assert_eq!(r.expire(t0 + Duration::from_secs(5)), 1);
        assert_eq!(r.open_count(), 0);
    }

    #[test]
    fn open_reassemblies_are_bounded() {
        let mut f = Fragmenter::new(100).unwrap();
        let mut r = Reassembler::new(Duration::from_secs(5), 4);
        let t0 = Instant::now();

        for i in 0..10u64 {
            let frags = f.split(&ipv4_packet(300)).unwrap();
            r.push(&frags[0], t0 + Duration::from_millis(i)).unwrap();
        }
        assert_eq!(r.open_count(), 4);
        assert_eq!(r.evicted(), 6);
    }

    #[test]
    fn duplicate_fragment_is_ignored() {
        let mut f = Fragmenter::new(100).unwrap();
        let mut r = Reassembler::new(Duration::from_secs(5), 8);
        let packet = ipv4_packet(150);
        let frags = f.split(&packet).unwrap();
        let now = Instant::now();

        assert!(r.push(&frags[0], now).unwrap().is_none());
        assert!(r.push(&frags[0], now).unwrap().is_none());
        assert_eq!(r.push(&frags[1], now).unwrap().unwrap().data, packet);
    }

    proptest! {
        #[test]
        fn out_of_order_reassembly_is_byte_identical(
            len in 0usize..6000,
            max_payload in 40usize..1400,
            seed in any::<u64>(),
        ) {
            let mut f = Fragmenter::new(max_payload).unwrap();
            let mut r = Reassembler::new(Duration::from_secs(5), 8);
            let packet = ipv4_packet(len);

            let mut frags = f.split(&packet).unwrap();
            for frag in &frags {
                prop_assert!(frag.len() <= max_payload);
            }

            // Deterministic shuffle
            let n = frags.len();
            for i in (1..n).rev() {
                let j = (seed.wrapping_mul(i as u64 + 7) % (i as u64 + 1)) as usize;
                frags.swap(i, j);
            }

            let now = Instant::now();
            let mut out = None;
            for frag in &frags {
                if let Some(p) = r.push(frag, now).unwrap() {
                    prop_assert!(out.is_none());
                    out = Some(p);
                }
            }
            let out = out.unwrap();
            prop_assert_eq!(out.data.as_ref(), packet.as_slice());
            prop_assert_eq!(r.open_count(), 0);
        }
    }
}
