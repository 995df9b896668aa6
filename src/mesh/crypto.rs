/**
 * mesh/crypto.rs
 *
 * Network key derivation and per-direction frame ciphers
 */

use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::{AeadInPlace, KeyInit};
use aes_gcm::Aes256Gcm;
use argon2::{Algorithm, Argon2, Params, Version};
use std::fmt;
use thiserror::Error;
use zeroize::Zeroizing;

use crate::mesh::frame::{FrameError, FrameHeader, FrameType, RawFrame, FRAME_OVERHEAD, HEADER_LEN, TAG_LEN};

const PUNCH_CONTEXT: &str = "meshlink 2024 hole punch tag key";
const DIRECTION_CONTEXT: &str = "meshlink 2024 frame direction key";
const SALT_CONTEXT: &[u8] = b"meshlink network salt/";
const FINGERPRINT_CONTEXT: &str = "meshlink 2024 key fingerprint";

#[derive(Debug, Error)]
pub enum KeyError {
    #[error("invalid key derivation parameters: {0}")]
    Params(String),

    #[error("key derivation failed: {0}")]
    Derivation(String),
}

/// Argon2id cost parameters. Both peers must use the same values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KdfParams {
    pub memory_kib: u32,
    pub iterations: u32,
    pub parallelism: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            memory_kib: 19_456,
            iterations: 2,
            parallelism: 1,
        }
    }
}

/// Symmetric secret shared by every member of a network.
///
/// Derived locally from the passphrase and the network name; never
/// serialized, logged or sent to a peer.
#[derive(Clone)]
pub struct NetworkKey {
    key: Zeroizing<[u8; 32]>,
}

impl NetworkKey {
    /// Argon2id(passphrase, salt = BLAKE3(network name)[..16])
    pub fn derive(network: &str, passphrase: &str, params: &KdfParams) -> Result<Self, KeyError> {
        let params = Params::new(params.memory_kib, params.iterations, params.parallelism, Some(32))
            .map_err(|e| KeyError::Params(e.to_string()))?;
        let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

        let salt = blake3::Hasher::new()
            .update(SALT_CONTEXT)
            .update(network.as_bytes())
            .finalize();

        let mut key = Zeroizing::new([0u8; 32]);
        argon2
            .hash_password_into(passphrase.as_bytes(), &salt.as_bytes()[..16], key.as_mut())
            .map_err(|e| KeyError::Derivation(e.to_string()))?;

        Ok(Self { key })
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self {
            key: Zeroizing::new(bytes),
        }
    }

    /// Short hex tag peers can compare out of band to check they typed
    /// the same passphrase. Reveals nothing usable about the key.
    pub fn fingerprint(&self) -> String {
        hex::encode(&blake3::derive_key(FINGERPRINT_CONTEXT, self.key.as_ref())[..4])
    }

    /// Key for hole-punch probe tags
    pub fn punch_key(&self) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(blake3::derive_key(PUNCH_CONTEXT, self.key.as_ref()))
    }

    /// Key for frames flowing from the holder of `sender_nonce` to the
    /// holder of `receiver_nonce`
    pub fn direction_key(&self, sender_nonce: u64, receiver_nonce: u64) -> Zeroizing<[u8; 32]> {
        let mut material = Zeroizing::new([0u8; 48]);
        material[..32].copy_from_slice(self.key.as_ref());
        material[32..40].copy_from_slice(&sender_nonce.to_be_bytes());
        material[40..].copy_from_slice(&receiver_nonce.to_be_bytes());
        Zeroizing::new(blake3::derive_key(DIRECTION_CONTEXT, material.as_ref()))
    }
}

impl fmt::Debug for NetworkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("NetworkKey(<redacted>)")
    }
}

/// AES-256-GCM pair for one session: seals with the local→remote key,
/// opens with the remote→local key
pub struct FrameCipher {
    seal: Aes256Gcm,
    open: Aes256Gcm,
}

impl FrameCipher {
    pub fn new(key: &NetworkKey, local_nonce: u64, remote_nonce: u64) -> Self {
        let tx = key.direction_key(local_nonce, remote_nonce);
        let rx = key.direction_key(remote_nonce, local_nonce);
        Self {
            seal: Aes256Gcm::new(GenericArray::from_slice(tx.as_ref())),
            open: Aes256Gcm::new(GenericArray::from_slice(rx.as_ref())),
        }
    }

    fn nonce(ext_seq: u64) -> [u8; 12] {
        let mut nonce = [0u8; 12];
        nonce[4..].copy_from_slice(&ext_seq.to_be_bytes());
        nonce
    }

    /// Build a complete frame. `ext_seq` is the sender's 64-bit counter;
    /// its low 32 bits go on the wire.
    pub fn seal(&self, frame_type: FrameType, ext_seq: u64, payload: &[u8]) -> Result<Vec<u8>, FrameError> {
        let header = FrameHeader::new(frame_type, ext_seq as u32).encode();

        let mut frame = Vec::with_capacity(FRAME_OVERHEAD + payload.len());
        frame.extend_from_slice(&header);
        frame.extend_from_slice(&[0u8; TAG_LEN]);
        frame.extend_from_slice(payload);

        let nonce = Self::nonce(ext_seq);
        let tag = self
            .seal
            .encrypt_in_place_detached(GenericArray::from_slice(&nonce), &header, &mut frame[FRAME_OVERHEAD..])
            .map_err(|_| FrameError::Encryption)?;
        frame[HEADER_LEN..FRAME_OVERHEAD].copy_from_slice(&tag);

        Ok(frame)
    }

    /// Authenticate and decrypt a parsed frame whose sequence number has
    /// already been extended to `ext_seq`
    pub fn open(&self, frame: &RawFrame<'_>, ext_seq: u64) -> Result<Vec<u8>, FrameError> {
        let mut plaintext = frame.ciphertext.to_vec();
        let nonce = Self::nonce(ext_seq);
        self.open
            .decrypt_in_place_detached(
                GenericArray::from_slice(&nonce),
                frame.header_bytes,
                &mut plaintext,
                GenericArray::from_slice(frame.tag),
            )
            .map_err(|_| FrameError::Authentication)?;
        Ok(plaintext)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cheap() -> KdfParams {
        KdfParams {
            memory_kib: 64,
            iterations: 1,
            parallelism: 1,
        }
    }

    #[test]
    fn same_inputs_converge() {
        let a = NetworkKey::derive("lan-party", "hunter2", &cheap()).unwrap();
        let b = NetworkKey::derive("lan-party", "hunter2", &cheap()).unwrap();
        assert_eq!(*a.punch_key(), *b.punch_key());
    }

    #[test]
    fn network_name_salts_the_key() {
        let a = NetworkKey::derive("lan-party", "hunter2", &cheap()).unwrap();
        let b = NetworkKey::derive("office", "hunter2", &cheap()).unwrap();
        assert_ne!(*a.punch_key(), *b.punch_key());
    }

    #[test]
    fn debug_is_redacted() {
        let key = NetworkKey::from_bytes([0x41; 32]);
        let shown = format!("{:?}", key);
        assert_eq!(shown, "NetworkKey(<redacted>)");
        assert!(!shown.contains("41"));
    }

    #[test]
    fn fingerprint_is_short_and_stable() {
        let key = NetworkKey::from_bytes([0x41; 32]);
        let print = key.fingerprint();
        assert_eq!(print.len(), 8);
        assert_eq!(print, NetworkKey::from_bytes([0x41; 32]).fingerprint());
        assert_ne!(print, NetworkKey::from_bytes([0x42; 32]).fingerprint());
    }

    #[test]
    fn directions_differ() {
        let key = NetworkKey::from_bytes([7; 32]);
        assert_ne!(*key.direction_key(1, 2), *key.direction_key(2, 1));
    }

    #[test]
    fn seal_open_between_peers() {
        let key = NetworkKey::from_bytes([7; 32]);
        let alice = FrameCipher::new(&key, 11, 22);
        let bob = FrameCipher::new(&key, 22, 11);

        let frame = alice.seal(FrameType::Data, 5, b"ping").unwrap();
        assert_eq!(frame.len(), FRAME_OVERHEAD + 4);

        let raw = RawFrame::parse(&frame).unwrap();
        assert_eq!(raw.header.seq, 5);
        assert_eq!(bob.open(&raw, 5).unwrap(), b"ping");

        // Own direction key does not open own frames
        assert!(matches!(alice.open(&raw, 5), Err(FrameError::Authentication)));
    }

    #[test]
    fn header_is_authenticated() {
        let key = NetworkKey::from_bytes([7; 32]);
        let alice = FrameCipher::new(&key, 11, 22);
        let bob = FrameCipher::new(&key, 22, 11);

        let mut frame = alice.seal(FrameType::Data, 5, b"ping").unwrap();
        frame[1] = FrameType::KeepAlive as u8;
        let raw = RawFrame::parse(&frame).unwrap();
        assert!(bob.open(&raw, 5).is_err());
    }

    #[test]
    fn wrong_passphrase_fails_authentication() {
        let good = NetworkKey::derive("net", "right", &cheap()).unwrap();
        let bad = NetworkKey::derive("net", "wrong", &cheap()).unwrap();
        let frame = FrameCipher::new(&good, 1, 2).seal(FrameType::Hello, 0, b"hi").unwrap();
        let raw = RawFrame::parse(&frame).unwrap();
        assert!(FrameCipher::new(&bad, 2, 1).open(&raw, 0).is_err());
    }
}
