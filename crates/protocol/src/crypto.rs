//! Key material and symmetric cryptography for Companion Link.
//!
//! This module provides reconnect challenges, per-device challenge secrets,
//! the out-of-band (OOB) verification key, and the session key produced by a
//! completed handshake.

use std::sync::atomic::{AtomicU64, Ordering};

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;

use crate::error::{ProtocolError, Result};

/// Length of a device id in bytes.
pub const DEVICE_ID_LENGTH: usize = 16;

/// Length of the per-device secret used to answer reconnect challenges.
pub const CHALLENGE_SECRET_LENGTH: usize = 32;

/// Number of random bytes in a reconnect salt.
pub const SALT_LENGTH: usize = 8;

/// Width a salt is zero-padded to before hashing and advertising.
pub const CHALLENGE_BLOCK_SIZE: usize = 16;

/// Length of a ChaCha20-Poly1305 key.
pub const KEY_LENGTH: usize = 32;

/// Length of a ChaCha20-Poly1305 nonce.
pub const NONCE_LENGTH: usize = 12;

/// Authentication tag appended by ChaCha20-Poly1305.
pub const TAG_LENGTH: usize = 16;

/// Size of the counter prefixed to every session ciphertext.
const COUNTER_LENGTH: usize = 8;

type HmacSha256 = Hmac<Sha256>;

/// Computes HMAC-SHA256 of `data` keyed with `key`.
pub fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac =
        <HmacSha256 as Mac>::new_from_slice(key).expect("HMAC accepts keys of any length");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

/// Generates a fresh random challenge secret.
pub fn generate_challenge_secret() -> [u8; CHALLENGE_SECRET_LENGTH] {
    let mut secret = [0u8; CHALLENGE_SECRET_LENGTH];
    OsRng.fill_bytes(&mut secret);
    secret
}

/// Generates random bytes of the given length.
pub fn random_bytes(len: usize) -> Vec<u8> {
    let mut bytes = vec![0u8; len];
    OsRng.fill_bytes(&mut bytes);
    bytes
}

/// Generates a random salt zero-padded to [`CHALLENGE_BLOCK_SIZE`].
pub fn generate_padded_salt() -> Vec<u8> {
    let mut salt = random_bytes(SALT_LENGTH);
    salt.resize(CHALLENGE_BLOCK_SIZE, 0);
    salt
}

/// A reconnect challenge advertised to a known device.
///
/// The device proves it holds the shared secret by answering with the same
/// `challenge` computed over the advertised `salt`.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectChallenge {
    /// `HMAC(secret, salt)`.
    pub challenge: Vec<u8>,
    /// Random salt, zero-padded to the advertisement width.
    pub salt: Vec<u8>,
}

impl std::fmt::Debug for ConnectChallenge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectChallenge")
            .field("challenge_len", &self.challenge.len())
            .field("salt", &self.salt)
            .finish()
    }
}

/// Which end of an OOB exchange is sealing or opening a code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OobSide {
    /// The head unit.
    Host,
    /// The mobile device.
    Device,
}

/// Side-channel key used to exchange verification codes.
///
/// The host generates it when association starts and hands it to the
/// device out of band. Each side seals its own code with its own nonce, so
/// a sealed code can never be reflected back as the peer's.
#[derive(Clone, PartialEq, Eq)]
pub struct OobKey {
    key: [u8; KEY_LENGTH],
    host_nonce: [u8; NONCE_LENGTH],
    device_nonce: [u8; NONCE_LENGTH],
}

impl OobKey {
    /// Encoded length of the OOB data handed to the device.
    pub const ENCODED_LENGTH: usize = KEY_LENGTH + 2 * NONCE_LENGTH;

    /// Generates a random OOB key with distinct nonces.
    pub fn generate() -> Self {
        let mut key = [0u8; KEY_LENGTH];
        let mut host_nonce = [0u8; NONCE_LENGTH];
        let mut device_nonce = [0u8; NONCE_LENGTH];
        OsRng.fill_bytes(&mut key);
        OsRng.fill_bytes(&mut host_nonce);
        loop {
            OsRng.fill_bytes(&mut device_nonce);
            if device_nonce != host_nonce {
                break;
            }
        }
        Self {
            key,
            host_nonce,
            device_nonce,
        }
    }

    /// Encodes as `key || host_nonce || device_nonce`.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::ENCODED_LENGTH);
        out.extend_from_slice(&self.key);
        out.extend_from_slice(&self.host_nonce);
        out.extend_from_slice(&self.device_nonce);
        out
    }

    /// Decodes OOB data produced by [`OobKey::to_bytes`].
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != Self::ENCODED_LENGTH {
            return Err(ProtocolError::Deserialization(format!(
                "invalid OOB data length: expected {}, got {}",
                Self::ENCODED_LENGTH,
                bytes.len()
            )));
        }
        let mut key = [0u8; KEY_LENGTH];
        let mut host_nonce = [0u8; NONCE_LENGTH];
        let mut device_nonce = [0u8; NONCE_LENGTH];
        key.copy_from_slice(&bytes[..KEY_LENGTH]);
        host_nonce.copy_from_slice(&bytes[KEY_LENGTH..KEY_LENGTH + NONCE_LENGTH]);
        device_nonce.copy_from_slice(&bytes[KEY_LENGTH + NONCE_LENGTH..]);
        Ok(Self {
            key,
            host_nonce,
            device_nonce,
        })
    }

    fn nonce(&self, side: OobSide) -> &[u8; NONCE_LENGTH] {
        match side {
            OobSide::Host => &self.host_nonce,
            OobSide::Device => &self.device_nonce,
        }
    }

    fn cipher(&self) -> ChaCha20Poly1305 {
        ChaCha20Poly1305::new(Key::from_slice(&self.key))
    }

    /// Encrypts a verification code as `side`.
    pub fn seal(&self, side: OobSide, code: &[u8]) -> Result<Vec<u8>> {
        self.cipher()
            .encrypt(Nonce::from_slice(self.nonce(side)), code)
            .map_err(|_| ProtocolError::Encryption("failed to seal OOB verification code".into()))
    }

    /// Decrypts a verification code sealed by `side`.
    pub fn open(&self, side: OobSide, sealed: &[u8]) -> Result<Vec<u8>> {
        Ok(self
            .cipher()
            .decrypt(Nonce::from_slice(self.nonce(side)), sealed)?)
    }
}

impl std::fmt::Debug for OobKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OobKey")
            .field("key", &"[REDACTED]")
            .finish()
    }
}

/// Symmetric key for an established secure channel.
///
/// Holds one cipher per direction. Every ciphertext is prefixed with the
/// 8-byte big-endian counter used to build its nonce, so messages may be
/// decrypted in any order (for example when they arrive over different
/// transports).
pub struct SessionKey {
    send: ChaCha20Poly1305,
    receive: ChaCha20Poly1305,
    send_counter: AtomicU64,
}

impl SessionKey {
    /// Creates a session key from raw per-direction keys.
    pub fn new(send_key: &[u8; KEY_LENGTH], receive_key: &[u8; KEY_LENGTH]) -> Self {
        Self {
            send: ChaCha20Poly1305::new(Key::from_slice(send_key)),
            receive: ChaCha20Poly1305::new(Key::from_slice(receive_key)),
            send_counter: AtomicU64::new(0),
        }
    }

    fn nonce_for(counter: u64) -> [u8; NONCE_LENGTH] {
        let mut nonce = [0u8; NONCE_LENGTH];
        nonce[NONCE_LENGTH - COUNTER_LENGTH..].copy_from_slice(&counter.to_be_bytes());
        nonce
    }

    /// Encrypts a plaintext for the peer.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let counter = self.send_counter.fetch_add(1, Ordering::Relaxed);
        if counter == u64::MAX {
            return Err(ProtocolError::Encryption("nonce space exhausted".into()));
        }
        let ciphertext = self
            .send
            .encrypt(Nonce::from_slice(&Self::nonce_for(counter)), plaintext)
            .map_err(|_| ProtocolError::Encryption("failed to encrypt message".into()))?;

        let mut output = Vec::with_capacity(COUNTER_LENGTH + ciphertext.len());
        output.extend_from_slice(&counter.to_be_bytes());
        output.extend_from_slice(&ciphertext);
        Ok(output)
    }

    /// Decrypts a ciphertext produced by the peer's [`SessionKey::encrypt`].
    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        if data.len() < COUNTER_LENGTH + TAG_LENGTH {
            return Err(ProtocolError::Decryption(format!(
                "ciphertext too short: {} bytes",
                data.len()
            )));
        }
        let mut counter = [0u8; COUNTER_LENGTH];
        counter.copy_from_slice(&data[..COUNTER_LENGTH]);
        let nonce = Self::nonce_for(u64::from_be_bytes(counter));
        Ok(self
            .receive
            .decrypt(Nonce::from_slice(&nonce), &data[COUNTER_LENGTH..])?)
    }
}

impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionKey")
            .field("keys", &"[REDACTED]")
            .field("sent", &self.send_counter.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key_pair() -> (SessionKey, SessionKey) {
        let a = [1u8; KEY_LENGTH];
        let b = [2u8; KEY_LENGTH];
        (SessionKey::new(&a, &b), SessionKey::new(&b, &a))
    }

    #[test]
    fn test_padded_salt_layout() {
        let salt = generate_padded_salt();
        assert_eq!(salt.len(), CHALLENGE_BLOCK_SIZE);
        assert!(salt[SALT_LENGTH..].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_hmac_is_deterministic_and_keyed() {
        let first = hmac_sha256(b"secret", b"salt");
        assert_eq!(first, hmac_sha256(b"secret", b"salt"));
        assert_ne!(first, hmac_sha256(b"other", b"salt"));
        assert_eq!(first.len(), 32);
    }

    #[test]
    fn test_session_key_roundtrip() {
        let (host, device) = key_pair();
        let ciphertext = host.encrypt(b"hello device").unwrap();
        assert_eq!(device.decrypt(&ciphertext).unwrap(), b"hello device");

        let reply = device.encrypt(b"hello host").unwrap();
        assert_eq!(host.decrypt(&reply).unwrap(), b"hello host");
    }

    #[test]
    fn test_session_key_out_of_order() {
        let (host, device) = key_pair();
        let first = host.encrypt(b"one").unwrap();
        let second = host.encrypt(b"two").unwrap();
        assert_eq!(device.decrypt(&second).unwrap(), b"two");
        assert_eq!(device.decrypt(&first).unwrap(), b"one");
    }

    #[test]
    fn test_session_key_rejects_own_direction() {
        let (host, _) = key_pair();
        let ciphertext = host.encrypt(b"loop").unwrap();
        assert!(host.decrypt(&ciphertext).is_err());
    }

    #[test]
    fn test_session_key_rejects_tampering() {
        let (host, device) = key_pair();
        let mut ciphertext = host.encrypt(b"payload").unwrap();
        let last = ciphertext.len() - 1;
        ciphertext[last] ^= 0x01;
        assert!(device.decrypt(&ciphertext).is_err());
        assert!(device.decrypt(&[0u8; 4]).is_err());
    }

    #[test]
    fn test_oob_key_exchange() {
        let host_key = OobKey::generate();
        let device_key = OobKey::from_bytes(&host_key.to_bytes()).unwrap();
        let code = [42u8; 32];

        let sealed_by_device = device_key.seal(OobSide::Device, &code).unwrap();
        assert_eq!(host_key.open(OobSide::Device, &sealed_by_device).unwrap(), code);

        let sealed_by_host = host_key.seal(OobSide::Host, &code).unwrap();
        assert_ne!(sealed_by_host, sealed_by_device);
        assert!(host_key.open(OobSide::Device, &sealed_by_host).is_err());
    }

    #[test]
    fn test_oob_key_rejects_bad_length() {
        assert!(OobKey::from_bytes(&[0u8; 10]).is_err());
    }

    #[test]
    fn test_debug_redacts_keys() {
        let debug = format!("{:?}", OobKey::generate());
        assert!(debug.contains("REDACTED"));
    }
}
