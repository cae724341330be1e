//! Noise protocol handshake used to agree on a session key.
//!
//! Association uses the Noise NN pattern. Neither side has a long-term key;
//! instead both derive a verification code from the handshake transcript
//! hash, and the code is confirmed either visually by the user or through
//! an out-of-band key (see [`crate::crypto::OobKey`]).
//!
//! Reconnects use NNpsk0. The pre-shared key is derived from the device's
//! challenge secret, so only the associated device can complete it and no
//! code has to be confirmed.
//!
//! ## Patterns
//! ```text
//! NN:        -> e           NNpsk0:  -> psk, e
//!            <- e, ee                <- e, ee
//! ```
//!
//! The mobile device is the initiator; the host is the responder.

use snow::{Builder, HandshakeState};

use crate::crypto::SessionKey;
use crate::error::{ProtocolError, Result};

/// The Noise protocol pattern used for handshakes.
///
/// We use Noise_NN_25519_ChaChaPoly_BLAKE2s:
/// - NN: Anonymous key agreement, authenticated afterwards by code confirmation
/// - 25519: Curve25519 for DH key exchange
/// - ChaChaPoly: ChaCha20-Poly1305 for AEAD
/// - BLAKE2s: BLAKE2s for hashing
const NOISE_PATTERN: &str = "Noise_NN_25519_ChaChaPoly_BLAKE2s";

/// Pattern used when reconnecting an associated device.
const RECONNECT_NOISE_PATTERN: &str = "Noise_NNpsk0_25519_ChaChaPoly_BLAKE2s";

/// Length of a reconnect pre-shared key.
pub const RECONNECT_KEY_LENGTH: usize = 32;

/// Maximum size for a Noise protocol message.
pub const MAX_NOISE_MESSAGE_SIZE: usize = 65535;

/// Number of digits in a visual verification code.
pub const VISUAL_CODE_DIGITS: usize = 6;

/// State of the Noise handshake process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakePhase {
    /// Initiator: Ready to send first message (-> e)
    InitiatorStart,
    /// Initiator: Waiting for response (<- e, ee)
    InitiatorWaitingForResponse,
    /// Responder: Waiting for first message (-> e)
    ResponderStart,
    /// Responder: Ready to send response (<- e, ee)
    ResponderSendResponse,
    /// Handshake complete, key can be derived
    Complete,
}

/// Role in the Noise handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Initiates the handshake (mobile device)
    Initiator,
    /// Responds to the handshake (host)
    Responder,
}

/// Pre-shared key mixed into a reconnect handshake.
///
/// Both sides compute it as `HMAC(challenge_secret, challenge || device_challenge)`.
#[derive(Clone, PartialEq, Eq)]
pub struct ReconnectKey([u8; RECONNECT_KEY_LENGTH]);

impl ReconnectKey {
    /// Wraps key material, which must be exactly [`RECONNECT_KEY_LENGTH`] bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let key: [u8; RECONNECT_KEY_LENGTH] = bytes.try_into().map_err(|_| {
            ProtocolError::HandshakeFailed(format!(
                "reconnect key must be {} bytes, got {}",
                RECONNECT_KEY_LENGTH,
                bytes.len()
            ))
        })?;
        Ok(Self(key))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Debug for ReconnectKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ReconnectKey([REDACTED])")
    }
}

/// A handshake engine consuming and producing raw handshake messages.
///
/// Implementations are fed every HANDSHAKE payload the peer sends and
/// produce the replies; once complete they expose the verification code and
/// the derived [`SessionKey`].
pub trait SecureHandshake: Send {
    /// Writes the next handshake message.
    ///
    /// Returns `None` if it is not this side's turn to write.
    fn write_message(&mut self, payload: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Reads a handshake message from the peer.
    ///
    /// Returns the payload included in the message, if any.
    fn read_message(&mut self, message: &[u8]) -> Result<Vec<u8>>;

    /// Returns whether the handshake is complete.
    fn is_complete(&self) -> bool;

    /// Returns whether the handshake is keyed for a reconnect, in which case
    /// completing it already authenticates the peer.
    fn is_reconnect(&self) -> bool;

    /// Returns the verification code both sides derive from the transcript.
    fn verification_code(&self) -> Result<Vec<u8>>;

    /// Derives the session key. Only valid once the handshake is complete.
    fn session_key(&mut self) -> Result<SessionKey>;
}

/// A Noise protocol handshake session.
///
/// `NoiseSession` manages the state machine for the Noise NN handshake
/// pattern and derives the session key after completion.
///
/// ## Usage
///
/// ```
/// use companion_protocol::noise::NoiseSession;
///
/// let mut device = NoiseSession::new_initiator().unwrap();
/// let mut host = NoiseSession::new_responder().unwrap();
///
/// let msg1 = device.write_handshake_message(&[]).unwrap();
/// host.read_handshake_message(&msg1).unwrap();
/// let msg2 = host.write_handshake_message(&[]).unwrap();
/// device.read_handshake_message(&msg2).unwrap();
///
/// assert_eq!(
///     device.handshake_hash().unwrap(),
///     host.handshake_hash().unwrap()
/// );
/// ```
pub struct NoiseSession {
    /// The handshake state (taken once keys are derived)
    handshake: Option<HandshakeState>,
    /// Current phase of the handshake
    phase: HandshakePhase,
    /// Role in the handshake (initiator or responder)
    role: Role,
    /// Whether the reconnect pre-shared key is mixed in
    reconnect: bool,
    /// Buffer for handshake operations
    buffer: Vec<u8>,
}

impl NoiseSession {
    /// Creates a new Noise session as the initiator (mobile device).
    pub fn new_initiator() -> Result<Self> {
        Self::build(Self::builder(NOISE_PATTERN)?, Role::Initiator, false)
    }

    /// Creates a new Noise session as the responder (host).
    pub fn new_responder() -> Result<Self> {
        Self::build(Self::builder(NOISE_PATTERN)?, Role::Responder, false)
    }

    /// Creates a reconnect session keyed with `key`.
    ///
    /// A peer holding a different key fails on the first handshake message.
    pub fn reconnect(role: Role, key: &ReconnectKey) -> Result<Self> {
        let builder = Self::builder(RECONNECT_NOISE_PATTERN)?.psk(0, key.as_bytes());
        Self::build(builder, role, true)
    }

    fn builder<'a>(pattern: &str) -> Result<Builder<'a>> {
        let params = pattern
            .parse()
            .map_err(|e| ProtocolError::HandshakeFailed(format!("invalid noise pattern: {}", e)))?;
        Ok(Builder::new(params))
    }

    fn build(builder: Builder<'_>, role: Role, reconnect: bool) -> Result<Self> {
        let (handshake, phase) = match role {
            Role::Initiator => (builder.build_initiator(), HandshakePhase::InitiatorStart),
            Role::Responder => (builder.build_responder(), HandshakePhase::ResponderStart),
        };
        let handshake = handshake.map_err(|e| {
            ProtocolError::HandshakeFailed(format!("failed to build {:?}: {}", role, e))
        })?;

        Ok(Self {
            handshake: Some(handshake),
            phase,
            role,
            reconnect,
            buffer: vec![0u8; MAX_NOISE_MESSAGE_SIZE],
        })
    }

    /// Returns the current handshake phase.
    pub fn phase(&self) -> HandshakePhase {
        self.phase
    }

    /// Returns the role in the handshake.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Returns whether this is a reconnect session.
    pub fn is_reconnect(&self) -> bool {
        self.reconnect
    }

    /// Returns whether the handshake is complete.
    pub fn is_handshake_complete(&self) -> bool {
        self.phase == HandshakePhase::Complete
    }

    /// Writes a handshake message.
    ///
    /// Returns the handshake message to send to the peer.
    pub fn write_handshake_message(&mut self, payload: &[u8]) -> Result<Vec<u8>> {
        let handshake = self
            .handshake
            .as_mut()
            .ok_or(ProtocolError::HandshakeIncomplete)?;

        // Verify we're in a state where we can write
        let next = match (self.role, self.phase) {
            (Role::Initiator, HandshakePhase::InitiatorStart) => {
                HandshakePhase::InitiatorWaitingForResponse
            }
            (Role::Responder, HandshakePhase::ResponderSendResponse) => HandshakePhase::Complete,
            _ => {
                return Err(ProtocolError::HandshakeFailed(format!(
                    "cannot write in current phase: {:?}",
                    self.phase
                )));
            }
        };

        let len = handshake.write_message(payload, &mut self.buffer)?;
        self.phase = next;
        Ok(self.buffer[..len].to_vec())
    }

    /// Reads a handshake message from the peer.
    ///
    /// Returns any payload included in the handshake message.
    pub fn read_handshake_message(&mut self, message: &[u8]) -> Result<Vec<u8>> {
        let handshake = self
            .handshake
            .as_mut()
            .ok_or(ProtocolError::HandshakeIncomplete)?;

        // Verify we're in a state where we can read
        let next = match (self.role, self.phase) {
            (Role::Initiator, HandshakePhase::InitiatorWaitingForResponse) => {
                HandshakePhase::Complete
            }
            (Role::Responder, HandshakePhase::ResponderStart) => {
                HandshakePhase::ResponderSendResponse
            }
            _ => {
                return Err(ProtocolError::HandshakeFailed(format!(
                    "cannot read in current phase: {:?}",
                    self.phase
                )));
            }
        };

        if message.len() > MAX_NOISE_MESSAGE_SIZE {
            return Err(ProtocolError::HandshakeFailed(format!(
                "handshake message too large: {} bytes",
                message.len()
            )));
        }

        let len = handshake.read_message(message, &mut self.buffer)?;
        self.phase = next;
        Ok(self.buffer[..len].to_vec())
    }

    /// Returns the transcript hash once the handshake is complete.
    pub fn handshake_hash(&self) -> Result<Vec<u8>> {
        if self.phase != HandshakePhase::Complete {
            return Err(ProtocolError::HandshakeIncomplete);
        }
        let handshake = self
            .handshake
            .as_ref()
            .ok_or(ProtocolError::HandshakeIncomplete)?;
        Ok(handshake.get_handshake_hash().to_vec())
    }

    /// Derives the per-direction session key.
    ///
    /// Can only be called once; the handshake state is consumed.
    pub fn into_session_key(&mut self) -> Result<SessionKey> {
        if self.phase != HandshakePhase::Complete {
            return Err(ProtocolError::HandshakeIncomplete);
        }
        let mut handshake = self
            .handshake
            .take()
            .ok_or(ProtocolError::HandshakeIncomplete)?;

        let (initiator_to_responder, responder_to_initiator) =
            handshake.dangerously_get_raw_split();

        Ok(match self.role {
            Role::Initiator => SessionKey::new(&initiator_to_responder, &responder_to_initiator),
            Role::Responder => SessionKey::new(&responder_to_initiator, &initiator_to_responder),
        })
    }
}

/// Renders a verification code as a fixed-width decimal string for display.
pub fn visual_code(code: &[u8]) -> String {
    let mut prefix = [0u8; 4];
    let len = code.len().min(4);
    prefix[..len].copy_from_slice(&code[..len]);
    let value = u32::from_be_bytes(prefix) % 10u32.pow(VISUAL_CODE_DIGITS as u32);
    format!("{:0width$}", value, width = VISUAL_CODE_DIGITS)
}

impl SecureHandshake for NoiseSession {
    fn write_message(&mut self, payload: &[u8]) -> Result<Option<Vec<u8>>> {
        match (self.role, self.phase) {
            (Role::Initiator, HandshakePhase::InitiatorStart)
            | (Role::Responder, HandshakePhase::ResponderSendResponse) => {
                Ok(Some(self.write_handshake_message(payload)?))
            }
            _ => Ok(None), // Not our turn to write
        }
    }

    fn read_message(&mut self, message: &[u8]) -> Result<Vec<u8>> {
        self.read_handshake_message(message)
    }

    fn is_complete(&self) -> bool {
        self.is_handshake_complete()
    }

    fn is_reconnect(&self) -> bool {
        self.reconnect
    }

    fn verification_code(&self) -> Result<Vec<u8>> {
        self.handshake_hash()
    }

    fn session_key(&mut self) -> Result<SessionKey> {
        self.into_session_key()
    }
}

impl std::fmt::Debug for NoiseSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NoiseSession")
            .field("phase", &self.phase)
            .field("role", &self.role)
            .field("reconnect", &self.reconnect)
            .field("key_derived", &self.handshake.is_none())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn complete_pair() -> (NoiseSession, NoiseSession) {
        let mut initiator = NoiseSession::new_initiator().unwrap();
        let mut responder = NoiseSession::new_responder().unwrap();

        let msg1 = initiator.write_handshake_message(&[]).unwrap();
        responder.read_handshake_message(&msg1).unwrap();
        let msg2 = responder.write_handshake_message(&[]).unwrap();
        initiator.read_handshake_message(&msg2).unwrap();

        (initiator, responder)
    }

    #[test]
    fn test_initiator_creation() {
        let session = NoiseSession::new_initiator().unwrap();
        assert_eq!(session.role(), Role::Initiator);
        assert_eq!(session.phase(), HandshakePhase::InitiatorStart);
        assert!(!session.is_handshake_complete());
    }

    #[test]
    fn test_responder_creation() {
        let session = NoiseSession::new_responder().unwrap();
        assert_eq!(session.role(), Role::Responder);
        assert_eq!(session.phase(), HandshakePhase::ResponderStart);
    }

    #[test]
    fn test_full_handshake() {
        let (initiator, responder) = complete_pair();
        assert!(initiator.is_handshake_complete());
        assert!(responder.is_handshake_complete());
        assert_eq!(
            initiator.handshake_hash().unwrap(),
            responder.handshake_hash().unwrap()
        );
    }

    #[test]
    fn test_session_keys_interoperate() {
        let (mut initiator, mut responder) = complete_pair();
        let device_key = initiator.into_session_key().unwrap();
        let host_key = responder.into_session_key().unwrap();

        let ciphertext = host_key.encrypt(b"from host").unwrap();
        assert_eq!(device_key.decrypt(&ciphertext).unwrap(), b"from host");

        let ciphertext = device_key.encrypt(b"from device").unwrap();
        assert_eq!(host_key.decrypt(&ciphertext).unwrap(), b"from device");
    }

    #[test]
    fn test_key_derivation_consumes_handshake() {
        let (mut initiator, _) = complete_pair();
        initiator.into_session_key().unwrap();
        assert!(matches!(
            initiator.into_session_key(),
            Err(ProtocolError::HandshakeIncomplete)
        ));
    }

    #[test]
    fn test_key_before_completion_fails() {
        let mut responder = NoiseSession::new_responder().unwrap();
        assert!(matches!(
            responder.into_session_key(),
            Err(ProtocolError::HandshakeIncomplete)
        ));
        assert!(responder.handshake_hash().is_err());
    }

    #[test]
    fn test_responder_cannot_write_first() {
        let mut responder = NoiseSession::new_responder().unwrap();
        assert!(responder.write_handshake_message(&[]).is_err());
        assert_eq!(SecureHandshake::write_message(&mut responder, &[]).unwrap(), None);
    }

    #[test]
    fn test_garbage_handshake_message_fails() {
        let mut responder = NoiseSession::new_responder().unwrap();
        assert!(responder.read_handshake_message(&[1, 2, 3]).is_err());
    }

    #[test]
    fn test_independent_handshakes_have_different_codes() {
        let (a, _) = complete_pair();
        let (b, _) = complete_pair();
        assert_ne!(a.handshake_hash().unwrap(), b.handshake_hash().unwrap());
    }

    fn handshake(
        mut initiator: NoiseSession,
        mut responder: NoiseSession,
    ) -> Result<(NoiseSession, NoiseSession)> {
        let msg1 = initiator.write_handshake_message(&[])?;
        responder.read_handshake_message(&msg1)?;
        let msg2 = responder.write_handshake_message(&[])?;
        initiator.read_handshake_message(&msg2)?;
        Ok((initiator, responder))
    }

    #[test]
    fn test_reconnect_with_shared_key() {
        let key = ReconnectKey::from_slice(&[9u8; RECONNECT_KEY_LENGTH]).unwrap();
        let (mut device, mut host) = handshake(
            NoiseSession::reconnect(Role::Initiator, &key).unwrap(),
            NoiseSession::reconnect(Role::Responder, &key).unwrap(),
        )
        .unwrap();
        assert!(device.is_reconnect() && host.is_reconnect());

        let device_key = device.into_session_key().unwrap();
        let host_key = host.into_session_key().unwrap();
        let ciphertext = device_key.encrypt(b"back again").unwrap();
        assert_eq!(host_key.decrypt(&ciphertext).unwrap(), b"back again");
    }

    #[test]
    fn test_reconnect_with_wrong_key_fails() {
        let host_key = ReconnectKey::from_slice(&[1u8; RECONNECT_KEY_LENGTH]).unwrap();
        let other_key = ReconnectKey::from_slice(&[2u8; RECONNECT_KEY_LENGTH]).unwrap();
        let result = handshake(
            NoiseSession::reconnect(Role::Initiator, &other_key).unwrap(),
            NoiseSession::reconnect(Role::Responder, &host_key).unwrap(),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_reconnect_rejects_unkeyed_initiator() {
        let key = ReconnectKey::from_slice(&[3u8; RECONNECT_KEY_LENGTH]).unwrap();
        let result = handshake(
            NoiseSession::new_initiator().unwrap(),
            NoiseSession::reconnect(Role::Responder, &key).unwrap(),
        );
        assert!(result.is_err());
        assert!(!NoiseSession::new_responder().unwrap().is_reconnect());
    }

    #[test]
    fn test_reconnect_key_length() {
        assert!(ReconnectKey::from_slice(&[0u8; 31]).is_err());
        let key = ReconnectKey::from_slice(&[0u8; 32]).unwrap();
        assert_eq!(format!("{:?}", key), "ReconnectKey([REDACTED])");
    }

    #[test]
    fn test_visual_code_format() {
        let code = visual_code(&[0xFF, 0xFF, 0xFF, 0xFF, 0x00]);
        assert_eq!(code.len(), VISUAL_CODE_DIGITS);
        assert!(code.chars().all(|c| c.is_ascii_digit()));
        assert_eq!(visual_code(&[0, 0, 0, 7]), "000007");
        assert_eq!(visual_code(&[]), "000000");
    }
}
