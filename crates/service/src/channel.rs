//! Secure channel over one or more packet streams.
//!
//! A [`SecureChannel`] is created once version negotiation succeeds. It runs
//! the encryption handshake, verifies the resulting code (visually or out
//! of band), then encrypts, compresses and dispatches application traffic.
//!
//! ## Verification framing
//!
//! The negotiated security version selects how verification codes travel:
//!
//! - [`VerificationFraming::Legacy`] (security < 4): raw bytes. With an OOB
//!   key both sides exchange their sealed codes; otherwise the code is shown
//!   to the user as soon as the handshake completes.
//! - [`VerificationFraming::Wrapped`] (security >= 4): a
//!   [`VerificationCode`] message. The device announces visual or OOB
//!   verification and the host answers with a confirmation or its own
//!   sealed code.
//!
//! Reconnecting devices skip verification. Their handshake is keyed with a
//! [`ReconnectKey`] derived from the device's challenge secret, so only the
//! associated device can complete it.

use std::sync::{Arc, Weak};
use std::time::Duration;

use companion_protocol::compression::{compress, decompress};
use companion_protocol::messages::{from_msgpack, to_msgpack};
use companion_protocol::{
    visual_code, DeviceMessage, NoiseSession, OobKey, OobSide, OperationType, ProtocolError,
    ReconnectKey, Role, SecureHandshake, SessionKey, VerificationCode, VerificationState,
};
use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::stream::{PacketStream, StreamError, StreamListener};
use crate::transport::ProtocolDevice;

/// First security version that wraps verification codes.
pub const WRAPPED_VERIFICATION_VERSION: i32 = 4;

/// First messaging version that supports payload compression.
pub const COMPRESSION_MESSAGING_VERSION: i32 = 3;

/// Fatal channel errors, delivered through [`ChannelCallback::on_channel_error`].
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ChannelError {
    #[error("invalid handshake message")]
    InvalidHandshake,

    #[error("invalid message")]
    InvalidMessage,

    #[error("invalid device id")]
    InvalidDeviceId,

    #[error("verification code mismatch")]
    InvalidVerification,

    #[error("message not valid in the current state")]
    InvalidState,

    #[error("invalid encryption key")]
    InvalidEncryptionKey,

    #[error("storage error")]
    StorageError,

    #[error("device disconnected")]
    DeviceDisconnected,

    #[error("handshake timed out")]
    Timeout,
}

/// Per-message errors. The channel stays usable.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum MessageError {
    #[error("failed to decrypt message")]
    DecryptionFailure,

    #[error("failed to decompress message")]
    DecompressionFailure,
}

/// Errors returned by [`SecureChannel::send_message`].
#[derive(Debug, Error)]
pub enum SendError {
    #[error("secure channel is not established")]
    NotEstablished,

    #[error("no stream available")]
    NoStream,

    #[error("payload of {size} bytes does not fit the size field")]
    PayloadTooLarge { size: usize },

    #[error(transparent)]
    Stream(#[from] StreamError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Versions agreed during negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedVersions {
    pub messaging: i32,
    pub security: i32,
}

/// How verification codes are carried on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerificationFraming {
    Legacy,
    Wrapped,
}

impl VerificationFraming {
    pub fn for_security_version(security: i32) -> Self {
        if security >= WRAPPED_VERIFICATION_VERSION {
            Self::Wrapped
        } else {
            Self::Legacy
        }
    }
}

/// What the channel must verify after the handshake.
#[derive(Debug, Clone)]
pub enum VerificationMode {
    /// Known device. The handshake is keyed with `key` and proves identity.
    Reconnect { key: ReconnectKey },
    /// New device: confirm the code visually or with the OOB key.
    Association { oob_key: Option<OobKey> },
}

/// Channel settings derived from configuration.
#[derive(Debug, Clone)]
pub struct ChannelSettings {
    /// Compression requested by configuration.
    pub compression: bool,
    /// Time allowed from creation until the code is shown or the channel is up.
    pub handshake_timeout: Duration,
}

impl Default for ChannelSettings {
    fn default() -> Self {
        Self {
            compression: true,
            handshake_timeout: Duration::from_secs(30),
        }
    }
}

/// Events raised by a [`SecureChannel`].
pub trait ChannelCallback: Send + Sync {
    fn on_secure_channel_established(&self) {}

    /// An application message, already decrypted and decompressed.
    fn on_message_received(&self, _message: DeviceMessage) {}

    fn on_channel_error(&self, _error: ChannelError) {}

    fn on_message_error(&self, _error: MessageError) {}

    /// A code the user has to compare with the device before accepting.
    fn on_verification_code_available(&self, _code: &str) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Handshaking,
    AwaitingDeviceVerification,
    AwaitingUserAcceptance,
    Established,
    Failed,
    Closed,
}

struct ChannelState {
    phase: Phase,
    handshake: Option<Box<dyn SecureHandshake>>,
    code: Vec<u8>,
    pending_key: Option<SessionKey>,
}

/// Result of processing one inbound handshake message.
enum Step {
    Nothing,
    Reply(Vec<u8>),
    ShowCode(Vec<u8>, String),
    Establish(Option<Vec<u8>>),
    Fail(ChannelError),
}

/// Encrypted, multi-stream channel to one device.
pub struct SecureChannel {
    me: Weak<SecureChannel>,
    versions: ResolvedVersions,
    framing: VerificationFraming,
    compression: bool,
    verification: VerificationMode,
    callback: Arc<dyn ChannelCallback>,
    streams: Mutex<Vec<PacketStream>>,
    state: Mutex<ChannelState>,
    key: RwLock<Option<Arc<SessionKey>>>,
    timer: CancellationToken,
}

struct ChannelStreamListener {
    channel: Weak<SecureChannel>,
}

impl StreamListener for ChannelStreamListener {
    fn on_message_received(&self, device: &ProtocolDevice, message: DeviceMessage) {
        if let Some(channel) = self.channel.upgrade() {
            channel.on_message_received(device, message);
        }
    }
}

impl SecureChannel {
    /// Creates a channel using the Noise handshake as responder.
    ///
    /// Reconnect channels run the keyed reconnect handshake. Must be called
    /// from within a Tokio runtime.
    pub fn new(
        versions: ResolvedVersions,
        settings: &ChannelSettings,
        verification: VerificationMode,
        callback: Arc<dyn ChannelCallback>,
    ) -> Result<Arc<Self>, ProtocolError> {
        let handshake = match &verification {
            VerificationMode::Reconnect { key } => NoiseSession::reconnect(Role::Responder, key)?,
            VerificationMode::Association { .. } => NoiseSession::new_responder()?,
        };
        Ok(Self::with_handshake(
            versions,
            settings,
            verification,
            callback,
            Box::new(handshake),
        ))
    }

    /// Creates a channel driven by the given handshake engine.
    pub fn with_handshake(
        versions: ResolvedVersions,
        settings: &ChannelSettings,
        verification: VerificationMode,
        callback: Arc<dyn ChannelCallback>,
        handshake: Box<dyn SecureHandshake>,
    ) -> Arc<Self> {
        let channel = Arc::new_cyclic(|me| Self {
            me: me.clone(),
            versions,
            framing: VerificationFraming::for_security_version(versions.security),
            compression: settings.compression
                && versions.messaging >= COMPRESSION_MESSAGING_VERSION,
            verification,
            callback,
            streams: Mutex::new(Vec::new()),
            state: Mutex::new(ChannelState {
                phase: Phase::Handshaking,
                handshake: Some(handshake),
                code: Vec::new(),
                pending_key: None,
            }),
            key: RwLock::new(None),
            timer: CancellationToken::new(),
        });

        channel.arm_timeout(settings.handshake_timeout);
        debug!(
            messaging = versions.messaging,
            security = versions.security,
            framing = ?channel.framing,
            compression = channel.compression,
            "Secure channel created"
        );
        channel
    }

    pub fn versions(&self) -> ResolvedVersions {
        self.versions
    }

    pub fn framing(&self) -> VerificationFraming {
        self.framing
    }

    pub fn compression_enabled(&self) -> bool {
        self.compression
    }

    pub fn is_established(&self) -> bool {
        self.state.lock().phase == Phase::Established
    }

    pub fn stream_count(&self) -> usize {
        self.streams.lock().len()
    }

    /// Returns whether a stream runs on `device`.
    pub fn has_stream(&self, device: &ProtocolDevice) -> bool {
        self.streams.lock().iter().any(|stream| stream.device() == device)
    }

    /// Adds a stream and starts listening on it.
    pub fn add_stream(&self, stream: PacketStream) {
        stream.set_listener(Arc::new(ChannelStreamListener {
            channel: self.me.clone(),
        }));
        debug!(device = %stream.device(), "Stream added to secure channel");
        self.streams.lock().push(stream);
    }

    /// Drops the stream running on `device`.
    ///
    /// Losing the last stream before the channel is established is fatal.
    pub fn on_stream_disconnected(&self, device: &ProtocolDevice) {
        let now_empty = {
            let mut streams = self.streams.lock();
            let before = streams.len();
            streams.retain(|stream| {
                if stream.device() == device {
                    stream.close();
                    false
                } else {
                    true
                }
            });
            before != streams.len() && streams.is_empty()
        };

        if !now_empty {
            return;
        }

        let pending = matches!(
            self.state.lock().phase,
            Phase::Handshaking | Phase::AwaitingDeviceVerification | Phase::AwaitingUserAcceptance
        );
        if pending {
            self.fail(ChannelError::DeviceDisconnected);
        }
    }

    /// Marks the visual code as accepted by the user.
    pub fn notify_verification_code_accepted(&self) {
        {
            let state = self.state.lock();
            if state.phase != Phase::AwaitingUserAcceptance {
                warn!(phase = ?state.phase, "Verification accepted while no code is pending");
                return;
            }
        }

        info!("Verification code accepted by user");
        let confirmation = match self.framing {
            VerificationFraming::Wrapped => {
                match encode_verification(VerificationState::VisualConfirmation, None) {
                    Ok(bytes) => Some(bytes),
                    Err(e) => {
                        warn!(error = %e, "Failed to encode visual confirmation");
                        self.fail(ChannelError::InvalidMessage);
                        return;
                    }
                }
            }
            VerificationFraming::Legacy => None,
        };
        self.establish(confirmation);
    }

    /// Sends a message to the device.
    ///
    /// The payload is compressed when enabled and beneficial, then encrypted
    /// if the message is marked for encryption.
    pub fn send_message(&self, mut message: DeviceMessage) -> Result<(), SendError> {
        if self.compression
            && message.operation != OperationType::Handshake
            && !message.payload.is_empty()
        {
            let original_size = size_field(message.payload.len())?;
            if let Some(compressed) = compress(&message.payload) {
                trace!(
                    original = message.payload.len(),
                    compressed = compressed.len(),
                    "Compressed payload"
                );
                message.original_size = original_size;
                message.payload = compressed;
            }
        }

        if message.is_payload_encrypted {
            let key = self.key.read().clone().ok_or(SendError::NotEstablished)?;
            message.payload = key.encrypt(&message.payload)?;
        }

        let stream = self.streams.lock().first().cloned().ok_or(SendError::NoStream)?;
        stream.send(&message)?;
        Ok(())
    }

    /// Closes every stream and cancels timers.
    pub fn close(&self) {
        {
            let mut state = self.state.lock();
            if state.phase == Phase::Closed {
                return;
            }
            state.phase = Phase::Closed;
            state.handshake = None;
            state.pending_key = None;
        }
        self.timer.cancel();
        let streams = std::mem::take(&mut *self.streams.lock());
        for stream in &streams {
            stream.close();
        }
        debug!(streams = streams.len(), "Secure channel closed");
    }

    fn arm_timeout(&self, timeout: Duration) {
        let channel = self.me.clone();
        let timer = self.timer.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = timer.cancelled() => {}
                _ = tokio::time::sleep(timeout) => {
                    if let Some(channel) = channel.upgrade() {
                        channel.on_timeout();
                    }
                }
            }
        });
    }

    fn on_timeout(&self) {
        let pending = matches!(
            self.state.lock().phase,
            Phase::Handshaking | Phase::AwaitingDeviceVerification
        );
        if pending {
            warn!("Secure channel handshake timed out");
            self.fail(ChannelError::Timeout);
        }
    }

    fn on_message_received(&self, device: &ProtocolDevice, message: DeviceMessage) {
        if matches!(self.state.lock().phase, Phase::Failed | Phase::Closed) {
            trace!(device = %device, "Dropping message on inactive channel");
            return;
        }

        if message.payload.is_empty() {
            warn!(
                device = %device,
                operation = ?message.operation,
                "Rejecting message with empty payload"
            );
            return;
        }

        let DeviceMessage {
            operation,
            is_payload_encrypted,
            mut payload,
            original_size,
            recipient,
        } = message;

        if is_payload_encrypted {
            let key = self.key.read().clone();
            let decrypted = key
                .ok_or(ProtocolError::HandshakeIncomplete)
                .and_then(|key| key.decrypt(&payload));
            payload = match decrypted {
                Ok(plaintext) => plaintext,
                Err(e) => {
                    warn!(device = %device, error = %e, "Failed to decrypt message");
                    self.callback.on_message_error(MessageError::DecryptionFailure);
                    return;
                }
            };
        }

        if original_size != 0 {
            let inflated = usize::try_from(original_size)
                .map_err(|_| ProtocolError::Compression(format!("invalid size {original_size}")))
                .and_then(|size| decompress(&payload, size));
            payload = match inflated {
                Ok(plaintext) => plaintext,
                Err(e) => {
                    warn!(device = %device, error = %e, "Failed to decompress message");
                    self.callback
                        .on_message_error(MessageError::DecompressionFailure);
                    return;
                }
            };
        }

        match operation {
            OperationType::Handshake => self.process_handshake(payload),
            OperationType::ClientMessage | OperationType::Query | OperationType::QueryResponse => {
                if !self.is_established() {
                    warn!(
                        device = %device,
                        ?operation,
                        "Dropping message before channel is established"
                    );
                    return;
                }
                self.callback.on_message_received(DeviceMessage {
                    operation,
                    is_payload_encrypted: false,
                    payload,
                    original_size: 0,
                    recipient,
                });
            }
            OperationType::Unknown => {
                debug!(device = %device, "Ignoring message with unknown operation");
            }
        }
    }

    fn process_handshake(&self, payload: Vec<u8>) {
        let step = {
            let mut state = self.state.lock();
            match state.phase {
                Phase::Handshaking => self.advance_handshake(&mut state, &payload),
                Phase::AwaitingDeviceVerification => self.verify_device(&mut state, &payload),
                Phase::AwaitingUserAcceptance => {
                    warn!("Handshake message while waiting for user acceptance");
                    Step::Fail(ChannelError::InvalidState)
                }
                Phase::Established => {
                    debug!("Ignoring handshake message on established channel");
                    Step::Nothing
                }
                Phase::Failed | Phase::Closed => Step::Nothing,
            }
        };

        match step {
            Step::Nothing => {}
            Step::Reply(reply) => self.send_handshake(reply),
            Step::ShowCode(reply, code) => {
                if !reply.is_empty() {
                    self.send_handshake(reply);
                }
                // The user may take their time; the handshake timer no longer applies.
                self.timer.cancel();
                info!("Verification code ready for user confirmation");
                self.callback.on_verification_code_available(&code);
            }
            Step::Establish(reply) => {
                // Reconnect channels establish right after the handshake reply.
                self.establish(reply);
            }
            Step::Fail(error) => self.fail(error),
        }
    }

    fn advance_handshake(&self, state: &mut ChannelState, payload: &[u8]) -> Step {
        let Some(handshake) = state.handshake.as_mut() else {
            return Step::Fail(ChannelError::InvalidState);
        };
        let keyed = handshake.is_reconnect();

        if let Err(e) = handshake.read_message(payload) {
            warn!(error = %e, "Failed to process handshake message");
            return Step::Fail(ChannelError::InvalidHandshake);
        }
        let reply = match handshake.write_message(&[]) {
            Ok(reply) => reply,
            Err(e) => {
                warn!(error = %e, "Failed to write handshake reply");
                return Step::Fail(ChannelError::InvalidHandshake);
            }
        };

        if !handshake.is_complete() {
            return reply.map(Step::Reply).unwrap_or(Step::Nothing);
        }

        let code = match handshake.verification_code() {
            Ok(code) => code,
            Err(e) => {
                warn!(error = %e, "Failed to derive verification code");
                return Step::Fail(ChannelError::InvalidHandshake);
            }
        };
        let key = match handshake.session_key() {
            Ok(key) => key,
            Err(e) => {
                warn!(error = %e, "Failed to derive session key");
                return Step::Fail(ChannelError::InvalidHandshake);
            }
        };
        state.handshake = None;
        state.code = code;
        state.pending_key = Some(key);
        debug!("Encryption handshake complete");

        match &self.verification {
            VerificationMode::Reconnect { .. } if keyed => Step::Establish(reply),
            VerificationMode::Reconnect { .. } => {
                warn!("Reconnect channel completed an unkeyed handshake");
                Step::Fail(ChannelError::InvalidHandshake)
            }
            VerificationMode::Association { oob_key: None }
                if self.framing == VerificationFraming::Legacy =>
            {
                state.phase = Phase::AwaitingUserAcceptance;
                Step::ShowCode(reply.unwrap_or_default(), visual_code(&state.code))
            }
            VerificationMode::Association { .. } => {
                state.phase = Phase::AwaitingDeviceVerification;
                reply.map(Step::Reply).unwrap_or(Step::Nothing)
            }
        }
    }

    fn verify_device(&self, state: &mut ChannelState, payload: &[u8]) -> Step {
        let oob_key = match &self.verification {
            VerificationMode::Association { oob_key } => oob_key.as_ref(),
            VerificationMode::Reconnect { .. } => return Step::Fail(ChannelError::InvalidState),
        };

        match self.framing {
            VerificationFraming::Legacy => match oob_key {
                Some(oob_key) => match check_sealed_code(oob_key, &state.code, payload) {
                    Ok(reply) => Step::Establish(Some(reply)),
                    Err(error) => Step::Fail(error),
                },
                None => Step::Fail(ChannelError::InvalidState),
            },
            VerificationFraming::Wrapped => {
                let message: VerificationCode = match from_msgpack(payload) {
                    Ok(message) => message,
                    Err(e) => {
                        warn!(error = %e, "Invalid verification message");
                        return Step::Fail(ChannelError::InvalidMessage);
                    }
                };

                match message.state {
                    VerificationState::VisualVerification => {
                        state.phase = Phase::AwaitingUserAcceptance;
                        Step::ShowCode(Vec::new(), visual_code(&state.code))
                    }
                    VerificationState::OobVerification => {
                        let Some(oob_key) = oob_key else {
                            warn!("Device requested OOB verification without OOB data");
                            return Step::Fail(ChannelError::InvalidState);
                        };
                        let Some(sealed) = message.payload else {
                            return Step::Fail(ChannelError::InvalidMessage);
                        };
                        let sealed_host_code =
                            match check_sealed_code(oob_key, &state.code, &sealed) {
                                Ok(sealed_host_code) => sealed_host_code,
                                Err(error) => return Step::Fail(error),
                            };
                        match encode_verification(
                            VerificationState::OobVerification,
                            Some(sealed_host_code),
                        ) {
                            Ok(reply) => Step::Establish(Some(reply)),
                            Err(_) => Step::Fail(ChannelError::InvalidMessage),
                        }
                    }
                    other => {
                        warn!(state = ?other, "Unexpected verification state");
                        Step::Fail(ChannelError::InvalidState)
                    }
                }
            }
        }
    }

    fn establish(&self, reply: Option<Vec<u8>>) {
        {
            let mut state = self.state.lock();
            if matches!(state.phase, Phase::Established | Phase::Failed | Phase::Closed) {
                return;
            }
            let Some(key) = state.pending_key.take() else {
                drop(state);
                self.fail(ChannelError::InvalidState);
                return;
            };
            *self.key.write() = Some(Arc::new(key));
            state.phase = Phase::Established;
        }
        self.timer.cancel();

        if let Some(reply) = reply {
            self.send_handshake(reply);
        }
        info!("Secure channel established");
        self.callback.on_secure_channel_established();
    }

    fn fail(&self, error: ChannelError) {
        {
            let mut state = self.state.lock();
            if matches!(state.phase, Phase::Failed | Phase::Closed) {
                return;
            }
            state.phase = Phase::Failed;
            state.handshake = None;
            state.pending_key = None;
        }
        self.timer.cancel();
        warn!(error = %error, "Secure channel failed");
        self.callback.on_channel_error(error);
    }

    fn send_handshake(&self, payload: Vec<u8>) {
        if let Err(e) = self.send_message(DeviceMessage::handshake(payload)) {
            warn!(error = %e, "Failed to send handshake message");
        }
    }
}

impl std::fmt::Debug for SecureChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureChannel")
            .field("versions", &self.versions)
            .field("framing", &self.framing)
            .field("phase", &self.state.lock().phase)
            .field("streams", &self.stream_count())
            .finish()
    }
}

/// Opens the device's sealed code, compares it with ours and seals our own.
fn check_sealed_code(
    oob_key: &OobKey,
    code: &[u8],
    sealed: &[u8],
) -> Result<Vec<u8>, ChannelError> {
    let device_code = oob_key.open(OobSide::Device, sealed).map_err(|e| {
        warn!(error = %e, "Failed to open OOB verification code");
        ChannelError::InvalidVerification
    })?;
    if device_code != code {
        warn!("OOB verification code mismatch");
        return Err(ChannelError::InvalidVerification);
    }
    oob_key
        .seal(OobSide::Host, code)
        .map_err(|_| ChannelError::InvalidVerification)
}

/// Converts a payload length to the envelope's `original_size` field.
fn size_field(len: usize) -> Result<i32, SendError> {
    i32::try_from(len).map_err(|_| SendError::PayloadTooLarge { size: len })
}

fn encode_verification(
    state: VerificationState,
    payload: Option<Vec<u8>>,
) -> Result<Vec<u8>, ProtocolError> {
    to_msgpack(&VerificationCode { state, payload })
}
