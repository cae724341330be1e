//! Version negotiation and reconnect challenge verification.
//!
//! A [`ChannelNegotiator`] takes one or more fresh transport connections to
//! the same device and turns them into a [`SecureChannel`]:
//!
//! ```text
//! AwaitingFirstContact ──► VersionResolved ──► Resolved
//!                                 │                ▲
//!                                 └──► AwaitingChallengeResponse
//! ```
//!
//! Every non-terminal state is guarded by a timeout. Any failure moves the
//! negotiator to the terminal error state after all of its listeners have
//! been removed.

use std::sync::{Arc, Weak};
use std::time::Duration;

use companion_protocol::{
    ConnectChallenge, DeviceMessage, OobKey, OperationType, ReconnectKey, VersionExchange,
};
use parking_lot::Mutex;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::channel::{
    ChannelCallback, ChannelSettings, ResolvedVersions, SecureChannel, VerificationMode,
};
use crate::config::Config;
use crate::devices::{DeviceStorage, StorageError};
use crate::stream::{PacketStream, StreamListener};
use crate::transport::{ConnectionId, DataListener, ProtocolDevice};

pub const MIN_MESSAGING_VERSION: i32 = 2;
pub const MAX_MESSAGING_VERSION: i32 = 3;
pub const MIN_SECURITY_VERSION: i32 = 2;
pub const MAX_SECURITY_VERSION: i32 = 4;

/// Version ranges this host supports.
pub const LOCAL_VERSIONS: VersionExchange = VersionExchange {
    min_messaging_version: MIN_MESSAGING_VERSION,
    max_messaging_version: MAX_MESSAGING_VERSION,
    min_security_version: MIN_SECURITY_VERSION,
    max_security_version: MAX_SECURITY_VERSION,
};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NegotiationError {
    #[error("no compatible {0} version")]
    IncompatibleVersion(&'static str),

    #[error("invalid version exchange: {0}")]
    InvalidVersionExchange(String),

    #[error("unexpected message: {0}")]
    UnexpectedMessage(String),

    #[error("challenge response does not match")]
    ChallengeMismatch,

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("negotiation timed out")]
    Timeout,

    #[error("failed to start handshake: {0}")]
    Handshake(String),
}

/// Picks the highest version both sides support for each range.
pub fn resolve_versions(
    local: &VersionExchange,
    peer: &VersionExchange,
) -> Result<ResolvedVersions, NegotiationError> {
    if peer.min_messaging_version > peer.max_messaging_version
        || peer.min_security_version > peer.max_security_version
    {
        return Err(NegotiationError::InvalidVersionExchange(format!(
            "inverted range: {peer:?}"
        )));
    }

    if peer.min_messaging_version > local.max_messaging_version
        || local.min_messaging_version > peer.max_messaging_version
    {
        return Err(NegotiationError::IncompatibleVersion("messaging"));
    }
    if peer.min_security_version > local.max_security_version
        || local.min_security_version > peer.max_security_version
    {
        return Err(NegotiationError::IncompatibleVersion("security"));
    }

    Ok(ResolvedVersions {
        messaging: local.max_messaging_version.min(peer.max_messaging_version),
        security: local.max_security_version.min(peer.max_security_version),
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    AwaitingFirstContact,
    VersionResolved,
    AwaitingChallengeResponse,
    Resolved,
    Error,
}

impl NegotiationState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Resolved | Self::Error)
    }
}

/// Outcome of a negotiation.
pub trait NegotiationCallback: Send + Sync {
    /// The channel is ready for its handshake. `device_id` is set for
    /// reconnects.
    fn on_channel_resolved(&self, channel: Arc<SecureChannel>, device_id: Option<Uuid>);

    fn on_negotiation_failed(&self, error: NegotiationError);
}

/// Settings shared by every negotiation.
#[derive(Debug, Clone)]
pub struct NegotiatorSettings {
    pub local_versions: VersionExchange,
    pub timeout: Duration,
    pub send_queue_depth: usize,
    pub channel: ChannelSettings,
}

impl NegotiatorSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            local_versions: LOCAL_VERSIONS,
            timeout: config.negotiation.timeout(),
            send_queue_depth: config.transport.send_queue_depth,
            channel: ChannelSettings {
                compression: config.channel.compression,
                handshake_timeout: config.negotiation.handshake_timeout(),
            },
        }
    }
}

impl Default for NegotiatorSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

#[derive(Debug, Clone)]
enum Mode {
    Unset,
    Association { oob_key: Option<OobKey> },
    Reconnect { device_id: Uuid, challenge: ConnectChallenge },
}

struct NegotiationInner {
    state: NegotiationState,
    mode: Mode,
    /// Connections still listening for first contact.
    candidates: Vec<ProtocolDevice>,
    primary: Option<ProtocolDevice>,
    /// Connections merged into the channel once resolved.
    tracked: Vec<ProtocolDevice>,
    stream: Option<PacketStream>,
    versions: Option<ResolvedVersions>,
    timeout_generation: u64,
}

/// Next step decided while holding the state lock.
enum Action {
    Fail(NegotiationError),
    Resolve {
        reply: Option<DeviceMessage>,
        key: Option<ReconnectKey>,
    },
    AwaitChallenge,
}

/// Negotiates versions (and, on reconnect, identity) for one device.
pub struct ChannelNegotiator {
    me: Weak<ChannelNegotiator>,
    settings: NegotiatorSettings,
    storage: Arc<dyn DeviceStorage>,
    channel_callback: Arc<dyn ChannelCallback>,
    callback: Arc<dyn NegotiationCallback>,
    inner: Mutex<NegotiationInner>,
    timers: CancellationToken,
}

struct FirstContactListener {
    negotiator: Weak<ChannelNegotiator>,
    device: ProtocolDevice,
}

impl DataListener for FirstContactListener {
    fn on_data_received(&self, _connection: ConnectionId, data: Vec<u8>) {
        if let Some(negotiator) = self.negotiator.upgrade() {
            negotiator.on_first_contact(&self.device, data);
        }
    }
}

struct ChallengeListener {
    negotiator: Weak<ChannelNegotiator>,
}

impl StreamListener for ChallengeListener {
    fn on_message_received(&self, device: &ProtocolDevice, message: DeviceMessage) {
        if let Some(negotiator) = self.negotiator.upgrade() {
            negotiator.on_challenge_message(device, message);
        }
    }
}

impl ChannelNegotiator {
    pub fn new(
        settings: NegotiatorSettings,
        storage: Arc<dyn DeviceStorage>,
        channel_callback: Arc<dyn ChannelCallback>,
        callback: Arc<dyn NegotiationCallback>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            settings,
            storage,
            channel_callback,
            callback,
            inner: Mutex::new(NegotiationInner {
                state: NegotiationState::AwaitingFirstContact,
                mode: Mode::Unset,
                candidates: Vec::new(),
                primary: None,
                tracked: Vec::new(),
                stream: None,
                versions: None,
                timeout_generation: 0,
            }),
            timers: CancellationToken::new(),
        })
    }

    pub fn state(&self) -> NegotiationState {
        self.inner.lock().state
    }

    /// Versions agreed with the device, once first contact succeeded.
    pub fn resolved_versions(&self) -> Option<ResolvedVersions> {
        self.inner.lock().versions
    }

    /// Starts negotiating with a device that wants to associate.
    pub fn resolve_association(&self, device: ProtocolDevice, oob_key: Option<OobKey>) {
        debug!(device = %device, oob = oob_key.is_some(), "Negotiating association");
        self.start(device, Mode::Association { oob_key });
    }

    /// Starts negotiating with a known device answering `challenge`.
    pub fn resolve_reconnect(
        &self,
        device: ProtocolDevice,
        device_id: Uuid,
        challenge: ConnectChallenge,
    ) {
        debug!(device = %device, %device_id, "Negotiating reconnect");
        self.start(
            device,
            Mode::Reconnect {
                device_id,
                challenge,
            },
        );
    }

    fn start(&self, device: ProtocolDevice, mode: Mode) {
        {
            let mut inner = self.inner.lock();
            if !matches!(inner.mode, Mode::Unset) {
                warn!(device = %device, "Negotiation already started");
                return;
            }
            inner.mode = mode;
        }
        self.add_protocol_device(device);
        self.arm_timeout();
    }

    /// Adds another connection to the same device.
    pub fn add_protocol_device(&self, device: ProtocolDevice) {
        let mut inner = self.inner.lock();
        match inner.state {
            NegotiationState::AwaitingFirstContact => {
                if inner.candidates.contains(&device) {
                    return;
                }
                device.register_data_listener(Arc::new(FirstContactListener {
                    negotiator: self.me.clone(),
                    device: device.clone(),
                }));
                inner.candidates.push(device);
            }
            NegotiationState::VersionResolved | NegotiationState::AwaitingChallengeResponse => {
                if inner.primary.as_ref() != Some(&device) && !inner.tracked.contains(&device) {
                    debug!(device = %device, "Tracking additional connection");
                    inner.tracked.push(device);
                }
            }
            NegotiationState::Resolved | NegotiationState::Error => {
                debug!(
                    device = %device,
                    state = ?inner.state,
                    "Ignoring connection for finished negotiation"
                );
            }
        }
    }

    /// Forgets a connection that went away.
    ///
    /// Losing the primary connection fails the negotiation.
    pub fn remove_protocol_device(&self, device: &ProtocolDevice) {
        let lost_primary = {
            let mut inner = self.inner.lock();
            inner.candidates.retain(|candidate| candidate != device);
            inner.tracked.retain(|tracked| tracked != device);
            !inner.state.is_terminal() && inner.primary.as_ref() == Some(device)
        };

        if lost_primary {
            self.fail(NegotiationError::Transport(format!(
                "primary connection {device} lost"
            )));
        }
    }

    /// Stops negotiating without reporting an error.
    pub fn cancel(&self) {
        if self.teardown(NegotiationState::Error) {
            debug!("Negotiation cancelled");
        }
    }

    fn on_first_contact(&self, device: &ProtocolDevice, data: Vec<u8>) {
        let action = {
            let mut inner = self.inner.lock();
            if inner.state != NegotiationState::AwaitingFirstContact
                || !inner.candidates.contains(device)
            {
                trace!(device = %device, "Dropping data outside first contact");
                return;
            }

            let candidates = std::mem::take(&mut inner.candidates);
            for other in candidates {
                if &other != device {
                    other.unregister_data_listener();
                    inner.tracked.push(other);
                }
            }
            inner.primary = Some(device.clone());
            self.process_version_exchange(&mut inner, device, &data)
        };
        self.perform(action);
    }

    fn process_version_exchange(
        &self,
        inner: &mut NegotiationInner,
        device: &ProtocolDevice,
        data: &[u8],
    ) -> Action {
        let peer = match VersionExchange::from_msgpack(data) {
            Ok(peer) => peer,
            Err(e) => return Action::Fail(NegotiationError::InvalidVersionExchange(e.to_string())),
        };
        let versions = match resolve_versions(&self.settings.local_versions, &peer) {
            Ok(versions) => versions,
            Err(e) => return Action::Fail(e),
        };
        debug!(
            device = %device,
            messaging = versions.messaging,
            security = versions.security,
            "Versions resolved"
        );

        let stream = PacketStream::new(device.clone(), self.settings.send_queue_depth);
        let reply = self
            .settings
            .local_versions
            .to_msgpack()
            .map_err(|e| NegotiationError::InvalidVersionExchange(e.to_string()))
            .and_then(|bytes| {
                stream
                    .send_raw(bytes)
                    .map_err(|e| NegotiationError::Transport(e.to_string()))
            });
        inner.stream = Some(stream.clone());
        inner.versions = Some(versions);
        inner.state = NegotiationState::VersionResolved;
        if let Err(e) = reply {
            return Action::Fail(e);
        }

        match &inner.mode {
            Mode::Reconnect { .. } if device.requires_device_verification() => {
                stream.set_listener(Arc::new(ChallengeListener {
                    negotiator: self.me.clone(),
                }));
                inner.state = NegotiationState::AwaitingChallengeResponse;
                Action::AwaitChallenge
            }
            // No challenge exchange: the key is bound to the advertised challenge alone.
            Mode::Reconnect {
                device_id,
                challenge,
            } => match self.reconnect_key(device_id, challenge, &[]) {
                Ok(key) => Action::Resolve {
                    reply: None,
                    key: Some(key),
                },
                Err(e) => Action::Fail(e),
            },
            _ => Action::Resolve {
                reply: None,
                key: None,
            },
        }
    }

    fn on_challenge_message(&self, device: &ProtocolDevice, message: DeviceMessage) {
        let action = {
            let inner = self.inner.lock();
            if inner.state != NegotiationState::AwaitingChallengeResponse {
                trace!(device = %device, "Dropping message outside challenge exchange");
                return;
            }
            let Mode::Reconnect {
                device_id,
                challenge,
            } = &inner.mode
            else {
                return;
            };
            self.verify_challenge(*device_id, challenge, message)
        };
        self.perform(action);
    }

    fn verify_challenge(
        &self,
        device_id: Uuid,
        challenge: &ConnectChallenge,
        message: DeviceMessage,
    ) -> Action {
        if message.operation != OperationType::Handshake {
            return Action::Fail(NegotiationError::UnexpectedMessage(format!(
                "expected handshake, got {:?}",
                message.operation
            )));
        }

        let expected = &challenge.challenge;
        if message.payload.len() < expected.len() {
            return Action::Fail(NegotiationError::ChallengeMismatch);
        }
        let (response, device_challenge) = message.payload.split_at(expected.len());
        if response != expected.as_slice() {
            warn!(%device_id, "Reconnect challenge mismatch");
            return Action::Fail(NegotiationError::ChallengeMismatch);
        }

        let answer = match self
            .storage
            .hash_with_challenge_secret(&device_id, device_challenge)
        {
            Ok(answer) => answer,
            Err(e) => return Action::Fail(NegotiationError::Storage(e)),
        };
        match self.reconnect_key(&device_id, challenge, device_challenge) {
            Ok(key) => {
                debug!(%device_id, "Device answered reconnect challenge");
                Action::Resolve {
                    reply: Some(DeviceMessage::handshake(answer)),
                    key: Some(key),
                }
            }
            Err(e) => Action::Fail(e),
        }
    }

    /// Derives the reconnect handshake key as
    /// `HMAC(secret, challenge || device_challenge)`.
    fn reconnect_key(
        &self,
        device_id: &Uuid,
        challenge: &ConnectChallenge,
        device_challenge: &[u8],
    ) -> Result<ReconnectKey, NegotiationError> {
        let mut input = challenge.challenge.clone();
        input.extend_from_slice(device_challenge);
        let hash = self.storage.hash_with_challenge_secret(device_id, &input)?;
        ReconnectKey::from_slice(&hash).map_err(|e| NegotiationError::Handshake(e.to_string()))
    }

    fn perform(&self, action: Action) {
        match action {
            Action::Fail(error) => self.fail(error),
            Action::AwaitChallenge => self.arm_timeout(),
            Action::Resolve { reply, key } => self.resolve_channel(reply, key),
        }
    }

    fn resolve_channel(
        &self,
        challenge_reply: Option<DeviceMessage>,
        key: Option<ReconnectKey>,
    ) {
        let (stream, tracked, versions, verification, device_id) = {
            let mut inner = self.inner.lock();
            if inner.state.is_terminal() {
                return;
            }
            let (verification, device_id) = match &inner.mode {
                Mode::Reconnect { device_id, .. } => (
                    key.map(|key| VerificationMode::Reconnect { key }),
                    Some(*device_id),
                ),
                Mode::Association { oob_key } => (
                    Some(VerificationMode::Association {
                        oob_key: oob_key.clone(),
                    }),
                    None,
                ),
                Mode::Unset => (Some(VerificationMode::Association { oob_key: None }), None),
            };
            let Some(verification) = verification else {
                drop(inner);
                self.fail(NegotiationError::Handshake(
                    "reconnect resolved without a key".to_string(),
                ));
                return;
            };
            let (Some(stream), Some(versions)) = (inner.stream.take(), inner.versions) else {
                drop(inner);
                self.fail(NegotiationError::UnexpectedMessage(
                    "resolved without a stream".to_string(),
                ));
                return;
            };
            inner.state = NegotiationState::Resolved;
            inner.candidates.clear();
            (
                stream,
                std::mem::take(&mut inner.tracked),
                versions,
                verification,
                device_id,
            )
        };
        self.timers.cancel();

        let channel = match SecureChannel::new(
            versions,
            &self.settings.channel,
            verification,
            Arc::clone(&self.channel_callback),
        ) {
            Ok(channel) => channel,
            Err(e) => {
                stream.close();
                for device in &tracked {
                    device.unregister_data_listener();
                }
                self.inner.lock().state = NegotiationState::Error;
                self.callback
                    .on_negotiation_failed(NegotiationError::Handshake(e.to_string()));
                return;
            }
        };

        channel.add_stream(stream.clone());
        for device in tracked {
            channel.add_stream(PacketStream::new(device, self.settings.send_queue_depth));
        }

        info!(
            device_id = ?device_id,
            messaging = versions.messaging,
            security = versions.security,
            "Negotiation complete"
        );
        self.callback.on_channel_resolved(channel, device_id);

        if let Some(reply) = challenge_reply {
            if let Err(e) = stream.send(&reply) {
                warn!(error = %e, "Failed to answer device challenge");
                stream.device().disconnect();
            }
        }
    }

    fn fail(&self, error: NegotiationError) {
        if self.teardown(NegotiationState::Error) {
            warn!(error = %error, "Negotiation failed");
            self.callback.on_negotiation_failed(error);
        }
    }

    /// Moves to a terminal state and removes every listener.
    ///
    /// Returns `false` if the negotiation had already finished.
    fn teardown(&self, state: NegotiationState) -> bool {
        let (devices, stream) = {
            let mut inner = self.inner.lock();
            if inner.state.is_terminal() {
                return false;
            }
            inner.state = state;
            let mut devices = std::mem::take(&mut inner.candidates);
            devices.append(&mut inner.tracked);
            devices.extend(inner.primary.clone());
            (devices, inner.stream.take())
        };
        self.timers.cancel();

        if let Some(stream) = stream {
            stream.close();
        }
        for device in devices {
            device.unregister_data_listener();
        }
        true
    }

    fn arm_timeout(&self) {
        let generation = {
            let mut inner = self.inner.lock();
            inner.timeout_generation += 1;
            inner.timeout_generation
        };
        let negotiator = self.me.clone();
        let timers = self.timers.clone();
        let timeout = self.settings.timeout;
        tokio::spawn(async move {
            tokio::select! {
                _ = timers.cancelled() => {}
                _ = tokio::time::sleep(timeout) => {
                    if let Some(negotiator) = negotiator.upgrade() {
                        negotiator.on_timeout(generation);
                    }
                }
            }
        });
    }

    fn on_timeout(&self, generation: u64) {
        let expired = {
            let inner = self.inner.lock();
            inner.timeout_generation == generation && !inner.state.is_terminal()
        };
        if expired {
            self.fail(NegotiationError::Timeout);
        }
    }
}

impl std::fmt::Debug for ChannelNegotiator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("ChannelNegotiator")
            .field("state", &inner.state)
            .field("mode", &inner.mode)
            .field("primary", &inner.primary)
            .field("tracked", &inner.tracked.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::{AssociatedDevice, JsonDeviceStore};
    use crate::transport::{DiscoveryCallback, DiscoveryKind, MemoryTransport, Transport};
    use companion_protocol::crypto::hmac_sha256;
    use companion_protocol::{
        packetize, NoiseSession, Packet, PacketOutcome, Reassembler, Role,
    };
    use tokio::sync::mpsc;

    struct Accept;

    impl DiscoveryCallback for Accept {
        fn on_device_connected(&self, _device: ProtocolDevice) {}
    }

    struct NoChannelEvents;

    impl ChannelCallback for NoChannelEvents {}

    #[derive(Default)]
    struct Outcome {
        resolved: Mutex<Vec<(Arc<SecureChannel>, Option<Uuid>)>>,
        failed: Mutex<Vec<NegotiationError>>,
    }

    impl NegotiationCallback for Outcome {
        fn on_channel_resolved(&self, channel: Arc<SecureChannel>, device_id: Option<Uuid>) {
            self.resolved.lock().push((channel, device_id));
        }

        fn on_negotiation_failed(&self, error: NegotiationError) {
            self.failed.lock().push(error);
        }
    }

    struct Fixture {
        transport: Arc<MemoryTransport>,
        rx: mpsc::UnboundedReceiver<(ConnectionId, Vec<u8>)>,
        storage: Arc<JsonDeviceStore>,
        outcome: Arc<Outcome>,
        negotiator: Arc<ChannelNegotiator>,
    }

    fn fixture(requires_verification: bool) -> Fixture {
        let (transport, rx) = MemoryTransport::new("mem", 256, requires_verification);
        transport.start_association_discovery("test", Arc::new(Accept));
        transport.connect(DiscoveryKind::Association, 1);
        transport.connect(DiscoveryKind::Association, 2);

        let storage = Arc::new(JsonDeviceStore::in_memory());
        let outcome = Arc::new(Outcome::default());
        let negotiator = ChannelNegotiator::new(
            NegotiatorSettings::default(),
            storage.clone(),
            Arc::new(NoChannelEvents),
            outcome.clone(),
        );
        Fixture {
            transport,
            rx,
            storage,
            outcome,
            negotiator,
        }
    }

    fn device(fixture: &Fixture, connection: ConnectionId) -> ProtocolDevice {
        ProtocolDevice::new(fixture.transport.clone(), connection)
    }

    fn peer_versions(messaging: (i32, i32), security: (i32, i32)) -> Vec<u8> {
        VersionExchange {
            min_messaging_version: messaging.0,
            max_messaging_version: messaging.1,
            min_security_version: security.0,
            max_security_version: security.1,
        }
        .to_msgpack()
        .unwrap()
    }

    async fn next_write(rx: &mut mpsc::UnboundedReceiver<(ConnectionId, Vec<u8>)>) -> Vec<u8> {
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap()
            .1
    }

    #[test]
    fn test_resolve_versions_picks_highest_common() {
        let peer = VersionExchange {
            min_messaging_version: 1,
            max_messaging_version: 5,
            min_security_version: 3,
            max_security_version: 3,
        };
        let versions = resolve_versions(&LOCAL_VERSIONS, &peer).unwrap();
        assert_eq!(
            versions,
            ResolvedVersions {
                messaging: 3,
                security: 3
            }
        );
    }

    #[test]
    fn test_resolve_versions_disjoint_ranges() {
        let local = VersionExchange {
            min_messaging_version: 3,
            max_messaging_version: 3,
            min_security_version: 4,
            max_security_version: 4,
        };
        let older = VersionExchange {
            min_messaging_version: 2,
            max_messaging_version: 2,
            min_security_version: 4,
            max_security_version: 4,
        };
        assert_eq!(
            resolve_versions(&local, &older),
            Err(NegotiationError::IncompatibleVersion("messaging"))
        );

        let insecure = VersionExchange {
            min_messaging_version: 3,
            max_messaging_version: 3,
            min_security_version: 1,
            max_security_version: 3,
        };
        assert_eq!(
            resolve_versions(&local, &insecure),
            Err(NegotiationError::IncompatibleVersion("security"))
        );
    }

    #[test]
    fn test_resolve_versions_rejects_inverted_range() {
        let peer = VersionExchange {
            min_messaging_version: 3,
            max_messaging_version: 2,
            min_security_version: 2,
            max_security_version: 4,
        };
        assert!(matches!(
            resolve_versions(&LOCAL_VERSIONS, &peer),
            Err(NegotiationError::InvalidVersionExchange(_))
        ));
    }

    #[tokio::test]
    async fn test_association_resolves_after_version_exchange() {
        let mut f = fixture(false);
        f.negotiator.resolve_association(device(&f, 1), None);
        f.transport.deliver(1, peer_versions((2, 3), (2, 4)));

        let reply = VersionExchange::from_msgpack(&next_write(&mut f.rx).await).unwrap();
        assert_eq!(reply, LOCAL_VERSIONS);
        assert_eq!(f.negotiator.state(), NegotiationState::Resolved);

        let resolved = f.outcome.resolved.lock();
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].1, None);
        assert_eq!(
            resolved[0].0.versions(),
            ResolvedVersions {
                messaging: 3,
                security: 4
            }
        );
    }

    #[tokio::test]
    async fn test_first_connection_to_speak_becomes_primary() {
        let f = fixture(false);
        f.negotiator.resolve_association(device(&f, 1), None);
        f.negotiator.add_protocol_device(device(&f, 2));

        f.transport.deliver(2, peer_versions((2, 3), (2, 4)));

        let resolved = f.outcome.resolved.lock();
        assert_eq!(resolved[0].0.stream_count(), 2);
        assert!(f.transport.has_data_listener(1));
        assert!(f.transport.has_data_listener(2));
    }

    #[tokio::test]
    async fn test_incompatible_versions_fail_and_unregister() {
        let f = fixture(false);
        f.negotiator.resolve_association(device(&f, 1), None);
        f.negotiator.add_protocol_device(device(&f, 2));
        f.transport.deliver(1, peer_versions((5, 6), (2, 4)));

        assert_eq!(
            f.outcome.failed.lock().as_slice(),
            [NegotiationError::IncompatibleVersion("messaging")]
        );
        assert_eq!(f.negotiator.state(), NegotiationState::Error);
        assert!(!f.transport.has_data_listener(1));
        assert!(!f.transport.has_data_listener(2));
    }

    #[tokio::test]
    async fn test_garbage_first_contact_fails() {
        let f = fixture(false);
        f.negotiator.resolve_association(device(&f, 1), None);
        f.transport.deliver(1, b"\xc1garbage".to_vec());

        assert!(matches!(
            f.outcome.failed.lock().as_slice(),
            [NegotiationError::InvalidVersionExchange(_)]
        ));
    }

    #[tokio::test]
    async fn test_reconnect_without_verification_skips_challenge() {
        let f = fixture(false);
        let device_id = Uuid::new_v4();
        f.storage.save_challenge_secret(device_id, &[4u8; 32]).unwrap();
        let challenge = ConnectChallenge {
            challenge: vec![1; 32],
            salt: vec![2; 16],
        };
        f.negotiator
            .resolve_reconnect(device(&f, 1), device_id, challenge);
        f.transport.deliver(1, peer_versions((2, 3), (2, 4)));

        assert_eq!(f.outcome.resolved.lock()[0].1, Some(device_id));
    }

    #[tokio::test]
    async fn test_reconnect_without_secret_fails() {
        let f = fixture(false);
        let device_id = Uuid::new_v4();
        let challenge = ConnectChallenge {
            challenge: vec![1; 32],
            salt: vec![2; 16],
        };
        f.negotiator
            .resolve_reconnect(device(&f, 1), device_id, challenge);
        f.transport.deliver(1, peer_versions((2, 3), (2, 4)));

        assert_eq!(
            f.outcome.failed.lock().as_slice(),
            [NegotiationError::Storage(StorageError::MissingSecret(device_id))]
        );
        assert!(f.outcome.resolved.lock().is_empty());
    }

    async fn reconnect_with_challenge(response: Vec<u8>) -> (Fixture, Vec<u8>) {
        let mut f = fixture(true);
        let device_id = Uuid::new_v4();
        let secret = [7u8; 32];
        f.storage
            .add_associated_device(AssociatedDevice::new(device_id, 10))
            .unwrap();
        f.storage.save_challenge_secret(device_id, &secret).unwrap();

        let salt = vec![3u8; 16];
        let challenge = ConnectChallenge {
            challenge: hmac_sha256(&secret, &salt),
            salt,
        };
        f.negotiator
            .resolve_reconnect(device(&f, 1), device_id, challenge);
        f.transport.deliver(1, peer_versions((2, 3), (2, 4)));
        next_write(&mut f.rx).await;
        assert_eq!(
            f.negotiator.state(),
            NegotiationState::AwaitingChallengeResponse
        );

        let bytes = DeviceMessage::handshake(response).to_msgpack().unwrap();
        for packet in packetize(0, &bytes, 256).unwrap() {
            f.transport.deliver(1, packet.encode());
        }
        (f, secret.to_vec())
    }

    #[tokio::test]
    async fn test_reconnect_challenge_success() {
        let secret = [7u8; 32];
        let device_challenge = b"device-challenge".to_vec();
        let mut response = hmac_sha256(&secret, &[3u8; 16]);
        response.extend_from_slice(&device_challenge);

        let (mut f, secret) = reconnect_with_challenge(response).await;
        assert_eq!(f.negotiator.state(), NegotiationState::Resolved);
        assert_eq!(f.outcome.resolved.lock().len(), 1);

        let mut reassembler = Reassembler::new();
        let packet = Packet::decode(&next_write(&mut f.rx).await).unwrap();
        let PacketOutcome::Complete(bytes) = reassembler.accept(packet).unwrap() else {
            panic!("challenge answer should fit in one packet");
        };
        let answer = DeviceMessage::from_msgpack(&bytes).unwrap();
        assert_eq!(answer.operation, OperationType::Handshake);
        assert_eq!(answer.payload, hmac_sha256(&secret, &device_challenge));
    }

    /// Runs a reconnect handshake from the device side keyed with `key_input`.
    fn device_handshake(f: &Fixture, secret: &[u8], key_input: &[u8]) {
        let key = ReconnectKey::from_slice(&hmac_sha256(secret, key_input)).unwrap();
        let mut noise = NoiseSession::reconnect(Role::Initiator, &key).unwrap();
        let msg1 = noise.write_handshake_message(&[]).unwrap();
        let bytes = DeviceMessage::handshake(msg1).to_msgpack().unwrap();
        for packet in packetize(1, &bytes, 256).unwrap() {
            f.transport.deliver(1, packet.encode());
        }
    }

    #[tokio::test]
    async fn test_reconnect_channel_keyed_by_challenge_secret() {
        let secret = [7u8; 32];
        let challenge = hmac_sha256(&secret, &[3u8; 16]);
        let mut response = challenge.clone();
        response.extend_from_slice(b"device-challenge");

        let (f, _) = reconnect_with_challenge(response.clone()).await;
        device_handshake(&f, &secret, &response);

        let resolved = f.outcome.resolved.lock();
        assert!(resolved[0].0.is_established());
    }

    #[tokio::test]
    async fn test_reconnect_channel_rejects_unkeyed_device() {
        let secret = [7u8; 32];
        let mut response = hmac_sha256(&secret, &[3u8; 16]);
        response.extend_from_slice(b"device-challenge");

        let (f, _) = reconnect_with_challenge(response.clone()).await;
        // Knows the challenge bytes seen on the air, but not the secret.
        device_handshake(&f, &[0u8; 32], &response);

        let resolved = f.outcome.resolved.lock();
        assert!(!resolved[0].0.is_established());
    }

    #[tokio::test]
    async fn test_reconnect_challenge_mismatch() {
        let mut response = vec![0u8; 32];
        response.extend_from_slice(b"device-challenge");

        let (f, _) = reconnect_with_challenge(response).await;
        assert_eq!(
            f.outcome.failed.lock().as_slice(),
            [NegotiationError::ChallengeMismatch]
        );
        assert!(f.outcome.resolved.lock().is_empty());
        assert!(!f.transport.has_data_listener(1));
    }

    #[tokio::test]
    async fn test_reconnect_short_response_mismatch() {
        let (f, _) = reconnect_with_challenge(vec![1, 2, 3]).await;
        assert_eq!(
            f.outcome.failed.lock().as_slice(),
            [NegotiationError::ChallengeMismatch]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_before_first_contact() {
        let f = fixture(false);
        f.negotiator.resolve_association(device(&f, 1), None);
        tokio::time::sleep(Duration::from_secs(11)).await;

        assert_eq!(
            f.outcome.failed.lock().as_slice(),
            [NegotiationError::Timeout]
        );
        assert!(!f.transport.has_data_listener(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_is_silent() {
        let f = fixture(false);
        f.negotiator.resolve_association(device(&f, 1), None);
        f.negotiator.cancel();
        tokio::time::sleep(Duration::from_secs(11)).await;

        assert!(f.outcome.failed.lock().is_empty());
        assert!(!f.transport.has_data_listener(1));
        assert_eq!(f.negotiator.state(), NegotiationState::Error);
    }

    #[tokio::test]
    async fn test_losing_primary_fails() {
        let f = fixture(true);
        f.negotiator.resolve_reconnect(
            device(&f, 1),
            Uuid::new_v4(),
            ConnectChallenge {
                challenge: vec![1; 32],
                salt: vec![0; 16],
            },
        );
        f.transport.deliver(1, peer_versions((2, 3), (2, 4)));
        f.negotiator.remove_protocol_device(&device(&f, 1));

        assert!(matches!(
            f.outcome.failed.lock().as_slice(),
            [NegotiationError::Transport(_)]
        ));
    }
}
