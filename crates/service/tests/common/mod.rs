//! Simulated companion device for integration tests.
//!
//! A `PeerDevice` plays the phone's side of the protocol over a
//! [`MemoryTransport`]: version exchange, reconnect challenge, Noise
//! initiator, verification and encrypted messaging.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use companion_protocol::compression::decompress;
use companion_protocol::crypto::{generate_challenge_secret, hmac_sha256, random_bytes};
use companion_protocol::messages::{from_msgpack, to_msgpack};
use companion_protocol::{
    packetize, ConnectChallenge, DeviceMessage, NoiseSession, OperationType, Packet,
    PacketOutcome, Reassembler, ReconnectKey, Role, SessionKey, VerificationCode,
    VerificationState, VersionExchange, CHALLENGE_SECRET_LENGTH,
};
use companion_service::transport::{
    Advertisement, ConnectionId, DiscoveryKind, MemoryTransport, Transport,
};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use uuid::Uuid;

use companion_service::controller::{AssociationCallback, ConnectionCallback, ControllerError};

pub const RECV_TIMEOUT: Duration = Duration::from_secs(2);

/// Everything the host wrote to the loopback transport.
pub type HostWrites = mpsc::UnboundedReceiver<(ConnectionId, Vec<u8>)>;

pub fn versions(messaging: (i32, i32), security: (i32, i32)) -> VersionExchange {
    VersionExchange {
        min_messaging_version: messaging.0,
        max_messaging_version: messaging.1,
        min_security_version: security.0,
        max_security_version: security.1,
    }
}

pub struct PeerDevice {
    pub id: Uuid,
    pub secret: [u8; CHALLENGE_SECRET_LENGTH],
    pub transport: Arc<MemoryTransport>,
    pub connection: ConnectionId,
    writes: HostWrites,
    reassembler: Reassembler,
    next_message_id: i32,
    noise: NoiseSession,
    key: Option<SessionKey>,
}

impl PeerDevice {
    pub fn new(
        transport: Arc<MemoryTransport>,
        writes: HostWrites,
        connection: ConnectionId,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            secret: generate_challenge_secret(),
            transport,
            connection,
            writes,
            reassembler: Reassembler::new(),
            next_message_id: 0,
            noise: NoiseSession::new_initiator().unwrap(),
            key: None,
        }
    }

    /// Resets per-connection state and switches to a new connection id.
    pub fn reconnect_as(&mut self, connection: ConnectionId) {
        self.connection = connection;
        self.reassembler = Reassembler::new();
        self.next_message_id = 0;
        self.noise = NoiseSession::new_initiator().unwrap();
        self.key = None;
    }

    pub fn connect(&self, kind: DiscoveryKind) -> bool {
        self.transport.connect(kind, self.connection)
    }

    pub fn drop_connection(&self) {
        self.transport.drop_connection(self.connection);
    }

    /// The reconnect challenge currently advertised for this device.
    pub fn advertised_challenge(&self) -> ConnectChallenge {
        match self.transport.advertisement(DiscoveryKind::Reconnect(self.id)) {
            Some(Advertisement::Reconnect { device_id, challenge }) => {
                assert_eq!(device_id, self.id);
                challenge
            }
            other => panic!("expected reconnect advertisement, got {:?}", other),
        }
    }

    async fn next_write(&mut self) -> Vec<u8> {
        loop {
            let (connection, data) = tokio::time::timeout(RECV_TIMEOUT, self.writes.recv())
                .await
                .expect("timed out waiting for host write")
                .expect("transport closed");
            if connection == self.connection {
                return data;
            }
        }
    }

    /// Returns true if the host wrote nothing within `wait`.
    pub async fn is_quiet(&mut self, wait: Duration) -> bool {
        tokio::time::timeout(wait, self.writes.recv()).await.is_err()
    }

    // ---- Negotiation ----------------------------------------------------

    /// Sends the raw version exchange and returns the host's reply.
    pub async fn exchange_versions(&mut self, ours: VersionExchange) -> VersionExchange {
        assert!(self
            .transport
            .deliver(self.connection, ours.to_msgpack().unwrap()));
        VersionExchange::from_msgpack(&self.next_write().await).unwrap()
    }

    /// Sends the version exchange without waiting for a reply.
    pub fn send_versions(&self, ours: VersionExchange) {
        self.transport
            .deliver(self.connection, ours.to_msgpack().unwrap());
    }

    /// Answers the host's reconnect challenge and checks the host's proof.
    pub async fn answer_challenge(&mut self, challenge: &ConnectChallenge) {
        assert_eq!(
            challenge.challenge,
            hmac_sha256(&self.secret, &challenge.salt),
            "host does not know our secret"
        );
        let device_challenge = random_bytes(16);
        let mut response = challenge.challenge.clone();
        response.extend_from_slice(&device_challenge);
        self.send(&DeviceMessage::handshake(response.clone()));

        let proof = self.recv().await;
        assert_eq!(proof.operation, OperationType::Handshake);
        assert_eq!(proof.payload, hmac_sha256(&self.secret, &device_challenge));
        self.key_handshake(&response);
    }

    /// Keys the next handshake for a reconnect without a challenge exchange.
    pub fn prepare_reconnect(&mut self, challenge: &ConnectChallenge) {
        self.key_handshake(&challenge.challenge);
    }

    /// Switches to the unkeyed association handshake.
    pub fn forget_reconnect_key(&mut self) {
        self.noise = NoiseSession::new_initiator().unwrap();
    }

    fn key_handshake(&mut self, key_input: &[u8]) {
        let key = ReconnectKey::from_slice(&hmac_sha256(&self.secret, key_input)).unwrap();
        self.noise = NoiseSession::reconnect(Role::Initiator, &key).unwrap();
    }

    /// Sends a challenge response computed with the wrong secret.
    pub fn answer_challenge_wrongly(&mut self, challenge: &ConnectChallenge) {
        let mut response = hmac_sha256(&[0u8; CHALLENGE_SECRET_LENGTH], &challenge.salt);
        response.extend_from_slice(&random_bytes(16));
        self.send(&DeviceMessage::handshake(response));
    }

    // ---- Packets --------------------------------------------------------

    pub fn send(&mut self, message: &DeviceMessage) {
        let bytes = message.to_msgpack().unwrap();
        let max = self.transport.max_write_size(self.connection);
        for packet in packetize(self.next_message_id, &bytes, max).unwrap() {
            assert!(self.transport.deliver(self.connection, packet.encode()));
        }
        self.next_message_id = self.next_message_id.wrapping_add(1);
    }

    pub async fn recv(&mut self) -> DeviceMessage {
        loop {
            let data = self.next_write().await;
            let packet = Packet::decode(&data).unwrap();
            if let PacketOutcome::Complete(bytes) = self.reassembler.accept(packet).unwrap() {
                return DeviceMessage::from_msgpack(&bytes).unwrap();
            }
        }
    }

    // ---- Secure channel -------------------------------------------------

    /// Sends the first Noise message without waiting for the host.
    pub fn start_handshake(&mut self) {
        let first = self.noise.write_handshake_message(&[]).unwrap();
        self.send(&DeviceMessage::handshake(first));
    }

    /// Runs the Noise initiator and returns the handshake hash.
    pub async fn handshake(&mut self) -> Vec<u8> {
        let first = self.noise.write_handshake_message(&[]).unwrap();
        self.send(&DeviceMessage::handshake(first));

        let reply = self.recv().await;
        assert_eq!(reply.operation, OperationType::Handshake);
        self.noise.read_handshake_message(&reply.payload).unwrap();
        let hash = self.noise.handshake_hash().unwrap();
        self.key = Some(self.noise.into_session_key().unwrap());
        hash
    }

    pub fn send_verification(&mut self, state: VerificationState, payload: Option<Vec<u8>>) {
        let code = to_msgpack(&VerificationCode { state, payload }).unwrap();
        self.send(&DeviceMessage::handshake(code));
    }

    pub async fn recv_verification(&mut self) -> VerificationCode {
        let message = self.recv().await;
        assert_eq!(message.operation, OperationType::Handshake);
        from_msgpack(&message.payload).unwrap()
    }

    pub fn send_encrypted(
        &mut self,
        operation: OperationType,
        recipient: Option<Uuid>,
        plaintext: &[u8],
    ) {
        let sealed = self
            .key
            .as_ref()
            .expect("handshake not complete")
            .encrypt(plaintext)
            .unwrap();
        self.send(&DeviceMessage::encrypted(operation, recipient, sealed));
    }

    /// Receives an encrypted message and returns it with a plaintext payload.
    pub async fn recv_decrypted(&mut self) -> DeviceMessage {
        let mut message = self.recv().await;
        assert!(message.is_payload_encrypted);
        let plain = self
            .key
            .as_ref()
            .expect("handshake not complete")
            .decrypt(&message.payload)
            .unwrap();
        message.payload = if message.original_size > 0 {
            decompress(&plain, message.original_size as usize).unwrap()
        } else {
            plain
        };
        message.is_payload_encrypted = false;
        message
    }

    /// Sends `device_id || secret` after the host announced itself.
    pub fn send_identity(&mut self) {
        let mut identity = self.id.as_bytes().to_vec();
        identity.extend_from_slice(&self.secret);
        self.send_encrypted(OperationType::ClientMessage, None, &identity);
    }
}

/// Records controller events in the order they fire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Connected(Uuid),
    Disconnected(Uuid),
    Established(Uuid),
    Message(Uuid, DeviceMessage),
    AssociationStarted(String, Option<Vec<u8>>),
    AssociationStartFailed,
    VerificationCode(String),
    AssociationCompleted(Uuid),
    AssociationError(String),
}

#[derive(Default)]
pub struct Recorder {
    events: Mutex<Vec<Event>>,
}

impl Recorder {
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    pub fn count(&self, matches: impl Fn(&Event) -> bool) -> usize {
        self.events.lock().iter().filter(|event| matches(event)).count()
    }

    pub fn last_code(&self) -> Option<String> {
        self.events.lock().iter().rev().find_map(|event| match event {
            Event::VerificationCode(code) => Some(code.clone()),
            _ => None,
        })
    }

    pub fn oob_data(&self) -> Option<Vec<u8>> {
        self.events.lock().iter().find_map(|event| match event {
            Event::AssociationStarted(_, data) => data.clone(),
            _ => None,
        })
    }

    fn push(&self, event: Event) {
        self.events.lock().push(event);
    }
}

impl ConnectionCallback for Recorder {
    fn on_device_connected(&self, device_id: Uuid) {
        self.push(Event::Connected(device_id));
    }

    fn on_device_disconnected(&self, device_id: Uuid) {
        self.push(Event::Disconnected(device_id));
    }

    fn on_secure_channel_established(&self, device_id: Uuid) {
        self.push(Event::Established(device_id));
    }

    fn on_message_received(&self, device_id: Uuid, message: DeviceMessage) {
        self.push(Event::Message(device_id, message));
    }
}

impl AssociationCallback for Recorder {
    fn on_association_started(&self, name: &str, oob_data: Option<Vec<u8>>) {
        self.push(Event::AssociationStarted(name.to_string(), oob_data));
    }

    fn on_association_start_failed(&self) {
        self.push(Event::AssociationStartFailed);
    }

    fn on_verification_code_available(&self, code: &str) {
        self.push(Event::VerificationCode(code.to_string()));
    }

    fn on_association_completed(&self, device_id: Uuid) {
        self.push(Event::AssociationCompleted(device_id));
    }

    fn on_association_error(&self, error: &ControllerError) {
        self.push(Event::AssociationError(format!("{:?}", error)));
    }
}
