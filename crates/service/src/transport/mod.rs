//! Transport abstraction for device connections.
//!
//! A transport (BLE, a socket, the in-memory loopback used by tests) moves
//! raw byte buffers to and from a connected device. Everything above it
//! (packets, negotiation, encryption) is transport-agnostic and talks to a
//! connection through a [`ProtocolDevice`] handle.
//!
//! Each connection has at most one data listener and one disconnect
//! listener; registering a new one replaces the previous one.

pub mod memory;

use std::future::Future;
use std::hash::{Hash, Hasher};
use std::pin::Pin;
use std::sync::Arc;

use companion_protocol::ConnectChallenge;
use thiserror::Error;
use uuid::Uuid;

pub use memory::{Advertisement, MemoryTransport};

/// Transport-scoped connection identifier.
pub type ConnectionId = u64;

/// Future returned by [`Transport::send_data`].
pub type SendFuture<'a> = Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + 'a>>;

/// Errors reported by a transport.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("connection {0} is not connected")]
    NotConnected(ConnectionId),

    #[error("write failed: {0}")]
    WriteFailed(String),

    #[error("discovery failed: {0}")]
    DiscoveryFailed(String),
}

/// Which advertisement a discovery call refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DiscoveryKind {
    /// Advertising to devices that want to associate.
    Association,
    /// Advertising a reconnect challenge to one known device.
    Reconnect(Uuid),
}

/// Receives raw bytes read from a connection.
pub trait DataListener: Send + Sync {
    fn on_data_received(&self, connection: ConnectionId, data: Vec<u8>);
}

/// Notified when a connection drops.
pub trait DisconnectListener: Send + Sync {
    fn on_device_disconnected(&self, connection: ConnectionId);
}

/// Receives the outcome of a discovery request.
pub trait DiscoveryCallback: Send + Sync {
    /// Discovery is running on `transport`.
    fn on_discovery_started(&self, _transport: &str) {}

    /// Discovery could not be started on `transport`.
    fn on_discovery_failed(&self, _transport: &str, _error: &TransportError) {}

    /// A device connected in response to the advertisement.
    fn on_device_connected(&self, device: ProtocolDevice);
}

/// A link layer capable of carrying Companion Link traffic.
///
/// Implementations must not hold internal locks while invoking listeners
/// or discovery callbacks.
pub trait Transport: Send + Sync {
    /// Short, unique transport name (e.g. `"ble"`).
    fn name(&self) -> &str;

    /// Writes one buffer to a connection.
    ///
    /// The future resolves once the transport has accepted the write.
    fn send_data(&self, connection: ConnectionId, data: Vec<u8>) -> SendFuture<'_>;

    /// Largest buffer a single write may carry on this connection.
    fn max_write_size(&self, connection: ConnectionId) -> usize;

    /// Whether reconnecting devices must answer the identity challenge.
    fn requires_device_verification(&self) -> bool;

    /// Drops a connection. Fires its disconnect listener.
    fn disconnect(&self, connection: ConnectionId);

    fn register_data_listener(&self, connection: ConnectionId, listener: Arc<dyn DataListener>);

    fn unregister_data_listener(&self, connection: ConnectionId);

    fn register_disconnect_listener(
        &self,
        connection: ConnectionId,
        listener: Arc<dyn DisconnectListener>,
    );

    fn unregister_disconnect_listener(&self, connection: ConnectionId);

    /// Starts advertising for association under `name`.
    fn start_association_discovery(&self, name: &str, callback: Arc<dyn DiscoveryCallback>);

    /// Starts advertising `challenge` to the known device `device_id`.
    fn start_reconnect_discovery(
        &self,
        device_id: Uuid,
        challenge: &ConnectChallenge,
        callback: Arc<dyn DiscoveryCallback>,
    );

    /// Stops an advertisement started earlier. Stopping twice is a no-op.
    fn stop_discovery(&self, kind: DiscoveryKind);
}

/// One connection on one transport.
///
/// Equality and hashing use the transport name and connection id, so the
/// same handle can be rebuilt from a callback and still match.
#[derive(Clone)]
pub struct ProtocolDevice {
    transport: Arc<dyn Transport>,
    connection: ConnectionId,
}

impl ProtocolDevice {
    pub fn new(transport: Arc<dyn Transport>, connection: ConnectionId) -> Self {
        Self {
            transport,
            connection,
        }
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn transport_name(&self) -> &str {
        self.transport.name()
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection
    }

    pub fn send_data(&self, data: Vec<u8>) -> SendFuture<'_> {
        self.transport.send_data(self.connection, data)
    }

    pub fn max_write_size(&self) -> usize {
        self.transport.max_write_size(self.connection)
    }

    pub fn requires_device_verification(&self) -> bool {
        self.transport.requires_device_verification()
    }

    pub fn disconnect(&self) {
        self.transport.disconnect(self.connection);
    }

    pub fn register_data_listener(&self, listener: Arc<dyn DataListener>) {
        self.transport.register_data_listener(self.connection, listener);
    }

    pub fn unregister_data_listener(&self) {
        self.transport.unregister_data_listener(self.connection);
    }

    pub fn register_disconnect_listener(&self, listener: Arc<dyn DisconnectListener>) {
        self.transport
            .register_disconnect_listener(self.connection, listener);
    }

    pub fn unregister_disconnect_listener(&self) {
        self.transport.unregister_disconnect_listener(self.connection);
    }
}

impl PartialEq for ProtocolDevice {
    fn eq(&self, other: &Self) -> bool {
        self.connection == other.connection && self.transport.name() == other.transport.name()
    }
}

impl Eq for ProtocolDevice {}

impl Hash for ProtocolDevice {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.transport.name().hash(state);
        self.connection.hash(state);
    }
}

impl std::fmt::Debug for ProtocolDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.transport.name(), self.connection)
    }
}

impl std::fmt::Display for ProtocolDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.transport.name(), self.connection)
    }
}
