//! In-memory loopback transport.
//!
//! `MemoryTransport` implements [`Transport`] without any radio or socket.
//! Bytes written by the host come out of the receiver returned by
//! [`MemoryTransport::new`]; bytes from the simulated device are pushed in
//! with [`MemoryTransport::deliver`]. It is used by the integration tests and
//! by local tooling that drives the stack end to end.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use companion_protocol::ConnectChallenge;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use uuid::Uuid;

use super::{
    ConnectionId, DataListener, DisconnectListener, DiscoveryCallback, DiscoveryKind,
    ProtocolDevice, SendFuture, Transport, TransportError,
};

/// What the transport is currently advertising.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Advertisement {
    /// Association under the given name.
    Association { name: String },
    /// A reconnect challenge for one device.
    Reconnect {
        device_id: Uuid,
        challenge: ConnectChallenge,
    },
}

struct Discovery {
    advertisement: Advertisement,
    callback: Arc<dyn DiscoveryCallback>,
}

#[derive(Default)]
struct MemoryState {
    discoveries: HashMap<DiscoveryKind, Discovery>,
    connected: HashSet<ConnectionId>,
    data_listeners: HashMap<ConnectionId, Arc<dyn DataListener>>,
    disconnect_listeners: HashMap<ConnectionId, Arc<dyn DisconnectListener>>,
    disconnect_requests: Vec<ConnectionId>,
}

/// Loopback [`Transport`] backed by channels.
pub struct MemoryTransport {
    name: String,
    me: Weak<MemoryTransport>,
    max_write_size: AtomicUsize,
    requires_verification: bool,
    fail_sends: AtomicBool,
    fail_discovery: AtomicBool,
    outbound: mpsc::UnboundedSender<(ConnectionId, Vec<u8>)>,
    state: Mutex<MemoryState>,
}

impl MemoryTransport {
    /// Creates a transport and the receiver for everything the host writes.
    pub fn new(
        name: &str,
        max_write_size: usize,
        requires_device_verification: bool,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<(ConnectionId, Vec<u8>)>) {
        let (outbound, rx) = mpsc::unbounded_channel();
        let transport = Arc::new_cyclic(|me| Self {
            name: name.to_string(),
            me: me.clone(),
            max_write_size: AtomicUsize::new(max_write_size),
            requires_verification: requires_device_verification,
            fail_sends: AtomicBool::new(false),
            fail_discovery: AtomicBool::new(false),
            outbound,
            state: Mutex::new(MemoryState::default()),
        });
        (transport, rx)
    }

    /// Makes every following write fail (or succeed again).
    pub fn set_fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    /// Makes every following discovery request fail (or succeed again).
    pub fn set_fail_discovery(&self, fail: bool) {
        self.fail_discovery.store(fail, Ordering::SeqCst);
    }

    pub fn set_max_write_size(&self, size: usize) {
        self.max_write_size.store(size, Ordering::SeqCst);
    }

    /// Returns the active advertisement of the given kind.
    pub fn advertisement(&self, kind: DiscoveryKind) -> Option<Advertisement> {
        self.state
            .lock()
            .discoveries
            .get(&kind)
            .map(|discovery| discovery.advertisement.clone())
    }

    /// Simulates a device connecting in response to an advertisement.
    ///
    /// Returns `false` if nothing of that kind is being advertised.
    pub fn connect(&self, kind: DiscoveryKind, connection: ConnectionId) -> bool {
        let callback = {
            let mut state = self.state.lock();
            let Some(discovery) = state.discoveries.get(&kind) else {
                return false;
            };
            let callback = Arc::clone(&discovery.callback);
            state.connected.insert(connection);
            callback
        };

        let Some(me) = self.me.upgrade() else {
            return false;
        };
        tracing::debug!(transport = %self.name, connection, ?kind, "Loopback device connected");
        callback.on_device_connected(ProtocolDevice::new(me, connection));
        true
    }

    /// Pushes bytes from the device to the registered data listener.
    ///
    /// Returns `false` if no listener is registered for the connection.
    pub fn deliver(&self, connection: ConnectionId, data: Vec<u8>) -> bool {
        let listener = {
            let state = self.state.lock();
            if !state.connected.contains(&connection) {
                return false;
            }
            state.data_listeners.get(&connection).cloned()
        };
        match listener {
            Some(listener) => {
                listener.on_data_received(connection, data);
                true
            }
            None => false,
        }
    }

    /// Simulates the device side dropping the connection.
    pub fn drop_connection(&self, connection: ConnectionId) {
        let listener = {
            let mut state = self.state.lock();
            if !state.connected.remove(&connection) {
                return;
            }
            state.data_listeners.remove(&connection);
            state.disconnect_listeners.remove(&connection)
        };
        tracing::debug!(transport = %self.name, connection, "Loopback connection dropped");
        if let Some(listener) = listener {
            listener.on_device_disconnected(connection);
        }
    }

    pub fn is_connected(&self, connection: ConnectionId) -> bool {
        self.state.lock().connected.contains(&connection)
    }

    pub fn has_data_listener(&self, connection: ConnectionId) -> bool {
        self.state.lock().data_listeners.contains_key(&connection)
    }

    pub fn has_disconnect_listener(&self, connection: ConnectionId) -> bool {
        self.state.lock().disconnect_listeners.contains_key(&connection)
    }

    /// Connections the host asked to disconnect, in order.
    pub fn disconnect_requests(&self) -> Vec<ConnectionId> {
        self.state.lock().disconnect_requests.clone()
    }

    fn start_discovery(
        &self,
        kind: DiscoveryKind,
        advertisement: Advertisement,
        callback: Arc<dyn DiscoveryCallback>,
    ) {
        if self.fail_discovery.load(Ordering::SeqCst) {
            let error =
                TransportError::DiscoveryFailed(format!("{} discovery disabled", self.name));
            callback.on_discovery_failed(&self.name, &error);
            return;
        }

        self.state.lock().discoveries.insert(
            kind,
            Discovery {
                advertisement,
                callback: Arc::clone(&callback),
            },
        );
        callback.on_discovery_started(&self.name);
    }
}

impl Transport for MemoryTransport {
    fn name(&self) -> &str {
        &self.name
    }

    fn send_data(&self, connection: ConnectionId, data: Vec<u8>) -> SendFuture<'_> {
        let result = if self.fail_sends.load(Ordering::SeqCst) {
            Err(TransportError::WriteFailed("simulated write failure".into()))
        } else if !self.is_connected(connection) {
            Err(TransportError::NotConnected(connection))
        } else if data.len() > self.max_write_size(connection) {
            Err(TransportError::WriteFailed(format!(
                "write of {} bytes exceeds max write size",
                data.len()
            )))
        } else {
            self.outbound
                .send((connection, data))
                .map_err(|_| TransportError::WriteFailed("loopback receiver dropped".into()))
        };
        Box::pin(async move { result })
    }

    fn max_write_size(&self, _connection: ConnectionId) -> usize {
        self.max_write_size.load(Ordering::SeqCst)
    }

    fn requires_device_verification(&self) -> bool {
        self.requires_verification
    }

    fn disconnect(&self, connection: ConnectionId) {
        self.state.lock().disconnect_requests.push(connection);
        self.drop_connection(connection);
    }

    fn register_data_listener(&self, connection: ConnectionId, listener: Arc<dyn DataListener>) {
        self.state.lock().data_listeners.insert(connection, listener);
    }

    fn unregister_data_listener(&self, connection: ConnectionId) {
        self.state.lock().data_listeners.remove(&connection);
    }

    fn register_disconnect_listener(
        &self,
        connection: ConnectionId,
        listener: Arc<dyn DisconnectListener>,
    ) {
        self.state
            .lock()
            .disconnect_listeners
            .insert(connection, listener);
    }

    fn unregister_disconnect_listener(&self, connection: ConnectionId) {
        self.state.lock().disconnect_listeners.remove(&connection);
    }

    fn start_association_discovery(&self, name: &str, callback: Arc<dyn DiscoveryCallback>) {
        self.start_discovery(
            DiscoveryKind::Association,
            Advertisement::Association {
                name: name.to_string(),
            },
            callback,
        );
    }

    fn start_reconnect_discovery(
        &self,
        device_id: Uuid,
        challenge: &ConnectChallenge,
        callback: Arc<dyn DiscoveryCallback>,
    ) {
        self.start_discovery(
            DiscoveryKind::Reconnect(device_id),
            Advertisement::Reconnect {
                device_id,
                challenge: challenge.clone(),
            },
            callback,
        );
    }

    fn stop_discovery(&self, kind: DiscoveryKind) {
        if self.state.lock().discoveries.remove(&kind).is_some() {
            tracing::debug!(transport = %self.name, ?kind, "Discovery stopped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as PlMutex;

    #[derive(Default)]
    struct Recorder {
        connected: PlMutex<Vec<ProtocolDevice>>,
        started: PlMutex<Vec<String>>,
        failed: PlMutex<Vec<String>>,
        data: PlMutex<Vec<(ConnectionId, Vec<u8>)>>,
        disconnected: PlMutex<Vec<ConnectionId>>,
    }

    impl DiscoveryCallback for Recorder {
        fn on_discovery_started(&self, transport: &str) {
            self.started.lock().push(transport.to_string());
        }

        fn on_discovery_failed(&self, transport: &str, _error: &TransportError) {
            self.failed.lock().push(transport.to_string());
        }

        fn on_device_connected(&self, device: ProtocolDevice) {
            self.connected.lock().push(device);
        }
    }

    impl DataListener for Recorder {
        fn on_data_received(&self, connection: ConnectionId, data: Vec<u8>) {
            self.data.lock().push((connection, data));
        }
    }

    impl DisconnectListener for Recorder {
        fn on_device_disconnected(&self, connection: ConnectionId) {
            self.disconnected.lock().push(connection);
        }
    }

    #[test]
    fn test_connect_requires_advertisement() {
        let (transport, _rx) = MemoryTransport::new("mem", 64, false);
        assert!(!transport.connect(DiscoveryKind::Association, 1));

        let recorder = Arc::new(Recorder::default());
        transport.start_association_discovery("Car", recorder.clone());
        assert_eq!(recorder.started.lock().as_slice(), ["mem"]);
        assert_eq!(
            transport.advertisement(DiscoveryKind::Association),
            Some(Advertisement::Association { name: "Car".into() })
        );

        assert!(transport.connect(DiscoveryKind::Association, 1));
        assert_eq!(recorder.connected.lock()[0].connection_id(), 1);

        transport.stop_discovery(DiscoveryKind::Association);
        assert!(!transport.connect(DiscoveryKind::Association, 2));
    }

    #[test]
    fn test_discovery_failure_reported() {
        let (transport, _rx) = MemoryTransport::new("mem", 64, false);
        transport.set_fail_discovery(true);
        let recorder = Arc::new(Recorder::default());
        transport.start_association_discovery("Car", recorder.clone());
        assert_eq!(recorder.failed.lock().len(), 1);
        assert!(transport.advertisement(DiscoveryKind::Association).is_none());
    }

    #[test]
    fn test_deliver_and_disconnect() {
        let (transport, _rx) = MemoryTransport::new("mem", 64, false);
        let recorder = Arc::new(Recorder::default());
        transport.start_association_discovery("Car", recorder.clone());
        transport.connect(DiscoveryKind::Association, 3);

        assert!(!transport.deliver(3, vec![1]));
        transport.register_data_listener(3, recorder.clone());
        transport.register_disconnect_listener(3, recorder.clone());
        assert!(transport.deliver(3, vec![1, 2]));
        assert_eq!(recorder.data.lock().as_slice(), [(3, vec![1, 2])]);

        transport.disconnect(3);
        assert_eq!(recorder.disconnected.lock().as_slice(), [3]);
        assert_eq!(transport.disconnect_requests(), vec![3]);
        assert!(!transport.is_connected(3));

        // Second disconnect is silent.
        transport.disconnect(3);
        assert_eq!(recorder.disconnected.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_send_data_reaches_receiver() {
        let (transport, mut rx) = MemoryTransport::new("mem", 4, false);
        let recorder = Arc::new(Recorder::default());
        transport.start_association_discovery("Car", recorder);
        transport.connect(DiscoveryKind::Association, 9);

        transport.send_data(9, vec![1, 2, 3]).await.unwrap();
        assert_eq!(rx.recv().await, Some((9, vec![1, 2, 3])));

        assert!(transport.send_data(9, vec![0; 5]).await.is_err());
        assert_eq!(
            transport.send_data(10, vec![1]).await,
            Err(TransportError::NotConnected(10))
        );

        transport.set_fail_sends(true);
        assert!(transport.send_data(9, vec![1]).await.is_err());
    }
}
