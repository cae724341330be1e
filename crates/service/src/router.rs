//! Routing of application messages to feature subscribers.
//!
//! Every feature subscribes with a stable recipient id per device. Inbound
//! messages are delivered to the matching subscriber, or buffered until one
//! registers. A second live registration for the same `(device, recipient)`
//! pair is treated as an attempt to intercept another feature's traffic: the
//! recipient id is blocked for the rest of the process lifetime and both
//! subscribers are told.
//!
//! Connection events are fanned out to driver-only, passenger-only and
//! all-device subscriber lists, classified by the device's owning user.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Weak};

use companion_protocol::messages::{from_msgpack, to_msgpack};
use companion_protocol::{DeviceMessage, OperationType, ProtocolError, Query, QueryResponse};
use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use parking_lot::RwLock;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, trace, warn};
use uuid::Uuid;

use crate::cache::ResponseCache;
use crate::controller::{ConnectionCallback, ConnectionController, ControllerError};

/// A message as seen by a feature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeatureMessage {
    Message(Vec<u8>),
    Query(Query),
    QueryResponse(QueryResponse),
}

/// Errors reported to a feature subscriber.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum DeviceError {
    #[error("recipient id registered twice and is now blocked")]
    InsecureRecipientIdDetected,
}

#[derive(Debug, Error)]
pub enum RouterError {
    #[error("recipient {0} is blocked")]
    RecipientBlocked(Uuid),

    #[error(transparent)]
    Controller(#[from] ControllerError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// A feature subscribed to one device under one recipient id.
pub trait DeviceCallback: Send + Sync {
    fn on_message_received(&self, device_id: Uuid, message: FeatureMessage);

    fn on_device_error(&self, device_id: Uuid, error: DeviceError);

    /// Dead subscribers are evicted on registration and delivery.
    fn is_alive(&self) -> bool {
        true
    }
}

/// Event delivered through a [`ChannelSubscriber`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriberEvent {
    Message {
        device_id: Uuid,
        message: FeatureMessage,
    },
    Error {
        device_id: Uuid,
        error: DeviceError,
    },
}

/// Subscriber backed by a tokio channel. Dropping the receiver marks it dead.
#[derive(Debug)]
pub struct ChannelSubscriber {
    tx: mpsc::UnboundedSender<SubscriberEvent>,
}

impl ChannelSubscriber {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<SubscriberEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }
}

impl DeviceCallback for ChannelSubscriber {
    fn on_message_received(&self, device_id: Uuid, message: FeatureMessage) {
        let _ = self.tx.send(SubscriberEvent::Message { device_id, message });
    }

    fn on_device_error(&self, device_id: Uuid, error: DeviceError) {
        let _ = self.tx.send(SubscriberEvent::Error { device_id, error });
    }

    fn is_alive(&self) -> bool {
        !self.tx.is_closed()
    }
}

/// Which devices a connection subscriber hears about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Audience {
    Driver,
    Passenger,
    All,
}

type CallbackList = RwLock<Arc<Vec<Arc<dyn ConnectionCallback>>>>;

/// Dispatches device messages to feature subscribers.
pub struct MessageRouter {
    controller: Arc<ConnectionController>,
    cache: ResponseCache,
    blocked: DashSet<Uuid>,
    /// Keyed by `(device, recipient)`.
    subscribers: DashMap<(Uuid, Uuid), Arc<dyn DeviceCallback>>,
    /// Keyed by `(recipient, device)`, in arrival order.
    missed: DashMap<(Uuid, Uuid), Vec<FeatureMessage>>,
    driver_callbacks: CallbackList,
    passenger_callbacks: CallbackList,
    all_callbacks: CallbackList,
    query_ids: DashMap<Uuid, AtomicI32>,
}

struct RouterEvents {
    router: Weak<MessageRouter>,
}

impl ConnectionCallback for RouterEvents {
    fn on_device_connected(&self, device_id: Uuid) {
        if let Some(router) = self.router.upgrade() {
            router.fan_out(device_id, |callback| callback.on_device_connected(device_id));
        }
    }

    fn on_device_disconnected(&self, device_id: Uuid) {
        if let Some(router) = self.router.upgrade() {
            router.cache.clear(&device_id);
            router.fan_out(device_id, |callback| callback.on_device_disconnected(device_id));
        }
    }

    fn on_secure_channel_established(&self, device_id: Uuid) {
        if let Some(router) = self.router.upgrade() {
            router.fan_out(device_id, |callback| {
                callback.on_secure_channel_established(device_id)
            });
        }
    }

    fn on_message_received(&self, device_id: Uuid, message: DeviceMessage) {
        if let Some(router) = self.router.upgrade() {
            router.on_message_received_internal(device_id, message);
        }
    }
}

impl MessageRouter {
    /// Creates a router and subscribes it to the controller's events.
    pub fn new(controller: Arc<ConnectionController>) -> Arc<Self> {
        let router = Arc::new(Self {
            controller: Arc::clone(&controller),
            cache: ResponseCache::new(),
            blocked: DashSet::new(),
            subscribers: DashMap::new(),
            missed: DashMap::new(),
            driver_callbacks: RwLock::new(Arc::new(Vec::new())),
            passenger_callbacks: RwLock::new(Arc::new(Vec::new())),
            all_callbacks: RwLock::new(Arc::new(Vec::new())),
            query_ids: DashMap::new(),
        });
        controller.register_connection_callback(Arc::new(RouterEvents {
            router: Arc::downgrade(&router),
        }));
        router
    }

    pub fn cache(&self) -> &ResponseCache {
        &self.cache
    }

    pub fn is_blocked(&self, recipient: &Uuid) -> bool {
        self.blocked.contains(recipient)
    }

    // ---- Feature subscribers --------------------------------------------

    /// Subscribes a feature to messages for `recipient` from `device_id`.
    ///
    /// Messages that arrived before the first registration are flushed to
    /// the new subscriber in arrival order.
    pub fn register_device_callback(
        &self,
        device_id: Uuid,
        recipient: Uuid,
        subscriber: Arc<dyn DeviceCallback>,
    ) -> Result<(), RouterError> {
        if self.blocked.contains(&recipient) {
            warn!(%device_id, %recipient, "Registration for blocked recipient rejected");
            subscriber.on_device_error(device_id, DeviceError::InsecureRecipientIdDetected);
            return Err(RouterError::RecipientBlocked(recipient));
        }

        // The missed buffer is drained while the entry is held; `deliver`
        // buffers under the same lock, so nothing lands in it afterwards.
        let (hijacked, missed) = match self.subscribers.entry((device_id, recipient)) {
            Entry::Occupied(entry) if entry.get().is_alive() => (Some(entry.remove()), Vec::new()),
            Entry::Occupied(mut entry) => {
                entry.insert(Arc::clone(&subscriber));
                (None, self.take_missed(device_id, recipient))
            }
            Entry::Vacant(entry) => {
                let _slot = entry.insert(Arc::clone(&subscriber));
                (None, self.take_missed(device_id, recipient))
            }
        };

        if let Some(existing) = hijacked {
            self.blocked.insert(recipient);
            error!(%device_id, %recipient, "Duplicate registration for recipient, blocking it");
            existing.on_device_error(device_id, DeviceError::InsecureRecipientIdDetected);
            subscriber.on_device_error(device_id, DeviceError::InsecureRecipientIdDetected);
            return Err(RouterError::RecipientBlocked(recipient));
        }

        if !missed.is_empty() {
            debug!(%device_id, %recipient, count = missed.len(), "Delivering missed messages");
        }
        for message in missed {
            subscriber.on_message_received(device_id, message);
        }
        Ok(())
    }

    fn take_missed(&self, device_id: Uuid, recipient: Uuid) -> Vec<FeatureMessage> {
        self.missed
            .remove(&(recipient, device_id))
            .map(|(_, messages)| messages)
            .unwrap_or_default()
    }

    pub fn unregister_device_callback(&self, device_id: Uuid, recipient: Uuid) {
        self.subscribers.remove(&(device_id, recipient));
    }

    /// Dispatches a decrypted message from a connected device.
    pub fn on_message_received_internal(&self, device_id: Uuid, message: DeviceMessage) {
        let Some(recipient) = message.recipient else {
            warn!(%device_id, operation = ?message.operation, "Message without recipient dropped");
            return;
        };

        let feature_message = match message.operation {
            OperationType::ClientMessage => FeatureMessage::Message(message.payload),
            OperationType::Query => match from_msgpack::<Query>(&message.payload) {
                Ok(query) => FeatureMessage::Query(query),
                Err(e) => {
                    warn!(%device_id, error = %e, "Invalid query dropped");
                    return;
                }
            },
            OperationType::QueryResponse => match from_msgpack::<QueryResponse>(&message.payload) {
                Ok(response) => {
                    self.cache.on_query_response(device_id, recipient, &response);
                    FeatureMessage::QueryResponse(response)
                }
                Err(e) => {
                    warn!(%device_id, error = %e, "Invalid query response dropped");
                    return;
                }
            },
            OperationType::Handshake | OperationType::Unknown => {
                debug!(%device_id, operation = ?message.operation, "Not routable");
                return;
            }
        };

        self.deliver(device_id, recipient, feature_message);
    }

    fn deliver(&self, device_id: Uuid, recipient: Uuid, message: FeatureMessage) {
        if self.blocked.contains(&recipient) {
            debug!(%device_id, %recipient, "Dropping message for blocked recipient");
            return;
        }
        let key = (device_id, recipient);
        let subscriber = self.subscribers.get(&key).map(|entry| Arc::clone(entry.value()));
        if let Some(subscriber) = subscriber.filter(|subscriber| subscriber.is_alive()) {
            subscriber.on_message_received(device_id, message);
            return;
        }

        // Re-check under the entry lock so a concurrent registration either
        // sees this message in the buffer or receives it directly.
        let subscriber = match self.subscribers.entry(key) {
            Entry::Occupied(entry) if entry.get().is_alive() => Arc::clone(entry.get()),
            Entry::Occupied(entry) => {
                debug!(%device_id, %recipient, "Evicting dead subscriber");
                self.buffer(device_id, recipient, message);
                entry.remove();
                return;
            }
            Entry::Vacant(_slot) => {
                self.buffer(device_id, recipient, message);
                return;
            }
        };
        subscriber.on_message_received(device_id, message);
    }

    fn buffer(&self, device_id: Uuid, recipient: Uuid, message: FeatureMessage) {
        trace!(%device_id, %recipient, "Buffering message for missing subscriber");
        self.missed
            .entry((recipient, device_id))
            .or_default()
            .push(message);
    }

    // ---- Outbound -------------------------------------------------------

    /// Sends an opaque feature message to `recipient` on the device.
    pub fn send_message(
        &self,
        device_id: Uuid,
        recipient: Uuid,
        payload: Vec<u8>,
    ) -> Result<(), RouterError> {
        let message =
            DeviceMessage::encrypted(OperationType::ClientMessage, Some(recipient), payload);
        self.controller.send_message(device_id, message)?;
        Ok(())
    }

    /// Sends a query and returns its id.
    ///
    /// Cached system queries are answered locally; the response is delivered
    /// to the sender's subscriber without contacting the device.
    pub fn send_query(
        &self,
        device_id: Uuid,
        recipient: Uuid,
        sender: Uuid,
        request: Vec<u8>,
        parameters: Option<Vec<u8>>,
    ) -> Result<i32, RouterError> {
        let query = Query {
            id: self.next_query_id(sender),
            sender,
            request,
            parameters,
        };

        if let Some(response) = self.cache.on_outbound_query(device_id, recipient, &query) {
            self.deliver(device_id, sender, FeatureMessage::QueryResponse(response));
            return Ok(query.id);
        }

        let sent = to_msgpack(&query).map_err(RouterError::from).and_then(|payload| {
            let message = DeviceMessage::encrypted(OperationType::Query, Some(recipient), payload);
            self.controller
                .send_message(device_id, message)
                .map_err(RouterError::from)
        });
        if let Err(e) = sent {
            self.cache.untrack(&device_id, sender, query.id);
            return Err(e);
        }
        Ok(query.id)
    }

    /// Answers a query the device sent to a feature.
    pub fn send_query_response(
        &self,
        device_id: Uuid,
        recipient: Uuid,
        response: &QueryResponse,
    ) -> Result<(), RouterError> {
        let message = DeviceMessage::encrypted(
            OperationType::QueryResponse,
            Some(recipient),
            to_msgpack(response)?,
        );
        self.controller.send_message(device_id, message)?;
        Ok(())
    }

    fn next_query_id(&self, sender: Uuid) -> i32 {
        let counter = self
            .query_ids
            .entry(sender)
            .or_insert_with(|| AtomicI32::new(0));
        counter
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |id| {
                Some(if id == i32::MAX { 0 } else { id + 1 })
            })
            .unwrap_or_else(|id| id)
    }

    // ---- Connection subscribers -----------------------------------------

    pub fn register_connection_callback(
        &self,
        audience: Audience,
        callback: Arc<dyn ConnectionCallback>,
    ) {
        let mut list = self.callback_list(audience).write();
        if list.iter().any(|existing| Arc::ptr_eq(existing, &callback)) {
            return;
        }
        let mut updated = Vec::clone(&list);
        updated.push(callback);
        *list = Arc::new(updated);
    }

    pub fn unregister_connection_callback(
        &self,
        audience: Audience,
        callback: &Arc<dyn ConnectionCallback>,
    ) {
        let mut list = self.callback_list(audience).write();
        let updated: Vec<_> = list
            .iter()
            .filter(|existing| !Arc::ptr_eq(existing, callback))
            .cloned()
            .collect();
        *list = Arc::new(updated);
    }

    fn callback_list(&self, audience: Audience) -> &CallbackList {
        match audience {
            Audience::Driver => &self.driver_callbacks,
            Audience::Passenger => &self.passenger_callbacks,
            Audience::All => &self.all_callbacks,
        }
    }

    fn is_driver_device(&self, device_id: Uuid) -> bool {
        let driver = self.controller.config().users.driver_user_id;
        match self.controller.storage().associated_device(&device_id) {
            Ok(Some(device)) => device.user_id == driver,
            Ok(None) => false,
            Err(e) => {
                warn!(%device_id, error = %e, "Failed to classify device");
                false
            }
        }
    }

    fn fan_out(&self, device_id: Uuid, event: impl Fn(&dyn ConnectionCallback)) {
        let audience = if self.is_driver_device(device_id) {
            Audience::Driver
        } else {
            Audience::Passenger
        };
        let owner = Arc::clone(&*self.callback_list(audience).read());
        let all = Arc::clone(&*self.all_callbacks.read());
        for callback in owner.iter().chain(all.iter()) {
            event(callback.as_ref());
        }
    }
}

impl std::fmt::Debug for MessageRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageRouter")
            .field("subscribers", &self.subscribers.len())
            .field("blocked", &self.blocked.len())
            .field("missed", &self.missed.len())
            .finish()
    }
}
