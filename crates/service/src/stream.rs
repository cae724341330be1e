//! Packet stream over a single transport connection.
//!
//! A [`PacketStream`] turns [`DeviceMessage`]s into transport-sized packets
//! and back. Outbound packets go through a bounded queue drained by one
//! writer task, so at most one write is in flight per connection and the
//! next packet is only written once the transport accepted the previous
//! one. Inbound bytes are reassembled and parsed; any protocol violation
//! disconnects the connection.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Weak};

use companion_protocol::{
    packetize, DeviceMessage, Packet, PacketOutcome, ProtocolError, Reassembler,
};
use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::transport::{ConnectionId, DataListener, ProtocolDevice};

/// Errors returned when sending on a stream.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("send queue full: message needs {needed} packets")]
    SendQueueFull { needed: usize },

    #[error("stream is closed")]
    Closed,
}

/// Receives complete messages parsed by a [`PacketStream`].
pub trait StreamListener: Send + Sync {
    fn on_message_received(&self, device: &ProtocolDevice, message: DeviceMessage);
}

struct StreamInner {
    device: ProtocolDevice,
    next_message_id: AtomicI32,
    queue: mpsc::Sender<Vec<u8>>,
    // Held while reserving and filling queue slots so one message's packets
    // stay contiguous.
    enqueue: Mutex<()>,
    reassembler: Mutex<Reassembler>,
    listener: RwLock<Option<Arc<dyn StreamListener>>>,
    cancel: CancellationToken,
}

/// Message-level stream over one [`ProtocolDevice`].
#[derive(Clone)]
pub struct PacketStream {
    inner: Arc<StreamInner>,
}

struct StreamDataListener {
    stream: Weak<StreamInner>,
}

impl DataListener for StreamDataListener {
    fn on_data_received(&self, _connection: ConnectionId, data: Vec<u8>) {
        if let Some(inner) = self.stream.upgrade() {
            PacketStream { inner }.on_data_received(data);
        }
    }
}

impl PacketStream {
    /// Creates a stream, spawns its writer task and takes over the
    /// connection's data listener.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(device: ProtocolDevice, queue_depth: usize) -> Self {
        let (queue, rx) = mpsc::channel(queue_depth.max(1));
        let cancel = CancellationToken::new();

        tokio::spawn(run_writer(device.clone(), rx, cancel.clone()));

        let inner = Arc::new(StreamInner {
            device: device.clone(),
            next_message_id: AtomicI32::new(0),
            queue,
            enqueue: Mutex::new(()),
            reassembler: Mutex::new(Reassembler::new()),
            listener: RwLock::new(None),
            cancel,
        });

        device.register_data_listener(Arc::new(StreamDataListener {
            stream: Arc::downgrade(&inner),
        }));

        debug!(device = %device, queue_depth, "Packet stream opened");
        Self { inner }
    }

    /// The connection this stream runs on.
    pub fn device(&self) -> &ProtocolDevice {
        &self.inner.device
    }

    /// Replaces the listener receiving parsed messages.
    pub fn set_listener(&self, listener: Arc<dyn StreamListener>) {
        *self.inner.listener.write() = Some(listener);
    }

    /// Whether the stream has been closed.
    pub fn is_closed(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    fn allocate_message_id(&self) -> i32 {
        let previous = self
            .inner
            .next_message_id
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |id| {
                Some(if id == i32::MAX { 0 } else { id + 1 })
            });
        // The closure never returns None.
        previous.unwrap_or_else(|id| id)
    }

    /// Serializes, packetizes and enqueues a message.
    ///
    /// Either every packet of the message is queued or none is.
    pub fn send(&self, message: &DeviceMessage) -> Result<(), StreamError> {
        let bytes = message.to_msgpack()?;
        let message_id = self.allocate_message_id();
        let packets = packetize(message_id, &bytes, self.inner.device.max_write_size())?;

        trace!(
            device = %self.inner.device,
            message_id,
            packets = packets.len(),
            operation = ?message.operation,
            "Queueing message"
        );
        self.enqueue(packets.iter().map(Packet::encode).collect())
    }

    /// Enqueues one unframed buffer, preserving order with packet writes.
    pub fn send_raw(&self, data: Vec<u8>) -> Result<(), StreamError> {
        self.enqueue(vec![data])
    }

    fn enqueue(&self, buffers: Vec<Vec<u8>>) -> Result<(), StreamError> {
        if self.is_closed() {
            return Err(StreamError::Closed);
        }

        let needed = buffers.len();
        let _guard = self.inner.enqueue.lock();
        let permits = self
            .inner
            .queue
            .try_reserve_many(needed)
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(()) => StreamError::SendQueueFull { needed },
                mpsc::error::TrySendError::Closed(()) => StreamError::Closed,
            })?;

        for (permit, buffer) in permits.zip(buffers) {
            permit.send(buffer);
        }
        Ok(())
    }

    fn on_data_received(&self, data: Vec<u8>) {
        let device = &self.inner.device;

        let packet = match Packet::decode(&data) {
            Ok(packet) => packet,
            Err(e) => {
                warn!(device = %device, error = %e, "Unparseable packet, disconnecting");
                device.disconnect();
                return;
            }
        };

        let outcome = self.inner.reassembler.lock().accept(packet);
        let bytes = match outcome {
            Ok(PacketOutcome::Complete(bytes)) => bytes,
            Ok(PacketOutcome::Partial) | Ok(PacketOutcome::Duplicate) => return,
            Err(e) => {
                warn!(device = %device, error = %e, "Packet sequence violation, disconnecting");
                device.disconnect();
                return;
            }
        };

        let message = match DeviceMessage::from_msgpack(&bytes) {
            Ok(message) => message,
            Err(e) => {
                warn!(device = %device, error = %e, "Invalid device message, disconnecting");
                device.disconnect();
                return;
            }
        };

        let listener = self.inner.listener.read().clone();
        match listener {
            Some(listener) => listener.on_message_received(device, message),
            None => debug!(device = %device, "No stream listener, dropping message"),
        }
    }

    /// Stops the writer task and releases the connection's data listener.
    pub fn close(&self) {
        if self.inner.cancel.is_cancelled() {
            return;
        }
        self.inner.cancel.cancel();
        self.inner.device.unregister_data_listener();
        *self.inner.listener.write() = None;
        debug!(device = %self.inner.device, "Packet stream closed");
    }
}

impl std::fmt::Debug for PacketStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketStream")
            .field("device", &self.inner.device)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Drains the send queue one write at a time.
async fn run_writer(
    device: ProtocolDevice,
    mut rx: mpsc::Receiver<Vec<u8>>,
    cancel: CancellationToken,
) {
    loop {
        let buffer = tokio::select! {
            _ = cancel.cancelled() => break,
            buffer = rx.recv() => match buffer {
                Some(buffer) => buffer,
                None => break,
            },
        };

        if let Err(e) = device.send_data(buffer).await {
            warn!(device = %device, error = %e, "Write failed, disconnecting");
            device.disconnect();
            break;
        }
    }
    trace!(device = %device, "Writer task finished");
}
