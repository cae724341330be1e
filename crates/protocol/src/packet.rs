//! Packet codec and reassembly for transport-sized fragments.
//!
//! # Packet Format
//!
//! Each packet consists of:
//! - 4 bytes: message id (big-endian `i32`)
//! - 4 bytes: packet number, 1-based (big-endian `i32`)
//! - 4 bytes: total packets for the message (big-endian `i32`)
//! - N bytes: payload fragment
//!
//! A serialized message is split into as many packets as the transport's
//! maximum write size requires. The receiver accepts packets for a message
//! strictly in order; a repeat of the last accepted packet is tolerated and
//! dropped, anything else out of order is a protocol violation.

use std::collections::HashMap;

use crate::error::{ProtocolError, Result};

/// Packet header size: 4 (message id) + 4 (packet number) + 4 (total) = 12 bytes.
pub const PACKET_HEADER_SIZE: usize = 12;

/// A single transport-sized fragment of a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Identifier shared by every packet of one message.
    pub message_id: i32,
    /// Position of this packet within the message, starting at 1.
    pub packet_number: i32,
    /// Number of packets the message was split into.
    pub total_packets: i32,
    /// The payload fragment.
    pub payload: Vec<u8>,
}

impl Packet {
    /// Returns whether this is the final packet of its message.
    #[inline]
    pub fn is_last(&self) -> bool {
        self.packet_number == self.total_packets
    }

    /// Encode the packet into bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut output = Vec::with_capacity(PACKET_HEADER_SIZE + self.payload.len());
        output.extend_from_slice(&self.message_id.to_be_bytes());
        output.extend_from_slice(&self.packet_number.to_be_bytes());
        output.extend_from_slice(&self.total_packets.to_be_bytes());
        output.extend_from_slice(&self.payload);
        output
    }

    /// Decode a packet from bytes.
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < PACKET_HEADER_SIZE {
            return Err(ProtocolError::Deserialization(format!(
                "insufficient data for packet header: need {} bytes, have {}",
                PACKET_HEADER_SIZE,
                data.len()
            )));
        }

        let message_id = read_i32(&data[0..4]);
        let packet_number = read_i32(&data[4..8]);
        let total_packets = read_i32(&data[8..12]);

        if total_packets < 1 {
            return Err(ProtocolError::Deserialization(format!(
                "invalid packet: total packets must be at least 1, got {}",
                total_packets
            )));
        }

        if packet_number < 1 || packet_number > total_packets {
            return Err(ProtocolError::Deserialization(format!(
                "invalid packet: packet number {} outside 1..={}",
                packet_number, total_packets
            )));
        }

        Ok(Self {
            message_id,
            packet_number,
            total_packets,
            payload: data[PACKET_HEADER_SIZE..].to_vec(),
        })
    }
}

fn read_i32(bytes: &[u8]) -> i32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(bytes);
    i32::from_be_bytes(buf)
}

/// Split a serialized message into packets that each fit `max_write_size`.
///
/// An empty message still produces a single packet with an empty payload.
pub fn packetize(message_id: i32, message: &[u8], max_write_size: usize) -> Result<Vec<Packet>> {
    if max_write_size <= PACKET_HEADER_SIZE {
        return Err(ProtocolError::WriteSizeTooSmall {
            size: max_write_size,
            header: PACKET_HEADER_SIZE,
        });
    }

    let chunk_size = max_write_size - PACKET_HEADER_SIZE;
    let total = message.len().div_ceil(chunk_size).max(1);
    let total_packets =
        i32::try_from(total).map_err(|_| ProtocolError::MessageTooLarge { size: message.len() })?;

    if message.is_empty() {
        return Ok(vec![Packet {
            message_id,
            packet_number: 1,
            total_packets: 1,
            payload: Vec::new(),
        }]);
    }

    Ok(message
        .chunks(chunk_size)
        .zip(1..)
        .map(|(chunk, packet_number)| Packet {
            message_id,
            packet_number,
            total_packets,
            payload: chunk.to_vec(),
        })
        .collect())
}

/// Outcome of feeding one packet into the [`Reassembler`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PacketOutcome {
    /// Packet accepted; more packets are needed.
    Partial,
    /// Repeat of the last accepted packet; ignored.
    Duplicate,
    /// Final packet accepted; carries the full message bytes.
    Complete(Vec<u8>),
}

#[derive(Debug, Default)]
struct Assembly {
    last_packet_number: i32,
    buffer: Vec<u8>,
}

/// Reassembles in-order packets into complete messages.
///
/// State is kept per message id and discarded as soon as the final packet
/// of a message has been accepted.
#[derive(Debug, Default)]
pub struct Reassembler {
    pending: HashMap<i32, Assembly>,
}

impl Reassembler {
    /// Create an empty reassembler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of messages currently mid-assembly.
    pub fn pending_messages(&self) -> usize {
        self.pending.len()
    }

    /// Feed a packet.
    ///
    /// Returns an error if the packet number is neither the next expected
    /// one nor a repeat of the last accepted one. The caller is expected to
    /// treat this as fatal for the connection.
    pub fn accept(&mut self, packet: Packet) -> Result<PacketOutcome> {
        let last = self
            .pending
            .get(&packet.message_id)
            .map(|assembly| assembly.last_packet_number)
            .unwrap_or(0);

        if packet.packet_number == last {
            tracing::debug!(
                message_id = packet.message_id,
                packet_number = packet.packet_number,
                "Dropping duplicate packet"
            );
            return Ok(PacketOutcome::Duplicate);
        }

        let expected = last + 1;
        if packet.packet_number != expected {
            return Err(ProtocolError::UnexpectedPacketNumber {
                message_id: packet.message_id,
                expected,
                got: packet.packet_number,
            });
        }

        if packet.is_last() {
            let mut message = self
                .pending
                .remove(&packet.message_id)
                .map(|assembly| assembly.buffer)
                .unwrap_or_default();
            message.extend_from_slice(&packet.payload);
            return Ok(PacketOutcome::Complete(message));
        }

        let assembly = self.pending.entry(packet.message_id).or_default();
        assembly.last_packet_number = packet.packet_number;
        assembly.buffer.extend_from_slice(&packet.payload);
        Ok(PacketOutcome::Partial)
    }
}
