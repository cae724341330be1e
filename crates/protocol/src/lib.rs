//! # Companion Link Protocol Library
//!
//! This crate provides the wire formats and cryptographic primitives shared
//! by a Companion Link host and the mobile devices it talks to.
//!
//! ## Overview
//!
//! - **Packets**: Splitting messages into transport-sized packets and
//!   reassembling them, tolerating duplicated packets
//! - **Messages**: MessagePack schemas for the envelope, version exchange,
//!   queries and verification codes
//! - **Noise Protocol**: Key agreement using Noise NN with a verification
//!   code derived from the handshake transcript, or NNpsk0 keyed from the
//!   challenge secret when reconnecting
//! - **Crypto**: Session encryption, reconnection challenges and the
//!   out-of-band verification key
//! - **Compression**: DEFLATE payload compression
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │          Feature Messages               │  opaque bytes
//! ├─────────────────────────────────────────┤
//! │      DeviceMessage (+ compression)      │  MessagePack, DEFLATE
//! ├─────────────────────────────────────────┤
//! │           Session Encryption            │  ChaCha20-Poly1305
//! ├─────────────────────────────────────────┤
//! │               Packets                   │  12-byte header
//! ├─────────────────────────────────────────┤
//! │         Transport (BLE, sockets)        │
//! └─────────────────────────────────────────┘
//! ```
//!
//! ## Example Usage
//!
//! ```rust
//! use companion_protocol::{packetize, DeviceMessage, PacketOutcome, Reassembler};
//!
//! let message = DeviceMessage::handshake(b"hello".to_vec());
//! let bytes = message.to_msgpack().unwrap();
//!
//! let mut reassembler = Reassembler::new();
//! let mut complete = None;
//! for packet in packetize(1, &bytes, 20).unwrap() {
//!     if let PacketOutcome::Complete(data) = reassembler.accept(packet).unwrap() {
//!         complete = Some(data);
//!     }
//! }
//!
//! assert_eq!(DeviceMessage::from_msgpack(&complete.unwrap()).unwrap(), message);
//! ```
//!
//! ## Modules
//!
//! - [`packet`]: Packet codec and reassembly
//! - [`messages`]: Wire schema definitions
//! - [`noise`]: Noise NN and NNpsk0 handshakes
//! - [`crypto`]: Session keys, challenges and OOB keys
//! - [`compression`]: Payload compression
//! - [`error`]: Error types

pub mod compression;
pub mod crypto;
pub mod error;
pub mod messages;
pub mod noise;
pub mod packet;

pub use crypto::{
    ConnectChallenge, OobKey, OobSide, SessionKey, CHALLENGE_SECRET_LENGTH, DEVICE_ID_LENGTH,
};
pub use error::{ProtocolError, Result};
pub use messages::{
    DeviceMessage, OperationType, Query, QueryResponse, SystemQuery, SystemQueryType,
    VerificationCode, VerificationState, VersionExchange, SYSTEM_FEATURE_ID,
};
pub use noise::{
    visual_code, HandshakePhase, NoiseSession, ReconnectKey, Role, SecureHandshake,
    RECONNECT_KEY_LENGTH,
};
pub use packet::{packetize, Packet, PacketOutcome, Reassembler, PACKET_HEADER_SIZE};
