//! # Companion Link Service Library
//!
//! This crate runs the host side of Companion Link: secure, multi-transport
//! connections between a head unit and the phones associated with it.
//!
//! ## Overview
//!
//! - **Transports**: A pluggable [`transport::Transport`] contract plus an
//!   in-memory loopback used by tests and tooling
//! - **Packet streams**: Ordered, bounded packet delivery per connection
//! - **Negotiation**: Version exchange and reconnect challenge checks
//! - **Secure channels**: Noise handshake, verification and encrypted
//!   message exchange
//! - **Connection control**: Association, reconnection and per-device
//!   aggregation of transport connections
//! - **Routing**: Recipient-addressed delivery to feature subscribers with a
//!   system query cache
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      MessageRouter                          │
//! │        feature subscribers, query cache, fan-out            │
//! ├─────────────────────────────────────────────────────────────┤
//! │                  ConnectionController                       │
//! │     device aggregates, association, auto-reconnect          │
//! ├──────────────────────────────┬──────────────────────────────┤
//! │      ChannelNegotiator       │        SecureChannel         │
//! │  versions, challenge reply   │  Noise, verification, AEAD   │
//! ├──────────────────────────────┴──────────────────────────────┤
//! │                      PacketStream                           │
//! ├─────────────────────────────────────────────────────────────┤
//! │                 Transport (BLE, sockets, ...)               │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use companion_service::config::Config;
//! use companion_service::controller::ConnectionController;
//! use companion_service::devices::JsonDeviceStore;
//! use companion_service::router::MessageRouter;
//!
//! fn main() -> anyhow::Result<()> {
//!     let mut config = Config::load_default()?;
//!     let host_id = config.ensure_host_id();
//!     let storage = Arc::new(JsonDeviceStore::open(config.device_store_path())?);
//!
//!     // Real deployments pass their BLE/socket transports here.
//!     let controller = ConnectionController::new(host_id, config, Vec::new(), storage);
//!     let _router = MessageRouter::new(controller);
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and defaults
//! - [`logging`]: Tracing subscriber setup
//! - [`devices`]: Associated device storage
//! - [`transport`]: Transport contract and loopback transport
//! - [`stream`]: Packet streams over a transport connection
//! - [`negotiator`]: Version negotiation and reconnect challenges
//! - [`channel`]: Secure channel state machine
//! - [`controller`]: Connection lifecycle per device
//! - [`cache`]: System query response cache
//! - [`router`]: Message routing to feature subscribers

pub mod cache;
pub mod channel;
pub mod config;
pub mod controller;
pub mod devices;
pub mod logging;
pub mod negotiator;
pub mod router;
pub mod stream;
pub mod transport;

pub use channel::SecureChannel;
pub use config::Config;
pub use controller::{AssociationCallback, ConnectionCallback, ConnectionController};
pub use devices::{AssociatedDevice, DeviceStorage, JsonDeviceStore};
pub use router::{DeviceCallback, FeatureMessage, MessageRouter};
