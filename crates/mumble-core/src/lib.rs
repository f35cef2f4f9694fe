//! # MumbleChat Core
//!
//! Core P2P layer for the MumbleChat overlay network.
//!
//! This crate provides:
//! - The line-delimited JSON wire protocol and a frame codec that survives
//!   oversized or garbled lines
//! - The [`P2pManager`](node::P2pManager): listener, peer connections,
//!   handshakes and the background maintenance loops
//! - Layered message delivery with relay receipts and a store-for-later queue
//! - The connection state machine observable through a `watch` channel
//!
//! ## Delivery chain
//!
//! ```text
//!  send_message(recipient)
//!       │
//!       ├─▶ direct connection ──────────────▶ delivered
//!       ├─▶ DHT lookup + dial ──────────────▶ delivered
//!       ├─▶ gossip flood (receipts to relays) ▶ relayed
//!       ├─▶ internet relay service ─────────▶ relayed
//!       └─▶ store-for-later queue ──────────▶ queued
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod node;
pub mod protocol;

pub use node::{
    ConnectionState, DeliveryPath, IncomingMessage, NodeError, P2pConfig, P2pManager, SendResult,
    Services,
};
pub use protocol::{MAX_FRAME_LEN, ProtocolError, WireMessage};

