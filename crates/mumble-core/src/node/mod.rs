//! P2P manager for the MumbleChat overlay
//!
//! This module provides the [`P2pManager`] that coordinates:
//! - TCP connections speaking the line-delimited JSON protocol
//! - The wallet-keyed Kademlia routing table (via mumble-discovery)
//! - Message routing: direct, DHT-located, gossip, relay service, store-for-later
//! - Relay receipts earned by forwarding other wallets' messages
//! - Health checks, reconnection and LAN discovery
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                      P2pManager                          │
//! │   connect / disconnect / send_message / subscriptions    │
//! ├──────────────┬──────────────┬──────────────┬─────────────┤
//! │  Connections │    Router    │    Gossip    │   Health    │
//! ├──────────────┴──────────────┴──────────────┴─────────────┤
//! │  Kademlia DHT  │  Rate limiter  │  Bootstrap  │  LAN     │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use mumble_core::node::{P2pConfig, P2pManager};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let manager = P2pManager::new_random(P2pConfig::default())?;
//!     manager.connect().await?;
//!
//!     let mut inbox = manager.subscribe_messages();
//!     while let Ok(message) = inbox.recv().await {
//!         println!("{} from {}", message.message_id, message.from);
//!     }
//!     Ok(())
//! }
//! ```

pub mod config;
mod connection;
mod discovery;
pub mod error;
mod gossip;
pub mod handler;
mod health;
pub mod message_cache;
#[allow(clippy::module_inception)]
pub mod node;
pub mod peer;
pub mod pending;
pub mod receipts;
pub mod router;
pub mod services;
pub mod state;

pub use config::{
    DEFAULT_P2P_PORT, GossipConfig, LanConfig, NetworkConfig, P2pConfig, PendingConfig,
    ReconnectConfig,
};
pub use error::{NodeError, Result};
pub use handler::IncomingMessage;
pub use message_cache::MessageCache;
pub use node::{P2pManager, P2pStats};
pub use peer::{Direction, PeerConnection, PeerInfo};
pub use pending::{PendingMessage, PendingQueue};
pub use receipts::RelayReceiptLedger;
pub use router::{DeliveryPath, SendResult};
pub use services::{ENCRYPTED_CONTENT_TYPE, ReceiptSink, RelayDelivery, Services};
pub use state::{ConnectionState, StateMachine};
