//! Collaborators injected into the P2P manager.
//!
//! Everything the manager needs from outside the overlay is passed in at
//! construction through [`Services`]. Production wires in chain readers and
//! HTTP relays; tests pass in-memory fakes.

use crate::node::error::Result;
use async_trait::async_trait;
use mumble_crypto::{RelayReceipt, WalletAddress};
use mumble_discovery::{RateLimiter, RelayRegistry};
use std::fmt;
use std::sync::Arc;

/// Content type used when handing encrypted payloads to a relay service
pub const ENCRYPTED_CONTENT_TYPE: &str = "application/vnd.mumblechat.encrypted";

/// Internet store-and-forward delivery, tried after gossip fails
#[async_trait]
pub trait RelayDelivery: Send + Sync {
    /// Hand `payload` to the service; `true` if it accepted the message
    async fn send_message(
        &self,
        recipient: &WalletAddress,
        payload: &[u8],
        message_id: &str,
        content_type: &str,
    ) -> bool;
}

/// Destination for earned relay receipts (the reward ledger)
#[async_trait]
pub trait ReceiptSink: Send + Sync {
    /// Submit a batch
    ///
    /// # Errors
    ///
    /// Returning an error keeps every receipt in the batch for the next attempt.
    async fn submit(&self, receipts: &[RelayReceipt]) -> Result<()>;
}

/// Injected collaborators
#[derive(Clone, Default)]
pub struct Services {
    /// On-chain relay registry
    pub registry: Option<Arc<dyn RelayRegistry>>,
    /// Internet relay fallback
    pub relay_delivery: Option<Arc<dyn RelayDelivery>>,
    /// Receipt submission
    pub receipt_sink: Option<Arc<dyn ReceiptSink>>,
    /// Shared rate limiter; one is created from config if absent
    pub rate_limiter: Option<Arc<RateLimiter>>,
}

impl Services {
    /// No collaborators
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Use `registry` for bootstrap and relay checks
    #[must_use]
    pub fn with_registry(mut self, registry: Arc<dyn RelayRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Use `delivery` as the internet relay fallback
    #[must_use]
    pub fn with_relay_delivery(mut self, delivery: Arc<dyn RelayDelivery>) -> Self {
        self.relay_delivery = Some(delivery);
        self
    }

    /// Submit earned receipts to `sink`
    #[must_use]
    pub fn with_receipt_sink(mut self, sink: Arc<dyn ReceiptSink>) -> Self {
        self.receipt_sink = Some(sink);
        self
    }

    /// Share an existing rate limiter
    #[must_use]
    pub fn with_rate_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.rate_limiter = Some(limiter);
        self
    }
}

impl fmt::Debug for Services {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Services")
            .field("registry", &self.registry.is_some())
            .field("relay_delivery", &self.relay_delivery.is_some())
            .field("receipt_sink", &self.receipt_sink.is_some())
            .field("rate_limiter", &self.rate_limiter.is_some())
            .finish()
    }
}
