//! Overlay fixture for integration testing
//!
//! Starts a set of loopback nodes, each bootstrapping from nodes started
//! before it, and tears them all down at the end of a test.
//!
//! # Example
//!
//! ```no_run
//! use mumble_integration_tests::fixtures::Overlay;
//! use mumble_integration_tests::test_helpers::test_config;
//!
//! # async fn demo() -> mumble_core::node::Result<()> {
//! let mut overlay = Overlay::new();
//! let seed = overlay.spawn(test_config(), &[]).await?;
//! let joiner = overlay.spawn(test_config(), &[&seed]).await?;
//! assert!(overlay.wait_linked(&seed, &joiner).await);
//! overlay.shutdown().await;
//! # Ok(())
//! # }
//! ```

use crate::test_helpers::wait_until;
use mumble_core::node::Result;
use mumble_core::{P2pConfig, P2pManager, Services};
use mumble_crypto::WalletIdentity;
use mumble_discovery::BootstrapCandidate;
use mumble_discovery::dht::Endpoint;
use std::time::Duration;

/// A set of running nodes
#[derive(Default)]
pub struct Overlay {
    nodes: Vec<P2pManager>,
}

impl Overlay {
    /// Empty overlay
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a node with a random identity, bootstrapping from `seeds`
    ///
    /// # Errors
    ///
    /// Returns the manager's error if it cannot be created or connected.
    pub async fn spawn(&mut self, config: P2pConfig, seeds: &[&P2pManager]) -> Result<P2pManager> {
        self.spawn_with(WalletIdentity::generate(), config, Services::new(), seeds)
            .await
    }

    /// Start a node with an explicit identity and services
    ///
    /// # Errors
    ///
    /// Returns the manager's error if it cannot be created or connected.
    pub async fn spawn_with(
        &mut self,
        identity: WalletIdentity,
        mut config: P2pConfig,
        services: Services,
        seeds: &[&P2pManager],
    ) -> Result<P2pManager> {
        config.bootstrap_nodes = seeds
            .iter()
            .filter_map(|seed| seed.local_addr())
            .map(|addr| BootstrapCandidate::from_endpoint(Endpoint::from(addr)))
            .collect();

        let node = P2pManager::new(identity, config, services)?;
        node.connect().await?;
        self.nodes.push(node.clone());
        Ok(node)
    }

    /// Wait until `a` and `b` both hold a live connection to each other
    pub async fn wait_linked(&self, a: &P2pManager, b: &P2pManager) -> bool {
        wait_until(Duration::from_secs(5), || {
            a.is_connected_to(&b.wallet()) && b.is_connected_to(&a.wallet())
        })
        .await
    }

    /// Running nodes in start order
    pub fn nodes(&self) -> &[P2pManager] {
        &self.nodes
    }

    /// Disconnect every node
    pub async fn shutdown(self) {
        for node in self.nodes {
            if let Err(e) = node.disconnect().await {
                eprintln!("{} did not shut down cleanly: {}", node.wallet(), e);
            }
        }
    }
}
