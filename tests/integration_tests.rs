//! Integration tests for multi-node delivery.
//!
//! Each test starts real nodes on loopback and exercises one strategy of the
//! delivery chain end to end: direct, DHT-located, gossip relay with receipts,
//! TTL-bounded flooding, and store-for-later.

use async_trait::async_trait;
use mumble_core::node::{ReceiptSink, Result as NodeResult};
use mumble_core::{ConnectionState, DeliveryPath, IncomingMessage, P2pConfig, Services};
use mumble_crypto::{RelayReceipt, WalletIdentity};
use mumble_integration_tests::fixtures::Overlay;
use mumble_integration_tests::test_helpers::{payload, test_config, wait_until, within};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

async fn next_message(rx: &mut broadcast::Receiver<IncomingMessage>) -> Option<IncomingMessage> {
    within(Duration::from_secs(5), rx.recv()).await.and_then(|r| r.ok())
}

/// Drain everything that arrives within `window`
async fn collect_for(rx: &mut broadcast::Receiver<IncomingMessage>, window: Duration) -> Vec<IncomingMessage> {
    let mut out = Vec::new();
    let deadline = tokio::time::Instant::now() + window;
    while let Ok(Ok(message)) = tokio::time::timeout_at(deadline, rx.recv()).await {
        out.push(message);
    }
    out
}

fn relay_config() -> P2pConfig {
    P2pConfig {
        is_relay: true,
        ..test_config()
    }
}

#[derive(Default)]
struct RecordingSink {
    receipts: Mutex<Vec<RelayReceipt>>,
}

#[async_trait]
impl ReceiptSink for RecordingSink {
    async fn submit(&self, receipts: &[RelayReceipt]) -> NodeResult<()> {
        self.receipts.lock().extend_from_slice(receipts);
        Ok(())
    }
}

// ============================================================================
// Lifecycle
// ============================================================================

#[tokio::test]
async fn test_genesis_node_runs_alone() {
    let mut overlay = Overlay::new();
    let node = overlay.spawn(test_config(), &[]).await.unwrap();

    let stats = node.stats();
    assert_eq!(stats.state, ConnectionState::Connected);
    assert_eq!(stats.connected_peers, 0);
    assert!(stats.local_addr.is_some());
    assert_eq!(stats.pending_messages, 0);

    overlay.shutdown().await;
}

#[tokio::test]
async fn test_bootstrap_links_both_sides() {
    let mut overlay = Overlay::new();
    let seed = overlay.spawn(test_config(), &[]).await.unwrap();
    let joiner = overlay.spawn(test_config(), &[&seed]).await.unwrap();

    assert!(overlay.wait_linked(&seed, &joiner).await);
    assert!(seed.dht().get_node(&joiner.wallet()).is_some());
    assert!(joiner.dht().get_node(&seed.wallet()).is_some());

    overlay.shutdown().await;
}

#[tokio::test]
async fn test_departed_peer_detected_and_messages_queued() {
    let mut overlay = Overlay::new();
    let a = overlay.spawn(test_config(), &[]).await.unwrap();
    let b = overlay.spawn(test_config(), &[&a]).await.unwrap();
    assert!(overlay.wait_linked(&a, &b).await);

    b.disconnect().await.unwrap();
    assert!(wait_until(Duration::from_secs(5), || !a.is_connected_to(&b.wallet())).await);

    // B left the routing table along with its connection, so nothing re-dials it
    assert!(a.dht().get_node(&b.wallet()).is_none());
    let result = a.send_message(b.wallet(), &payload(1), "after-leave").await.unwrap();
    assert_eq!(result.path, DeliveryPath::Queued);
    assert_eq!(a.pending_messages_for(&b.wallet()), 1);

    overlay.shutdown().await;
}

// ============================================================================
// Direct and DHT-located delivery
// ============================================================================

#[tokio::test]
async fn test_direct_delivery_is_acknowledged() {
    let mut overlay = Overlay::new();
    let a = overlay.spawn(test_config(), &[]).await.unwrap();
    let b = overlay.spawn(test_config(), &[&a]).await.unwrap();
    assert!(overlay.wait_linked(&a, &b).await);

    let mut inbox = b.subscribe_messages();
    let result = a.send_message(b.wallet(), &payload(7), "direct-1").await.unwrap();
    assert_eq!(result.path, DeliveryPath::Direct);
    assert!(result.direct && !result.relayed);

    let received = next_message(&mut inbox).await.unwrap();
    assert_eq!(received.message_id, "direct-1");
    assert_eq!(received.from, a.wallet());
    assert_eq!(received.to, b.wallet());
    assert_eq!(received.payload, payload(7));
    assert_eq!(received.received_from, a.wallet());
    assert!(!received.via_gossip);

    assert!(wait_until(Duration::from_secs(5), || a.is_acknowledged("direct-1")).await);

    overlay.shutdown().await;
}

#[tokio::test]
async fn test_duplicate_send_delivered_once() {
    let mut overlay = Overlay::new();
    let a = overlay.spawn(test_config(), &[]).await.unwrap();
    let b = overlay.spawn(test_config(), &[&a]).await.unwrap();
    assert!(overlay.wait_linked(&a, &b).await);

    let mut inbox = b.subscribe_messages();
    a.send_message(b.wallet(), &payload(1), "once").await.unwrap();
    let again = a.send_message(b.wallet(), &payload(1), "once").await.unwrap();
    assert_eq!(again.path, DeliveryPath::Duplicate);

    let received = collect_for(&mut inbox, Duration::from_millis(500)).await;
    assert_eq!(received.len(), 1);

    overlay.shutdown().await;
}

#[tokio::test]
async fn test_dht_located_delivery() {
    let mut overlay = Overlay::new();
    let hub = overlay.spawn(test_config(), &[]).await.unwrap();
    let b = overlay.spawn(test_config(), &[&hub]).await.unwrap();
    assert!(overlay.wait_linked(&hub, &b).await);

    // A learns B's endpoint from the hub's NODE_LIST reply
    let a = overlay.spawn(test_config(), &[&hub]).await.unwrap();
    assert!(wait_until(Duration::from_secs(5), || a.dht().get_node(&b.wallet()).is_some()).await);
    assert!(!a.is_connected_to(&b.wallet()));

    let mut inbox = b.subscribe_messages();
    let result = a.send_message(b.wallet(), &payload(2), "located-1").await.unwrap();
    assert_eq!(result.path, DeliveryPath::DhtLocated);
    assert!(result.direct);
    assert!(a.is_connected_to(&b.wallet()));

    let received = next_message(&mut inbox).await.unwrap();
    assert_eq!(received.message_id, "located-1");
    assert_eq!(received.received_from, a.wallet());

    overlay.shutdown().await;
}

// ============================================================================
// Gossip relay and receipts
// ============================================================================

#[tokio::test]
async fn test_gossip_through_relay_earns_receipt() {
    let sink = Arc::new(RecordingSink::default());
    let mut overlay = Overlay::new();
    let relay = overlay
        .spawn_with(
            WalletIdentity::generate(),
            relay_config(),
            Services::new().with_receipt_sink(sink.clone()),
            &[],
        )
        .await
        .unwrap();
    let a = overlay.spawn(test_config(), &[&relay]).await.unwrap();
    assert!(overlay.wait_linked(&relay, &a).await);
    // B joins after A, so A has no route to B except through the relay
    let b = overlay.spawn(test_config(), &[&relay]).await.unwrap();
    assert!(overlay.wait_linked(&relay, &b).await);
    assert!(a.dht().get_node(&b.wallet()).is_none());

    let mut receipts = relay.subscribe_receipts();
    let mut inbox = b.subscribe_messages();
    let result = a.send_message(b.wallet(), &payload(3), "gossip-1").await.unwrap();
    assert_eq!(result.path, DeliveryPath::Gossip { via: relay.wallet() });
    assert!(result.relayed && !result.direct);

    let received = next_message(&mut inbox).await.unwrap();
    assert_eq!(received.message_id, "gossip-1");
    assert_eq!(received.from, a.wallet());
    assert_eq!(received.received_from, relay.wallet());
    assert!(received.via_gossip);

    let receipt = within(Duration::from_secs(5), receipts.recv())
        .await
        .and_then(|r| r.ok())
        .unwrap();
    assert_eq!(receipt.relay_node, relay.wallet());
    assert_eq!(receipt.sender, a.wallet());
    assert_eq!(receipt.recipient, b.wallet());
    assert_eq!(receipt.message_hash, payload(3).message_hash());
    assert!(receipt.verify());
    assert_eq!(relay.pending_receipts().len(), 1);

    // Submission empties the ledger
    relay.maintenance_tick().await;
    assert!(relay.pending_receipts().is_empty());
    assert_eq!(sink.receipts.lock().len(), 1);

    overlay.shutdown().await;
}

#[tokio::test]
async fn test_gossip_over_two_paths_delivered_once() {
    let mut overlay = Overlay::new();
    let r1 = overlay.spawn(test_config(), &[]).await.unwrap();
    let r2 = overlay.spawn(test_config(), &[&r1]).await.unwrap();
    assert!(overlay.wait_linked(&r1, &r2).await);
    let a = overlay.spawn(test_config(), &[&r1, &r2]).await.unwrap();
    assert!(overlay.wait_linked(&a, &r1).await && overlay.wait_linked(&a, &r2).await);
    let b = overlay.spawn(test_config(), &[&r1, &r2]).await.unwrap();
    assert!(overlay.wait_linked(&b, &r1).await && overlay.wait_linked(&b, &r2).await);

    let mut inbox = b.subscribe_messages();
    let result = a.send_message(b.wallet(), &payload(4), "fanout-1").await.unwrap();
    assert!(matches!(result.path, DeliveryPath::Gossip { .. }));

    let received = collect_for(&mut inbox, Duration::from_millis(750)).await;
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].message_id, "fanout-1");

    // Neither forwarder is a relay, so no receipts were issued
    assert!(r1.pending_receipts().is_empty());
    assert!(r2.pending_receipts().is_empty());

    overlay.shutdown().await;
}

#[tokio::test]
async fn test_gossip_ttl_limits_hops() {
    // Chain: A - R1 - R2 - B
    let mut overlay = Overlay::new();
    let r1 = overlay.spawn(test_config(), &[]).await.unwrap();
    let a = overlay.spawn(test_config(), &[&r1]).await.unwrap();
    assert!(overlay.wait_linked(&a, &r1).await);
    let r2 = overlay.spawn(test_config(), &[&r1]).await.unwrap();
    assert!(overlay.wait_linked(&r1, &r2).await);
    let b = overlay.spawn(test_config(), &[&r2]).await.unwrap();
    assert!(overlay.wait_linked(&r2, &b).await);

    let mut inbox = b.subscribe_messages();

    // R1 forwards with ttl 0; R2 must not forward again
    let short = a
        .send_message_with_ttl(b.wallet(), &payload(5), "ttl-1", 1)
        .await
        .unwrap();
    assert_eq!(short.path, DeliveryPath::Gossip { via: r1.wallet() });
    assert!(collect_for(&mut inbox, Duration::from_millis(500)).await.is_empty());

    let long = a
        .send_message_with_ttl(b.wallet(), &payload(6), "ttl-2", 2)
        .await
        .unwrap();
    assert_eq!(long.path, DeliveryPath::Gossip { via: r1.wallet() });
    let received = next_message(&mut inbox).await.unwrap();
    assert_eq!(received.message_id, "ttl-2");
    assert_eq!(received.received_from, r2.wallet());

    overlay.shutdown().await;
}

#[tokio::test]
async fn test_zero_ttl_reaches_neighbours_only() {
    // Chain: A - R - B
    let mut overlay = Overlay::new();
    let r = overlay.spawn(test_config(), &[]).await.unwrap();
    let a = overlay.spawn(test_config(), &[&r]).await.unwrap();
    assert!(overlay.wait_linked(&a, &r).await);
    let b = overlay.spawn(test_config(), &[&r]).await.unwrap();
    assert!(overlay.wait_linked(&r, &b).await);

    let mut inbox = b.subscribe_messages();

    let none = a
        .send_message_with_ttl(b.wallet(), &payload(7), "ttl-0", 0)
        .await
        .unwrap();
    assert_eq!(none.path, DeliveryPath::Gossip { via: r.wallet() });
    assert!(collect_for(&mut inbox, Duration::from_millis(500)).await.is_empty());

    a.send_message_with_ttl(b.wallet(), &payload(8), "ttl-1b", 1)
        .await
        .unwrap();
    let received = next_message(&mut inbox).await.unwrap();
    assert_eq!(received.message_id, "ttl-1b");
    assert_eq!(received.received_from, r.wallet());

    overlay.shutdown().await;
}

// ============================================================================
// Store-for-later
// ============================================================================

#[tokio::test]
async fn test_queued_message_flushed_when_recipient_connects() {
    let mut overlay = Overlay::new();
    let a = overlay.spawn(test_config(), &[]).await.unwrap();

    let b_identity = WalletIdentity::generate();
    let b_wallet = b_identity.address();
    let result = a.send_message(b_wallet, &payload(8), "later-1").await.unwrap();
    assert_eq!(result.path, DeliveryPath::Queued);
    assert_eq!(a.pending_messages_for(&b_wallet), 1);

    let b = overlay
        .spawn_with(b_identity, test_config(), Services::new(), &[&a])
        .await
        .unwrap();

    // The flush races B's subscription, so check the recipient's ack instead
    assert!(wait_until(Duration::from_secs(5), || a.is_acknowledged("later-1")).await);
    assert_eq!(a.pending_messages_for(&b_wallet), 0);
    assert!(b.is_connected_to(&a.wallet()));

    overlay.shutdown().await;
}

#[tokio::test]
async fn test_relay_holds_message_for_offline_recipient() {
    let mut overlay = Overlay::new();
    let relay = overlay.spawn(relay_config(), &[]).await.unwrap();
    let a = overlay.spawn(test_config(), &[&relay]).await.unwrap();
    assert!(overlay.wait_linked(&relay, &a).await);

    let b_identity = WalletIdentity::generate();
    let b_wallet = b_identity.address();
    let result = a.send_message(b_wallet, &payload(9), "held-1").await.unwrap();
    assert_eq!(result.path, DeliveryPath::Gossip { via: relay.wallet() });
    assert!(wait_until(Duration::from_secs(5), || relay.pending_messages_for(&b_wallet) == 1).await);
    assert_eq!(a.pending_message_count(), 0);

    let b = overlay
        .spawn_with(b_identity, test_config(), Services::new(), &[&relay])
        .await
        .unwrap();
    assert!(wait_until(Duration::from_secs(5), || relay.pending_messages_for(&b_wallet) == 0).await);
    assert!(wait_until(Duration::from_secs(5), || relay.is_acknowledged("held-1")).await);
    assert!(b.is_connected_to(&relay.wallet()));

    overlay.shutdown().await;
}
