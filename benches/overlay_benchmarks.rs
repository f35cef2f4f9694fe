//! Overlay hot-path benchmarks
//!
//! Covers the per-frame costs on a busy relay: line encoding and decoding,
//! dedup cache lookups, receipt signing and verification.

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use mumble_core::node::MessageCache;
use mumble_core::protocol::{ChatMessage, GossipMessage, WireMessage, decode_line, encode_line};
use mumble_crypto::{EncryptedMessage, RelayReceipt, WalletAddress, WalletIdentity};
use std::time::Duration;

fn chat(size: usize) -> ChatMessage {
    let payload = EncryptedMessage::new([7; 12], vec![0xAB; size], [9; 16]);
    ChatMessage::new(
        "bench-message",
        WalletAddress::from_bytes([1; 20]),
        WalletAddress::from_bytes([2; 20]),
        &payload,
        1_700_000_000_000,
    )
}

fn bench_frame_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_codec");

    for size in [64usize, 1024, 16 * 1024] {
        let frame = WireMessage::Gossip(GossipMessage {
            chat: chat(size),
            ttl: 10,
            relay_receipt: None,
        });
        let line = encode_line(&frame).unwrap_or_default();

        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::new("encode", size), &frame, |b, frame| {
            b.iter(|| encode_line(black_box(frame)))
        });
        group.bench_with_input(BenchmarkId::new("decode", size), &line, |b, line| {
            b.iter(|| decode_line::<WireMessage>(black_box(line)))
        });
    }

    group.finish();
}

fn bench_message_cache(c: &mut Criterion) {
    let cache = MessageCache::new(Duration::from_secs(3600));
    let ids: Vec<String> = (0..10_000).map(|i| format!("msg-{i}")).collect();
    for id in &ids {
        cache.first_seen(id);
    }

    c.bench_function("message_cache_duplicate_hit", |b| {
        let mut i = 0;
        b.iter(|| {
            i = (i + 1) % ids.len();
            cache.first_seen(black_box(&ids[i]))
        })
    });
}

fn bench_relay_receipt(c: &mut Criterion) {
    let sender = WalletIdentity::generate();
    let relay = WalletAddress::from_bytes([3; 20]);
    let recipient = WalletAddress::from_bytes([4; 20]);
    let hash = chat(256).payload().message_hash();

    c.bench_function("relay_receipt_issue", |b| {
        b.iter(|| RelayReceipt::issue(&sender, black_box(hash), relay, recipient))
    });

    if let Ok(receipt) = RelayReceipt::issue(&sender, hash, relay, recipient) {
        c.bench_function("relay_receipt_verify", |b| b.iter(|| black_box(&receipt).verify()));
    }
}

criterion_group!(benches, bench_frame_codec, bench_message_cache, bench_relay_receipt);
criterion_main!(benches);
