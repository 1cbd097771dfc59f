//! Segment codec and replay cache benchmarks.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};

use veilmux::crypto::TAG_SIZE;
use veilmux::protocol::{DataAck, Metadata, Protocol, SessionControl, METADATA_LEN};
use veilmux::replay::ReplayCache;

fn bench_metadata_marshal(c: &mut Criterion) {
    let da = DataAck {
        protocol: Protocol::Data,
        session_id: 42,
        seq: 1000,
        unack_seq: 998,
        window: 256,
        prefix_len: 13,
        payload_len: 1300,
        suffix_len: 250,
    };

    let mut group = c.benchmark_group("metadata_marshal");
    group.throughput(Throughput::Bytes(METADATA_LEN as u64));
    group.bench_function("data_ack", |b| b.iter(|| black_box(da.marshal())));

    let sc = SessionControl {
        protocol: Protocol::OpenSessionRequest,
        session_id: 42,
        seq: 0,
        status: 0,
        payload_len: 0,
        suffix_len: 77,
    };
    group.bench_function("session_control", |b| b.iter(|| black_box(sc.marshal())));
    group.finish();
}

fn bench_metadata_unmarshal(c: &mut Criterion) {
    let block = DataAck {
        protocol: Protocol::Data,
        session_id: 42,
        seq: 1000,
        unack_seq: 998,
        window: 256,
        prefix_len: 13,
        payload_len: 1300,
        suffix_len: 250,
    }
    .marshal();

    let mut group = c.benchmark_group("metadata_unmarshal");
    group.throughput(Throughput::Bytes(METADATA_LEN as u64));
    group.bench_function("data_ack", |b| {
        b.iter(|| black_box(Metadata::unmarshal(&block).unwrap()))
    });
    group.finish();
}

fn bench_replay_lookup(c: &mut Criterion) {
    let cache = ReplayCache::default();

    // Warm the cache with a realistic population.
    for i in 0u32..100_000 {
        let mut tag = [0u8; TAG_SIZE];
        tag[..4].copy_from_slice(&i.to_be_bytes());
        cache.is_duplicate(&tag);
    }

    let mut group = c.benchmark_group("replay_cache");
    let mut counter: u32 = 0;
    group.bench_function("insert_miss", |b| {
        b.iter(|| {
            counter = counter.wrapping_add(1);
            let mut tag = [0xffu8; TAG_SIZE];
            tag[..4].copy_from_slice(&counter.to_be_bytes());
            black_box(cache.is_duplicate(&tag))
        })
    });

    let hit = [0u8; TAG_SIZE];
    cache.is_duplicate(&hit);
    group.bench_function("lookup_hit", |b| b.iter(|| black_box(cache.is_duplicate(&hit))));
    group.finish();
}

criterion_group!(
    benches,
    bench_metadata_marshal,
    bench_metadata_unmarshal,
    bench_replay_lookup
);
criterion_main!(benches);
