//! Key codec and store benchmarks
//!
//! Run with: cargo bench -p tuplekv-storage

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};

use tuplekv_storage::{key, Key, KeyCodec, KvStore, ListOptions, Selector};

fn bench_codec(c: &mut Criterion) {
    let codec = KeyCodec::default();
    let key = key!["documents", "0b7a3c52-9f1e-4e55-a3f4-6a1f0c2d9e11", "settings", 42, true];

    let mut group = c.benchmark_group("codec");
    group.throughput(Throughput::Elements(1));

    group.bench_function("serialize", |b| {
        b.iter(|| codec.serialize(black_box(&key)).unwrap());
    });

    let raw = codec.serialize(&key).unwrap();
    group.bench_function("deserialize", |b| {
        b.iter(|| codec.deserialize(black_box(&raw)));
    });

    group.bench_function("prefix_pattern", |b| {
        b.iter(|| codec.prefix_pattern(black_box(&key)).unwrap());
    });

    group.finish();
}

fn bench_store(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let store = rt.block_on(KvStore::in_memory()).unwrap();

    // Prepopulate
    rt.block_on(async {
        for i in 0..1000 {
            store.set(&key!["bench", format!("{i:04}")], &i).await.unwrap();
        }
    });

    let mut group = c.benchmark_group("store");

    group.bench_function("get", |b| {
        let mut i = 0u32;
        b.iter(|| {
            let k = key!["bench", format!("{:04}", i % 1000)];
            rt.block_on(store.get::<u32>(black_box(&k))).unwrap();
            i += 1;
        });
    });

    group.bench_function("set", |b| {
        let mut i = 0u32;
        b.iter(|| {
            let k = key!["bench_put", i];
            rt.block_on(store.set(black_box(&k), &i)).unwrap();
            i += 1;
        });
    });

    group.bench_function("list_prefix_100", |b| {
        b.iter(|| {
            let stream = store
                .list::<u32>(
                    Selector::prefix(key!["bench"]),
                    ListOptions::default().limit(100),
                )
                .unwrap();
            rt.block_on(stream.collect_entries()).unwrap()
        });
    });

    let keys: Vec<Key> = (0..100).map(|i| key!["bench", format!("{i:04}")]).collect();
    group.bench_function("get_many_100", |b| {
        b.iter(|| rt.block_on(store.get_many::<u32>(black_box(&keys))).unwrap());
    });

    group.finish();
}

criterion_group!(benches, bench_codec, bench_store);
criterion_main!(benches);
