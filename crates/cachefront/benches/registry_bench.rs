use cachefront::headers::{RequestHeaders, VaryAllowList};
use cachefront::key::Key;
use cachefront::registry::ActiveEntries;
use cachefront::store::{EntryStore, MemoryStore, StoredEntry};
use cachefront::lookup::ResponseMetadata;
use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use http::{Method, StatusCode};
use rand::Rng;
use std::time::SystemTime;

fn keys(n: usize) -> Vec<Key> {
    let allow_list = VaryAllowList::default();
    (0..n)
        .map(|i| {
            let req = RequestHeaders::new(
                Method::GET,
                format!("http://bench.test/object/{i}").parse().unwrap(),
            );
            Key::from_request(&req, &allow_list)
        })
        .collect()
}

fn registry_get_entry(c: &mut Criterion) {
    let mut group = c.benchmark_group("registry_get_entry");
    for &n in &[1_000usize, 100_000] {
        let keys = keys(n);
        let entries = ActiveEntries::default();
        for k in &keys {
            entries.get_entry(k);
        }
        group.bench_with_input(BenchmarkId::from_parameter(n), &keys, |b, keys| {
            let mut rng = rand::thread_rng();
            b.iter(|| {
                let k = &keys[rng.gen_range(0..keys.len())];
                black_box(entries.get_entry(k));
            });
        });
    }
    group.finish();
}

fn store_get(c: &mut Criterion) {
    let keys = keys(10_000);
    let store = MemoryStore::new(keys.len(), None);
    for k in &keys {
        let entry = StoredEntry {
            headers: cachefront::ResponseHeaders::new(StatusCode::OK),
            metadata: ResponseMetadata {
                response_time: SystemTime::now(),
            },
            body: Bytes::from_static(b"payload"),
            trailers: None,
        };
        let _ = store.put(k.clone(), entry);
    }

    c.bench_function("store_get_hit_mix", |b| {
        let mut rng = rand::thread_rng();
        b.iter(|| {
            let k = &keys[rng.gen_range(0..keys.len())];
            black_box(store.get(k));
        });
    });
}

criterion_group!(benches, registry_get_entry, store_get);
criterion_main!(benches);
