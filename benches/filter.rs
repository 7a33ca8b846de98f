//! Filter and top-k selection benchmarks
//!
//! Run with: cargo bench --bench filter

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use rand::Rng;

use memo_db::arena::Arena;
use memo_db::filter::filter_mask;
use memo_db::index::{select_top_k, SearchResult};
use memo_db::meta::MetaStore;

fn synthetic_store(records: usize) -> MetaStore {
    let mut rng = rand::thread_rng();
    let sources = ["user", "chat", "import"];
    let mut store = MetaStore::new(records);
    for _ in 0..records {
        if rng.gen_bool(0.2) {
            store.add(None).unwrap();
            continue;
        }
        let line = format!(
            "source: {}, priority: {}, tags: [alpha, tag{}]",
            sources[rng.gen_range(0..sources.len())],
            rng.gen_range(0..10),
            rng.gen_range(0..50)
        );
        store.add(Some(&line)).unwrap();
    }
    store
}

fn bench_filter_mask(c: &mut Criterion) {
    let mut group = c.benchmark_group("filter_mask");

    for records in [1_000usize, 10_000] {
        let store = synthetic_store(records);
        let mut arena = Arena::with_capacity(1 << 28);
        group.throughput(Throughput::Elements(records as u64));

        group.bench_function(format!("equality_{records}"), |b| {
            b.iter(|| filter_mask(black_box(&store), &mut arena, "source: user").unwrap())
        });
        group.bench_function(format!("and_range_{records}"), |b| {
            b.iter(|| {
                filter_mask(
                    black_box(&store),
                    &mut arena,
                    "$and: [{priority: {$gte: 3}}, {priority: {$lte: 7}}]",
                )
                .unwrap()
            })
        });
        group.bench_function(format!("contains_{records}"), |b| {
            b.iter(|| filter_mask(black_box(&store), &mut arena, "tags: {$contains: alpha}").unwrap())
        });
    }

    group.finish();
}

fn bench_top_k(c: &mut Criterion) {
    let mut rng = rand::thread_rng();
    let mut group = c.benchmark_group("select_top_k");

    for candidates in [1_000usize, 100_000] {
        let scored: Vec<SearchResult> = (0..candidates)
            .map(|i| SearchResult {
                id: i as u64,
                score: rng.gen::<f32>(),
            })
            .collect();
        group.throughput(Throughput::Elements(candidates as u64));

        group.bench_function(format!("k10_of_{candidates}"), |b| {
            b.iter(|| select_top_k(black_box(scored.clone()), 10))
        });
    }

    group.finish();
}

criterion_group!(benches, bench_filter_mask, bench_top_k);
criterion_main!(benches);
