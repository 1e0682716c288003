// Storage-layer benchmarks: buffer pool fetch under varying working
// sets, and the row codec.

use anchordb::catalog::Column;
use anchordb::common::{DataType, Value};
use anchordb::storage::buffer::BufferPool;
use anchordb::storage::disk::DiskManager;
use anchordb::storage::page::PageType;
use anchordb::storage::record;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;

fn deadline() -> Instant {
    Instant::now() + Duration::from_secs(10)
}

fn build_pool(frames: usize, pages: usize) -> (Arc<BufferPool>, Vec<u32>, TempDir) {
    let dir = TempDir::new().unwrap();
    let disk = Arc::new(DiskManager::open(dir.path().join("bench.adb"), 4096).unwrap());
    let pool = Arc::new(BufferPool::new(frames, disk));
    let ids: Vec<u32> = (0..pages)
        .map(|_| {
            let guard = pool.new_page(PageType::Leaf, deadline()).unwrap();
            guard.page_id()
        })
        .collect();
    pool.flush_all().unwrap();
    (pool, ids, dir)
}

fn bench_buffer_pool_fetch(c: &mut Criterion) {
    let mut group = c.benchmark_group("buffer_pool_fetch");
    for &(frames, pages) in &[(64usize, 32usize), (64, 256)] {
        let (pool, ids, _dir) = build_pool(frames, pages);
        let label = if pages <= frames { "resident" } else { "evicting" };
        group.bench_with_input(BenchmarkId::new(label, pages), &ids, |b, ids| {
            let mut i = 0usize;
            b.iter(|| {
                let id = ids[i % ids.len()];
                i += 1;
                let guard = pool.get(id, deadline()).unwrap();
                black_box(guard.read().slot_count());
            });
        });
    }
    group.finish();
}

fn bench_row_codec(c: &mut Criterion) {
    let columns = vec![
        Column::new("id", DataType::Integer).primary_key(),
        Column::new("name", DataType::Text),
        Column::new("score", DataType::Real),
        Column::new("active", DataType::Boolean),
    ];
    let row = vec![
        Value::Integer(123456),
        Value::Text("a moderately sized text value".into()),
        Value::Real(2.75),
        Value::Boolean(true),
    ];
    let encoded = record::encode_row(&columns, &row).unwrap();

    c.bench_function("record_encode", |b| {
        b.iter(|| record::encode_row(black_box(&columns), black_box(&row)).unwrap())
    });
    c.bench_function("record_decode", |b| {
        b.iter(|| record::decode(black_box(&columns), black_box(&encoded)).unwrap())
    });
}

criterion_group!(benches, bench_buffer_pool_fetch, bench_row_codec);
criterion_main!(benches);
