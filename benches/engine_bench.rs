//! LETHE - Performance Benchmarks
//! Measures throughput of core engine operations using Criterion.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use lethe::engine::blob::compression::BlobCodec;
use lethe::engine::blob::{BlobFileBuilder, BlobFileReader};
use lethe::{Config, GcOutcome, Lethe};

fn open(dir: &std::path::Path) -> Lethe {
    let config = Config::builder(dir)
        .with_min_blob_size(1024)
        .with_disable_background_gc(true)
        .with_purge_obsolete_files_period_sec(0)
        .with_gc_batch_size(0, u64::MAX)
        .with_sync_writes(false)
        .build()
        .unwrap();
    Lethe::open(config).unwrap()
}

fn bench_blob_file(c: &mut Criterion) {
    let mut group = c.benchmark_group("blob_file");

    // Benchmark: Append and seal
    group.bench_function("append_1000x4k", |b| {
        let value = vec![0xABu8; 4096];
        b.iter(|| {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("000001.blob");
            let mut builder =
                BlobFileBuilder::create(path, 1, BlobCodec::uncompressed(), false, false).unwrap();
            for i in 0..1000 {
                let key = format!("key_{:06}", i).into_bytes();
                builder.add(black_box(&key), black_box(&value)).unwrap();
            }
            black_box(builder.finish().unwrap());
        });
    });

    // Benchmark: Point reads through the footer index
    group.bench_function("read_hit", |b| {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("000001.blob");
        let mut builder =
            BlobFileBuilder::create(path.clone(), 1, BlobCodec::uncompressed(), false, false)
                .unwrap();
        let mut indexes = Vec::new();
        for i in 0..1000 {
            let key = format!("key_{:06}", i).into_bytes();
            indexes.push((key.clone(), builder.add(&key, &vec![i as u8; 4096]).unwrap()));
        }
        builder.finish().unwrap();
        let reader = BlobFileReader::open(&path, 1).unwrap();
        let (key, index) = &indexes[500];
        b.iter(|| {
            black_box(reader.get(key, index).unwrap());
        });
    });

    group.finish();
}

fn bench_engine_writes(c: &mut Criterion) {
    let mut group = c.benchmark_group("engine_put");

    for size in [128usize, 4096, 65536].iter() {
        group.bench_with_input(BenchmarkId::new("put_1000", size), size, |b, &size| {
            let value = vec![0x5Au8; size];
            b.iter(|| {
                let dir = tempfile::tempdir().unwrap();
                let engine = open(dir.path());
                for i in 0..1000 {
                    let key = format!("key_{:06}", i).into_bytes();
                    engine.put(key, black_box(value.clone())).unwrap();
                }
            });
        });
    }

    group.finish();
}

fn bench_engine_reads(c: &mut Criterion) {
    let mut group = c.benchmark_group("engine_get");

    for size in [128usize, 4096].iter() {
        group.bench_with_input(BenchmarkId::new("get_hit", size), size, |b, &size| {
            let dir = tempfile::tempdir().unwrap();
            let engine = open(dir.path());
            for i in 0..1000 {
                let key = format!("key_{:06}", i).into_bytes();
                engine.put(key, vec![i as u8; size]).unwrap();
            }
            engine.flush().unwrap();
            b.iter(|| {
                black_box(engine.get(b"key_000500").unwrap());
            });
        });
    }

    group.finish();
}

fn bench_gc_cycle(c: &mut Criterion) {
    let mut group = c.benchmark_group("gc");
    group.sample_size(10);

    // Benchmark: One cycle over a file that is 75% garbage
    group.bench_function("collect_75pct", |b| {
        b.iter(|| {
            let dir = tempfile::tempdir().unwrap();
            let engine = open(dir.path());
            for i in 0..1000 {
                let key = format!("key_{:06}", i).into_bytes();
                engine.put(key, vec![i as u8; 4096]).unwrap();
            }
            engine.flush().unwrap();
            for i in 0..750 {
                engine.delete(format!("key_{:06}", i).into_bytes()).unwrap();
            }
            let outcome = engine.run_gc().unwrap();
            assert!(matches!(outcome, GcOutcome::Completed(_)));
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_blob_file,
    bench_engine_writes,
    bench_engine_reads,
    bench_gc_cycle
);
criterion_main!(benches);
