//! Benchmarks for the file read/write path
//!
//! Runs over `MemoryEngine`, so the numbers measure the handle layer
//! (affinity and liveness checks, span entry, error dispatch) rather than a
//! network.

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use tether_integration_tests::{connect, engine, open_read, open_sftp, open_write};

/// Benchmark sequential reads of a 4 MiB file at several buffer sizes
fn bench_read(c: &mut Criterion) {
    let mut group = c.benchmark_group("file_read");
    let size = 4 * 1024 * 1024;
    let engine = engine().with_file("/srv/blob", vec![0xAA; size]);
    let session = connect(&engine);
    let sftp = open_sftp(&session);

    group.throughput(Throughput::Bytes(size as u64));
    for capacity in [4 * 1024, 32 * 1024, 256 * 1024] {
        group.bench_with_input(
            BenchmarkId::from_parameter(capacity),
            &capacity,
            |b, &capacity| {
                let mut buf = vec![0u8; capacity];
                b.iter(|| {
                    let mut file = open_read(&sftp, "/srv/blob");
                    let mut total = 0;
                    loop {
                        let n = file.read(&mut buf).unwrap();
                        if n == 0 {
                            break;
                        }
                        total += black_box(n);
                    }
                    total
                });
            },
        );
    }

    group.finish();
}

/// Benchmark writes, with and without a server-side cap on accepted bytes
fn bench_write(c: &mut Criterion) {
    let mut group = c.benchmark_group("file_write");
    let size = 1024 * 1024;
    let data = vec![0x55u8; 32 * 1024];

    for limit in [None, Some(4096)] {
        let engine = engine();
        engine.set_write_limit(limit);
        let session = connect(&engine);
        let sftp = open_sftp(&session);
        let label = limit.map_or_else(|| "uncapped".to_string(), |l| format!("cap_{l}"));

        group.throughput(Throughput::Bytes(size as u64));
        group.bench_function(label, |b| {
            b.iter(|| {
                let mut file = open_write(&sftp, "/var/tmp/bench");
                let mut written = 0;
                while written < size {
                    let mut offset = 0;
                    while offset < data.len() {
                        offset += file.write(&data[offset..], data.len() - offset).unwrap();
                    }
                    written += offset;
                }
                black_box(written)
            });
        });
    }

    group.finish();
}

/// Benchmark the per-call overhead of a zero-length read at end of file
fn bench_call_overhead(c: &mut Criterion) {
    let engine = engine();
    let session = connect(&engine);
    let sftp = open_sftp(&session);
    let mut file = open_read(&sftp, "/etc/hostname");
    let mut buf = [0u8; 8];
    while file.read(&mut buf).unwrap() > 0 {}

    c.bench_function("read_at_eof", |b| {
        b.iter(|| black_box(file.read(black_box(&mut buf)).unwrap()));
    });
}

criterion_group!(benches, bench_read, bench_write, bench_call_overhead);
criterion_main!(benches);
