use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use tinyweb::buffer::Buffer;

fn append_then_retrieve(c: &mut Criterion) {
    let mut group = c.benchmark_group("buffer_append_retrieve");
    for &size in &[64usize, 1024, 16384] {
        let payload = vec![b'x'; size];
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::new("append_retrieve", size), &payload, |b, payload| {
            b.iter(|| {
                let mut buf = Buffer::new(64);
                buf.append(payload);
                buf.retrieve(buf.readable());
            })
        });
    }
    group.finish();
}

fn read_from_forces_compaction(c: &mut Criterion) {
    let mut group = c.benchmark_group("buffer_read_from");
    for &size in &[256usize, 4096, 131_072] {
        let payload = vec![b'y'; size];
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::new("read_from", size), &payload, |b, payload| {
            b.iter(|| {
                let mut buf = Buffer::new(16);
                let mut src: &[u8] = payload;
                while buf.read_from(&mut src).unwrap() > 0 {}
                buf.retrieve_all();
            })
        });
    }
    group.finish();
}

criterion_group!(benches, append_then_retrieve, read_from_forces_compaction);
criterion_main!(benches);
