use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use svclog_core::RingBuffer;

fn bench_throughput(c: &mut Criterion) {
    let mut group = c.benchmark_group("RingBuffer_Throughput");
    let line = b"2024-01-01T00:00:00.000Z [bench] performance_test_payload_with_enough_length\n";

    for buffer_size in [4 * 1024, 64 * 1024, 1024 * 1024].iter() {
        for msg_count in [10_000, 100_000].iter() {
            let id = BenchmarkId::new("write_and_tail", format!("{buffer_size}B, {msg_count} msgs"));
            group.bench_with_input(id, &(*buffer_size, *msg_count), |b, &(capacity, num_msgs)| {
                b.iter(|| {
                    let rb = RingBuffer::new(capacity);
                    for _ in 0..num_msgs {
                        let _ = rb.write(line);
                    }
                    std::hint::black_box(rb.buffered());
                });
            });
        }
    }
    group.finish();
}

criterion_group!(benches, bench_throughput);
criterion_main!(benches);
