//! Wire format benchmarks.

use batchsync_bench::order_inserts;
use batchsync_protocol::{ProtocolReader, ProtocolWriter, WireLine};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

fn encode(records: &[batchsync_protocol::ChangeRecord]) -> Vec<u8> {
    let mut writer = ProtocolWriter::new(Vec::new());
    writer.start_batch("00000", "default", 1).unwrap();
    for record in records {
        writer.write_record(record).unwrap();
    }
    writer.end_batch(1).unwrap();
    writer.flush().unwrap();
    writer.into_inner()
}

/// Benchmark writing one batch.
fn bench_write_batch(c: &mut Criterion) {
    let mut group = c.benchmark_group("write_batch");

    for count in [10, 100, 1000].iter() {
        let records = order_inserts(*count, 64);
        group.throughput(Throughput::Elements(*count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), &records, |b, records| {
            b.iter(|| black_box(encode(records)));
        });
    }
    group.finish();
}

/// Benchmark parsing one batch back into lines.
fn bench_read_batch(c: &mut Criterion) {
    let mut group = c.benchmark_group("read_batch");

    for count in [10, 100, 1000].iter() {
        let encoded = encode(&order_inserts(*count, 64));
        group.throughput(Throughput::Bytes(encoded.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), &encoded, |b, encoded| {
            b.iter(|| {
                let lines = ProtocolReader::new(encoded.as_slice())
                    .collect::<Result<Vec<_>, _>>()
                    .unwrap();
                black_box(lines)
            });
        });
    }
    group.finish();
}

/// Benchmark single line parsing with quoted values.
fn bench_parse_line(c: &mut Criterion) {
    let encoded = WireLine::Insert("\"42\",\"a \"\"quoted\"\" customer\",\"19.99\"".to_string()).encode();
    let line = encoded.trim_end();
    c.bench_function("parse_line", |b| {
        b.iter(|| WireLine::parse(black_box(line), 1).unwrap());
    });
}

criterion_group!(benches, bench_write_batch, bench_read_batch, bench_parse_line);
criterion_main!(benches);
