// wispstream benchmarks using criterion.
//
// Measures:
//   - Packet encode / decode throughput
//   - Connection dispatch of inbound DATA
//   - Queue drain on CONTINUE

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use bytes::Bytes;
use wispstream::packet::{Packet, StreamType};
use wispstream::{ChannelTransport, Connection, TransportEvent};

// ---------------------------------------------------------------------------
// Packet encode throughput
// ---------------------------------------------------------------------------

fn bench_packet_encode(c: &mut Criterion) {
    let sizes: &[usize] = &[64, 1024, 8192, 65536];

    let mut group = c.benchmark_group("packet_encode");
    for &size in sizes {
        let packet = Packet::data(1, Bytes::from(vec![0xABu8; size]));
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(format!("{size}B")),
            &packet,
            |b, p| {
                b.iter(|| {
                    black_box(p.encode());
                });
            },
        );
    }
    group.finish();
}

// ---------------------------------------------------------------------------
// Packet decode throughput
// ---------------------------------------------------------------------------

fn bench_packet_decode(c: &mut Criterion) {
    let sizes: &[usize] = &[64, 1024, 8192, 65536];

    let mut group = c.benchmark_group("packet_decode");
    for &size in sizes {
        let encoded = Packet::data(1, Bytes::from(vec![0xABu8; size])).encode();
        group.throughput(Throughput::Bytes(encoded.len() as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(format!("{size}B")),
            &encoded,
            |b, data| {
                b.iter(|| {
                    black_box(Packet::decode(black_box(data)).unwrap());
                });
            },
        );
    }
    group.finish();
}

// ---------------------------------------------------------------------------
// Inbound DATA dispatch
// ---------------------------------------------------------------------------

fn bench_dispatch(c: &mut Criterion) {
    let (transport, _outbound) = ChannelTransport::new();
    let conn = Connection::connect("ws://bench.local/", transport).unwrap();
    conn.handle_event(TransportEvent::Message(Packet::continue_(0, 128).encode()))
        .unwrap();

    let mut handles: Vec<_> = (0..16)
        .map(|i| conn.create_stream("bench.local", 9000 + i, StreamType::Tcp).unwrap())
        .collect();
    let messages: Vec<Bytes> = handles
        .iter()
        .map(|h| Packet::data(h.id(), Bytes::from_static(&[0u8; 512])).encode())
        .collect();

    c.bench_function("dispatch_data_16_streams", |b| {
        b.iter(|| {
            for m in &messages {
                conn.handle_message(black_box(m)).unwrap();
            }
            for h in handles.iter_mut() {
                while h.try_recv().is_some() {}
            }
        });
    });
}

// ---------------------------------------------------------------------------
// Queue drain on CONTINUE
// ---------------------------------------------------------------------------

fn bench_continue_drain(c: &mut Criterion) {
    c.bench_function("continue_drain_256", |b| {
        b.iter(|| {
            let (transport, _outbound) = ChannelTransport::new();
            let conn = Connection::connect("ws://bench.local/", transport).unwrap();
            conn.handle_message(&Packet::continue_(0, 0).encode()).unwrap();
            let stream = conn.create_stream("bench.local", 1, StreamType::Tcp).unwrap();
            for _ in 0..256 {
                stream.send(Bytes::from_static(b"chunk")).unwrap();
            }
            conn.handle_message(&Packet::continue_(stream.id(), 256).encode())
                .unwrap();
            black_box(stream.queued_len());
        });
    });
}

criterion_group!(
    benches,
    bench_packet_encode,
    bench_packet_decode,
    bench_dispatch,
    bench_continue_drain,
);
criterion_main!(benches);
