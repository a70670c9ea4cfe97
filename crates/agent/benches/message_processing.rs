//! Performance benchmarks for message processing.
//!
//! These benchmarks measure the hot paths in the agent:
//! - Output chunk encoding/decoding
//! - Link message serialization and framing
//! - Inbound sequencing decisions

use agent::session::InboundCursor;
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use protocol::{
    decode_chunk, encode_chunk, ChannelStream, Frame, FrameCodec, LinkMessage, OutputPush,
    StreamEventId, StreamEventKind,
};

fn terminal_output(len: usize) -> Vec<u8> {
    b"drwxr-xr-x  5 agent agent 4096 Oct 19 12:00 src\r\n"
        .iter()
        .copied()
        .cycle()
        .take(len)
        .collect()
}

fn output_message(len: usize) -> LinkMessage {
    let push = OutputPush {
        content: encode_chunk(&terminal_output(len)),
        sequence: 42,
    };
    LinkMessage::ChannelStream(ChannelStream {
        event_id: StreamEventId::new("s1", StreamEventKind::RecvData).to_string(),
        room_id: "client-1".to_string(),
        data: serde_json::to_value(push).unwrap(),
    })
}

/// Benchmark chunk encoding performance.
fn bench_chunk_encoding(c: &mut Criterion) {
    let mut group = c.benchmark_group("chunk_encoding");

    for (name, len) in [("keystroke_1B", 1), ("line_80B", 80), ("screen_4KB", 4096)] {
        let data = terminal_output(len);
        let encoded = encode_chunk(&data);
        group.throughput(Throughput::Bytes(len as u64));

        group.bench_function(format!("encode_{}", name), |b| {
            b.iter(|| encode_chunk(black_box(&data)));
        });
        group.bench_function(format!("decode_{}", name), |b| {
            b.iter(|| decode_chunk(black_box(&encoded)).unwrap());
        });
    }

    group.finish();
}

/// Benchmark link message serialization.
fn bench_link_serialization(c: &mut Criterion) {
    let mut group = c.benchmark_group("link_serialization");

    let message = output_message(4096);
    let json = message.to_json().unwrap();
    let msgpack = message.to_msgpack().unwrap();

    group.bench_function("to_json_4KB", |b| {
        b.iter(|| black_box(&message).to_json().unwrap());
    });
    group.bench_function("from_json_4KB", |b| {
        b.iter(|| LinkMessage::from_json(black_box(&json)).unwrap());
    });
    group.bench_function("to_msgpack_4KB", |b| {
        b.iter(|| black_box(&message).to_msgpack().unwrap());
    });
    group.bench_function("from_msgpack_4KB", |b| {
        b.iter(|| LinkMessage::from_msgpack(black_box(&msgpack)).unwrap());
    });

    group.finish();
}

/// Benchmark socket framing with and without compression.
fn bench_framing(c: &mut Criterion) {
    let mut group = c.benchmark_group("framing");

    let payload = output_message(16 * 1024).to_msgpack().unwrap();
    group.throughput(Throughput::Bytes(payload.len() as u64));

    for (name, codec) in [
        ("compressed", FrameCodec::new()),
        ("plain", FrameCodec::without_compression()),
    ] {
        let frame = Frame::new(payload.clone());
        let wire = codec.encode(&frame).unwrap();

        group.bench_function(format!("encode_{}", name), |b| {
            b.iter(|| codec.encode(black_box(&frame)).unwrap());
        });
        group.bench_function(format!("decode_{}", name), |b| {
            b.iter(|| codec.decode(black_box(&wire)).unwrap());
        });
    }

    group.finish();
}

/// Benchmark the per-call ordering decision.
fn bench_sequencing(c: &mut Criterion) {
    let mut group = c.benchmark_group("sequencing");

    let cursor = InboundCursor {
        cycle: 3,
        applied: 1_000,
        closed: false,
    };

    group.bench_function("turn_ready", |b| {
        b.iter(|| black_box(&cursor).turn(black_box(3), black_box(1_001)));
    });
    group.bench_function("turn_waiting", |b| {
        b.iter(|| black_box(&cursor).turn(black_box(3), black_box(1_010)));
    });
    group.bench_function("turn_duplicate", |b| {
        b.iter(|| black_box(&cursor).turn(black_box(3), black_box(999)));
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_chunk_encoding,
    bench_link_serialization,
    bench_framing,
    bench_sequencing,
);

criterion_main!(benches);
