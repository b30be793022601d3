//! Benchmarks for wire message encoding and decoding
//!
//! Run with: cargo bench --bench codec

use std::hint::black_box;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use rollback_link::network::messages::InputMessage;
use rollback_link::{Message, Tick, TURN_DATA_LEN};

fn input_message(trailer_len: usize) -> Message {
    Message::Input(InputMessage {
        battle_number: 1,
        local_tick: Tick::new(1234),
        remote_tick: Tick::new(1230),
        joyflags: 0xfc10,
        aux_state: 2,
        trailer: vec![0x5a; trailer_len],
    })
}

fn bench_input_messages(c: &mut Criterion) {
    let mut group = c.benchmark_group("Input message");

    for trailer_len in [0, TURN_DATA_LEN] {
        let message = input_message(trailer_len);
        group.bench_with_input(
            BenchmarkId::new("encode", trailer_len),
            &message,
            |b, message| b.iter(|| black_box(message).encode().unwrap()),
        );

        let frame = message.encode().unwrap();
        group.bench_with_input(BenchmarkId::new("decode", trailer_len), &frame, |b, frame| {
            b.iter(|| Message::decode(black_box(frame)).unwrap());
        });
    }

    group.finish();
}

fn bench_ping(c: &mut Criterion) {
    let ping = Message::Ping {
        timestamp_micros: 1_700_000_000_000_000,
    };
    let frame = ping.encode().unwrap();
    c.bench_function("Ping decode", |b| {
        b.iter(|| Message::decode(black_box(&frame)).unwrap());
    });
}

criterion_group!(benches, bench_input_messages, bench_ping);
criterion_main!(benches);
