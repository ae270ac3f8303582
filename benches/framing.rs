//! Framer throughput benchmarks.
//!
//! Run with: `cargo bench --features benchmark`

use criterion::{Criterion, criterion_group, criterion_main};
use crowsnest::BlockFramer;
use crowsnest::protocol::BLOCK_MARKER;
use crowsnest::protocol::escape::escape;
use std::hint::black_box;

fn wire_frame(address: u8, framebyte: u8, payload: &[u8]) -> Vec<u8> {
    let exp = (0u8..=6)
        .find(|e| 2 * (1usize << e) == payload.len())
        .expect("valid payload size");
    let mut body = vec![exp << 5, address, 0x00, framebyte, 0x00, 0x00];
    body.extend_from_slice(payload);
    body.push(0x00);

    let mut frame = vec![BLOCK_MARKER];
    frame.extend(escape(&body));
    frame
}

fn measurement_burst() -> Vec<u8> {
    // One full SAM measurement: 8 frames of 64 payload bytes each.
    let payload: Vec<u8> = (0u8..64).collect();
    let mut stream = Vec::new();
    for fb in (1u8..=7).rev() {
        stream.extend(wire_frame(0x04, fb, &payload));
    }
    stream.extend(wire_frame(0x04, 0, &payload));
    stream
}

fn bench_framing(c: &mut Criterion) {
    let burst = measurement_burst();

    c.bench_function("frame_measurement_burst", |b| {
        b.iter(|| {
            let mut framer = BlockFramer::new();
            let blocks = framer.push(black_box(&burst));
            assert_eq!(blocks.len(), 8);
            black_box(blocks)
        })
    });

    c.bench_function("frame_chunked_stream", |b| {
        b.iter(|| {
            let mut framer = BlockFramer::new();
            let mut total = 0;
            for chunk in burst.chunks(black_box(16)) {
                total += framer.push(chunk).len();
            }
            assert_eq!(total, 8);
            black_box(total)
        })
    });
}

criterion_group!(benches, bench_framing);
criterion_main!(benches);
