use criterion::{black_box, criterion_group, criterion_main, Criterion};

use chatwire_relay::wire::{
    decode_frame, encode_frame, encode_message_payload, gzip_payload, FrameDecoder, FrameKind,
};

fn build_stream(frames: usize, text_len: usize, gzip: bool) -> Vec<u8> {
    let text = "relay ".repeat(text_len / 6 + 1);
    let mut out = Vec::new();
    for _ in 0..frames {
        let payload = encode_message_payload(&text[..text_len]);
        let payload = if gzip { gzip_payload(&payload) } else { payload };
        out.extend_from_slice(&encode_frame(FrameKind::MessagePayload, &payload));
        out.extend_from_slice(&encode_frame(FrameKind::MessagePayload, b"{}"));
    }
    out.extend_from_slice(&encode_frame(FrameKind::ErrorPayload, b"{}"));
    out
}

fn drain(bytes: &[u8], chunk_size: usize) -> usize {
    let mut decoder = FrameDecoder::new();
    let mut units = 0;
    for chunk in bytes.chunks(chunk_size) {
        decoder.feed(chunk);
        while let Ok(Some(frame)) = decoder.next_frame() {
            if let Ok(Some(unit)) = decode_frame(&frame) {
                black_box(unit);
                units += 1;
            }
        }
    }
    units
}

fn bench_frame_decode(c: &mut Criterion) {
    let plain = build_stream(256, 96, false);
    let gzipped = build_stream(256, 96, true);

    c.bench_function("frame_decode_plain_256x96_chunk_4k", |b| {
        b.iter(|| drain(black_box(&plain), 4096));
    });
    c.bench_function("frame_decode_plain_256x96_chunk_7", |b| {
        b.iter(|| drain(black_box(&plain), 7));
    });
    c.bench_function("frame_decode_gzip_256x96_chunk_4k", |b| {
        b.iter(|| drain(black_box(&gzipped), 4096));
    });
}

criterion_group!(benches, bench_frame_decode);
criterion_main!(benches);
