//! Benchmark: request encoding and reply decoding at typical detection sizes

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use tensor_bridge::codec::{decode_reply, decode_request, encode_reply, encode_request, InputSpec};
use tensor_bridge::{DType, RequestFrame, TensorDescriptor, TensorSet};

fn request(side: usize) -> RequestFrame {
    let image = vec![0.5f32; 3 * side * side];
    let tensors = TensorSet::from_descriptors(vec![
        TensorDescriptor::from_elements("image", vec![1, 3, side, side], &image).unwrap(),
        TensorDescriptor::from_elements("threshold", vec![1], &[0.25f32]).unwrap(),
    ])
    .unwrap();
    RequestFrame::new(tensors).with_mask(vec![side, side])
}

fn bench_request(c: &mut Criterion) {
    let inputs = vec![
        InputSpec::new("image", DType::Float32),
        InputSpec::new("threshold", DType::Float32),
    ];
    let mut group = c.benchmark_group("request");

    for side in [224usize, 640] {
        let frame = request(side);
        let payload = encode_request(&frame).unwrap();
        group.throughput(Throughput::Bytes(payload.len() as u64));

        group.bench_with_input(BenchmarkId::new("encode", side), &frame, |b, frame| {
            b.iter(|| encode_request(black_box(frame)).unwrap())
        });
        group.bench_with_input(BenchmarkId::new("decode", side), &payload, |b, payload| {
            b.iter(|| decode_request(black_box(payload), &inputs).unwrap())
        });
    }
    group.finish();
}

fn bench_reply(c: &mut Criterion) {
    let mut group = c.benchmark_group("reply");

    for detections in [100usize, 8400] {
        let boxes = vec![1.0f32; detections * 6];
        let outputs = TensorSet::from_descriptors(vec![
            TensorDescriptor::from_elements("boxes", vec![detections, 6], &boxes).unwrap(),
        ])
        .unwrap();
        let reply = encode_reply(&outputs).unwrap();
        group.throughput(Throughput::Bytes(reply.len() as u64));

        group.bench_with_input(BenchmarkId::new("decode", detections), &reply, |b, reply| {
            b.iter(|| decode_reply(black_box(reply)).unwrap())
        });
    }
    group.finish();
}

criterion_group!(benches, bench_request, bench_reply);
criterion_main!(benches);
