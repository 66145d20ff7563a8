use apf::framing::ApfCodec;
use apf::messages::{AuthRequest, ChannelData, ProtocolVersion};
use bytes::BytesMut;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use tokio_util::codec::Decoder;

fn auth_frame() -> Vec<u8> {
    AuthRequest {
        username: "device-7".into(),
        service_name: "pfwd@amt.intel.com".into(),
        method_name: "password".into(),
        password: Some("P@ssw0rd".into()),
    }
    .encode()
}

fn bench_messages(c: &mut Criterion) {
    let mut group = c.benchmark_group("messages");

    let auth = auth_frame();
    group.bench_function("decode_auth_request", |b| {
        b.iter(|| AuthRequest::decode(black_box(&auth)).unwrap());
    });

    let version = ProtocolVersion {
        major_version: 1,
        minor_version: 0,
        trigger_reason: 9,
        uuid: [0x5A; 16],
    };
    group.bench_function("encode_protocol_version", |b| {
        b.iter(|| black_box(&version).encode());
    });

    group.finish();
}

fn bench_channel_data(c: &mut Criterion) {
    let mut group = c.benchmark_group("channel_data");

    for size in [64usize, 1024, 4096] {
        let payload = vec![0xC3; size];
        let frame = ChannelData::encode_slice(7, &payload);
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::new("encode", size), &payload, |b, p| {
            b.iter(|| ChannelData::encode_slice(7, black_box(p)));
        });
        group.bench_with_input(BenchmarkId::new("decode", size), &frame, |b, f| {
            b.iter(|| ChannelData::decode(black_box(f)).unwrap());
        });
    }

    group.finish();
}

fn bench_stream_split(c: &mut Criterion) {
    let mut stream = Vec::new();
    for i in 0..64u32 {
        stream.extend(ChannelData::encode_slice(i, &[0x11; 512]));
        stream.extend(auth_frame());
    }

    let mut group = c.benchmark_group("framing");
    group.throughput(Throughput::Bytes(stream.len() as u64));
    group.bench_function("split_mixed_stream", |b| {
        b.iter(|| {
            let mut codec = ApfCodec::default();
            let mut src = BytesMut::from(&stream[..]);
            let mut total = 0;
            while let Some(frame) = codec.decode(&mut src).unwrap() {
                total += black_box(frame).len();
            }
            total
        });
    });
    group.finish();
}

criterion_group!(benches, bench_messages, bench_channel_data, bench_stream_split);
criterion_main!(benches);
