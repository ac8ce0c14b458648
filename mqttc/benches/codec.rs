use bytes::{Bytes, BytesMut};
use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use mqttc::protocol::{MAX_PACKET_SIZE, codec, v4};
use mqttc::{MessageQueue, Message, QoS};

fn bench_variable_int(c: &mut Criterion) {
    let mut group = c.benchmark_group("variable_int");
    for value in [127u32, 16_383, 2_097_151, 268_435_455] {
        group.bench_with_input(BenchmarkId::new("encode", value), &value, |b, &v| {
            let mut buf = BytesMut::with_capacity(4);
            b.iter(|| {
                buf.clear();
                codec::write_variable_int(&mut buf, black_box(v)).unwrap()
            })
        });

        let mut encoded = BytesMut::new();
        codec::write_variable_int(&mut encoded, value).unwrap();
        group.bench_with_input(BenchmarkId::new("decode", value), &encoded, |b, buf| {
            b.iter(|| codec::read_variable_int(black_box(buf)).unwrap())
        });
    }
    group.finish();
}

fn bench_publish(c: &mut Criterion) {
    let mut group = c.benchmark_group("publish");
    for size in [16usize, 1024, 64 * 1024] {
        let packet = v4::create_publish("sensors/livingroom/temperature", Bytes::from(vec![0x5Au8; size]), false);

        group.bench_with_input(BenchmarkId::new("encode", size), &packet, |b, p| {
            b.iter(|| p.encode(MAX_PACKET_SIZE).unwrap())
        });

        let encoded = packet.encode(MAX_PACKET_SIZE).unwrap();
        group.bench_with_input(BenchmarkId::new("decode", size), &encoded, |b, buf| {
            b.iter(|| v4::Packet::read(black_box(buf), MAX_PACKET_SIZE).unwrap())
        });
    }
    group.finish();
}

fn bench_subscribe(c: &mut Criterion) {
    let packet = v4::create_subscribe(42, &[("sensors/+/temp", QoS::AtMostOnce), ("alerts/#", QoS::AtMostOnce)]);
    let encoded = packet.encode(MAX_PACKET_SIZE).unwrap();

    c.bench_function("subscribe/encode", |b| b.iter(|| packet.encode(MAX_PACKET_SIZE).unwrap()));
    c.bench_function("subscribe/decode", |b| {
        b.iter(|| v4::Packet::read(black_box(&encoded), MAX_PACKET_SIZE).unwrap())
    });
}

fn bench_queue(c: &mut Criterion) {
    let queue = MessageQueue::new(1024);
    let message = Message::new("sensors/1/temp", "21.5");

    c.bench_function("queue/push_drain_64", |b| {
        b.iter(|| {
            for _ in 0..64 {
                queue.push(message.clone());
            }
            queue.drain()
        })
    });
}

criterion_group!(benches, bench_variable_int, bench_publish, bench_subscribe, bench_queue);
criterion_main!(benches);
