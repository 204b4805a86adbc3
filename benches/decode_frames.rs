/// Benchmarks for inbound frame decoding: envelope parsing plus the typed event view,
/// which together run once per frame on the driver task.
use criterion::{Criterion, Throughput, criterion_group, criterion_main};
use realtime_transport::ws::message::parse_frame;

const FRAMES: &[(&str, &str)] = &[
    (
        "message",
        r#"{
            "type": "message",
            "conversation_id": 7,
            "timestamp": "2024-05-01T10:20:30.123456Z",
            "data": {
                "id": 1842,
                "sender_id": 3,
                "content": "See you at the standup",
                "attachments": [{"url": "https://cdn.example.com/a.png", "size": 20480}],
                "created_at": "2024-05-01T10:20:30Z"
            }
        }"#,
    ),
    (
        "typing",
        r#"{"type":"typing","conversation_id":7,"data":{"user_id":3,"user_name":"ada","is_typing":true}}"#,
    ),
    (
        "status",
        r#"{"type":"status","data":{"user_id":3,"is_online":false}}"#,
    ),
    (
        "message_deleted",
        r#"{"type":"message_deleted","message_id":1842,"conversation_id":7,"deletion_type":"for_everyone"}"#,
    ),
    (
        "heartbeat",
        r#"{"type":"heartbeat","timestamp":"2024-05-01T10:20:30.123456"}"#,
    ),
];

fn bench_parse_frame(c: &mut Criterion) {
    let mut group = c.benchmark_group("frames/parse");

    for (name, frame) in FRAMES {
        group.throughput(Throughput::Bytes(frame.len() as u64));
        group.bench_function(*name, |b| {
            b.iter(|| parse_frame(std::hint::black_box(frame)).expect("frame should parse"));
        });
    }

    group.finish();
}

fn bench_event(c: &mut Criterion) {
    let mut group = c.benchmark_group("frames/event");

    for (name, frame) in FRAMES {
        let message = parse_frame(frame).expect("frame should parse");
        group.bench_function(*name, |b| {
            b.iter(|| {
                std::hint::black_box(&message)
                    .event()
                    .expect("event should decode")
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_parse_frame, bench_event);
criterion_main!(benches);
