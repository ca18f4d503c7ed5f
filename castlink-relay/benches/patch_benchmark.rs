use castlink_relay::patch;
use castlink_relay::protocol;
use criterion::{criterion_group, criterion_main, Criterion};
use serde_json::{json, Value};
use std::hint::black_box;

/// An admin view with `emitters` paired emitters and a few files each.
fn admin_view(emitters: usize, recording: bool) -> Value {
    let mut list = serde_json::Map::new();
    let mut files = serde_json::Map::new();
    for i in 0..emitters {
        list.insert(
            format!("emitter-{i:04}"),
            json!({
                "emitterShortId": format!("e{i:09}"),
                "emitterIP": "10.0.0.1",
                "emitterInfo": {
                    "streamInfo": {"hasAudio": true, "hasVideo": true},
                    "roundTripTime": 0.042,
                    "battery": {"level": 0.8, "charging": false},
                },
                "receiverIP": "10.0.0.2",
                "receiverInfo": {"obsActive": true, "recording": recording},
                "pairing": "active",
            }),
        );
        for f in 0..4 {
            files.insert(
                format!("e{i:09}/clip-{f}.webm"),
                json!({"size": 1_048_576 * f, "open": recording && f == 3}),
            );
        }
    }
    json!({"mode": "admin", "emitters": list, "files": files})
}

fn bench_diff_identical(c: &mut Criterion) {
    let view = admin_view(50, false);
    let copy = view.clone();

    c.bench_function("diff_identical_50_emitters", |b| {
        b.iter(|| black_box(patch::diff(black_box(&view), black_box(&copy))))
    });
}

fn bench_diff_one_field(c: &mut Criterion) {
    let before = admin_view(50, false);
    let mut after = before.clone();
    after["emitters"]["emitter-0025"]["receiverInfo"]["recording"] = json!(true);

    c.bench_function("diff_one_field_50_emitters", |b| {
        b.iter(|| black_box(patch::diff(black_box(&before), black_box(&after))))
    });
}

fn bench_diff_many_fields(c: &mut Criterion) {
    let before = admin_view(50, false);
    let after = admin_view(50, true);

    c.bench_function("diff_many_fields_50_emitters", |b| {
        b.iter(|| black_box(patch::diff(black_box(&before), black_box(&after))))
    });
}

fn bench_diff_from_null(c: &mut Criterion) {
    let view = admin_view(50, true);

    c.bench_function("diff_initial_state_50_emitters", |b| {
        b.iter(|| black_box(patch::diff(black_box(&Value::Null), black_box(&view))))
    });
}

fn bench_apply(c: &mut Criterion) {
    let before = admin_view(50, false);
    let after = admin_view(50, true);
    let ops = patch::diff(&before, &after);

    c.bench_function("apply_many_fields_50_emitters", |b| {
        b.iter(|| {
            let mut doc = before.clone();
            patch::apply(&mut doc, black_box(&ops)).unwrap();
            black_box(doc)
        })
    });
}

fn bench_encode_patch_frame(c: &mut Criterion) {
    let before = admin_view(50, false);
    let after = admin_view(50, true);
    let ops = patch::diff(&before, &after);

    c.bench_function("encode_patch_frame_50_emitters", |b| {
        b.iter(|| {
            let params = serde_json::to_value(black_box(&ops)).unwrap();
            black_box(protocol::encode_request(protocol::STATE_PATCH_METHOD, params, None).unwrap())
        })
    });
}

fn bench_decode_frame(c: &mut Criterion) {
    let frame = r#"{"jsonrpc":"2.0","method":"iceCandidate","params":{"candidate":"candidate:1 1 udp 2122260223 10.0.0.1 50000 typ host","sdpMid":"0"},"id":42}"#;

    c.bench_function("decode_request_frame", |b| {
        b.iter(|| black_box(protocol::decode(black_box(frame)).unwrap()))
    });
}

criterion_group!(
    benches,
    bench_diff_identical,
    bench_diff_one_field,
    bench_diff_many_fields,
    bench_diff_from_null,
    bench_apply,
    bench_encode_patch_frame,
    bench_decode_frame,
);

criterion_main!(benches);
