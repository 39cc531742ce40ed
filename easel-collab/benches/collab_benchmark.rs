use criterion::{black_box, criterion_group, criterion_main, Criterion};
use easel_collab::{decode_record, encode_record, DocAdapter, MeshHub, RelayMessage, RoomId};
use easel_store::{Record, ShapeKind, ShapeRecord};
use std::sync::Arc;

fn shape() -> Record {
    Record::Shape(ShapeRecord::new(ShapeKind::Rect, 10.0, 20.0, 100.0, 50.0))
}

fn bench_record_encode(c: &mut Criterion) {
    let record = shape();
    c.bench_function("record_encode", |b| {
        b.iter(|| {
            black_box(encode_record(black_box(&record)).unwrap());
        })
    });
}

fn bench_record_decode(c: &mut Criterion) {
    let entry = encode_record(&shape()).unwrap();
    c.bench_function("record_decode", |b| {
        b.iter(|| {
            black_box(decode_record(black_box(&entry)).unwrap());
        })
    });
}

fn bench_wire_message_roundtrip(c: &mut Criterion) {
    c.bench_function("wire_update_roundtrip_64B", |b| {
        b.iter(|| {
            let msg = RelayMessage::update(1, "bench-room", vec![0u8; 64]);
            let encoded = msg.encode().unwrap();
            black_box(RelayMessage::decode(&encoded).unwrap());
        })
    });
}

fn bench_adapter_set(c: &mut Criterion) {
    c.bench_function("adapter_set_100_records", |b| {
        b.iter(|| {
            let adapter = DocAdapter::new();
            adapter.transact_local(|w| {
                for _ in 0..100 {
                    w.set(&shape()).unwrap();
                }
            });
            black_box(adapter.len());
        })
    });
}

fn bench_adapter_sync_roundtrip(c: &mut Criterion) {
    c.bench_function("adapter_sync_roundtrip", |b| {
        b.iter(|| {
            let a = DocAdapter::with_client_id(1);
            let z = DocAdapter::with_client_id(2);
            a.transact_local(|w| {
                for _ in 0..10 {
                    w.set(&shape()).unwrap();
                }
            });
            z.apply_remote_update(&a.encode_state_as_update()).unwrap();
            black_box(z.len());
        })
    });
}

fn bench_mesh_broadcast(c: &mut Criterion) {
    use easel_collab::PeerTransport;

    c.bench_function("mesh_broadcast_100_updates_10_peers", |b| {
        b.iter(|| {
            let hub = MeshHub::new();
            let room = RoomId::generate();
            let transports: Vec<_> = (0..10).map(|_| hub.transport(&room)).collect();
            let _subs: Vec<_> = transports
                .iter()
                .map(|t| t.subscribe(Arc::new(|_| {})))
                .collect();
            for t in &transports {
                t.connect().unwrap();
            }
            for i in 0..100u64 {
                transports[0].broadcast_update(vec![i as u8; 64]);
            }
            black_box(hub.peer_count(&room));
        })
    });
}

criterion_group!(
    benches,
    bench_record_encode,
    bench_record_decode,
    bench_wire_message_roundtrip,
    bench_adapter_set,
    bench_adapter_sync_roundtrip,
    bench_mesh_broadcast,
);
criterion_main!(benches);
