use criterion::{black_box, criterion_group, criterion_main, Criterion};
use hypermerge::crdt::{Clock, Document};
use hypermerge::keys::{ActorId, Keypair};
use hypermerge::protocol::WireMessage;

fn actor(n: u8) -> ActorId {
    ActorId::from_bytes([n; 32])
}

fn bench_change_encode(c: &mut Criterion) {
    let mut doc = Document::new(actor(1));
    let change = doc.change(Some("bench"), |t| {
        t.set("x0y0", "w");
        t.set("x0y1", "w");
    });

    c.bench_function("change_encode_json", |b| {
        b.iter(|| black_box(black_box(&change).encode().unwrap()))
    });
}

fn bench_change_decode(c: &mut Criterion) {
    let mut doc = Document::new(actor(1));
    let change = doc.change(None, |t| t.set("k", "v"));
    let bytes = change.encode().unwrap();

    c.bench_function("change_decode_json", |b| {
        b.iter(|| black_box(hypermerge::Change::decode(black_box(&bytes)).unwrap()))
    });
}

fn bench_apply_changes(c: &mut Criterion) {
    // One writer authoring 1000 single-field changes
    let mut source = Document::new(actor(1));
    for i in 0..1000u32 {
        source.change(None, |t| t.set(format!("k{}", i % 16), i));
    }
    let changes = source.changes_since(&Clock::new());

    c.bench_function("apply_1000_changes", |b| {
        b.iter(|| {
            let mut doc = Document::new(actor(2));
            doc.apply_changes(black_box(changes.iter().cloned()));
            black_box(doc)
        })
    });
}

fn bench_concurrent_merge(c: &mut Criterion) {
    // Two writers, 100 changes each, folded into a third replica
    let mut a = Document::new(actor(1));
    let mut b = Document::new(actor(2));
    for i in 0..100u32 {
        a.change(None, |t| t.set(format!("a{i}"), i));
        b.change(None, |t| t.set(format!("b{i}"), i));
    }
    let from_a = a.changes_since(&Clock::new());
    let from_b = b.changes_since(&Clock::new());

    c.bench_function("merge_two_writers_100_each", |b2| {
        b2.iter(|| {
            let mut doc = Document::new(actor(3));
            doc.apply_changes(black_box(from_b.iter().cloned()));
            doc.apply_changes(black_box(from_a.iter().cloned()));
            black_box(doc.state())
        })
    });
}

fn bench_wire_roundtrip(c: &mut Criterion) {
    let dk = Keypair::generate().actor_id().discovery_key();
    let frame = WireMessage::Data {
        discovery_key: dk,
        index: 7,
        block: vec![0u8; 256],
    };

    c.bench_function("wire_frame_roundtrip_256B", |b| {
        b.iter(|| {
            let bytes = black_box(&frame).encode().unwrap();
            black_box(WireMessage::decode(&bytes).unwrap())
        })
    });
}

criterion_group!(
    benches,
    bench_change_encode,
    bench_change_decode,
    bench_apply_changes,
    bench_concurrent_merge,
    bench_wire_roundtrip
);
criterion_main!(benches);
