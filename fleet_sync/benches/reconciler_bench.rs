use std::hint::black_box;

use criterion::Criterion;
use criterion::criterion_group;
use criterion::criterion_main;
use fleet_sync::Reconciler;
use fleet_types::EntitySnapshot;
use fleet_types::Topic;
use serde_json::json;

fn vehicle(id: usize, version: u64) -> EntitySnapshot {
    EntitySnapshot::from_value(json!({"id": format!("v{id}"), "version": version, "status": "in_service", "lat": 40.41, "lng": -3.70})).unwrap()
}

fn bench_apply_updates(c: &mut Criterion) {
    let topic = Topic::fleet_vehicles(42);
    let updates: Vec<EntitySnapshot> = (0..1000).map(|i| vehicle(i % 200, (i / 200) as u64 + 1)).collect();

    c.bench_function("reconciler_apply_updates", |b| {
        b.iter(|| {
            let mut reconciler = Reconciler::new();
            for update in &updates {
                black_box(reconciler.apply_update(&topic, update.clone()));
            }
            black_box(reconciler)
        })
    });
}

fn bench_stale_updates(c: &mut Criterion) {
    let topic = Topic::fleet_vehicles(42);
    let mut reconciler = Reconciler::new();
    reconciler.apply_snapshot(&topic, (0..200).map(|i| vehicle(i, 100)).collect());
    let stale: Vec<EntitySnapshot> = (0..200).map(|i| vehicle(i, 50)).collect();

    c.bench_function("reconciler_discard_stale", |b| {
        b.iter(|| {
            for update in &stale {
                black_box(reconciler.apply_update(&topic, update.clone()));
            }
        })
    });
}

fn bench_snapshot_repair(c: &mut Criterion) {
    let topic = Topic::fleet_vehicles(42);
    let snapshot: Vec<EntitySnapshot> = (0..500).map(|i| vehicle(i, 2)).collect();

    c.bench_function("reconciler_snapshot_500", |b| {
        b.iter(|| {
            let mut reconciler = Reconciler::new();
            reconciler.apply_snapshot(&topic, (0..500).map(|i| vehicle(i, 1)).collect());
            reconciler.apply_snapshot(&topic, black_box(snapshot.clone()));
            black_box(reconciler.snapshot(&topic))
        })
    });
}

criterion_group!(benches, bench_apply_updates, bench_stale_updates, bench_snapshot_repair);
criterion_main!(benches);
