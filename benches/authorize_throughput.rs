//! Authorize hot-path benchmark.
//!
//! Measures single-threaded authorize latency for finite and unlimited
//! limits, and contended throughput on one (entity, dimension) series.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use quota_engine::engine::QuotaEngine;
use quota_engine::quota::{QuotaUpdate, ResourceDimension};
use quota_engine::types::{ActorId, EngineConfig, EntityId};
use std::sync::Arc;

fn engine() -> QuotaEngine {
    let admin = ActorId::must("bench");
    let engine = QuotaEngine::new(EngineConfig::default());
    let unlimited = QuotaUpdate::uniform(-1);
    engine
        .create_organization(&admin, &EntityId::must("org"), &unlimited)
        .unwrap();
    engine
        .create_department(&admin, &EntityId::must("dept"), &EntityId::must("org"))
        .unwrap();
    engine
        .set_department_quota(&admin, &EntityId::must("dept"), &unlimited)
        .unwrap();
    engine
        .create_member(&admin, &EntityId::must("member"), &EntityId::must("dept"))
        .unwrap();
    engine
        .set_member_quota(
            &admin,
            &EntityId::must("member"),
            &QuotaUpdate::uniform(-1).with(ResourceDimension::ApiCalls, i64::MAX),
        )
        .unwrap();
    engine
}

fn bench_authorize(c: &mut Criterion) {
    let engine = engine();
    let member = EntityId::must("member");

    let mut group = c.benchmark_group("authorize");
    for dimension in [ResourceDimension::ApiCalls, ResourceDimension::Storage] {
        group.bench_with_input(
            BenchmarkId::from_parameter(dimension),
            &dimension,
            |b, dim| {
                b.iter(|| engine.authorize(black_box(&member), *dim, 1).unwrap());
            },
        );
    }
    group.finish();
}

fn bench_contended(c: &mut Criterion) {
    let engine = Arc::new(engine());
    let threads = 4;

    c.bench_function("authorize_contended_4_threads", |b| {
        b.iter(|| {
            std::thread::scope(|scope| {
                for _ in 0..threads {
                    let engine = engine.clone();
                    scope.spawn(move || {
                        let member = EntityId::must("member");
                        for _ in 0..256 {
                            black_box(
                                engine
                                    .authorize(&member, ResourceDimension::ApiCalls, 1)
                                    .unwrap(),
                            );
                        }
                    });
                }
            });
        });
    });
}

criterion_group!(benches, bench_authorize, bench_contended);
criterion_main!(benches);
