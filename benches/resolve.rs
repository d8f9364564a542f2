use std::sync::Arc;

use criterion::{criterion_group, criterion_main, BatchSize, Criterion, Throughput};
use serde_json::json;

use profile_unify::{
    translate, CallContext, ChildProfile, EnrichmentRule, Event, InMemoryStores, Profile,
    ProfileService, ProfileStore, PropertyTypes, UnifyConfig, ValueKind,
};

/// Service seeded with 256 groups of one parent and three children.
fn make_service_with_data() -> ProfileService {
    let stores = InMemoryStores::default();
    stores
        .schema
        .add_rule(EnrichmentRule::new("traits.age", ValueKind::Int))
        .unwrap();

    for g in 0..256u32 {
        let parent = format!("parent-{g}");
        stores
            .profiles
            .put_profile(Profile::skeleton(&parent).with_trait("age", json!(g % 90)))
            .unwrap();
        for c in 0..3 {
            let child = format!("child-{g}-{c}");
            stores.profiles.put_profile(Profile::skeleton(&child)).unwrap();
            stores
                .profiles
                .attach_child_profile(&parent, ChildProfile::new(&child, "bench"))
                .unwrap();
        }
    }

    ProfileService::new(
        Arc::new(stores.profiles),
        Arc::new(stores.events),
        Arc::new(stores.schema),
        Arc::new(stores.locks),
        &UnifyConfig::default(),
    )
}

fn bench_create_or_update(c: &mut Criterion) {
    let service = make_service_with_data();
    let ctx = CallContext::background();

    let mut group = c.benchmark_group("resolve");
    group.throughput(Throughput::Elements(1));
    group.bench_function("create_or_update_existing", |b| {
        let event = Event::new("parent-7", "track");
        b.iter(|| service.create_or_update_profile(&event, &ctx).unwrap());
    });
    group.bench_function("create_or_update_fresh", |b| {
        let mut n = 0u64;
        b.iter_batched(
            || {
                n += 1;
                Event::new(format!("fresh-{n}"), "identify")
            },
            |event| service.create_or_update_profile(&event, &ctx).unwrap(),
            BatchSize::SmallInput,
        );
    });
    group.finish();
}

fn bench_merged_reads(c: &mut Criterion) {
    let service = make_service_with_data();

    let mut group = c.benchmark_group("merge");
    group.bench_function("get_child_profile", |b| {
        b.iter(|| service.get_profile("child-100-2").unwrap());
    });
    group.throughput(Throughput::Elements(1024));
    group.bench_function("get_all_profiles_with_filter", |b| {
        b.iter(|| service.get_all_profiles_with_filter(&["traits.age gt 45"]).unwrap());
    });
    group.finish();
}

fn bench_translate(c: &mut Criterion) {
    let types = PropertyTypes::new()
        .with("traits.age", ValueKind::Int)
        .with("traits.score", ValueKind::Float)
        .with("traits.vip", ValueKind::Boolean);
    let filters = ["traits.age gt 30", "traits.score le 4.5", "traits.vip eq true", "city eq New York"];

    c.bench_function("filter/translate", |b| {
        b.iter(|| translate(&filters, &types));
    });
}

criterion_group!(benches, bench_create_or_update, bench_merged_reads, bench_translate);
criterion_main!(benches);
