//! Allocation, barrier and collection benchmarks.
//!
//! Run with: cargo bench -p kiln_benches

use std::hint::black_box;

use criterion::{criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion, Throughput};
use kiln::{Context, GcType, HandleScope, OptionsBuilder, SpaceType, TaggedValue};

fn bench_context() -> Context {
    Context::new(
        OptionsBuilder::new()
            .heap_size(256 * 1024 * 1024)
            .build(),
    )
}

fn bench_allocation(c: &mut Criterion) {
    let mut group = c.benchmark_group("allocation");
    group.throughput(Throughput::Elements(1000));

    for space in [SpaceType::Young, SpaceType::Old] {
        group.bench_with_input(BenchmarkId::new("objects", space.name()), &space, |b, &space| {
            let mut cx = bench_context();
            b.iter(|| {
                let mut scope = HandleScope::new(&mut cx);
                for _ in 0..1000 {
                    black_box(scope.alloc_object(4, space).unwrap());
                }
            });
        });
    }

    group.bench_function("strings", |b| {
        let mut cx = bench_context();
        b.iter(|| {
            let mut scope = HandleScope::new(&mut cx);
            for _ in 0..1000 {
                black_box(scope.alloc_string("benchmark string").unwrap());
            }
        });
    });

    group.finish();
}

fn bench_write_barrier(c: &mut Criterion) {
    let mut group = c.benchmark_group("write_barrier");

    group.bench_function("old_to_young", |b| {
        let mut cx = bench_context();
        let mut scope = HandleScope::new(&mut cx);
        let holder = scope.alloc_object(1, SpaceType::Old).unwrap();
        let target = scope.alloc_object(1, SpaceType::Young).unwrap();
        let value = target.value(&scope);

        b.iter(|| scope.set_field(holder, 0, black_box(value)));
    });

    group.bench_function("primitive", |b| {
        let mut cx = bench_context();
        let mut scope = HandleScope::new(&mut cx);
        let holder = scope.alloc_object(1, SpaceType::Old).unwrap();

        b.iter(|| scope.set_field(holder, 0, black_box(TaggedValue::from_i32(7))));
    });

    group.finish();
}

fn bench_collection(c: &mut Criterion) {
    let mut group = c.benchmark_group("collection");
    group.sample_size(20);

    for (name, gc_type) in [
        ("young", GcType::Young),
        ("partial", GcType::Partial),
        ("full", GcType::Full),
    ] {
        group.bench_function(name, |b| {
            b.iter_batched(
                || {
                    let mut cx = bench_context();
                    {
                        let mut scope = HandleScope::new(&mut cx);
                        for i in 0..10_000 {
                            let space = if i % 2 == 0 { SpaceType::Young } else { SpaceType::Old };
                            scope.alloc_object(4, space).unwrap();
                        }
                    }
                    cx
                },
                |mut cx| {
                    cx.collect_garbage(gc_type).unwrap();
                    cx
                },
                BatchSize::LargeInput,
            );
        });
    }

    group.finish();
}

criterion_group!(benches, bench_allocation, bench_write_barrier, bench_collection);
criterion_main!(benches);
