mod common;

use criterion::{Criterion, black_box, criterion_group, criterion_main};
use modgraph::runtime::{Frame, NativeMethod, Scope, Value, Visibility};

fn bench_resolution(c: &mut Criterion) {
    let (runtime, class) = common::deep_hierarchy(32, "target");

    c.bench_function("resolve_cached", |b| {
        runtime.search_method(class, "target");
        b.iter(|| {
            let entry = runtime.search_method(black_box(class), black_box("target"));
            black_box(entry);
        })
    });

    c.bench_function("resolve_after_invalidation", |b| {
        let module = runtime.define_module("Churn", None).expect("Churn");
        runtime.include_module(class, module).expect("include Churn");
        let mut version = 0;
        b.iter(|| {
            version += 1;
            runtime
                .define_method(
                    module,
                    "churn",
                    NativeMethod::returning(Value::Int(version)),
                    Visibility::Public,
                )
                .expect("redefine");
            let entry = runtime.search_method(black_box(class), black_box("target"));
            black_box(entry);
        })
    });

    c.bench_function("call_method", |b| {
        let frame = Frame::new(Scope::top(runtime.object()));
        let receiver = runtime.new_instance(class).expect("instance");
        b.iter(|| {
            let value = runtime
                .call_method(&frame, black_box(&receiver), "target", &[])
                .expect("call");
            black_box(value);
        })
    });
}

criterion_group!(benches, bench_resolution);
criterion_main!(benches);
