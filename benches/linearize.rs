mod common;

use criterion::{Criterion, black_box, criterion_group, criterion_main};
use modgraph::runtime::Runtime;

fn bench_linearize(c: &mut Criterion) {
    c.bench_function("include_64_modules", |b| {
        b.iter(|| {
            let (runtime, class) = common::deep_hierarchy(black_box(64), "target");
            black_box(runtime.ancestors(class));
        })
    });

    c.bench_function("prepend_and_include_nested", |b| {
        b.iter(|| {
            let runtime = Runtime::new();
            let class = runtime.define_class("Host", None, None).expect("Host");
            let mut previous = None;
            for index in 0..16 {
                let module = runtime
                    .define_module(&format!("Layer{index}"), None)
                    .expect("layer");
                if let Some(inner) = previous {
                    runtime.include_module(module, inner).expect("nest");
                }
                if index % 2 == 0 {
                    runtime.prepend_module(class, module).expect("prepend");
                } else {
                    runtime.include_module(class, module).expect("include");
                }
                previous = Some(module);
            }
            black_box(runtime.ancestors(class));
        })
    });
}

criterion_group!(benches, bench_linearize);
criterion_main!(benches);
