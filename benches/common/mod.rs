#![allow(dead_code)]
use std::fs;

use modgraph::Scenario;
use modgraph::runtime::{NativeMethod, NodeId, Runtime, Value, Visibility};

pub const WORKLOADS: [(&str, &str); 3] = [
    ("mixins", "tests/cases/include_fallback/scenario.yaml"),
    ("refinements", "tests/cases/refinement_scoping/scenario.yaml"),
    ("dispatch", "tests/cases/dispatch/scenario.yaml"),
];

pub fn load_source(path: &str) -> String {
    fs::read_to_string(path).unwrap_or_else(|err| panic!("read {path}: {err}"))
}

pub fn load_scenario(path: &str) -> Scenario {
    let source = load_source(path);
    Scenario::from_yaml_str(&source).unwrap_or_else(|err| panic!("parse {path}: {err}"))
}

/// A class below `depth` included modules, with `name` defined only in the
/// outermost one so lookups walk the whole chain.
pub fn deep_hierarchy(depth: usize, name: &str) -> (Runtime, NodeId) {
    let runtime = Runtime::new();
    let class = runtime
        .define_class("Leaf", None, None)
        .unwrap_or_else(|err| panic!("define Leaf: {err}"));
    for index in 0..depth {
        let module = runtime
            .define_module(&format!("Mixin{index}"), None)
            .unwrap_or_else(|err| panic!("define Mixin{index}: {err}"));
        if index == 0 {
            runtime
                .define_method(module, name, NativeMethod::returning(Value::Int(1)), Visibility::Public)
                .unwrap_or_else(|err| panic!("define {name}: {err}"));
        }
        runtime
            .include_module(class, module)
            .unwrap_or_else(|err| panic!("include Mixin{index}: {err}"));
    }
    (runtime, class)
}
