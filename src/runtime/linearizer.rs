//! Mixin linearization for `include` and `prepend`.
//!
//! Both operations splice wrapper nodes into the target's superclass chain.
//! A module's own mixins travel with it, each origin appears at most once per
//! chain, and cycles are rejected before anything is mutated.
use rustc_hash::FxHashSet;
use tracing::debug;

use crate::runtime::Runtime;
use crate::runtime::arena::NodeId;
use crate::runtime::error::{ModelError, ModelResult};
use crate::runtime::invalidator::SubscriberGraph;
use crate::runtime::node::NodeKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mixin {
    Include,
    Prepend,
}

impl Runtime {
    /// Inserts `module` and the modules it already includes above `target`'s own methods.
    pub fn include_module(&self, target: NodeId, module: NodeId) -> ModelResult<()> {
        let mut graph = self.lock_hierarchy();
        self.include_locked(&mut graph, target, module)
    }

    /// Inserts `module` and its mixins below `target` so they shadow `target`'s methods.
    pub fn prepend_module(&self, target: NodeId, module: NodeId) -> ModelResult<()> {
        let mut graph = self.lock_hierarchy();
        self.prepend_locked(&mut graph, target, module)
    }

    /// Includes `module` into the singleton class of `target`.
    pub fn extend_object(&self, target: NodeId, module: NodeId) -> ModelResult<()> {
        let mut graph = self.lock_hierarchy();
        self.check_mixin(target, module)?;
        let singleton = self.singleton_class_locked(&mut graph, target);
        self.include_locked(&mut graph, singleton, module)
    }

    pub(crate) fn include_locked(
        &self,
        graph: &mut SubscriberGraph,
        target: NodeId,
        module: NodeId,
    ) -> ModelResult<()> {
        self.check_mixin(target, module)?;
        let candidates = self.gather_modules(module);
        self.check_cycles(target, &candidates, Mixin::Include)?;

        let start = self.method_location(target);
        let prepended = self.prepended_origins(target, start);
        let mut insertion_point = start;
        let mut spliced = 0usize;
        'candidates: for candidate in candidates {
            if prepended.contains(&candidate) {
                continue;
            }
            let mut superclass_seen = false;
            let mut cursor = self.superclass_link(start);
            while let Some(id) = cursor {
                let node = self.node(id);
                match node.kind {
                    NodeKind::Wrapper {
                        origin,
                        refined_target: None,
                    } => {
                        if origin == candidate {
                            if !superclass_seen {
                                insertion_point = id;
                            }
                            continue 'candidates;
                        }
                    }
                    _ => superclass_seen = true,
                }
                cursor = node.read().superclass;
            }
            insertion_point = self.splice_wrapper(graph, insertion_point, candidate, target);
            spliced += 1;
        }

        if spliced > 0 {
            debug!(
                target = target.raw(),
                module = module.raw(),
                spliced,
                "included module"
            );
            self.invalidate(graph, target);
        }
        Ok(())
    }

    pub(crate) fn prepend_locked(
        &self,
        graph: &mut SubscriberGraph,
        target: NodeId,
        module: NodeId,
    ) -> ModelResult<()> {
        self.check_mixin(target, module)?;
        let candidates = self.gather_modules(module);
        self.check_cycles(target, &candidates, Mixin::Prepend)?;

        let location = self.ensure_method_location(target);
        let mut insertion_point = target;
        let mut spliced = 0usize;
        'candidates: for candidate in candidates {
            // Already prepended, or already included below the next real superclass.
            let mut below_location = true;
            let mut cursor = self.superclass_link(target);
            while let Some(id) = cursor {
                let node = self.node(id);
                match node.kind {
                    NodeKind::MethodLocation { .. } => below_location = false,
                    NodeKind::Wrapper {
                        origin,
                        refined_target: None,
                    } => {
                        if origin == candidate {
                            if below_location {
                                insertion_point = id;
                            }
                            continue 'candidates;
                        }
                    }
                    NodeKind::Wrapper { .. } => {}
                    _ => break,
                }
                cursor = node.read().superclass;
            }
            insertion_point = self.splice_wrapper(graph, insertion_point, candidate, target);
            spliced += 1;
        }

        if spliced > 0 {
            debug!(
                target = target.raw(),
                module = module.raw(),
                spliced,
                "prepended module"
            );
            self.invalidate(graph, target);
        }
        Ok(())
    }

    /// Origins of the wrappers between `target` and its method location.
    fn prepended_origins(&self, target: NodeId, location: NodeId) -> FxHashSet<NodeId> {
        let mut origins = FxHashSet::default();
        let mut cursor = self.superclass_link(target);
        while let Some(id) = cursor
            && id != location
        {
            if let NodeKind::Wrapper { origin, .. } = self.kind(id) {
                origins.insert(origin);
            }
            cursor = self.superclass_link(id);
        }
        origins
    }

    fn check_mixin(&self, target: NodeId, module: NodeId) -> ModelResult<()> {
        match self.kind(module) {
            NodeKind::Module => {}
            NodeKind::Refinement { .. } => {
                return Err(ModelError::IncludeRefinement {
                    name: self.name(module),
                });
            }
            other => {
                return Err(ModelError::WrongArgumentType {
                    found: self.type_label(other).to_string(),
                    expected: "Module".to_string(),
                });
            }
        }
        self.check_frozen(target)
    }

    fn check_cycles(&self, target: NodeId, candidates: &[NodeId], mixin: Mixin) -> ModelResult<()> {
        let target_origin = self.kind(target).delegate(target);
        if let Some(&candidate) = candidates.iter().find(|&&id| id == target_origin) {
            let module = self.name(candidate);
            let target = self.name(target);
            return Err(match mixin {
                Mixin::Include => ModelError::CyclicInclude { module, target },
                Mixin::Prepend => ModelError::CyclicPrepend { module, target },
            });
        }
        Ok(())
    }

    /// `module` plus every module in its own chain that still owns its methods,
    /// in chain order. Nodes whose methods moved to a prepend location are skipped.
    fn gather_modules(&self, module: NodeId) -> Vec<NodeId> {
        let mut modules = Vec::new();
        let mut cursor = Some(module);
        while let Some(id) = cursor {
            let node = self.node(id);
            let state = node.read();
            if state.method_location == id {
                modules.push(node.kind.delegate(id));
            }
            cursor = state.superclass;
        }
        modules
    }

    /// Places a fresh wrapper for `origin` directly above `insert_above`.
    fn splice_wrapper(
        &self,
        graph: &mut SubscriberGraph,
        insert_above: NodeId,
        origin: NodeId,
        subscriber: NodeId,
    ) -> NodeId {
        let above = self.node(insert_above);
        let superclass = above.read().superclass;
        let wrapper = self.alloc_node(
            NodeKind::Wrapper {
                origin,
                refined_target: None,
            },
            superclass,
        );
        above.write().superclass = Some(wrapper);
        graph.subscribe(origin, subscriber);
        wrapper
    }

    /// Moves `target`'s methods to a dedicated node on first prepend.
    fn ensure_method_location(&self, target: NodeId) -> NodeId {
        let node = self.node(target);
        let (location, superclass, methods) = {
            let state = node.read();
            if state.method_location != target {
                return state.method_location;
            }
            let methods = state
                .methods
                .iter()
                .map(|(name, entry)| (name.clone(), entry.clone()))
                .collect::<Vec<_>>();
            (state.method_location, state.superclass, methods)
        };
        debug_assert_eq!(location, target);

        let location = self.alloc_node(NodeKind::MethodLocation { owner: target }, superclass);
        {
            let location_node = self.node(location);
            let mut location_state = location_node.write();
            for (name, entry) in methods {
                location_state.methods.insert(name, entry);
            }
        }
        let mut state = node.write();
        state.superclass = Some(location);
        state.method_location = location;
        state.methods.take();
        debug!(target = target.raw(), location = location.raw(), "created method location");
        location
    }

    /// Snapshot of the superclass links starting at `start`, inclusive.
    pub(crate) fn chain(&self, start: NodeId) -> Vec<NodeId> {
        let mut chain = Vec::new();
        let mut cursor = Some(start);
        while let Some(id) = cursor {
            chain.push(id);
            cursor = self.superclass_link(id);
        }
        chain
    }

    /// Whether `id` is where its methods live (wrappers read their origin's table).
    pub(crate) fn holds_table(&self, id: NodeId) -> bool {
        let node = self.node(id);
        match node.kind {
            NodeKind::Wrapper { .. } | NodeKind::MethodLocation { .. } => true,
            _ => node.read().method_location == id,
        }
    }

    /// Linearized ancestors, `id` first. Wrappers appear as their origin.
    pub fn ancestors(&self, id: NodeId) -> Vec<NodeId> {
        self.chain(id)
            .into_iter()
            .filter(|&link| self.holds_table(link))
            .map(|link| self.kind(link).delegate(link))
            .collect()
    }

    /// Modules in `id`'s ancestry, included or prepended.
    pub fn included_modules(&self, id: NodeId) -> Vec<NodeId> {
        let mut seen = FxHashSet::default();
        self.chain(id)
            .into_iter()
            .filter_map(|link| match self.kind(link) {
                NodeKind::Wrapper {
                    origin,
                    refined_target: None,
                } => Some(origin),
                _ => None,
            })
            .filter(|origin| seen.insert(*origin))
            .collect()
    }

    /// Whether `module` has been mixed into `id`'s ancestry.
    pub fn includes_module(&self, id: NodeId, module: NodeId) -> bool {
        module != id && self.included_modules(id).contains(&module)
    }

    pub fn has_prepends(&self, id: NodeId) -> bool {
        self.method_location(id) != id
    }

    /// The nearest real superclass, skipping mixins and method locations.
    pub fn superclass(&self, id: NodeId) -> Option<NodeId> {
        if self.kind(id).is_module() {
            return None;
        }
        self.chain(id)
            .into_iter()
            .skip(1)
            .find(|&link| !self.kind(link).needs_implementer())
    }

    /// Module ordering: `Some(true)` if `a` descends from or equals `b`,
    /// `Some(false)` if `b` descends from `a`, `None` if unrelated.
    pub fn module_le(&self, a: NodeId, b: NodeId) -> Option<bool> {
        if a == b || self.ancestors(a).contains(&b) {
            Some(true)
        } else if self.ancestors(b).contains(&a) {
            Some(false)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::runtime::Runtime;
    use crate::runtime::error::{ErrorKind, ModelError};

    fn names(runtime: &Runtime, ids: &[crate::runtime::NodeId]) -> Vec<String> {
        ids.iter().map(|&id| runtime.name(id)).collect()
    }

    #[test]
    fn include_inserts_above_own_methods() {
        let runtime = Runtime::new();
        let m = runtime.define_module("M", None).expect("module M");
        let a = runtime.define_class("A", None, None).expect("class A");
        runtime.include_module(a, m).expect("include M");
        assert_eq!(
            names(&runtime, &runtime.ancestors(a)),
            vec!["A", "M", "Object", "Kernel", "BasicObject"]
        );
    }

    #[test]
    fn include_is_idempotent() {
        let runtime = Runtime::new();
        let m = runtime.define_module("M", None).expect("module M");
        let a = runtime.define_class("A", None, None).expect("class A");
        runtime.include_module(a, m).expect("first include");
        let nodes = runtime.node_count();
        let generation = runtime.generation(a);
        runtime.include_module(a, m).expect("second include");
        assert_eq!(runtime.node_count(), nodes);
        assert_eq!(runtime.generation(a), generation);
    }

    #[test]
    fn nested_mixins_travel_with_module() {
        let runtime = Runtime::new();
        let inner = runtime.define_module("Inner", None).expect("Inner");
        let outer = runtime.define_module("Outer", None).expect("Outer");
        runtime.include_module(outer, inner).expect("include Inner");
        let a = runtime.define_class("A", None, None).expect("A");
        runtime.include_module(a, outer).expect("include Outer");
        assert_eq!(
            names(&runtime, &runtime.ancestors(a))[..3],
            ["A", "Outer", "Inner"]
        );
        assert!(runtime.includes_module(a, inner));
    }

    #[test]
    fn already_included_by_superclass_is_skipped() {
        let runtime = Runtime::new();
        let m = runtime.define_module("M", None).expect("M");
        let base = runtime.define_class("Base", None, None).expect("Base");
        runtime.include_module(base, m).expect("include into Base");
        let child = runtime.define_class("Child", Some(base), None).expect("Child");
        runtime.include_module(child, m).expect("include into Child");
        assert_eq!(
            names(&runtime, &runtime.ancestors(child))[..3],
            ["Child", "Base", "M"]
        );
    }

    #[test]
    fn cyclic_include_is_rejected_without_mutation() {
        let runtime = Runtime::new();
        let a = runtime.define_module("A", None).expect("A");
        let b = runtime.define_module("B", None).expect("B");
        runtime.include_module(b, a).expect("B includes A");
        let before = runtime.ancestors(a);
        let nodes = runtime.node_count();
        let error = runtime.include_module(a, b).expect_err("cycle");
        assert_eq!(error.kind(), ErrorKind::Structural);
        assert!(matches!(error, ModelError::CyclicInclude { .. }));
        assert_eq!(runtime.ancestors(a), before);
        assert_eq!(runtime.node_count(), nodes);
        assert!(matches!(
            runtime.include_module(a, a),
            Err(ModelError::CyclicInclude { .. })
        ));
    }

    #[test]
    fn rejects_classes_as_mixins() {
        let runtime = Runtime::new();
        let a = runtime.define_class("A", None, None).expect("A");
        let b = runtime.define_class("B", None, None).expect("B");
        assert_eq!(
            runtime.include_module(a, b).expect_err("class mixin"),
            ModelError::WrongArgumentType {
                found: "Class".to_string(),
                expected: "Module".to_string(),
            }
        );
    }

    #[test]
    fn prepend_places_module_before_target() {
        let runtime = Runtime::new();
        let p = runtime.define_module("P", None).expect("P");
        let m = runtime.define_module("M", None).expect("M");
        let a = runtime.define_class("A", None, None).expect("A");
        runtime.include_module(a, m).expect("include");
        runtime.prepend_module(a, p).expect("prepend");
        assert!(runtime.has_prepends(a));
        assert_eq!(
            names(&runtime, &runtime.ancestors(a))[..4],
            ["P", "A", "M", "Object"]
        );
        assert_eq!(runtime.superclass(a), Some(runtime.object()));
        runtime.prepend_module(a, p).expect("prepend again");
        assert_eq!(runtime.ancestors(a).len(), 6);
    }

    #[test]
    fn prepending_an_included_module_keeps_it_once() {
        let runtime = Runtime::new();
        let m = runtime.define_module("M", None).expect("M");
        let c = runtime.define_class("C", None, None).expect("C");
        runtime.include_module(c, m).expect("include");
        runtime.prepend_module(c, m).expect("prepend");
        assert_eq!(
            names(&runtime, &runtime.ancestors(c)),
            vec!["C", "M", "Object", "Kernel", "BasicObject"]
        );

        let d = runtime.define_class("D", None, None).expect("D");
        runtime.prepend_module(d, m).expect("prepend");
        runtime.include_module(d, m).expect("include");
        assert_eq!(
            names(&runtime, &runtime.ancestors(d)),
            vec!["M", "D", "Object", "Kernel", "BasicObject"]
        );
    }

    #[test]
    fn prepend_ignores_mixins_of_the_superclass() {
        let runtime = Runtime::new();
        let m = runtime.define_module("M", None).expect("M");
        let base = runtime.define_class("Base", None, None).expect("Base");
        runtime.include_module(base, m).expect("include into Base");
        let child = runtime.define_class("Child", Some(base), None).expect("Child");
        runtime.prepend_module(child, m).expect("prepend into Child");
        assert_eq!(
            names(&runtime, &runtime.ancestors(child))[..4],
            ["M", "Child", "Base", "M"]
        );
    }

    #[test]
    fn including_a_prepended_module_keeps_order() {
        let runtime = Runtime::new();
        let p = runtime.define_module("P", None).expect("P");
        let m = runtime.define_module("M", None).expect("M");
        runtime.prepend_module(m, p).expect("prepend P into M");
        let a = runtime.define_class("A", None, None).expect("A");
        runtime.include_module(a, m).expect("include M");
        assert_eq!(names(&runtime, &runtime.ancestors(a))[..3], ["A", "P", "M"]);
    }

    #[test]
    fn extend_includes_into_singleton() {
        let runtime = Runtime::new();
        let m = runtime.define_module("M", None).expect("M");
        let a = runtime.define_class("A", None, None).expect("A");
        runtime.extend_object(a, m).expect("extend");
        let singleton = runtime.singleton_class(a);
        assert!(runtime.includes_module(singleton, m));
        assert!(!runtime.includes_module(a, m));
    }

    #[test]
    fn compares_modules_by_ancestry() {
        let runtime = Runtime::new();
        let m = runtime.define_module("M", None).expect("M");
        let a = runtime.define_class("A", None, None).expect("A");
        let other = runtime.define_class("Other", None, None).expect("Other");
        runtime.include_module(a, m).expect("include");
        assert_eq!(runtime.module_le(a, m), Some(true));
        assert_eq!(runtime.module_le(m, a), Some(false));
        assert_eq!(runtime.module_le(a, other), None);
    }
}
