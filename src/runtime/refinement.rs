//! Lexically scoped method overrides.
//!
//! `refine` builds a refinement node per (host, target) pair and marks every
//! name it defines on the target. `using` splices the refinements of a module
//! into per-target overlay chains kept on the activating scope's cref. A call
//! that resolves to a marker consults those overlays from the caller's
//! innermost scope outward; marker resolution bypasses the method cache.
use tracing::debug;

use crate::runtime::Runtime;
use crate::runtime::arena::NodeId;
use crate::runtime::cache::CacheEntry;
use crate::runtime::context::Scope;
use crate::runtime::error::{ModelError, ModelResult};
use crate::runtime::invalidator::SubscriberGraph;
use crate::runtime::method::{MethodEntry, MethodKind, Visibility};
use crate::runtime::node::NodeKind;
use crate::symbol::Symbol;

impl Runtime {
    /// Creates or reopens `host`'s refinement of `target`, activates it for
    /// `host`'s own scope and runs `block` with the refinement node.
    pub fn refine<F>(&self, host: NodeId, target: NodeId, block: F) -> ModelResult<NodeId>
    where
        F: FnOnce(&Runtime, NodeId) -> ModelResult<()>,
    {
        self.check_refine(host, target)?;
        let refinement = {
            let mut graph = self.lock_hierarchy();
            self.check_frozen(host)?;
            let refinement = self.refinement_for(&mut graph, host, target);
            self.activate_locked(host, target, refinement);
            refinement
        };
        block(self, refinement)?;
        Ok(refinement)
    }

    fn check_refine(&self, host: NodeId, target: NodeId) -> ModelResult<()> {
        match self.kind(host) {
            NodeKind::Module => {}
            NodeKind::Refinement { .. } => {
                return Err(ModelError::RefineRefinement {
                    name: self.name(host),
                });
            }
            other => {
                return Err(ModelError::WrongArgumentType {
                    found: self.type_label(other).to_string(),
                    expected: "Module".to_string(),
                });
            }
        }
        match self.kind(target) {
            NodeKind::Refinement { .. } => Err(ModelError::RefineRefinement {
                name: self.name(target),
            }),
            NodeKind::Wrapper { .. } | NodeKind::MethodLocation { .. } => {
                Err(ModelError::WrongArgumentType {
                    found: "internal node".to_string(),
                    expected: "Class or Module".to_string(),
                })
            }
            _ if target == host => Err(ModelError::InvalidArgument {
                operation: "refine".to_string(),
                message: format!("{} cannot refine itself", self.name(host)),
            }),
            _ => Ok(()),
        }
    }

    fn refinement_for(&self, graph: &mut SubscriberGraph, host: NodeId, target: NodeId) -> NodeId {
        if let Some(&existing) = self.node(host).read().refinements.get(&target) {
            return existing;
        }
        let wrapper = self.alloc_node(
            NodeKind::Wrapper {
                origin: target,
                refined_target: Some(target),
            },
            None,
        );
        let refinement = self.alloc_node(NodeKind::Refinement { target, host }, Some(wrapper));
        graph.subscribe(target, refinement);
        self.node(host).write().refinements.insert(target, refinement);
        debug!(refinement = %self.name(refinement), "created refinement");
        refinement
    }

    /// Pushes `refinement` onto `cref`'s overlay for `target`. Returns false
    /// when the overlay already carries it.
    fn activate_locked(&self, cref: NodeId, target: NodeId, refinement: NodeId) -> bool {
        let head = self.node(cref).read().activated.get(&target).copied();
        let mut cursor = head;
        while let Some(link) = cursor {
            if let NodeKind::Wrapper { origin, .. } = self.kind(link)
                && origin == refinement
            {
                return false;
            }
            cursor = self.superclass_link(link);
        }
        let wrapper = self.alloc_node(
            NodeKind::Wrapper {
                origin: refinement,
                refined_target: Some(target),
            },
            head,
        );
        self.node(cref).write().activated.insert(target, wrapper);
        true
    }

    /// Activates every refinement defined by `module` and its ancestors in
    /// scopes whose cref is `cref`. Refinements from `module` itself take
    /// precedence over inherited ones.
    pub fn using(&self, cref: NodeId, module: NodeId) -> ModelResult<()> {
        let kind = self.kind(module);
        if kind != NodeKind::Module {
            return Err(ModelError::WrongArgumentType {
                found: self.type_label(kind).to_string(),
                expected: "Module".to_string(),
            });
        }
        let _graph = self.lock_hierarchy();
        let mut activated = 0usize;
        for ancestor in self.ancestors(module).into_iter().rev() {
            let mut refinements = self
                .node(ancestor)
                .read()
                .refinements
                .iter()
                .map(|(&target, &refinement)| (target, refinement))
                .collect::<Vec<_>>();
            refinements.sort_by_key(|&(target, _)| target);
            for (target, refinement) in refinements {
                if self.activate_locked(cref, target, refinement) {
                    activated += 1;
                }
            }
        }
        debug!(cref = %self.name(cref), module = %self.name(module), activated, "using refinements");
        Ok(())
    }

    /// Refinement nodes defined by `host`, ordered by creation.
    pub fn refinements(&self, host: NodeId) -> Vec<NodeId> {
        let mut refinements = self
            .node(host)
            .read()
            .refinements
            .iter()
            .map(|(_, &refinement)| refinement)
            .collect::<Vec<_>>();
        refinements.sort();
        refinements
    }

    /// Places a marker for `name` on `target`, capturing its current entry.
    pub(crate) fn install_refined_marker(
        &self,
        graph: &mut SubscriberGraph,
        target: NodeId,
        name: &Symbol,
    ) {
        let location = self.method_location(target);
        {
            let node = self.node(location);
            let mut state = node.write();
            let original = match state.methods.get(name) {
                Some(existing) if existing.is_refined() => return,
                existing => existing.cloned(),
            };
            let marker = MethodEntry::new(
                name.clone(),
                target,
                Visibility::Public,
                false,
                MethodKind::Refined { original },
            );
            state.methods.insert(name.clone(), marker);
        }
        if !self.is_booting() {
            self.invalidate(graph, target);
        }
    }

    /// Resolves a marker hit as seen from `scope`.
    pub(crate) fn resolve_refined(&self, scope: &Scope, entry: &CacheEntry) -> MethodEntry {
        let marker = entry.method();
        let target = marker.owner();
        for scope in scope.iter() {
            let head = self.node(scope.cref()).read().activated.get(&target).copied();
            let Some(head) = head else {
                continue;
            };
            if let Some(found) = self.search_overlay(head, marker.name())
                && !found.is_refined()
            {
                return found;
            }
            break;
        }
        self.unrefined(entry.clone())
    }

    /// First entry for `name` among the overlay's refinements and the modules
    /// they include, stopping at each refinement's target.
    fn search_overlay(&self, head: NodeId, name: &Symbol) -> Option<MethodEntry> {
        let mut overlay = Some(head);
        while let Some(link) = overlay {
            let NodeKind::Wrapper {
                origin: refinement, ..
            } = self.kind(link)
            else {
                break;
            };
            let mut cursor = Some(refinement);
            while let Some(node) = cursor {
                if let NodeKind::Wrapper {
                    origin,
                    refined_target: Some(refined),
                } = self.kind(node)
                    && origin == refined
                {
                    break;
                }
                if let Some(entry) = self.table_entry(node, name) {
                    return Some(entry);
                }
                cursor = self.superclass_link(node);
            }
            overlay = self.superclass_link(link);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::runtime::context::{Frame, Scope};
    use crate::runtime::error::ModelError;
    use crate::runtime::method::{NativeMethod, Visibility};
    use crate::runtime::value::Value;
    use crate::runtime::{NodeId, Runtime};

    fn refine_returning(runtime: &Runtime, host: NodeId, target: NodeId, name: &str, value: Value) {
        let name = name.to_string();
        runtime
            .refine(host, target, move |runtime, refinement| {
                runtime
                    .define_method(
                        refinement,
                        &name,
                        NativeMethod::returning(value),
                        Visibility::Public,
                    )
                    .map(|_| ())
            })
            .expect("refine");
    }

    #[test]
    fn refinements_are_visible_only_where_used() {
        let runtime = Runtime::new();
        let r = runtime.define_class("R", None, None).expect("R");
        let b = runtime.define_module("B", None).expect("B");
        refine_returning(&runtime, b, r, "baz", Value::Int(42));
        let receiver = runtime.new_instance(r).expect("instance");

        let outside = Frame::new(Scope::top(runtime.object()));
        assert!(matches!(
            runtime.call_method(&outside, &receiver, "baz", &[]),
            Err(ModelError::NoMethod { .. })
        ));

        let user = runtime.define_module("User", None).expect("User");
        runtime.using(user, b).expect("using");
        let inside = Frame::new(Scope::top(runtime.object()).nest(user));
        assert_eq!(
            runtime.call_method(&inside, &receiver, "baz", &[]).expect("refined baz"),
            Value::Int(42)
        );

        let unrelated = runtime.define_module("Unrelated", None).expect("Unrelated");
        let elsewhere = Frame::new(Scope::top(runtime.object()).nest(unrelated));
        assert!(runtime.call_method(&elsewhere, &receiver, "baz", &[]).is_err());
    }

    #[test]
    fn refined_method_can_call_original_through_super() {
        let runtime = Runtime::new();
        let r = runtime.define_class("R", None, None).expect("R");
        runtime
            .define_method(r, "greet", NativeMethod::returning(Value::str("hello")), Visibility::Public)
            .expect("greet");
        let host = runtime.define_module("Loud", None).expect("Loud");
        runtime
            .refine(host, r, |runtime, refinement| {
                runtime.define_method(
                    refinement,
                    "greet",
                    NativeMethod::new(|invocation| {
                        let original = invocation.call_super(&[])?;
                        Ok(Value::str(format!("{}!", original.as_str().unwrap_or_default())))
                    }),
                    Visibility::Public,
                )?;
                Ok(())
            })
            .expect("refine");
        let receiver = runtime.new_instance(r).expect("instance");
        let plain = Frame::new(Scope::top(runtime.object()));
        assert_eq!(
            runtime.call_method(&plain, &receiver, "greet", &[]).expect("plain"),
            Value::str("hello")
        );
        let refined = Frame::new(Scope::top(runtime.object()).nest(host));
        assert_eq!(
            runtime.call_method(&refined, &receiver, "greet", &[]).expect("refined"),
            Value::str("hello!")
        );
        assert!(runtime.cache_entry(r, "greet").method().is_refined());
        runtime
            .define_method(r, "greet", NativeMethod::returning(Value::str("hi")), Visibility::Public)
            .expect("redefine under marker");
        assert_eq!(
            runtime.call_method(&plain, &receiver, "greet", &[]).expect("plain"),
            Value::str("hi")
        );
        assert_eq!(
            runtime.call_method(&refined, &receiver, "greet", &[]).expect("refined"),
            Value::str("hi!")
        );
    }

    #[test]
    fn profiling_counts_refined_calls() {
        let runtime = Runtime::new();
        let r = runtime.define_class("R", None, None).expect("R");
        for name in ["greet", "other"] {
            runtime
                .define_method(r, name, NativeMethod::returning(Value::str(name)), Visibility::Public)
                .expect("define");
        }
        let profile = runtime.enable_profiling(r);
        let host = runtime.define_module("Loud", None).expect("Loud");
        refine_returning(&runtime, host, r, "greet", Value::str("GREET"));
        let receiver = runtime.new_instance(r).expect("instance");
        let plain = Frame::new(Scope::top(runtime.object()));
        let refined = Frame::new(Scope::top(runtime.object()).nest(host));
        for _ in 0..3 {
            assert_eq!(
                runtime.call_method(&plain, &receiver, "greet", &[]).expect("plain"),
                Value::str("greet")
            );
            assert_eq!(
                runtime.call_method(&refined, &receiver, "greet", &[]).expect("refined"),
                Value::str("GREET")
            );
            runtime.call_method(&plain, &receiver, "other", &[]).expect("other");
        }
        assert_eq!(profile.count("greet"), 6);
        assert_eq!(profile.count("other"), 3);
    }

    #[test]
    fn using_twice_is_a_no_op() {
        let runtime = Runtime::new();
        let r = runtime.define_class("R", None, None).expect("R");
        let b = runtime.define_module("B", None).expect("B");
        refine_returning(&runtime, b, r, "baz", Value::Int(1));
        let user = runtime.define_module("User", None).expect("User");
        runtime.using(user, b).expect("first using");
        let nodes = runtime.node_count();
        runtime.using(user, b).expect("second using");
        assert_eq!(runtime.node_count(), nodes);
        assert_eq!(runtime.refinements(b).len(), 1);
    }

    #[test]
    fn later_activation_wins() {
        let runtime = Runtime::new();
        let r = runtime.define_class("R", None, None).expect("R");
        let first = runtime.define_module("First", None).expect("First");
        let second = runtime.define_module("Second", None).expect("Second");
        refine_returning(&runtime, first, r, "which", Value::str("first"));
        refine_returning(&runtime, second, r, "which", Value::str("second"));
        let user = runtime.define_module("User", None).expect("User");
        runtime.using(user, first).expect("using First");
        runtime.using(user, second).expect("using Second");
        let receiver = runtime.new_instance(r).expect("instance");
        let frame = Frame::new(Scope::top(user));
        assert_eq!(
            runtime.call_method(&frame, &receiver, "which", &[]).expect("which"),
            Value::str("second")
        );
    }

    #[test]
    fn using_walks_included_modules() {
        let runtime = Runtime::new();
        let r = runtime.define_class("R", None, None).expect("R");
        let base = runtime.define_module("Base", None).expect("Base");
        refine_returning(&runtime, base, r, "baz", Value::Int(7));
        let bundle = runtime.define_module("Bundle", None).expect("Bundle");
        runtime.include_module(bundle, base).expect("include");
        let user = runtime.define_module("User", None).expect("User");
        runtime.using(user, bundle).expect("using");
        let receiver = runtime.new_instance(r).expect("instance");
        let frame = Frame::new(Scope::top(user));
        assert_eq!(
            runtime.call_method(&frame, &receiver, "baz", &[]).expect("baz"),
            Value::Int(7)
        );
    }

    #[test]
    fn rejects_invalid_refinement_targets() {
        let runtime = Runtime::new();
        let r = runtime.define_class("R", None, None).expect("R");
        let b = runtime.define_module("B", None).expect("B");
        let refinement = runtime.refine(b, r, |_, _| Ok(())).expect("refine");
        assert!(matches!(
            runtime.refine(b, refinement, |_, _| Ok(())),
            Err(ModelError::RefineRefinement { .. })
        ));
        assert!(matches!(
            runtime.refine(b, b, |_, _| Ok(())),
            Err(ModelError::InvalidArgument { .. })
        ));
        assert!(matches!(
            runtime.refine(r, b, |_, _| Ok(())),
            Err(ModelError::WrongArgumentType { .. })
        ));
        assert_eq!(
            runtime.using(b, refinement),
            Err(ModelError::WrongArgumentType {
                found: "Refinement".to_string(),
                expected: "Module".to_string()
            })
        );
        assert_eq!(
            runtime.include_module(r, refinement),
            Err(ModelError::IncludeRefinement {
                name: "#<refinement:R@B>".to_string()
            })
        );
    }

    #[test]
    fn refinement_scoping_holds_across_threads() {
        let runtime = Arc::new(Runtime::new());
        let r = runtime.define_class("R", None, None).expect("R");
        let b = runtime.define_module("B", None).expect("B");
        refine_returning(&runtime, b, r, "baz", Value::Int(42));
        let user = runtime.define_module("User", None).expect("User");
        runtime.using(user, b).expect("using");
        let receiver = runtime.new_instance(r).expect("instance");
        std::thread::scope(|threads| {
            for refined in [true, false, true, false] {
                let runtime = Arc::clone(&runtime);
                let receiver = receiver.clone();
                threads.spawn(move || {
                    let cref = if refined { user } else { runtime.object() };
                    let frame = Frame::new(Scope::top(cref));
                    for _ in 0..200 {
                        let result = runtime.call_method(&frame, &receiver, "baz", &[]);
                        assert_eq!(result.is_ok(), refined);
                    }
                });
            }
        });
    }
}
