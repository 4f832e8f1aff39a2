use std::sync::Arc;

use tracing::{debug, warn};

use crate::runtime::Runtime;
use crate::runtime::arena::NodeId;
use crate::runtime::cache::{
    CacheEntryFactory, CallProfile, ProfilingCacheEntryFactory, SynchronizedCacheEntryFactory,
};
use crate::runtime::error::{ModelError, ModelResult};
use crate::runtime::identifier;
use crate::runtime::invalidator::SubscriberGraph;
use crate::runtime::method::{MethodBody, MethodEntry, MethodKind, NativeMethod, Visibility};
use crate::runtime::node::NodeKind;
use crate::runtime::resolve::Markers;
use crate::runtime::value::Value;
use crate::symbol::Symbol;

/// Methods whose redefinition or removal breaks basic object behavior.
const PROTECTED_NAMES: [&str; 4] = ["__id__", "__send__", "object_id", "initialize"];

/// Methods that are always private regardless of the requested visibility.
const ALWAYS_PRIVATE: [&str; 3] = ["initialize", "initialize_copy", "respond_to_missing?"];

impl Runtime {
    pub fn define_method(
        &self,
        id: NodeId,
        name: &str,
        body: Arc<dyn MethodBody>,
        visibility: Visibility,
    ) -> ModelResult<MethodEntry> {
        self.add_method(id, name, body, visibility, false)
    }

    /// Boot-time definition path. Entries are flagged builtin, and no
    /// invalidation runs while the runtime is still booting.
    pub fn define_builtin_method(
        &self,
        id: NodeId,
        name: &str,
        body: Arc<dyn MethodBody>,
        visibility: Visibility,
    ) -> ModelResult<MethodEntry> {
        self.add_method(id, name, body, visibility, true)
    }

    fn add_method(
        &self,
        id: NodeId,
        name: &str,
        body: Arc<dyn MethodBody>,
        visibility: Visibility,
        builtin: bool,
    ) -> ModelResult<MethodEntry> {
        let symbol = identifier::method_name(self, name)?;
        let mut graph = self.lock_hierarchy();
        self.check_frozen(id)?;
        let visibility = if ALWAYS_PRIVATE.contains(&name) {
            Visibility::Private
        } else {
            visibility
        };
        if !builtin && PROTECTED_NAMES.contains(&name) && name != "initialize" {
            warn!(method = name, owner = %self.name(id), "redefining method may cause serious problems");
        }
        if !builtin && name == "initialize" && id == self.object() {
            warn!("redefining Object#initialize may cause infinite loop");
        }
        let entry = MethodEntry::new(symbol, id, visibility, builtin, MethodKind::Body(body));
        self.store_method_locked(&mut graph, id, entry.clone());
        Ok(entry)
    }

    /// Writes `entry` into `id`'s method table and invalidates dependents.
    ///
    /// An existing refined marker stays in place and captures the new entry
    /// as its original. Entries stored into a refinement install a marker on
    /// the refined node.
    pub(crate) fn store_method_locked(
        &self,
        graph: &mut SubscriberGraph,
        id: NodeId,
        entry: MethodEntry,
    ) {
        let name = entry.name().clone();
        let location = self.method_location(id);
        {
            let node = self.node(location);
            let mut state = node.write();
            let entry = match state.methods.get(&name) {
                Some(existing) if existing.is_refined() => MethodEntry::new(
                    name.clone(),
                    existing.owner(),
                    Visibility::Public,
                    false,
                    MethodKind::Refined {
                        original: Some(entry),
                    },
                ),
                _ => entry,
            };
            state.methods.insert(name.clone(), entry);
        }
        if let NodeKind::Refinement { target, .. } = self.kind(id) {
            self.install_refined_marker(graph, target, &name);
        }
        if !self.is_booting() {
            self.invalidate(graph, id);
        }
    }

    /// Uncached, undecorated lookup used by mutators.
    fn search_raw(&self, id: NodeId, name: &Symbol) -> Option<MethodEntry> {
        self.search_from(Some(id), name, Markers::Unwrap)
            .map(|(entry, _)| entry)
            .filter(|entry| !entry.is_undefined())
    }

    fn undefined_method_error(&self, id: NodeId, name: &str) -> ModelError {
        ModelError::UndefinedMethod {
            method: name.to_string(),
            kind: self.kind(id).label().to_string(),
            owner: self.name(id),
        }
    }

    /// Stores an undefined entry that stops lookup at `id`.
    pub fn undef_method(&self, id: NodeId, name: &str) -> ModelResult<()> {
        let symbol = identifier::method_name(self, name)?;
        let mut graph = self.lock_hierarchy();
        self.check_frozen(id)?;
        if self.search_raw(id, &symbol).is_none() {
            return Err(self.undefined_method_error(id, name));
        }
        if PROTECTED_NAMES.contains(&name) {
            warn!(method = name, owner = %self.name(id), "undefining method may cause serious problems");
        }
        self.store_method_locked(&mut graph, id, MethodEntry::undefined(symbol, id));
        debug!(method = name, owner = %self.name(id), "undefined method");
        Ok(())
    }

    /// Deletes `name` from `id`'s own table so lookup continues to ancestors.
    pub fn remove_method(&self, id: NodeId, name: &str) -> ModelResult<()> {
        let symbol = identifier::method_name(self, name)?;
        let owner_name = self.name(id);
        let graph = self.lock_hierarchy();
        self.check_frozen(id)?;
        let location = self.method_location(id);
        let removed = {
            let node = self.node(location);
            let mut state = node.write();
            match state.methods.get(&symbol).cloned() {
                Some(marker) if marker.is_refined() => {
                    if marker.refined_original().is_some() {
                        state.methods.insert(
                            symbol.clone(),
                            MethodEntry::new(
                                symbol.clone(),
                                marker.owner(),
                                Visibility::Public,
                                false,
                                MethodKind::Refined { original: None },
                            ),
                        );
                        true
                    } else {
                        false
                    }
                }
                Some(_) => state.methods.remove(&symbol).is_some(),
                None => false,
            }
        };
        if !removed {
            return Err(ModelError::MethodNotDefined {
                method: name.to_string(),
                owner: owner_name,
            });
        }
        if PROTECTED_NAMES.contains(&name) {
            warn!(method = name, owner = %owner_name, "removing method may cause serious problems");
        }
        self.invalidate(&graph, id);
        debug!(method = name, owner = %owner_name, "removed method");
        Ok(())
    }

    /// Makes `new_name` call the implementation `old_name` currently resolves to.
    pub fn alias_method(&self, id: NodeId, new_name: &str, old_name: &str) -> ModelResult<()> {
        let new_symbol = identifier::method_name(self, new_name)?;
        let old_symbol = identifier::method_name(self, old_name)?;
        let mut graph = self.lock_hierarchy();
        self.check_frozen(id)?;
        let Some(found) = self.search_raw(id, &old_symbol) else {
            return Err(self.undefined_method_error(id, old_name));
        };
        let target = match found.kind() {
            MethodKind::Alias { target } => target.clone(),
            _ => found.clone(),
        };
        let entry = MethodEntry::new(
            new_symbol,
            id,
            found.visibility(),
            false,
            MethodKind::Alias { target },
        );
        self.store_method_locked(&mut graph, id, entry);
        Ok(())
    }

    /// Changes visibility of `names` as seen through `id`. Inherited methods
    /// get a copy in `id`'s table that keeps the original owner.
    pub fn set_visibility(
        &self,
        id: NodeId,
        names: &[&str],
        visibility: Visibility,
    ) -> ModelResult<()> {
        let symbols = names
            .iter()
            .map(|name| identifier::method_name(self, name))
            .collect::<ModelResult<Vec<_>>>()?;
        let mut graph = self.lock_hierarchy();
        self.check_frozen(id)?;
        let mut updates = Vec::with_capacity(symbols.len());
        for (symbol, name) in symbols.iter().zip(names) {
            let Some(found) = self.search_raw(id, symbol) else {
                return Err(self.undefined_method_error(id, name));
            };
            if found.visibility() != visibility {
                updates.push(found.with_visibility(visibility));
            }
        }
        for entry in updates {
            self.store_method_locked(&mut graph, id, entry);
        }
        Ok(())
    }

    /// Copies `names` into the module's singleton as public methods and
    /// makes the instance-side copies private.
    pub fn module_function(&self, module: NodeId, names: &[&str]) -> ModelResult<()> {
        let kind = self.kind(module);
        if kind != NodeKind::Module {
            return Err(ModelError::WrongArgumentType {
                found: self.type_label(kind).to_string(),
                expected: "Module".to_string(),
            });
        }
        let mut graph = self.lock_hierarchy();
        self.check_frozen(module)?;
        let mut found = Vec::with_capacity(names.len());
        for name in names {
            let symbol = identifier::method_name(self, name)?;
            match self.search_raw(module, &symbol) {
                Some(entry) => found.push(entry),
                None => return Err(self.undefined_method_error(module, name)),
            }
        }
        let singleton = self.singleton_class_locked(&mut graph, module);
        for entry in found {
            self.store_method_locked(&mut graph, singleton, entry.with_visibility(Visibility::Public));
            self.store_method_locked(&mut graph, module, entry.with_visibility(Visibility::Private));
        }
        Ok(())
    }

    /// Replaces `id`'s cache-entry factory with `wrap(previous)` and retires cached entries.
    pub fn wrap_cache_entry_factory(
        &self,
        id: NodeId,
        wrap: impl FnOnce(Arc<dyn CacheEntryFactory>) -> Arc<dyn CacheEntryFactory>,
    ) {
        let graph = self.lock_hierarchy();
        {
            let node = self.node(id);
            let mut state = node.write();
            let previous = Arc::clone(&state.factory);
            state.factory = wrap(previous);
        }
        self.invalidate(&graph, id);
    }

    /// Serializes execution of every method resolved through `id`.
    pub fn become_synchronized(&self, id: NodeId) {
        self.wrap_cache_entry_factory(id, |previous| {
            Arc::new(SynchronizedCacheEntryFactory::new(previous))
        });
        debug!(node = %self.name(id), "synchronized method dispatch");
    }

    /// Starts counting calls of methods resolved through `id`.
    pub fn enable_profiling(&self, id: NodeId) -> Arc<CallProfile> {
        if let Some(profile) = self.call_profile(id) {
            return profile;
        }
        let profile = Arc::new(CallProfile::default());
        let collected = Arc::clone(&profile);
        self.wrap_cache_entry_factory(id, move |previous| {
            Arc::new(ProfilingCacheEntryFactory::new(previous, collected))
        });
        self.node(id).write().profile = Some(Arc::clone(&profile));
        profile
    }

    pub fn call_profile(&self, id: NodeId) -> Option<Arc<CallProfile>> {
        self.node(id).read().profile.clone()
    }

    pub(crate) fn define_core_methods(&self) {
        let core = self.core();
        let definitions: [(NodeId, &str, Arc<dyn MethodBody>, Visibility); 5] = [
            (
                core.basic_object,
                "initialize",
                NativeMethod::returning(Value::Nil),
                Visibility::Private,
            ),
            (
                core.basic_object,
                "__send__",
                NativeMethod::new(|invocation| {
                    let Some((name, rest)) = invocation.args.split_first() else {
                        return Err(ModelError::InvalidArgument {
                            operation: "__send__".to_string(),
                            message: "no method name given".to_string(),
                        });
                    };
                    let name = match name {
                        Value::Sym(symbol) => symbol.as_str().to_string(),
                        Value::Str(name) => name.to_string(),
                        other => {
                            return Err(ModelError::InvalidArgument {
                                operation: "__send__".to_string(),
                                message: format!(
                                    "{} is not a symbol nor a string",
                                    invocation.runtime.inspect(other)
                                ),
                            });
                        }
                    };
                    invocation.runtime.send_method(
                        invocation.context,
                        invocation.receiver,
                        &name,
                        rest,
                    )
                }),
                Visibility::Public,
            ),
            (
                core.kernel,
                "class",
                NativeMethod::with_arity(0, |invocation| {
                    let runtime = invocation.runtime;
                    let class = match invocation.receiver {
                        Value::Module(id) if runtime.kind(*id).is_module() => runtime.core().module,
                        Value::Module(_) => runtime.core().class,
                        other => runtime.class_of(other),
                    };
                    Ok(Value::Module(class))
                }),
                Visibility::Public,
            ),
            (
                core.kernel,
                "respond_to?",
                NativeMethod::with_arity(1, |invocation| {
                    let name = match &invocation.args[0] {
                        Value::Sym(symbol) => symbol.as_str().to_string(),
                        Value::Str(name) => name.to_string(),
                        _ => return Ok(Value::Bool(false)),
                    };
                    Ok(Value::Bool(invocation.runtime.responds_to(
                        invocation.context,
                        invocation.receiver,
                        &name,
                        false,
                    )))
                }),
                Visibility::Public,
            ),
            (
                core.module,
                "name",
                NativeMethod::with_arity(0, |invocation| {
                    Ok(match invocation.receiver {
                        Value::Module(id) if invocation.runtime.is_named(*id) => {
                            Value::str(invocation.runtime.name(*id))
                        }
                        _ => Value::Nil,
                    })
                }),
                Visibility::Public,
            ),
        ];
        for (owner, name, body, visibility) in definitions {
            if let Err(error) = self.define_builtin_method(owner, name, body, visibility) {
                panic!("defining builtin {name}: {error}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::runtime::cache::{CacheEntry, CacheEntryFactory};
    use crate::runtime::context::{Frame, Scope};
    use crate::runtime::error::ModelError;
    use crate::runtime::method::{MethodEntry, NativeMethod, Visibility};
    use crate::runtime::value::Value;
    use crate::runtime::{NodeId, Runtime};

    fn frame(runtime: &Runtime) -> Frame {
        Frame::new(Scope::top(runtime.object()))
    }

    fn define_returning(runtime: &Runtime, id: NodeId, name: &str, value: &str) {
        runtime
            .define_method(
                id,
                name,
                NativeMethod::returning(Value::str(value)),
                Visibility::Public,
            )
            .expect("define method");
    }

    #[test]
    fn defines_and_calls_methods() {
        let runtime = Runtime::new();
        let a = runtime.define_class("A", None, None).expect("A");
        define_returning(&runtime, a, "foo", "A#foo");
        let receiver = runtime.new_instance(a).expect("instance");
        assert_eq!(
            runtime
                .call_method(&frame(&runtime), &receiver, "foo", &[])
                .expect("call foo"),
            Value::str("A#foo")
        );
        assert!(runtime.method_defined(a, "foo"));
        assert!(!runtime.method_defined(a, "bar"));
    }

    #[test]
    fn undef_stops_lookup_and_remove_restores_inherited() {
        let runtime = Runtime::new();
        let base = runtime.define_class("Base", None, None).expect("Base");
        let child = runtime.define_class("Child", Some(base), None).expect("Child");
        define_returning(&runtime, base, "foo", "Base#foo");
        define_returning(&runtime, child, "foo", "Child#foo");

        runtime.remove_method(child, "foo").expect("remove");
        assert_eq!(runtime.search_method(child, "foo").owner(), base);
        assert_eq!(
            runtime.remove_method(child, "foo"),
            Err(ModelError::MethodNotDefined {
                method: "foo".to_string(),
                owner: "Child".to_string()
            })
        );

        runtime.undef_method(child, "foo").expect("undef");
        assert!(runtime.search_method(child, "foo").is_undefined());
        assert!(!runtime.search_method(base, "foo").is_undefined());
        assert_eq!(
            runtime.undef_method(child, "foo"),
            Err(ModelError::UndefinedMethod {
                method: "foo".to_string(),
                kind: "class".to_string(),
                owner: "Child".to_string()
            })
        );
    }

    #[test]
    fn alias_keeps_old_implementation() {
        let runtime = Runtime::new();
        let a = runtime.define_class("A", None, None).expect("A");
        define_returning(&runtime, a, "foo", "old");
        runtime.alias_method(a, "bar", "foo").expect("alias");
        define_returning(&runtime, a, "foo", "new");
        let receiver = runtime.new_instance(a).expect("instance");
        let frame = frame(&runtime);
        assert_eq!(
            runtime.call_method(&frame, &receiver, "bar", &[]).expect("bar"),
            Value::str("old")
        );
        assert_eq!(
            runtime.call_method(&frame, &receiver, "foo", &[]).expect("foo"),
            Value::str("new")
        );
        assert!(runtime.search_method(a, "bar").is_alias());
    }

    #[test]
    fn visibility_changes_apply_to_inherited_methods() {
        let runtime = Runtime::new();
        let base = runtime.define_class("Base", None, None).expect("Base");
        let child = runtime.define_class("Child", Some(base), None).expect("Child");
        define_returning(&runtime, base, "secret", "s");
        runtime
            .set_visibility(child, &["secret"], Visibility::Private)
            .expect("private");
        assert!(runtime.private_method_defined(child, "secret"));
        assert!(runtime.public_method_defined(base, "secret"));
        let receiver = runtime.new_instance(child).expect("instance");
        let frame = frame(&runtime);
        assert_eq!(
            runtime.call_method(&frame, &receiver, "secret", &[]),
            Err(ModelError::PrivateMethodCalled {
                method: "secret".to_string(),
                receiver: "an instance of Child".to_string()
            })
        );
        assert_eq!(
            runtime
                .send_method(&frame, &receiver, "secret", &[])
                .expect("send ignores visibility"),
            Value::str("s")
        );
        assert!(matches!(
            runtime.set_visibility(child, &["missing"], Visibility::Public),
            Err(ModelError::UndefinedMethod { .. })
        ));
    }

    #[test]
    fn initialize_is_always_private() {
        let runtime = Runtime::new();
        let a = runtime.define_class("A", None, None).expect("A");
        let entry = runtime
            .define_method(
                a,
                "initialize",
                NativeMethod::returning(Value::Nil),
                Visibility::Public,
            )
            .expect("initialize");
        assert_eq!(entry.visibility(), Visibility::Private);
    }

    #[test]
    fn module_function_copies_to_singleton() {
        let runtime = Runtime::new();
        let m = runtime.define_module("Util", None).expect("Util");
        define_returning(&runtime, m, "helper", "h");
        runtime.module_function(m, &["helper"]).expect("module_function");
        let frame = frame(&runtime);
        assert_eq!(
            runtime
                .call_method(&frame, &Value::Module(m), "helper", &[])
                .expect("module-level call"),
            Value::str("h")
        );
        assert!(runtime.private_method_defined(m, "helper"));
        let a = runtime.define_class("A", None, None).expect("A");
        assert!(matches!(
            runtime.module_function(a, &["helper"]),
            Err(ModelError::WrongArgumentType { .. })
        ));
    }

    #[test]
    fn builtins_are_flagged_and_callable() {
        let runtime = Runtime::new();
        let a = runtime.define_class("A", None, None).expect("A");
        let receiver = runtime.new_instance(a).expect("instance");
        let frame = frame(&runtime);
        assert!(runtime.is_method_builtin(a, "class"));
        assert_eq!(
            runtime.call_method(&frame, &receiver, "class", &[]).expect("class"),
            Value::Module(a)
        );
        assert_eq!(
            runtime
                .call_method(
                    &frame,
                    &receiver,
                    "__send__",
                    &[Value::Sym(runtime.intern("class"))]
                )
                .expect("__send__"),
            Value::Module(a)
        );
        assert_eq!(
            runtime
                .call_method(&frame, &Value::Module(a), "name", &[])
                .expect("name"),
            Value::str("A")
        );
        assert!(matches!(
            runtime.call_method(&frame, &receiver, "class", &[Value::Nil]),
            Err(ModelError::ArityMismatch { .. })
        ));
    }

    struct CountingFactory {
        previous: Arc<dyn CacheEntryFactory>,
        created: Arc<AtomicUsize>,
    }

    impl CacheEntryFactory for CountingFactory {
        fn new_entry(&self, method: MethodEntry, source: NodeId, token: u64) -> CacheEntry {
            self.created.fetch_add(1, Ordering::SeqCst);
            self.previous.new_entry(method, source, token)
        }
    }

    #[test]
    fn factories_run_once_per_fresh_resolution() {
        let runtime = Runtime::new();
        let a = runtime.define_class("A", None, None).expect("A");
        define_returning(&runtime, a, "foo", "x");
        let created = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&created);
        runtime.wrap_cache_entry_factory(a, move |previous| {
            Arc::new(CountingFactory {
                previous,
                created: counter,
            })
        });
        let receiver = runtime.new_instance(a).expect("instance");
        let frame = frame(&runtime);
        for _ in 0..3 {
            runtime.call_method(&frame, &receiver, "foo", &[]).expect("foo");
        }
        assert_eq!(created.load(Ordering::SeqCst), 1);
        define_returning(&runtime, a, "bar", "y");
        runtime.call_method(&frame, &receiver, "foo", &[]).expect("foo");
        assert_eq!(created.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn profiling_counts_calls() {
        let runtime = Runtime::new();
        let a = runtime.define_class("A", None, None).expect("A");
        define_returning(&runtime, a, "foo", "x");
        let profile = runtime.enable_profiling(a);
        let receiver = runtime.new_instance(a).expect("instance");
        let frame = frame(&runtime);
        for _ in 0..4 {
            runtime.call_method(&frame, &receiver, "foo", &[]).expect("foo");
        }
        assert_eq!(profile.count("foo"), 4);
        assert_eq!(profile.snapshot(), vec![("foo".to_string(), 4)]);
        assert!(Arc::ptr_eq(&profile, &runtime.enable_profiling(a)));
    }

    #[test]
    fn synchronized_methods_can_reenter() {
        let runtime = Runtime::new();
        let a = runtime.define_class("A", None, None).expect("A");
        define_returning(&runtime, a, "inner", "inner");
        runtime
            .define_method(
                a,
                "outer",
                NativeMethod::new(|invocation| {
                    invocation.runtime.call_method(
                        invocation.context,
                        invocation.receiver,
                        "inner",
                        &[],
                    )
                }),
                Visibility::Public,
            )
            .expect("outer");
        runtime.become_synchronized(a);
        let receiver = runtime.new_instance(a).expect("instance");
        assert_eq!(
            runtime
                .call_method(&frame(&runtime), &receiver, "outer", &[])
                .expect("outer"),
            Value::str("inner")
        );
    }
}
