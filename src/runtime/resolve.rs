use std::sync::Arc;

use rustc_hash::FxHashSet;
use tracing::trace;

use crate::runtime::Runtime;
use crate::runtime::arena::NodeId;
use crate::runtime::cache::CacheEntry;
use crate::runtime::context::CallContext;
use crate::runtime::error::{ModelError, ModelResult};
use crate::runtime::method::{Invocation, MethodEntry, MethodKind, Visibility};
use crate::runtime::node::{Node, NodeKind};
use crate::runtime::value::Value;
use crate::symbol::Symbol;

/// How a chain walk treats refined markers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Markers {
    /// Return the marker so the caller can consult the active scope.
    Stop,
    /// Use the captured original, or keep walking when there is none.
    Unwrap,
}

impl Runtime {
    /// The entry for `name` in the table `link` reads from.
    pub(crate) fn table_entry(&self, link: NodeId, name: &Symbol) -> Option<MethodEntry> {
        let node = self.node(link);
        match node.kind {
            NodeKind::Wrapper { origin, .. } => {
                let location = self.method_location(origin);
                self.node(location).read().methods.get(name).cloned()
            }
            _ => node.read().methods.get(name).cloned(),
        }
    }

    /// The next node in a lookup walk. The wrapper under a refinement continues
    /// above the refined node's own methods; a refined module falls through to
    /// the root class once its own mixins are exhausted.
    pub(crate) fn next_link(&self, link: NodeId) -> Option<NodeId> {
        let node = self.node(link);
        let superclass = node.read().superclass;
        if superclass.is_some() {
            return superclass;
        }
        match node.kind {
            NodeKind::Wrapper {
                origin,
                refined_target: Some(target),
            } if origin == target => self
                .superclass_link(self.method_location(target))
                .or_else(|| self.kind(target).is_module().then(|| self.object())),
            _ => None,
        }
    }

    /// Uncached walk from `start`. Returns the first table hit and the link it was found in.
    pub(crate) fn search_from(
        &self,
        start: Option<NodeId>,
        name: &Symbol,
        markers: Markers,
    ) -> Option<(MethodEntry, NodeId)> {
        let mut cursor = start;
        while let Some(link) = cursor {
            if let Some(entry) = self.table_entry(link, name) {
                match entry.kind() {
                    MethodKind::Refined { original } if markers == Markers::Unwrap => {
                        if let Some(original) = original {
                            return Some((original.clone(), link));
                        }
                    }
                    _ => return Some((entry, link)),
                }
            }
            cursor = self.next_link(link);
        }
        None
    }

    /// Cached lookup of `name` starting at `id`. Refined markers are returned as-is.
    pub fn cache_entry(&self, id: NodeId, name: &str) -> CacheEntry {
        self.search_with_cache(id, &self.intern(name))
    }

    pub(crate) fn search_with_cache(&self, id: NodeId, name: &Symbol) -> CacheEntry {
        let node = self.node(id);
        let token = node.generation();
        if let Some(entry) = node.cached(name)
            && entry.is_valid_for(token)
        {
            return entry;
        }
        self.cache_miss(&node, name, token)
    }

    fn cache_miss(&self, node: &Node, name: &Symbol, token: u64) -> CacheEntry {
        trace!(node = node.id.raw(), method = %name, "method cache miss");
        let entry = match self.search_from(Some(node.id), name, Markers::Stop) {
            Some((method, source)) if !method.is_undefined() => {
                let factory = Arc::clone(&node.read().factory);
                factory.new_entry(method, source, token)
            }
            Some((_, source)) => CacheEntry::new(self.undefined().clone(), source, token),
            None => CacheEntry::new(self.undefined().clone(), node.id, token),
        };
        let cacheable = !entry.method().is_undefined() || self.config.cache_undefined;
        if cacheable && !self.is_booting() {
            node.store_cached(name.clone(), entry.clone());
        }
        entry
    }

    /// Resolves `name` from `id` ignoring refinements. Misses yield an undefined entry.
    pub fn search_method(&self, id: NodeId, name: &str) -> MethodEntry {
        let entry = self.search_with_cache(id, &self.intern(name));
        self.unrefined(entry)
    }

    pub(crate) fn unrefined(&self, entry: CacheEntry) -> MethodEntry {
        if !entry.method().is_refined() {
            return entry.into_method();
        }
        if let Some(original) = entry.method().refined_original() {
            return original.clone();
        }
        let above = self.next_link(entry.source());
        match self.search_from(above, entry.method().name(), Markers::Unwrap) {
            Some((method, _)) if !method.is_undefined() => method,
            _ => self.undefined().clone(),
        }
    }

    /// Resolves `name` from `id` as seen from the calling scope, honoring active refinements.
    pub fn find_method(&self, context: &dyn CallContext, id: NodeId, name: &str) -> MethodEntry {
        self.find_method_symbol(context, id, &self.intern(name))
    }

    pub(crate) fn find_method_symbol(
        &self,
        context: &dyn CallContext,
        id: NodeId,
        name: &Symbol,
    ) -> MethodEntry {
        let entry = self.search_with_cache(id, name);
        if !entry.method().is_refined() {
            return entry.into_method();
        }
        // The cached marker went through the factories undecorated; decorate
        // whatever it resolves to in this scope.
        let resolved = self.resolve_refined(context.current_scope(), &entry);
        if resolved.is_undefined() {
            return resolved;
        }
        let factory = Arc::clone(&self.node(id).read().factory);
        factory
            .new_entry(resolved, entry.source(), entry.token())
            .into_method()
    }

    /// The implementation `super` reaches from a method owned by `implementer`.
    pub(crate) fn find_super_method(
        &self,
        class: NodeId,
        implementer: NodeId,
        name: &Symbol,
    ) -> MethodEntry {
        let start = if self.kind(implementer).is_refinement() {
            self.superclass_link(implementer)
        } else {
            let chain = self.chain(class);
            let position = chain.iter().position(|&link| {
                self.holds_table(link) && self.kind(link).delegate(link) == implementer
            });
            match position {
                Some(position) => self.next_link(chain[position]),
                None => return self.undefined().clone(),
            }
        };
        match self.search_from(start, name, Markers::Unwrap) {
            Some((method, _)) if !method.is_undefined() => method,
            _ => self.undefined().clone(),
        }
    }

    /// Public dispatch: private methods are rejected.
    pub fn call_method(
        &self,
        context: &dyn CallContext,
        receiver: &Value,
        name: &str,
        args: &[Value],
    ) -> ModelResult<Value> {
        self.dispatch(context, receiver, name, args, None, true)
    }

    pub fn call_method_with_block(
        &self,
        context: &dyn CallContext,
        receiver: &Value,
        name: &str,
        args: &[Value],
        block: &Value,
    ) -> ModelResult<Value> {
        self.dispatch(context, receiver, name, args, Some(block), true)
    }

    /// Dispatch that ignores visibility.
    pub fn send_method(
        &self,
        context: &dyn CallContext,
        receiver: &Value,
        name: &str,
        args: &[Value],
    ) -> ModelResult<Value> {
        self.dispatch(context, receiver, name, args, None, false)
    }

    fn dispatch(
        &self,
        context: &dyn CallContext,
        receiver: &Value,
        name: &str,
        args: &[Value],
        block: Option<&Value>,
        check_visibility: bool,
    ) -> ModelResult<Value> {
        let class = self.class_of(receiver);
        let entry = self.find_method_symbol(context, class, &self.intern(name));
        if entry.is_undefined() {
            return Err(ModelError::NoMethod {
                method: name.to_string(),
                receiver: self.describe_receiver(receiver),
            });
        }
        if check_visibility && entry.visibility() == Visibility::Private {
            return Err(ModelError::PrivateMethodCalled {
                method: name.to_string(),
                receiver: self.describe_receiver(receiver),
            });
        }
        self.invoke(context, &entry, receiver, args, block)
    }

    /// Runs `entry` against `receiver`.
    pub fn invoke(
        &self,
        context: &dyn CallContext,
        entry: &MethodEntry,
        receiver: &Value,
        args: &[Value],
        block: Option<&Value>,
    ) -> ModelResult<Value> {
        match entry.kind() {
            MethodKind::Body(body) => body.call(&Invocation {
                runtime: self,
                context,
                receiver,
                owner: entry.owner(),
                name: entry.name(),
                args,
                block,
            }),
            MethodKind::Alias { target } => self.invoke(context, target, receiver, args, block),
            MethodKind::Refined {
                original: Some(original),
            } => self.invoke(context, original, receiver, args, block),
            MethodKind::Refined { original: None } | MethodKind::Undefined => {
                Err(ModelError::NoMethod {
                    method: entry.name().to_string(),
                    receiver: self.describe_receiver(receiver),
                })
            }
        }
    }

    pub(crate) fn call_super(
        &self,
        invocation: &Invocation<'_>,
        args: &[Value],
    ) -> ModelResult<Value> {
        let class = self.class_of(invocation.receiver);
        let entry = self.find_super_method(class, invocation.owner, invocation.name);
        if entry.is_undefined() {
            return Err(ModelError::NoSuperMethod {
                method: invocation.name.to_string(),
                receiver: self.describe_receiver(invocation.receiver),
            });
        }
        self.invoke(
            invocation.context,
            &entry,
            invocation.receiver,
            args,
            invocation.block,
        )
    }

    fn describe_receiver(&self, receiver: &Value) -> String {
        match receiver {
            Value::Nil => "nil".to_string(),
            Value::Module(id) => {
                let label = if self.kind(*id).is_module() { "module" } else { "class" };
                format!("{label} {}", self.name(*id))
            }
            other => format!("an instance of {}", self.name(self.class_of(other))),
        }
    }

    /// Whether `name` resolves from `id` to a public or protected method.
    pub fn method_defined(&self, id: NodeId, name: &str) -> bool {
        let entry = self.search_method(id, name);
        !entry.is_undefined() && entry.visibility() != Visibility::Private
    }

    pub fn public_method_defined(&self, id: NodeId, name: &str) -> bool {
        self.method_defined_with(id, name, Visibility::Public)
    }

    pub fn protected_method_defined(&self, id: NodeId, name: &str) -> bool {
        self.method_defined_with(id, name, Visibility::Protected)
    }

    pub fn private_method_defined(&self, id: NodeId, name: &str) -> bool {
        self.method_defined_with(id, name, Visibility::Private)
    }

    fn method_defined_with(&self, id: NodeId, name: &str, visibility: Visibility) -> bool {
        let entry = self.search_method(id, name);
        !entry.is_undefined() && entry.visibility() == visibility
    }

    pub fn is_method_builtin(&self, id: NodeId, name: &str) -> bool {
        self.search_method(id, name).is_builtin()
    }

    pub fn responds_to(
        &self,
        context: &dyn CallContext,
        receiver: &Value,
        name: &str,
        include_private: bool,
    ) -> bool {
        let entry = self.find_method(context, self.class_of(receiver), name);
        !entry.is_undefined() && (include_private || entry.visibility() != Visibility::Private)
    }

    /// Method names callable on instances of `id`, sorted.
    ///
    /// `visibility` of `None` lists public and protected methods. Without
    /// `include_super` only the node's own table is listed. Nearer entries
    /// shadow farther ones, so an undefined or private override hides an
    /// inherited public method.
    pub fn instance_methods(
        &self,
        id: NodeId,
        include_super: bool,
        visibility: Option<Visibility>,
    ) -> Vec<Symbol> {
        let own_location = self.method_location(id);
        let links = if include_super {
            self.chain(id)
        } else {
            vec![own_location]
        };
        let mut seen = FxHashSet::default();
        let mut names = Vec::new();
        for link in links {
            if !self.holds_table(link) {
                continue;
            }
            let table_owner = match self.kind(link) {
                NodeKind::Wrapper { origin, .. } => self.method_location(origin),
                _ => link,
            };
            let entries = self
                .node(table_owner)
                .read()
                .methods
                .iter()
                .map(|(name, entry)| (name.clone(), entry.clone()))
                .collect::<Vec<_>>();
            for (name, entry) in entries {
                let effective = match entry.kind() {
                    MethodKind::Refined { original: None } => continue,
                    MethodKind::Refined {
                        original: Some(original),
                    } => original.clone(),
                    _ => entry,
                };
                if !seen.insert(name.clone()) || effective.is_undefined() {
                    continue;
                }
                let listed = match visibility {
                    Some(wanted) => effective.visibility() == wanted,
                    None => effective.visibility() != Visibility::Private,
                };
                if listed {
                    names.push(name);
                }
            }
        }
        names.sort();
        names
    }
}
