use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use dashmap::DashMap;
use rustc_hash::{FxBuildHasher, FxHashMap};

use crate::runtime::arena::NodeId;
use crate::runtime::autoload::Autoload;
use crate::runtime::cache::{CacheEntry, CacheEntryFactory, CallProfile};
use crate::runtime::constant::ConstantEntry;
use crate::runtime::method::MethodEntry;
use crate::runtime::value::Value;
use crate::symbol::Symbol;

/// What a hierarchy node is. Fixed at allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Class,
    Module,
    /// Per-object class holding methods of one attached class or module.
    Singleton { attached: NodeId },
    /// Synthetic chain entry standing in for an included, prepended or
    /// activated module. Lookups read the origin's method table.
    Wrapper {
        origin: NodeId,
        refined_target: Option<NodeId>,
    },
    /// Holds the original methods of a node that has prepended modules.
    MethodLocation { owner: NodeId },
    /// Overlay created by `refine`; its methods override `target` in scopes that use `host`.
    Refinement { target: NodeId, host: NodeId },
}

impl NodeKind {
    pub fn is_module(self) -> bool {
        matches!(self, NodeKind::Module | NodeKind::Refinement { .. })
    }

    pub fn is_class(self) -> bool {
        matches!(self, NodeKind::Class | NodeKind::Singleton { .. })
    }

    pub fn is_singleton(self) -> bool {
        matches!(self, NodeKind::Singleton { .. })
    }

    pub fn is_refinement(self) -> bool {
        matches!(self, NodeKind::Refinement { .. })
    }

    /// Wrappers and method-location nodes act on behalf of another node.
    pub fn needs_implementer(self) -> bool {
        matches!(
            self,
            NodeKind::Wrapper { .. } | NodeKind::MethodLocation { .. }
        )
    }

    /// The user-visible node this one stands in for.
    pub(crate) fn delegate(self, id: NodeId) -> NodeId {
        match self {
            NodeKind::Wrapper { origin, .. } => origin,
            NodeKind::MethodLocation { owner } => owner,
            _ => id,
        }
    }

    pub(crate) fn label(self) -> &'static str {
        if self.is_module() { "module" } else { "class" }
    }
}

/// A table allocated on first write.
pub(crate) struct LazyMap<K, V>(Option<Box<FxHashMap<K, V>>>);

impl<K, V> Default for LazyMap<K, V> {
    fn default() -> Self {
        Self(None)
    }
}

impl<K: Eq + Hash, V> LazyMap<K, V> {
    pub(crate) fn get(&self, key: &K) -> Option<&V> {
        self.0.as_ref()?.get(key)
    }

    pub(crate) fn contains_key(&self, key: &K) -> bool {
        self.get(key).is_some()
    }

    pub(crate) fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        self.0.as_mut()?.get_mut(key)
    }

    pub(crate) fn insert(&mut self, key: K, value: V) -> Option<V> {
        self.0.get_or_insert_with(Box::default).insert(key, value)
    }

    pub(crate) fn remove(&mut self, key: &K) -> Option<V> {
        self.0.as_mut()?.remove(key)
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.0.iter().flat_map(|map| map.iter())
    }

    pub(crate) fn take(&mut self) -> Self {
        Self(self.0.take())
    }

    pub(crate) fn is_promoted(&self) -> bool {
        self.0.is_some()
    }

    pub(crate) fn len(&self) -> usize {
        self.0.as_ref().map_or(0, |map| map.len())
    }
}

/// Mutable node state, guarded by the node's lock.
pub(crate) struct NodeState {
    pub(crate) superclass: Option<NodeId>,
    /// Node whose table holds this node's methods; itself unless prepended.
    pub(crate) method_location: NodeId,
    pub(crate) methods: LazyMap<Symbol, MethodEntry>,
    pub(crate) constants: LazyMap<Symbol, ConstantEntry>,
    pub(crate) class_vars: LazyMap<Symbol, Value>,
    pub(crate) autoloads: LazyMap<Symbol, Arc<Autoload>>,
    /// target -> refinement node, for refinements defined in this module.
    pub(crate) refinements: LazyMap<NodeId, NodeId>,
    /// target -> head of the overlay chain active in scopes with this cref.
    pub(crate) activated: LazyMap<NodeId, NodeId>,
    pub(crate) base_name: Option<Arc<str>>,
    pub(crate) parent: Option<NodeId>,
    pub(crate) singleton: Option<NodeId>,
    pub(crate) frozen: bool,
    pub(crate) factory: Arc<dyn CacheEntryFactory>,
    pub(crate) profile: Option<Arc<CallProfile>>,
}

impl NodeState {
    pub(crate) fn new(
        id: NodeId,
        superclass: Option<NodeId>,
        factory: Arc<dyn CacheEntryFactory>,
    ) -> Self {
        Self {
            superclass,
            method_location: id,
            methods: LazyMap::default(),
            constants: LazyMap::default(),
            class_vars: LazyMap::default(),
            autoloads: LazyMap::default(),
            refinements: LazyMap::default(),
            activated: LazyMap::default(),
            base_name: None,
            parent: None,
            singleton: None,
            frozen: false,
            factory,
            profile: None,
        }
    }
}

type MethodCache = DashMap<Symbol, CacheEntry, FxBuildHasher>;

pub(crate) struct Node {
    pub(crate) id: NodeId,
    pub(crate) kind: NodeKind,
    generation: AtomicU64,
    cache: OnceLock<MethodCache>,
    state: RwLock<NodeState>,
}

impl Node {
    pub(crate) fn new(id: NodeId, kind: NodeKind, generation: u64, state: NodeState) -> Self {
        Self {
            id,
            kind,
            generation: AtomicU64::new(generation),
            cache: OnceLock::new(),
            state: RwLock::new(state),
        }
    }

    pub(crate) fn read(&self) -> RwLockReadGuard<'_, NodeState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn write(&self) -> RwLockWriteGuard<'_, NodeState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub(crate) fn set_generation(&self, generation: u64) {
        self.generation.store(generation, Ordering::Release);
    }

    /// A cached entry, valid or stale.
    pub(crate) fn cached(&self, name: &Symbol) -> Option<CacheEntry> {
        self.cache.get()?.get(name).map(|entry| entry.clone())
    }

    pub(crate) fn store_cached(&self, name: Symbol, entry: CacheEntry) {
        self.cache
            .get_or_init(|| DashMap::with_hasher(FxBuildHasher::default()))
            .insert(name, entry);
    }

    pub(crate) fn cache_len(&self) -> usize {
        self.cache.get().map_or(0, DashMap::len)
    }
}
