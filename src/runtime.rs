//! Class/module hierarchy, method resolution and constant namespaces.
//!
//! A [`Runtime`] owns every hierarchy node in an arena and exposes the
//! composition API (define, include, prepend, refine, using, constants).
//! Cache-hit method lookups are lock-free; structural mutations serialize on
//! one hierarchy lock that also guards the subscriber graph used for cache
//! invalidation.
pub(crate) mod arena;
pub(crate) mod autoload;
pub(crate) mod cache;
pub(crate) mod class_var;
pub(crate) mod constant;
pub(crate) mod context;
pub(crate) mod definition;
pub(crate) mod error;
pub(crate) mod identifier;
pub(crate) mod invalidator;
pub(crate) mod linearizer;
pub(crate) mod method;
pub(crate) mod methods;
pub(crate) mod naming;
pub(crate) mod node;
pub(crate) mod refinement;
pub(crate) mod resolve;
pub(crate) mod value;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::debug;

use crate::config::RuntimeConfig;
use crate::symbol::{Symbol, SymbolTable};

pub use arena::NodeId;
pub use autoload::{Loader, NullLoader};
pub use cache::{
    CacheEntry, CacheEntryFactory, CallProfile, DefaultCacheEntryFactory,
    ProfilingCacheEntryFactory, SynchronizedCacheEntryFactory,
};
pub use context::{CallContext, Frame, Scope};
pub use error::{ErrorKind, ModelError, ModelResult};
pub use method::{Invocation, MethodBody, MethodEntry, NativeMethod, Visibility};
pub use node::NodeKind;
pub use value::{Instance, Value};

use arena::Arena;
use invalidator::SubscriberGraph;
use node::{Node, NodeState};

/// Nodes created during boot. Their ids are fixed by allocation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoreNodes {
    pub basic_object: NodeId,
    pub object: NodeId,
    pub module: NodeId,
    pub class: NodeId,
    pub kernel: NodeId,
    pub nil_class: NodeId,
    pub true_class: NodeId,
    pub false_class: NodeId,
    pub integer: NodeId,
    pub string: NodeId,
    pub symbol: NodeId,
}

impl CoreNodes {
    const BOOT_ORDER: CoreNodes = CoreNodes {
        basic_object: NodeId(0),
        object: NodeId(1),
        module: NodeId(2),
        class: NodeId(3),
        kernel: NodeId(4),
        nil_class: NodeId(5),
        true_class: NodeId(6),
        false_class: NodeId(7),
        integer: NodeId(8),
        string: NodeId(9),
        symbol: NodeId(10),
    };
}

pub struct Runtime {
    pub(crate) arena: Arena,
    hierarchy: Mutex<SubscriberGraph>,
    /// Serializes reopen-or-create in `define_class`/`define_module`.
    definitions: Mutex<()>,
    generation: AtomicU64,
    booting: AtomicBool,
    symbols: SymbolTable,
    pub(crate) loader: Arc<dyn Loader>,
    pub(crate) config: RuntimeConfig,
    undefined: MethodEntry,
    core: CoreNodes,
}

impl Runtime {
    /// Boots a runtime with the default configuration and no loader.
    pub fn new() -> Self {
        let runtime = Self::boot(RuntimeConfig::default(), Arc::new(NullLoader));
        runtime.finish_boot();
        runtime
    }

    pub fn with_config(config: RuntimeConfig, loader: Arc<dyn Loader>) -> Self {
        let runtime = Self::boot(config, loader);
        runtime.finish_boot();
        runtime
    }

    /// Creates the core hierarchy. Method caching stays off until [`Runtime::finish_boot`].
    pub fn boot(config: RuntimeConfig, loader: Arc<dyn Loader>) -> Self {
        let symbols = SymbolTable::new();
        let core = CoreNodes::BOOT_ORDER;
        let undefined = MethodEntry::undefined(symbols.intern(""), core.basic_object);
        let runtime = Self {
            arena: Arena::new(),
            hierarchy: Mutex::new(SubscriberGraph::default()),
            definitions: Mutex::new(()),
            generation: AtomicU64::new(1),
            booting: AtomicBool::new(true),
            symbols,
            loader,
            config,
            undefined,
            core,
        };
        runtime.build_core();
        debug!(nodes = runtime.arena.len(), "booted core hierarchy");
        runtime
    }

    fn build_core(&self) {
        let core = self.core;
        let mut graph = self.lock_hierarchy();
        let basic_object = self.alloc_node(NodeKind::Class, None);
        let object = self.alloc_subclass(&mut graph, basic_object);
        let module = self.alloc_subclass(&mut graph, object);
        let class = self.alloc_subclass(&mut graph, module);
        let kernel = self.alloc_node(NodeKind::Module, None);
        debug_assert_eq!(
            [basic_object, object, module, class, kernel],
            [
                core.basic_object,
                core.object,
                core.module,
                core.class,
                core.kernel
            ]
        );
        let leaves = [
            core.nil_class,
            core.true_class,
            core.false_class,
            core.integer,
            core.string,
            core.symbol,
        ];
        for expected in leaves {
            let id = self.alloc_subclass(&mut graph, object);
            debug_assert_eq!(id, expected);
        }
        if let Err(error) = self.include_locked(&mut graph, object, kernel) {
            panic!("booting core hierarchy: {error}");
        }
        drop(graph);

        let root_name = self.config.root_name.clone();
        let names = [
            ("BasicObject", basic_object),
            (root_name.as_str(), object),
            ("Module", module),
            ("Class", class),
            ("Kernel", kernel),
            ("NilClass", core.nil_class),
            ("TrueClass", core.true_class),
            ("FalseClass", core.false_class),
            ("Integer", core.integer),
            ("String", core.string),
            ("Symbol", core.symbol),
        ];
        for (name, id) in names {
            let symbol = self.intern(name);
            self.node(id).write().base_name = Some(Arc::from(name));
            self.store_constant(object, symbol, Value::Module(id));
        }
        self.define_core_methods();
    }

    /// Ends the bootstrap phase; method lookups are cached from here on.
    pub fn finish_boot(&self) {
        if self.booting.swap(false, Ordering::AcqRel) {
            debug!("bootstrap finished, method caching enabled");
        }
    }

    pub fn is_booting(&self) -> bool {
        self.booting.load(Ordering::Acquire)
    }

    pub fn core(&self) -> CoreNodes {
        self.core
    }

    pub fn object(&self) -> NodeId {
        self.core.object
    }

    pub fn basic_object(&self) -> NodeId {
        self.core.basic_object
    }

    pub fn kernel(&self) -> NodeId {
        self.core.kernel
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn intern(&self, name: &str) -> Symbol {
        self.symbols.intern(name)
    }

    pub fn kind(&self, id: NodeId) -> NodeKind {
        self.node(id).kind
    }

    /// Current generation of `id`; cache entries tagged with another value are stale.
    pub fn generation(&self, id: NodeId) -> u64 {
        self.node(id).generation()
    }

    /// Number of method-cache slots populated on `id`.
    pub fn cached_method_count(&self, id: NodeId) -> usize {
        self.node(id).cache_len()
    }

    pub fn node_count(&self) -> usize {
        self.arena.len()
    }

    pub(crate) fn node(&self, id: NodeId) -> Arc<Node> {
        self.arena.get(id)
    }

    pub(crate) fn undefined(&self) -> &MethodEntry {
        &self.undefined
    }

    pub(crate) fn lock_hierarchy(&self) -> MutexGuard<'_, SubscriberGraph> {
        self.hierarchy.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn lock_definitions(&self) -> MutexGuard<'_, ()> {
        self.definitions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn next_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub(crate) fn superclass_link(&self, id: NodeId) -> Option<NodeId> {
        self.node(id).read().superclass
    }

    pub(crate) fn method_location(&self, id: NodeId) -> NodeId {
        self.node(id).read().method_location
    }

    /// Allocates a node with the configured cache-entry factory chain.
    pub(crate) fn alloc_node(&self, kind: NodeKind, superclass: Option<NodeId>) -> NodeId {
        let generation = self.next_generation();
        let mut factory: Arc<dyn CacheEntryFactory> = Arc::new(DefaultCacheEntryFactory);
        let mut profile = None;
        if matches!(kind, NodeKind::Class | NodeKind::Module) {
            if self.config.synchronize_new_classes && kind == NodeKind::Class {
                factory = Arc::new(SynchronizedCacheEntryFactory::new(factory));
            }
            if self.config.profile_methods {
                let collected = Arc::new(CallProfile::default());
                factory = Arc::new(ProfilingCacheEntryFactory::new(
                    factory,
                    Arc::clone(&collected),
                ));
                profile = Some(collected);
            }
        }
        self.arena.alloc(|id| {
            let mut state = NodeState::new(id, superclass, factory);
            state.profile = profile;
            Node::new(id, kind, generation, state)
        })
    }

    pub(crate) fn alloc_subclass(&self, graph: &mut SubscriberGraph, superclass: NodeId) -> NodeId {
        let id = self.alloc_node(NodeKind::Class, Some(superclass));
        graph.subscribe(superclass, id);
        id
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}
