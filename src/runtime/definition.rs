use std::sync::Arc;

use tracing::debug;

use crate::runtime::Runtime;
use crate::runtime::arena::NodeId;
use crate::runtime::error::{ModelError, ModelResult};
use crate::runtime::identifier;
use crate::runtime::invalidator::SubscriberGraph;
use crate::runtime::node::NodeKind;
use crate::runtime::value::Value;
use crate::symbol::Symbol;

impl Runtime {
    /// Defines class `name` under `under` (the root namespace when `None`),
    /// or reopens it if the constant already names a class.
    pub fn define_class(
        &self,
        name: &str,
        superclass: Option<NodeId>,
        under: Option<NodeId>,
    ) -> ModelResult<NodeId> {
        let namespace = under.unwrap_or(self.object());
        let symbol = identifier::constant_name(self, name)?;
        let reopen = |existing: Value| {
            let Some(id) = existing.as_module().filter(|&id| self.kind(id) == NodeKind::Class)
            else {
                return Err(ModelError::NotAClass {
                    name: self.qualified_name(namespace, name),
                });
            };
            if let Some(expected) = superclass
                && self.superclass(id) != Some(expected)
            {
                return Err(ModelError::SuperclassMismatch {
                    name: self.name(id),
                });
            }
            Ok(id)
        };
        let (id, created) =
            self.reopen_or_create(namespace, symbol, reopen, || self.new_class(superclass))?;
        if created {
            debug!(class = %self.name(id), "defined class");
        }
        Ok(id)
    }

    /// Defines module `name` under `under`, or reopens an existing one.
    pub fn define_module(&self, name: &str, under: Option<NodeId>) -> ModelResult<NodeId> {
        let namespace = under.unwrap_or(self.object());
        let symbol = identifier::constant_name(self, name)?;
        let reopen = |existing: Value| {
            existing
                .as_module()
                .filter(|&id| self.kind(id) == NodeKind::Module)
                .ok_or_else(|| ModelError::NotAModule {
                    name: self.qualified_name(namespace, name),
                })
        };
        let (id, created) =
            self.reopen_or_create(namespace, symbol, reopen, || Ok(self.new_module()))?;
        if created {
            debug!(module = %self.name(id), "defined module");
        }
        Ok(id)
    }

    /// Reopens the node bound to `symbol` in `namespace`, or creates and binds
    /// a new one. Pending autoloads resolve before the definitions lock is
    /// taken; creation and binding happen under it, so concurrent definitions
    /// of one name agree on a single node.
    fn reopen_or_create<R, C>(
        &self,
        namespace: NodeId,
        symbol: Symbol,
        reopen: R,
        create: C,
    ) -> ModelResult<(NodeId, bool)>
    where
        R: Fn(Value) -> ModelResult<NodeId>,
        C: FnOnce() -> ModelResult<NodeId>,
    {
        if let Some(existing) = self.own_constant_value(namespace, &symbol)? {
            return reopen(existing).map(|id| (id, false));
        }
        let _definitions = self.lock_definitions();
        if let Some(existing) = self.bound_constant(namespace, &symbol) {
            return reopen(existing).map(|id| (id, false));
        }
        let id = create()?;
        self.const_set_symbol(namespace, symbol, Value::Module(id))?;
        Ok((id, true))
    }

    /// Creates an anonymous class; it is named when first assigned to a constant.
    pub fn new_class(&self, superclass: Option<NodeId>) -> ModelResult<NodeId> {
        let superclass = superclass.unwrap_or(self.object());
        match self.kind(superclass) {
            NodeKind::Class => {}
            NodeKind::Singleton { .. } => {
                return Err(ModelError::InvalidArgument {
                    operation: "class definition".to_string(),
                    message: "can't make subclass of singleton class".to_string(),
                });
            }
            other => {
                return Err(ModelError::WrongArgumentType {
                    found: self.type_label(other).to_string(),
                    expected: "Class".to_string(),
                });
            }
        }
        let mut graph = self.lock_hierarchy();
        Ok(self.alloc_subclass(&mut graph, superclass))
    }

    pub fn new_module(&self) -> NodeId {
        self.alloc_node(NodeKind::Module, None)
    }

    /// The singleton class of `id`, created on first use.
    pub fn singleton_class(&self, id: NodeId) -> NodeId {
        if let Some(singleton) = self.node(id).read().singleton {
            return singleton;
        }
        let mut graph = self.lock_hierarchy();
        self.singleton_class_locked(&mut graph, id)
    }

    pub(crate) fn singleton_class_locked(&self, graph: &mut SubscriberGraph, id: NodeId) -> NodeId {
        let node = self.node(id);
        if let Some(singleton) = node.read().singleton {
            return singleton;
        }
        let superclass = match node.kind {
            NodeKind::Class | NodeKind::Singleton { .. } => match self.superclass(id) {
                Some(parent) => self.singleton_class_locked(graph, parent),
                None => self.core().class,
            },
            _ => self.core().module,
        };
        let singleton = self.alloc_node(NodeKind::Singleton { attached: id }, Some(superclass));
        graph.subscribe(superclass, singleton);
        node.write().singleton = Some(singleton);
        singleton
    }

    /// The class that method calls on `value` resolve against.
    pub fn class_of(&self, value: &Value) -> NodeId {
        let core = self.core();
        match value {
            Value::Nil => core.nil_class,
            Value::Bool(true) => core.true_class,
            Value::Bool(false) => core.false_class,
            Value::Int(_) => core.integer,
            Value::Str(_) => core.string,
            Value::Sym(_) => core.symbol,
            Value::Module(id) => self.singleton_class(*id),
            Value::Object(instance) => instance.class(),
        }
    }

    pub fn new_instance(&self, class: NodeId) -> ModelResult<Value> {
        match self.kind(class) {
            NodeKind::Class => Ok(Value::instance_of(class)),
            NodeKind::Singleton { .. } => Err(ModelError::InvalidArgument {
                operation: "new".to_string(),
                message: "can't create instance of singleton class".to_string(),
            }),
            _ => Err(ModelError::NotAClass {
                name: self.name(class),
            }),
        }
    }

    pub fn freeze(&self, id: NodeId) {
        self.node(id).write().frozen = true;
    }

    pub fn is_frozen(&self, id: NodeId) -> bool {
        self.node(id).read().frozen
    }

    pub(crate) fn check_frozen(&self, id: NodeId) -> ModelResult<()> {
        if self.is_frozen(id) {
            return Err(ModelError::Frozen {
                kind: self.kind(id).label().to_string(),
                name: self.name(id),
            });
        }
        Ok(())
    }

    /// Records `name` and its namespace on an anonymous module.
    pub(crate) fn assign_name(&self, id: NodeId, namespace: NodeId, name: &str) {
        let node = self.node(id);
        let mut state = node.write();
        if state.base_name.is_none() {
            state.base_name = Some(Arc::from(name));
            state.parent = (namespace != self.object()).then_some(namespace);
        }
    }
}
