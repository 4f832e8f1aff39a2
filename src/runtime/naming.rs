use crate::runtime::Runtime;
use crate::runtime::arena::NodeId;
use crate::runtime::node::NodeKind;
use crate::runtime::value::Value;

impl Runtime {
    /// Display name: `Outer::Inner` for named nodes, `#<Class:0x..>` for
    /// anonymous ones, `#<Class:Attached>` for singletons.
    pub fn name(&self, id: NodeId) -> String {
        let node = self.node(id);
        match node.kind {
            NodeKind::Wrapper { origin, .. } => self.name(origin),
            NodeKind::MethodLocation { owner } => self.name(owner),
            NodeKind::Singleton { attached } => format!("#<Class:{}>", self.name(attached)),
            NodeKind::Refinement { target, host } => {
                format!("#<refinement:{}@{}>", self.name(target), self.name(host))
            }
            NodeKind::Class | NodeKind::Module => {
                let (base_name, parent) = {
                    let state = node.read();
                    (state.base_name.clone(), state.parent)
                };
                match (base_name, parent) {
                    (Some(base), Some(parent)) => format!("{}::{}", self.name(parent), base),
                    (Some(base), None) => base.to_string(),
                    (None, _) => format!(
                        "#<{}:0x{:04x}>",
                        self.type_label(node.kind),
                        id.raw()
                    ),
                }
            }
        }
    }

    /// Whether `id` has been assigned a constant name.
    pub fn is_named(&self, id: NodeId) -> bool {
        let node = self.node(id);
        match node.kind {
            NodeKind::Class | NodeKind::Module => node.read().base_name.is_some(),
            _ => false,
        }
    }

    pub(crate) fn qualified_name(&self, namespace: NodeId, name: &str) -> String {
        if namespace == self.object() {
            name.to_string()
        } else {
            format!("{}::{}", self.name(namespace), name)
        }
    }

    pub(crate) fn type_label(&self, kind: NodeKind) -> &'static str {
        match kind {
            NodeKind::Module => "Module",
            NodeKind::Refinement { .. } => "Refinement",
            _ => "Class",
        }
    }

    /// Debug rendering of a value.
    pub fn inspect(&self, value: &Value) -> String {
        match value {
            Value::Nil => "nil".to_string(),
            Value::Bool(value) => value.to_string(),
            Value::Int(value) => value.to_string(),
            Value::Str(value) => format!("{value:?}"),
            Value::Sym(symbol) => format!(":{symbol}"),
            Value::Module(id) => self.name(*id),
            Value::Object(instance) => format!("#<{}>", self.name(instance.class())),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::runtime::Runtime;
    use crate::runtime::value::Value;

    #[test]
    fn names_anonymous_and_assigned_modules() {
        let runtime = Runtime::new();
        let anonymous = runtime.new_module();
        assert!(runtime.name(anonymous).starts_with("#<Module:0x"));
        assert!(!runtime.is_named(anonymous));
        let outer = runtime.define_module("Outer", None).expect("Outer");
        runtime
            .const_set(outer, "Named", Value::Module(anonymous))
            .expect("assign");
        assert_eq!(runtime.name(anonymous), "Outer::Named");
        runtime
            .const_set(runtime.object(), "Alias", Value::Module(anonymous))
            .expect("second assignment keeps first name");
        assert_eq!(runtime.name(anonymous), "Outer::Named");
    }

    #[test]
    fn inspects_values() {
        let runtime = Runtime::new();
        let a = runtime.define_class("A", None, None).expect("A");
        let instance = runtime.new_instance(a).expect("instance");
        assert_eq!(runtime.inspect(&Value::str("x")), "\"x\"");
        assert_eq!(runtime.inspect(&Value::Sym(runtime.intern("foo"))), ":foo");
        assert_eq!(runtime.inspect(&instance), "#<A>");
        assert_eq!(runtime.inspect(&Value::Nil), "nil");
    }
}
