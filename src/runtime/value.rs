use std::sync::Arc;

use crate::runtime::arena::NodeId;
use crate::symbol::Symbol;

/// Opaque values stored in constants and class variables and passed to method bodies.
#[derive(Debug, Clone)]
pub enum Value {
    Nil,
    Bool(bool),
    Int(i64),
    Str(Arc<str>),
    Sym(Symbol),
    /// A class or module object.
    Module(NodeId),
    /// A plain instance of a class.
    Object(Arc<Instance>),
}

#[derive(Debug)]
pub struct Instance {
    class: NodeId,
}

impl Instance {
    pub fn class(&self) -> NodeId {
        self.class
    }
}

impl Value {
    pub fn str(value: impl Into<Arc<str>>) -> Self {
        Value::Str(value.into())
    }

    pub(crate) fn instance_of(class: NodeId) -> Self {
        Value::Object(Arc::new(Instance { class }))
    }

    pub fn as_module(&self) -> Option<NodeId> {
        match self {
            Value::Module(id) => Some(*id),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(value) => Some(value),
            _ => None,
        }
    }

    pub fn is_truthy(&self) -> bool {
        !matches!(self, Value::Nil | Value::Bool(false))
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Nil, Value::Nil) => true,
            (Value::Bool(left), Value::Bool(right)) => left == right,
            (Value::Int(left), Value::Int(right)) => left == right,
            (Value::Str(left), Value::Str(right)) => left == right,
            (Value::Sym(left), Value::Sym(right)) => left == right,
            (Value::Module(left), Value::Module(right)) => left == right,
            (Value::Object(left), Value::Object(right)) => Arc::ptr_eq(left, right),
            _ => false,
        }
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::str(value)
    }
}
