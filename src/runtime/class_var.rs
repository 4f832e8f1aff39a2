use rustc_hash::FxHashSet;

use crate::runtime::Runtime;
use crate::runtime::arena::NodeId;
use crate::runtime::error::{ModelError, ModelResult};
use crate::runtime::identifier;
use crate::runtime::value::Value;
use crate::symbol::Symbol;

impl Runtime {
    /// Assigns `name` in the nearest ancestor that already defines it, or in `id`.
    pub fn class_variable_set(&self, id: NodeId, name: &str, value: Value) -> ModelResult<()> {
        let symbol = identifier::class_variable_name(self, name)?;
        // Held across lookup and write so racing first assignments land in one table.
        let _graph = self.lock_hierarchy();
        let owner = self.class_variable_owner(id, &symbol).unwrap_or(id);
        self.check_frozen(owner)?;
        self.node(owner).write().class_vars.insert(symbol, value);
        Ok(())
    }

    pub fn class_variable_get(&self, id: NodeId, name: &str) -> ModelResult<Value> {
        let symbol = identifier::class_variable_name(self, name)?;
        self.class_variable_owner(id, &symbol)
            .and_then(|owner| self.node(owner).read().class_vars.get(&symbol).cloned())
            .ok_or_else(|| ModelError::UninitializedClassVariable {
                name: name.to_string(),
                owner: self.name(id),
            })
    }

    pub fn class_variable_defined(&self, id: NodeId, name: &str) -> ModelResult<bool> {
        let symbol = identifier::class_variable_name(self, name)?;
        Ok(self.class_variable_owner(id, &symbol).is_some())
    }

    /// Removes `name` from `id`'s own table and returns its value.
    pub fn remove_class_variable(&self, id: NodeId, name: &str) -> ModelResult<Value> {
        let symbol = identifier::class_variable_name(self, name)?;
        self.check_frozen(id)?;
        let removed = self.node(id).write().class_vars.remove(&symbol);
        if let Some(value) = removed {
            return Ok(value);
        }
        let owner = self.name(id);
        Err(if self.class_variable_owner(id, &symbol).is_some() {
            ModelError::CannotRemoveClassVariable {
                name: name.to_string(),
                owner,
            }
        } else {
            ModelError::ClassVariableNotDefined {
                name: name.to_string(),
                owner,
            }
        })
    }

    /// Class variable names visible from `id`, sorted.
    pub fn class_variables(&self, id: NodeId, inherit: bool) -> Vec<Symbol> {
        let owners = if inherit { self.ancestors(id) } else { vec![id] };
        let mut seen = FxHashSet::default();
        let mut names = owners
            .into_iter()
            .flat_map(|owner| {
                self.node(owner)
                    .read()
                    .class_vars
                    .iter()
                    .map(|(name, _)| name.clone())
                    .collect::<Vec<_>>()
            })
            .filter(|name| seen.insert(name.clone()))
            .collect::<Vec<_>>();
        names.sort();
        names
    }

    fn class_variable_owner(&self, id: NodeId, name: &Symbol) -> Option<NodeId> {
        self.ancestors(id)
            .into_iter()
            .find(|&owner| self.node(owner).read().class_vars.contains_key(name))
    }
}

#[cfg(test)]
mod tests {
    use crate::runtime::Runtime;
    use crate::runtime::error::ModelError;
    use crate::runtime::value::Value;

    #[test]
    fn assignment_updates_defining_ancestor() {
        let runtime = Runtime::new();
        let base = runtime.define_class("Base", None, None).expect("Base");
        let child = runtime.define_class("Child", Some(base), None).expect("Child");
        runtime
            .class_variable_set(base, "@@count", Value::Int(1))
            .expect("set on Base");
        runtime
            .class_variable_set(child, "@@count", Value::Int(2))
            .expect("set through Child");
        assert_eq!(
            runtime.class_variable_get(base, "@@count").expect("shared"),
            Value::Int(2)
        );
        assert!(runtime.class_variables(child, false).is_empty());
        assert_eq!(runtime.class_variables(child, true).len(), 1);
        assert_eq!(
            runtime.remove_class_variable(child, "@@count"),
            Err(ModelError::CannotRemoveClassVariable {
                name: "@@count".to_string(),
                owner: "Child".to_string()
            })
        );
        assert_eq!(
            runtime.remove_class_variable(base, "@@count").expect("remove"),
            Value::Int(2)
        );
        assert_eq!(
            runtime.remove_class_variable(base, "@@count"),
            Err(ModelError::ClassVariableNotDefined {
                name: "@@count".to_string(),
                owner: "Base".to_string()
            })
        );
    }

    #[test]
    fn module_class_variables_are_shared_with_includers() {
        let runtime = Runtime::new();
        let m = runtime.define_module("Config", None).expect("Config");
        let a = runtime.define_class("A", None, None).expect("A");
        runtime.include_module(a, m).expect("include");
        runtime
            .class_variable_set(m, "@@level", Value::str("debug"))
            .expect("set");
        assert!(runtime.class_variable_defined(a, "@@level").expect("defined"));
        assert_eq!(
            runtime.class_variable_get(a, "@@missing"),
            Err(ModelError::UninitializedClassVariable {
                name: "@@missing".to_string(),
                owner: "A".to_string()
            })
        );
        assert_eq!(
            runtime.class_variable_set(a, "count", Value::Nil),
            Err(ModelError::WrongClassVariableName {
                name: "count".to_string()
            })
        );
    }
}
