use rustc_hash::FxHashSet;
use tracing::warn;

use crate::runtime::Runtime;
use crate::runtime::arena::NodeId;
use crate::runtime::context::Scope;
use crate::runtime::error::{ModelError, ModelResult};
use crate::runtime::identifier;
use crate::runtime::node::NodeKind;
use crate::runtime::value::Value;
use crate::symbol::Symbol;

/// A constant-table slot.
#[derive(Debug, Clone)]
pub(crate) struct ConstantEntry {
    /// `None` marks a pending autoload; the record lives in the node's autoload table.
    pub(crate) value: Option<Value>,
    pub(crate) hidden: bool,
    pub(crate) deprecated: bool,
}

impl ConstantEntry {
    pub(crate) fn new(value: Option<Value>) -> Self {
        Self {
            value,
            hidden: false,
            deprecated: false,
        }
    }
}

/// Whether hidden (private) constants may be returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Access {
    Qualified,
    Lexical,
    /// Hidden constants are visible only in the node the lookup starts at.
    Receiver,
}

impl Access {
    /// The access applied to `owner`'s table in a lookup that started at `start`.
    fn at(self, start: NodeId, owner: NodeId) -> Access {
        match self {
            Access::Receiver if owner == start => Access::Lexical,
            Access::Receiver => Access::Qualified,
            other => other,
        }
    }
}

impl Runtime {
    /// Writes `value` under `name` without validation, keeping existing flags.
    pub(crate) fn store_constant(&self, id: NodeId, name: Symbol, value: Value) {
        let node = self.node(id);
        let mut state = node.write();
        match state.constants.get_mut(&name) {
            Some(entry) => entry.value = Some(value),
            None => {
                state.constants.insert(name, ConstantEntry::new(Some(value)));
            }
        }
    }

    /// `id`'s own binding for `name`, resolving a pending autoload.
    pub(crate) fn own_constant_value(&self, id: NodeId, name: &Symbol) -> ModelResult<Option<Value>> {
        let entry = self.node(id).read().constants.get(name).cloned();
        match entry {
            None => Ok(None),
            Some(ConstantEntry { value: Some(value), .. }) => Ok(Some(value)),
            Some(ConstantEntry { value: None, .. }) => self.resolve_autoload(id, name),
        }
    }

    pub fn const_set(&self, id: NodeId, name: &str, value: Value) -> ModelResult<()> {
        let symbol = identifier::constant_name(self, name)?;
        self.const_set_symbol(id, symbol, value)
    }

    pub(crate) fn const_set_symbol(&self, id: NodeId, name: Symbol, value: Value) -> ModelResult<()> {
        self.check_frozen(id)?;
        if !self.set_autoloading_value(id, &name, &value) {
            let redefined = {
                let node = self.node(id);
                let mut state = node.write();
                match state.constants.get_mut(&name) {
                    Some(entry) => {
                        let redefined = entry.value.is_some();
                        entry.value = Some(value.clone());
                        if !redefined {
                            state.autoloads.remove(&name);
                        }
                        redefined
                    }
                    None => {
                        state
                            .constants
                            .insert(name.clone(), ConstantEntry::new(Some(value.clone())));
                        false
                    }
                }
            };
            if redefined && self.config.warn_on_constant_redefinition {
                warn!(
                    constant = %self.qualified_name(id, name.as_str()),
                    "already initialized constant"
                );
            }
        }
        if let Some(module) = value.as_module()
            && module != id
            && matches!(self.kind(module), NodeKind::Class | NodeKind::Module)
        {
            self.assign_name(module, id, name.as_str());
        }
        Ok(())
    }

    /// Resolves a possibly qualified path (`A::B`, `::A`) from `id`.
    ///
    /// Each segment searches the current node's ancestors and, for modules,
    /// the root namespace. Hidden constants are rejected, except those the
    /// first segment finds in `id` itself.
    pub fn const_get(&self, id: NodeId, path: &str) -> ModelResult<Value> {
        let (mut current, rest, mut access) = match path.strip_prefix("::") {
            Some(rest) => (self.object(), rest, Access::Qualified),
            None => (id, path, Access::Receiver),
        };
        let segments = rest.split("::").collect::<Vec<_>>();
        for (index, segment) in segments.iter().enumerate() {
            let symbol = identifier::constant_name(self, segment)?;
            let found = self.lookup_constant(current, &symbol, access)?;
            access = Access::Qualified;
            let Some(value) = found else {
                return Err(ModelError::UninitializedConstant {
                    name: self.qualified_name(current, segment),
                });
            };
            if index + 1 == segments.len() {
                return Ok(value);
            }
            current = value
                .as_module()
                .filter(|&module| self.kind(module).is_class() || self.kind(module).is_module())
                .ok_or_else(|| ModelError::NotAClassOrModule {
                    name: segments[..=index].join("::"),
                })?;
        }
        Err(ModelError::WrongConstantName {
            name: path.to_string(),
        })
    }

    /// Unqualified lookup from code running in `scope`: enclosing crefs
    /// first, then the innermost cref's ancestors, then the root namespace.
    /// Hidden constants are visible.
    pub fn const_get_lexical(&self, scope: &Scope, name: &str) -> ModelResult<Value> {
        let symbol = identifier::constant_name(self, name)?;
        for enclosing in scope.iter() {
            if let Some(value) = self.constant_in(enclosing.cref(), &symbol, Access::Lexical)? {
                return Ok(value);
            }
        }
        match self.lookup_constant(scope.cref(), &symbol, Access::Lexical)? {
            Some(value) => Ok(value),
            None => Err(ModelError::UninitializedConstant {
                name: self.qualified_name(scope.cref(), name),
            }),
        }
    }

    fn lookup_constant(&self, start: NodeId, name: &Symbol, access: Access) -> ModelResult<Option<Value>> {
        for ancestor in self.ancestors(start) {
            if let Some(value) = self.constant_in(ancestor, name, access.at(start, ancestor))? {
                return Ok(Some(value));
            }
        }
        if !self.kind(start).is_class() {
            for ancestor in self.ancestors(self.object()) {
                if let Some(value) = self.constant_in(ancestor, name, access.at(start, ancestor))? {
                    return Ok(Some(value));
                }
            }
        }
        Ok(None)
    }

    fn constant_in(&self, owner: NodeId, name: &Symbol, access: Access) -> ModelResult<Option<Value>> {
        let Some(entry) = self.node(owner).read().constants.get(name).cloned() else {
            return Ok(None);
        };
        if entry.hidden && access == Access::Qualified {
            return Err(ModelError::PrivateConstant {
                name: self.qualified_name(owner, name.as_str()),
            });
        }
        if entry.deprecated {
            warn!(constant = %self.qualified_name(owner, name.as_str()), "constant is deprecated");
        }
        match entry.value {
            Some(value) => Ok(Some(value)),
            None => self.resolve_autoload(owner, name),
        }
    }

    /// Whether `path` resolves from `id`. Pending autoloads count as defined
    /// and are not triggered; hidden constants count as defined.
    pub fn const_defined(&self, id: NodeId, path: &str) -> ModelResult<bool> {
        let (namespace, last) = match path.rsplit_once("::") {
            Some(("", last)) => (self.object(), last),
            Some((prefix, last)) => {
                let namespace = self.const_get(id, prefix)?;
                let namespace = namespace
                    .as_module()
                    .ok_or_else(|| ModelError::NotAClassOrModule {
                        name: prefix.to_string(),
                    })?;
                (namespace, last)
            }
            None => (id, path),
        };
        let symbol = identifier::constant_name(self, last)?;
        let mut owners = self.ancestors(namespace);
        if !self.kind(namespace).is_class() {
            owners.extend(self.ancestors(self.object()));
        }
        Ok(owners
            .into_iter()
            .any(|owner| self.node(owner).read().constants.contains_key(&symbol)))
    }

    /// Removes `name` from `id`'s own table, returning its value (nil for a
    /// pending autoload).
    pub fn remove_const(&self, id: NodeId, name: &str) -> ModelResult<Value> {
        let symbol = identifier::constant_name(self, name)?;
        self.check_frozen(id)?;
        let removed = {
            let node = self.node(id);
            let mut state = node.write();
            let removed = state.constants.remove(&symbol);
            if removed.is_some() {
                state.autoloads.remove(&symbol);
            }
            removed
        };
        if let Some(entry) = removed {
            return Ok(entry.value.unwrap_or(Value::Nil));
        }
        let inherited = self
            .ancestors(id)
            .into_iter()
            .skip(1)
            .any(|owner| self.node(owner).read().constants.contains_key(&symbol));
        let name = self.qualified_name(id, name);
        Err(if inherited {
            ModelError::CannotRemoveConstant { name }
        } else {
            ModelError::ConstantNotDefined { name }
        })
    }

    pub fn private_constant(&self, id: NodeId, names: &[&str]) -> ModelResult<()> {
        self.update_constant_flags(id, names, |entry| entry.hidden = true)
    }

    pub fn public_constant(&self, id: NodeId, names: &[&str]) -> ModelResult<()> {
        self.update_constant_flags(id, names, |entry| entry.hidden = false)
    }

    pub fn deprecate_constant(&self, id: NodeId, names: &[&str]) -> ModelResult<()> {
        self.update_constant_flags(id, names, |entry| entry.deprecated = true)
    }

    fn update_constant_flags(
        &self,
        id: NodeId,
        names: &[&str],
        update: impl Fn(&mut ConstantEntry),
    ) -> ModelResult<()> {
        let symbols = names
            .iter()
            .map(|name| identifier::constant_name(self, name))
            .collect::<ModelResult<Vec<_>>>()?;
        self.check_frozen(id)?;
        let node = self.node(id);
        let mut state = node.write();
        if let Some(missing) = symbols.iter().find(|symbol| !state.constants.contains_key(symbol)) {
            let missing = missing.clone();
            drop(state);
            return Err(ModelError::ConstantNotDefined {
                name: self.qualified_name(id, missing.as_str()),
            });
        }
        for symbol in &symbols {
            if let Some(entry) = state.constants.get_mut(symbol) {
                update(entry);
            }
        }
        Ok(())
    }

    /// Public constant names of `id`, sorted. With `inherit`, ancestors are
    /// included, except the root namespace and above when `id` is not the root.
    pub fn constants(&self, id: NodeId, inherit: bool) -> Vec<Symbol> {
        let owners = if inherit {
            let root = self.object();
            let mut owners = Vec::new();
            for owner in self.ancestors(id) {
                if owner == root && id != root {
                    break;
                }
                owners.push(owner);
            }
            owners
        } else {
            vec![id]
        };
        let mut seen = FxHashSet::default();
        let mut names = Vec::new();
        for owner in owners {
            let node = self.node(owner);
            let state = node.read();
            for (name, entry) in state.constants.iter() {
                if !entry.hidden && seen.insert(name.clone()) {
                    names.push(name.clone());
                }
            }
        }
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use crate::runtime::Runtime;
    use crate::runtime::context::Scope;
    use crate::runtime::error::{ErrorKind, ModelError};
    use crate::runtime::value::Value;

    #[test]
    fn resolves_qualified_paths() {
        let runtime = Runtime::new();
        let outer = runtime.define_module("Outer", None).expect("Outer");
        let inner = runtime.define_class("Inner", None, Some(outer)).expect("Inner");
        runtime.const_set(inner, "LIMIT", Value::Int(3)).expect("LIMIT");
        let object = runtime.object();
        assert_eq!(
            runtime.const_get(object, "Outer::Inner::LIMIT").expect("path"),
            Value::Int(3)
        );
        assert_eq!(
            runtime.const_get(inner, "::Outer").expect("absolute"),
            Value::Module(outer)
        );
        assert_eq!(
            runtime.const_get(outer, "String").expect("module falls back to root"),
            Value::Module(runtime.core().string)
        );
        assert_eq!(
            runtime.const_get(object, "Outer::Missing"),
            Err(ModelError::UninitializedConstant {
                name: "Outer::Missing".to_string()
            })
        );
        assert_eq!(
            runtime.const_get(object, "Outer::Inner::LIMIT::X"),
            Err(ModelError::NotAClassOrModule {
                name: "Outer::Inner::LIMIT".to_string()
            })
        );
        let error = runtime.const_get(object, "Outer::bad").expect_err("bad segment");
        assert_eq!(error.kind(), ErrorKind::Name);
    }

    #[test]
    fn constants_are_inherited() {
        let runtime = Runtime::new();
        let base = runtime.define_class("Base", None, None).expect("Base");
        let child = runtime.define_class("Child", Some(base), None).expect("Child");
        let m = runtime.define_module("Mixin", None).expect("Mixin");
        runtime.const_set(base, "FROM_BASE", Value::Int(1)).expect("set");
        runtime.const_set(m, "FROM_MIXIN", Value::Int(2)).expect("set");
        runtime.include_module(child, m).expect("include");
        assert_eq!(runtime.const_get(child, "FROM_BASE").expect("inherited"), Value::Int(1));
        assert_eq!(runtime.const_get(child, "FROM_MIXIN").expect("mixed in"), Value::Int(2));
        let names = runtime
            .constants(child, true)
            .into_iter()
            .map(|name| name.as_str().to_string())
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["FROM_BASE", "FROM_MIXIN"]);
        assert!(runtime.constants(child, false).is_empty());
        assert!(runtime.const_defined(child, "FROM_BASE").expect("defined"));
        assert!(!runtime.const_defined(child, "NOPE").expect("not defined"));
    }

    #[test]
    fn remove_distinguishes_inherited_from_absent() {
        let runtime = Runtime::new();
        let base = runtime.define_class("Base", None, None).expect("Base");
        let child = runtime.define_class("Child", Some(base), None).expect("Child");
        runtime.const_set(base, "X", Value::Int(1)).expect("set");
        assert_eq!(
            runtime.remove_const(child, "X"),
            Err(ModelError::CannotRemoveConstant {
                name: "Child::X".to_string()
            })
        );
        assert_eq!(
            runtime.remove_const(child, "Y"),
            Err(ModelError::ConstantNotDefined {
                name: "Child::Y".to_string()
            })
        );
        assert_eq!(runtime.remove_const(base, "X").expect("remove"), Value::Int(1));
        assert!(!runtime.const_defined(base, "X").expect("gone"));
    }

    #[test]
    fn hidden_constants_are_lexical_only() {
        let runtime = Runtime::new();
        let outer = runtime.define_module("Outer", None).expect("Outer");
        runtime.const_set(outer, "SECRET", Value::Int(7)).expect("set");
        runtime.private_constant(outer, &["SECRET"]).expect("private");
        assert_eq!(
            runtime.const_get(runtime.object(), "Outer::SECRET"),
            Err(ModelError::PrivateConstant {
                name: "Outer::SECRET".to_string()
            })
        );
        let scope = Scope::top(runtime.object()).nest(outer);
        assert_eq!(
            runtime.const_get_lexical(&scope, "SECRET").expect("lexical"),
            Value::Int(7)
        );
        assert_eq!(runtime.const_get(outer, "SECRET").expect("own table"), Value::Int(7));
        let includer = runtime.define_class("Includer", None, None).expect("Includer");
        runtime.include_module(includer, outer).expect("include");
        assert_eq!(
            runtime.const_get(includer, "SECRET"),
            Err(ModelError::PrivateConstant {
                name: "Outer::SECRET".to_string()
            })
        );
        assert!(runtime.constants(outer, false).is_empty());
        runtime.public_constant(outer, &["SECRET"]).expect("public");
        assert_eq!(
            runtime.const_get(runtime.object(), "Outer::SECRET").expect("public again"),
            Value::Int(7)
        );
        assert_eq!(
            runtime.private_constant(outer, &["MISSING"]),
            Err(ModelError::ConstantNotDefined {
                name: "Outer::MISSING".to_string()
            })
        );
    }

    #[test]
    fn lexical_lookup_prefers_enclosing_scopes() {
        let runtime = Runtime::new();
        let outer = runtime.define_module("Outer", None).expect("Outer");
        let inner = runtime.define_class("Inner", None, Some(outer)).expect("Inner");
        runtime.const_set(outer, "LEVEL", Value::str("outer")).expect("set");
        runtime.const_set(runtime.object(), "LEVEL", Value::str("top")).expect("set");
        let scope = Scope::top(runtime.object()).nest(outer).nest(inner);
        assert_eq!(
            runtime.const_get_lexical(&scope, "LEVEL").expect("LEVEL"),
            Value::str("outer")
        );
        assert!(matches!(
            runtime.const_get_lexical(&scope, "UNKNOWN"),
            Err(ModelError::UninitializedConstant { .. })
        ));
    }

    #[test]
    fn redefinition_keeps_flags() {
        let runtime = Runtime::new();
        let m = runtime.define_module("M", None).expect("M");
        runtime.const_set(m, "OLD", Value::Int(1)).expect("set");
        runtime.deprecate_constant(m, &["OLD"]).expect("deprecate");
        runtime.const_set(m, "OLD", Value::Int(2)).expect("reassign");
        assert_eq!(runtime.const_get(m, "OLD").expect("still readable"), Value::Int(2));
        runtime.freeze(m);
        assert!(matches!(
            runtime.const_set(m, "NEW", Value::Nil),
            Err(ModelError::Frozen { .. })
        ));
    }
}
