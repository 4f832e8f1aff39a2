use std::fmt;
use std::sync::Arc;

use crate::runtime::Runtime;
use crate::runtime::arena::NodeId;
use crate::runtime::context::CallContext;
use crate::runtime::error::{ModelError, ModelResult};
use crate::runtime::value::Value;
use crate::symbol::Symbol;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Visibility {
    Public,
    Protected,
    Private,
}

impl Visibility {
    pub fn label(self) -> &'static str {
        match self {
            Visibility::Public => "public",
            Visibility::Protected => "protected",
            Visibility::Private => "private",
        }
    }
}

/// Everything a method body sees when it runs.
pub struct Invocation<'a> {
    pub runtime: &'a Runtime,
    pub context: &'a dyn CallContext,
    pub receiver: &'a Value,
    /// The node whose table holds the running implementation.
    pub owner: NodeId,
    pub name: &'a Symbol,
    pub args: &'a [Value],
    pub block: Option<&'a Value>,
}

impl Invocation<'_> {
    /// Resolves and invokes the next implementation above `owner`.
    pub fn call_super(&self, args: &[Value]) -> ModelResult<Value> {
        self.runtime.call_super(self, args)
    }
}

/// An executable method implementation supplied by the embedding runtime.
pub trait MethodBody: Send + Sync {
    fn call(&self, invocation: &Invocation<'_>) -> ModelResult<Value>;

    /// Required argument count, when fixed.
    fn arity(&self) -> Option<usize> {
        None
    }
}

type NativeFn = dyn Fn(&Invocation<'_>) -> ModelResult<Value> + Send + Sync;

/// Closure-backed method body.
pub struct NativeMethod {
    arity: Option<usize>,
    function: Box<NativeFn>,
}

impl NativeMethod {
    pub fn new<F>(function: F) -> Arc<dyn MethodBody>
    where
        F: Fn(&Invocation<'_>) -> ModelResult<Value> + Send + Sync + 'static,
    {
        Arc::new(Self {
            arity: None,
            function: Box::new(function),
        })
    }

    pub fn with_arity<F>(arity: usize, function: F) -> Arc<dyn MethodBody>
    where
        F: Fn(&Invocation<'_>) -> ModelResult<Value> + Send + Sync + 'static,
    {
        Arc::new(Self {
            arity: Some(arity),
            function: Box::new(function),
        })
    }

    /// A body that ignores its arguments and returns `value`.
    pub fn returning(value: Value) -> Arc<dyn MethodBody> {
        Self::new(move |_| Ok(value.clone()))
    }
}

impl MethodBody for NativeMethod {
    fn call(&self, invocation: &Invocation<'_>) -> ModelResult<Value> {
        if let Some(expected) = self.arity {
            ModelError::expect_arity(invocation.name.as_str(), expected, invocation.args.len())?;
        }
        (self.function)(invocation)
    }

    fn arity(&self) -> Option<usize> {
        self.arity
    }
}

#[derive(Clone)]
pub(crate) enum MethodKind {
    Body(Arc<dyn MethodBody>),
    /// Stops lookup; produced by `undef_method` and used as the miss sentinel.
    Undefined,
    /// Placeholder installed on a refined node; `original` is the entry it replaced.
    Refined { original: Option<MethodEntry> },
    Alias { target: MethodEntry },
}

struct EntryData {
    name: Symbol,
    owner: NodeId,
    visibility: Visibility,
    builtin: bool,
    kind: MethodKind,
}

/// Immutable method-table entry. Cloning shares the underlying record.
#[derive(Clone)]
pub struct MethodEntry(Arc<EntryData>);

impl MethodEntry {
    pub(crate) fn new(
        name: Symbol,
        owner: NodeId,
        visibility: Visibility,
        builtin: bool,
        kind: MethodKind,
    ) -> Self {
        Self(Arc::new(EntryData {
            name,
            owner,
            visibility,
            builtin,
            kind,
        }))
    }

    pub(crate) fn undefined(name: Symbol, owner: NodeId) -> Self {
        Self::new(name, owner, Visibility::Public, false, MethodKind::Undefined)
    }

    pub fn name(&self) -> &Symbol {
        &self.0.name
    }

    pub fn owner(&self) -> NodeId {
        self.0.owner
    }

    pub fn visibility(&self) -> Visibility {
        self.0.visibility
    }

    pub fn is_builtin(&self) -> bool {
        self.0.builtin
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self.0.kind, MethodKind::Undefined)
    }

    pub fn is_refined(&self) -> bool {
        matches!(self.0.kind, MethodKind::Refined { .. })
    }

    pub fn is_alias(&self) -> bool {
        matches!(self.0.kind, MethodKind::Alias { .. })
    }

    pub(crate) fn kind(&self) -> &MethodKind {
        &self.0.kind
    }

    /// The entry a refined marker replaced, if any.
    pub(crate) fn refined_original(&self) -> Option<&MethodEntry> {
        match &self.0.kind {
            MethodKind::Refined { original } => original.as_ref(),
            _ => None,
        }
    }

    pub fn ptr_eq(&self, other: &MethodEntry) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Same implementation and owner under another visibility.
    pub(crate) fn with_visibility(&self, visibility: Visibility) -> Self {
        Self::new(
            self.0.name.clone(),
            self.0.owner,
            visibility,
            self.0.builtin,
            self.0.kind.clone(),
        )
    }

    /// Rebuilds this entry with every executable body passed through `wrap`.
    pub(crate) fn map_body(
        &self,
        wrap: &dyn Fn(&Symbol, Arc<dyn MethodBody>) -> Arc<dyn MethodBody>,
    ) -> Self {
        let kind = match &self.0.kind {
            MethodKind::Body(body) => MethodKind::Body(wrap(&self.0.name, Arc::clone(body))),
            MethodKind::Alias { target } => MethodKind::Alias {
                target: target.map_body(wrap),
            },
            MethodKind::Undefined | MethodKind::Refined { .. } => return self.clone(),
        };
        Self::new(
            self.0.name.clone(),
            self.0.owner,
            self.0.visibility,
            self.0.builtin,
            kind,
        )
    }
}

impl fmt::Debug for MethodEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match &self.0.kind {
            MethodKind::Body(_) => "body",
            MethodKind::Undefined => "undefined",
            MethodKind::Refined { .. } => "refined",
            MethodKind::Alias { .. } => "alias",
        };
        f.debug_struct("MethodEntry")
            .field("name", &self.0.name)
            .field("owner", &self.0.owner)
            .field("visibility", &self.0.visibility)
            .field("kind", &kind)
            .finish()
    }
}
