use std::sync::Arc;
use std::thread::{self, ThreadId};

use crate::runtime::arena::NodeId;

/// A lexical scope. `cref` is the class or module body the code was written in.
///
/// Scopes form a parent chain from innermost to the top level; refinement
/// activation and lexical constant lookup walk it outward.
#[derive(Debug)]
pub struct Scope {
    cref: NodeId,
    parent: Option<Arc<Scope>>,
}

impl Scope {
    pub fn top(cref: NodeId) -> Arc<Self> {
        Arc::new(Self { cref, parent: None })
    }

    pub fn nest(self: &Arc<Self>, cref: NodeId) -> Arc<Self> {
        Arc::new(Self {
            cref,
            parent: Some(Arc::clone(self)),
        })
    }

    pub fn cref(&self) -> NodeId {
        self.cref
    }

    pub fn parent(&self) -> Option<&Arc<Scope>> {
        self.parent.as_ref()
    }

    /// Iterates this scope and its parents, innermost first.
    pub fn iter(&self) -> impl Iterator<Item = &Scope> {
        std::iter::successors(Some(self), |scope| scope.parent.as_deref())
    }
}

/// Caller-side state handed to resolution and method bodies.
pub trait CallContext {
    fn current_scope(&self) -> &Scope;

    fn thread(&self) -> ThreadId {
        thread::current().id()
    }
}

/// A minimal context: one lexical scope on the current thread.
#[derive(Debug, Clone)]
pub struct Frame {
    scope: Arc<Scope>,
}

impl Frame {
    pub fn new(scope: Arc<Scope>) -> Self {
        Self { scope }
    }

    pub fn scope(&self) -> &Arc<Scope> {
        &self.scope
    }
}

impl CallContext for Frame {
    fn current_scope(&self) -> &Scope {
        &self.scope
    }
}

#[cfg(test)]
mod tests {
    use super::Scope;
    use crate::runtime::arena::NodeId;

    #[test]
    fn iterates_innermost_first() {
        let top = Scope::top(NodeId(1));
        let inner = top.nest(NodeId(7)).nest(NodeId(9));
        let crefs = inner.iter().map(Scope::cref).collect::<Vec<_>>();
        assert_eq!(crefs, vec![NodeId(9), NodeId(7), NodeId(1)]);
        assert_eq!(inner.parent().map(|scope| scope.cref()), Some(NodeId(7)));
    }
}
