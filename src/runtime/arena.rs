use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use arc_swap::ArcSwap;

use crate::runtime::node::Node;

/// Handle to a hierarchy node owned by a runtime's arena.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub(crate) u32);

impl NodeId {
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }

    pub fn raw(self) -> u32 {
        self.0
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.0)
    }
}

/// Append-only node storage. Nodes are never freed before the runtime is dropped.
///
/// Readers load the current node table without locking; allocation publishes
/// a grown copy. Allocations are serialized on `grow`.
pub(crate) struct Arena {
    nodes: ArcSwap<Vec<Arc<Node>>>,
    grow: Mutex<()>,
}

impl Arena {
    pub(crate) fn new() -> Self {
        Self {
            nodes: ArcSwap::from_pointee(Vec::new()),
            grow: Mutex::new(()),
        }
    }

    /// Allocates a node built from its freshly assigned id.
    pub(crate) fn alloc(&self, build: impl FnOnce(NodeId) -> Node) -> NodeId {
        let _grow = self.grow.lock().unwrap_or_else(PoisonError::into_inner);
        let current = self.nodes.load_full();
        let id = NodeId(u32::try_from(current.len()).unwrap_or_else(|_| {
            panic!("node arena exhausted at {} nodes", current.len())
        }));
        let mut grown = Vec::with_capacity(current.len() + 1);
        grown.extend(current.iter().cloned());
        grown.push(Arc::new(build(id)));
        self.nodes.store(Arc::new(grown));
        id
    }

    pub(crate) fn get(&self, id: NodeId) -> Arc<Node> {
        match self.nodes.load().get(id.index()) {
            Some(node) => Arc::clone(node),
            None => panic!("unknown node id {}", id.0),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.nodes.load().len()
    }
}
