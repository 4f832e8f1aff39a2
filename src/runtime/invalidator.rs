use rustc_hash::{FxHashMap, FxHashSet};
use tracing::debug;

use crate::runtime::Runtime;
use crate::runtime::arena::NodeId;

/// Reverse edges from a node to every node whose lookups depend on it:
/// classes and modules that include or prepend it, and direct subclasses.
///
/// Lives under the runtime's hierarchy lock.
#[derive(Debug, Default)]
pub(crate) struct SubscriberGraph {
    edges: FxHashMap<NodeId, FxHashSet<NodeId>>,
}

impl SubscriberGraph {
    pub(crate) fn subscribe(&mut self, source: NodeId, subscriber: NodeId) {
        if source != subscriber {
            self.edges.entry(source).or_default().insert(subscriber);
        }
    }

    pub(crate) fn subscribers(&self, source: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        self.edges.get(&source).into_iter().flatten().copied()
    }

    /// `root` and every node transitively subscribed to it.
    pub(crate) fn closure(&self, root: NodeId) -> Vec<NodeId> {
        let mut seen = FxHashSet::default();
        let mut pending = vec![root];
        let mut ordered = Vec::new();
        while let Some(id) = pending.pop() {
            if !seen.insert(id) {
                continue;
            }
            ordered.push(id);
            pending.extend(self.subscribers(id));
        }
        ordered
    }
}

impl Runtime {
    /// Retires every cache entry that could observe a change to `root`.
    ///
    /// One fresh generation is drawn and stored on `root`, its method
    /// location, and its whole subscriber closure.
    pub(crate) fn invalidate(&self, graph: &SubscriberGraph, root: NodeId) {
        let affected = graph.closure(root);
        let generation = self.next_generation();
        for &id in &affected {
            let node = self.node(id);
            node.set_generation(generation);
            let location = node.read().method_location;
            if location != id {
                self.node(location).set_generation(generation);
            }
        }
        debug!(
            root = root.raw(),
            nodes = affected.len(),
            generation,
            "invalidated method caches"
        );
    }

    /// Number of nodes a change to `id` would invalidate, `id` included.
    pub fn subscriber_closure_len(&self, id: NodeId) -> usize {
        self.lock_hierarchy().closure(id).len()
    }
}
