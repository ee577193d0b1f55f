use super::Graph;
use crate::pool::MethodId;
use std::collections::HashMap;
use std::rc::Rc;

/// Caller-owned cache of built graphs, keyed by method handle.
///
/// The frontend holds no cross-compilation state of its own; a caller
/// that wants graph reuse passes a cache into `build_graph` and decides
/// its lifetime and eviction. Graphs containing deoptimize nodes are
/// never cached, since a later compilation with more resolved entries
/// would be strictly better.
pub struct GraphCache<'g> {
    graphs: HashMap<MethodId<'g>, Rc<Graph<'g>>>,
}

impl<'g> GraphCache<'g> {
    pub fn new() -> GraphCache<'g> {
        GraphCache {
            graphs: HashMap::new(),
        }
    }

    pub fn get(&self, method: MethodId<'g>) -> Option<Rc<Graph<'g>>> {
        self.graphs.get(&method).cloned()
    }

    pub fn insert(&mut self, method: MethodId<'g>, graph: Rc<Graph<'g>>) {
        self.graphs.insert(method, graph);
    }

    pub fn evict(&mut self, method: MethodId<'g>) {
        self.graphs.remove(&method);
    }

    pub fn len(&self) -> usize {
        self.graphs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.graphs.is_empty()
    }
}

impl<'g> Default for GraphCache<'g> {
    fn default() -> Self {
        GraphCache::new()
    }
}
