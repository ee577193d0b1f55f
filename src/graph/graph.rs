use super::node::*;
use crate::Kind;
use std::collections::HashMap;

/// Container of IR nodes for one method.
///
/// Nodes live in an index arena and are referred to by [`NodeId`]; deleted
/// nodes keep their slot but are skipped by [`Graph::iter`]. Fixed nodes
/// are threaded through `next`/`predecessor` control edges plus the
/// explicit successor fields of the branching kinds; floating nodes hang
/// off their users through data edges only and are value-numbered by
/// [`Graph::unique`].
pub struct Graph<'g> {
    nodes: Vec<NodeData<'g>>,
    value_numbers: HashMap<NodeKind<'g>, NodeId>,
    start: NodeId,
}

impl<'g> Graph<'g> {
    pub fn new() -> Graph<'g> {
        let mut graph = Graph {
            nodes: Vec::new(),
            value_numbers: HashMap::new(),
            start: NodeId(0),
        };
        graph.start = graph.add(NodeKind::Start, Kind::Void);
        graph
    }

    pub fn start(&self) -> NodeId {
        self.start
    }

    /// Add a node without value numbering (fixed nodes, phis, frame
    /// states)
    pub fn add(&mut self, kind: NodeKind<'g>, result: Kind) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(NodeData {
            kind,
            result,
            next: None,
            predecessor: None,
            state_after: None,
            deleted: false,
        });
        id
    }

    /// Add a floating value node, reusing an existing structurally equal
    /// one
    pub fn unique(&mut self, kind: NodeKind<'g>, result: Kind) -> NodeId {
        debug_assert!(kind.is_floating(), "unique() is only for floating nodes");
        if let Some(&existing) = self.value_numbers.get(&kind) {
            return existing;
        }
        let id = self.add(kind.clone(), result);
        self.value_numbers.insert(kind, id);
        id
    }

    pub fn node(&self, id: NodeId) -> &NodeData<'g> {
        &self.nodes[id.index()]
    }

    pub fn kind(&self, id: NodeId) -> &NodeKind<'g> {
        &self.nodes[id.index()].kind
    }

    pub fn kind_mut(&mut self, id: NodeId) -> &mut NodeKind<'g> {
        &mut self.nodes[id.index()].kind
    }

    pub fn result_kind(&self, id: NodeId) -> Kind {
        self.nodes[id.index()].result
    }

    pub fn value(&self, id: NodeId) -> Value {
        Value {
            id,
            kind: self.result_kind(id),
        }
    }

    pub fn is_deleted(&self, id: NodeId) -> bool {
        self.nodes[id.index()].deleted
    }

    pub fn next(&self, id: NodeId) -> Option<NodeId> {
        self.nodes[id.index()].next
    }

    /// Link `from -> to` as the control successor, updating `to`'s
    /// predecessor
    pub fn set_next(&mut self, from: NodeId, to: NodeId) {
        self.nodes[from.index()].next = Some(to);
        self.nodes[to.index()].predecessor = Some(from);
    }

    pub fn predecessor(&self, id: NodeId) -> Option<NodeId> {
        self.nodes[id.index()].predecessor
    }

    pub fn state_after(&self, id: NodeId) -> Option<NodeId> {
        self.nodes[id.index()].state_after
    }

    pub fn set_state_after(&mut self, id: NodeId, state: NodeId) {
        debug_assert!(matches!(self.kind(state), NodeKind::FrameState(_)));
        self.nodes[id.index()].state_after = Some(state);
    }

    pub fn frame_state(&self, id: NodeId) -> &FrameStateData {
        match self.kind(id) {
            NodeKind::FrameState(data) => data,
            other => panic!("node {:?} is not a frame state: {:?}", id, other),
        }
    }

    pub fn frame_state_mut(&mut self, id: NodeId) -> &mut FrameStateData {
        match self.kind_mut(id) {
            NodeKind::FrameState(data) => data,
            other => panic!("node is not a frame state: {:?}", other),
        }
    }

    /// Register an end node as a forward predecessor of a merge
    pub fn add_end_to_merge(&mut self, merge: NodeId, end: NodeId) {
        match self.kind_mut(merge) {
            NodeKind::Merge { ends } => ends.push(end),
            NodeKind::LoopBegin { .. } => {}
            other => panic!("not a merge: {:?}", other),
        }
        match self.kind_mut(end) {
            NodeKind::End { merge: slot } => *slot = Some(merge),
            other => panic!("not an end: {:?}", other),
        }
    }

    pub fn merge_end_count(&self, merge: NodeId) -> usize {
        match self.kind(merge) {
            NodeKind::Merge { ends } => ends.len(),
            // forward edge only; the back edge is implicit until closed
            NodeKind::LoopBegin { .. } => 1,
            other => panic!("not a merge: {:?}", other),
        }
    }

    /// Point the predecessors of every explicit control successor of
    /// `id` back at `id`
    pub fn connect_control_successors(&mut self, id: NodeId) {
        let successors = self.control_successors(id);
        for successor in successors {
            self.nodes[successor.index()].predecessor = Some(id);
        }
    }

    /// Explicit control successors of a node (excluding `next`)
    fn control_successors(&self, id: NodeId) -> Vec<NodeId> {
        match self.kind(id) {
            NodeKind::If {
                true_successor,
                false_successor,
                ..
            } => vec![*true_successor, *false_successor],
            NodeKind::TableSwitch { successors, .. }
            | NodeKind::LookupSwitch { successors, .. } => successors.clone(),
            NodeKind::InvokeWithException { exception_edge, .. } => vec![*exception_edge],
            _ => vec![],
        }
    }

    /// Replace the control edge `pred -> old` with `pred -> new`
    pub fn replace_successor(&mut self, pred: NodeId, old: NodeId, new: NodeId) {
        let mut replaced = false;
        if self.nodes[pred.index()].next == Some(old) {
            self.nodes[pred.index()].next = Some(new);
            replaced = true;
        }
        match self.kind_mut(pred) {
            NodeKind::If {
                true_successor,
                false_successor,
                ..
            } => {
                if *true_successor == old {
                    *true_successor = new;
                    replaced = true;
                }
                if *false_successor == old {
                    *false_successor = new;
                    replaced = true;
                }
            }
            NodeKind::TableSwitch { successors, .. }
            | NodeKind::LookupSwitch { successors, .. } => {
                for successor in successors.iter_mut() {
                    if *successor == old {
                        *successor = new;
                        replaced = true;
                    }
                }
            }
            NodeKind::InvokeWithException { exception_edge, .. } => {
                if *exception_edge == old {
                    *exception_edge = new;
                    replaced = true;
                }
            }
            _ => {}
        }
        assert!(replaced, "no control edge from {:?} to {:?}", pred, old);
        self.nodes[new.index()].predecessor = Some(pred);
    }

    /// Splice a fixed-with-next node out of the control flow
    pub fn remove_fixed(&mut self, id: NodeId) {
        let pred = self.predecessor(id).expect("removed node has no predecessor");
        let next = self.next(id).expect("removed node has no successor");
        self.replace_successor(pred, id, next);
        self.mark_deleted(id);
    }

    /// Delete a node that no longer has users or control edges
    pub fn safe_delete(&mut self, id: NodeId) {
        self.mark_deleted(id);
    }

    fn mark_deleted(&mut self, id: NodeId) {
        let node = &mut self.nodes[id.index()];
        node.deleted = true;
        node.next = None;
        node.predecessor = None;
        node.state_after = None;
    }

    /// Rewrite every data edge pointing at `old` to point at `new`
    pub fn replace_all_uses(&mut self, old: NodeId, new: NodeId) {
        for index in 0..self.nodes.len() {
            if self.nodes[index].deleted {
                continue;
            }
            for_each_input(&mut self.nodes[index].kind, |input| {
                if *input == old {
                    *input = new;
                }
            });
        }
    }

    /// All phis attached to a merge or loop begin
    pub fn phis_of(&self, merge: NodeId) -> Vec<NodeId> {
        self.iter()
            .filter(|&id| matches!(self.kind(id), NodeKind::Phi { merge: m, .. } if *m == merge))
            .collect()
    }

    /// Live (non-deleted) nodes
    pub fn iter(&self) -> impl Iterator<Item = NodeId> + '_ + use<'_, 'g> {
        (0..self.nodes.len() as u32)
            .map(NodeId)
            .filter(move |id| !self.nodes[id.index()].deleted)
    }

    pub fn node_count(&self) -> usize {
        self.iter().count()
    }

    pub fn has_deopt(&self) -> bool {
        self.iter()
            .any(|id| matches!(self.kind(id), NodeKind::Deopt { .. }))
    }

    /// Is `id` referenced by any data edge or `state_after` attachment?
    pub fn has_uses(&self, id: NodeId) -> bool {
        for index in 0..self.nodes.len() {
            let node = &self.nodes[index];
            if node.deleted {
                continue;
            }
            if node.state_after == Some(id) {
                return true;
            }
            if input_ids(&node.kind).contains(&id) {
                return true;
            }
        }
        false
    }
}

impl<'g> Default for Graph<'g> {
    fn default() -> Self {
        Graph::new()
    }
}

/// Visit every data input slot of a node kind
fn for_each_input<'g>(kind: &mut NodeKind<'g>, mut f: impl FnMut(&mut NodeId)) {
    match kind {
        NodeKind::If { condition, .. } => f(condition),
        NodeKind::TableSwitch { value, .. } | NodeKind::LookupSwitch { value, .. } => f(value),
        NodeKind::Return { value } => {
            if let Some(value) = value {
                f(value)
            }
        }
        NodeKind::Unwind { exception } => f(exception),
        NodeKind::Invoke { args, .. } | NodeKind::InvokeWithException { args, .. } => {
            args.iter_mut().for_each(f)
        }
        NodeKind::MonitorEnter { object } | NodeKind::MonitorExit { object } => f(object),
        NodeKind::LoadField { object, .. } => f(object),
        NodeKind::StoreField { object, value, .. } => {
            f(object);
            f(value);
        }
        NodeKind::LoadIndexed {
            array,
            index,
            length,
            ..
        } => {
            f(array);
            f(index);
            f(length);
        }
        NodeKind::StoreIndexed {
            array,
            index,
            length,
            value,
            ..
        } => {
            f(array);
            f(index);
            f(length);
            f(value);
        }
        NodeKind::ArrayLength { array } => f(array),
        NodeKind::NewTypeArray { length, .. } | NodeKind::NewObjectArray { length, .. } => {
            f(length)
        }
        NodeKind::NewMultiArray { dimensions, .. } => dimensions.iter_mut().for_each(f),
        NodeKind::CreateException { args, .. } => args.iter_mut().for_each(f),
        NodeKind::FixedGuard { condition } => f(condition),
        NodeKind::ValueAnchor { value } => {
            if let Some(value) = value {
                f(value)
            }
        }
        NodeKind::FrameState(data) => {
            for slot in data.locals.iter_mut().chain(data.stack.iter_mut()) {
                if let Some(value) = slot {
                    f(&mut value.id)
                }
            }
            for lock in data.locks.iter_mut() {
                f(&mut lock.id)
            }
        }
        NodeKind::Binary { x, y, .. }
        | NodeKind::NormalizeCompare { x, y, .. }
        | NodeKind::Compare { x, y, .. } => {
            f(x);
            f(y);
        }
        NodeKind::Negate { x } => f(x),
        NodeKind::Convert { input, .. } => f(input),
        NodeKind::IsNull { object, .. } | NodeKind::InstanceOf { object, .. } => f(object),
        NodeKind::CheckCast { object, anchor, .. } => {
            f(object);
            f(anchor);
        }
        NodeKind::Materialize { condition } => f(condition),
        NodeKind::Phi { inputs, .. } => inputs.iter_mut().for_each(f),
        NodeKind::Start
        | NodeKind::Placeholder
        | NodeKind::Begin
        | NodeKind::Anchor
        | NodeKind::End { .. }
        | NodeKind::Merge { .. }
        | NodeKind::LoopBegin { .. }
        | NodeKind::LoopEnd { .. }
        | NodeKind::Deopt { .. }
        | NodeKind::NewInstance { .. }
        | NodeKind::ExceptionObject
        | NodeKind::Constant { .. }
        | NodeKind::Parameter { .. } => {}
    }
}

/// Data inputs of a node kind
pub(crate) fn input_ids<'g>(kind: &NodeKind<'g>) -> Vec<NodeId> {
    let mut kind = kind.clone();
    let mut inputs = Vec::new();
    for_each_input(&mut kind, |id| inputs.push(*id));
    inputs
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::graph::node::NodeKind::*;

    #[test]
    fn unique_reuses_structurally_equal_floating_nodes() {
        let mut graph = Graph::new();
        let one = graph.unique(
            Constant {
                value: ConstValue::Int(1),
            },
            Kind::Int,
        );
        let again = graph.unique(
            Constant {
                value: ConstValue::Int(1),
            },
            Kind::Int,
        );
        let two = graph.unique(
            Constant {
                value: ConstValue::Int(2),
            },
            Kind::Int,
        );
        assert_eq!(one, again);
        assert_ne!(one, two);
    }

    #[test]
    fn remove_fixed_splices_control_flow() {
        let mut graph = Graph::new();
        let placeholder = graph.add(Placeholder, Kind::Void);
        let ret = graph.add(Return { value: None }, Kind::Void);
        let start = graph.start();
        graph.set_next(start, placeholder);
        graph.set_next(placeholder, ret);

        graph.remove_fixed(placeholder);
        assert_eq!(graph.next(start), Some(ret));
        assert_eq!(graph.predecessor(ret), Some(start));
        assert!(graph.is_deleted(placeholder));
    }

    #[test]
    fn replace_all_uses_rewrites_data_edges() {
        let mut graph = Graph::new();
        let a = graph.unique(
            Constant {
                value: ConstValue::Int(1),
            },
            Kind::Int,
        );
        let b = graph.unique(
            Constant {
                value: ConstValue::Int(2),
            },
            Kind::Int,
        );
        let ret = graph.add(Return { value: Some(a) }, Kind::Void);

        graph.replace_all_uses(a, b);
        assert!(matches!(graph.kind(ret), Return { value: Some(v) } if *v == b));
    }
}
