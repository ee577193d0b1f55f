//! Bytecode parser and graph construction
//!
//! Walks the blocks discovered by the block map in block-id order,
//! replays each block's instructions through the frame simulator, and
//! emits graph nodes. Control-flow joins are reconciled value by value,
//! synthesizing phis where paths disagree; loops are closed in a
//! finishing pass once every reachable block has been parsed.

use super::frame::{AFTER_BCI, AFTER_EXCEPTION_BCI, BEFORE_BCI};
use super::{
    BlockId, BlockKind, BlockMap, BuildConfig, BuildError, FrameStateSimulator, LocalLiveness,
    UNNUMBERED,
};
use crate::bytecode::{opcodes::*, BytecodeStream, LookupSwitch, TableSwitch};
use crate::graph::{
    BinaryOp, Condition, ConstValue, ConvertOp, DeoptAction, ExceptionKind, FrameStateData, Graph,
    GraphCache, InvokeKind, NodeId, NodeKind, Probability, Value,
};
use crate::pool::{ConstantData, FieldId, Method, MethodId, TypeId};
use crate::Kind;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashSet};
use std::rc::Rc;

/// Parse a method into a graph.
///
/// The only state surviving the call is the returned graph and, when
/// `config.cache_graphs` is set and a cache is supplied, a cache entry
/// for deopt-free graphs.
pub fn build_graph<'g>(
    method: &Method<'g>,
    config: &BuildConfig,
    mut cache: Option<&mut GraphCache<'g>>,
) -> Result<Rc<Graph<'g>>, BuildError> {
    if config.cache_graphs {
        if let Some(cache) = cache.as_ref() {
            if let Some(graph) = cache.get(method.declaration) {
                log::trace!("graph cache hit for {:?}", method.declaration);
                return Ok(graph);
            }
        }
    }

    let graph = Rc::new(GraphBuilder::new(method, config)?.build()?);
    if config.cache_graphs && !graph.has_deopt() {
        if let Some(cache) = cache.as_mut() {
            cache.insert(method.declaration, graph.clone());
        }
    }
    Ok(graph)
}

struct ExceptionInfo {
    /// Fixed node whose successor is the exception path continuation
    edge: NodeId,
    exception: Value,
}

struct GraphBuilder<'m, 'g> {
    method: &'m Method<'g>,
    config: &'m BuildConfig,
    graph: Graph<'g>,
    frame: FrameStateSimulator,
    stream: BytecodeStream<'m>,
    map: BlockMap,
    liveness: Option<LocalLiveness>,

    /// Blocks waiting to be parsed, lowest block id first
    work_list: BinaryHeap<Reverse<(u32, BlockId)>>,
    on_work_list: HashSet<BlockId>,
    visited: HashSet<BlockId>,
    /// Entry node of each block, indexed by block arena index
    first_instruction: Vec<Option<NodeId>>,

    current_block: BlockId,
    last_instr: Option<NodeId>,
    next_block_number: u32,
    unwind_block: Option<BlockId>,
    return_block: Option<BlockId>,
    method_synchronized_object: Option<Value>,
}

impl<'m, 'g> GraphBuilder<'m, 'g> {
    fn new(method: &'m Method<'g>, config: &'m BuildConfig) -> Result<GraphBuilder<'m, 'g>, BuildError> {
        let map = BlockMap::build(method, config)?;
        let liveness = if config.liveness_analysis {
            Some(LocalLiveness::compute(method, &map))
        } else {
            None
        };
        let mut graph = Graph::new();
        let frame = FrameStateSimulator::new(method, &mut graph);
        let next_block_number = map.order.len() as u32;
        let start_block = map.start_block;
        let block_count = map.block_count();

        Ok(GraphBuilder {
            method,
            config,
            graph,
            frame,
            stream: BytecodeStream::new(&method.code),
            map,
            liveness,
            work_list: BinaryHeap::new(),
            on_work_list: HashSet::new(),
            visited: HashSet::new(),
            first_instruction: vec![None; block_count],
            current_block: start_block,
            last_instr: None,
            next_block_number,
            unwind_block: None,
            return_block: None,
            method_synchronized_object: None,
        })
    }

    fn build(mut self) -> Result<Graph<'g>, BuildError> {
        log::trace!("compiling {:?}", self.method.declaration);

        let entry = self.map.start_block;
        let start = self.graph.start();
        self.last_instr = Some(start);

        if self.method.is_synchronized() {
            // hold the monitor before the first real block
            let state = self.state_node(self.frame.snapshot(BEFORE_BCI));
            self.graph.set_state_after(start, state);
            let object = self.synchronized_object();
            self.method_synchronized_object = Some(object);
            let enter = self
                .graph
                .add(NodeKind::MonitorEnter { object: object.id }, Kind::Void);
            self.append_fixed(enter);
            self.frame.lock(object);
        }

        let prologue_end = self.last_instr.unwrap();
        let state = self.state_node(self.frame.snapshot(0));
        self.graph.set_state_after(prologue_end, state);

        if self.map.block(entry).is_loop_header {
            let target = self.create_target(entry, self.frame.snapshot(0))?;
            self.append_goto(target);
        } else {
            self.set_first_instruction(entry, prologue_end);
        }
        self.add_to_work_list(entry);

        self.iterate_all_blocks()?;
        self.connect_loop_ends()?;

        // the placeholders have served their purpose as entry anchors
        let placeholders: Vec<NodeId> = self
            .graph
            .iter()
            .filter(|&id| matches!(self.graph.kind(id), NodeKind::Placeholder))
            .collect();
        for placeholder in placeholders {
            if self.graph.predecessor(placeholder).is_some()
                && self.graph.next(placeholder).is_some()
            {
                self.graph.remove_fixed(placeholder);
            } else {
                self.graph.safe_delete(placeholder);
            }
        }

        // drop frame states superseded during merging
        let used_states: HashSet<NodeId> = self
            .graph
            .iter()
            .filter_map(|id| self.graph.state_after(id))
            .collect();
        let dead_states: Vec<NodeId> = self
            .graph
            .iter()
            .filter(|&id| {
                matches!(self.graph.kind(id), NodeKind::FrameState(_)) && !used_states.contains(&id)
            })
            .collect();
        for state in dead_states {
            self.graph.safe_delete(state);
        }

        Ok(self.graph)
    }

    // ---- small helpers ----

    fn state_node(&mut self, data: FrameStateData) -> NodeId {
        self.graph.add(NodeKind::FrameState(data), Kind::Void)
    }

    fn const_value(&mut self, value: ConstValue<'g>) -> Value {
        let kind = value.kind();
        let id = self.graph.unique(NodeKind::Constant { value }, kind);
        self.graph.value(id)
    }

    fn synchronized_object(&mut self) -> Value {
        if self.method.is_static() {
            self.const_value(ConstValue::Class(self.method.declaration.holder))
        } else {
            self.frame.load_local(0)
        }
    }

    fn bci(&self) -> i32 {
        self.stream.current_bci()
    }

    /// Append a fixed-with-next node after the last instruction
    fn append_fixed(&mut self, id: NodeId) {
        let last = self.last_instr.expect("append into a closed block");
        debug_assert!(self.graph.next(last).is_none());
        self.graph.set_next(last, id);
        self.last_instr = Some(id);
    }

    fn append_fixed_value(&mut self, kind: NodeKind<'g>, result: Kind) -> Value {
        let id = self.graph.add(kind, result);
        self.append_fixed(id);
        self.graph.value(id)
    }

    /// Append a node that ends the block (no fixed successor to thread)
    fn append_terminal(&mut self, id: NodeId) {
        let last = self.last_instr.take().expect("append into a closed block");
        debug_assert!(self.graph.next(last).is_none());
        self.graph.set_next(last, id);
    }

    fn append_deopt(&mut self, action: DeoptAction) {
        let deopt = self.graph.add(NodeKind::Deopt { action }, Kind::Void);
        self.append_terminal(deopt);
    }

    /// Link control flow into an already-materialized target entry
    fn append_goto(&mut self, target: NodeId) {
        if let Some(last) = self.last_instr {
            self.graph.set_next(last, target);
        }
    }

    fn first_instruction(&self, block: BlockId) -> Option<NodeId> {
        self.first_instruction.get(block.index()).copied().flatten()
    }

    fn set_first_instruction(&mut self, block: BlockId, node: NodeId) {
        if block.index() >= self.first_instruction.len() {
            self.first_instruction.resize(block.index() + 1, None);
        }
        self.first_instruction[block.index()] = Some(node);
    }

    fn next_block_number(&mut self) -> u32 {
        let number = self.next_block_number;
        self.next_block_number += 1;
        number
    }

    fn add_to_work_list(&mut self, block: BlockId) {
        if self.on_work_list.insert(block) {
            let id = self.map.block(block).id;
            debug_assert_ne!(id, UNNUMBERED);
            self.work_list.push(Reverse((id, block)));
        }
    }

    fn is_visited(&self, block: BlockId) -> bool {
        self.visited.contains(&block)
    }

    /// Lazily created shared unwind path
    fn get_or_create_unwind_block(&mut self, bci: i32) -> BlockId {
        if let Some(block) = self.unwind_block {
            return block;
        }
        let id = self.next_block_number();
        let block = self.map.new_unwind_block(bci, id);
        self.unwind_block = Some(block);
        block
    }

    /// Lazily created shared return block
    fn get_or_create_return_block(&mut self, bci: i32) -> BlockId {
        if let Some(block) = self.return_block {
            return block;
        }
        let id = self.next_block_number();
        let block = self.map.new_return_block(bci, id);
        self.return_block = Some(block);
        block
    }

    /// State offset a block's entry state is recorded at
    fn state_bci(&self, block: BlockId) -> i32 {
        match self.map.block(block).kind {
            BlockKind::ExceptionDispatch { deopt_bci, .. } => deopt_bci,
            _ => self.map.block(block).start_bci,
        }
    }

    /// Drop locals not live into `block` from a propagated state
    fn prune_locals(&self, state: &mut FrameStateData, block: BlockId) {
        if let Some(liveness) = &self.liveness {
            let id = self.map.block(block).id;
            if id == UNNUMBERED {
                return;
            }
            for (local, slot) in state.locals.iter_mut().enumerate() {
                if slot.is_some() && !liveness.local_is_live_in(id, local) {
                    *slot = None;
                }
            }
        }
    }

    /// Loop begin node of a loop header block (reached through its entry
    /// anchor's forward end)
    fn loop_begin_of(&self, block: BlockId) -> NodeId {
        let entry = self.first_instruction(block).expect("loop header entered");
        let forward_end = self.graph.next(entry).expect("loop entry anchored");
        match self.graph.kind(forward_end) {
            NodeKind::End { merge: Some(merge) } => *merge,
            other => panic!("loop entry does not lead to a loop begin: {:?}", other),
        }
    }

    fn loop_end_of(&self, block: BlockId) -> NodeId {
        match *self.graph.kind(self.loop_begin_of(block)) {
            NodeKind::LoopBegin { loop_end, .. } => loop_end,
            ref other => panic!("not a loop begin: {:?}", other),
        }
    }

    // ---- merge engine ----

    /// Entry point for control transfers: materialize the target block's
    /// entry, reconcile frame states, and return the node to link the
    /// transfer to
    fn create_target(&mut self, block: BlockId, state: FrameStateData) -> Result<NodeId, BuildError> {
        let mut state = state;
        self.prune_locals(&mut state, block);

        let is_loop_header = self.map.block(block).is_loop_header;
        assert!(
            is_loop_header || !self.is_visited(block),
            "block must be parsed after all of its non-back-edge predecessors"
        );
        if self.map.block(block).is_exception_entry {
            assert_eq!(state.stack.len(), 1, "exception entry expects only the exception");
        }

        if self.first_instruction(block).is_none() {
            if is_loop_header {
                // materialize the loop skeleton: an anchored forward edge
                // into the loop begin, and an anchor for the back edge
                let forward_end = self.graph.add(NodeKind::End { merge: None }, Kind::Void);
                let loop_begin = self.graph.add(
                    NodeKind::LoopBegin {
                        forward_end,
                        loop_end: forward_end,
                    },
                    Kind::Void,
                );
                let loop_end = self.graph.add(NodeKind::LoopEnd { loop_begin }, Kind::Void);
                match self.graph.kind_mut(loop_begin) {
                    NodeKind::LoopBegin { loop_end: slot, .. } => *slot = loop_end,
                    _ => unreachable!(),
                }
                self.graph.add_end_to_merge(loop_begin, forward_end);

                let entry = self.graph.add(NodeKind::Placeholder, Kind::Void);
                self.graph.set_next(entry, forward_end);
                let back_entry = self.graph.add(NodeKind::Placeholder, Kind::Void);
                self.graph.set_next(back_entry, loop_end);

                let mut dup = state.clone();
                dup.bci = self.state_bci(block);
                let loop_state = self.state_node(dup);
                self.graph.set_state_after(loop_begin, loop_state);

                self.set_first_instruction(block, entry);
            } else {
                let entry = self.graph.add(NodeKind::Placeholder, Kind::Void);
                self.set_first_instruction(block, entry);
            }
        }

        self.merge_or_clone(block, &state)?;
        self.add_to_work_list(block);

        let mut result = if is_loop_header && self.is_visited(block) {
            // back edge: route into the loop end's anchor
            let loop_end = self.loop_end_of(block);
            self.graph.predecessor(loop_end).expect("anchored loop end")
        } else {
            self.first_instruction(block).unwrap()
        };

        let forward_end = match self.graph.kind(result) {
            NodeKind::LoopBegin { forward_end, .. } => Some(*forward_end),
            _ => None,
        };
        if let Some(forward_end) = forward_end {
            result = forward_end;
        } else if matches!(self.graph.kind(result), NodeKind::Merge { .. }) {
            let end = self.graph.add(NodeKind::End { merge: None }, Kind::Void);
            self.graph.add_end_to_merge(result, end);
            let anchor = self.graph.add(NodeKind::Placeholder, Kind::Void);
            let mut dup = state;
            dup.bci = self.state_bci(block);
            let anchor_state = self.state_node(dup);
            self.graph.set_state_after(anchor, anchor_state);
            self.graph.set_next(anchor, end);
            result = anchor;
        }
        debug_assert!(!matches!(
            self.graph.kind(result),
            NodeKind::Merge { .. } | NodeKind::LoopBegin { .. }
        ));
        Ok(result)
    }

    /// Record `state` at the target's entry, merging with whatever state
    /// previous predecessors recorded
    fn merge_or_clone(&mut self, target: BlockId, new_state: &FrameStateData) -> Result<(), BuildError> {
        let mut first = self.first_instruction(target).unwrap();
        if self.map.block(target).is_loop_header && self.is_visited(target) {
            let loop_end = self.loop_end_of(target);
            first = self.graph.predecessor(loop_end).expect("anchored loop end");
        }
        let bci = self.state_bci(target);

        let existing_state = self.graph.state_after(first);
        let existing_state = match existing_state {
            None => {
                let mut dup = new_state.clone();
                dup.bci = bci;
                let state = self.state_node(dup);
                self.graph.set_state_after(first, state);
                return Ok(());
            }
            Some(existing) => existing,
        };

        {
            let existing = self.graph.frame_state(existing_state);
            if existing.stack.len() != new_state.stack.len() {
                return Err(BuildError::FrameStateMismatch(
                    "stack heights differ at merge",
                ));
            }
            if existing.locks.len() != new_state.locks.len() {
                return Err(BuildError::FrameStateMismatch(
                    "lock depths differ at merge",
                ));
            }
            if existing.rethrow_exception != new_state.rethrow_exception {
                return Err(BuildError::FrameStateMismatch(
                    "rethrow state differs at merge",
                ));
            }
        }

        if matches!(self.graph.kind(first), NodeKind::Placeholder) {
            if self.graph.predecessor(first).is_none() {
                // first real predecessor: adopt the state directly
                let mut dup = new_state.clone();
                dup.bci = bci;
                let state = self.state_node(dup);
                self.graph.set_state_after(first, state);
                return Ok(());
            }

            // second predecessor: promote the placeholder to a merge
            let next = self.graph.next(first);
            let merge = self.graph.add(NodeKind::Merge { ends: Vec::new() }, Kind::Void);
            let end = self.graph.add(NodeKind::End { merge: None }, Kind::Void);
            self.graph.set_next(first, end);
            self.graph.add_end_to_merge(merge, end);
            if let Some(next) = next {
                self.graph.set_next(merge, next);
            }
            self.graph.set_state_after(merge, existing_state);
            let mut dup = self.graph.frame_state(existing_state).clone();
            dup.bci = bci;
            let placeholder_state = self.state_node(dup);
            self.graph.set_state_after(first, placeholder_state);

            let next_is_loop_end = next
                .map(|n| matches!(self.graph.kind(n), NodeKind::LoopEnd { .. }))
                .unwrap_or(false);
            if !next_is_loop_end {
                self.set_first_instruction(target, merge);
            }
            first = merge;
        }

        let existing_state = self.graph.state_after(first).unwrap();
        self.merge_states(first, existing_state, new_state)
    }

    /// Reconcile two frame states at a merge node, slot by slot
    fn merge_states(
        &mut self,
        merge: NodeId,
        existing_state: NodeId,
        new_state: &FrameStateData,
    ) -> Result<(), BuildError> {
        let end_count = self.graph.merge_end_count(merge);
        let mut data = self.graph.frame_state(existing_state).clone();

        for i in 0..data.locals.len() {
            data.locals[i] = match (data.locals[i], new_state.locals[i]) {
                (Some(existing), Some(new)) if existing == new => Some(existing),
                (Some(existing), Some(new)) if existing.kind == new.kind => {
                    Some(self.merge_value(merge, existing, new, end_count))
                }
                // the local holds different kinds on the two paths; a
                // verified program can never read it here again
                _ => None,
            };
        }

        for i in 0..data.stack.len() {
            data.stack[i] = match (data.stack[i], new_state.stack[i]) {
                (None, None) => None,
                (Some(existing), Some(new)) if existing == new => Some(existing),
                (Some(existing), Some(new)) if existing.kind == new.kind => {
                    Some(self.merge_value(merge, existing, new, end_count))
                }
                _ => {
                    return Err(BuildError::FrameStateMismatch(
                        "stack kinds differ at merge",
                    ))
                }
            };
        }

        for i in 0..data.locks.len() {
            let existing = data.locks[i];
            let new = new_state.locks[i];
            data.locks[i] = if existing == new {
                existing
            } else {
                self.merge_value(merge, existing, new, end_count)
            };
        }

        *self.graph.frame_state_mut(existing_state) = data;
        Ok(())
    }

    /// Value selecting between the paths at a merge, reusing or creating
    /// a phi
    fn merge_value(&mut self, merge: NodeId, existing: Value, new: Value, end_count: usize) -> Value {
        let reusable_phi = match self.graph.kind(existing.id) {
            NodeKind::Phi { merge: phi_merge, inputs } if *phi_merge == merge => {
                debug_assert_eq!(inputs.len(), end_count);
                true
            }
            _ => false,
        };
        if reusable_phi {
            self.add_phi_input(existing.id, new.id);
            return existing;
        }
        let inputs = {
            let mut inputs = vec![existing.id; end_count];
            inputs.push(new.id);
            inputs
        };
        let phi = self.graph.add(NodeKind::Phi { merge, inputs }, existing.kind);
        self.graph.value(phi)
    }

    fn add_phi_input(&mut self, phi: NodeId, input: NodeId) {
        match self.graph.kind_mut(phi) {
            NodeKind::Phi { inputs, .. } => inputs.push(input),
            other => panic!("not a phi: {:?}", other),
        }
    }

    /// Replace every live slot of a loop entry state with a fresh phi on
    /// the loop begin
    fn insert_loop_phis(&mut self, loop_begin: NodeId, state: &mut FrameStateData) {
        for i in 0..state.locals.len() {
            if let Some(value) = state.locals[i] {
                state.locals[i] = Some(self.new_loop_phi(loop_begin, value));
            }
        }
        for i in 0..state.stack.len() {
            if let Some(value) = state.stack[i] {
                state.stack[i] = Some(self.new_loop_phi(loop_begin, value));
            }
        }
        for i in 0..state.locks.len() {
            let value = state.locks[i];
            state.locks[i] = self.new_loop_phi(loop_begin, value);
        }
    }

    fn new_loop_phi(&mut self, loop_begin: NodeId, entry: Value) -> Value {
        let phi = self.graph.add(
            NodeKind::Phi {
                merge: loop_begin,
                inputs: vec![entry.id],
            },
            entry.kind,
        );
        self.graph.value(phi)
    }

    // ---- block iteration ----

    fn iterate_all_blocks(&mut self) -> Result<(), BuildError> {
        while let Some(Reverse((_, block))) = self.work_list.pop() {
            // a queued block may have lost all predecessors (degenerate
            // shapes); there is nothing to parse then
            if self.first_instruction(block).is_none() {
                self.visited.insert(block);
                continue;
            }
            if !self.visited.insert(block) {
                continue;
            }

            let entry = self.first_instruction(block).unwrap();
            let parse_from = if self.map.block(block).is_loop_header {
                let begin = self.loop_begin_of(block);
                let pre_state = self.graph.state_after(entry).expect("loop entry state");
                let mut dup = self.graph.frame_state(pre_state).clone();
                self.insert_loop_phis(begin, &mut dup);
                let state = self.state_node(dup);
                self.graph.set_state_after(begin, state);
                begin
            } else {
                entry
            };
            self.last_instr = Some(parse_from);

            let state_id = self
                .graph
                .state_after(parse_from)
                .expect("queued block has an entry state");
            let state = self.graph.frame_state(state_id).clone();
            self.frame.initialize_from(&state);
            assert!(
                self.graph.next(parse_from).is_none() || self.map.block(block).is_loop_header,
                "instructions already appended to block"
            );

            if Some(block) == self.return_block {
                self.create_return()?;
            } else if Some(block) == self.unwind_block {
                self.create_unwind()?;
            } else {
                let block_kind = self.map.block(block).kind;
                match block_kind {
                    BlockKind::ExceptionDispatch {
                        handler: Some(handler),
                        ..
                    } => self.create_exception_dispatch(block, handler)?,
                    BlockKind::ExceptionDispatch { handler: None, .. } => self.create_unwind()?,
                    BlockKind::Deopt => self.create_deopt(),
                    BlockKind::Normal => {
                        self.frame.set_rethrow_exception(false);
                        self.iterate_bytecodes_for_block(block)?;
                    }
                }
            }
        }
        Ok(())
    }

    fn iterate_bytecodes_for_block(&mut self, block: BlockId) -> Result<(), BuildError> {
        self.current_block = block;
        let block_end_bci = self.map.block(block).end_bci;
        self.stream.set_bci(self.map.block(block).start_bci);

        loop {
            if self.stream.at_end() {
                break;
            }
            let bci = self.stream.current_bci();
            self.trace_instruction(bci, bci == self.map.block(block).start_bci);
            self.process_bytecode(bci)?;

            let last = match self.last_instr {
                Some(last) => last,
                None => break,
            };
            if self.graph.kind(last).is_block_end() || self.graph.next(last).is_some() {
                break;
            }

            self.stream.next();
            let next_bci = self.stream.current_bci();
            if self.graph.kind(last).needs_state_after() && self.graph.state_after(last).is_none() {
                let state = self.state_node(self.frame.snapshot(next_bci));
                self.graph.set_state_after(last, state);
            }
            if self.stream.at_end() {
                break;
            }
            if next_bci > block_end_bci {
                // fell through into the next block
                let data = self.map.block(block);
                assert_eq!(data.normal_successors, 1, "fall-through with branches");
                let successor = data.successors[0];
                let state = self.frame.snapshot(next_bci);
                let target = self.create_target(successor, state)?;
                self.append_goto(target);
                break;
            }
        }
        Ok(())
    }

    fn trace_instruction(&self, bci: i32, block_start: bool) {
        if log::log_enabled!(log::Level::Trace) {
            log::trace!(
                "{}{:4}: {}",
                if block_start { '+' } else { '|' },
                bci,
                crate::bytecode::opcodes::name_of(self.stream.current_bc())
            );
        }
    }

    // ---- synthetic block bodies ----

    fn create_return(&mut self) -> Result<(), BuildError> {
        let kind = self.method.return_kind();
        let value = if kind == Kind::Void {
            None
        } else {
            Some(self.frame.pop(kind.stack_kind()))
        };
        assert_eq!(self.frame.stack_size(), 0, "stack not empty at return");

        if self.method.is_synchronized() {
            let anchor = self.graph.add(
                NodeKind::ValueAnchor {
                    value: value.map(|v| v.id),
                },
                Kind::Void,
            );
            self.append_fixed(anchor);
            self.synchronized_epilogue(AFTER_BCI);
        }

        let ret = self.graph.add(
            NodeKind::Return {
                value: value.map(|v| v.id),
            },
            Kind::Void,
        );
        self.append_terminal(ret);
        Ok(())
    }

    fn create_unwind(&mut self) -> Result<(), BuildError> {
        self.synchronized_epilogue(AFTER_EXCEPTION_BCI);
        let exception = self.frame.pop(Kind::Object);
        let unwind = self.graph.add(
            NodeKind::Unwind {
                exception: exception.id,
            },
            Kind::Void,
        );
        self.append_terminal(unwind);
        Ok(())
    }

    fn synchronized_epilogue(&mut self, bci: i32) {
        if self.method.is_synchronized() {
            let object = self
                .method_synchronized_object
                .expect("synchronized method holds its monitor");
            self.frame.unlock(object);
            let exit = self
                .graph
                .add(NodeKind::MonitorExit { object: object.id }, Kind::Void);
            self.append_fixed(exit);
            let state = self.state_node(self.frame.snapshot(bci));
            self.graph.set_state_after(exit, state);
        }
    }

    fn create_deopt(&mut self) {
        self.append_deopt(DeoptAction::Reprofile);
    }

    /// Type-test chain of an exception dispatch block
    fn create_exception_dispatch(&mut self, block: BlockId, handler: usize) -> Result<(), BuildError> {
        let handler_data = self.method.exception_handlers[handler];
        assert_eq!(
            self.frame.stack_size(),
            1,
            "only the exception object is live at dispatch"
        );
        let bci = self.state_bci(block);
        let data = self.map.block(block).clone();

        let catch_type = match handler_data.catch_type {
            // the catch-all handler always matches
            None => {
                let state = self.frame.snapshot(bci);
                let target = self.create_target(data.successors[0], state)?;
                self.append_goto(target);
                return Ok(());
            }
            Some(catch_type) => catch_type,
        };

        if self.config.eager_resolving {
            catch_type.resolved.set(true);
        }
        if !catch_type.is_resolved() {
            self.append_deopt(DeoptAction::Recompile);
            return Ok(());
        }

        let next_block = if data.successors.len() == 1 {
            self.get_or_create_unwind_block(bci)
        } else {
            data.successors[1]
        };
        let exception = self.frame.peek(0);
        let catch_state = self.frame.snapshot(bci);
        let catch_successor = self.create_target(data.successors[0], catch_state)?;
        let dispatch_state = self.frame.snapshot(bci);
        let next_dispatch = self.create_target(next_block, dispatch_state)?;

        let condition = self.graph.unique(
            NodeKind::InstanceOf {
                class: catch_type,
                object: exception.id,
            },
            Kind::Int,
        );
        let if_node = self.graph.add(
            NodeKind::If {
                condition,
                true_successor: catch_successor,
                false_successor: next_dispatch,
                probability: Probability(0.5),
            },
            Kind::Void,
        );
        self.append_terminal(if_node);
        self.graph.connect_control_successors(if_node);
        Ok(())
    }

    // ---- exception routing ----

    /// Entry of the exception path for an instruction that may throw at
    /// `bci`: an anchor leading (through a fresh exception object, unless
    /// one is in hand) to the dispatch chain or the unwind path
    fn handle_exception(&mut self, exception: Option<Value>, bci: i32) -> Result<NodeId, BuildError> {
        let covering = self
            .method
            .exception_handlers
            .iter()
            .position(|h| h.covers(bci));

        let dispatch_block = match covering {
            None => self.get_or_create_unwind_block(bci),
            Some(handler) => {
                let data = self.map.block(self.current_block);
                data.exception_successors()
                    .iter()
                    .copied()
                    .find(|&b| {
                        matches!(
                            self.map.block(b).kind,
                            BlockKind::ExceptionDispatch { handler: Some(h), .. } if h == handler
                        )
                    })
                    .expect("dispatch block recorded for covered instruction")
            }
        };

        let begin = self.graph.add(NodeKind::Begin, Kind::Void);
        let begin_state = self.state_node(self.frame.duplicate_without_stack(bci));
        self.graph.set_state_after(begin, begin_state);

        let (exception_value, new_object) = match exception {
            Some(value) => (value, None),
            None => {
                let object = self.graph.add(NodeKind::ExceptionObject, Kind::Object);
                (self.graph.value(object), Some(object))
            }
        };
        let state_with_exception = self.frame.duplicate_with_exception(bci, exception_value);
        if let Some(object) = new_object {
            let state = self.state_node(state_with_exception.clone());
            self.graph.set_state_after(object, state);
        }

        let target = self.create_target(dispatch_block, state_with_exception)?;
        match new_object {
            Some(object) => {
                self.graph.set_next(object, target);
                self.graph.set_next(begin, object);
            }
            None => self.graph.set_next(begin, target),
        }
        Ok(begin)
    }

    /// Explicit null/bounds checks ahead of a trapping access
    fn emit_explicit_exceptions(
        &mut self,
        receiver: Value,
        out_of_bounds_index: Option<Value>,
    ) -> Result<(), BuildError> {
        let bci = self.bci();
        if !self.config.explicit_exception_checks || !self.map.can_trap[bci as usize] {
            return Ok(());
        }

        let mut exceptions = vec![self.emit_null_check(receiver)?];
        if let Some(index) = out_of_bounds_index {
            let length = self.append_fixed_value(
                NodeKind::ArrayLength { array: receiver.id },
                Kind::Int,
            );
            exceptions.push(self.emit_bounds_check(index, length)?);
        }

        let exception = if exceptions.len() == 1 {
            exceptions.pop().unwrap()
        } else {
            let merge = self.graph.add(NodeKind::Merge { ends: Vec::new() }, Kind::Void);
            let phi = self.graph.add(
                NodeKind::Phi {
                    merge,
                    inputs: Vec::new(),
                },
                Kind::Object,
            );
            for info in &exceptions {
                let end = self.graph.add(NodeKind::End { merge: None }, Kind::Void);
                self.graph.set_next(info.edge, end);
                self.graph.add_end_to_merge(merge, end);
                self.add_phi_input(phi, info.exception.id);
            }
            let state = self.state_node(self.frame.snapshot(bci));
            self.graph.set_state_after(merge, state);
            ExceptionInfo {
                edge: merge,
                exception: self.graph.value(phi),
            }
        };

        let entry = self.handle_exception(Some(exception.exception), bci)?;
        self.graph.set_next(exception.edge, entry);
        log::trace!("explicit exception checks at {}", bci);
        Ok(())
    }

    fn emit_null_check(&mut self, receiver: Value) -> Result<ExceptionInfo, BuildError> {
        let bci = self.bci();
        let non_null = self.graph.unique(
            NodeKind::IsNull {
                object: receiver.id,
                negated: true,
            },
            Kind::Int,
        );
        let continue_path = self.graph.add(NodeKind::Placeholder, Kind::Void);
        let trap_path = self.graph.add(NodeKind::Placeholder, Kind::Void);
        let if_node = self.graph.add(
            NodeKind::If {
                condition: non_null,
                true_successor: continue_path,
                false_successor: trap_path,
                probability: Probability(1.0),
            },
            Kind::Void,
        );
        self.append_terminal(if_node);
        self.graph.connect_control_successors(if_node);
        self.last_instr = Some(continue_path);

        let call = self.graph.add(
            NodeKind::CreateException {
                exception: ExceptionKind::NullPointer,
                args: vec![],
            },
            Kind::Object,
        );
        let state = self.state_node(self.frame.snapshot(bci));
        self.graph.set_state_after(call, state);
        self.graph.set_next(trap_path, call);
        Ok(ExceptionInfo {
            edge: call,
            exception: self.graph.value(call),
        })
    }

    fn emit_bounds_check(&mut self, index: Value, length: Value) -> Result<ExceptionInfo, BuildError> {
        let bci = self.bci();
        let in_bounds = self.graph.unique(
            NodeKind::Compare {
                condition: Condition::Below,
                x: index.id,
                y: length.id,
            },
            Kind::Int,
        );
        let continue_path = self.graph.add(NodeKind::Placeholder, Kind::Void);
        let trap_path = self.graph.add(NodeKind::Placeholder, Kind::Void);
        let if_node = self.graph.add(
            NodeKind::If {
                condition: in_bounds,
                true_successor: continue_path,
                false_successor: trap_path,
                probability: Probability(1.0),
            },
            Kind::Void,
        );
        self.append_terminal(if_node);
        self.graph.connect_control_successors(if_node);
        self.last_instr = Some(continue_path);

        let call = self.graph.add(
            NodeKind::CreateException {
                exception: ExceptionKind::OutOfBounds,
                args: vec![index.id],
            },
            Kind::Object,
        );
        let state = self.state_node(self.frame.snapshot(bci));
        self.graph.set_state_after(call, state);
        self.graph.set_next(trap_path, call);
        Ok(ExceptionInfo {
            edge: call,
            exception: self.graph.value(call),
        })
    }

    // ---- loop closing ----

    fn connect_loop_ends(&mut self) -> Result<(), BuildError> {
        let loop_begins: Vec<NodeId> = self
            .graph
            .iter()
            .filter(|&id| matches!(self.graph.kind(id), NodeKind::LoopBegin { .. }))
            .collect();

        for begin in loop_begins {
            let (forward_end, loop_end) = match *self.graph.kind(begin) {
                NodeKind::LoopBegin {
                    forward_end,
                    loop_end,
                } => (forward_end, loop_end),
                _ => unreachable!(),
            };
            let back_anchor = self.graph.predecessor(loop_end).expect("anchored loop end");

            match self.graph.state_after(back_anchor) {
                Some(back_state) => {
                    let begin_state = self.graph.state_after(begin).expect("loop state");
                    self.merge_loop(begin, begin_state, back_state)?;
                    self.delete_redundant_phis(begin);
                }
                None => self.unwind_degenerate_loop(begin, forward_end, loop_end, back_anchor),
            }
        }
        Ok(())
    }

    /// Feed the back-edge state into the loop header's phis
    fn merge_loop(
        &mut self,
        loop_begin: NodeId,
        begin_state: NodeId,
        back_state: NodeId,
    ) -> Result<(), BuildError> {
        let back = self.graph.frame_state(back_state).clone();
        let mut data = self.graph.frame_state(begin_state).clone();

        if data.stack.len() != back.stack.len() {
            return Err(BuildError::FrameStateMismatch(
                "stack heights differ at loop back edge",
            ));
        }
        if data.locks.len() != back.locks.len() {
            return Err(BuildError::FrameStateMismatch(
                "lock depths differ at loop back edge",
            ));
        }

        for i in 0..data.stack.len() {
            match (data.stack[i], back.stack[i]) {
                (None, None) => {}
                (Some(phi), Some(new)) if phi.kind == new.kind => {
                    self.check_loop_phi(phi, loop_begin);
                    self.add_phi_input(phi.id, new.id);
                }
                _ => {
                    return Err(BuildError::FrameStateMismatch(
                        "stack kinds differ at loop back edge",
                    ))
                }
            }
        }

        for i in 0..data.locals.len() {
            match (data.locals[i], back.locals[i]) {
                (None, _) => {}
                (Some(phi), Some(new)) if phi.kind == new.kind => {
                    self.check_loop_phi(phi, loop_begin);
                    self.add_phi_input(phi.id, new.id);
                }
                (Some(phi), _) => {
                    // kind changed around the loop; the slot is dead here
                    self.check_loop_phi(phi, loop_begin);
                    let entry = match self.graph.kind(phi.id) {
                        NodeKind::Phi { inputs, .. } => inputs[0],
                        _ => unreachable!(),
                    };
                    self.add_phi_input(phi.id, entry);
                    data.locals[i] = None;
                }
            }
        }

        for i in 0..data.locks.len() {
            let phi = data.locks[i];
            self.check_loop_phi(phi, loop_begin);
            self.add_phi_input(phi.id, back.locks[i].id);
        }

        *self.graph.frame_state_mut(begin_state) = data;
        Ok(())
    }

    fn check_loop_phi(&self, value: Value, loop_begin: NodeId) {
        debug_assert!(matches!(
            self.graph.kind(value.id),
            NodeKind::Phi { merge, .. } if *merge == loop_begin
        ));
    }

    /// Replace single-valued loop phis with their unique input
    fn delete_redundant_phis(&mut self, loop_begin: NodeId) {
        for phi in self.graph.phis_of(loop_begin) {
            let inputs = match self.graph.kind(phi) {
                NodeKind::Phi { inputs, .. } => inputs.clone(),
                _ => unreachable!(),
            };
            let mut unique_input = None;
            let mut redundant = true;
            for input in inputs {
                if input == phi {
                    continue;
                }
                match unique_input {
                    None => unique_input = Some(input),
                    Some(existing) if existing == input => {}
                    Some(_) => {
                        redundant = false;
                        break;
                    }
                }
            }
            if redundant {
                if let Some(input) = unique_input {
                    self.graph.replace_all_uses(phi, input);
                    self.graph.safe_delete(phi);
                }
            }
        }
    }

    /// A loop whose back edge was never reached is not a loop: drop the
    /// loop construct and wire the forward edge straight through
    fn unwind_degenerate_loop(
        &mut self,
        begin: NodeId,
        forward_end: NodeId,
        loop_end: NodeId,
        back_anchor: NodeId,
    ) {
        for phi in self.graph.phis_of(begin) {
            let input = match self.graph.kind(phi) {
                NodeKind::Phi { inputs, .. } => {
                    assert_eq!(inputs.len(), 1, "degenerate loop phi with a back edge");
                    inputs[0]
                }
                _ => unreachable!(),
            };
            self.graph.replace_all_uses(phi, input);
            self.graph.safe_delete(phi);
        }

        self.graph.safe_delete(back_anchor);
        self.graph.safe_delete(loop_end);

        let body = self.graph.next(begin).expect("loop body parsed");
        let entry = self.graph.predecessor(forward_end).expect("anchored entry");
        self.graph.replace_successor(entry, forward_end, body);
        self.graph.safe_delete(forward_end);
        self.graph.safe_delete(begin);
    }

    // ---- constant pool access ----

    fn lookup_type(&self, cpi: u16) -> TypeId<'g> {
        if self.config.eager_resolving {
            self.method.load_referenced(cpi);
        }
        self.method.lookup_type(cpi)
    }

    fn lookup_method(&self, cpi: u16) -> MethodId<'g> {
        if self.config.eager_resolving {
            self.method.load_referenced(cpi);
        }
        self.method.lookup_method(cpi)
    }

    fn lookup_field(&self, cpi: u16) -> FieldId<'g> {
        if self.config.eager_resolving {
            self.method.load_referenced(cpi);
        }
        self.method.lookup_field(cpi)
    }

    // ---- per-instruction parsing ----

    fn process_bytecode(&mut self, bci: i32) -> Result<(), BuildError> {
        let opcode = self.stream.current_bc();
        match opcode {
            NOP => {}
            ACONST_NULL => {
                let value = self.const_value(ConstValue::Null);
                self.frame.push(Kind::Object, value);
            }
            ICONST_M1..=ICONST_5 => {
                let value = self.const_value(ConstValue::Int(opcode as i32 - ICONST_0 as i32));
                self.frame.push(Kind::Int, value);
            }
            LCONST_0 | LCONST_1 => {
                let value = self.const_value(ConstValue::Long((opcode - LCONST_0) as i64));
                self.frame.push(Kind::Long, value);
            }
            FCONST_0 | FCONST_1 | FCONST_2 => {
                let value = self.const_value(ConstValue::float((opcode - FCONST_0) as f32));
                self.frame.push(Kind::Float, value);
            }
            DCONST_0 | DCONST_1 => {
                let value = self.const_value(ConstValue::double((opcode - DCONST_0) as f64));
                self.frame.push(Kind::Double, value);
            }
            BIPUSH => {
                let value = self.const_value(ConstValue::Int(self.stream.read_byte() as i32));
                self.frame.push(Kind::Int, value);
            }
            SIPUSH => {
                let value = self.const_value(ConstValue::Int(self.stream.read_short() as i32));
                self.frame.push(Kind::Int, value);
            }
            LDC | LDC_W | LDC2_W => self.gen_load_constant(self.stream.read_cpi()),
            ILOAD => self.gen_load_local(self.stream.read_local_index(), Kind::Int),
            LLOAD => self.gen_load_local(self.stream.read_local_index(), Kind::Long),
            FLOAD => self.gen_load_local(self.stream.read_local_index(), Kind::Float),
            DLOAD => self.gen_load_local(self.stream.read_local_index(), Kind::Double),
            ALOAD => self.gen_load_local(self.stream.read_local_index(), Kind::Object),
            ILOAD_0..=ILOAD_3 => self.gen_load_local((opcode - ILOAD_0) as usize, Kind::Int),
            LLOAD_0..=LLOAD_3 => self.gen_load_local((opcode - LLOAD_0) as usize, Kind::Long),
            FLOAD_0..=FLOAD_3 => self.gen_load_local((opcode - FLOAD_0) as usize, Kind::Float),
            DLOAD_0..=DLOAD_3 => self.gen_load_local((opcode - DLOAD_0) as usize, Kind::Double),
            ALOAD_0..=ALOAD_3 => self.gen_load_local((opcode - ALOAD_0) as usize, Kind::Object),
            IALOAD => self.gen_load_indexed(Kind::Int)?,
            LALOAD => self.gen_load_indexed(Kind::Long)?,
            FALOAD => self.gen_load_indexed(Kind::Float)?,
            DALOAD => self.gen_load_indexed(Kind::Double)?,
            AALOAD => self.gen_load_indexed(Kind::Object)?,
            BALOAD => self.gen_load_indexed(Kind::Byte)?,
            CALOAD => self.gen_load_indexed(Kind::Char)?,
            SALOAD => self.gen_load_indexed(Kind::Short)?,
            ISTORE => self.gen_store_local(self.stream.read_local_index(), Kind::Int),
            LSTORE => self.gen_store_local(self.stream.read_local_index(), Kind::Long),
            FSTORE => self.gen_store_local(self.stream.read_local_index(), Kind::Float),
            DSTORE => self.gen_store_local(self.stream.read_local_index(), Kind::Double),
            ASTORE => self.gen_store_local(self.stream.read_local_index(), Kind::Object),
            ISTORE_0..=ISTORE_3 => self.gen_store_local((opcode - ISTORE_0) as usize, Kind::Int),
            LSTORE_0..=LSTORE_3 => self.gen_store_local((opcode - LSTORE_0) as usize, Kind::Long),
            FSTORE_0..=FSTORE_3 => self.gen_store_local((opcode - FSTORE_0) as usize, Kind::Float),
            DSTORE_0..=DSTORE_3 => self.gen_store_local((opcode - DSTORE_0) as usize, Kind::Double),
            ASTORE_0..=ASTORE_3 => self.gen_store_local((opcode - ASTORE_0) as usize, Kind::Object),
            IASTORE => self.gen_store_indexed(Kind::Int)?,
            LASTORE => self.gen_store_indexed(Kind::Long)?,
            FASTORE => self.gen_store_indexed(Kind::Float)?,
            DASTORE => self.gen_store_indexed(Kind::Double)?,
            AASTORE => self.gen_store_indexed(Kind::Object)?,
            BASTORE => self.gen_store_indexed(Kind::Byte)?,
            CASTORE => self.gen_store_indexed(Kind::Char)?,
            SASTORE => self.gen_store_indexed(Kind::Short)?,
            POP | POP2 | DUP | DUP_X1 | DUP_X2 | DUP2 | DUP2_X1 | DUP2_X2 | SWAP => {
                self.gen_stack_op(opcode)
            }
            IADD | ISUB | IMUL => self.gen_arithmetic(Kind::Int, opcode, false),
            IDIV | IREM => self.gen_arithmetic(Kind::Int, opcode, true),
            LADD | LSUB | LMUL => self.gen_arithmetic(Kind::Long, opcode, false),
            LDIV | LREM => self.gen_arithmetic(Kind::Long, opcode, true),
            FADD | FSUB | FMUL | FDIV | FREM => self.gen_arithmetic(Kind::Float, opcode, false),
            DADD | DSUB | DMUL | DDIV | DREM => self.gen_arithmetic(Kind::Double, opcode, false),
            INEG => self.gen_negate(Kind::Int),
            LNEG => self.gen_negate(Kind::Long),
            FNEG => self.gen_negate(Kind::Float),
            DNEG => self.gen_negate(Kind::Double),
            ISHL | ISHR | IUSHR => self.gen_shift(Kind::Int, opcode),
            LSHL | LSHR | LUSHR => self.gen_shift(Kind::Long, opcode),
            IAND | IOR | IXOR => self.gen_logic(Kind::Int, opcode),
            LAND | LOR | LXOR => self.gen_logic(Kind::Long, opcode),
            IINC => self.gen_increment(),
            I2L => self.gen_convert(ConvertOp::I2L),
            I2F => self.gen_convert(ConvertOp::I2F),
            I2D => self.gen_convert(ConvertOp::I2D),
            L2I => self.gen_convert(ConvertOp::L2I),
            L2F => self.gen_convert(ConvertOp::L2F),
            L2D => self.gen_convert(ConvertOp::L2D),
            F2I => self.gen_convert(ConvertOp::F2I),
            F2L => self.gen_convert(ConvertOp::F2L),
            F2D => self.gen_convert(ConvertOp::F2D),
            D2I => self.gen_convert(ConvertOp::D2I),
            D2L => self.gen_convert(ConvertOp::D2L),
            D2F => self.gen_convert(ConvertOp::D2F),
            I2B => self.gen_convert(ConvertOp::I2B),
            I2C => self.gen_convert(ConvertOp::I2C),
            I2S => self.gen_convert(ConvertOp::I2S),
            LCMP => self.gen_compare_op(Kind::Long, false),
            FCMPL => self.gen_compare_op(Kind::Float, true),
            FCMPG => self.gen_compare_op(Kind::Float, false),
            DCMPL => self.gen_compare_op(Kind::Double, true),
            DCMPG => self.gen_compare_op(Kind::Double, false),
            IFEQ => self.gen_if_zero(Condition::Eq)?,
            IFNE => self.gen_if_zero(Condition::Ne)?,
            IFLT => self.gen_if_zero(Condition::Lt)?,
            IFGE => self.gen_if_zero(Condition::Ge)?,
            IFGT => self.gen_if_zero(Condition::Gt)?,
            IFLE => self.gen_if_zero(Condition::Le)?,
            IF_ICMPEQ => self.gen_if_same(Kind::Int, Condition::Eq)?,
            IF_ICMPNE => self.gen_if_same(Kind::Int, Condition::Ne)?,
            IF_ICMPLT => self.gen_if_same(Kind::Int, Condition::Lt)?,
            IF_ICMPGE => self.gen_if_same(Kind::Int, Condition::Ge)?,
            IF_ICMPGT => self.gen_if_same(Kind::Int, Condition::Gt)?,
            IF_ICMPLE => self.gen_if_same(Kind::Int, Condition::Le)?,
            IF_ACMPEQ => self.gen_if_same(Kind::Object, Condition::Eq)?,
            IF_ACMPNE => self.gen_if_same(Kind::Object, Condition::Ne)?,
            IFNULL => self.gen_if_null(Condition::Eq)?,
            IFNONNULL => self.gen_if_null(Condition::Ne)?,
            GOTO | GOTO_W => self.gen_goto()?,
            JSR => self.gen_jsr(self.stream.read_branch_dest())?,
            JSR_W => self.gen_jsr(self.stream.read_far_branch_dest())?,
            RET => self.gen_ret(self.stream.read_local_index())?,
            TABLESWITCH => self.gen_tableswitch(bci)?,
            LOOKUPSWITCH => self.gen_lookupswitch(bci)?,
            IRETURN => {
                let value = self.frame.pop(Kind::Int);
                self.gen_return(Some(value))?;
            }
            LRETURN => {
                let value = self.frame.pop(Kind::Long);
                self.gen_return(Some(value))?;
            }
            FRETURN => {
                let value = self.frame.pop(Kind::Float);
                self.gen_return(Some(value))?;
            }
            DRETURN => {
                let value = self.frame.pop(Kind::Double);
                self.gen_return(Some(value))?;
            }
            ARETURN => {
                let value = self.frame.pop(Kind::Object);
                self.gen_return(Some(value))?;
            }
            RETURN => self.gen_return(None)?,
            GETSTATIC => self.gen_get_static(self.stream.read_cpi()),
            PUTSTATIC => self.gen_put_static(self.stream.read_cpi()),
            GETFIELD => self.gen_get_field(self.stream.read_cpi())?,
            PUTFIELD => self.gen_put_field(self.stream.read_cpi())?,
            INVOKEVIRTUAL => self.gen_invoke_virtual(self.stream.read_cpi())?,
            INVOKESPECIAL => self.gen_invoke_special(self.stream.read_cpi())?,
            INVOKESTATIC => self.gen_invoke_static(self.stream.read_cpi())?,
            INVOKEINTERFACE => self.gen_invoke_interface(self.stream.read_cpi())?,
            NEW => self.gen_new_instance(self.stream.read_cpi()),
            NEWARRAY => self.gen_new_type_array(self.stream.read_ubyte(bci + 1)),
            ANEWARRAY => self.gen_new_object_array(self.stream.read_cpi()),
            ARRAYLENGTH => {
                let array = self.frame.pop(Kind::Object);
                let length =
                    self.append_fixed_value(NodeKind::ArrayLength { array: array.id }, Kind::Int);
                self.frame.push(Kind::Int, length);
            }
            ATHROW => self.gen_throw(bci)?,
            CHECKCAST => self.gen_check_cast(self.stream.read_cpi()),
            INSTANCEOF => self.gen_instance_of(self.stream.read_cpi()),
            MONITORENTER => {
                let object = self.frame.pop(Kind::Object);
                let enter = self
                    .graph
                    .add(NodeKind::MonitorEnter { object: object.id }, Kind::Void);
                self.append_fixed(enter);
                self.frame.lock(object);
            }
            MONITOREXIT => {
                let object = self.frame.pop(Kind::Object);
                self.frame.unlock(object);
                let exit = self
                    .graph
                    .add(NodeKind::MonitorExit { object: object.id }, Kind::Void);
                self.append_fixed(exit);
            }
            MULTIANEWARRAY => self.gen_new_multi_array(self.stream.read_cpi(), bci),
            BREAKPOINT => return Err(BuildError::UnsupportedOpcode { opcode, bci }),
            _ => return Err(BuildError::UnsupportedOpcode { opcode, bci }),
        }
        Ok(())
    }

    fn gen_load_constant(&mut self, cpi: u16) {
        if self.config.eager_resolving {
            self.method.load_referenced(cpi);
        }
        match self.method.lookup_constant(cpi) {
            ConstantData::Integer(value) => {
                let value = self.const_value(ConstValue::Int(value));
                self.frame.push(Kind::Int, value);
            }
            ConstantData::Long(value) => {
                let value = self.const_value(ConstValue::Long(value));
                self.frame.push(Kind::Long, value);
            }
            ConstantData::Float(value) => {
                let value = self.const_value(ConstValue::float(value));
                self.frame.push(Kind::Float, value);
            }
            ConstantData::Double(value) => {
                let value = self.const_value(ConstValue::double(value));
                self.frame.push(Kind::Double, value);
            }
            ConstantData::String(value) => {
                let value = self.const_value(ConstValue::Str(value));
                self.frame.push(Kind::Object, value);
            }
            ConstantData::Class(class) => {
                if class.is_resolved() {
                    let value = self.const_value(ConstValue::Class(class));
                    self.frame.push(Kind::Object, value);
                } else {
                    self.append_deopt(DeoptAction::Recompile);
                    let value = self.const_value(ConstValue::Null);
                    self.frame.push(Kind::Object, value);
                }
            }
        }
    }

    fn gen_load_local(&mut self, index: usize, kind: Kind) {
        let value = self.frame.load_local(index);
        self.frame.push(kind, value);
    }

    fn gen_store_local(&mut self, index: usize, kind: Kind) {
        let value = self.frame.pop(kind);
        self.frame.store_local(index, value);
    }

    fn gen_load_indexed(&mut self, element_kind: Kind) -> Result<(), BuildError> {
        let array_peek = self.frame.peek(1);
        let index_peek = self.frame.peek(0);
        self.emit_explicit_exceptions(array_peek, Some(index_peek))?;

        let index = self.frame.pop(Kind::Int);
        let array = self.frame.pop(Kind::Object);
        let length = self.append_fixed_value(NodeKind::ArrayLength { array: array.id }, Kind::Int);
        let load = self.append_fixed_value(
            NodeKind::LoadIndexed {
                array: array.id,
                index: index.id,
                length: length.id,
                element_kind,
            },
            element_kind.stack_kind(),
        );
        self.frame.push(element_kind.stack_kind(), load);
        Ok(())
    }

    fn gen_store_indexed(&mut self, element_kind: Kind) -> Result<(), BuildError> {
        let array_peek = self.frame.peek(2);
        let index_peek = self.frame.peek(1);
        self.emit_explicit_exceptions(array_peek, Some(index_peek))?;

        let value = self.frame.pop(element_kind.stack_kind());
        let index = self.frame.pop(Kind::Int);
        let array = self.frame.pop(Kind::Object);
        let length = self.append_fixed_value(NodeKind::ArrayLength { array: array.id }, Kind::Int);
        let store = self.graph.add(
            NodeKind::StoreIndexed {
                array: array.id,
                index: index.id,
                length: length.id,
                element_kind,
                value: value.id,
            },
            Kind::Void,
        );
        self.append_fixed(store);
        Ok(())
    }

    fn gen_stack_op(&mut self, opcode: u8) {
        match opcode {
            POP => {
                self.frame.xpop();
            }
            POP2 => {
                self.frame.xpop();
                self.frame.xpop();
            }
            DUP => {
                let w = self.frame.xpop();
                self.frame.xpush(w);
                self.frame.xpush(w);
            }
            DUP_X1 => {
                let w1 = self.frame.xpop();
                let w2 = self.frame.xpop();
                self.frame.xpush(w1);
                self.frame.xpush(w2);
                self.frame.xpush(w1);
            }
            DUP_X2 => {
                let w1 = self.frame.xpop();
                let w2 = self.frame.xpop();
                let w3 = self.frame.xpop();
                self.frame.xpush(w1);
                self.frame.xpush(w3);
                self.frame.xpush(w2);
                self.frame.xpush(w1);
            }
            DUP2 => {
                let w1 = self.frame.xpop();
                let w2 = self.frame.xpop();
                self.frame.xpush(w2);
                self.frame.xpush(w1);
                self.frame.xpush(w2);
                self.frame.xpush(w1);
            }
            DUP2_X1 => {
                let w1 = self.frame.xpop();
                let w2 = self.frame.xpop();
                let w3 = self.frame.xpop();
                self.frame.xpush(w2);
                self.frame.xpush(w1);
                self.frame.xpush(w3);
                self.frame.xpush(w2);
                self.frame.xpush(w1);
            }
            DUP2_X2 => {
                let w1 = self.frame.xpop();
                let w2 = self.frame.xpop();
                let w3 = self.frame.xpop();
                let w4 = self.frame.xpop();
                self.frame.xpush(w2);
                self.frame.xpush(w1);
                self.frame.xpush(w4);
                self.frame.xpush(w3);
                self.frame.xpush(w2);
                self.frame.xpush(w1);
            }
            SWAP => {
                let w1 = self.frame.xpop();
                let w2 = self.frame.xpop();
                self.frame.xpush(w1);
                self.frame.xpush(w2);
            }
            _ => unreachable!("not a stack operation: {}", opcode),
        }
    }

    fn gen_arithmetic(&mut self, kind: Kind, opcode: u8, can_trap: bool) {
        let y = self.frame.pop(kind);
        let x = self.frame.pop(kind);
        let op = match opcode {
            IADD | LADD | FADD | DADD => BinaryOp::Add,
            ISUB | LSUB | FSUB | DSUB => BinaryOp::Sub,
            IMUL | LMUL | FMUL | DMUL => BinaryOp::Mul,
            IDIV | LDIV | FDIV | DDIV => BinaryOp::Div,
            IREM | LREM | FREM | DREM => BinaryOp::Rem,
            _ => unreachable!("not an arithmetic opcode: {}", opcode),
        };
        let node = self.graph.unique(
            NodeKind::Binary {
                op,
                kind,
                x: x.id,
                y: y.id,
            },
            kind,
        );
        if can_trap {
            // division by zero must stay anchored at this point
            let anchor = self
                .graph
                .add(NodeKind::ValueAnchor { value: Some(node) }, Kind::Void);
            self.append_fixed(anchor);
        }
        let value = self.graph.value(node);
        self.frame.push(kind, value);
    }

    fn gen_negate(&mut self, kind: Kind) {
        let x = self.frame.pop(kind);
        let node = self.graph.unique(NodeKind::Negate { x: x.id }, kind);
        let value = self.graph.value(node);
        self.frame.push(kind, value);
    }

    fn gen_shift(&mut self, kind: Kind, opcode: u8) {
        let shift = self.frame.pop(Kind::Int);
        let x = self.frame.pop(kind);
        let op = match opcode {
            ISHL | LSHL => BinaryOp::Shl,
            ISHR | LSHR => BinaryOp::Shr,
            IUSHR | LUSHR => BinaryOp::Ushr,
            _ => unreachable!("not a shift opcode: {}", opcode),
        };
        let node = self.graph.unique(
            NodeKind::Binary {
                op,
                kind,
                x: x.id,
                y: shift.id,
            },
            kind,
        );
        let value = self.graph.value(node);
        self.frame.push(kind, value);
    }

    fn gen_logic(&mut self, kind: Kind, opcode: u8) {
        let y = self.frame.pop(kind);
        let x = self.frame.pop(kind);
        let op = match opcode {
            IAND | LAND => BinaryOp::And,
            IOR | LOR => BinaryOp::Or,
            IXOR | LXOR => BinaryOp::Xor,
            _ => unreachable!("not a logic opcode: {}", opcode),
        };
        let node = self.graph.unique(
            NodeKind::Binary {
                op,
                kind,
                x: x.id,
                y: y.id,
            },
            kind,
        );
        let value = self.graph.value(node);
        self.frame.push(kind, value);
    }

    fn gen_increment(&mut self) {
        let index = self.stream.read_local_index();
        let delta = self.stream.read_increment();
        let x = self.frame.load_local(index);
        let y = self.const_value(ConstValue::Int(delta));
        let node = self.graph.unique(
            NodeKind::Binary {
                op: BinaryOp::Add,
                kind: Kind::Int,
                x: x.id,
                y: y.id,
            },
            Kind::Int,
        );
        let value = self.graph.value(node);
        self.frame.store_local(index, value);
    }

    fn gen_convert(&mut self, op: ConvertOp) {
        let input = self.frame.pop(op.from_kind());
        let node = self.graph.unique(
            NodeKind::Convert { op, input: input.id },
            op.to_kind(),
        );
        let value = self.graph.value(node);
        self.frame.push(op.to_kind(), value);
    }

    fn gen_compare_op(&mut self, kind: Kind, unordered_less: bool) {
        let y = self.frame.pop(kind);
        let x = self.frame.pop(kind);
        let node = self.graph.unique(
            NodeKind::NormalizeCompare {
                x: x.id,
                y: y.id,
                unordered_less,
            },
            Kind::Int,
        );
        let value = self.graph.value(node);
        self.frame.push(Kind::Int, value);
    }

    fn gen_if_zero(&mut self, condition: Condition) -> Result<(), BuildError> {
        let y = self.const_value(ConstValue::Int(0));
        let x = self.frame.pop(Kind::Int);
        self.gen_if_node(x, condition, y)
    }

    fn gen_if_null(&mut self, condition: Condition) -> Result<(), BuildError> {
        let y = self.const_value(ConstValue::Null);
        let x = self.frame.pop(Kind::Object);
        self.gen_if_node(x, condition, y)
    }

    fn gen_if_same(&mut self, kind: Kind, condition: Condition) -> Result<(), BuildError> {
        let y = self.frame.pop(kind);
        let x = self.frame.pop(kind);
        self.gen_if_node(x, condition, y)
    }

    fn gen_if_node(&mut self, x: Value, condition: Condition, y: Value) -> Result<(), BuildError> {
        let bci = self.bci();
        let probability = self
            .method
            .profile
            .branch_taken_probability(bci)
            .unwrap_or(0.5);

        let data = self.map.block(self.current_block).clone();
        assert_eq!(data.normal_successors, 2, "conditional branch successors");
        let compare = self.graph.unique(
            NodeKind::Compare {
                condition,
                x: x.id,
                y: y.id,
            },
            Kind::Int,
        );
        let state = self.frame.snapshot(bci);
        let true_successor = self.create_target(data.successors[0], state.clone())?;
        let false_successor = self.create_target(data.successors[1], state)?;

        if true_successor == false_successor {
            self.append_goto(true_successor);
        } else {
            let if_node = self.graph.add(
                NodeKind::If {
                    condition: compare,
                    true_successor,
                    false_successor,
                    probability: Probability(probability),
                },
                Kind::Void,
            );
            self.append_terminal(if_node);
            self.graph.connect_control_successors(if_node);
        }
        Ok(())
    }

    fn gen_goto(&mut self) -> Result<(), BuildError> {
        let data = self.map.block(self.current_block).clone();
        assert_eq!(data.normal_successors, 1, "goto successors");
        let state = self.frame.snapshot(self.bci());
        let target = self.create_target(data.successors[0], state)?;
        self.append_goto(target);
        Ok(())
    }

    fn gen_jsr(&mut self, dest: i32) -> Result<(), BuildError> {
        let data = self.map.block(self.current_block).clone();
        let successor = data
            .jsr_successor()
            .expect("subroutine call block has a recorded body");
        assert_eq!(self.map.block(successor).start_bci, dest);
        let scope = data.jsr_scope();
        let successor_scope = self.map.block(successor).jsr_scope();
        if successor_scope.is_empty() || successor_scope.pop() != scope {
            return Err(BuildError::UnsupportedSubroutine(
                "unstructured subroutine control flow",
            ));
        }
        if successor_scope.next_return_address() != self.stream.next_bci() {
            return Err(BuildError::UnsupportedSubroutine(
                "subroutine return address does not match call site",
            ));
        }
        let address = self.const_value(ConstValue::RetAddr(self.stream.next_bci()));
        self.frame.push(Kind::Address, address);
        let state = self.frame.snapshot(self.bci());
        let target = self.create_target(successor, state)?;
        self.append_goto(target);
        Ok(())
    }

    fn gen_ret(&mut self, local_index: usize) -> Result<(), BuildError> {
        let data = self.map.block(self.current_block).clone();
        let successor = data
            .ret_successor()
            .expect("subroutine return block has a recorded continuation");
        let local = self.frame.load_local(local_index);
        let scope = data.jsr_scope();
        let address = self.const_value(ConstValue::RetAddr(scope.next_return_address()));
        let condition = self.graph.unique(
            NodeKind::Compare {
                condition: Condition::Eq,
                x: local.id,
                y: address.id,
            },
            Kind::Int,
        );
        let guard = self.graph.add(NodeKind::FixedGuard { condition }, Kind::Void);
        self.append_fixed(guard);
        if self.map.block(successor).jsr_scope() != scope.pop() {
            return Err(BuildError::UnsupportedSubroutine(
                "subroutine return leaves more than one scope",
            ));
        }
        let state = self.frame.snapshot(self.bci());
        let target = self.create_target(successor, state)?;
        self.append_goto(target);
        Ok(())
    }

    /// Successor entry for one switch arm, matched by target offset.
    /// Every arm gets its own begin anchor, wired immediately so a later
    /// arm reaching the same block sees the edge and merges.
    fn switch_target(&mut self, targets: &[(i32, BlockId)], target_bci: i32) -> Result<NodeId, BuildError> {
        let block = targets
            .iter()
            .find(|(bci, _)| *bci == target_bci)
            .map(|(_, block)| *block)
            .expect("switch target block");
        let state = self.frame.snapshot(self.bci());
        let target = self.create_target(block, state)?;
        let begin = self.graph.add(NodeKind::Begin, Kind::Void);
        self.graph.set_next(begin, target);
        Ok(begin)
    }

    fn switch_successor_offsets(&self) -> Vec<(i32, BlockId)> {
        let data = self.map.block(self.current_block);
        data.successors[..data.normal_successors]
            .iter()
            .map(|&b| (self.map.block(b).start_bci, b))
            .collect()
    }

    fn gen_tableswitch(&mut self, bci: i32) -> Result<(), BuildError> {
        let value = self.frame.pop(Kind::Int);
        let code = self.stream.code();
        let table = TableSwitch::new(code, bci as usize);
        let targets = self.switch_successor_offsets();

        let mut successors = Vec::with_capacity(table.number_of_cases() + 1);
        for i in 0..table.number_of_cases() {
            successors.push(self.switch_target(&targets, table.target_at(i))?);
        }
        successors.push(self.switch_target(&targets, table.default_target())?);

        let node = self.graph.add(
            NodeKind::TableSwitch {
                value: value.id,
                low_key: table.low_key(),
                successors,
            },
            Kind::Void,
        );
        self.append_terminal(node);
        self.graph.connect_control_successors(node);
        Ok(())
    }

    fn gen_lookupswitch(&mut self, bci: i32) -> Result<(), BuildError> {
        let value = self.frame.pop(Kind::Int);
        let code = self.stream.code();
        let table = LookupSwitch::new(code, bci as usize);
        let targets = self.switch_successor_offsets();

        let mut keys = Vec::with_capacity(table.number_of_cases());
        let mut successors = Vec::with_capacity(table.number_of_cases() + 1);
        for i in 0..table.number_of_cases() {
            keys.push(table.key_at(i));
            successors.push(self.switch_target(&targets, table.target_at(i))?);
        }
        successors.push(self.switch_target(&targets, table.default_target())?);

        let node = self.graph.add(
            NodeKind::LookupSwitch {
                value: value.id,
                keys,
                successors,
            },
            Kind::Void,
        );
        self.append_terminal(node);
        self.graph.connect_control_successors(node);
        Ok(())
    }

    fn gen_return(&mut self, value: Option<Value>) -> Result<(), BuildError> {
        self.frame.clear_stack();
        if let Some(value) = value {
            self.frame.push(value.kind, value);
        }
        let bci = self.bci();
        let return_block = self.get_or_create_return_block(bci);
        let state = self.frame.snapshot(bci);
        let target = self.create_target(return_block, state)?;
        self.append_goto(target);
        Ok(())
    }

    fn gen_throw(&mut self, bci: i32) -> Result<(), BuildError> {
        let exception = self.frame.pop(Kind::Object);
        let non_null = self.graph.unique(
            NodeKind::IsNull {
                object: exception.id,
                negated: true,
            },
            Kind::Int,
        );
        let guard = self
            .graph
            .add(NodeKind::FixedGuard { condition: non_null }, Kind::Void);
        self.append_fixed(guard);
        let entry = self.handle_exception(Some(exception), bci)?;
        self.append_fixed(entry);
        Ok(())
    }

    fn gen_get_field(&mut self, cpi: u16) -> Result<(), BuildError> {
        let field = self.lookup_field(cpi);
        let receiver_peek = self.frame.peek(0);
        self.emit_explicit_exceptions(receiver_peek, None)?;

        let kind = field.kind.stack_kind();
        let receiver = self.frame.pop(Kind::Object);
        if field.is_resolved() {
            let load = self.append_fixed_value(
                NodeKind::LoadField {
                    object: receiver.id,
                    field,
                },
                kind,
            );
            self.frame.push(kind, load);
        } else {
            self.append_deopt(DeoptAction::Recompile);
            let value = self.const_value(ConstValue::default_for(kind));
            self.frame.push(kind, value);
        }
        Ok(())
    }

    fn gen_put_field(&mut self, cpi: u16) -> Result<(), BuildError> {
        let field = self.lookup_field(cpi);
        let receiver_peek = self.frame.peek(1);
        self.emit_explicit_exceptions(receiver_peek, None)?;

        let value = self.frame.pop(field.kind.stack_kind());
        let receiver = self.frame.pop(Kind::Object);
        if field.is_resolved() {
            let store = self.graph.add(
                NodeKind::StoreField {
                    object: receiver.id,
                    field,
                    value: value.id,
                },
                Kind::Void,
            );
            self.append_fixed(store);
        } else {
            self.append_deopt(DeoptAction::Recompile);
        }
        Ok(())
    }

    fn gen_get_static(&mut self, cpi: u16) {
        let field = self.lookup_field(cpi);
        let kind = field.kind.stack_kind();
        if field.is_resolved() {
            let holder = self.const_value(ConstValue::Class(field.holder));
            let load = self.append_fixed_value(
                NodeKind::LoadField {
                    object: holder.id,
                    field,
                },
                kind,
            );
            self.frame.push(kind, load);
        } else {
            self.append_deopt(DeoptAction::Recompile);
            let value = self.const_value(ConstValue::default_for(kind));
            self.frame.push(kind, value);
        }
    }

    fn gen_put_static(&mut self, cpi: u16) {
        let field = self.lookup_field(cpi);
        let holder = if field.is_resolved() {
            Some(self.const_value(ConstValue::Class(field.holder)))
        } else {
            self.append_deopt(DeoptAction::Recompile);
            None
        };
        let value = self.frame.pop(field.kind.stack_kind());
        if let Some(holder) = holder {
            let store = self.graph.add(
                NodeKind::StoreField {
                    object: holder.id,
                    field,
                    value: value.id,
                },
                Kind::Void,
            );
            self.append_fixed(store);
        }
    }

    // ---- invocations ----

    fn gen_invoke_static(&mut self, cpi: u16) -> Result<(), BuildError> {
        let target = self.lookup_method(cpi);
        if target.is_resolved() {
            let args = self.frame.pop_arguments(target.signature.arg_slots(false));
            self.append_invoke(InvokeKind::Static, target, args)
        } else {
            self.gen_invoke_deopt(target, false);
            Ok(())
        }
    }

    fn gen_invoke_virtual(&mut self, cpi: u16) -> Result<(), BuildError> {
        let target = self.lookup_method(cpi);
        if target.is_resolved() {
            let args = self.frame.pop_arguments(target.signature.arg_slots(true));
            self.gen_invoke_indirect(InvokeKind::Virtual, target, args)
        } else {
            self.gen_invoke_deopt(target, true);
            Ok(())
        }
    }

    fn gen_invoke_interface(&mut self, cpi: u16) -> Result<(), BuildError> {
        let target = self.lookup_method(cpi);
        if target.is_resolved() {
            let args = self.frame.pop_arguments(target.signature.arg_slots(true));
            self.gen_invoke_indirect(InvokeKind::Interface, target, args)
        } else {
            self.gen_invoke_deopt(target, true);
            Ok(())
        }
    }

    fn gen_invoke_special(&mut self, cpi: u16) -> Result<(), BuildError> {
        let target = self.lookup_method(cpi);
        if target.is_resolved() {
            let args = self.frame.pop_arguments(target.signature.arg_slots(true));
            self.append_invoke(InvokeKind::Special, target, args)
        } else {
            self.gen_invoke_deopt(target, true);
            Ok(())
        }
    }

    /// Unresolved call site: deoptimize, then keep the stack shape
    /// consistent for the (never parsed further) fall-through
    fn gen_invoke_deopt(&mut self, target: MethodId<'g>, with_receiver: bool) {
        self.append_deopt(DeoptAction::Recompile);
        self.frame
            .pop_arguments(target.signature.arg_slots(with_receiver));
        let kind = target.signature.return_kind;
        if kind != Kind::Void {
            let value = self.const_value(ConstValue::default_for(kind.stack_kind()));
            self.frame.push(kind.stack_kind(), value);
        }
    }

    fn gen_invoke_indirect(
        &mut self,
        invoke_kind: InvokeKind,
        target: MethodId<'g>,
        args: Vec<Value>,
    ) -> Result<(), BuildError> {
        if target.can_be_statically_bound() {
            return self.append_invoke(InvokeKind::Special, target, args);
        }
        self.append_invoke(invoke_kind, target, args)
    }

    fn append_invoke(
        &mut self,
        invoke_kind: InvokeKind,
        target: MethodId<'g>,
        args: Vec<Value>,
    ) -> Result<(), BuildError> {
        let bci = self.bci();
        let return_kind = target.signature.return_kind;
        let arg_ids: Vec<NodeId> = args.iter().map(|a| a.id).collect();

        let covered = self
            .method
            .exception_handlers
            .iter()
            .any(|h| h.covers(bci));
        if covered {
            // the call site splits into a normal and an exception path
            let exception_edge = self.handle_exception(None, bci)?;
            let invoke = self.graph.add(
                NodeKind::InvokeWithException {
                    invoke_kind,
                    target,
                    args: arg_ids,
                    exception_edge,
                },
                return_kind.stack_kind(),
            );
            self.append_terminal(invoke);
            self.graph.connect_control_successors(invoke);
            let result = self.graph.value(invoke);
            self.frame.push_return(return_kind, result);

            let data = self.map.block(self.current_block).clone();
            let next_block = data.successors[0];
            let next_bci = self.map.block(next_block).start_bci;
            let state = self.frame.snapshot(next_bci);
            let continuation = self.create_target(next_block, state)?;
            self.graph.set_next(invoke, continuation);
            let state_after = self.state_node(self.frame.snapshot(next_bci));
            self.graph.set_state_after(invoke, state_after);
        } else {
            let invoke = self.graph.add(
                NodeKind::Invoke {
                    invoke_kind,
                    target,
                    args: arg_ids,
                },
                return_kind.stack_kind(),
            );
            self.append_fixed(invoke);
            let result = self.graph.value(invoke);
            self.frame.push_return(return_kind, result);
        }
        Ok(())
    }

    // ---- allocation, casts, throws ----

    fn gen_new_instance(&mut self, cpi: u16) {
        let class = self.lookup_type(cpi);
        if class.is_resolved() {
            let instance = self.append_fixed_value(NodeKind::NewInstance { class }, Kind::Object);
            self.frame.push(Kind::Object, instance);
        } else {
            self.append_deopt(DeoptAction::Recompile);
            let value = self.const_value(ConstValue::Null);
            self.frame.push(Kind::Object, value);
        }
    }

    fn gen_new_type_array(&mut self, type_code: u8) {
        let element_kind = Kind::from_array_type_code(type_code)
            .unwrap_or_else(|| panic!("unknown array type code: {}", type_code));
        let length = self.frame.pop(Kind::Int);
        let array = self.append_fixed_value(
            NodeKind::NewTypeArray {
                length: length.id,
                element_kind,
            },
            Kind::Object,
        );
        self.frame.push(Kind::Object, array);
    }

    fn gen_new_object_array(&mut self, cpi: u16) {
        let element_type = self.lookup_type(cpi);
        let length = self.frame.pop(Kind::Int);
        if element_type.is_resolved() {
            let array = self.append_fixed_value(
                NodeKind::NewObjectArray {
                    length: length.id,
                    element_type,
                },
                Kind::Object,
            );
            self.frame.push(Kind::Object, array);
        } else {
            self.append_deopt(DeoptAction::Recompile);
            let value = self.const_value(ConstValue::Null);
            self.frame.push(Kind::Object, value);
        }
    }

    fn gen_new_multi_array(&mut self, cpi: u16, bci: i32) {
        let element_type = self.lookup_type(cpi);
        let rank = self.stream.read_ubyte(bci + 3) as usize;
        let mut dimensions = vec![NodeId(0); rank];
        for i in (0..rank).rev() {
            dimensions[i] = self.frame.pop(Kind::Int).id;
        }
        if element_type.is_resolved() {
            let array = self.append_fixed_value(
                NodeKind::NewMultiArray {
                    element_type,
                    dimensions,
                },
                Kind::Object,
            );
            self.frame.push(Kind::Object, array);
        } else {
            self.append_deopt(DeoptAction::Recompile);
            let value = self.const_value(ConstValue::Null);
            self.frame.push(Kind::Object, value);
        }
    }

    fn gen_check_cast(&mut self, cpi: u16) {
        let class = self.lookup_type(cpi);
        if class.is_resolved() {
            let object = self.frame.pop(Kind::Object);
            let anchor = self.graph.add(NodeKind::Anchor, Kind::Void);
            self.append_fixed(anchor);
            let cast = self.graph.unique(
                NodeKind::CheckCast {
                    class,
                    object: object.id,
                    anchor,
                },
                Kind::Object,
            );
            let value_anchor = self
                .graph
                .add(NodeKind::ValueAnchor { value: Some(cast) }, Kind::Void);
            self.append_fixed(value_anchor);
            let value = self.graph.value(cast);
            self.frame.push(Kind::Object, value);
        } else {
            // unresolved: only a null can legally pass this cast
            let object = self.frame.pop(Kind::Object);
            let null = self.const_value(ConstValue::Null);
            let condition = self.graph.unique(
                NodeKind::Compare {
                    condition: Condition::Eq,
                    x: object.id,
                    y: null.id,
                },
                Kind::Int,
            );
            let guard = self.graph.add(NodeKind::FixedGuard { condition }, Kind::Void);
            self.append_fixed(guard);
            self.frame.push(Kind::Object, null);
        }
    }

    fn gen_instance_of(&mut self, cpi: u16) {
        let class = self.lookup_type(cpi);
        let object = self.frame.pop(Kind::Object);
        if class.is_resolved() {
            let test = self.graph.unique(
                NodeKind::InstanceOf {
                    class,
                    object: object.id,
                },
                Kind::Int,
            );
            let materialized = self
                .graph
                .unique(NodeKind::Materialize { condition: test }, Kind::Int);
            let value = self.graph.value(materialized);
            self.frame.push(Kind::Int, value);
        } else {
            // only a null receiver avoids resolving the type
            let is_null = self.graph.unique(
                NodeKind::IsNull {
                    object: object.id,
                    negated: false,
                },
                Kind::Int,
            );
            let null_path = self.graph.add(NodeKind::Placeholder, Kind::Void);
            let deopt = self.graph.add(
                NodeKind::Deopt {
                    action: DeoptAction::Recompile,
                },
                Kind::Void,
            );
            let if_node = self.graph.add(
                NodeKind::If {
                    condition: is_null,
                    true_successor: null_path,
                    false_successor: deopt,
                    probability: Probability(1.0),
                },
                Kind::Void,
            );
            self.append_terminal(if_node);
            self.graph.connect_control_successors(if_node);
            self.last_instr = Some(null_path);
            let zero = self.const_value(ConstValue::Int(0));
            self.frame.push(Kind::Int, zero);
        }
    }
}
