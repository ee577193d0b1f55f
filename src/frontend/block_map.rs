//! Basic block discovery and conservative control-flow graph
//!
//! One linear pass over the instruction stream finds block boundaries and
//! successor lists. Exception-dispatch blocks are inserted between a
//! trapping instruction and the handler entries it may reach, chained when
//! several handlers cover the same offset and shared when several offsets
//! are covered by the same handlers. Subroutine bodies are specialized by
//! cloning, one copy per subroutine scope. A depth-first traversal then
//! detects loops, rejects the shapes the frontend does not support
//! (irreducible loops, more than 64 loops, loops headed by an exception
//! handler entry), and numbers the blocks in reverse postorder.

use super::{BuildConfig, BuildError, SubroutineScope};
use crate::bytecode::{opcodes::*, BytecodeStream, LookupSwitch, TableSwitch};
use crate::pool::Method;
use std::collections::{BTreeSet, HashMap};

/// Index of a block in its [`BlockMap`] arena
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub u32);

impl BlockId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Reverse-postorder number of a block that has not been ordered (yet)
pub const UNNUMBERED: u32 = u32::MAX;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BlockKind {
    Normal,
    /// Synthetic block between a trapping instruction and the handlers
    /// covering it; `handler` is an index into the method's exception
    /// table, `None` for the unwind-out-of-method path
    ExceptionDispatch {
        handler: Option<usize>,
        deopt_bci: i32,
    },
    /// Synthetic target for a branch arm the profile says is never taken
    Deopt,
}

/// Subroutine bookkeeping, allocated only for methods that use
/// subroutine call/return instructions
#[derive(Debug, Clone, Default)]
pub struct JsrData {
    pub scope: SubroutineScope,
    pub jsr_successor: Option<BlockId>,
    pub jsr_return_bci: i32,
    pub ret_successor: Option<BlockId>,
    pub ends_with_ret: bool,
    pub alternatives: HashMap<SubroutineScope, BlockId>,
}

#[derive(Debug, Clone)]
pub struct BlockData {
    /// Reverse-postorder number ([`UNNUMBERED`] until ordering, or for
    /// unreachable blocks)
    pub id: u32,
    pub start_bci: i32,
    pub end_bci: i32,
    pub kind: BlockKind,
    pub is_exception_entry: bool,
    pub is_loop_header: bool,
    /// Loop bit owned by this block if it is a loop header
    pub loop_id: i32,
    /// Bit `i` set iff this block lies inside loop `i`
    pub loops: u64,
    /// The first `normal_successors` entries are control-flow successors;
    /// the rest are exception-dispatch successors
    pub successors: Vec<BlockId>,
    pub normal_successors: usize,
    pub jsr: Option<Box<JsrData>>,
}

impl BlockData {
    fn new(start_bci: i32) -> BlockData {
        BlockData {
            id: UNNUMBERED,
            start_bci,
            end_bci: start_bci,
            kind: BlockKind::Normal,
            is_exception_entry: false,
            is_loop_header: false,
            loop_id: -1,
            loops: 0,
            successors: Vec::new(),
            normal_successors: 0,
            jsr: None,
        }
    }

    fn dispatch(handler: Option<usize>, deopt_bci: i32) -> BlockData {
        let mut block = BlockData::new(-1);
        block.end_bci = -1;
        block.kind = BlockKind::ExceptionDispatch { handler, deopt_bci };
        block
    }

    fn deopt(bci: i32) -> BlockData {
        let mut block = BlockData::new(bci);
        block.kind = BlockKind::Deopt;
        block
    }

    pub fn is_dispatch(&self) -> bool {
        matches!(self.kind, BlockKind::ExceptionDispatch { .. })
    }

    pub fn exception_successors(&self) -> &[BlockId] {
        &self.successors[self.normal_successors..]
    }

    pub fn jsr_scope(&self) -> SubroutineScope {
        self.jsr.as_ref().map_or(SubroutineScope::EMPTY, |j| j.scope)
    }

    pub fn ends_with_ret(&self) -> bool {
        self.jsr.as_ref().map_or(false, |j| j.ends_with_ret)
    }

    pub fn jsr_successor(&self) -> Option<BlockId> {
        self.jsr.as_ref().and_then(|j| j.jsr_successor)
    }

    pub fn ret_successor(&self) -> Option<BlockId> {
        self.jsr.as_ref().and_then(|j| j.ret_successor)
    }

    pub fn jsr_return_bci(&self) -> i32 {
        self.jsr.as_ref().map_or(-1, |j| j.jsr_return_bci)
    }

    fn jsr_mut(&mut self) -> &mut JsrData {
        self.jsr.get_or_insert_with(Default::default)
    }
}

/// Traversal state of one block during loop detection, kept in a side
/// table instead of on the block itself
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum BlockState {
    Unvisited,
    Active,
    Done,
}

/// Result of block discovery: the block arena, the reverse-postorder
/// numbering, and the per-offset annotations the parser needs
pub struct BlockMap {
    blocks: Vec<BlockData>,
    /// Reachable blocks in reverse postorder; position == block id
    pub order: Vec<BlockId>,
    pub start_block: BlockId,
    /// Offsets of instructions that may trap (invokes, array and field
    /// accesses)
    pub can_trap: Vec<bool>,
    pub has_subroutines: bool,
    pub loop_count: usize,
    loop_headers: Vec<BlockId>,
    offset_owner: Vec<Option<BlockId>>,
}

impl BlockMap {
    /// Discover blocks, build the conservative CFG, and number blocks in
    /// reverse postorder
    pub fn build(method: &Method, config: &BuildConfig) -> Result<BlockMap, BuildError> {
        let mut builder = MapBuilder {
            method,
            config,
            blocks: Vec::new(),
            offset_owner: vec![None; method.code.len()],
            can_trap: vec![false; method.code.len()],
            dispatch_cache: HashMap::new(),
            has_subroutines: false,
            loop_headers: Vec::new(),
            next_loop: 0,
            jsr_visited: Vec::new(),
        };

        builder.make_exception_entries()?;
        builder.iterate_over_bytecodes()?;
        if builder.has_subroutines {
            let entry = builder.offset_owner[0].expect("entry block");
            builder.create_jsr_alternatives(entry)?;
        }
        let order = builder.compute_block_order()?;
        builder.fix_loop_bits()?;

        let start_block = builder.offset_owner[0].expect("entry block");
        let map = BlockMap {
            blocks: builder.blocks,
            order,
            start_block,
            can_trap: builder.can_trap,
            has_subroutines: builder.has_subroutines,
            loop_count: builder.next_loop,
            loop_headers: builder.loop_headers,
            offset_owner: builder.offset_owner,
        };
        debug_assert!(map.verify());
        map.log_blocks();
        Ok(map)
    }

    pub fn block(&self, id: BlockId) -> &BlockData {
        &self.blocks[id.index()]
    }

    pub fn block_mut(&mut self, id: BlockId) -> &mut BlockData {
        &mut self.blocks[id.index()]
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Block owning the instruction at `bci`
    pub fn block_at(&self, bci: i32) -> Option<BlockId> {
        self.offset_owner.get(bci as usize).copied().flatten()
    }

    /// Header block of loop `index`
    pub fn loop_header(&self, index: usize) -> BlockId {
        self.loop_headers[index]
    }

    /// Append a synthetic block created during parsing (return, unwind)
    pub fn push_block(&mut self, block: BlockData) -> BlockId {
        let id = BlockId(self.blocks.len() as u32);
        self.blocks.push(block);
        id
    }

    /// Synthetic unwind path out of the method
    pub fn new_unwind_block(&mut self, deopt_bci: i32, id: u32) -> BlockId {
        let mut block = BlockData::dispatch(None, deopt_bci);
        block.id = id;
        self.push_block(block)
    }

    /// Synthetic shared return block
    pub fn new_return_block(&mut self, bci: i32, id: u32) -> BlockId {
        let mut block = BlockData::new(bci);
        block.id = id;
        self.push_block(block)
    }

    fn verify(&self) -> bool {
        for &id in &self.order {
            let block = self.block(id);
            assert_eq!(self.order[block.id as usize], id);
            for (i, &successor) in block.successors.iter().enumerate() {
                if self.block(successor).is_dispatch() && !block.is_dispatch() {
                    assert_eq!(
                        i,
                        block.successors.len() - 1,
                        "dispatch successor must be last"
                    );
                }
            }
        }
        true
    }

    fn log_blocks(&self) {
        if !log::log_enabled!(log::Level::Debug) {
            return;
        }
        for &id in &self.order {
            let block = self.block(id);
            let successors: Vec<String> = block
                .successors
                .iter()
                .map(|s| format!("B{}", self.block(*s).id))
                .collect();
            log::debug!(
                "B{} [{} -> {}]{}{} loops={:#x} successors: {}",
                block.id,
                block.start_bci,
                block.end_bci,
                if block.is_loop_header { " L" } else { "" },
                if block.is_exception_entry { " !" } else { "" },
                block.loops,
                successors.join(" ")
            );
        }
    }
}

struct MapBuilder<'m, 'g> {
    method: &'m Method<'g>,
    config: &'m BuildConfig,
    blocks: Vec<BlockData>,
    offset_owner: Vec<Option<BlockId>>,
    can_trap: Vec<bool>,
    /// Dispatch chains, keyed by (inner dispatch block, handler index) so
    /// offsets covered by the same handlers share one chain
    dispatch_cache: HashMap<(Option<BlockId>, usize), BlockId>,
    has_subroutines: bool,
    loop_headers: Vec<BlockId>,
    next_loop: usize,
    jsr_visited: Vec<BlockId>,
}

impl<'m, 'g> MapBuilder<'m, 'g> {
    fn block(&self, id: BlockId) -> &BlockData {
        &self.blocks[id.index()]
    }

    fn block_mut(&mut self, id: BlockId) -> &mut BlockData {
        &mut self.blocks[id.index()]
    }

    fn push_block(&mut self, block: BlockData) -> BlockId {
        let id = BlockId(self.blocks.len() as u32);
        self.blocks.push(block);
        id
    }

    /// Start basic blocks at all exception handler entries
    fn make_exception_entries(&mut self) -> Result<(), BuildError> {
        for handler in &self.method.exception_handlers {
            let block = self.make_block(handler.handler_bci);
            self.block_mut(block).is_exception_entry = true;
        }
        Ok(())
    }

    /// One pass over the bytecodes: mark block entries and record
    /// successors for every instruction that ends a block
    fn iterate_over_bytecodes(&mut self) -> Result<(), BuildError> {
        let method = self.method;
        let code = method.code.as_slice();
        let mut stream = BytecodeStream::new(code);
        let mut current: Option<BlockId> = None;

        while !stream.at_end() {
            let bci = stream.current_bci();

            if current.is_none() || self.offset_owner[bci as usize].is_some() {
                let block = self.make_block(bci);
                if let Some(open) = current {
                    let end_bci = self.block(open).end_bci;
                    self.add_successor(end_bci, block)?;
                }
                current = Some(block);
            }
            let owner = current.unwrap();
            self.offset_owner[bci as usize] = Some(owner);
            self.block_mut(owner).end_bci = bci;

            match stream.current_bc() {
                IRETURN | LRETURN | FRETURN | DRETURN | ARETURN | RETURN => {
                    current = None;
                }
                ATHROW => {
                    current = None;
                    self.can_trap[bci as usize] = true;
                    if let Some(dispatch) = self.handle_exceptions(bci) {
                        self.add_exception_successor(bci, dispatch);
                    }
                }
                IFEQ..=IF_ACMPNE | IFNULL | IFNONNULL => {
                    current = None;
                    let dest = stream.read_branch_dest();
                    let next_bci = stream.next_bci();
                    let probability = if self.config.use_branch_prediction {
                        self.method.profile.branch_taken_probability(bci)
                    } else {
                        None
                    };
                    let taken = if probability == Some(0.0) {
                        self.push_block(BlockData::deopt(dest))
                    } else {
                        self.make_block(dest)
                    };
                    let not_taken = if probability == Some(1.0) {
                        self.push_block(BlockData::deopt(next_bci))
                    } else {
                        self.make_block(next_bci)
                    };
                    self.add_successor(bci, taken)?;
                    self.add_successor(bci, not_taken)?;
                }
                GOTO | GOTO_W => {
                    current = None;
                    let dest = if stream.current_bc() == GOTO {
                        stream.read_branch_dest()
                    } else {
                        stream.read_far_branch_dest()
                    };
                    let target = self.make_block(dest);
                    self.add_successor(bci, target)?;
                }
                TABLESWITCH => {
                    current = None;
                    let table = TableSwitch::new(code, bci as usize);
                    let mut targets = BTreeSet::new();
                    for i in 0..table.number_of_cases() {
                        targets.insert(table.target_at(i));
                    }
                    targets.insert(table.default_target());
                    for target in targets {
                        let block = self.make_block(target);
                        self.add_successor(bci, block)?;
                    }
                }
                LOOKUPSWITCH => {
                    current = None;
                    let table = LookupSwitch::new(code, bci as usize);
                    let mut targets = BTreeSet::new();
                    for i in 0..table.number_of_cases() {
                        targets.insert(table.target_at(i));
                    }
                    targets.insert(table.default_target());
                    for target in targets {
                        let block = self.make_block(target);
                        self.add_successor(bci, block)?;
                    }
                }
                JSR | JSR_W => {
                    self.has_subroutines = true;
                    let target = if stream.current_bc() == JSR {
                        stream.read_branch_dest()
                    } else {
                        stream.read_far_branch_dest()
                    };
                    if target == 0 {
                        return Err(BuildError::UnsupportedSubroutine(
                            "subroutine target at offset 0",
                        ));
                    }
                    let body = self.make_block(target);
                    let jsr_block = self.offset_owner[bci as usize].unwrap();
                    {
                        let jsr = self.block_mut(jsr_block).jsr_mut();
                        jsr.jsr_successor = Some(body);
                        jsr.jsr_return_bci = stream.next_bci();
                    }
                    current = None;
                    self.add_successor(bci, body)?;
                }
                RET => {
                    self.block_mut(owner).jsr_mut().ends_with_ret = true;
                    current = None;
                }
                INVOKEVIRTUAL | INVOKESPECIAL | INVOKESTATIC | INVOKEINTERFACE => {
                    self.can_trap[bci as usize] = true;
                    if let Some(dispatch) = self.handle_exceptions(bci) {
                        current = None;
                        let next = self.make_block(stream.next_bci());
                        self.add_successor(bci, next)?;
                        self.add_exception_successor(bci, dispatch);
                    }
                }
                IALOAD..=SALOAD | IASTORE..=SASTORE | GETFIELD | PUTFIELD => {
                    self.can_trap[bci as usize] = true;
                    if let Some(dispatch) = self.handle_exceptions(bci) {
                        current = None;
                        let next = self.make_block(stream.next_bci());
                        self.add_successor(bci, next)?;
                        self.add_exception_successor(bci, dispatch);
                    }
                }
                _ => {}
            }
            stream.next();
        }
        Ok(())
    }

    /// Block starting at `start_bci`, creating it or splitting an
    /// already-built block that covers the offset
    fn make_block(&mut self, start_bci: i32) -> BlockId {
        match self.offset_owner[start_bci as usize] {
            None => {
                let block = self.push_block(BlockData::new(start_bci));
                self.offset_owner[start_bci as usize] = Some(block);
                block
            }
            Some(old) if self.block(old).start_bci != start_bci => {
                // Backward branch into the middle of an already processed
                // block: split it, the tail keeps the old successors.
                let old_end = self.block(old).end_bci;
                let mut tail = BlockData::new(start_bci);
                tail.end_bci = old_end;
                tail.successors = self.block(old).successors.clone();
                tail.normal_successors = self.block(old).normal_successors;
                tail.jsr = self.block_mut(old).jsr.take();
                let tail = self.push_block(tail);

                let head = self.block_mut(old);
                head.end_bci = start_bci - 1;
                head.successors.clear();
                head.successors.push(tail);
                head.normal_successors = 1;

                for bci in start_bci..=old_end {
                    self.offset_owner[bci as usize] = Some(tail);
                }
                tail
            }
            Some(existing) => existing,
        }
    }

    /// Record a normal control-flow successor for the block owning
    /// `pred_bci`
    fn add_successor(&mut self, pred_bci: i32, successor: BlockId) -> Result<(), BuildError> {
        if self.block(successor).is_exception_entry {
            return Err(BuildError::ExceptionEntryReachedNormally {
                handler_bci: self.block(successor).start_bci,
            });
        }
        let pred = self.offset_owner[pred_bci as usize].expect("predecessor block");
        let block = self.block_mut(pred);
        debug_assert_eq!(block.normal_successors, block.successors.len());
        block.successors.push(successor);
        block.normal_successors += 1;
        Ok(())
    }

    /// Record the exception-dispatch successor (always last)
    fn add_exception_successor(&mut self, pred_bci: i32, dispatch: BlockId) {
        let pred = self.offset_owner[pred_bci as usize].expect("predecessor block");
        self.block_mut(pred).successors.push(dispatch);
    }

    /// Dispatch chain for the handlers covering `bci`, walking the table
    /// backwards so inner chains are built before the blocks that jump to
    /// them; a catch-all handler discards all outer candidates since they
    /// can never be reached
    fn handle_exceptions(&mut self, bci: i32) -> Option<BlockId> {
        let mut last_handler: Option<BlockId> = None;

        for index in (0..self.method.exception_handlers.len()).rev() {
            let handler = self.method.exception_handlers[index];
            if !handler.covers(bci) {
                continue;
            }
            if handler.is_catch_all() {
                last_handler = None;
            }
            let key = (last_handler, index);
            let dispatch = match self.dispatch_cache.get(&key) {
                Some(&existing) => existing,
                None => {
                    let mut block = BlockData::dispatch(Some(index), bci);
                    let entry = self.offset_owner[handler.handler_bci as usize]
                        .expect("handler entry block");
                    block.successors.push(entry);
                    if let Some(inner) = last_handler {
                        block.successors.push(inner);
                    }
                    block.normal_successors = block.successors.len();
                    let id = self.push_block(block);
                    self.dispatch_cache.insert(key, id);
                    id
                }
            };
            last_handler = Some(dispatch);
        }
        last_handler
    }

    /// Clone every block reachable under a non-empty subroutine scope so
    /// each call context gets its own copy, memoized per (block, scope)
    fn create_jsr_alternatives(&mut self, block: BlockId) -> Result<(), BuildError> {
        self.jsr_visited.push(block);
        let scope = self.block(block).jsr_scope();

        if self.block(block).ends_with_ret() {
            if scope.is_empty() {
                return Err(BuildError::UnsupportedSubroutine(
                    "subroutine return outside any subroutine",
                ));
            }
            let return_bci = scope.next_return_address();
            let target = self.offset_owner[return_bci as usize].expect("return target block");
            if self.block(target).is_exception_entry {
                return Err(BuildError::ExceptionEntryReachedNormally {
                    handler_bci: self.block(target).start_bci,
                });
            }
            {
                // Appended directly: the returning block may itself be a
                // clone, which no offset resolves to.
                let data = self.block_mut(block);
                data.successors.push(target);
                data.normal_successors += 1;
                data.jsr_mut().ret_successor = Some(target);
            }
            assert_ne!(self.block(block).jsr_successor(), Some(target));
        }
        log::trace!(
            "subroutine alternatives for block at {}: scope {:?}",
            self.block(block).start_bci,
            scope
        );

        if self.block(block).jsr_successor().is_some() || !scope.is_empty() {
            for i in 0..self.block(block).successors.len() {
                let successor = self.block(block).successors[i];
                let mut next_scope = scope;
                if Some(successor) == self.block(block).jsr_successor() {
                    next_scope = scope.push(self.block(block).jsr_return_bci())?;
                }
                if Some(successor) == self.block(block).ret_successor() {
                    next_scope = scope.pop();
                }
                if !self.block(successor).jsr_scope().is_prefix_of(next_scope) {
                    return Err(BuildError::UnsupportedSubroutine(
                        "unstructured subroutine control flow",
                    ));
                }
                if !next_scope.is_empty() {
                    let clone = match self
                        .block(successor)
                        .jsr
                        .as_ref()
                        .and_then(|j| j.alternatives.get(&next_scope).copied())
                    {
                        Some(clone) => clone,
                        None => {
                            let mut copy = self.block(successor).clone();
                            copy.id = UNNUMBERED;
                            let jsr = copy.jsr_mut();
                            jsr.scope = next_scope;
                            jsr.alternatives = HashMap::new();
                            let clone = self.push_block(copy);
                            self.block_mut(successor)
                                .jsr_mut()
                                .alternatives
                                .insert(next_scope, clone);
                            clone
                        }
                    };
                    if Some(successor) == self.block(block).jsr_successor() {
                        self.block_mut(block).jsr_mut().jsr_successor = Some(clone);
                    }
                    if Some(successor) == self.block(block).ret_successor() {
                        self.block_mut(block).jsr_mut().ret_successor = Some(clone);
                    }
                    self.block_mut(block).successors[i] = clone;
                }
            }
        }

        for i in 0..self.block(block).successors.len() {
            let successor = self.block(block).successors[i];
            if !self.jsr_visited.contains(&successor) {
                self.create_jsr_alternatives(successor)?;
            }
        }
        Ok(())
    }

    /// Depth-first traversal computing loop membership and postorder;
    /// reversing the postorder yields the block numbering
    fn compute_block_order(&mut self) -> Result<Vec<BlockId>, BuildError> {
        let entry = self.offset_owner[0].expect("entry block");
        let mut states = vec![BlockState::Unvisited; self.blocks.len()];
        let mut postorder = Vec::new();

        let loops = self.order_visit(entry, &mut states, &mut postorder)?;
        if loops != 0 {
            // A path from a loop end reaches the entry without passing
            // the loop header, so the loop has more than one entry.
            return Err(BuildError::NonReducibleLoop(loops));
        }

        postorder.reverse();
        for (id, &block) in postorder.iter().enumerate() {
            self.block_mut(block).id = id as u32;
        }
        Ok(postorder)
    }

    fn order_visit(
        &mut self,
        block: BlockId,
        states: &mut [BlockState],
        postorder: &mut Vec<BlockId>,
    ) -> Result<u64, BuildError> {
        match states[block.index()] {
            BlockState::Active => {
                // Reached via a backward branch.
                self.make_loop_header(block)?;
                return Ok(self.block(block).loops);
            }
            BlockState::Done => {
                let data = self.block(block);
                return Ok(if data.is_loop_header {
                    data.loops & !(1u64 << data.loop_id)
                } else {
                    data.loops
                });
            }
            BlockState::Unvisited => {}
        }
        states[block.index()] = BlockState::Active;

        let mut loops = 0u64;
        for i in 0..self.block(block).successors.len() {
            let successor = self.block(block).successors[i];
            loops |= self.order_visit(successor, states, postorder)?;
            if states[successor.index()] == BlockState::Active {
                loops |= 1u64 << self.block(successor).loop_id;
            }
        }
        self.block_mut(block).loops = loops;

        if self.block(block).is_loop_header {
            loops &= !(1u64 << self.block(block).loop_id);
        }

        states[block.index()] = BlockState::Done;
        postorder.push(block);
        Ok(loops)
    }

    /// Mark a block as a loop header, assigning the next free loop bit
    fn make_loop_header(&mut self, block: BlockId) -> Result<(), BuildError> {
        if !self.block(block).is_loop_header {
            if self.block(block).is_exception_entry {
                return Err(BuildError::LoopThroughExceptionHandler);
            }
            if self.next_loop >= 64 {
                return Err(BuildError::TooManyLoops);
            }
            assert_eq!(self.block(block).loops, 0);
            let loop_id = self.next_loop as i32;
            {
                let data = self.block_mut(block);
                data.is_loop_header = true;
                data.loop_id = loop_id;
                data.loops = 1u64 << loop_id;
            }
            self.loop_headers.push(block);
            self.next_loop += 1;
            log::trace!(
                "loop header at bci {} assigned loop {}",
                self.block(block).start_bci,
                loop_id
            );
        }
        assert_eq!(self.block(block).loops.count_ones(), 1);
        Ok(())
    }

    /// Propagate loop bits to convergence; blocks between an inner loop
    /// and its enclosing loop only pick up the outer bits on repeat
    /// passes
    fn fix_loop_bits(&mut self) -> Result<(), BuildError> {
        let entry = self.offset_owner[0].expect("entry block");
        loop {
            let mut changed = false;
            let mut visited = vec![false; self.blocks.len()];
            let loops = self.fix_visit(entry, &mut visited, &mut changed);
            if loops != 0 {
                return Err(BuildError::NonReducibleLoop(loops));
            }
            if !changed {
                return Ok(());
            }
        }
    }

    fn fix_visit(&mut self, block: BlockId, visited: &mut [bool], changed: &mut bool) -> u64 {
        if visited[block.index()] {
            let data = self.block(block);
            return if data.is_loop_header {
                data.loops & !(1u64 << data.loop_id)
            } else {
                data.loops
            };
        }
        visited[block.index()] = true;

        let mut loops = self.block(block).loops;
        for i in 0..self.block(block).successors.len() {
            let successor = self.block(block).successors[i];
            loops |= self.fix_visit(successor, visited, changed);
        }
        if self.block(block).loops != loops {
            *changed = true;
            self.block_mut(block).loops = loops;
        }

        if self.block(block).is_loop_header {
            loops &= !(1u64 << self.block(block).loop_id);
        }
        loops
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::bytecode::opcodes::*;
    use crate::pool::{
        ConstantPool, ExceptionHandler, Method, MethodAccessFlags, MethodData, MethodSig,
        PoolArenas, PoolEntry, TypeData,
    };
    use crate::Kind;

    fn static_method<'g>(pool: &'g ConstantPool<'g>, code: Vec<u8>) -> Method<'g> {
        let object = pool.add_type(TypeData::new("java/lang/Object", None));
        let holder = pool.add_type(TypeData::new("Test", Some(object)));
        let declaration = pool.add_method(MethodData::new(
            holder,
            "test",
            MethodSig::new(vec![Kind::Int], Kind::Int),
            MethodAccessFlags::STATIC,
        ));
        Method::new(declaration, code, 4, 4)
    }

    /// x = 0; while (cond) { x += 1; } return x;
    fn loop_code() -> Vec<u8> {
        vec![
            ICONST_0,       //  0
            ISTORE_1,       //  1
            ILOAD_0,        //  2: loop header
            IFEQ, 0, 9,     //  3: -> 12
            IINC, 1, 1,     //  6
            GOTO, 0xff, 0xf9, // 9: -> 2
            ILOAD_1,        // 12
            IRETURN,        // 13
        ]
    }

    #[test]
    fn every_offset_is_owned_by_exactly_one_block() {
        let arenas = PoolArenas::new();
        let pool = ConstantPool::new(&arenas);
        let method = static_method(&pool, loop_code());
        let map = BlockMap::build(&method, &BuildConfig::default()).unwrap();

        for bci in 0..method.code.len() as i32 {
            let owner = map.block_at(bci).expect("offset has an owner");
            let data = map.block(owner);
            assert!(data.start_bci <= bci && bci <= data.end_bci);
        }
    }

    #[test]
    fn numbering_is_a_reverse_postorder() {
        let arenas = PoolArenas::new();
        let pool = ConstantPool::new(&arenas);
        let method = static_method(&pool, loop_code());
        let map = BlockMap::build(&method, &BuildConfig::default()).unwrap();

        for &block in &map.order {
            let data = map.block(block);
            for &successor in &data.successors {
                let successor_data = map.block(successor);
                // forward edges increase ids; only back edges (into loop
                // headers) may decrease them
                assert!(
                    successor_data.id > data.id || successor_data.is_loop_header,
                    "B{} -> B{} violates reverse postorder",
                    data.id,
                    successor_data.id
                );
            }
        }
    }

    #[test]
    fn loop_header_iff_back_edge_target() {
        let arenas = PoolArenas::new();
        let pool = ConstantPool::new(&arenas);
        let method = static_method(&pool, loop_code());
        let map = BlockMap::build(&method, &BuildConfig::default()).unwrap();

        for &block in &map.order {
            let has_back_edge = map.order.iter().any(|&pred| {
                map.block(pred).successors.contains(&block)
                    && map.block(pred).id >= map.block(block).id
            });
            assert_eq!(map.block(block).is_loop_header, has_back_edge);
        }
        assert_eq!(map.loop_count, 1);
    }

    #[test]
    fn build_is_deterministic() {
        let arenas = PoolArenas::new();
        let pool = ConstantPool::new(&arenas);
        let method = static_method(&pool, loop_code());
        let first = BlockMap::build(&method, &BuildConfig::default()).unwrap();
        let second = BlockMap::build(&method, &BuildConfig::default()).unwrap();

        assert_eq!(first.order.len(), second.order.len());
        for (&a, &b) in first.order.iter().zip(&second.order) {
            let a = first.block(a);
            let b = second.block(b);
            assert_eq!(a.start_bci, b.start_bci);
            assert_eq!(a.end_bci, b.end_bci);
            assert_eq!(a.loops, b.loops);
            assert_eq!(a.is_loop_header, b.is_loop_header);
            let a_successors: Vec<i32> = a
                .successors
                .iter()
                .map(|&s| first.block(s).start_bci)
                .collect();
            let b_successors: Vec<i32> = b
                .successors
                .iter()
                .map(|&s| second.block(s).start_bci)
                .collect();
            assert_eq!(a_successors, b_successors);
        }
    }

    #[test]
    fn irreducible_loop_is_rejected() {
        // entry branches to both halves of a two-entry cycle
        let code = vec![
            ILOAD_0,          // 0
            IFEQ, 0, 7,       // 1: -> 8
            NOP,              // 4
            GOTO, 0, 3,       // 5: -> 8
            NOP,              // 8
            GOTO, 0xff, 0xfb, // 9: -> 4
        ];
        let arenas = PoolArenas::new();
        let pool = ConstantPool::new(&arenas);
        let method = static_method(&pool, code);
        assert!(matches!(
            BlockMap::build(&method, &BuildConfig::default()),
            Err(BuildError::NonReducibleLoop(_))
        ));
    }

    #[test]
    fn more_than_64_loops_is_rejected() {
        // 65 disjoint self-loops, then a return
        let mut code = Vec::new();
        for _ in 0..65 {
            code.extend_from_slice(&[ILOAD_0, IFEQ, 0xff, 0xfe]);
        }
        code.push(ILOAD_0);
        code.push(IRETURN);
        let arenas = PoolArenas::new();
        let pool = ConstantPool::new(&arenas);
        let method = static_method(&pool, code);
        assert!(matches!(
            BlockMap::build(&method, &BuildConfig::default()),
            Err(BuildError::TooManyLoops)
        ));
    }

    #[test]
    fn branch_into_exception_handler_is_rejected() {
        let code = vec![
            GOTO, 0, 4, // 0: -> 4
            NOP,        // 3
            NOP,        // 4: handler entry
            RETURN,     // 5
        ];
        let arenas = PoolArenas::new();
        let pool = ConstantPool::new(&arenas);
        let mut method = static_method(&pool, code);
        method.exception_handlers.push(ExceptionHandler {
            start_bci: 0,
            end_bci: 3,
            handler_bci: 4,
            catch_type: None,
        });
        assert!(matches!(
            BlockMap::build(&method, &BuildConfig::default()),
            Err(BuildError::ExceptionEntryReachedNormally { handler_bci: 4 })
        ));
    }

    #[test]
    fn loop_formed_by_exception_handler_is_rejected() {
        // the handler entry covers its own range, so the dispatch chain
        // loops back into it
        let code = vec![
            INVOKESTATIC, 0, 0, // 0: trapping call covered by the handler
            RETURN,             // 3
        ];
        let arenas = PoolArenas::new();
        let pool = ConstantPool::new(&arenas);
        let mut method = static_method(&pool, code);
        let holder = method.declaration.holder;
        let callee = pool.add_method(MethodData::new(
            holder,
            "callee",
            MethodSig::new(vec![], Kind::Void),
            MethodAccessFlags::STATIC,
        ));
        method.constants.push(PoolEntry::Method(callee));
        method.exception_handlers.push(ExceptionHandler {
            start_bci: 0,
            end_bci: 3,
            handler_bci: 0,
            catch_type: None,
        });
        assert!(matches!(
            BlockMap::build(&method, &BuildConfig::default()),
            Err(BuildError::LoopThroughExceptionHandler)
        ));
    }

    #[test]
    fn catch_all_dispatch_has_exactly_one_successor() {
        let code = vec![
            ALOAD_0,    // 0
            ILOAD_1,    // 1
            ILOAD_2,    // 2
            IASTORE,    // 3: trapping, covered
            GOTO, 0, 4, // 4: -> 8
            ASTORE_3,   // 7: handler entry
            RETURN,     // 8
        ];
        let arenas = PoolArenas::new();
        let pool = ConstantPool::new(&arenas);
        let mut method = static_method(&pool, code);
        method.exception_handlers.push(ExceptionHandler {
            start_bci: 0,
            end_bci: 4,
            handler_bci: 7,
            catch_type: None,
        });
        let map = BlockMap::build(&method, &BuildConfig::default()).unwrap();

        let dispatch = map
            .order
            .iter()
            .copied()
            .find(|&b| map.block(b).is_dispatch())
            .expect("dispatch block");
        let data = map.block(dispatch);
        assert_eq!(data.successors.len(), 1);
        assert_eq!(map.block(data.successors[0]).start_bci, 7);
        assert!(map.block(data.successors[0]).is_exception_entry);
        assert!(map.can_trap[3]);
    }

    #[test]
    fn subroutine_bodies_are_cloned_per_call_site() {
        let code = vec![
            JSR, 0, 8,  // 0: -> 8
            JSR, 0, 5,  // 3: -> 8
            RETURN,     // 6
            NOP,        // 7
            ASTORE_3,   // 8: subroutine body
            RET, 3,     // 9
        ];
        let arenas = PoolArenas::new();
        let pool = ConstantPool::new(&arenas);
        let method = static_method(&pool, code);
        let map = BlockMap::build(&method, &BuildConfig::default()).unwrap();

        assert!(map.has_subroutines);
        let clones: Vec<BlockId> = map
            .order
            .iter()
            .copied()
            .filter(|&b| map.block(b).start_bci == 8 && !map.block(b).jsr_scope().is_empty())
            .collect();
        assert_eq!(clones.len(), 2, "one body copy per call context");
        let scopes: Vec<SubroutineScope> =
            clones.iter().map(|&b| map.block(b).jsr_scope()).collect();
        assert_ne!(scopes[0], scopes[1]);
    }

    #[test]
    fn never_taken_branch_becomes_a_deopt_block() {
        let code = vec![
            ILOAD_0,    // 0
            IFEQ, 0, 5, // 1: -> 6
            ICONST_0,   // 4
            IRETURN,    // 5
            ICONST_1,   // 6
            IRETURN,    // 7
        ];
        let arenas = PoolArenas::new();
        let pool = ConstantPool::new(&arenas);
        let mut method = static_method(&pool, code);
        method.profile.record_branch_taken(1, 0.0);
        let map = BlockMap::build(&method, &BuildConfig::default()).unwrap();

        let branch = map.block_at(1).unwrap();
        let taken = map.block(branch).successors[0];
        assert!(matches!(map.block(taken).kind, BlockKind::Deopt));

        // without branch prediction the real target is used
        let mut config = BuildConfig::default();
        config.use_branch_prediction = false;
        let map = BlockMap::build(&method, &config).unwrap();
        let branch = map.block_at(1).unwrap();
        let taken = map.block(branch).successors[0];
        assert_eq!(map.block(taken).start_bci, 6);
    }
}
