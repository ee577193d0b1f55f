//! Operand stack, locals, and monitor simulation
//!
//! While a block's instructions are replayed, the simulator tracks which
//! graph value sits in every stack cell and local slot, plus the stack of
//! held monitors and the rethrow flag of exception dispatch states.
//! Immutable [`FrameStateData`] snapshots are taken at merge points and
//! state splits; the simulator can later be reset from any snapshot when
//! a queued block starts parsing.
//!
//! All operations are kind-checked. A kind mismatch or stack
//! under/overflow here is a frontend bug (the upstream verifier rules
//! those out), so these are panics rather than reported bailouts.

use crate::graph::{FrameStateData, Graph, NodeKind, Value};
use crate::pool::Method;
use crate::Kind;

/// Synthetic state offsets for the method prologue and epilogues
pub const BEFORE_BCI: i32 = -2;
pub const AFTER_BCI: i32 = -3;
pub const AFTER_EXCEPTION_BCI: i32 = -4;

pub struct FrameStateSimulator {
    locals: Vec<Option<Value>>,
    stack: Vec<Option<Value>>,
    stack_size: usize,
    locks: Vec<Value>,
    rethrow_exception: bool,
}

impl FrameStateSimulator {
    /// Simulator positioned at method entry: parameters in the first
    /// local slots (the receiver in slot 0 for instance methods), empty
    /// stack, no monitors held
    pub fn new(method: &Method, graph: &mut Graph) -> FrameStateSimulator {
        let mut simulator = FrameStateSimulator {
            locals: vec![None; method.max_locals],
            stack: vec![None; method.max_stack.max(1)],
            stack_size: 0,
            locks: Vec::new(),
            rethrow_exception: false,
        };

        let mut slot = 0;
        let mut index = 0;
        if !method.is_static() {
            let receiver = graph.unique(NodeKind::Parameter { index }, Kind::Object);
            simulator.locals[slot] = Some(graph.value(receiver));
            slot += 1;
            index += 1;
        }
        for &param in &method.signature().params {
            let kind = param.stack_kind();
            let node = graph.unique(NodeKind::Parameter { index }, kind);
            simulator.locals[slot] = Some(graph.value(node));
            slot += param.slots();
            index += 1;
        }
        simulator
    }

    /// Are values of `have` usable where the instruction expects `want`?
    /// Subroutine return addresses travel through the reference-kinded
    /// local load/store instructions.
    fn kinds_compatible(want: Kind, have: Kind) -> bool {
        have == want.stack_kind() || (want == Kind::Object && have == Kind::Address)
    }

    /// Push a value of a known kind; a two-slot kind occupies an extra
    /// sentinel cell
    pub fn push(&mut self, kind: Kind, value: Value) {
        assert_ne!(kind, Kind::Void, "pushing a void value");
        assert!(
            Self::kinds_compatible(kind, value.kind),
            "pushed value has wrong kind"
        );
        self.xpush(Some(value));
        if kind.is_two_slot() {
            self.xpush(None);
        }
    }

    /// Pop a value of a known kind, consuming the sentinel cell of
    /// two-slot kinds
    pub fn pop(&mut self, kind: Kind) -> Value {
        if kind.is_two_slot() {
            let sentinel = self.xpop();
            assert!(sentinel.is_none(), "two-slot value missing its sentinel");
        }
        let value = self.xpop().expect("popped an empty or sentinel cell");
        assert!(
            Self::kinds_compatible(kind, value.kind),
            "popped value has wrong kind"
        );
        value
    }

    /// Raw single-cell push (stack manipulation instructions)
    pub fn xpush(&mut self, cell: Option<Value>) {
        assert!(self.stack_size < self.stack.len(), "operand stack overflow");
        self.stack[self.stack_size] = cell;
        self.stack_size += 1;
    }

    /// Raw single-cell pop
    pub fn xpop(&mut self) -> Option<Value> {
        assert!(self.stack_size > 0, "operand stack underflow");
        self.stack_size -= 1;
        self.stack[self.stack_size].take()
    }

    /// The `n`-th value from the top of the stack, not counting sentinel
    /// cells
    pub fn peek(&self, n: usize) -> Value {
        let mut remaining = n;
        for index in (0..self.stack_size).rev() {
            if let Some(value) = self.stack[index] {
                if remaining == 0 {
                    return value;
                }
                remaining -= 1;
            }
        }
        panic!("peek({}) past the bottom of the stack", n);
    }

    /// Pop `slots` stack cells and return the argument values in call
    /// order
    pub fn pop_arguments(&mut self, slots: usize) -> Vec<Value> {
        let mut args = Vec::new();
        for _ in 0..slots {
            if let Some(value) = self.xpop() {
                args.push(value);
            }
        }
        args.reverse();
        args
    }

    pub fn stack_size(&self) -> usize {
        self.stack_size
    }

    pub fn clear_stack(&mut self) {
        for cell in &mut self.stack[..self.stack_size] {
            *cell = None;
        }
        self.stack_size = 0;
    }

    /// Push a call's return value, if it has one
    pub fn push_return(&mut self, kind: Kind, value: Value) {
        if kind != Kind::Void {
            self.push(kind.stack_kind(), value);
        }
    }

    pub fn load_local(&self, index: usize) -> Value {
        self.locals[index]
            .unwrap_or_else(|| panic!("load of invalid local {}", index))
    }

    pub fn local_at(&self, index: usize) -> Option<Value> {
        self.locals[index]
    }

    /// Store into a local slot. A two-slot value invalidates the slot
    /// above; any store invalidates a two-slot value that previously
    /// started in the slot below.
    pub fn store_local(&mut self, index: usize, value: Value) {
        self.locals[index] = Some(value);
        if value.kind.is_two_slot() {
            self.locals[index + 1] = None;
        }
        if index > 0 {
            if let Some(below) = self.locals[index - 1] {
                if below.kind.is_two_slot() {
                    self.locals[index - 1] = None;
                }
            }
        }
    }

    pub fn lock(&mut self, object: Value) {
        self.locks.push(object);
    }

    pub fn unlock(&mut self, object: Value) {
        let popped = self.locks.pop().expect("unlock with no monitor held");
        assert_eq!(popped, object, "unlocked object does not match monitor stack");
    }

    pub fn locks_size(&self) -> usize {
        self.locks.len()
    }

    pub fn rethrow_exception(&self) -> bool {
        self.rethrow_exception
    }

    pub fn set_rethrow_exception(&mut self, rethrow: bool) {
        self.rethrow_exception = rethrow;
    }

    /// Immutable snapshot of the current state
    pub fn snapshot(&self, bci: i32) -> FrameStateData {
        FrameStateData {
            bci,
            locals: self.locals.clone(),
            stack: self.stack[..self.stack_size].to_vec(),
            locks: self.locks.clone(),
            rethrow_exception: self.rethrow_exception,
        }
    }

    /// Snapshot with the operand stack dropped (exception edge entry)
    pub fn duplicate_without_stack(&self, bci: i32) -> FrameStateData {
        FrameStateData {
            bci,
            locals: self.locals.clone(),
            stack: Vec::new(),
            locks: self.locks.clone(),
            rethrow_exception: self.rethrow_exception,
        }
    }

    /// Snapshot with the stack forced to exactly the in-flight exception
    /// object (exception dispatch entry)
    pub fn duplicate_with_exception(&self, bci: i32, exception: Value) -> FrameStateData {
        FrameStateData {
            bci,
            locals: self.locals.clone(),
            stack: vec![Some(exception)],
            locks: self.locks.clone(),
            rethrow_exception: true,
        }
    }

    /// Reset the simulator to a previously taken snapshot
    pub fn initialize_from(&mut self, state: &FrameStateData) {
        assert_eq!(state.locals.len(), self.locals.len());
        assert!(state.stack.len() <= self.stack.len());
        self.locals.copy_from_slice(&state.locals);
        for cell in &mut self.stack {
            *cell = None;
        }
        self.stack[..state.stack.len()].copy_from_slice(&state.stack);
        self.stack_size = state.stack.len();
        self.locks = state.locks.clone();
        self.rethrow_exception = state.rethrow_exception;
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::graph::{ConstValue, NodeKind};
    use crate::pool::{
        ConstantPool, Method, MethodAccessFlags, MethodData, MethodSig, PoolArenas, TypeData,
    };

    fn test_setup<'g>(
        pool: &'g ConstantPool<'g>,
        params: Vec<Kind>,
        flags: MethodAccessFlags,
    ) -> (Method<'g>, Graph<'g>) {
        let object = pool.add_type(TypeData::new("java/lang/Object", None));
        let holder = pool.add_type(TypeData::new("Test", Some(object)));
        let declaration = pool.add_method(MethodData::new(
            holder,
            "test",
            MethodSig::new(params, Kind::Void),
            flags,
        ));
        (Method::new(declaration, vec![], 8, 8), Graph::new())
    }

    fn int_value(graph: &mut Graph, n: i32) -> Value {
        let id = graph.unique(
            NodeKind::Constant {
                value: ConstValue::Int(n),
            },
            Kind::Int,
        );
        graph.value(id)
    }

    fn long_value(graph: &mut Graph, n: i64) -> Value {
        let id = graph.unique(
            NodeKind::Constant {
                value: ConstValue::Long(n),
            },
            Kind::Long,
        );
        graph.value(id)
    }

    #[test]
    fn two_slot_push_pop_restores_height() {
        let arenas = PoolArenas::new();
        let pool = ConstantPool::new(&arenas);
        let (method, mut graph) = test_setup(&pool, vec![], MethodAccessFlags::STATIC);
        let mut frame = FrameStateSimulator::new(&method, &mut graph);

        let before = frame.stack_size();
        let value = long_value(&mut graph, 42);
        frame.push(Kind::Long, value);
        assert_eq!(frame.stack_size(), before + 2);
        assert_eq!(frame.pop(Kind::Long), value);
        assert_eq!(frame.stack_size(), before);
    }

    #[test]
    fn two_slot_store_invalidates_high_slot() {
        let arenas = PoolArenas::new();
        let pool = ConstantPool::new(&arenas);
        let (method, mut graph) = test_setup(&pool, vec![], MethodAccessFlags::STATIC);
        let mut frame = FrameStateSimulator::new(&method, &mut graph);

        let int = int_value(&mut graph, 7);
        frame.store_local(1, int);
        let long = long_value(&mut graph, 9);
        frame.store_local(0, long);
        assert!(frame.local_at(1).is_none());

        // storing over the high half invalidates the two-slot value below
        frame.store_local(1, int);
        assert!(frame.local_at(0).is_none());
        assert_eq!(frame.local_at(1), Some(int));
    }

    #[test]
    fn receiver_occupies_slot_zero() {
        let arenas = PoolArenas::new();
        let pool = ConstantPool::new(&arenas);
        let (method, mut graph) =
            test_setup(&pool, vec![Kind::Long, Kind::Int], MethodAccessFlags::empty());
        let frame = FrameStateSimulator::new(&method, &mut graph);

        assert_eq!(frame.local_at(0).unwrap().kind, Kind::Object);
        assert_eq!(frame.local_at(1).unwrap().kind, Kind::Long);
        assert!(frame.local_at(2).is_none());
        assert_eq!(frame.local_at(3).unwrap().kind, Kind::Int);
    }

    #[test]
    fn peek_skips_sentinel_cells() {
        let arenas = PoolArenas::new();
        let pool = ConstantPool::new(&arenas);
        let (method, mut graph) = test_setup(&pool, vec![], MethodAccessFlags::STATIC);
        let mut frame = FrameStateSimulator::new(&method, &mut graph);

        let array = int_value(&mut graph, 1);
        let index = int_value(&mut graph, 2);
        let value = long_value(&mut graph, 3);
        frame.push(Kind::Int, array);
        frame.push(Kind::Int, index);
        frame.push(Kind::Long, value);

        assert_eq!(frame.peek(0), value);
        assert_eq!(frame.peek(1), index);
        assert_eq!(frame.peek(2), array);
    }

    #[test]
    fn pop_arguments_returns_call_order() {
        let arenas = PoolArenas::new();
        let pool = ConstantPool::new(&arenas);
        let (method, mut graph) = test_setup(&pool, vec![], MethodAccessFlags::STATIC);
        let mut frame = FrameStateSimulator::new(&method, &mut graph);

        let a = int_value(&mut graph, 1);
        let b = long_value(&mut graph, 2);
        let c = int_value(&mut graph, 3);
        frame.push(Kind::Int, a);
        frame.push(Kind::Long, b);
        frame.push(Kind::Int, c);

        assert_eq!(frame.pop_arguments(4), vec![a, b, c]);
        assert_eq!(frame.stack_size(), 0);
    }

    #[test]
    fn snapshot_and_initialize_round_trip() {
        let arenas = PoolArenas::new();
        let pool = ConstantPool::new(&arenas);
        let (method, mut graph) = test_setup(&pool, vec![], MethodAccessFlags::STATIC);
        let mut frame = FrameStateSimulator::new(&method, &mut graph);

        let value = int_value(&mut graph, 5);
        frame.push(Kind::Int, value);
        frame.store_local(2, value);
        frame.lock(value);
        let state = frame.snapshot(10);

        frame.clear_stack();
        frame.unlock(value);
        frame.initialize_from(&state);
        assert_eq!(frame.stack_size(), 1);
        assert_eq!(frame.pop(Kind::Int), value);
        assert_eq!(frame.local_at(2), Some(value));
        assert_eq!(frame.locks_size(), 1);
    }

    #[test]
    fn exception_duplicate_forces_stack_to_exception() {
        let arenas = PoolArenas::new();
        let pool = ConstantPool::new(&arenas);
        let (method, mut graph) = test_setup(&pool, vec![], MethodAccessFlags::STATIC);
        let mut frame = FrameStateSimulator::new(&method, &mut graph);

        frame.push(Kind::Int, int_value(&mut graph, 1));
        frame.push(Kind::Int, int_value(&mut graph, 2));

        let exception_node = graph.add(NodeKind::ExceptionObject, Kind::Object);
        let exception = graph.value(exception_node);
        let state = frame.duplicate_with_exception(3, exception);
        assert_eq!(state.stack.len(), 1);
        assert_eq!(state.stack[0], Some(exception));
        assert!(state.rethrow_exception);
    }
}
