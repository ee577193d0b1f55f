use crate::pool::{FieldId, MethodId, TypeId};
use crate::Kind;
use std::fmt;
use std::hash::{Hash, Hasher};

/// Index of a node in its [`super::Graph`]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u32);

impl NodeId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// A node reference together with the kind of the value it produces
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct Value {
    pub id: NodeId,
    pub kind: Kind,
}

/// Branch probability attached to a decision node
///
/// Wrapped so node kinds stay hashable; probabilities compare by bit
/// pattern.
#[derive(Debug, Copy, Clone)]
pub struct Probability(pub f64);

impl PartialEq for Probability {
    fn eq(&self, other: &Probability) -> bool {
        self.0.to_bits() == other.0.to_bits()
    }
}

impl Eq for Probability {}

impl Hash for Probability {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.to_bits().hash(state)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Condition {
    Eq,
    Ne,
    Lt,
    Ge,
    Gt,
    Le,
    /// Unsigned below (used by synthesized bounds checks)
    Below,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    And,
    Or,
    Xor,
    Shl,
    Shr,
    Ushr,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[allow(non_camel_case_types)]
pub enum ConvertOp {
    I2L,
    I2F,
    I2D,
    L2I,
    L2F,
    L2D,
    F2I,
    F2L,
    F2D,
    D2I,
    D2L,
    D2F,
    I2B,
    I2C,
    I2S,
}

impl ConvertOp {
    pub fn from_kind(self) -> Kind {
        use ConvertOp::*;
        match self {
            I2L | I2F | I2D | I2B | I2C | I2S => Kind::Int,
            L2I | L2F | L2D => Kind::Long,
            F2I | F2L | F2D => Kind::Float,
            D2I | D2L | D2F => Kind::Double,
        }
    }

    pub fn to_kind(self) -> Kind {
        use ConvertOp::*;
        match self {
            L2I | F2I | D2I | I2B | I2C | I2S => Kind::Int,
            I2L | F2L | D2L => Kind::Long,
            I2F | L2F | D2F => Kind::Float,
            I2D | L2D | F2D => Kind::Double,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum InvokeKind {
    Static,
    Special,
    Virtual,
    Interface,
}

/// What the runtime should do after a deoptimizing node is reached
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum DeoptAction {
    /// Invalidate the compiled code and recompile (e.g. an entry became
    /// resolvable)
    Recompile,
    /// Invalidate and gather fresh profile data first
    Reprofile,
}

/// Exceptions the frontend can synthesize on explicit check paths
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ExceptionKind {
    NullPointer,
    OutOfBounds,
}

/// Compile-time constant carried by a constant node
///
/// Floating-point constants are stored as raw bits so constants can be
/// value-numbered.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ConstValue<'g> {
    Int(i32),
    Long(i64),
    Float(u32),
    Double(u64),
    Null,
    /// Subroutine return address
    RetAddr(i32),
    /// Reference to a class mirror (also used for static field holders)
    Class(TypeId<'g>),
    Str(&'g str),
}

impl<'g> ConstValue<'g> {
    pub fn float(value: f32) -> ConstValue<'g> {
        ConstValue::Float(value.to_bits())
    }

    pub fn double(value: f64) -> ConstValue<'g> {
        ConstValue::Double(value.to_bits())
    }

    pub fn kind(self) -> Kind {
        match self {
            ConstValue::Int(_) => Kind::Int,
            ConstValue::Long(_) => Kind::Long,
            ConstValue::Float(_) => Kind::Float,
            ConstValue::Double(_) => Kind::Double,
            ConstValue::Null | ConstValue::Class(_) | ConstValue::Str(_) => Kind::Object,
            ConstValue::RetAddr(_) => Kind::Address,
        }
    }

    /// Zero/null constant for a kind (what unresolved accesses produce)
    pub fn default_for(kind: Kind) -> ConstValue<'g> {
        match kind.stack_kind() {
            Kind::Int => ConstValue::Int(0),
            Kind::Long => ConstValue::Long(0),
            Kind::Float => ConstValue::float(0.0),
            Kind::Double => ConstValue::double(0.0),
            _ => ConstValue::Null,
        }
    }
}

/// Immutable snapshot of the simulated frame at one program point
///
/// Stack and local slots hold `None` either for the second slot of a
/// two-slot value or for a local proven dead/invalid.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FrameStateData {
    pub bci: i32,
    pub locals: Vec<Option<Value>>,
    pub stack: Vec<Option<Value>>,
    pub locks: Vec<Value>,
    pub rethrow_exception: bool,
}

impl FrameStateData {
    pub fn stack_size(&self) -> usize {
        self.stack.len()
    }

    pub fn locks_size(&self) -> usize {
        self.locks.len()
    }
}

/// The behavior of one graph node.
///
/// Fixed nodes form the control-flow spine (linked through
/// `NodeData::next` and the explicit successor fields below); floating
/// nodes are pure values, value-numbered through [`super::Graph::unique`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum NodeKind<'g> {
    // ---- control spine ----
    Start,
    /// Temporary anchor for a block entry; removed by the final cleanup
    Placeholder,
    /// Kept anchor (exception edges)
    Begin,
    /// Control anchor for a floating check that must not move
    Anchor,
    End {
        merge: Option<NodeId>,
    },
    Merge {
        ends: Vec<NodeId>,
    },
    LoopBegin {
        forward_end: NodeId,
        loop_end: NodeId,
    },
    LoopEnd {
        loop_begin: NodeId,
    },
    If {
        condition: NodeId,
        true_successor: NodeId,
        false_successor: NodeId,
        probability: Probability,
    },
    TableSwitch {
        value: NodeId,
        low_key: i32,
        successors: Vec<NodeId>,
    },
    LookupSwitch {
        value: NodeId,
        keys: Vec<i32>,
        successors: Vec<NodeId>,
    },
    Return {
        value: Option<NodeId>,
    },
    Unwind {
        exception: NodeId,
    },
    Deopt {
        action: DeoptAction,
    },
    Invoke {
        invoke_kind: InvokeKind,
        target: MethodId<'g>,
        args: Vec<NodeId>,
    },
    InvokeWithException {
        invoke_kind: InvokeKind,
        target: MethodId<'g>,
        args: Vec<NodeId>,
        exception_edge: NodeId,
    },
    MonitorEnter {
        object: NodeId,
    },
    MonitorExit {
        object: NodeId,
    },
    LoadField {
        object: NodeId,
        field: FieldId<'g>,
    },
    StoreField {
        object: NodeId,
        field: FieldId<'g>,
        value: NodeId,
    },
    LoadIndexed {
        array: NodeId,
        index: NodeId,
        length: NodeId,
        element_kind: Kind,
    },
    StoreIndexed {
        array: NodeId,
        index: NodeId,
        length: NodeId,
        element_kind: Kind,
        value: NodeId,
    },
    ArrayLength {
        array: NodeId,
    },
    NewInstance {
        class: TypeId<'g>,
    },
    NewTypeArray {
        length: NodeId,
        element_kind: Kind,
    },
    NewObjectArray {
        length: NodeId,
        element_type: TypeId<'g>,
    },
    NewMultiArray {
        element_type: TypeId<'g>,
        dimensions: Vec<NodeId>,
    },
    /// Produces the exception object flowing into a dispatch path
    ExceptionObject,
    /// Runtime call materializing a synthesized exception
    CreateException {
        exception: ExceptionKind,
        args: Vec<NodeId>,
    },
    FixedGuard {
        condition: NodeId,
    },
    ValueAnchor {
        value: Option<NodeId>,
    },
    /// Frame state snapshot attached to state-splitting nodes
    FrameState(FrameStateData),

    // ---- floating values ----
    Constant {
        value: ConstValue<'g>,
    },
    Parameter {
        index: usize,
    },
    Binary {
        op: BinaryOp,
        kind: Kind,
        x: NodeId,
        y: NodeId,
    },
    Negate {
        x: NodeId,
    },
    NormalizeCompare {
        x: NodeId,
        y: NodeId,
        unordered_less: bool,
    },
    Convert {
        op: ConvertOp,
        input: NodeId,
    },
    Compare {
        condition: Condition,
        x: NodeId,
        y: NodeId,
    },
    IsNull {
        object: NodeId,
        negated: bool,
    },
    InstanceOf {
        class: TypeId<'g>,
        object: NodeId,
    },
    CheckCast {
        class: TypeId<'g>,
        object: NodeId,
        anchor: NodeId,
    },
    /// Conditional-to-integer materialization
    Materialize {
        condition: NodeId,
    },
    Phi {
        merge: NodeId,
        inputs: Vec<NodeId>,
    },
}

impl<'g> NodeKind<'g> {
    /// Is this a pure value node (unordered, value-numberable)?
    pub fn is_floating(&self) -> bool {
        matches!(
            self,
            NodeKind::Constant { .. }
                | NodeKind::Parameter { .. }
                | NodeKind::Binary { .. }
                | NodeKind::Negate { .. }
                | NodeKind::NormalizeCompare { .. }
                | NodeKind::Convert { .. }
                | NodeKind::Compare { .. }
                | NodeKind::IsNull { .. }
                | NodeKind::InstanceOf { .. }
                | NodeKind::CheckCast { .. }
                | NodeKind::Materialize { .. }
                | NodeKind::Phi { .. }
        )
    }

    /// Does this fixed node take a frame state after the instruction?
    pub fn needs_state_after(&self) -> bool {
        matches!(
            self,
            NodeKind::Invoke { .. }
                | NodeKind::InvokeWithException { .. }
                | NodeKind::MonitorEnter { .. }
                | NodeKind::MonitorExit { .. }
        )
    }

    /// Does this node always terminate its basic block?
    pub fn is_block_end(&self) -> bool {
        matches!(
            self,
            NodeKind::If { .. }
                | NodeKind::TableSwitch { .. }
                | NodeKind::LookupSwitch { .. }
                | NodeKind::Return { .. }
                | NodeKind::Unwind { .. }
                | NodeKind::Deopt { .. }
                | NodeKind::InvokeWithException { .. }
        )
    }
}

/// Storage for one node
pub struct NodeData<'g> {
    pub kind: NodeKind<'g>,
    /// Kind of the produced value (`Void` for pure control nodes)
    pub result: Kind,
    /// Control successor of a fixed-with-next node
    pub next: Option<NodeId>,
    /// Control predecessor (the unique incoming control edge)
    pub predecessor: Option<NodeId>,
    /// Attached frame state, for state splits
    pub state_after: Option<NodeId>,
    pub deleted: bool,
}

impl<'g> fmt::Debug for NodeData<'g> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("NodeData")
            .field("kind", &self.kind)
            .field("result", &self.result)
            .field("next", &self.next)
            .field("deleted", &self.deleted)
            .finish_non_exhaustive()
    }
}
