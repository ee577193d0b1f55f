use super::{ConstantData, FieldId, MethodId, MethodSig, PoolEntry, TypeId};
use crate::Kind;
use bitflags::bitflags;
use std::collections::HashMap;

bitflags! {
    /// Access and property flags of a method
    pub struct MethodAccessFlags: u16 {
        const PUBLIC = 0x0001;
        const PRIVATE = 0x0002;
        const PROTECTED = 0x0004;
        const STATIC = 0x0008;
        const FINAL = 0x0010;
        const SYNCHRONIZED = 0x0020;
        const STRICT = 0x0800;
    }
}

/// One entry of a method's exception table, in declaration order
#[derive(Debug, Copy, Clone)]
pub struct ExceptionHandler<'g> {
    pub start_bci: i32,
    pub end_bci: i32,
    pub handler_bci: i32,
    /// `None` is the catch-all handler
    pub catch_type: Option<TypeId<'g>>,
}

impl<'g> ExceptionHandler<'g> {
    /// Does this handler cover the given instruction offset?
    pub fn covers(&self, bci: i32) -> bool {
        self.start_bci <= bci && bci < self.end_bci
    }

    pub fn is_catch_all(&self) -> bool {
        self.catch_type.is_none()
    }
}

/// Profile data recorded for a method by the interpreter
///
/// Only branch-taken probabilities are modeled; everything else the
/// profile could carry is out of scope for the frontend.
#[derive(Debug, Clone, Default)]
pub struct ProfilingInfo {
    branch_taken: HashMap<i32, f64>,
}

impl ProfilingInfo {
    pub fn new() -> ProfilingInfo {
        ProfilingInfo::default()
    }

    pub fn record_branch_taken(&mut self, bci: i32, probability: f64) {
        self.branch_taken.insert(bci, probability);
    }

    /// Probability that the branch at `bci` is taken, if recorded
    pub fn branch_taken_probability(&self, bci: i32) -> Option<f64> {
        self.branch_taken.get(&bci).copied()
    }
}

/// Everything the frontend consumes about one method
pub struct Method<'g> {
    /// Declaration handle of the method being compiled
    pub declaration: MethodId<'g>,
    /// Raw instruction bytes
    pub code: Vec<u8>,
    pub max_locals: usize,
    pub max_stack: usize,
    pub flags: MethodAccessFlags,
    /// Exception table in declaration order
    pub exception_handlers: Vec<ExceptionHandler<'g>>,
    /// Per-method constant table, indexed by the constant pool indexes
    /// appearing in the instruction stream
    pub constants: Vec<PoolEntry<'g>>,
    pub profile: ProfilingInfo,
}

impl<'g> Method<'g> {
    pub fn new(declaration: MethodId<'g>, code: Vec<u8>, max_locals: usize, max_stack: usize) -> Method<'g> {
        let flags = declaration.flags;
        Method {
            declaration,
            code,
            max_locals,
            max_stack,
            flags,
            exception_handlers: vec![],
            constants: vec![],
            profile: ProfilingInfo::new(),
        }
    }

    pub fn is_static(&self) -> bool {
        self.flags.contains(MethodAccessFlags::STATIC)
    }

    pub fn is_synchronized(&self) -> bool {
        self.flags.contains(MethodAccessFlags::SYNCHRONIZED)
    }

    pub fn signature(&self) -> &MethodSig {
        &self.declaration.signature
    }

    pub fn return_kind(&self) -> Kind {
        self.declaration.signature.return_kind
    }

    fn entry(&self, cpi: u16) -> &PoolEntry<'g> {
        self.constants
            .get(cpi as usize)
            .unwrap_or_else(|| panic!("invalid constant pool index {}", cpi))
    }

    pub fn lookup_type(&self, cpi: u16) -> TypeId<'g> {
        match self.entry(cpi) {
            PoolEntry::Type(t) => *t,
            other => panic!("constant pool index {} is not a type: {:?}", cpi, other),
        }
    }

    pub fn lookup_method(&self, cpi: u16) -> MethodId<'g> {
        match self.entry(cpi) {
            PoolEntry::Method(m) => *m,
            other => panic!("constant pool index {} is not a method: {:?}", cpi, other),
        }
    }

    pub fn lookup_field(&self, cpi: u16) -> FieldId<'g> {
        match self.entry(cpi) {
            PoolEntry::Field(f) => *f,
            other => panic!("constant pool index {} is not a field: {:?}", cpi, other),
        }
    }

    pub fn lookup_constant(&self, cpi: u16) -> ConstantData<'g> {
        match self.entry(cpi) {
            PoolEntry::Constant(c) => *c,
            other => panic!("constant pool index {} is not loadable: {:?}", cpi, other),
        }
    }

    /// Force resolution of the entity referenced at `cpi` (eager
    /// resolving mode)
    pub fn load_referenced(&self, cpi: u16) {
        match self.entry(cpi) {
            PoolEntry::Type(t) => t.resolved.set(true),
            PoolEntry::Method(m) => {
                m.resolved.set(true);
                m.holder.resolved.set(true);
            }
            PoolEntry::Field(f) => {
                f.resolved.set(true);
                f.holder.resolved.set(true);
            }
            PoolEntry::Constant(ConstantData::Class(t)) => t.resolved.set(true),
            PoolEntry::Constant(_) => {}
        }
    }
}
