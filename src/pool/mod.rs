//! Constant pool and resolution handles
//!
//! The frontend does not load classes itself: it consumes type, method,
//! and field handles from a resolver that distinguishes *resolved* from
//! *unresolved* entries. Unresolved entries are still usable — the graph
//! builder lowers accesses through them to deoptimizing stubs instead of
//! direct nodes.
//!
//! Handles are references into arenas owned by the caller (the `'g`
//! lifetime), so they are `Copy` and compare by identity. A
//! [`ConstantPool`] interns [`TypeData`] by name and deduplicates member
//! declarations, so the same declaration always yields the same handle.

mod method;

pub use method::*;

use crate::Kind;
use elsa::map::FrozenMap;
use elsa::FrozenVec;
use std::cell::Cell;
use std::fmt;
use std::hash::{Hash, Hasher};
use typed_arena::Arena;

/// Handle whose identity for equality and hashing is the reference itself
/// (ie. the pointer), not the referenced data
pub struct Id<'g, T>(pub &'g T);

impl<'g, T> Clone for Id<'g, T> {
    fn clone(&self) -> Self {
        Id(self.0)
    }
}

impl<'g, T> Copy for Id<'g, T> {}

impl<'g, T> Hash for Id<'g, T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::ptr::hash(self.0, state)
    }
}

impl<'g, T> PartialEq for Id<'g, T> {
    fn eq(&self, other: &Id<'g, T>) -> bool {
        std::ptr::eq(self.0, other.0)
    }
}

impl<'g, T> Eq for Id<'g, T> {}

impl<'g, T> std::ops::Deref for Id<'g, T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.0
    }
}

impl<'g, T: fmt::Debug> fmt::Debug for Id<'g, T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.0.fmt(f)
    }
}

pub type TypeId<'g> = Id<'g, TypeData<'g>>;
pub type MethodId<'g> = Id<'g, MethodData<'g>>;
pub type FieldId<'g> = Id<'g, FieldData<'g>>;

/// Arenas backing one constant pool
pub struct PoolArenas<'g> {
    type_arena: Arena<TypeData<'g>>,
    method_arena: Arena<MethodData<'g>>,
    field_arena: Arena<FieldData<'g>>,
    string_arena: Arena<String>,
}

impl<'g> PoolArenas<'g> {
    pub fn new() -> Self {
        PoolArenas {
            type_arena: Arena::new(),
            method_arena: Arena::new(),
            field_arena: Arena::new(),
            string_arena: Arena::new(),
        }
    }
}

impl<'g> Default for PoolArenas<'g> {
    fn default() -> Self {
        PoolArenas::new()
    }
}

/// Pool of type, method, and field declarations
pub struct ConstantPool<'g> {
    arenas: &'g PoolArenas<'g>,
    types: FrozenMap<&'g str, &'g TypeData<'g>>,
}

impl<'g> ConstantPool<'g> {
    pub fn new(arenas: &'g PoolArenas<'g>) -> ConstantPool<'g> {
        ConstantPool {
            arenas,
            types: FrozenMap::new(),
        }
    }

    /// Add a type, interning by name
    pub fn add_type(&'g self, data: TypeData<'g>) -> TypeId<'g> {
        if let Some(existing) = self.types.get(data.name.as_str()) {
            return Id(existing);
        }
        let data = &*self.arenas.type_arena.alloc(data);
        self.types.insert(&data.name, data);
        Id(data)
    }

    pub fn lookup_type(&'g self, name: &str) -> Option<TypeId<'g>> {
        self.types.get(name).map(Id)
    }

    /// Add a method declaration to its holder, deduplicating by name and
    /// signature
    pub fn add_method(&self, data: MethodData<'g>) -> MethodId<'g> {
        let holder: &'g TypeData<'g> = data.holder.0;
        if let Some(existing) = holder
            .methods
            .iter()
            .find(|m| m.name == data.name && m.signature == data.signature)
        {
            return Id(existing);
        }
        let data = &*self.arenas.method_arena.alloc(data);
        holder.methods.push(data);
        Id(data)
    }

    /// Add a field declaration to its holder, deduplicating by name
    pub fn add_field(&self, data: FieldData<'g>) -> FieldId<'g> {
        let holder: &'g TypeData<'g> = data.holder.0;
        if let Some(existing) = holder.fields.iter().find(|f| f.name == data.name) {
            return Id(existing);
        }
        let data = &*self.arenas.field_arena.alloc(data);
        holder.fields.push(data);
        Id(data)
    }

    pub fn intern_string(&self, value: String) -> &'g str {
        self.arenas.string_arena.alloc(value)
    }
}

/// A class or interface known to the pool
pub struct TypeData<'g> {
    pub name: String,
    pub superclass: Option<TypeId<'g>>,
    pub is_interface: bool,
    /// Whether the runtime has resolved (and initialized) this type.
    /// Unresolved types force deoptimizing stubs at their use sites.
    pub resolved: Cell<bool>,
    pub methods: FrozenVec<&'g MethodData<'g>>,
    pub fields: FrozenVec<&'g FieldData<'g>>,
}

impl<'g> TypeData<'g> {
    pub fn new(name: impl Into<String>, superclass: Option<TypeId<'g>>) -> TypeData<'g> {
        TypeData {
            name: name.into(),
            superclass,
            is_interface: false,
            resolved: Cell::new(true),
            methods: FrozenVec::new(),
            fields: FrozenVec::new(),
        }
    }

    pub fn unresolved(name: impl Into<String>) -> TypeData<'g> {
        let data = TypeData::new(name, None);
        data.resolved.set(false);
        data
    }

    pub fn is_resolved(&self) -> bool {
        self.resolved.get()
    }
}

impl<'g> fmt::Debug for TypeData<'g> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TypeData")
            .field("name", &self.name)
            .field("resolved", &self.resolved.get())
            .finish_non_exhaustive()
    }
}

/// A method declaration
pub struct MethodData<'g> {
    pub holder: TypeId<'g>,
    pub name: String,
    pub signature: MethodSig,
    pub flags: MethodAccessFlags,
    pub resolved: Cell<bool>,
}

impl<'g> MethodData<'g> {
    pub fn new(
        holder: TypeId<'g>,
        name: impl Into<String>,
        signature: MethodSig,
        flags: MethodAccessFlags,
    ) -> MethodData<'g> {
        MethodData {
            holder,
            name: name.into(),
            signature,
            flags,
            resolved: Cell::new(true),
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.resolved.get() && self.holder.is_resolved()
    }

    pub fn is_static(&self) -> bool {
        self.flags.contains(MethodAccessFlags::STATIC)
    }

    /// Can an indirect call to this method be lowered to a direct one?
    pub fn can_be_statically_bound(&self) -> bool {
        self.flags
            .intersects(MethodAccessFlags::FINAL | MethodAccessFlags::PRIVATE | MethodAccessFlags::STATIC)
    }
}

impl<'g> fmt::Debug for MethodData<'g> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("MethodData")
            .field("holder", &self.holder.name)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// A field declaration
pub struct FieldData<'g> {
    pub holder: TypeId<'g>,
    pub name: String,
    pub kind: Kind,
    pub resolved: Cell<bool>,
}

impl<'g> FieldData<'g> {
    pub fn new(holder: TypeId<'g>, name: impl Into<String>, kind: Kind) -> FieldData<'g> {
        FieldData {
            holder,
            name: name.into(),
            kind,
            resolved: Cell::new(true),
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.resolved.get() && self.holder.is_resolved()
    }
}

impl<'g> fmt::Debug for FieldData<'g> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("FieldData")
            .field("holder", &self.holder.name)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Parameter and return kinds of a method
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodSig {
    pub params: Vec<Kind>,
    pub return_kind: Kind,
}

impl MethodSig {
    pub fn new(params: Vec<Kind>, return_kind: Kind) -> MethodSig {
        MethodSig {
            params,
            return_kind,
        }
    }

    pub fn arg_count(&self, with_receiver: bool) -> usize {
        self.params.len() + usize::from(with_receiver)
    }

    /// Number of stack slots the arguments occupy
    pub fn arg_slots(&self, with_receiver: bool) -> usize {
        self.params.iter().map(|k| k.slots()).sum::<usize>() + usize::from(with_receiver)
    }
}

/// A loadable constant pool entry
#[derive(Debug, Copy, Clone)]
pub enum ConstantData<'g> {
    Integer(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    String(&'g str),
    Class(TypeId<'g>),
}

/// One slot of a method's constant table
#[derive(Debug, Copy, Clone)]
pub enum PoolEntry<'g> {
    Type(TypeId<'g>),
    Method(MethodId<'g>),
    Field(FieldId<'g>),
    Constant(ConstantData<'g>),
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn ids_compare_by_identity() {
        let arenas = PoolArenas::new();
        let pool = ConstantPool::new(&arenas);

        let object = pool.add_type(TypeData::new("java/lang/Object", None));
        let a = pool.add_type(TypeData::new("A", Some(object)));
        let again = pool.add_type(TypeData::new("A", Some(object)));
        assert_eq!(a, again);
        assert_ne!(a, object);
    }

    #[test]
    fn members_deduplicate() {
        let arenas = PoolArenas::new();
        let pool = ConstantPool::new(&arenas);
        let object = pool.add_type(TypeData::new("java/lang/Object", None));

        let sig = MethodSig::new(vec![Kind::Int], Kind::Int);
        let m1 = pool.add_method(MethodData::new(
            object,
            "hash",
            sig.clone(),
            MethodAccessFlags::empty(),
        ));
        let m2 = pool.add_method(MethodData::new(
            object,
            "hash",
            sig,
            MethodAccessFlags::empty(),
        ));
        assert_eq!(m1, m2);

        let f1 = pool.add_field(FieldData::new(object, "x", Kind::Int));
        let f2 = pool.add_field(FieldData::new(object, "x", Kind::Int));
        assert_eq!(f1, f2);
    }

    #[test]
    fn arg_slots_count_two_slot_kinds() {
        let sig = MethodSig::new(vec![Kind::Long, Kind::Int, Kind::Double], Kind::Void);
        assert_eq!(sig.arg_slots(false), 5);
        assert_eq!(sig.arg_slots(true), 6);
        assert_eq!(sig.arg_count(true), 4);
    }
}
