//! Compile stack-machine bytecode into a graph IR
//!
//! ### Structure
//!
//! This crate is the frontend of a method-level just-in-time compiler:
//! it turns the instruction stream of a single method into a graph of
//! fixed (control-ordered) and floating (pure value) nodes, suitable for
//! a downstream optimizer and code generator. The interesting work is in
//! [`frontend`]:
//!
//!   - block discovery and loop detection ([`frontend::BlockMap`])
//!   - operand stack/locals simulation ([`frontend::FrameStateSimulator`])
//!   - graph construction and frame-state merging
//!     ([`frontend::build_graph`])
//!
//! [`bytecode`] decodes the raw instruction bytes, [`pool`] supplies
//! resolved-or-unresolved type/method/field handles, and [`graph`] holds
//! the produced IR.
//!
//! ### Simple example
//!
//! Compiling a tiny static method that adds its two arguments:
//!
//! ```
//! use bc2ir::bytecode::opcodes::*;
//! use bc2ir::frontend::{build_graph, BuildConfig};
//! use bc2ir::pool::{
//!     ConstantPool, Method, MethodAccessFlags, MethodData, MethodSig, PoolArenas, TypeData,
//! };
//! use bc2ir::Kind;
//!
//! let arenas = PoolArenas::new();
//! let pool = ConstantPool::new(&arenas);
//! let object = pool.add_type(TypeData::new("java/lang/Object", None));
//! let holder = pool.add_type(TypeData::new("Example", Some(object)));
//! let add = pool.add_method(MethodData::new(
//!     holder,
//!     "add",
//!     MethodSig::new(vec![Kind::Int, Kind::Int], Kind::Int),
//!     MethodAccessFlags::STATIC,
//! ));
//!
//! let method = Method::new(add, vec![ILOAD_0, ILOAD_1, IADD, IRETURN], 2, 2);
//! let graph = build_graph(&method, &BuildConfig::default(), None).unwrap();
//! assert!(graph.node_count() > 0);
//! ```

pub mod bytecode;
pub mod frontend;
pub mod graph;
mod kind;
pub mod pool;

pub use kind::Kind;
