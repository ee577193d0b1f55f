//! Raw instruction stream decoding
//!
//! The frontend's input is the undecoded instruction bytes of one method.
//! [`BytecodeStream`] is a cursor over those bytes; [`opcodes`] holds the
//! numeric opcode constants the rest of the crate dispatches on.

pub mod opcodes;
mod stream;

pub use stream::*;
