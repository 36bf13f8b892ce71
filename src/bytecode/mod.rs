//! Input surface of the decompiler: the instruction record produced by the
//! bytecode loader, the code entry that carries an instruction stream, and
//! the VM intrinsic names the core recognizes.

pub mod builder;
pub mod code;
pub mod constants;
pub mod instructions;

pub use code::CodeEntry;
pub use instructions::*;
