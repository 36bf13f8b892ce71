//! The decompilation pipeline: blocks, structural recovery, simulation,
//! printing.

pub mod ast;
pub mod blocks;
pub mod cfg;
pub mod context;
pub mod decompile;
pub mod errors;
pub mod passes;
pub mod printer;
pub mod simulate;

pub use context::{DecompileContext, Settings};
