//! Decompiler for the GML VM's stack bytecode.
//!
//! The pipeline turns a flat instruction stream into a structured source
//! listing in four stages: basic blocks and a control flow graph, structural
//! recovery (short circuits, loops, conditionals, switches, try/catch) that
//! rewrites the graph into a hierarchy, an abstract stack simulator that
//! rebuilds expressions and statements, and a precedence-aware printer.

pub mod bytecode;
pub mod decompiler;
pub mod pretty;

pub use decompiler::decompile::{decompile, decompile_to_string, Decompiled};
pub use decompiler::errors::{DecompileError, DecompileWarning};
pub use decompiler::Settings;
