//! The decompilation pipeline: a fixed sequence of passes over one shared
//! context. Fatal errors abort the entry; warnings ride along on the
//! result either way.

use crate::bytecode::CodeEntry;
use crate::decompiler::ast::Statement;
use crate::decompiler::blocks;
use crate::decompiler::context::{DecompileContext, Settings};
use crate::decompiler::errors::{DecompileError, DecompileWarning};
use crate::decompiler::passes::{
    conditionals, fragments, loops, short_circuits, switches, try_catch,
};
use crate::decompiler::{printer, simulate};

/// Decompilation output for one code entry.
#[derive(Debug)]
pub struct Decompiled {
    pub statements: Vec<Statement>,
    pub warnings: Vec<DecompileWarning>,
}

pub fn decompile(entry: &CodeEntry, settings: &Settings) -> Result<Decompiled, DecompileError> {
    tracing::debug!(entry = %entry.name, instructions = entry.instructions.len(), "decompiling");
    let mut ctx = DecompileContext::new(entry, settings);
    blocks::build_blocks(&mut ctx)?;
    fragments::find_fragments(&mut ctx)?;
    short_circuits::find_short_circuits(&mut ctx)?;
    loops::find_loops(&mut ctx)?;
    conditionals::find_conditionals(&mut ctx)?;
    switches::find_switches(&mut ctx)?;
    try_catch::find_try_catch(&mut ctx)?;
    let statements = simulate::build_ast(&mut ctx)?;
    Ok(Decompiled { statements, warnings: ctx.warnings })
}

/// Decompiles and prints in one step.
pub fn decompile_to_string(
    entry: &CodeEntry,
    settings: &Settings,
) -> Result<String, DecompileError> {
    let result = decompile(entry, settings)?;
    Ok(printer::print_program(&result.statements, settings))
}
