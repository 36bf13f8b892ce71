//! Short-circuit recovery.
//!
//! The compiler lowers `&&`/`||` to a cascade of conditional branches that
//! all target one terminator block holding a single constant push: the value
//! the chain produces when a condition short-circuits. Each condition that
//! does not short-circuit falls through to the next one; the last condition
//! branches over the terminator carrying its own value.
//!
//! Payload 0 marks an `&&` chain, anything else an `||` chain.

use crate::bytecode::{DataType, Opcode, Value};
use crate::decompiler::cfg::{LogicKind, NodeId, NodeKind};
use crate::decompiler::context::DecompileContext;
use crate::decompiler::errors::DecompileError;

pub fn find_short_circuits(ctx: &mut DecompileContext) -> Result<(), DecompileError> {
    // Skip the entry block: a terminator always has conditions before it.
    for i in 1..ctx.blocks.len() {
        let block = ctx.blocks[i];
        if let Some(kind) = terminator_kind(ctx, block) {
            build_short_circuit(ctx, block, kind)?;
        }
    }
    Ok(())
}

/// A terminator is a block holding exactly one `Int16` push (opcode varies
/// by bytecode version), every predecessor of which ends in a conditional
/// branch aimed at it.
fn terminator_kind(ctx: &DecompileContext, block: NodeId) -> Option<LogicKind> {
    let node = ctx.cfg.node(block);
    let range = node.instrs()?;
    if range.len() != 1 {
        return None;
    }
    let instr = &ctx.entry.instructions[range.start];
    let expected = if ctx.settings.old_bytecode {
        Opcode::PushImmediate
    } else {
        Opcode::Push
    };
    if instr.opcode != expected || instr.type1 != DataType::Int16 {
        return None;
    }
    if node.preds.is_empty() {
        return None;
    }
    for &p in &node.preds {
        let last = ctx.cfg.node(p).last_instr_index()?;
        let branch = &ctx.entry.instructions[last];
        if !matches!(branch.opcode, Opcode::BranchTrue | Opcode::BranchFalse) {
            return None;
        }
        if ctx.cfg.node(p).succs.get(1) != Some(&block) {
            return None;
        }
    }
    match instr.value {
        Value::Int16(0) => Some(LogicKind::And),
        Value::Int16(_) => Some(LogicKind::Or),
        _ => None,
    }
}

fn build_short_circuit(
    ctx: &mut DecompileContext,
    terminator: NodeId,
    kind: LogicKind,
) -> Result<(), DecompileError> {
    let address = ctx.cfg.node(terminator).start;
    let preds = ctx.cfg.node(terminator).preds.clone();

    // Condition entries: the first predecessor itself, then where each
    // predecessor falls through when its condition does not short-circuit.
    let mut conditions = vec![preds[0]];
    for &p in &preds {
        let ft = ctx.cfg.node(p).succs.first().copied().ok_or(
            DecompileError::MalformedShortCircuit { address },
        )?;
        conditions.push(ft);
    }

    // The last condition carries its value over the terminator with an
    // unconditional branch; it is also the block physically preceding the
    // terminator, whose trailing branch gets stripped.
    let last = *conditions.last().expect("at least two conditions");
    let last_ok = ctx
        .cfg
        .node(last)
        .last_instr_index()
        .map(|i| ctx.entry.instructions[i].opcode == Opcode::Branch)
        .unwrap_or(false);
    if !last_ok {
        return Err(DecompileError::MalformedShortCircuit { address });
    }

    // Strip the conditional branches and detach each condition's exits,
    // branch edge first.
    for &p in &preds {
        ctx.cfg.shrink_back(p, 1);
        ctx.cfg.cut_all_succs(p);
    }
    ctx.cfg.shrink_back(last, 1);
    ctx.cfg.cut_all_succs(last);

    // The terminator's push never executes in recovered source.
    ctx.cfg.shrink_back(terminator, 1);

    let start = ctx.cfg.node(conditions[0]).start;
    let end = ctx.cfg.node(terminator).end;
    let composite = ctx.cfg.add_node(start, end, NodeKind::ShortCircuit {
        kind,
        conditions: conditions.clone(),
    });
    ctx.cfg.insert_structure(conditions[0], terminator, composite);
    for &c in &conditions {
        ctx.cfg.reparent_chain(c, composite);
    }
    ctx.cfg.set_parent(terminator, composite);
    ctx.short_circuits.push(composite);

    tracing::debug!(?kind, address, "recovered short circuit");
    Ok(())
}
