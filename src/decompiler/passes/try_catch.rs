//! Try/catch/finally recovery.
//!
//! The block builder isolated each try-hook call site into a
//! six-instruction block carrying the finally and catch addresses. The try
//! body runs from the hook's fall-through to the catch address (or the
//! finally address when there is no catch); its trailing bypass branch
//! names the common join. A catch chain that opens by storing to a local
//! consumes that store as the catch variable binding.

use crate::bytecode::{InstanceType, Opcode};
use crate::decompiler::blocks::try_hook_block;
use crate::decompiler::cfg::{NodeId, NodeKind};
use crate::decompiler::context::DecompileContext;
use crate::decompiler::errors::DecompileError;

pub fn find_try_catch(ctx: &mut DecompileContext) -> Result<(), DecompileError> {
    for i in 0..ctx.blocks.len() {
        let block = ctx.blocks[i];
        if let Some((finally_addr, catch_addr)) = try_hook_block(ctx, block) {
            build_try(ctx, block, finally_addr, catch_addr);
        }
    }
    Ok(())
}

fn build_try(ctx: &mut DecompileContext, hook: NodeId, finally_addr: u32, catch_addr: Option<u32>) {
    let succs = ctx.cfg.node(hook).succs.clone();
    let (Some(&try_head), Some(&finally_node)) = (succs.first(), succs.get(1)) else {
        return;
    };
    let catch_node = catch_addr.and_then(|_| succs.get(2).copied());

    // The try body stops where the catch (or finally) region starts.
    let boundary = catch_addr.unwrap_or(finally_addr);
    let (try_tail, join) = walk_region(ctx, try_head, boundary);

    let mut catch_variable = None;
    let mut catch_head = None;
    if let Some(catch) = catch_node {
        let (catch_tail, catch_join) = walk_region(ctx, catch, finally_addr);
        strip_region_exit(ctx, catch_tail, catch_join);
        catch_head = Some(catch);
        catch_variable = consume_catch_binding(ctx, catch);
    }

    strip_region_exit(ctx, try_tail, join);

    // Finally region: from the finally address to the join.
    let join_addr = join.map(|j| ctx.cfg.node(j).start).unwrap_or(ctx.entry.length);
    let finally_head = if ctx.cfg.node(finally_node).start < join_addr {
        let (finally_tail, finally_join) = walk_region(ctx, finally_node, join_addr);
        strip_region_exit(ctx, finally_tail, finally_join);
        Some(finally_node)
    } else {
        None
    };

    // The hook block's six instructions never surface in source.
    ctx.cfg.shrink_back(hook, 6);
    ctx.cfg.cut_all_succs(hook);

    let end = [try_head, catch_head.unwrap_or(try_head), finally_head.unwrap_or(try_head)]
        .iter()
        .flat_map(|&h| ctx.cfg.chain(h))
        .map(|id| ctx.cfg.node(id).end)
        .max()
        .unwrap_or(ctx.cfg.node(hook).end);
    let start = ctx.cfg.node(hook).start;
    let composite = ctx.cfg.add_node(start, end, NodeKind::TryCatch {
        try_head: Some(try_head),
        catch_head,
        catch_variable,
        finally_head,
    });
    ctx.cfg.insert_structure(hook, hook, composite);
    if let Some(join) = join {
        ctx.cfg.connect(composite, join);
    }

    ctx.cfg.set_parent(hook, composite);
    ctx.cfg.reparent_chain(try_head, composite);
    if let Some(c) = catch_head {
        ctx.cfg.reparent_chain(c, composite);
    }
    if let Some(f) = finally_head {
        ctx.cfg.reparent_chain(f, composite);
    }
    ctx.try_catches.push(composite);
    tracing::debug!(composite, "recovered try/catch/finally");
}

/// Follows a chain until it would leave `[.., boundary)`; returns the last
/// node inside and the first node beyond, if any.
fn walk_region(ctx: &DecompileContext, head: NodeId, boundary: u32) -> (NodeId, Option<NodeId>) {
    let mut cur = head;
    for _ in 0..ctx.cfg.len() {
        match ctx.cfg.node(cur).succs.first().copied() {
            Some(next) if ctx.cfg.node(next).start < boundary
                && ctx.cfg.node(next).start > ctx.cfg.node(cur).start =>
            {
                cur = next;
            }
            Some(next) => return (cur, Some(next)),
            None => return (cur, None),
        }
    }
    (cur, None)
}

/// Cuts the region tail's exit edge, dropping a trailing bypass branch.
fn strip_region_exit(ctx: &mut DecompileContext, tail: NodeId, exit: Option<NodeId>) {
    let Some(exit) = exit else {
        return;
    };
    let is_branch = ctx
        .cfg
        .node(tail)
        .last_instr_index()
        .map(|i| ctx.entry.instructions[i].opcode == Opcode::Branch)
        .unwrap_or(false);
    if is_branch {
        ctx.cfg.shrink_back(tail, 1);
    }
    ctx.cfg.cut_edge(tail, exit);
}

/// A catch chain that opens with `pop local.<name>` binds the thrown value;
/// the store is consumed so the simulator never sees an unmatched pop.
fn consume_catch_binding(ctx: &mut DecompileContext, catch: NodeId) -> Option<String> {
    let range = ctx.cfg.node(catch).instrs()?;
    if range.is_empty() {
        return None;
    }
    let first = &ctx.entry.instructions[range.start];
    if first.opcode == Opcode::Pop
        && first.instance_type == InstanceType::Local
        && first.variable.is_some()
    {
        let name = first.variable.as_ref().map(|v| v.name.clone());
        ctx.cfg.shrink_front(catch, 1);
        name
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::builder::StreamBuilder;
    use crate::bytecode::constants::TRY_HOOK_FUNCTION;
    use crate::bytecode::DataType;
    use crate::decompiler::blocks::build_blocks;
    use crate::decompiler::context::Settings;
    use crate::decompiler::passes::conditionals::find_conditionals;
    use crate::decompiler::passes::fragments::find_fragments;
    use crate::decompiler::passes::loops::find_loops;
    use crate::decompiler::passes::short_circuits::find_short_circuits;
    use crate::decompiler::passes::switches::find_switches;

    #[test]
    fn try_catch_finally_regions_are_separated() {
        let mut b = StreamBuilder::new("try");
        let (catch, finally, join) = (b.new_label(), b.new_label(), b.new_label());
        b.push_address(finally);
        b.convert(DataType::Int32, DataType::Variable);
        b.push_address(catch);
        b.convert(DataType::Int32, DataType::Variable);
        b.call(TRY_HOOK_FUNCTION, 2);
        b.pop_delete();
        // try body
        b.push_imm(1).pop_var(InstanceType::SelfInstance, "t", DataType::Int16);
        b.branch(join);
        b.place(catch);
        b.pop_var(InstanceType::Local, "err", DataType::Variable);
        b.push_imm(2).pop_var(InstanceType::SelfInstance, "c", DataType::Int16);
        b.branch(join);
        b.place(finally);
        b.push_imm(3).pop_var(InstanceType::SelfInstance, "f", DataType::Int16);
        b.place(join);
        b.exit();
        let entry = b.finish();

        let settings = Settings::default();
        let mut ctx = DecompileContext::new(&entry, &settings);
        build_blocks(&mut ctx).unwrap();
        find_fragments(&mut ctx).unwrap();
        find_short_circuits(&mut ctx).unwrap();
        find_loops(&mut ctx).unwrap();
        find_conditionals(&mut ctx).unwrap();
        find_switches(&mut ctx).unwrap();
        find_try_catch(&mut ctx).unwrap();

        assert_eq!(ctx.try_catches.len(), 1);
        let NodeKind::TryCatch { try_head, catch_head, ref catch_variable, finally_head } =
            ctx.cfg.node(ctx.try_catches[0]).kind
        else {
            panic!("expected try/catch composite");
        };
        assert!(try_head.is_some());
        assert!(catch_head.is_some());
        assert_eq!(catch_variable.as_deref(), Some("err"));
        assert!(finally_head.is_some());
        ctx.cfg.verify().unwrap();
    }
}
