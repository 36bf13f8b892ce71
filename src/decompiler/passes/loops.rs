//! Loop recovery.
//!
//! Back-edges are found by depth-first numbering of each fragment's
//! sibling-level graph; every back-edge's natural loop (the nodes that reach
//! the tail without passing through the head) becomes one composite. The
//! loop kind comes from the shape of the back-edge's guarding instruction:
//!
//! * unconditional branch — while (the head chain ends in a forward exit)
//! * conditional branch   — do-until, or repeat when the tail carries the
//!   counter decrement signature
//! * context pop          — with
//!
//! Nested loops are processed innermost-first so each outer loop sees inner
//! ones as single nodes. Unconditional back-edges that share a head with a
//! further one are `continue` jumps, not loops.

use std::collections::{HashMap, HashSet};

use petgraph::graph::{Graph, NodeIndex};
use petgraph::visit::{depth_first_search, Control, DfsEvent};

use crate::bytecode::{Instruction, Opcode};
use crate::decompiler::cfg::{NodeId, NodeKind, Terminator};
use crate::decompiler::context::DecompileContext;
use crate::decompiler::errors::DecompileError;

pub fn find_loops(ctx: &mut DecompileContext) -> Result<(), DecompileError> {
    let mut back_edges: Vec<(NodeId, NodeId)> = Vec::new();
    for i in 0..ctx.fragments.len() {
        let fragment = ctx.fragments[i];
        let head = match ctx.cfg.node(fragment).kind {
            NodeKind::Fragment { head: Some(h), .. } => h,
            _ => continue,
        };
        collect_back_edges(ctx, head, &mut back_edges);
    }

    // Among unconditional back-edges sharing a head, only the furthest one
    // closes a loop; the nearer ones are `continue` jumps inside it.
    let mut furthest: HashMap<NodeId, NodeId> = HashMap::new();
    for &(tail, head) in &back_edges {
        if last_opcode(ctx, tail) == Some(Opcode::Branch) {
            let slot = furthest.entry(head).or_insert(tail);
            if ctx.cfg.node(tail).start > ctx.cfg.node(*slot).start {
                *slot = tail;
            }
        }
    }
    back_edges.retain(|&(tail, head)| {
        last_opcode(ctx, tail) != Some(Opcode::Branch) || furthest[&head] == tail
    });

    // Innermost first.
    back_edges.sort_by_key(|&(tail, head)| {
        let span = ctx.cfg.node(tail).end - ctx.cfg.node(head).start;
        (span, ctx.cfg.node(head).start)
    });

    for (tail, head) in back_edges {
        build_loop(ctx, head, tail)?;
    }
    Ok(())
}

/// Projects the sibling graph reachable from `head` into a petgraph graph
/// and records the back-edges a depth-first traversal reports.
fn collect_back_edges(ctx: &DecompileContext, head: NodeId, out: &mut Vec<(NodeId, NodeId)>) {
    let mut graph: Graph<NodeId, ()> = Graph::new();
    let mut index_of: HashMap<NodeId, NodeIndex> = HashMap::new();
    let mut stack = vec![head];
    while let Some(id) = stack.pop() {
        if index_of.contains_key(&id) {
            continue;
        }
        index_of.insert(id, graph.add_node(id));
        for &s in &ctx.cfg.node(id).succs {
            stack.push(s);
        }
    }
    for (&id, &ix) in &index_of {
        // petgraph iterates neighbors in reverse insertion order; insert
        // reversed so the traversal takes fall-through edges first.
        for &s in ctx.cfg.node(id).succs.iter().rev() {
            graph.add_edge(ix, index_of[&s], ());
        }
    }
    depth_first_search(&graph, Some(index_of[&head]), |event| {
        if let DfsEvent::BackEdge(u, v) = event {
            out.push((graph[u], graph[v]));
        }
        Control::<()>::Continue
    });
}

fn last_opcode(ctx: &DecompileContext, node: NodeId) -> Option<Opcode> {
    let i = ctx.cfg.node(node).last_instr_index()?;
    Some(ctx.entry.instructions[i].opcode)
}

fn last_instr<'a>(ctx: &'a DecompileContext, node: NodeId) -> Option<&'a Instruction> {
    let i = ctx.cfg.node(node).last_instr_index()?;
    Some(&ctx.entry.instructions[i])
}

fn build_loop(ctx: &mut DecompileContext, head: NodeId, tail: NodeId) -> Result<(), DecompileError> {
    // Inner loops may have swallowed the recorded head; climb to its
    // representative at the tail's level.
    let head = ctx.cfg.resolve_sibling(head, tail);
    if !ctx.cfg.node(tail).succs.contains(&head) {
        return Ok(()); // consumed by an earlier recovery
    }
    let Some(opcode) = last_opcode(ctx, tail) else {
        return Ok(());
    };
    match opcode {
        Opcode::Branch => build_while(ctx, head, tail),
        Opcode::BranchFalse => build_do_until(ctx, head, tail, false),
        Opcode::BranchTrue => {
            if has_repeat_signature(ctx, tail) {
                build_repeat(ctx, head, tail)
            } else {
                build_do_until(ctx, head, tail, true)
            }
        }
        Opcode::PopWithContext => build_with(ctx, head, tail),
        _ => Ok(()),
    }
}

/// Loop membership: the natural loop of the back-edge (everything that
/// reaches `tail` without passing through `head`), widened to every sibling
/// inside the loop's address span. The widening picks up break blocks and
/// return blocks, which never reach the tail.
fn loop_members(ctx: &DecompileContext, head: NodeId, tail: NodeId) -> HashSet<NodeId> {
    let mut members: HashSet<NodeId> = [head, tail].into_iter().collect();
    let mut stack = vec![tail];
    while let Some(id) = stack.pop() {
        for &p in &ctx.cfg.node(id).preds {
            if members.insert(p) {
                stack.push(p);
            }
        }
    }
    let level = ctx.cfg.node(head).parent;
    let (start, end) = (ctx.cfg.node(head).start, ctx.cfg.node(tail).end);
    for id in ctx.cfg.ids() {
        let node = ctx.cfg.node(id);
        if node.parent == level
            && node.start >= start
            && node.end <= end
            // A zero-width anchor at the very end belongs to whatever
            // follows, not to this loop.
            && !(node.start == node.end && node.end == end)
        {
            members.insert(id);
        }
    }
    members
}

/// Marks member blocks whose stripped trailing branch leaves the loop
/// (break) or restarts it (continue), cutting the edges so every chain
/// stays inside the composite.
fn mark_terminators(
    ctx: &mut DecompileContext,
    members: &HashSet<NodeId>,
    skip: &[NodeId],
    break_target: Option<NodeId>,
    continue_target: Option<NodeId>,
) {
    for &m in members {
        if skip.contains(&m) {
            continue;
        }
        if last_opcode(ctx, m) != Some(Opcode::Branch) {
            continue;
        }
        let Some(&target) = ctx.cfg.node(m).succs.first() else {
            continue;
        };
        let terminator = if Some(target) == break_target {
            Some(Terminator::Break)
        } else if Some(target) == continue_target {
            Some(Terminator::Continue)
        } else {
            None
        };
        if let Some(terminator) = terminator {
            ctx.cfg.shrink_back(m, 1);
            ctx.cfg.cut_edge(m, target);
            ctx.cfg.node_mut(m).terminator = Some(terminator);
        }
    }
}

fn finish_loop(
    ctx: &mut DecompileContext,
    head: NodeId,
    tail: NodeId,
    after: Option<NodeId>,
    members: &HashSet<NodeId>,
    kind: NodeKind,
) -> NodeId {
    let start = ctx.cfg.node(head).start;
    let end = ctx.cfg.node(tail).end;
    let composite = ctx.cfg.add_node(start, end, kind);
    ctx.cfg.insert_structure(head, tail, composite);
    let after = after.unwrap_or_else(|| {
        // No natural exit: synthesize the after anchor.
        let empty = ctx.cfg.add_node(end, end, NodeKind::Empty);
        ctx.cfg.node_mut(empty).parent = ctx.cfg.node(composite).parent;
        empty
    });
    ctx.cfg.connect(composite, after);
    for &m in members {
        ctx.cfg.set_parent(m, composite);
    }
    ctx.loops.push(composite);
    composite
}

fn build_while(ctx: &mut DecompileContext, head: NodeId, tail: NodeId) -> Result<(), DecompileError> {
    let members = loop_members(ctx, head, tail);
    ctx.cfg.shrink_back(tail, 1);
    ctx.cfg.cut_all_succs(tail);

    // The condition chain runs from the head to the first block whose
    // conditional branch exits the loop.
    let mut condition_tail = None;
    let mut cur = head;
    for _ in 0..members.len() {
        let node = ctx.cfg.node(cur);
        if node.succs.len() == 2 && !members.contains(&node.succs[1]) {
            if matches!(
                last_opcode(ctx, cur),
                Some(Opcode::BranchFalse) | Some(Opcode::BranchTrue)
            ) {
                condition_tail = Some(cur);
                break;
            }
        }
        match node.succs.first() {
            Some(&next) if members.contains(&next) && next != head => cur = next,
            _ => break,
        }
    }

    let (condition, body, after, negate) = match condition_tail {
        Some(cond) => {
            let negate = last_opcode(ctx, cond) == Some(Opcode::BranchTrue);
            let after = ctx.cfg.node(cond).succs[1];
            let body = ctx.cfg.node(cond).succs[0];
            ctx.cfg.shrink_back(cond, 1);
            ctx.cfg.cut_all_succs(cond);
            (Some(head), Some(body), Some(after), negate)
        }
        None => {
            // `while (true)`: the only exits are break jumps; when they
            // agree on a target, that target is the after anchor.
            let mut exit = None;
            let mut consistent = true;
            for &m in &members {
                if m == tail || last_opcode(ctx, m) != Some(Opcode::Branch) {
                    continue;
                }
                if let Some(&t) = ctx.cfg.node(m).succs.first() {
                    if !members.contains(&t) {
                        match exit {
                            None => exit = Some(t),
                            Some(e) if e == t => {}
                            _ => consistent = false,
                        }
                    }
                }
            }
            (None, Some(head), exit.filter(|_| consistent), false)
        }
    };

    mark_terminators(ctx, &members, &[tail], after, Some(head));
    let composite = finish_loop(ctx, head, tail, after, &members, NodeKind::WhileLoop {
        condition,
        body,
        negate,
    });
    tracing::debug!(composite, "recovered while loop");
    Ok(())
}

fn build_do_until(
    ctx: &mut DecompileContext,
    head: NodeId,
    tail: NodeId,
    negate: bool,
) -> Result<(), DecompileError> {
    let members = loop_members(ctx, head, tail);
    let after = ctx.cfg.node(tail).succs.first().copied();
    ctx.cfg.shrink_back(tail, 1);
    ctx.cfg.cut_all_succs(tail);

    // `continue` in a post-test loop jumps forward to the condition.
    mark_terminators(ctx, &members, &[tail], after, Some(tail));
    let composite = finish_loop(ctx, head, tail, after, &members, NodeKind::DoUntilLoop {
        body: head,
        negate,
    });
    tracing::debug!(composite, "recovered do-until loop");
    Ok(())
}

/// `push N; dup; push 0; cmp <=; bt exit` before the body, and
/// `push 1; sub; dup; conv; bt start` closing it.
fn has_repeat_signature(ctx: &DecompileContext, tail: NodeId) -> bool {
    let Some(range) = ctx.cfg.node(tail).instrs() else {
        return false;
    };
    if range.len() < 5 {
        return false;
    }
    let ops: Vec<Opcode> = (range.end - 5..range.end)
        .map(|i| ctx.entry.instructions[i].opcode)
        .collect();
    matches!(ops[0], Opcode::Push | Opcode::PushImmediate)
        && ops[1] == Opcode::Subtract
        && ops[2] == Opcode::Duplicate
        && ops[3] == Opcode::Convert
        && ops[4] == Opcode::BranchTrue
}

fn build_repeat(ctx: &mut DecompileContext, head: NodeId, tail: NodeId) -> Result<(), DecompileError> {
    let members = loop_members(ctx, head, tail);

    // The predecessor outside the loop pushed the count and guarded the
    // zero case; strip the guard so only the count remains on the stack.
    let prelude = ctx
        .cfg
        .node(head)
        .preds
        .iter()
        .copied()
        .find(|p| !members.contains(p));
    let Some(prelude) = prelude else {
        return build_do_until(ctx, head, tail, true);
    };
    let prelude_ok = ctx.cfg.node(prelude).instrs().map_or(false, |r| r.len() >= 5)
        && matches!(last_opcode(ctx, prelude), Some(Opcode::BranchTrue));
    if !prelude_ok {
        return build_do_until(ctx, head, tail, true);
    }

    let after = ctx.cfg.node(tail).succs.first().copied();
    // Guard: dup; push 0; cmp; bt.
    ctx.cfg.shrink_back(prelude, 4);
    if let Some(after) = after {
        if ctx.cfg.node(prelude).succs.contains(&after) {
            ctx.cfg.cut_edge(prelude, after);
        }
    }
    // Decrement: push 1; sub; dup; conv; bt.
    ctx.cfg.shrink_back(tail, 5);
    ctx.cfg.cut_all_succs(tail);

    mark_terminators(ctx, &members, &[tail], after, Some(tail));
    let composite = finish_loop(ctx, head, tail, after, &members, NodeKind::RepeatLoop { body: head });
    tracing::debug!(composite, "recovered repeat loop");
    Ok(())
}

fn build_with(ctx: &mut DecompileContext, head: NodeId, tail: NodeId) -> Result<(), DecompileError> {
    // The opener pushed the target instance and entered the context. Its
    // skip edge into the closing block must go before membership is
    // computed, or the opener itself would read as part of the loop.
    let opener = ctx
        .cfg
        .node(head)
        .preds
        .iter()
        .copied()
        .find(|&p| last_opcode(ctx, p) == Some(Opcode::PushWithContext));
    let Some(opener) = opener else {
        return Ok(());
    };
    ctx.cfg.shrink_back(opener, 1);
    if ctx.cfg.node(opener).succs.contains(&tail) {
        ctx.cfg.cut_edge(opener, tail);
    }
    let members = loop_members(ctx, head, tail);

    let after = ctx.cfg.node(tail).succs.first().copied();
    ctx.cfg.shrink_back(tail, 1);
    ctx.cfg.cut_all_succs(tail);

    // A popenv-drop block right after the loop collects `break` jumps.
    let mut break_block = None;
    let mut real_after = after;
    if let Some(candidate) = after {
        let is_drop = last_instr(ctx, candidate)
            .map(|i| i.opcode == Opcode::PopWithContext && i.with_context_exit())
            .unwrap_or(false);
        if is_drop {
            real_after = ctx.cfg.node(candidate).succs.first().copied();
            ctx.cfg.shrink_back(candidate, 1);
            if let Some(ra) = real_after {
                ctx.cfg.cut_edge(candidate, ra);
            }
            break_block = Some(candidate);
        }
    }

    mark_terminators(ctx, &members, &[tail], break_block.or(real_after), Some(tail));
    let composite = finish_loop(ctx, head, tail, real_after, &members, NodeKind::WithLoop {
        body: head,
        break_block,
    });
    if let Some(bb) = break_block {
        ctx.cfg.set_parent(bb, composite);
    }
    tracing::debug!(composite, "recovered with loop");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::builder::StreamBuilder;
    use crate::bytecode::{ComparisonType, DataType, InstanceType};
    use crate::decompiler::blocks::build_blocks;
    use crate::decompiler::context::Settings;
    use crate::decompiler::passes::fragments::find_fragments;
    use crate::decompiler::passes::short_circuits::find_short_circuits;

    fn run_until_loops<'a>(
        entry: &'a crate::bytecode::CodeEntry,
        settings: &'a Settings,
    ) -> DecompileContext<'a> {
        let mut ctx = DecompileContext::new(entry, settings);
        build_blocks(&mut ctx).unwrap();
        find_fragments(&mut ctx).unwrap();
        find_short_circuits(&mut ctx).unwrap();
        find_loops(&mut ctx).unwrap();
        ctx
    }

    fn while_i_less_than(b: &mut StreamBuilder, limit: i32) {
        let (top, end) = (b.new_label(), b.new_label());
        b.place(top);
        b.push_var(InstanceType::SelfInstance, "i");
        b.push_i32(limit);
        b.compare(ComparisonType::LessThan);
        b.branch_false(end);
        b.push_var(InstanceType::SelfInstance, "i");
        b.push_i32(1);
        b.binary(Opcode::Add, DataType::Int32, DataType::Variable);
        b.pop_var(InstanceType::SelfInstance, "i", DataType::Variable);
        b.branch(top);
        b.place(end);
    }

    #[test]
    fn while_loop_is_recovered_with_condition_and_body() {
        let mut b = StreamBuilder::new("w");
        while_i_less_than(&mut b, 10);
        b.exit();
        let entry = b.finish();
        let settings = Settings::default();
        let ctx = run_until_loops(&entry, &settings);

        assert_eq!(ctx.loops.len(), 1);
        let NodeKind::WhileLoop { condition, body, negate } = &ctx.cfg.node(ctx.loops[0]).kind
        else {
            panic!("expected while loop");
        };
        assert!(condition.is_some());
        assert!(body.is_some());
        assert!(!negate);
        ctx.cfg.verify().unwrap();
    }

    #[test]
    fn sequential_while_loops_become_two_composites() {
        let mut b = StreamBuilder::new("w2");
        while_i_less_than(&mut b, 10);
        while_i_less_than(&mut b, 20);
        b.exit();
        let entry = b.finish();
        let settings = Settings::default();
        let ctx = run_until_loops(&entry, &settings);
        assert_eq!(ctx.loops.len(), 2);
        ctx.cfg.verify().unwrap();
    }

    #[test]
    fn nested_do_until_is_processed_innermost_first() {
        // do { do { } until (b > 200) } until (a > 100)
        let mut b = StreamBuilder::new("du");
        let outer = b.new_label();
        let inner = b.new_label();
        b.place(outer);
        b.place(inner);
        b.push_var(InstanceType::SelfInstance, "b");
        b.push_i32(200);
        b.compare(ComparisonType::GreaterThan);
        b.branch_false(inner);
        b.push_var(InstanceType::SelfInstance, "a");
        b.push_i32(100);
        b.compare(ComparisonType::GreaterThan);
        b.branch_false(outer);
        b.exit();
        let entry = b.finish();
        let settings = Settings::default();
        let ctx = run_until_loops(&entry, &settings);

        assert_eq!(ctx.loops.len(), 2);
        let inner_comp = ctx.loops[0];
        let outer_comp = ctx.loops[1];
        assert_eq!(ctx.cfg.node(inner_comp).parent, Some(outer_comp));
        ctx.cfg.verify().unwrap();
    }

    #[test]
    fn repeat_signature_is_distinguished_from_do_until() {
        // repeat (100) { }
        let mut b = StreamBuilder::new("rep");
        let (body, exit) = (b.new_label(), b.new_label());
        b.push_i32(100);
        b.duplicate(DataType::Int32);
        b.push_i32(0);
        b.compare(ComparisonType::LessEqual);
        b.branch_true(exit);
        b.place(body);
        b.push_i32(1);
        b.binary(Opcode::Subtract, DataType::Int32, DataType::Int32);
        b.duplicate(DataType::Int32);
        b.convert(DataType::Int32, DataType::Boolean);
        b.branch_true(body);
        b.place(exit);
        b.pop_delete();
        b.exit();
        let entry = b.finish();
        let settings = Settings::default();
        let ctx = run_until_loops(&entry, &settings);

        assert_eq!(ctx.loops.len(), 1);
        assert!(matches!(
            ctx.cfg.node(ctx.loops[0]).kind,
            NodeKind::RepeatLoop { .. }
        ));
        ctx.cfg.verify().unwrap();
    }

    #[test]
    fn with_loop_recovers_body_and_back_edge() {
        // with (obj) { x = 1 }
        let mut b = StreamBuilder::new("with");
        let (body, popenv) = (b.new_label(), b.new_label());
        b.push_var(InstanceType::SelfInstance, "obj");
        b.push_with_context(popenv);
        b.place(body);
        b.push_imm(1).pop_var(InstanceType::SelfInstance, "x", DataType::Int16);
        b.place(popenv);
        b.pop_with_context(body);
        b.exit();
        let entry = b.finish();
        let settings = Settings::default();
        let ctx = run_until_loops(&entry, &settings);

        assert_eq!(ctx.loops.len(), 1);
        assert!(matches!(
            ctx.cfg.node(ctx.loops[0]).kind,
            NodeKind::WithLoop { break_block: None, .. }
        ));
        ctx.cfg.verify().unwrap();
    }
}
