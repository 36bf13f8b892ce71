//! Switch recovery.
//!
//! A switch lowers to a chain of case-compare blocks (`dup; push K;
//! cmp ==; bt case`) closed by an unconditional default branch, with the
//! trailing `popz` at the merge discarding the duplicated scrutinee. Case
//! bodies are delimited by the branch targets in address order; labels that
//! share a target render as fall-through cases.

use std::collections::HashSet;

use crate::bytecode::{ComparisonType, Opcode};
use crate::decompiler::cfg::{InstrRange, NodeId, NodeKind, SwitchArm, Terminator};
use crate::decompiler::context::DecompileContext;
use crate::decompiler::errors::DecompileError;

pub fn find_switches(ctx: &mut DecompileContext) -> Result<(), DecompileError> {
    for i in 0..ctx.blocks.len() {
        let block = ctx.blocks[i];
        if !is_case_compare(ctx, block) {
            continue;
        }
        // Only chain heads: nothing case-shaped falls through into them.
        let head = !ctx.cfg.node(block).preds.iter().any(|&p| {
            is_case_compare(ctx, p) && ctx.cfg.node(p).succs.first() == Some(&block)
        });
        if head {
            build_switch(ctx, block);
        }
    }
    Ok(())
}

/// `… dup; push K; cmp ==; bt …` — the tail shape of a case-compare block.
pub fn is_case_compare(ctx: &DecompileContext, block: NodeId) -> bool {
    let node = ctx.cfg.node(block);
    let Some(range) = node.instrs() else {
        return false;
    };
    if range.len() < 3 || node.succs.len() != 2 {
        return false;
    }
    let instrs = &ctx.entry.instructions;
    instrs[range.end - 1].opcode == Opcode::BranchTrue
        && instrs[range.end - 2].opcode == Opcode::Compare
        && instrs[range.end - 2].comparison == Some(ComparisonType::Equal)
        && (range.start..range.end - 2).any(|i| instrs[i].opcode == Opcode::Duplicate)
}

struct CaseInfo {
    block: NodeId,
    value_range: InstrRange,
    target: NodeId,
}

fn build_switch(ctx: &mut DecompileContext, h0: NodeId) {
    // Walk the compare chain down its fall-through edges.
    let mut compares = Vec::new();
    let mut cur = h0;
    let default_branch = loop {
        compares.push(cur);
        let Some(&next) = ctx.cfg.node(cur).succs.first() else {
            return;
        };
        if is_case_compare(ctx, next) {
            cur = next;
        } else {
            break next;
        }
    };

    // The chain must close with a lone unconditional branch.
    let d_ok = ctx.cfg.node(default_branch).instrs().map_or(false, |r| r.len() == 1)
        && ctx
            .cfg
            .node(default_branch)
            .last_instr_index()
            .map(|i| ctx.entry.instructions[i].opcode == Opcode::Branch)
            .unwrap_or(false);
    if !d_ok {
        return;
    }
    let Some(&d_target) = ctx.cfg.node(default_branch).succs.first() else {
        return;
    };

    // Case values and the scrutinee live between the block edges.
    let mut cases = Vec::new();
    let mut expr_range = None;
    for (i, &c) in compares.iter().enumerate() {
        let range = ctx.cfg.node(c).instrs().expect("compare block");
        let Some(dup) = (range.start..range.end - 2)
            .rev()
            .find(|&j| ctx.entry.instructions[j].opcode == Opcode::Duplicate)
        else {
            return;
        };
        if i == 0 {
            expr_range = Some(InstrRange { start: range.start, end: dup });
        }
        let Some(&target) = ctx.cfg.node(c).succs.get(1) else {
            return;
        };
        cases.push(CaseInfo {
            block: c,
            value_range: InstrRange { start: dup + 1, end: range.end - 2 },
            target,
        });
    }
    let expr_range = expr_range.expect("at least one case");

    let Some((end, has_default)) = find_end(ctx, &cases, d_target) else {
        return;
    };

    // Label order is source order: bodies sorted by address, labels with a
    // shared target kept in chain order.
    let mut labels: Vec<(Option<(NodeId, InstrRange)>, NodeId)> = cases
        .iter()
        .map(|c| (Some((c.block, c.value_range)), c.target))
        .collect();
    if has_default {
        labels.push((None, d_target));
    }
    labels.sort_by_key(|&(_, target)| ctx.cfg.node(target).start);

    let targets: HashSet<NodeId> = labels.iter().map(|&(_, t)| t).collect();
    let mut distinct: Vec<NodeId> = Vec::new();
    for &(_, t) in &labels {
        if !distinct.contains(&t) {
            distinct.push(t);
        }
    }

    // Detach the compare chain and the default branch.
    for &c in &compares {
        ctx.cfg.cut_all_succs(c);
    }
    ctx.cfg.shrink_back(default_branch, 1);
    ctx.cfg.cut_all_succs(default_branch);

    // Delimit each body chain, converting break jumps into terminators.
    let mut end_addr = ctx.cfg.node(default_branch).end;
    for &target in &distinct {
        if target == end {
            continue;
        }
        let mut cur = target;
        for _ in 0..ctx.cfg.len() {
            end_addr = end_addr.max(ctx.cfg.node(cur).end);
            let Some(&next) = ctx.cfg.node(cur).succs.first() else {
                break;
            };
            if next == end {
                let is_break = ctx
                    .cfg
                    .node(cur)
                    .last_instr_index()
                    .map(|i| ctx.entry.instructions[i].opcode == Opcode::Branch)
                    .unwrap_or(false);
                ctx.cfg.cut_edge(cur, next);
                if is_break {
                    ctx.cfg.shrink_back(cur, 1);
                    ctx.cfg.node_mut(cur).terminator = Some(Terminator::Break);
                }
                break;
            }
            if targets.contains(&next) {
                // Fall-through into the next body.
                ctx.cfg.cut_edge(cur, next);
                break;
            }
            cur = next;
        }
    }

    let arms = group_arms(&labels, end);

    let start = ctx.cfg.node(h0).start;
    let composite = ctx.cfg.add_node(start, end_addr, NodeKind::Switch {
        expr_block: h0,
        expr_range,
        arms,
    });
    ctx.cfg.insert_structure(h0, h0, composite);
    ctx.cfg.connect(composite, end);

    for &c in &compares {
        ctx.cfg.set_parent(c, composite);
    }
    ctx.cfg.set_parent(default_branch, composite);
    for &target in &distinct {
        if target != end {
            ctx.cfg.reparent_chain(target, composite);
        }
    }
    ctx.switches.push(composite);
    tracing::debug!(composite, "recovered switch");
}

/// The merge point. Break jumps out of the first bodies name it directly;
/// otherwise a default branch aimed past every case at a discarding pop is
/// the merge itself (a switch with no default arm).
fn find_end(
    ctx: &DecompileContext,
    cases: &[CaseInfo],
    d_target: NodeId,
) -> Option<(NodeId, bool)> {
    let max_target_start = cases
        .iter()
        .map(|c| ctx.cfg.node(c.target).start)
        .chain([ctx.cfg.node(d_target).start])
        .max()?;
    let all_targets: HashSet<NodeId> =
        cases.iter().map(|c| c.target).chain([d_target]).collect();

    for case in cases {
        let mut cur = case.target;
        for _ in 0..ctx.cfg.len() {
            let node = ctx.cfg.node(cur);
            let last_branch = node
                .last_instr_index()
                .map(|i| ctx.entry.instructions[i].opcode == Opcode::Branch)
                .unwrap_or(false);
            if last_branch {
                if let Some(&x) = node.succs.first() {
                    if ctx.cfg.node(x).start > max_target_start {
                        return Some((x, x != d_target));
                    }
                }
            }
            match node.succs.first() {
                Some(&next) if !all_targets.contains(&next) => cur = next,
                _ => break,
            }
        }
    }

    // No break anywhere: a trailing default branch straight at the merge.
    let d_start = ctx.cfg.node(d_target).start;
    let case_max = cases.iter().map(|c| ctx.cfg.node(c.target).start).max()?;
    if d_start >= case_max {
        let starts_with_pop = ctx
            .cfg
            .node(d_target)
            .instrs()
            .filter(|r| !r.is_empty())
            .map(|r| ctx.entry.instructions[r.start].opcode == Opcode::PopDelete)
            .unwrap_or(false);
        if starts_with_pop {
            return Some((d_target, false));
        }
    }
    // Last resort: the highest body falls out into the merge, which opens
    // with the scrutinee-discarding pop.
    let last_target = *all_targets
        .iter()
        .max_by_key(|&&t| ctx.cfg.node(t).start)?;
    let mut cur = last_target;
    for _ in 0..ctx.cfg.len() {
        let Some(&next) = ctx.cfg.node(cur).succs.first() else {
            return None;
        };
        if ctx.cfg.node(next).start <= ctx.cfg.node(cur).start {
            return None;
        }
        let opens_with_pop = ctx
            .cfg
            .node(next)
            .instrs()
            .filter(|r| !r.is_empty())
            .map(|r| ctx.entry.instructions[r.start].opcode == Opcode::PopDelete)
            .unwrap_or(false);
        if opens_with_pop {
            return Some((next, next != d_target));
        }
        cur = next;
    }
    None
}

fn group_arms(
    labels: &[(Option<(NodeId, InstrRange)>, NodeId)],
    end: NodeId,
) -> Vec<SwitchArm> {
    let mut arms = Vec::new();
    for (i, &(value, target)) in labels.iter().enumerate() {
        let last_of_group = labels.get(i + 1).map(|&(_, t)| t) != Some(target);
        let body = if last_of_group && target != end {
            Some(target)
        } else {
            None
        };
        arms.push(SwitchArm { value, body });
    }
    arms
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::builder::StreamBuilder;
    use crate::bytecode::{DataType, InstanceType};
    use crate::decompiler::blocks::build_blocks;
    use crate::decompiler::context::Settings;
    use crate::decompiler::passes::conditionals::find_conditionals;
    use crate::decompiler::passes::fragments::find_fragments;
    use crate::decompiler::passes::loops::find_loops;
    use crate::decompiler::passes::short_circuits::find_short_circuits;

    fn run<'a>(entry: &'a crate::bytecode::CodeEntry, settings: &'a Settings) -> DecompileContext<'a> {
        let mut ctx = DecompileContext::new(entry, settings);
        build_blocks(&mut ctx).unwrap();
        find_fragments(&mut ctx).unwrap();
        find_short_circuits(&mut ctx).unwrap();
        find_loops(&mut ctx).unwrap();
        find_conditionals(&mut ctx).unwrap();
        find_switches(&mut ctx).unwrap();
        ctx
    }

    #[test]
    fn switch_with_default_and_shared_labels() {
        // switch (x) { case 1: ...; break; default: ...; break; case 2: case 3: ...; break; }
        let mut b = StreamBuilder::new("sw");
        let (c1, c23, def, end) = (b.new_label(), b.new_label(), b.new_label(), b.new_label());
        b.push_var(InstanceType::SelfInstance, "x");
        b.duplicate(DataType::Variable);
        b.push_i16(1);
        b.compare(ComparisonType::Equal);
        b.branch_true(c1);
        b.duplicate(DataType::Variable);
        b.push_i16(2);
        b.compare(ComparisonType::Equal);
        b.branch_true(c23);
        b.duplicate(DataType::Variable);
        b.push_i16(3);
        b.compare(ComparisonType::Equal);
        b.branch_true(c23);
        b.branch(def);
        b.place(c1);
        b.push_string("Case 1").pop_var(InstanceType::SelfInstance, "msg", DataType::String);
        b.branch(end);
        b.place(def);
        b.push_string("Default").pop_var(InstanceType::SelfInstance, "msg", DataType::String);
        b.branch(end);
        b.place(c23);
        b.push_string("Case 2 and 3").pop_var(InstanceType::SelfInstance, "msg", DataType::String);
        b.place(end);
        b.pop_delete();
        b.exit();
        let entry = b.finish();
        let settings = Settings::default();
        let ctx = run(&entry, &settings);

        assert_eq!(ctx.switches.len(), 1);
        let NodeKind::Switch { ref arms, .. } = ctx.cfg.node(ctx.switches[0]).kind else {
            panic!("expected switch composite");
        };
        // Source order: case 1, default, case 2, case 3.
        assert_eq!(arms.len(), 4);
        assert!(arms[0].value.is_some() && arms[0].body.is_some());
        assert!(arms[1].value.is_none() && arms[1].body.is_some());
        assert!(arms[2].value.is_some() && arms[2].body.is_none());
        assert!(arms[3].value.is_some() && arms[3].body.is_some());
        ctx.cfg.verify().unwrap();
    }
}
