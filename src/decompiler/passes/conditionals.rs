//! Conditional recovery.
//!
//! After loop recovery, every remaining two-way branch heads a diamond:
//! fall-through is the then-branch, the branch target is the else-branch or
//! the merge point. Blocks are visited in descending address order so inner
//! conditionals collapse before the outer ones walk over them. The governing
//! expression stays on the stack of the branching block; the composite pops
//! it when the AST is built.

use crate::bytecode::Opcode;
use crate::decompiler::cfg::{NodeId, NodeKind};
use crate::decompiler::context::DecompileContext;
use crate::decompiler::errors::DecompileError;
use crate::decompiler::passes::switches::is_case_compare;

pub fn find_conditionals(ctx: &mut DecompileContext) -> Result<(), DecompileError> {
    for i in (0..ctx.blocks.len()).rev() {
        let block = ctx.blocks[i];
        let node = ctx.cfg.node(block);
        if node.succs.len() != 2 {
            continue;
        }
        let Some(last) = node.last_instr_index() else {
            continue;
        };
        if !matches!(
            ctx.entry.instructions[last].opcode,
            Opcode::BranchTrue | Opcode::BranchFalse
        ) {
            continue;
        }
        // Case-compare chains belong to the switch pass.
        if is_case_compare(ctx, block) {
            continue;
        }
        build_if(ctx, block);
    }
    Ok(())
}

enum Shape {
    Empty,
    NoElse {
        then_tail: NodeId,
        merge: NodeId,
        tail_connected: bool,
    },
    WithElse {
        then_tail: NodeId,
        else_tail: NodeId,
        else_connected: bool,
        merge: NodeId,
    },
}

/// Walks the diamond without mutating anything; recovery is skipped when
/// the region does not reduce to a then/else/merge shape.
fn analyze(ctx: &DecompileContext, then_head: NodeId, false_target: NodeId) -> Option<Shape> {
    if then_head == false_target {
        return Some(Shape::Empty);
    }
    let mut cur = then_head;
    for _ in 0..ctx.cfg.len() {
        let node = ctx.cfg.node(cur);
        match node.succs.first().copied() {
            None => {
                return Some(Shape::NoElse {
                    then_tail: cur,
                    merge: false_target,
                    tail_connected: false,
                });
            }
            Some(next) if next == false_target => {
                return Some(Shape::NoElse {
                    then_tail: cur,
                    merge: false_target,
                    tail_connected: true,
                });
            }
            Some(next) if ctx.cfg.node(next).start > ctx.cfg.node(false_target).start => {
                // The then-branch jumps past the false target: an else
                // exists and `next` is the merge.
                let merge = next;
                let mut else_cur = false_target;
                for _ in 0..ctx.cfg.len() {
                    match ctx.cfg.node(else_cur).succs.first().copied() {
                        None => {
                            return Some(Shape::WithElse {
                                then_tail: cur,
                                else_tail: else_cur,
                                else_connected: false,
                                merge,
                            });
                        }
                        Some(n) if n == merge => {
                            return Some(Shape::WithElse {
                                then_tail: cur,
                                else_tail: else_cur,
                                else_connected: true,
                                merge,
                            });
                        }
                        Some(n) if ctx.cfg.node(n).start > ctx.cfg.node(merge).start => {
                            return None;
                        }
                        Some(n) => else_cur = n,
                    }
                }
                return None;
            }
            Some(next) if ctx.cfg.node(next).start < ctx.cfg.node(then_head).start => {
                return None; // unstructured backwards jump
            }
            Some(next) => cur = next,
        }
    }
    None
}

fn build_if(ctx: &mut DecompileContext, block: NodeId) {
    let then_head = ctx.cfg.node(block).succs[0];
    let false_target = ctx.cfg.node(block).succs[1];
    let Some(shape) = analyze(ctx, then_head, false_target) else {
        return;
    };
    let last = ctx.cfg.node(block).last_instr_index().expect("condition block");
    let negate = ctx.entry.instructions[last].opcode == Opcode::BranchTrue;

    ctx.cfg.shrink_back(block, 1);
    ctx.cfg.cut_all_succs(block);

    let (kind, merge, start, end) = match shape {
        Shape::Empty => {
            let at = ctx.cfg.node(block).end;
            (
                NodeKind::If { then_head: None, else_head: None, negate },
                false_target,
                at,
                at,
            )
        }
        Shape::NoElse { then_tail, merge, tail_connected } => {
            if tail_connected {
                // A trailing jump to the merge is structural; drop it.
                if last_is_branch(ctx, then_tail) {
                    ctx.cfg.shrink_back(then_tail, 1);
                }
                ctx.cfg.cut_edge(then_tail, merge);
            }
            let end = chain_end(ctx, then_head);
            (
                NodeKind::If { then_head: Some(then_head), else_head: None, negate },
                merge,
                ctx.cfg.node(then_head).start,
                end,
            )
        }
        Shape::WithElse { then_tail, else_tail, else_connected, merge } => {
            debug_assert!(last_is_branch(ctx, then_tail));
            if last_is_branch(ctx, then_tail) {
                ctx.cfg.shrink_back(then_tail, 1);
            }
            ctx.cfg.cut_edge(then_tail, merge);
            if else_connected {
                if last_is_branch(ctx, else_tail) {
                    ctx.cfg.shrink_back(else_tail, 1);
                }
                ctx.cfg.cut_edge(else_tail, merge);
            }
            let end = chain_end(ctx, false_target).max(chain_end(ctx, then_head));
            (
                NodeKind::If {
                    then_head: Some(then_head),
                    else_head: Some(false_target),
                    negate,
                },
                merge,
                ctx.cfg.node(then_head).start,
                end,
            )
        }
    };

    let composite = ctx.cfg.add_node(start, end, kind);
    ctx.cfg.node_mut(composite).parent = ctx.cfg.node(block).parent;
    ctx.cfg.connect(block, composite);
    ctx.cfg.connect(composite, merge);
    if let NodeKind::If { then_head, else_head, .. } = ctx.cfg.node(composite).kind {
        if let Some(t) = then_head {
            ctx.cfg.reparent_chain(t, composite);
        }
        if let Some(e) = else_head {
            ctx.cfg.reparent_chain(e, composite);
        }
    }
    ctx.branches.push(composite);
    tracing::debug!(composite, "recovered conditional");
}

fn last_is_branch(ctx: &DecompileContext, node: NodeId) -> bool {
    ctx.cfg
        .node(node)
        .last_instr_index()
        .map(|i| ctx.entry.instructions[i].opcode == Opcode::Branch)
        .unwrap_or(false)
}

fn chain_end(ctx: &DecompileContext, head: NodeId) -> u32 {
    ctx.cfg
        .chain(head)
        .into_iter()
        .map(|id| ctx.cfg.node(id).end)
        .max()
        .unwrap_or(ctx.cfg.node(head).end)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::builder::StreamBuilder;
    use crate::bytecode::{DataType, InstanceType};
    use crate::decompiler::blocks::build_blocks;
    use crate::decompiler::context::Settings;
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
        ctx
    }

    #[test]
    fn plain_if_has_no_else_branch() {
        let mut b = StreamBuilder::new("if");
        let end = b.new_label();
        b.push_var(InstanceType::SelfInstance, "c");
        b.convert(DataType::Variable, DataType::Boolean);
        b.branch_false(end);
        b.push_imm(1).pop_var(InstanceType::SelfInstance, "x", DataType::Int16);
        b.place(end);
        b.exit();
        let entry = b.finish();
        let settings = Settings::default();
        let ctx = run(&entry, &settings);

        assert_eq!(ctx.branches.len(), 1);
        let NodeKind::If { then_head, else_head, negate } = ctx.cfg.node(ctx.branches[0]).kind
        else {
            panic!("expected if composite");
        };
        assert!(then_head.is_some());
        assert!(else_head.is_none());
        assert!(!negate);
        ctx.cfg.verify().unwrap();
    }

    #[test]
    fn diamond_recovers_then_and_else() {
        let mut b = StreamBuilder::new("ifelse");
        let (els, end) = (b.new_label(), b.new_label());
        b.push_var(InstanceType::SelfInstance, "c");
        b.convert(DataType::Variable, DataType::Boolean);
        b.branch_false(els);
        b.push_imm(1).pop_var(InstanceType::SelfInstance, "x", DataType::Int16);
        b.branch(end);
        b.place(els);
        b.push_imm(2).pop_var(InstanceType::SelfInstance, "x", DataType::Int16);
        b.place(end);
        b.exit();
        let entry = b.finish();
        let settings = Settings::default();
        let ctx = run(&entry, &settings);

        assert_eq!(ctx.branches.len(), 1);
        let NodeKind::If { then_head, else_head, .. } = ctx.cfg.node(ctx.branches[0]).kind
        else {
            panic!("expected if composite");
        };
        assert!(then_head.is_some());
        assert!(else_head.is_some());
        ctx.cfg.verify().unwrap();
    }

    #[test]
    fn nested_else_if_chain_reduces_inner_first() {
        // if (a) { x = 1 } else if (b) { x = 2 }
        let mut b = StreamBuilder::new("elseif");
        let (second, end) = (b.new_label(), b.new_label());
        b.push_var(InstanceType::SelfInstance, "a");
        b.convert(DataType::Variable, DataType::Boolean);
        b.branch_false(second);
        b.push_imm(1).pop_var(InstanceType::SelfInstance, "x", DataType::Int16);
        b.branch(end);
        b.place(second);
        b.push_var(InstanceType::SelfInstance, "b");
        b.convert(DataType::Variable, DataType::Boolean);
        b.branch_false(end);
        b.push_imm(2).pop_var(InstanceType::SelfInstance, "x", DataType::Int16);
        b.place(end);
        b.exit();
        let entry = b.finish();
        let settings = Settings::default();
        let ctx = run(&entry, &settings);

        assert_eq!(ctx.branches.len(), 2);
        // The outer composite was built last and owns the inner one.
        let outer = ctx.branches[1];
        let inner = ctx.branches[0];
        let mut cur = ctx.cfg.node(inner).parent;
        let mut found = false;
        while let Some(p) = cur {
            if p == outer {
                found = true;
                break;
            }
            cur = ctx.cfg.node(p).parent;
        }
        assert!(found, "inner if should sit beneath the outer one");
        ctx.cfg.verify().unwrap();
    }
}
