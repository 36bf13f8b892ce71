//! Fragment recovery.
//!
//! The root entry and every nested function/struct body become `Fragment`
//! nodes. A nested body is dead code at its own address (the enclosing code
//! branches over it), so the unreachable patch-up has wired it to the block
//! holding the skip branch; this pass undoes that, wraps the body's blocks,
//! and threads the fragment into the enclosing chain in its place.

use crate::bytecode::{CodeEntry, Opcode};
use crate::decompiler::cfg::{NodeId, NodeKind};
use crate::decompiler::context::DecompileContext;
use crate::decompiler::errors::DecompileError;

pub fn find_fragments(ctx: &mut DecompileContext) -> Result<(), DecompileError> {
    let head = ctx.blocks[0];
    let root = ctx.cfg.add_node(
        0,
        ctx.entry.length,
        NodeKind::Fragment { name: None, head: Some(head) },
    );
    for i in 0..ctx.blocks.len() {
        let block = ctx.blocks[i];
        ctx.cfg.set_parent(block, root);
    }
    ctx.root = Some(root);
    ctx.fragments.push(root);

    // Innermost bodies wrap first so enclosing bodies see them as single
    // nodes.
    let mut ranges = Vec::new();
    collect_child_ranges(ctx.entry, 0, &mut ranges);
    ranges.sort_by_key(|&(_, start, end)| (end - start, start));
    for (name, start, end) in ranges {
        wrap_fragment(ctx, name, start, end, root);
    }
    Ok(())
}

fn collect_child_ranges(entry: &CodeEntry, base: u32, out: &mut Vec<(String, u32, u32)>) {
    for child in &entry.children {
        let start = base + child.start_offset;
        collect_child_ranges(child, start, out);
        out.push((child.name.clone(), start, start + child.length));
    }
}

fn wrap_fragment(ctx: &mut DecompileContext, name: String, start: u32, end: u32, root: NodeId) {
    let Some(first) = top_node_at(ctx, start, |n| ctx.cfg.node(n).start) else {
        return;
    };
    let Some(prev) = top_node_at(ctx, start, |n| ctx.cfg.node(n).end) else {
        return;
    };

    let fragment = ctx.cfg.add_node(start, end, NodeKind::Fragment {
        name: Some(name),
        head: Some(first),
    });
    ctx.fragments.push(fragment);

    // Drop the synthetic unreachable edge into the body.
    if ctx.cfg.node(first).preds.contains(&prev) {
        ctx.cfg.cut_edge(prev, first);
    }

    // Adopt everything at root level inside the body's address range.
    for id in ctx.cfg.ids() {
        if id == fragment {
            continue;
        }
        let node = ctx.cfg.node(id);
        if node.parent == Some(root) && node.start >= start && node.end <= end {
            ctx.cfg.set_parent(id, fragment);
        }
    }
    ctx.cfg.set_parent(fragment, root);

    // The skip branch over the body becomes the chain edge through the
    // fragment.
    let skips_body = ctx
        .cfg
        .node(prev)
        .last_instr_index()
        .map(|i| {
            let instr = &ctx.entry.instructions[i];
            instr.opcode == Opcode::Branch
                && instr.address as i64 + instr.branch_offset() as i64 == end as i64
        })
        .unwrap_or(false);
    if skips_body {
        let after = ctx.cfg.node(prev).succs.first().copied();
        ctx.cfg.shrink_back(prev, 1);
        if let Some(after) = after {
            ctx.cfg.cut_edge(prev, after);
            ctx.cfg.connect(prev, fragment);
            ctx.cfg.connect(fragment, after);
        }
    }
}

/// Finds the block whose `start`/`end` (selected by `key`) equals `addr`,
/// then climbs to its topmost ancestor sharing that boundary — the node
/// representing that position at the outermost unwrapped level.
fn top_node_at(
    ctx: &DecompileContext,
    addr: u32,
    key: impl Fn(NodeId) -> u32,
) -> Option<NodeId> {
    let mut cur = ctx.blocks.iter().copied().find(|&b| key(b) == addr)?;
    while let Some(parent) = ctx.cfg.node(cur).parent {
        if key(parent) == addr && !matches!(ctx.cfg.node(parent).kind, NodeKind::Fragment { name: None, .. }) {
            cur = parent;
        } else {
            break;
        }
    }
    Some(cur)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::builder::StreamBuilder;
    use crate::bytecode::{DataType, InstanceType};
    use crate::decompiler::blocks::build_blocks;
    use crate::decompiler::context::Settings;

    #[test]
    fn nested_body_is_wrapped_and_threaded_into_the_chain() {
        let mut b = StreamBuilder::new("outer");
        let skip = b.new_label();
        b.push_imm(1).pop_var(InstanceType::SelfInstance, "x", DataType::Int16);
        b.branch(skip);
        let body_start = b.current_address();
        b.push_imm(5).ret();
        let body_end = b.current_address();
        b.place(skip);
        b.push_function("inner");
        b.pop_var(InstanceType::SelfInstance, "f", DataType::Int32);
        b.child("inner", body_start, body_end, 0);
        let entry = b.finish();

        let settings = Settings::default();
        let mut ctx = DecompileContext::new(&entry, &settings);
        build_blocks(&mut ctx).unwrap();
        find_fragments(&mut ctx).unwrap();

        assert_eq!(ctx.fragments.len(), 2);
        let fragment = ctx.fragments[1];
        let node = ctx.cfg.node(fragment);
        assert_eq!((node.start, node.end), (body_start, body_end));
        // The skip block now chains through the fragment.
        let skip_block = ctx.blocks[0];
        assert_eq!(ctx.cfg.node(skip_block).succs, vec![fragment]);
        // Body blocks belong to the fragment.
        let body_block = ctx.blocks[1];
        assert_eq!(ctx.cfg.node(body_block).parent, Some(fragment));
        ctx.cfg.verify().unwrap();
    }
}
