//! Pass 1: basic blocks.
//!
//! Scans the instruction stream for block leaders, splits the stream into
//! blocks, and wires predecessor/successor edges. Try-hook call sites are
//! isolated into their own six-instruction blocks here so the later
//! try/catch pass can recognize them by shape alone.

use std::collections::{BTreeSet, HashMap};

use crate::bytecode::constants::TRY_HOOK_FUNCTION;
use crate::bytecode::{CodeEntry, DataType, Instruction, Opcode, Value};
use crate::decompiler::cfg::{InstrRange, NodeId};
use crate::decompiler::context::DecompileContext;
use crate::decompiler::errors::DecompileError;

pub fn build_blocks(ctx: &mut DecompileContext) -> Result<(), DecompileError> {
    let entry = ctx.entry;
    let instrs = &entry.instructions;
    let length = entry.length;

    let addr_to_index: HashMap<u32, usize> =
        instrs.iter().enumerate().map(|(i, ins)| (ins.address, i)).collect();
    let after = |i: usize| -> u32 {
        instrs.get(i + 1).map(|ins| ins.address).unwrap_or(length)
    };

    let mut leaders: BTreeSet<u32> = BTreeSet::new();
    leaders.insert(0);
    leaders.insert(length);

    for (i, instr) in instrs.iter().enumerate() {
        match instr.opcode {
            Opcode::Branch | Opcode::BranchTrue | Opcode::BranchFalse | Opcode::PushWithContext => {
                leaders.insert(after(i));
                leaders.insert(branch_target(instr, length, &addr_to_index)?);
            }
            Opcode::PopWithContext => {
                leaders.insert(after(i));
                if !instr.with_context_exit() {
                    leaders.insert(branch_target(instr, length, &addr_to_index)?);
                }
            }
            Opcode::Return | Opcode::Exit => {
                leaders.insert(after(i));
            }
            Opcode::Call if is_try_hook(instr) => {
                let (finally_addr, catch_addr) = try_hook_window(instrs, i)?;
                leaders.insert(instrs[i - 4].address);
                leaders.insert(after(i + 1));
                leaders.insert(finally_addr);
                if let Some(catch) = catch_addr {
                    leaders.insert(catch);
                }
            }
            _ => {}
        }
    }

    // Nested entries must start and end on block boundaries so the fragment
    // pass can take whole blocks.
    collect_fragment_boundaries(entry, 0, &mut leaders);

    // Split: one block per consecutive pair of leaders, plus the sentinel
    // end block at the code length.
    let starts: Vec<u32> = leaders.iter().copied().filter(|&a| a < length).collect();
    let mut addr_to_block: HashMap<u32, usize> = HashMap::new();
    for (block_index, &start) in starts.iter().enumerate() {
        let end = starts.get(block_index + 1).copied().unwrap_or(length);
        let first = addr_to_index.get(&start).copied().unwrap_or(instrs.len());
        let mut last = first;
        while last < instrs.len() && instrs[last].address < end {
            last += 1;
        }
        let id = ctx.cfg.add_block(block_index, start, end, InstrRange { start: first, end: last });
        addr_to_block.insert(start, block_index);
        ctx.blocks.push(id);
    }
    let sentinel = ctx.cfg.add_block(ctx.blocks.len(), length, length, InstrRange {
        start: instrs.len(),
        end: instrs.len(),
    });
    addr_to_block.insert(length, ctx.blocks.len());
    ctx.blocks.push(sentinel);

    build_edges(ctx, &addr_to_block)?;
    patch_unreachable(ctx);

    tracing::debug!(blocks = ctx.blocks.len(), entry = %ctx.entry.name, "built basic blocks");
    Ok(())
}

fn build_edges(
    ctx: &mut DecompileContext,
    addr_to_block: &HashMap<u32, usize>,
) -> Result<(), DecompileError> {
    let length = ctx.entry.length;
    for i in 0..ctx.blocks.len() - 1 {
        let id = ctx.blocks[i];
        let fall_through = ctx.blocks[i + 1];
        let range = ctx.cfg.node(id).instrs().expect("leaf block");
        let Some(last) = range.end.checked_sub(1).filter(|&l| l >= range.start) else {
            ctx.cfg.connect(id, fall_through);
            continue;
        };
        let instr = ctx.entry.instructions[last].clone();
        let target_block = |ctx: &DecompileContext, instr: &Instruction| {
            let target = instr.address as i64 + instr.branch_offset() as i64;
            addr_to_block
                .get(&(target as u32))
                .map(|&b| ctx.blocks[b])
                .ok_or(DecompileError::DanglingBranchTarget { address: instr.address, target })
        };
        match instr.opcode {
            Opcode::Branch => {
                let t = target_block(ctx, &instr)?;
                ctx.cfg.connect(id, t);
            }
            Opcode::BranchTrue | Opcode::BranchFalse | Opcode::PushWithContext => {
                let t = target_block(ctx, &instr)?;
                ctx.cfg.connect(id, fall_through);
                ctx.cfg.connect(id, t);
            }
            Opcode::PopWithContext => {
                ctx.cfg.connect(id, fall_through);
                if !instr.with_context_exit() {
                    let t = target_block(ctx, &instr)?;
                    ctx.cfg.connect(id, t);
                }
            }
            Opcode::Return | Opcode::Exit => {}
            Opcode::PopDelete => {
                ctx.cfg.connect(id, fall_through);
                if let Some((finally_addr, catch_addr)) = try_hook_block(ctx, id) {
                    let connect_addr = |ctx: &mut DecompileContext, addr: u32| {
                        if let Some(&b) = addr_to_block.get(&addr) {
                            let to = ctx.blocks[b];
                            ctx.cfg.connect(id, to);
                        }
                    };
                    if finally_addr <= length {
                        connect_addr(ctx, finally_addr);
                    }
                    if let Some(catch) = catch_addr {
                        connect_addr(ctx, catch);
                    }
                }
            }
            _ => {
                ctx.cfg.connect(id, fall_through);
            }
        }
    }
    Ok(())
}

/// Every non-initial block with no predecessors gets a synthetic edge from
/// the block before it, keeping the graph weakly connected for later
/// traversals.
fn patch_unreachable(ctx: &mut DecompileContext) {
    for i in 1..ctx.blocks.len() {
        let id = ctx.blocks[i];
        if ctx.cfg.node(id).preds.is_empty() {
            ctx.cfg.node_mut(id).unreachable = true;
            ctx.cfg.connect(ctx.blocks[i - 1], id);
        }
    }
}

fn branch_target(
    instr: &Instruction,
    length: u32,
    addr_to_index: &HashMap<u32, usize>,
) -> Result<u32, DecompileError> {
    let target = instr.address as i64 + instr.branch_offset() as i64;
    if target == length as i64 {
        return Ok(length);
    }
    if target >= 0 && addr_to_index.contains_key(&(target as u32)) {
        return Ok(target as u32);
    }
    Err(DecompileError::DanglingBranchTarget { address: instr.address, target })
}

fn collect_fragment_boundaries(entry: &CodeEntry, base: u32, leaders: &mut BTreeSet<u32>) {
    for child in &entry.children {
        let start = base + child.start_offset;
        leaders.insert(start);
        leaders.insert(start + child.length);
        collect_fragment_boundaries(child, start, leaders);
    }
}

fn is_try_hook(instr: &Instruction) -> bool {
    instr
        .function
        .as_ref()
        .map(|f| f.name == TRY_HOOK_FUNCTION)
        .unwrap_or(false)
}

/// Validates the fixed window around a try-hook call: pushed finally and
/// catch addresses before it, a `PopDelete` after it. Returns the two
/// addresses (catch is `None` when pushed as -1).
fn try_hook_window(
    instrs: &[Instruction],
    call_index: usize,
) -> Result<(u32, Option<u32>), DecompileError> {
    let address = instrs[call_index].address;
    if call_index < 4 || call_index + 1 >= instrs.len() {
        return Err(DecompileError::MalformedTryHook { address });
    }
    let int32_push = |instr: &Instruction| -> Option<i32> {
        if instr.opcode == Opcode::Push && instr.type1 == DataType::Int32 {
            match instr.value {
                Value::Int32(v) => Some(v),
                _ => None,
            }
        } else {
            None
        }
    };
    let finally = int32_push(&instrs[call_index - 4]);
    let catch = int32_push(&instrs[call_index - 2]);
    let (Some(finally), Some(catch)) = (finally, catch) else {
        return Err(DecompileError::MalformedTryHook { address });
    };
    if instrs[call_index + 1].opcode != Opcode::PopDelete {
        return Err(DecompileError::MalformedTryHook { address });
    }
    let catch = if catch == -1 { None } else { Some(catch as u32) };
    Ok((finally as u32, catch))
}

/// A try-hook block is the isolated six-instruction shape the leader pass
/// carved out: two address pushes with conversions, the hook call, and the
/// discarding pop.
pub fn try_hook_block(ctx: &DecompileContext, block: NodeId) -> Option<(u32, Option<u32>)> {
    let range = ctx.cfg.node(block).instrs()?;
    if range.len() != 6 {
        return None;
    }
    let call = &ctx.entry.instructions[range.start + 4];
    if call.opcode != Opcode::Call || !is_try_hook(call) {
        return None;
    }
    let finally = ctx.entry.instructions[range.start].value.as_i32()?;
    let catch = ctx.entry.instructions[range.start + 2].value.as_i32()?;
    let catch = if catch == -1 { None } else { Some(catch as u32) };
    Some((finally as u32, catch))
}
