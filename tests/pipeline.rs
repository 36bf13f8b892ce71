//! Pipeline-level properties: pass idempotence, policy handling, and
//! degenerate inputs.

mod common;

use common::{assign_int, decompiled, test_var};
use gmdcmp::bytecode::builder::StreamBuilder;
use gmdcmp::bytecode::{DataType, InstanceType};
use gmdcmp::decompiler::blocks::build_blocks;
use gmdcmp::decompiler::passes::{
    conditionals, fragments, loops, short_circuits, switches, try_catch,
};
use gmdcmp::decompiler::DecompileContext;
use gmdcmp::{DecompileError, Settings};
use pretty_assertions::assert_eq;

#[test]
fn straight_line_code_keeps_statement_order() {
    let mut b = StreamBuilder::new("straight");
    assign_int(&mut b, "a", 1);
    assign_int(&mut b, "b", 2);
    b.call("do_thing", 0);
    b.pop_delete();
    assign_int(&mut b, "c", 3);
    let entry = b.finish();

    assert_eq!(
        decompiled(&entry),
        "a = 1;\nb = 2;\ndo_thing();\nc = 3;\n"
    );
}

#[test]
fn empty_entry_produces_empty_listing() {
    let entry = StreamBuilder::new("empty").finish();
    assert_eq!(decompiled(&entry), "");
}

#[test]
fn strict_leftover_policy_is_fatal() {
    let mut b = StreamBuilder::new("root");
    b.push_imm(0);
    let entry = b.finish();
    let settings = Settings {
        allow_leftover_data_on_stack: false,
        ..Settings::default()
    };
    let err = gmdcmp::decompile(&entry, &settings).unwrap_err();
    assert!(matches!(
        err,
        DecompileError::LeftoverStackData { number_of_elements: 1, .. }
    ));
}

/// Re-running every recovery pass on an already-recovered graph finds
/// nothing new.
#[test]
fn structural_recovery_is_idempotent() {
    let mut b = StreamBuilder::new("idem");
    let (sc_false, sc_join, body_end, end, top) = (
        b.new_label(),
        b.new_label(),
        b.new_label(),
        b.new_label(),
        b.new_label(),
    );
    // while (i < 10) { if (c && d) { i = i + 1 } }
    b.place(top);
    b.push_var(InstanceType::SelfInstance, "i");
    b.push_i32(10);
    b.compare(gmdcmp::bytecode::ComparisonType::LessThan);
    b.branch_false(end);
    test_var(&mut b, "c");
    b.branch_false(sc_false);
    test_var(&mut b, "d");
    b.branch(sc_join);
    b.place(sc_false);
    b.push_i16(0);
    b.place(sc_join);
    b.branch_false(body_end);
    b.push_var(InstanceType::SelfInstance, "i");
    b.push_i32(1);
    b.binary(gmdcmp::bytecode::Opcode::Add, DataType::Int32, DataType::Variable);
    b.pop_var(InstanceType::SelfInstance, "i", DataType::Variable);
    b.place(body_end);
    b.branch(top);
    b.place(end);
    let entry = b.finish();

    let settings = Settings::default();
    let mut ctx = DecompileContext::new(&entry, &settings);
    build_blocks(&mut ctx).unwrap();
    fragments::find_fragments(&mut ctx).unwrap();
    short_circuits::find_short_circuits(&mut ctx).unwrap();
    loops::find_loops(&mut ctx).unwrap();
    conditionals::find_conditionals(&mut ctx).unwrap();
    switches::find_switches(&mut ctx).unwrap();
    try_catch::find_try_catch(&mut ctx).unwrap();

    let counts = (
        ctx.short_circuits.len(),
        ctx.loops.len(),
        ctx.branches.len(),
        ctx.switches.len(),
        ctx.try_catches.len(),
    );

    short_circuits::find_short_circuits(&mut ctx).unwrap();
    loops::find_loops(&mut ctx).unwrap();
    conditionals::find_conditionals(&mut ctx).unwrap();
    switches::find_switches(&mut ctx).unwrap();
    try_catch::find_try_catch(&mut ctx).unwrap();

    assert_eq!(
        counts,
        (
            ctx.short_circuits.len(),
            ctx.loops.len(),
            ctx.branches.len(),
            ctx.switches.len(),
            ctx.try_catches.len(),
        )
    );
    ctx.cfg.verify().unwrap();
}
