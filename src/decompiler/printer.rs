//! Renders the recovered AST as a source listing.
//!
//! One statement per line, Allman braces, four-space indents. Operator
//! precedence decides parenthesization; the printer-facing `Settings`
//! options control semicolons and blank-line placement.

use crate::bytecode::{ComparisonType, InstanceType, Instruction, Opcode};
use crate::decompiler::ast::{Expression, Statement, SwitchCase, VariableExpr};
use crate::decompiler::cfg::LogicKind;
use crate::decompiler::context::Settings;
use crate::pretty::{doc, empty, intersperse, nest, newline, Doc};

pub fn print_program(statements: &[Statement], settings: &Settings) -> String {
    if statements.is_empty() {
        return String::new();
    }
    let mut out = statements_doc(statements, settings).render_string();
    out.push('\n');
    out
}

fn statements_doc(statements: &[Statement], settings: &Settings) -> Doc {
    let mut result = empty();
    for (i, stmt) in statements.iter().enumerate() {
        if i > 0 {
            result += newline();
            let near_branch = is_branch_statement(stmt) || is_branch_statement(&statements[i - 1]);
            let near_decl = matches!(stmt, Statement::FunctionDecl { .. })
                || matches!(statements[i - 1], Statement::FunctionDecl { .. });
            if (settings.empty_line_around_branch_statements && near_branch)
                || (settings.empty_line_around_function_declarations && near_decl)
            {
                result += newline();
            }
        }
        result += statement_doc(stmt, settings);
    }
    result
}

fn is_branch_statement(stmt: &Statement) -> bool {
    matches!(
        stmt,
        Statement::If { .. }
            | Statement::While { .. }
            | Statement::DoUntil { .. }
            | Statement::Repeat { .. }
            | Statement::With { .. }
            | Statement::Switch { .. }
            | Statement::TryCatch { .. }
    )
}

fn block_doc(body: &[Statement], settings: &Settings) -> Doc {
    if body.is_empty() {
        return newline() + "{" + newline() + "}";
    }
    newline() + "{" + nest(4, newline() + statements_doc(body, settings)) + newline() + "}"
}

fn semi(settings: &Settings) -> Doc {
    if settings.use_semicolon {
        doc(";")
    } else {
        empty()
    }
}

fn statement_doc(stmt: &Statement, settings: &Settings) -> Doc {
    match stmt {
        Statement::Assign { target, value } => {
            variable_doc(target) + " = " + expr_doc(value) + semi(settings)
        }
        Statement::Expr(e) => expr_doc(e) + semi(settings),
        Statement::Return(e) => doc("return ") + expr_doc(e) + semi(settings),
        Statement::Exit => doc("exit") + semi(settings),
        Statement::Break => doc("break") + semi(settings),
        Statement::Continue => doc("continue") + semi(settings),
        Statement::If { condition, then_body, else_body } => {
            let mut result = doc("if (") + expr_doc(condition) + ")" + block_doc(then_body, settings);
            if let Some(else_body) = else_body {
                result += newline();
                // An else holding exactly one conditional chains as `else if`.
                if let [only @ Statement::If { .. }] = else_body.as_slice() {
                    result += doc("else ") + statement_doc(only, settings);
                } else {
                    result += doc("else") + block_doc(else_body, settings);
                }
            }
            result
        }
        Statement::While { condition, body } => {
            let cond = match condition {
                Some(c) => expr_doc(c),
                None => doc("true"),
            };
            doc("while (") + cond + ")" + block_doc(body, settings)
        }
        Statement::DoUntil { body, condition } => {
            doc("do") + block_doc(body, settings) + newline() + "until ("
                + expr_doc(condition)
                + ")"
                + semi(settings)
        }
        Statement::Repeat { count, body } => {
            doc("repeat (") + expr_doc(count) + ")" + block_doc(body, settings)
        }
        Statement::With { target, body } => {
            doc("with (") + expr_doc(target) + ")" + block_doc(body, settings)
        }
        Statement::Switch { value, cases } => switch_doc(value, cases, settings),
        Statement::TryCatch { try_body, catch, finally_body } => {
            let mut result = doc("try") + block_doc(try_body, settings);
            if let Some(catch) = catch {
                result += newline();
                result += match &catch.variable {
                    Some(v) => doc("catch (") + v.as_str() + ")",
                    None => doc("catch"),
                };
                result += block_doc(&catch.body, settings);
            }
            if let Some(finally_body) = finally_body {
                result += newline() + doc("finally") + block_doc(finally_body, settings);
            }
            result
        }
        Statement::FunctionDecl { name, body } => {
            doc("function ") + name.as_str() + "()" + block_doc(body, settings)
        }
        Statement::Unsupported(description) => doc("/* ") + description.as_str() + " */",
    }
}

fn switch_doc(value: &Expression, cases: &[SwitchCase], settings: &Settings) -> Doc {
    let mut inner = empty();
    for (i, case) in cases.iter().enumerate() {
        if i > 0 {
            inner += newline();
            if settings.empty_line_before_switch_cases {
                inner += newline();
            }
        }
        inner += match &case.value {
            Some(v) => doc("case ") + expr_doc(v) + ":",
            None => doc("default:"),
        };
        if !case.body.is_empty() {
            inner += nest(4, newline() + statements_doc(&case.body, settings));
            if settings.empty_line_after_switch_cases && i + 1 < cases.len() {
                inner += newline();
            }
        }
    }
    doc("switch (") + expr_doc(value) + ")" + newline() + "{" + nest(4, newline() + inner)
        + newline()
        + "}"
}

// Higher binds tighter. Bitwise operators sit between the logical and
// comparison tiers, as the language defines them.
const PREC_OR: u8 = 1;
const PREC_AND: u8 = 2;
const PREC_BIT_OR: u8 = 3;
const PREC_BIT_XOR: u8 = 4;
const PREC_BIT_AND: u8 = 5;
const PREC_CMP: u8 = 6;
const PREC_SHIFT: u8 = 7;
const PREC_ADD: u8 = 8;
const PREC_MUL: u8 = 9;
const PREC_UNARY: u8 = 10;
const PREC_ACCESS: u8 = 11;
const PREC_ATOM: u8 = 12;

fn binary_op(instruction: &Instruction) -> (&'static str, u8) {
    match instruction.opcode {
        Opcode::Add => ("+", PREC_ADD),
        Opcode::Subtract => ("-", PREC_ADD),
        Opcode::Multiply => ("*", PREC_MUL),
        Opcode::Divide => ("/", PREC_MUL),
        Opcode::Remainder => ("div", PREC_MUL),
        Opcode::Modulo => ("%", PREC_MUL),
        Opcode::And => ("&", PREC_BIT_AND),
        Opcode::Or => ("|", PREC_BIT_OR),
        Opcode::Xor => ("^", PREC_BIT_XOR),
        Opcode::ShiftLeft => ("<<", PREC_SHIFT),
        Opcode::ShiftRight => (">>", PREC_SHIFT),
        Opcode::Compare => (
            instruction
                .comparison
                .unwrap_or(ComparisonType::Equal)
                .symbol(),
            PREC_CMP,
        ),
        _ => ("?", PREC_ATOM),
    }
}

fn precedence(e: &Expression) -> u8 {
    match e {
        Expression::Binary { instruction, .. } => binary_op(instruction).1,
        Expression::Unary { .. } => PREC_UNARY,
        Expression::ShortCircuit { kind: LogicKind::And, .. } => PREC_AND,
        Expression::ShortCircuit { kind: LogicKind::Or, .. } => PREC_OR,
        _ => PREC_ATOM,
    }
}

fn expr_doc(e: &Expression) -> Doc {
    match e {
        Expression::Int16(v) => doc(v),
        Expression::Int32(v) => doc(v),
        Expression::Int64(v) => doc(v),
        Expression::Double(v) => doc(v),
        Expression::Bool(v) => doc(v),
        Expression::Str(s) => doc(format!("\"{}\"", escape(s))),
        Expression::Variable(v) => variable_doc(v),
        Expression::Binary { instruction, left, right } => {
            let (symbol, prec) = binary_op(instruction);
            wrapped(left, prec, false) + format!(" {symbol} ") + wrapped(right, prec, true)
        }
        Expression::Unary { instruction, operand } => {
            let symbol = match instruction.opcode {
                Opcode::Not => "!",
                _ => "-",
            };
            doc(symbol) + wrapped(operand, PREC_UNARY, false)
        }
        Expression::Call { function, arguments } => {
            doc(function.as_str()) + "(" + intersperse(arguments.iter().map(expr_doc), ", ") + ")"
        }
        Expression::FunctionReference(name) => doc(name.as_str()),
        Expression::NewObject { function, arguments } => {
            doc("new ") + wrapped(function, PREC_ACCESS, false) + "("
                + intersperse(arguments.iter().map(expr_doc), ", ")
                + ")"
        }
        Expression::ShortCircuit { kind, conditions } => {
            let (symbol, prec) = match kind {
                LogicKind::And => (" && ", PREC_AND),
                LogicKind::Or => (" || ", PREC_OR),
            };
            intersperse(conditions.iter().map(|c| wrapped(c, prec, false)), symbol)
        }
        Expression::Instance(instance) => instance_doc(*instance),
    }
}

/// Parenthesizes `e` when it binds looser than the surrounding operator
/// (or equally, on the right side of one).
fn wrapped(e: &Expression, parent: u8, right_side: bool) -> Doc {
    let prec = precedence(e);
    let needs = if right_side { prec <= parent } else { prec < parent };
    if needs {
        doc("(") + expr_doc(e) + ")"
    } else {
        expr_doc(e)
    }
}

fn variable_doc(v: &VariableExpr) -> Doc {
    let base = match &v.left {
        Expression::Instance(instance) => match instance {
            InstanceType::SelfInstance
            | InstanceType::Builtin
            | InstanceType::Local
            | InstanceType::Argument
            | InstanceType::Static => doc(v.name.as_str()),
            InstanceType::Global => doc("global.") + v.name.as_str(),
            InstanceType::Other => doc("other.") + v.name.as_str(),
            InstanceType::All => doc("all.") + v.name.as_str(),
            InstanceType::Noone => doc("noone.") + v.name.as_str(),
            InstanceType::StackTop => doc(v.name.as_str()),
            InstanceType::ObjectId(id) => doc(format!("({id}).")) + v.name.as_str(),
        },
        left => wrapped(left, PREC_ACCESS, false) + "." + v.name.as_str(),
    };
    match &v.indices {
        Some(indices) => {
            base + "[" + intersperse(indices.iter().map(expr_doc), ", ") + "]"
        }
        None => base,
    }
}

fn instance_doc(instance: InstanceType) -> Doc {
    match instance {
        InstanceType::SelfInstance => doc("self"),
        InstanceType::Other => doc("other"),
        InstanceType::All => doc("all"),
        InstanceType::Noone => doc("noone"),
        InstanceType::Global => doc("global"),
        InstanceType::Builtin => doc("builtin"),
        InstanceType::Local => doc("local"),
        InstanceType::StackTop => doc("self"),
        InstanceType::Argument => doc("argument"),
        InstanceType::Static => doc("static"),
        InstanceType::ObjectId(id) => doc(id),
    }
}

fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::ReferenceVarType;

    fn self_var(name: &str) -> VariableExpr {
        VariableExpr {
            left: Expression::Instance(InstanceType::SelfInstance),
            name: name.into(),
            ref_type: ReferenceVarType::Normal,
            indices: None,
        }
    }

    #[test]
    fn assignment_renders_with_semicolon() {
        let stmt = Statement::Assign { target: self_var("a"), value: Expression::Int32(123) };
        let out = print_program(&[stmt], &Settings::default());
        assert_eq!(out, "a = 123;\n");
    }

    #[test]
    fn semicolons_can_be_disabled() {
        let stmt = Statement::Assign { target: self_var("a"), value: Expression::Int32(1) };
        let settings = Settings { use_semicolon: false, ..Settings::default() };
        assert_eq!(print_program(&[stmt], &settings), "a = 1\n");
    }

    #[test]
    fn precedence_parenthesizes_loose_operands() {
        // (a + b) * c
        let mut add = Instruction::new(Opcode::Add);
        add.type1 = crate::bytecode::DataType::Variable;
        let mut mul = Instruction::new(Opcode::Multiply);
        mul.type1 = crate::bytecode::DataType::Variable;
        let sum = Expression::Binary {
            instruction: Box::new(add),
            left: Box::new(Expression::variable(self_var("a"))),
            right: Box::new(Expression::variable(self_var("b"))),
        };
        let product = Expression::Binary {
            instruction: Box::new(mul),
            left: Box::new(sum),
            right: Box::new(Expression::variable(self_var("c"))),
        };
        let out = print_program(&[Statement::Expr(product)], &Settings::default());
        assert_eq!(out, "(a + b) * c;\n");
    }

    #[test]
    fn else_with_single_if_chains() {
        let inner = Statement::If {
            condition: Expression::variable(self_var("b")),
            then_body: vec![Statement::Exit],
            else_body: None,
        };
        let outer = Statement::If {
            condition: Expression::variable(self_var("a")),
            then_body: vec![Statement::Exit],
            else_body: Some(vec![inner]),
        };
        let out = print_program(&[outer], &Settings::default());
        assert_eq!(
            out,
            "if (a)\n{\n    exit;\n}\nelse if (b)\n{\n    exit;\n}\n"
        );
    }

    #[test]
    fn blank_lines_surround_branches_when_enabled() {
        let stmts = vec![
            Statement::Assign { target: self_var("a"), value: Expression::Int32(1) },
            Statement::While {
                condition: Some(Expression::variable(self_var("b"))),
                body: vec![],
            },
            Statement::Assign { target: self_var("c"), value: Expression::Int32(2) },
        ];
        let settings = Settings {
            empty_line_around_branch_statements: true,
            ..Settings::default()
        };
        let out = print_program(&stmts, &settings);
        assert_eq!(out, "a = 1;\n\nwhile (b)\n{\n}\n\nc = 2;\n");
    }
}
