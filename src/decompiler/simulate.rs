//! The block simulator and AST builder.
//!
//! Walks the hierarchical graph top-down. Leaf blocks run their
//! instructions against an abstract expression stack, emitting statements;
//! composites pull their governing expressions off the stack and assemble
//! the structured statement their shape stands for.

use crate::bytecode::constants::{NEW_OBJECT_FUNCTION, OLD_ARRAY_LIMIT};
use crate::bytecode::{
    CodeEntry, DataType, ExtendedOpcode, InstanceType, Instruction, Opcode, ReferenceVarType,
    Value,
};
use crate::decompiler::ast::{
    CatchClause, Expression, Statement, SwitchCase, VariableExpr,
};
use crate::decompiler::cfg::{Cfg, InstrRange, NodeId, NodeKind, Terminator};
use crate::decompiler::context::{DecompileContext, Settings};
use crate::decompiler::errors::{DecompileError, DecompileWarning};

/// One abstract stack slot: the rebuilt expression plus the type the VM
/// would see there, and whether it came from a `Duplicate`.
#[derive(Clone, Debug)]
struct StackItem {
    expr: Expression,
    data_type: DataType,
    duplicated: bool,
}

#[derive(Default)]
struct FragmentScope {
    locals: Vec<String>,
}

pub fn build_ast(ctx: &mut DecompileContext) -> Result<Vec<Statement>, DecompileError> {
    let root = ctx.root.expect("fragment pass ran before AST building");
    let mut builder = AstBuilder {
        cfg: &ctx.cfg,
        entry: ctx.entry,
        settings: ctx.settings,
        warnings: &mut ctx.warnings,
        stack: Vec::new(),
        scopes: Vec::new(),
    };
    let mut out = Vec::new();
    builder.visit(root, &mut out)?;
    Ok(out)
}

struct AstBuilder<'a> {
    cfg: &'a Cfg,
    entry: &'a CodeEntry,
    settings: &'a Settings,
    warnings: &'a mut Vec<DecompileWarning>,
    stack: Vec<StackItem>,
    scopes: Vec<FragmentScope>,
}

impl<'a> AstBuilder<'a> {
    fn warn(&mut self, warning: DecompileWarning) {
        tracing::warn!(?warning, "decompile warning");
        self.warnings.push(warning);
    }

    fn pop(&mut self) -> Result<StackItem, DecompileError> {
        self.stack.pop().ok_or_else(|| DecompileError::EmptyStack {
            entry: self.entry.name.clone(),
        })
    }

    fn push(&mut self, expr: Expression, data_type: DataType) {
        self.stack.push(StackItem { expr, data_type, duplicated: false });
    }

    /// Composites record chain heads before later passes may have wrapped
    /// them; climb to the child that now represents the head.
    fn resolve_head(&self, head: NodeId, owner: NodeId) -> NodeId {
        let mut cur = head;
        for _ in 0..self.cfg.len() {
            match self.cfg.node(cur).parent {
                Some(p) if p == owner => break,
                Some(p) => cur = p,
                None => break,
            }
        }
        cur
    }

    fn run_chain(&mut self, start: Option<NodeId>, owner: NodeId, out: &mut Vec<Statement>) -> Result<(), DecompileError> {
        let mut cur = start.map(|h| self.resolve_head(h, owner));
        let mut steps = 0;
        while let Some(id) = cur {
            steps += 1;
            if steps > self.cfg.len() {
                break;
            }
            self.visit(id, out)?;
            let node = self.cfg.node(id);
            match node.terminator {
                Some(Terminator::Break) => out.push(Statement::Break),
                Some(Terminator::Continue) => out.push(Statement::Continue),
                None => {}
            }
            cur = node.succs.first().copied();
        }
        Ok(())
    }

    fn collect_chain(&mut self, start: Option<NodeId>, owner: NodeId) -> Result<Vec<Statement>, DecompileError> {
        let mut out = Vec::new();
        self.run_chain(start, owner, &mut out)?;
        Ok(out)
    }

    fn visit(&mut self, id: NodeId, out: &mut Vec<Statement>) -> Result<(), DecompileError> {
        match self.cfg.node(id).kind.clone() {
            NodeKind::Block { instrs, .. } => self.simulate_range(instrs, out),
            NodeKind::Empty => Ok(()),
            NodeKind::Fragment { name, head } => self.visit_fragment(id, name, head, out),
            NodeKind::ShortCircuit { kind, conditions } => {
                let mut exprs = Vec::new();
                for c in conditions {
                    let before = self.stack.len();
                    self.run_chain(Some(c), id, out)?;
                    let delta = self.stack.len() as isize - before as isize;
                    if delta != 1 {
                        return Err(DecompileError::ShortCircuitStackImbalance {
                            entry: self.entry.name.clone(),
                            delta,
                        });
                    }
                    exprs.push(self.pop()?.expr);
                }
                self.push(
                    Expression::ShortCircuit { kind, conditions: exprs },
                    DataType::Boolean,
                );
                Ok(())
            }
            NodeKind::WhileLoop { condition, body, negate } => {
                let condition = match condition {
                    Some(c) => {
                        self.run_chain(Some(c), id, out)?;
                        let expr = self.pop_expr()?;
                        Some(negated(expr, negate))
                    }
                    None => None,
                };
                let body = self.collect_chain(body, id)?;
                out.push(Statement::While { condition, body });
                Ok(())
            }
            NodeKind::DoUntilLoop { body, negate } => {
                let body = self.collect_chain(Some(body), id)?;
                let expr = self.pop_expr()?;
                out.push(Statement::DoUntil { body, condition: negated(expr, negate) });
                Ok(())
            }
            NodeKind::RepeatLoop { body } => {
                let count = self.pop_expr()?;
                let body = self.collect_chain(Some(body), id)?;
                out.push(Statement::Repeat { count, body });
                Ok(())
            }
            NodeKind::WithLoop { body, .. } => {
                let target = self.pop_expr()?;
                let body = self.collect_chain(Some(body), id)?;
                out.push(Statement::With { target, body });
                Ok(())
            }
            NodeKind::If { then_head, else_head, negate } => {
                let expr = self.pop_expr()?;
                let condition = negated(expr, negate);
                let then_body = self.collect_chain(then_head, id)?;
                let else_body = match else_head {
                    Some(e) => Some(self.collect_chain(Some(e), id)?),
                    None => None,
                };
                out.push(Statement::If { condition, then_body, else_body });
                Ok(())
            }
            NodeKind::Switch { expr_block: _, expr_range, arms } => {
                self.simulate_range(expr_range, out)?;
                let value = self.pop_expr()?;
                let mut cases = Vec::new();
                for arm in arms {
                    let case_value = match arm.value {
                        Some((_, range)) => {
                            self.simulate_range(range, out)?;
                            Some(self.pop_expr()?)
                        }
                        None => None,
                    };
                    let body = match arm.body {
                        Some(b) => self.collect_chain(Some(b), id)?,
                        None => Vec::new(),
                    };
                    cases.push(SwitchCase { value: case_value, body });
                }
                out.push(Statement::Switch { value, cases });
                Ok(())
            }
            NodeKind::TryCatch { try_head, catch_head, catch_variable, finally_head } => {
                let try_body = self.collect_chain(try_head, id)?;
                let catch = match catch_head {
                    Some(c) => Some(CatchClause {
                        variable: catch_variable,
                        body: self.collect_chain(Some(c), id)?,
                    }),
                    None => None,
                };
                let finally_body = match finally_head {
                    Some(f) => Some(self.collect_chain(Some(f), id)?),
                    None => None,
                };
                out.push(Statement::TryCatch { try_body, catch, finally_body });
                Ok(())
            }
        }
    }

    fn visit_fragment(
        &mut self,
        id: NodeId,
        name: Option<String>,
        head: Option<NodeId>,
        out: &mut Vec<Statement>,
    ) -> Result<(), DecompileError> {
        self.scopes.push(FragmentScope::default());
        let depth = self.stack.len();
        let mut body = Vec::new();
        self.run_chain(head, id, &mut body)?;

        let leftover = self.stack.len().saturating_sub(depth);
        if leftover > 0 {
            let entry_name = name.clone().unwrap_or_else(|| self.entry.name.clone());
            self.warn(DecompileWarning::DataLeftover {
                code_entry_name: entry_name.clone(),
                number_of_elements: leftover,
            });
            if !self.settings.allow_leftover_data_on_stack {
                return Err(DecompileError::LeftoverStackData {
                    entry: entry_name,
                    number_of_elements: leftover,
                });
            }
            self.stack.truncate(depth);
        }
        self.scopes.pop();

        match name {
            Some(name) => out.push(Statement::FunctionDecl { name, body }),
            None => out.extend(body),
        }
        Ok(())
    }

    fn pop_expr(&mut self) -> Result<Expression, DecompileError> {
        Ok(self.pop()?.expr)
    }

    fn simulate_range(&mut self, range: InstrRange, out: &mut Vec<Statement>) -> Result<(), DecompileError> {
        for index in range.start..range.end {
            self.step(index, out)?;
        }
        Ok(())
    }

    fn step(&mut self, index: usize, out: &mut Vec<Statement>) -> Result<(), DecompileError> {
        let instr = self.entry.instructions[index].clone();
        match instr.opcode {
            Opcode::Add
            | Opcode::Subtract
            | Opcode::Multiply
            | Opcode::Divide
            | Opcode::Remainder
            | Opcode::Modulo
            | Opcode::And
            | Opcode::Or
            | Opcode::Xor
            | Opcode::ShiftLeft
            | Opcode::ShiftRight
            | Opcode::Compare => {
                let op = instr.opcode;
                let right = self.pop()?;
                let left = self.pop()?;
                let data_type = if op == Opcode::Compare {
                    DataType::Boolean
                } else {
                    wider_type(instr.type1, instr.type2)
                };
                self.push(
                    Expression::Binary {
                        instruction: Box::new(instr),
                        left: Box::new(left.expr),
                        right: Box::new(right.expr),
                    },
                    data_type,
                );
            }
            Opcode::Not | Opcode::Negate => {
                let operand = self.pop()?;
                let data_type = instr.type1;
                self.push(
                    Expression::Unary {
                        instruction: Box::new(instr),
                        operand: Box::new(operand.expr),
                    },
                    data_type,
                );
            }
            Opcode::Convert => self.convert(&instr)?,
            Opcode::Return => {
                let value = self.pop()?;
                out.push(Statement::Return(value.expr));
            }
            Opcode::Exit => out.push(Statement::Exit),
            Opcode::PopDelete => {
                // Empty is fine: early-exit cleanup pops nothing here.
                if let Some(item) = self.stack.pop() {
                    if !item.duplicated && !item.expr.is_variable() {
                        out.push(Statement::Expr(item.expr));
                    }
                }
            }
            Opcode::Call => self.call(&instr)?,
            Opcode::Push | Opcode::PushLocal | Opcode::PushGlobal | Opcode::PushBuiltin => {
                self.push_typed(&instr)?;
            }
            Opcode::PushImmediate => {
                let v = match instr.value {
                    Value::Int16(v) => v,
                    _ => 0,
                };
                self.push(Expression::Int16(v), DataType::Int16);
            }
            Opcode::Pop => self.pop_instruction(&instr, out)?,
            Opcode::Duplicate => self.duplicate(&instr),
            Opcode::Extended => self.extended(&instr, out)?,
            Opcode::Branch => {}
            Opcode::BranchTrue | Opcode::BranchFalse => {
                // Should have been consumed by structural recovery.
                self.stack.pop();
                self.warn(DecompileWarning::UnsupportedInstruction {
                    code_entry_name: self.entry.name.clone(),
                    address: instr.address,
                    description: "unstructured conditional branch".into(),
                });
            }
            Opcode::PushWithContext | Opcode::PopWithContext => {
                self.warn(DecompileWarning::UnsupportedInstruction {
                    code_entry_name: self.entry.name.clone(),
                    address: instr.address,
                    description: "unstructured with-context instruction".into(),
                });
                out.push(Statement::Unsupported(format!(
                    "with-context instruction at address {}",
                    instr.address
                )));
            }
        }
        Ok(())
    }

    /// Constant-folds the boolean conversions the compiler leans on;
    /// otherwise only the recorded stack type changes.
    fn convert(&mut self, instr: &Instruction) -> Result<(), DecompileError> {
        let Some(top) = self.stack.last_mut() else {
            return Err(DecompileError::EmptyStack { entry: self.entry.name.clone() });
        };
        let foldable = matches!(top.expr, Expression::Int16(0) | Expression::Int16(1))
            && ((instr.type1 == DataType::Int32 && instr.type2 == DataType::Boolean)
                || instr.type1 == DataType::Boolean);
        if foldable {
            let truthy = matches!(top.expr, Expression::Int16(1));
            top.expr = Expression::Bool(truthy);
        }
        top.data_type = instr.type2;
        Ok(())
    }

    fn call(&mut self, instr: &Instruction) -> Result<(), DecompileError> {
        let Some(function) = instr.function.as_ref() else {
            self.warn(DecompileWarning::UnknownOpcode {
                code_entry_name: self.entry.name.clone(),
                address: instr.address,
                description: "call without function reference".into(),
            });
            return Ok(());
        };
        let count = instr.argument_count();
        if function.name == NEW_OBJECT_FUNCTION {
            let target = self.pop()?.expr;
            let mut arguments = Vec::new();
            for _ in 1..count {
                arguments.push(self.pop()?.expr);
            }
            self.push(
                Expression::NewObject { function: Box::new(target), arguments },
                DataType::Variable,
            );
        } else {
            let mut arguments = Vec::new();
            for _ in 0..count {
                arguments.push(self.pop()?.expr);
            }
            self.push(
                Expression::Call { function: function.name.clone(), arguments },
                DataType::Variable,
            );
        }
        Ok(())
    }

    fn push_typed(&mut self, instr: &Instruction) -> Result<(), DecompileError> {
        match instr.type1 {
            DataType::Int32 => {
                if let Some(f) = instr.function.as_ref() {
                    self.push(Expression::FunctionReference(f.name.clone()), DataType::Int32);
                } else {
                    let v = instr.value.as_i32().unwrap_or(0);
                    self.push(Expression::Int32(v), DataType::Int32);
                }
            }
            DataType::Int16 => {
                let v = match instr.value {
                    Value::Int16(v) => v,
                    _ => 0,
                };
                self.push(Expression::Int16(v), DataType::Int16);
            }
            DataType::Int64 => {
                let v = match instr.value {
                    Value::Int64(v) => v,
                    _ => 0,
                };
                self.push(Expression::Int64(v), DataType::Int64);
            }
            DataType::Double => {
                let v = match instr.value {
                    Value::Double(v) => v,
                    _ => 0.0,
                };
                self.push(Expression::Double(v), DataType::Double);
            }
            DataType::Boolean => {
                let v = matches!(instr.value, Value::Bool(true));
                self.push(Expression::Bool(v), DataType::Boolean);
            }
            DataType::String => {
                let v = match &instr.value {
                    Value::Str(s) => s.clone(),
                    _ => String::new(),
                };
                self.push(Expression::Str(v), DataType::String);
            }
            DataType::Variable => self.push_variable(instr)?,
        }
        Ok(())
    }

    fn push_variable(&mut self, instr: &Instruction) -> Result<(), DecompileError> {
        let Some(variable) = instr.variable.as_ref() else {
            self.warn(DecompileWarning::UnknownOpcode {
                code_entry_name: self.entry.name.clone(),
                address: instr.address,
                description: "variable push without variable reference".into(),
            });
            return Ok(());
        };
        let (left, indices) = self.resolve_variable_parts(instr)?;
        self.push(
            Expression::variable(VariableExpr {
                left,
                name: variable.name.clone(),
                ref_type: instr.reference_var_type,
                indices,
            }),
            DataType::Variable,
        );
        Ok(())
    }

    /// Left-operand resolution shared by variable pushes and assignments.
    fn resolve_variable_parts(
        &mut self,
        instr: &Instruction,
    ) -> Result<(Expression, Option<Vec<Expression>>), DecompileError> {
        let (left, indices) = match instr.reference_var_type {
            ReferenceVarType::StackTop => (self.pop()?.expr, None),
            ReferenceVarType::Array => {
                let indices = self.pop_array_indices()?;
                (self.pop()?.expr, Some(indices))
            }
            ReferenceVarType::Normal => {
                if instr.instance_type == InstanceType::StackTop {
                    (self.pop()?.expr, None)
                } else {
                    (Expression::Instance(instr.instance_type), None)
                }
            }
        };
        Ok((self.deref_stack_top(left)?, indices))
    }

    /// Modern object chains leave an `Int16` stack-top marker where the
    /// instance goes; the real instance expression sits beneath it. Other
    /// negative `Int16` values are the special instance ids themselves.
    fn deref_stack_top(&mut self, left: Expression) -> Result<Expression, DecompileError> {
        if let Expression::Int16(v) = left {
            if i32::from(v) == InstanceType::StackTop.as_raw() {
                return Ok(self.pop()?.expr);
            }
            if v < 0 {
                return Ok(Expression::Instance(InstanceType::from_raw(i32::from(v))));
            }
        }
        Ok(left)
    }

    /// One popped index, split into row and column when legacy bytecode
    /// flattened a 2D access with the row stride.
    fn pop_array_indices(&mut self) -> Result<Vec<Expression>, DecompileError> {
        let index = self.pop()?.expr;
        if self.settings.modern_arrays {
            return Ok(vec![index]);
        }
        if let Expression::Binary { instruction, left, right } = &index {
            if instruction.opcode == Opcode::Add {
                if let Expression::Binary {
                    instruction: mul,
                    left: outer,
                    right: stride,
                } = left.as_ref()
                {
                    if mul.opcode == Opcode::Multiply
                        && matches!(stride.as_ref(), Expression::Int32(v) if *v == OLD_ARRAY_LIMIT)
                    {
                        return Ok(vec![outer.as_ref().clone(), right.as_ref().clone()]);
                    }
                }
            }
        }
        Ok(vec![index])
    }

    fn pop_instruction(
        &mut self,
        instr: &Instruction,
        out: &mut Vec<Statement>,
    ) -> Result<(), DecompileError> {
        let Some(variable) = instr.variable.clone() else {
            // Variable-less pop: swap the two top items over a group of
            // discarded ones. The size operand counts four for the pair.
            let e1 = self.pop()?;
            let e2 = self.pop()?;
            let extra = instr.pop_swap_size() - 4;
            for _ in 0..extra.max(0) {
                self.pop()?;
            }
            self.stack.push(e2);
            self.stack.push(e1);
            return Ok(());
        };

        if instr.instance_type == InstanceType::Local {
            if let Some(scope) = self.scopes.last_mut() {
                if !scope.locals.contains(&variable.name) {
                    scope.locals.push(variable.name.clone());
                }
            }
        }

        // Int32-typed pops take their value before the left side resolves.
        let mut value = if instr.type1 == DataType::Int32 {
            Some(self.pop()?)
        } else {
            None
        };
        let (left, indices) = self.resolve_variable_parts(instr)?;
        let mut value = match value.take() {
            Some(v) => v,
            None => self.pop()?,
        };
        if instr.type2 == DataType::Boolean {
            if let Expression::Int16(v @ (0 | 1)) = value.expr {
                value.expr = Expression::Bool(v == 1);
            }
        }
        out.push(Statement::Assign {
            target: VariableExpr {
                left,
                name: variable.name,
                ref_type: instr.reference_var_type,
                indices,
            },
            value: value.expr,
        });
        Ok(())
    }

    fn duplicate(&mut self, instr: &Instruction) {
        if instr.duplication_size2() != 0 {
            self.warn(DecompileWarning::UnsupportedInstruction {
                code_entry_name: self.entry.name.clone(),
                address: instr.address,
                description: "dup-swap duplication".into(),
            });
        }
        if let Some(top) = self.stack.last_mut() {
            top.duplicated = true;
            let copy = top.clone();
            self.stack.push(copy);
        }
    }

    fn extended(
        &mut self,
        instr: &Instruction,
        out: &mut Vec<Statement>,
    ) -> Result<(), DecompileError> {
        match instr.extended {
            Some(ExtendedOpcode::SetArrayOwner) => {
                self.pop()?;
            }
            Some(ExtendedOpcode::PushReference) => {
                self.warn(DecompileWarning::UnsupportedInstruction {
                    code_entry_name: self.entry.name.clone(),
                    address: instr.address,
                    description: "push reference".into(),
                });
                let v = instr.value.as_i32().unwrap_or(0);
                self.push(Expression::Int32(v), DataType::Int32);
            }
            None => {
                self.warn(DecompileWarning::UnknownOpcode {
                    code_entry_name: self.entry.name.clone(),
                    address: instr.address,
                    description: "extended instruction without extended opcode".into(),
                });
                out.push(Statement::Unsupported(format!(
                    "extended instruction at address {}",
                    instr.address
                )));
            }
        }
        Ok(())
    }
}

fn negated(expr: Expression, negate: bool) -> Expression {
    if !negate {
        return expr;
    }
    let mut not = Instruction::new(Opcode::Not);
    not.type1 = DataType::Boolean;
    Expression::Unary { instruction: Box::new(not), operand: Box::new(expr) }
}

fn wider_type(a: DataType, b: DataType) -> DataType {
    fn rank(t: DataType) -> u8 {
        match t {
            DataType::Int16 => 0,
            DataType::Boolean => 1,
            DataType::Int32 => 2,
            DataType::Int64 => 3,
            DataType::Double => 4,
            DataType::String => 5,
            DataType::Variable => 6,
        }
    }
    if rank(a) >= rank(b) {
        a
    } else {
        b
    }
}
