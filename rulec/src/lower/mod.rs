//! Scope-annotated tree to LIR lowering
//!
//! Each declaration is compiled by walking its expression tree. Every node
//! first makes the open loop nest match the axes it runs under:
//!
//! - a node whose axes are a prefix of the open nest is broadcast and
//!   emitted in place (LICM lifts it later);
//! - anything else closes frames down to the longest common prefix and
//!   opens the missing ones through the anchor plans.
//!
//! A reduction must start from exactly its result axes, so reductions that
//! would otherwise close loops still in use are computed ahead of the node
//! that contains them, shortest result axes first.

mod context;
mod stencil;

use std::collections::HashMap;

use tracing::{debug, instrument};

use crate::error::{CompileError, Result};
use crate::lir::{
    Axis, DType, Instruction, LirDeclaration, LirProgram, Op, Operand, Register, Stamp,
    instruction_count,
};
use crate::registry::FunctionRegistry;
use crate::scope::{DeclKind, ExprKind, ScopedDeclaration, ScopedExpr, ScopedSchema};
use crate::span::Span;

use context::Emitter;

/// Remaining stack that triggers growth
const STACK_RED_ZONE: usize = 128 * 1024;
/// Stack segment allocated on growth
const STACK_GROW_SIZE: usize = 4 * 1024 * 1024;

/// Lower every declaration of a schema
pub fn lower_schema(schema: &ScopedSchema, registry: &FunctionRegistry) -> Result<LirProgram> {
    let mut program = LirProgram::new();
    for decl in &schema.declarations {
        if program.get(&decl.name).is_some() {
            return Err(CompileError::malformed(&decl.name, "declared more than once"));
        }
        program.insert(lower_declaration(schema, registry, decl)?);
    }
    Ok(program)
}

/// Lower one declaration
#[instrument(level = "debug", skip_all, fields(declaration = %decl.name))]
pub fn lower_declaration(
    schema: &ScopedSchema,
    registry: &FunctionRegistry,
    decl: &ScopedDeclaration,
) -> Result<LirDeclaration> {
    if decl.kind == DeclKind::Trait && decl.expr.dtype != DType::Boolean {
        return Err(CompileError::malformed(
            &decl.name,
            format!("trait must be boolean, found {}", decl.expr.dtype),
        ));
    }

    let mut lowerer = Lowerer {
        schema,
        registry,
        declaration: &decl.name,
        em: Emitter::new(),
        precomputed: HashMap::new(),
    };
    let result = lowerer.lower_root(&decl.expr);
    // Frames are closed even when lowering stopped early.
    let body = lowerer.em.finish();
    result?;

    debug!(instructions = instruction_count(&body), "lowered");
    Ok(LirDeclaration {
        name: decl.name.clone(),
        axes: decl.expr.axes.clone(),
        dtype: decl.expr.dtype.clone(),
        body,
    })
}

struct Lowerer<'a> {
    schema: &'a ScopedSchema,
    registry: &'a FunctionRegistry,
    declaration: &'a str,
    em: Emitter,
    /// Reductions computed ahead of their parent, by node identity
    precomputed: HashMap<*const ScopedExpr, Register>,
}

impl Lowerer<'_> {
    fn malformed(&self, message: impl Into<String>) -> CompileError {
        CompileError::malformed(self.declaration, message)
    }

    fn lower_root(&mut self, root: &ScopedExpr) -> Result<()> {
        let value = self.compile(root)?;
        self.enter_context(&root.axes, root.span)?;
        self.em.emit(Instruction::effect(Op::Yield { value }).at(root.span));
        Ok(())
    }

    // ========================================================================
    // Loop context
    // ========================================================================

    /// Make the open nest exactly `target`
    fn enter_context(&mut self, target: &[Axis], span: Option<Span>) -> Result<()> {
        let common = self
            .em
            .frames()
            .iter()
            .zip(target)
            .take_while(|(frame, axis)| &frame.axis == *axis)
            .count();
        self.em.close_to(common);
        for (depth, axis) in target.iter().enumerate().skip(common) {
            self.open_axis(axis, depth, span)?;
        }
        Ok(())
    }

    /// Broadcast into the open nest when possible, enter `axes` otherwise
    fn ensure_axes(&mut self, axes: &[Axis], span: Option<Span>) -> Result<()> {
        if self.em.is_open_prefix(axes) {
            return Ok(());
        }
        self.enter_context(axes, span)
    }

    fn open_axis(&mut self, axis: &Axis, depth: usize, span: Option<Span>) -> Result<()> {
        let schema = self.schema;
        let step = schema.step_for(self.declaration, axis)?;
        if step.loop_index != depth {
            return Err(self.malformed(format!(
                "axis {axis} is planned at loop index {} but needed at depth {depth}",
                step.loop_index
            )));
        }

        let base = match depth.checked_sub(1) {
            None => None,
            Some(parent_depth) => {
                let parent = &self.em.frames()[parent_depth];
                if schema.parent_of(axis) != Some(&parent.axis) {
                    return Err(self.malformed(format!(
                        "axis {axis} cannot be traversed from {}",
                        parent.axis
                    )));
                }
                Some(parent.element)
            }
        };

        let stamp = Stamp::new(DType::array_of(DType::Any), self.em.open_axes());
        let collection = self.load_path(base, &step.path, stamp, span)?;
        self.em.open(axis.clone(), collection, span);
        Ok(())
    }

    /// `LoadInput`/`LoadField` chain, reusing loads already visible
    fn load_path(
        &mut self,
        base: Option<Register>,
        path: &[String],
        stamp: Stamp,
        span: Option<Span>,
    ) -> Result<Register> {
        let mut current = base;
        for (i, key) in path.iter().enumerate() {
            if let Some(reg) = self.em.memo_get(current, key) {
                current = Some(reg);
                continue;
            }
            let step_stamp = if i + 1 == path.len() {
                stamp.clone()
            } else {
                Stamp::new(DType::Any, self.em.open_axes())
            };
            let op = match current {
                None => Op::LoadInput { key: key.clone() },
                Some(object) => Op::LoadField { object, key: key.clone() },
            };
            let reg = self.em.define(step_stamp, op, span);
            self.em.memo_insert(current, key, reg);
            current = Some(reg);
        }
        current.ok_or_else(|| self.malformed("empty field path"))
    }

    // ========================================================================
    // Reductions ahead of their parent
    // ========================================================================

    fn precompute_reductions(&mut self, expr: &ScopedExpr) -> Result<()> {
        if expr.axes.is_empty() {
            return Ok(());
        }
        let mut found = Vec::new();
        for child in children(expr) {
            collect_breaking_reductions(child, &expr.axes, &mut found);
        }
        found.sort_by_key(|r| r.axes.len());

        for reduction in found {
            let key = reduction as *const ScopedExpr;
            if self.precomputed.contains_key(&key) {
                continue;
            }
            let reg = self.compile(reduction)?;
            self.precomputed.insert(key, reg);
        }
        Ok(())
    }

    // ========================================================================
    // Per-node emission
    // ========================================================================

    fn compile(&mut self, expr: &ScopedExpr) -> Result<Register> {
        stacker::maybe_grow(STACK_RED_ZONE, STACK_GROW_SIZE, || self.compile_inner(expr))
    }

    fn compile_inner(&mut self, expr: &ScopedExpr) -> Result<Register> {
        if let Some(reg) = self.precomputed.get(&(expr as *const ScopedExpr)) {
            return Ok(*reg);
        }
        self.precompute_reductions(expr)?;

        let span = expr.span;
        let stamp = Stamp::new(expr.dtype.clone(), expr.axes.clone());
        if let ExprKind::Reduce { function, over, arg } = &expr.kind {
            return self.reduce(function, over, arg, stamp, span);
        }
        self.ensure_axes(&expr.axes, span)?;

        match &expr.kind {
            ExprKind::Literal { value } => {
                Ok(self.em.define(stamp, Op::Constant { value: value.clone() }, span))
            }
            ExprKind::InputRef { path } => self.input_ref(path, stamp, span),
            ExprKind::DeclRef { name } => self.decl_ref(name, stamp, span),
            ExprKind::IndexRef { axis } => {
                let pos = expr.axes.iter().position(|a| a == axis).ok_or_else(|| {
                    self.malformed(format!("index of {axis} outside its loop"))
                })?;
                Ok(self.em.frames()[pos].index)
            }
            ExprKind::Call { function, args } => self.call(function, args, stamp, span),
            ExprKind::Select { cond, on_true, on_false } => {
                let cond = self.compile(cond)?;
                let on_true = self.compile(on_true)?;
                let on_false = self.compile(on_false)?;
                self.ensure_axes(&stamp.axes, span)?;
                Ok(self.em.define(stamp, select(cond, on_true, on_false), span))
            }
            ExprKind::Cascade { cases, default } => {
                let mut arms = Vec::with_capacity(cases.len());
                for case in cases {
                    arms.push((self.compile(&case.when)?, self.compile(&case.then)?));
                }
                let mut result = self.compile(default)?;
                self.ensure_axes(&stamp.axes, span)?;
                for (when, then) in arms.into_iter().rev() {
                    result = self.em.define(stamp.clone(), select(when, then, result), span);
                }
                Ok(result)
            }
            ExprKind::MakeTuple { elements } => {
                let mut regs = Vec::with_capacity(elements.len());
                for e in elements {
                    regs.push(Operand::Reg(self.compile(e)?));
                }
                self.ensure_axes(&stamp.axes, span)?;
                Ok(self.em.define(stamp, Op::MakeTuple { elements: regs }, span))
            }
            ExprKind::MakeObject { fields } => {
                let mut values = Vec::with_capacity(fields.len());
                for field in fields {
                    values.push((field.key.clone(), Operand::Reg(self.compile(&field.value)?)));
                }
                self.ensure_axes(&stamp.axes, span)?;
                Ok(self.em.define(stamp, Op::MakeObject { fields: values }, span))
            }
            ExprKind::TupleGet { tuple, index } => {
                let tuple = self.compile(tuple)?;
                self.ensure_axes(&stamp.axes, span)?;
                Ok(self.em.define(stamp, Op::TupleGet { tuple, index: *index }, span))
            }
            ExprKind::Shift { .. } => stencil::lower_shift(self, expr),
            ExprKind::Reduce { .. } => Err(self.malformed("reduce reached node emission")),
        }
    }

    fn input_ref(&mut self, path: &[String], stamp: Stamp, span: Option<Span>) -> Result<Register> {
        let base = match stamp.axes.len().checked_sub(1) {
            None => None,
            Some(depth) => Some(self.em.frames()[depth].element),
        };
        match (base, path.is_empty()) {
            (Some(element), true) => Ok(element),
            (None, true) => Err(self.malformed("input reference with an empty path")),
            _ => self.load_path(base, path, stamp, span),
        }
    }

    fn decl_ref(&mut self, name: &str, stamp: Stamp, span: Option<Span>) -> Result<Register> {
        if name == self.declaration {
            return Err(self.malformed("declaration references itself"));
        }
        let target = self
            .schema
            .get(name)
            .ok_or_else(|| self.malformed(format!("reference to unknown declaration `{name}`")))?;
        if !stamp.axes.starts_with(target.axes()) {
            return Err(self.malformed(format!(
                "`{name}` varies over axes the reference does not run under"
            )));
        }
        let op = Op::LoadDeclaration {
            name: name.to_string(),
            axes: target.axes().to_vec(),
        };
        Ok(self.em.define(stamp, op, span))
    }

    fn call(
        &mut self,
        function: &str,
        args: &[ScopedExpr],
        stamp: Stamp,
        span: Option<Span>,
    ) -> Result<Register> {
        let registry = self.registry;
        let sig = registry
            .get(function)
            .ok_or_else(|| self.malformed(format!("unknown function `{function}`")))?;
        if sig.reducer.is_some() && sig.eval.is_none() {
            return Err(self.malformed(format!("aggregate `{function}` used as a plain call")));
        }
        if !sig.arity.accepts(args.len()) {
            return Err(self.malformed(format!(
                "`{function}` called with {} argument(s)",
                args.len()
            )));
        }

        let mut operands = Vec::with_capacity(args.len());
        for arg in args {
            operands.push(Operand::Reg(self.compile(arg)?));
        }
        self.ensure_axes(&stamp.axes, span)?;
        let op = Op::KernelCall {
            function: function.to_string(),
            args: operands,
        };
        Ok(self.em.define(stamp, op, span))
    }

    /// Accumulator loop over `over`, starting from exactly the result axes
    fn reduce(
        &mut self,
        function: &str,
        over: &[Axis],
        arg: &ScopedExpr,
        stamp: Stamp,
        span: Option<Span>,
    ) -> Result<Register> {
        let reducer = self
            .registry
            .reducer(function)
            .cloned()
            .ok_or_else(|| self.malformed(format!("`{function}` is not a reducer")))?;
        if over.is_empty() {
            return Err(self.malformed(format!("`{function}` reduces over no axes")));
        }
        let expected: Vec<Axis> = stamp.axes.iter().chain(over).cloned().collect();
        if arg.axes != expected {
            return Err(self.malformed(format!(
                "`{function}` argument runs under {:?}, expected {:?}",
                arg.axes.iter().map(Axis::name).collect::<Vec<_>>(),
                expected.iter().map(Axis::name).collect::<Vec<_>>(),
            )));
        }

        self.enter_context(&stamp.axes, span)?;
        let acc = self.em.ids.accumulator();
        self.em.emit(
            Instruction::effect(Op::DeclareAccumulator {
                acc,
                initial: reducer.identity,
            })
            .at(span),
        );

        let value = self.compile(arg)?;
        self.enter_context(&arg.axes, span)?;
        self.em.emit(
            Instruction::effect(Op::Accumulate {
                acc,
                function: reducer.step,
                value: Operand::Reg(value),
            })
            .at(span),
        );

        self.em.close_to(stamp.axes.len());
        Ok(self.em.define(stamp, Op::LoadAccumulator { acc }, span))
    }

    /// Emit a kernel call with the given operands
    fn kernel(&mut self, function: &str, args: Vec<Operand>, stamp: Stamp, span: Option<Span>) -> Register {
        let op = Op::KernelCall {
            function: function.to_string(),
            args,
        };
        self.em.define(stamp, op, span)
    }
}

fn select(cond: Register, on_true: Register, on_false: Register) -> Op {
    Op::Select {
        cond: Operand::Reg(cond),
        on_true: Operand::Reg(on_true),
        on_false: Operand::Reg(on_false),
    }
}

fn children(expr: &ScopedExpr) -> Vec<&ScopedExpr> {
    match &expr.kind {
        ExprKind::Literal { .. }
        | ExprKind::InputRef { .. }
        | ExprKind::DeclRef { .. }
        | ExprKind::IndexRef { .. } => Vec::new(),
        ExprKind::Call { args, .. } => args.iter().collect(),
        ExprKind::Reduce { arg, .. } => vec![&**arg],
        ExprKind::Select { cond, on_true, on_false } => vec![&**cond, &**on_true, &**on_false],
        ExprKind::Cascade { cases, default } => cases
            .iter()
            .flat_map(|c| [&c.when, &c.then])
            .chain(std::iter::once(&**default))
            .collect(),
        ExprKind::MakeTuple { elements } => elements.iter().collect(),
        ExprKind::MakeObject { fields } => fields.iter().map(|f| &f.value).collect(),
        ExprKind::TupleGet { tuple, .. } => vec![&**tuple],
        ExprKind::Shift { base, .. } => vec![&**base],
    }
}

/// Reductions anywhere under `expr` whose result axes are a strict prefix
/// of `axes`
fn collect_breaking_reductions<'e>(expr: &'e ScopedExpr, axes: &[Axis], found: &mut Vec<&'e ScopedExpr>) {
    if matches!(expr.kind, ExprKind::Reduce { .. })
        && expr.axes.len() < axes.len()
        && axes.starts_with(&expr.axes)
    {
        found.push(expr);
    }
    for child in children(expr) {
        collect_breaking_reductions(child, axes, found);
    }
}
