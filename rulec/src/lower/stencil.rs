//! Stencil (shift) access
//!
//! A chain of shifts collapses to one offset per axis over a base input
//! reference. The neighbor is then gathered level by level: a shifted axis
//! indexes its collection at the adjusted position, and every level below a
//! shifted one is re-gathered from the shifted parent.

use indexmap::IndexMap;

use super::Lowerer;
use crate::error::Result;
use crate::lir::{Axis, DType, Literal, Op, Operand, Register, Stamp};
use crate::scope::{BoundaryPolicy, ExprKind, ScopedExpr};
use crate::span::Span;

pub(super) fn lower_shift(lw: &mut Lowerer<'_>, expr: &ScopedExpr) -> Result<Register> {
    let mut offsets: IndexMap<Axis, (i64, BoundaryPolicy)> = IndexMap::new();
    let mut node = expr;
    while let ExprKind::Shift { base, axis, offset, policy } = &node.kind {
        let entry = offsets.entry(axis.clone()).or_insert((0, *policy));
        entry.0 = entry
            .0
            .checked_add(*offset)
            .ok_or_else(|| lw.malformed(format!("shift offset along {axis} overflows")))?;
        node = base;
    }

    let ExprKind::InputRef { path } = &node.kind else {
        return Err(lw.malformed("shift must apply to an input reference"));
    };
    if node.axes != expr.axes {
        return Err(lw.malformed("shift base runs under different axes than the shift"));
    }
    if let Some(axis) = offsets.keys().find(|a| !expr.axes.contains(a)) {
        return Err(lw.malformed(format!("shift along {axis} outside its loop")));
    }

    let span = expr.span;
    let frames = lw.em.frames()[..expr.axes.len()].to_vec();
    let mut masks = Vec::new();
    let mut shifted: Option<Register> = None;

    for (level, frame) in frames.iter().enumerate() {
        let offset = offsets
            .get(&frame.axis)
            .copied()
            .filter(|(offset, _)| *offset != 0);
        if shifted.is_none() && offset.is_none() {
            continue;
        }

        let level_axes = expr.axes[..=level].to_vec();
        let collection = match shifted {
            None => frame.collection,
            Some(parent) => {
                let schema = lw.schema;
                let step = schema.step_for(lw.declaration, &frame.axis)?;
                let stamp = Stamp::new(DType::array_of(DType::Any), expr.axes[..level].to_vec());
                lw.load_path(Some(parent), &step.path, stamp, span)?
            }
        };

        let index = match offset {
            None => Operand::Reg(frame.index),
            Some((offset, policy)) => {
                let (index, mask) = adjusted_index(lw, frame.index, collection, offset, policy, &level_axes, span);
                masks.extend(mask);
                Operand::Reg(index)
            }
        };

        let element = lw.kernel(
            "core.at",
            vec![Operand::Reg(collection), index],
            Stamp::new(DType::Any, level_axes),
            span,
        );
        shifted = Some(element);
    }

    let stamp = Stamp::new(expr.dtype.clone(), expr.axes.clone());
    let element = match (shifted, frames.last()) {
        (Some(element), _) => element,
        (None, Some(frame)) => frame.element,
        (None, None) => return Err(lw.malformed("shift outside any loop")),
    };
    let value = if path.is_empty() {
        element
    } else {
        lw.load_path(Some(element), path, stamp.clone(), span)?
    };

    let Some(first) = masks.first().copied() else {
        return Ok(value);
    };
    let boolean = Stamp::new(DType::Boolean, expr.axes.clone());
    let in_bounds = masks[1..].iter().fold(first, |acc, mask| {
        lw.kernel("core.and", vec![Operand::Reg(acc), Operand::Reg(*mask)], boolean.clone(), span)
    });
    let op = Op::Select {
        cond: Operand::Reg(in_bounds),
        on_true: Operand::Reg(value),
        on_false: Operand::Imm(zero_of(&expr.dtype)),
    };
    Ok(lw.em.define(stamp, op, span))
}

/// Index of the neighbor under `policy`, plus the in-bounds mask for `Zero`
fn adjusted_index(
    lw: &mut Lowerer<'_>,
    index: Register,
    collection: Register,
    offset: i64,
    policy: BoundaryPolicy,
    axes: &[Axis],
    span: Option<Span>,
) -> (Register, Option<Register>) {
    let int = Stamp::new(DType::Integer, axes.to_vec());
    let reg = Operand::Reg;
    let imm = |n: i64| Operand::Imm(Literal::Int(n));

    let length = lw.kernel("core.length", vec![reg(collection)], int.clone(), span);
    let moved = lw.kernel("core.add", vec![reg(index), imm(offset)], int.clone(), span);

    match policy {
        BoundaryPolicy::Wrap => {
            let wrapped = lw.kernel("core.mod", vec![reg(moved), reg(length)], int, span);
            (wrapped, None)
        }
        BoundaryPolicy::Clamp => (clamp_index(lw, moved, length, &int, span), None),
        BoundaryPolicy::Zero => {
            let boolean = Stamp::new(DType::Boolean, axes.to_vec());
            let above = lw.kernel("core.ge", vec![reg(moved), imm(0)], boolean.clone(), span);
            let below = lw.kernel("core.lt", vec![reg(moved), reg(length)], boolean.clone(), span);
            let mask = lw.kernel("core.and", vec![reg(above), reg(below)], boolean, span);
            (clamp_index(lw, moved, length, &int, span), Some(mask))
        }
    }
}

fn clamp_index(lw: &mut Lowerer<'_>, moved: Register, length: Register, int: &Stamp, span: Option<Span>) -> Register {
    let last = lw.kernel(
        "core.sub",
        vec![Operand::Reg(length), Operand::Imm(Literal::Int(1))],
        int.clone(),
        span,
    );
    lw.kernel(
        "core.clamp",
        vec![Operand::Reg(moved), Operand::Imm(Literal::Int(0)), Operand::Reg(last)],
        int.clone(),
        span,
    )
}

fn zero_of(dtype: &DType) -> Literal {
    match dtype {
        DType::Integer => Literal::Int(0),
        DType::Float => Literal::Float(0.0),
        DType::Boolean => Literal::Bool(false),
        DType::String => Literal::Str(String::new()),
        _ => Literal::Nil,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lir::{Node, flatten, verify_declaration};
    use crate::lower::lower_declaration;
    use crate::config::PipelineConfig;
    use crate::interp::{Value, evaluate};
    use crate::registry::FunctionRegistry;
    use crate::scope::ScopedSchema;
    use serde_json::json;
    use std::sync::Arc;

    fn lower_shifted(expr: ScopedExpr) -> crate::lir::LirDeclaration {
        let schema = ScopedSchema::new()
            .plan("cells", &[("rows", &["rows"]), ("cols", &["cols"])])
            .declare("s", expr);
        let decl = schema.get("s").unwrap();
        lower_declaration(&schema, &FunctionRegistry::with_builtins(), decl).unwrap()
    }

    fn kernel_calls(decl: &crate::lir::LirDeclaration) -> Vec<String> {
        flatten(&decl.body)
            .into_iter()
            .filter_map(|i| match i.op {
                Op::KernelCall { function, .. } => Some(function),
                _ => None,
            })
            .collect()
    }

    /// `price` shifted along `items`, evaluated lowered and optimized
    fn shifted_prices(offset: i64, policy: BoundaryPolicy, prices: &[i64]) -> Value {
        let schema = ScopedSchema::new().plan("items", &[("items", &["items"])]).declare(
            "s",
            ScopedExpr::input(DType::Integer, &["items"], &["price"]).shift("items", offset, policy),
        );
        let registry = Arc::new(FunctionRegistry::with_builtins());
        let items: Vec<_> = prices.iter().map(|p| json!({"price": p})).collect();
        let input = json!({"items": items});

        let lowered = crate::lower::lower_schema(&schema, &registry).unwrap();
        let optimized = crate::compile(&schema, Arc::clone(&registry), &PipelineConfig::default())
            .unwrap()
            .program;
        let mut before = evaluate(&lowered, &registry, &input).unwrap();
        let mut after = evaluate(&optimized, &registry, &input).unwrap();
        let value = before.swap_remove("s").unwrap();
        assert_eq!(after.swap_remove("s").unwrap(), value);
        value
    }

    fn ints(values: &[i64]) -> Value {
        Value::Array(values.iter().map(|n| Value::Int(*n)).collect())
    }

    #[test]
    fn test_shift_wrap_values() {
        assert_eq!(shifted_prices(1, BoundaryPolicy::Wrap, &[10, 30, 20]), ints(&[30, 20, 10]));
        assert_eq!(shifted_prices(-1, BoundaryPolicy::Wrap, &[10, 30, 20]), ints(&[20, 10, 30]));
    }

    #[test]
    fn test_shift_zero_values() {
        assert_eq!(shifted_prices(-1, BoundaryPolicy::Zero, &[10, 30, 20]), ints(&[0, 10, 30]));
        assert_eq!(shifted_prices(5, BoundaryPolicy::Zero, &[10, 30, 20]), ints(&[0, 0, 0]));
    }

    #[test]
    fn test_shift_clamp_values() {
        assert_eq!(shifted_prices(2, BoundaryPolicy::Clamp, &[10, 30, 20]), ints(&[20, 20, 20]));
        assert_eq!(shifted_prices(-1, BoundaryPolicy::Clamp, &[10, 30, 20]), ints(&[10, 10, 30]));
    }

    #[test]
    fn test_shift_over_empty_collection() {
        for policy in [BoundaryPolicy::Wrap, BoundaryPolicy::Clamp, BoundaryPolicy::Zero] {
            assert_eq!(shifted_prices(1, policy, &[]), ints(&[]));
        }
    }

    #[test]
    fn test_shift_offset_overflow_is_malformed() {
        let expr = ScopedExpr::input(DType::Integer, &["rows", "cols"], &["v"])
            .shift("cols", i64::MAX, BoundaryPolicy::Clamp)
            .shift("cols", 1, BoundaryPolicy::Clamp);
        let schema = ScopedSchema::new()
            .plan("cells", &[("rows", &["rows"]), ("cols", &["cols"])])
            .declare("s", expr);
        let decl = schema.get("s").unwrap();
        let err = lower_declaration(&schema, &FunctionRegistry::with_builtins(), decl).unwrap_err();
        assert_eq!(err.class(), crate::error::ErrorClass::MalformedInput);
        assert!(err.to_string().contains("overflows"));
    }

    #[test]
    fn test_shift_chain_collapses() {
        let base = ScopedExpr::input(DType::Integer, &["rows", "cols"], &["v"]);
        let expr = base
            .shift("cols", 1, BoundaryPolicy::Clamp)
            .shift("cols", 1, BoundaryPolicy::Clamp);
        let decl = lower_shifted(expr);
        let adds: Vec<_> = flatten(&decl.body)
            .into_iter()
            .filter(|i| matches!(&i.op, Op::KernelCall { function, .. } if function == "core.add"))
            .collect();
        assert_eq!(adds.len(), 1);
        let Op::KernelCall { args, .. } = &adds[0].op else { unreachable!() };
        assert_eq!(args[1], Operand::Imm(Literal::Int(2)));
        verify_declaration(&decl).unwrap();
    }

    #[test]
    fn test_shift_outer_axis_regathers_inner() {
        let base = ScopedExpr::input(DType::Integer, &["rows", "cols"], &["v"]);
        let decl = lower_shifted(base.shift("rows", -1, BoundaryPolicy::Wrap));
        assert_eq!(
            kernel_calls(&decl),
            vec!["core.length", "core.add", "core.mod", "core.at", "core.at"]
        );
        verify_declaration(&decl).unwrap();
    }

    #[test]
    fn test_shift_zero_policy_masks() {
        let base = ScopedExpr::input(DType::Integer, &["rows", "cols"], &["v"]);
        let decl = lower_shifted(base.shift("cols", 1, BoundaryPolicy::Zero));
        let mut last_select = None;
        crate::lir::walk_nodes(&decl.body, &mut |n| {
            if let Node::Inst(inst) = n {
                if let Op::Select { on_false, .. } = &inst.op {
                    last_select = Some(on_false.clone());
                }
            }
        });
        assert_eq!(last_select, Some(Operand::Imm(Literal::Int(0))));
        verify_declaration(&decl).unwrap();
    }

    #[test]
    fn test_shift_zero_offset_is_plain_load() {
        let base = ScopedExpr::input(DType::Integer, &["rows", "cols"], &["v"]);
        let decl = lower_shifted(base.shift("cols", 1, BoundaryPolicy::Wrap).shift("cols", -1, BoundaryPolicy::Wrap));
        assert!(kernel_calls(&decl).is_empty());
    }

    #[test]
    fn test_shift_requires_input_base() {
        let schema = ScopedSchema::new()
            .plan("cells", &[("rows", &["rows"])])
            .declare(
                "s",
                ScopedExpr::index(&["rows"], "rows").shift("rows", 1, BoundaryPolicy::Wrap),
            );
        let decl = schema.get("s").unwrap();
        assert!(lower_declaration(&schema, &FunctionRegistry::with_builtins(), decl).is_err());
    }
}
