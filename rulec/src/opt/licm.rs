//! Loop-invariant code motion
//!
//! Loops are processed inside-out. Within one loop, a top-level movable
//! instruction is invariant when none of its inputs is defined in the body
//! or bound by the loop; a declaration reference that ranges over the
//! loop's own axis is never invariant. Invariant instructions move, in
//! order, to just before the loop, where the enclosing loop gets its turn.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{trace, warn};

use super::{OptimizationPass, Rewrite, is_movable, rewrite_each};
use crate::error::{CompileError, Result};
use crate::lir::{Instruction, LirDeclaration, LirProgram, Loop, Node, Op, Register, defined_registers};
use crate::registry::FunctionRegistry;

/// Loop-invariant code motion pass
pub struct LoopInvariantCodeMotion {
    registry: Arc<FunctionRegistry>,
    max_iterations: usize,
}

impl LoopInvariantCodeMotion {
    pub fn new(registry: Arc<FunctionRegistry>, max_iterations: usize) -> Self {
        Self { registry, max_iterations }
    }

    fn nodes(&self, decl: &LirDeclaration, nodes: &[Node]) -> Result<Vec<Node>> {
        let mut out = Vec::with_capacity(nodes.len());
        for node in nodes {
            match node {
                Node::Inst(_) => out.push(node.clone()),
                Node::Loop(lp) => {
                    let (hoisted, lp) = self.hoist(decl, lp)?;
                    out.extend(hoisted);
                    out.push(Node::Loop(lp));
                }
            }
        }
        Ok(out)
    }

    /// Invariant instructions of `lp`, and the loop without them
    fn hoist(&self, decl: &LirDeclaration, lp: &Loop) -> Result<(Vec<Node>, Loop)> {
        let mut lp = Loop {
            body: self.nodes(decl, &lp.body)?,
            ..lp.clone()
        };
        let mut hoisted = Vec::new();
        let mut iterations = 0;

        loop {
            let mut variant: HashSet<Register> = defined_registers(&lp.body);
            variant.insert(lp.element);
            variant.insert(lp.index);

            let (moved, kept): (Vec<Node>, Vec<Node>) = lp.body.into_iter().partition(|node| {
                let Node::Inst(inst) = node else {
                    return false;
                };
                let invariant = self.is_invariant(inst, &lp.axis, &variant);
                if invariant {
                    if let Some(r) = inst.result {
                        variant.remove(&r);
                    }
                }
                invariant
            });
            lp.body = kept;
            if moved.is_empty() {
                break;
            }

            trace!(loop_id = %lp.id, count = moved.len(), "hoisted");
            hoisted.extend(moved);
            iterations += 1;
            if iterations > self.max_iterations {
                warn!(declaration = %decl.name, loop_id = %lp.id, "invariant motion did not settle");
                return Err(CompileError::non_convergence(
                    "loop_invariant_code_motion",
                    self.max_iterations,
                    format!("loop {} in `{}`", lp.id, decl.name),
                ));
            }
        }
        Ok((hoisted, lp))
    }

    fn is_invariant(&self, inst: &Instruction, axis: &crate::lir::Axis, variant: &HashSet<Register>) -> bool {
        if !is_movable(inst, &self.registry) {
            return false;
        }
        match &inst.op {
            Op::LoadDeclaration { axes, .. } if axes.contains(axis) => return false,
            // the loop may run zero times
            Op::KernelCall { function, .. } if self.registry.is_partial(function) => return false,
            _ => {}
        }
        let mut reads_variant = false;
        inst.for_each_input(|r| reads_variant |= variant.contains(&r));
        !reads_variant
    }
}

impl OptimizationPass for LoopInvariantCodeMotion {
    fn name(&self) -> &'static str {
        "loop_invariant_code_motion"
    }

    fn run(&self, program: &LirProgram) -> Result<Rewrite> {
        rewrite_each(program, |decl| self.nodes(decl, &decl.body))
    }
}

#[cfg(test)]
mod tests {
    use super::super::testutil::*;
    use super::*;
    use crate::interp::{Value, evaluate};
    use crate::lir::verify_declaration;
    use serde_json::json;

    fn pass() -> LoopInvariantCodeMotion {
        LoopInvariantCodeMotion::new(Arc::new(FunctionRegistry::with_builtins()), 64)
    }

    /// sum(items.price * (rate + 1)) with the rate arithmetic inside the loop
    fn scaled_sum() -> crate::lir::LirProgram {
        program(vec![decl(
            "total",
            vec![
                input(0, "items"),
                input(1, "rate"),
                declare(2, 0),
                lp(3, "items", 0, 4, 5, vec![
                    call(6, "core.add", vec![r(1), imm(1)]),
                    field(7, 4, "price", &["items"]),
                    call(8, "core.mul", vec![r(7), r(6)]),
                    accumulate(2, "core.add", r(8)),
                ]),
                load_acc(9, 2),
                yield_of(9),
            ],
        )])
    }

    #[test]
    fn test_hoists_invariant_call() {
        let prog = scaled_sum();
        let out = pass().run(&prog).unwrap();
        assert!(out.changed);
        let body = &out.program.declarations[0].body;
        assert_eq!(body[3], call(6, "core.add", vec![r(1), imm(1)]));
        let Node::Loop(lp) = &body[4] else {
            panic!("expected loop");
        };
        assert_eq!(lp.body.len(), 3);
        verify_declaration(&out.program.declarations[0]).unwrap();

        let registry = FunctionRegistry::with_builtins();
        let input = json!({"rate": 1, "items": [{"price": 10}, {"price": 20}]});
        let before = evaluate(&prog, &registry, &input).unwrap();
        let after = evaluate(&out.program, &registry, &input).unwrap();
        assert_eq!(before["total"], Value::Int(60));
        assert_eq!(before, after);
    }

    #[test]
    fn test_hoists_out_of_nested_loops() {
        let prog = program(vec![decl(
            "d",
            vec![
                input(0, "rows"),
                declare(1, 0),
                lp(2, "rows", 0, 3, 4, vec![
                    field(5, 3, "cols", &["rows"]),
                    lp(6, "cols", 5, 7, 8, vec![
                        constant(9, 3),
                        accumulate(1, "core.add", r(9)),
                    ]),
                ]),
                load_acc(10, 1),
                yield_of(10),
            ],
        )]);
        let out = pass().run(&prog).unwrap();
        let body = &out.program.declarations[0].body;
        assert_eq!(body[2], constant(9, 3));
        verify_declaration(&out.program.declarations[0]).unwrap();
    }

    #[test]
    fn test_reference_over_loop_axis_stays() {
        let prog = program(vec![decl(
            "d",
            vec![
                input(0, "items"),
                declare(1, 0),
                lp(2, "items", 0, 3, 4, vec![
                    load_decl(5, "prices", &["items"]),
                    load_decl(6, "rate", &[]),
                    call(7, "core.mul", vec![r(5), r(6)]),
                    accumulate(1, "core.add", r(7)),
                ]),
                load_acc(8, 1),
                yield_of(8),
            ],
        )]);
        let out = pass().run(&prog).unwrap();
        let body = &out.program.declarations[0].body;
        assert_eq!(body[2], load_decl(6, "rate", &[]));
        let Node::Loop(lp) = &body[3] else {
            panic!("expected loop");
        };
        assert_eq!(lp.body[0], load_decl(5, "prices", &["items"]));
    }

    #[test]
    fn test_accumulator_reads_stay() {
        let prog = program(vec![decl(
            "d",
            vec![
                input(0, "items"),
                declare(1, 0),
                lp(2, "items", 0, 3, 4, vec![accumulate(1, "core.add", imm(1))]),
                declare(5, 0),
                lp(6, "items", 0, 7, 8, vec![
                    load_acc(9, 1),
                    accumulate(5, "core.add", r(9)),
                ]),
                load_acc(10, 5),
                yield_of(10),
            ],
        )]);
        assert!(!pass().run(&prog).unwrap().changed);
    }

    #[test]
    fn test_partial_call_stays_in_loop() {
        let prog = program(vec![decl(
            "total",
            vec![
                input(0, "items"),
                input(1, "rate"),
                declare(2, 0),
                lp(3, "items", 0, 4, 5, vec![
                    field(6, 4, "price", &["items"]),
                    call(7, "core.div", vec![imm(100), r(1)]),
                    call(8, "core.mul", vec![r(6), r(7)]),
                    accumulate(2, "core.add", r(8)),
                ]),
                load_acc(9, 2),
                yield_of(9),
            ],
        )]);
        let out = pass().run(&prog).unwrap();
        assert!(!out.changed);

        let registry = FunctionRegistry::with_builtins();
        let empty = json!({"items": [], "rate": 0});
        assert_eq!(evaluate(&out.program, &registry, &empty).unwrap()["total"], Value::Int(0));
    }

    #[test]
    fn test_iteration_cap() {
        let strict = LoopInvariantCodeMotion::new(Arc::new(FunctionRegistry::with_builtins()), 0);
        let err = strict.run(&scaled_sum()).unwrap_err();
        assert_eq!(err.class(), crate::error::ErrorClass::NonConvergence);
    }
}
