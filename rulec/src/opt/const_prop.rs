//! Constant propagation and folding
//!
//! Registers holding a literal are substituted into value operands as
//! immediates. A pure call whose arguments are all immediates is evaluated
//! with the registry's reference kernel and replaced by a `Constant` with
//! the same result register and stamp. A kernel that fails at compile time
//! is left in place so the failure surfaces at run time.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::trace;

use super::{OptimizationPass, Rewrite, rewrite_each};
use crate::error::Result;
use crate::interp::Value;
use crate::lir::{Instruction, Literal, Node, Op, Operand, Register};
use crate::registry::FunctionRegistry;

/// Constant propagation pass
pub struct ConstantPropagation {
    registry: Arc<FunctionRegistry>,
}

impl ConstantPropagation {
    pub fn new(registry: Arc<FunctionRegistry>) -> Self {
        Self { registry }
    }

    fn fold_nodes(&self, nodes: &[Node], known: &mut HashMap<Register, Literal>) -> Vec<Node> {
        nodes
            .iter()
            .map(|node| match node {
                Node::Inst(inst) => Node::Inst(self.fold_instruction(inst, known)),
                Node::Loop(lp) => {
                    let mut lp = lp.clone();
                    lp.body = self.fold_nodes(&lp.body, known);
                    Node::Loop(lp)
                }
            })
            .collect()
    }

    fn fold_instruction(&self, inst: &Instruction, known: &mut HashMap<Register, Literal>) -> Instruction {
        let mut inst = inst.clone();
        for operand in inst.value_operands_mut() {
            if let Operand::Reg(reg) = *operand {
                if let Some(value) = known.get(&reg) {
                    *operand = Operand::Imm(value.clone());
                }
            }
        }

        if let Some(value) = self.evaluate(&inst.op) {
            trace!(inst = %inst, folded = %value, "folded");
            inst.op = Op::Constant { value };
        }
        if let (Some(result), Op::Constant { value }) = (inst.result, &inst.op) {
            known.insert(result, value.clone());
        }
        inst
    }

    /// Compile-time value of `op`, when it has one
    fn evaluate(&self, op: &Op) -> Option<Literal> {
        match op {
            Op::KernelCall { function, args } => {
                let sig = self.registry.get(function)?;
                if !sig.is_pure() || sig.eval.is_none() {
                    return None;
                }
                let args = args
                    .iter()
                    .map(|a| match a {
                        Operand::Imm(lit) => Some(Value::from(lit)),
                        Operand::Reg(_) => None,
                    })
                    .collect::<Option<Vec<_>>>()?;
                self.registry.call(function, &args).ok()?.to_literal()
            }
            Op::Select { cond: Operand::Imm(cond), on_true, on_false } => {
                let chosen = if cond.as_bool()? { on_true } else { on_false };
                match chosen {
                    Operand::Imm(lit) => Some(lit.clone()),
                    Operand::Reg(_) => None,
                }
            }
            _ => None,
        }
    }
}

impl OptimizationPass for ConstantPropagation {
    fn name(&self) -> &'static str {
        "constant_propagation"
    }

    fn run(&self, program: &crate::lir::LirProgram) -> Result<Rewrite> {
        rewrite_each(program, |decl| Ok(self.fold_nodes(&decl.body, &mut HashMap::new())))
    }
}

#[cfg(test)]
mod tests {
    use super::super::testutil::*;
    use super::*;
    use crate::lir::LirProgram;

    fn pass() -> ConstantPropagation {
        ConstantPropagation::new(Arc::new(FunctionRegistry::with_builtins()))
    }

    fn body(program: &LirProgram) -> &[Node] {
        &program.declarations[0].body
    }

    #[test]
    fn test_folds_chain() {
        let prog = program(vec![decl(
            "z",
            vec![
                constant(0, 5),
                call(1, "core.add", vec![r(0), imm(1)]),
                call(2, "core.mul", vec![r(1), imm(2)]),
                yield_of(2),
            ],
        )]);
        let out = pass().run(&prog).unwrap();
        assert!(out.changed);
        assert_eq!(body(&out.program)[2], constant(2, 12));
    }

    #[test]
    fn test_substitutes_into_loop_body() {
        let prog = program(vec![decl(
            "total",
            vec![
                constant(0, 3),
                input(1, "items"),
                declare(2, 0),
                lp(3, "items", 1, 4, 5, vec![accumulate(2, "core.add", r(0))]),
                load_acc(6, 2),
                yield_of(6),
            ],
        )]);
        let out = pass().run(&prog).unwrap();
        let Node::Loop(lp) = &body(&out.program)[3] else {
            panic!("expected loop");
        };
        assert_eq!(lp.body[0], accumulate(2, "core.add", imm(3)));
    }

    #[test]
    fn test_keeps_impure_and_failing_calls() {
        let prog = program(vec![decl(
            "d",
            vec![
                call(0, "core.trace", vec![imm(1)]),
                call(1, "core.div", vec![imm(1), imm(0)]),
                call(2, "core.add", vec![r(0), r(1)]),
                yield_of(2),
            ],
        )]);
        let out = pass().run(&prog).unwrap();
        assert!(!out.changed);
    }

    #[test]
    fn test_overflowing_negation_is_not_folded() {
        let prog = program(vec![decl(
            "d",
            vec![call(0, "core.neg", vec![imm(i64::MIN)]), yield_of(0)],
        )]);
        let out = pass().run(&prog).unwrap();
        assert!(!out.changed);
    }

    #[test]
    fn test_folds_select_on_constant_condition() {
        let prog = program(vec![decl(
            "d",
            vec![
                int(0, Op::Constant { value: Literal::Bool(false) }),
                int(1, Op::Select { cond: r(0), on_true: imm(1), on_false: imm(2) }),
                yield_of(1),
            ],
        )]);
        let out = pass().run(&prog).unwrap();
        assert_eq!(body(&out.program)[1], constant(1, 2));
    }
}
