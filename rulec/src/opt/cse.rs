//! Common subexpression elimination
//!
//! Walks each declaration in order with a value table keyed by the
//! instruction's operation (after renaming its inputs) and result type. A
//! repeat is dropped and its register renamed to the first definition. The
//! table is scoped per loop body; renames live for the whole declaration.

use std::collections::HashMap;
use std::sync::Arc;

use super::{OptimizationPass, Rewrite, is_movable, rewrite_each};
use crate::error::Result;
use crate::lir::{
    DType, Instruction, LirDeclaration, LirProgram, Node, Op, Register, check_acyclic_renames,
    resolve_rename,
};
use crate::registry::FunctionRegistry;

/// Key under which a value is remembered
///
/// Calls are keyed without their result type: a pure function of equal
/// arguments yields the same value whatever stamp lowering attached.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ValueKey {
    op: Op,
    dtype: Option<DType>,
}

impl ValueKey {
    fn of(inst: &Instruction) -> Self {
        let dtype = match inst.op {
            Op::KernelCall { .. } => None,
            _ => inst.stamp.as_ref().map(|s| s.dtype.clone()),
        };
        Self { op: inst.op.clone(), dtype }
    }
}

/// Common subexpression elimination pass
pub struct CommonSubexpressionElimination {
    registry: Arc<FunctionRegistry>,
}

impl CommonSubexpressionElimination {
    pub fn new(registry: Arc<FunctionRegistry>) -> Self {
        Self { registry }
    }

    fn declaration(&self, decl: &LirDeclaration) -> Result<Vec<Node>> {
        let mut renames = HashMap::new();
        let mut table = HashMap::new();
        let body = self.nodes(&decl.body, &mut table, &mut renames);
        check_acyclic_renames(&decl.name, &renames)?;
        Ok(body)
    }

    fn nodes(
        &self,
        nodes: &[Node],
        table: &mut HashMap<ValueKey, Register>,
        renames: &mut HashMap<Register, Register>,
    ) -> Vec<Node> {
        let mut out = Vec::with_capacity(nodes.len());
        for node in nodes {
            match node {
                Node::Inst(inst) => {
                    let mut inst = inst.clone();
                    inst.rename_inputs(renames);
                    if let (Some(result), true) = (inst.result, is_movable(&inst, &self.registry)) {
                        let key = ValueKey::of(&inst);
                        if let Some(&first) = table.get(&key) {
                            renames.insert(result, first);
                            continue;
                        }
                        table.insert(key, result);
                    }
                    out.push(Node::Inst(inst));
                }
                Node::Loop(lp) => {
                    let mut lp = lp.clone();
                    lp.collection = resolve_rename(renames, lp.collection);
                    let mut scoped = table.clone();
                    lp.body = self.nodes(&lp.body, &mut scoped, renames);
                    out.push(Node::Loop(lp));
                }
            }
        }
        out
    }
}

impl OptimizationPass for CommonSubexpressionElimination {
    fn name(&self) -> &'static str {
        "common_subexpression_elimination"
    }

    fn run(&self, program: &LirProgram) -> Result<Rewrite> {
        rewrite_each(program, |decl| self.declaration(decl))
    }
}

#[cfg(test)]
mod tests {
    use super::super::testutil::*;
    use super::*;
    use crate::lir::{Literal, verify_declaration};

    fn pass() -> CommonSubexpressionElimination {
        CommonSubexpressionElimination::new(Arc::new(FunctionRegistry::with_builtins()))
    }

    #[test]
    fn test_dedups_load_input_and_renames_loop_collection() {
        let prog = program(vec![decl(
            "d",
            vec![
                input(0, "items"),
                input(1, "items"),
                declare(2, 0),
                lp(3, "items", 1, 4, 5, vec![accumulate(2, "core.add", r(5))]),
                load_acc(6, 2),
                yield_of(6),
            ],
        )]);
        let out = pass().run(&prog).unwrap();
        let body = &out.program.declarations[0].body;
        assert_eq!(body.len(), 5);
        let Node::Loop(lp) = &body[2] else {
            panic!("expected loop");
        };
        assert_eq!(lp.collection, Register(0));
        verify_declaration(&out.program.declarations[0]).unwrap();
    }

    #[test]
    fn test_dedups_calls_and_constants() {
        let prog = program(vec![decl(
            "d",
            vec![
                constant(0, 2),
                constant(1, 2),
                call(2, "core.mul", vec![r(0), r(0)]),
                call(3, "core.mul", vec![r(1), r(1)]),
                call(4, "core.add", vec![r(2), r(3)]),
                yield_of(4),
            ],
        )]);
        let out = pass().run(&prog).unwrap();
        let body = &out.program.declarations[0].body;
        assert_eq!(body.len(), 4);
        assert_eq!(body[2], call(4, "core.add", vec![r(2), r(2)]));
    }

    #[test]
    fn test_same_literal_different_type_is_kept() {
        let prog = program(vec![decl(
            "d",
            vec![
                constant(0, 1),
                Node::Inst(crate::lir::Instruction::define(
                    Register(1),
                    crate::lir::Stamp::scalar(DType::Float),
                    Op::Constant { value: Literal::Int(1) },
                )),
                call(2, "core.add", vec![r(0), r(1)]),
                yield_of(2),
            ],
        )]);
        assert!(!pass().run(&prog).unwrap().changed);
    }

    #[test]
    fn test_loop_scoped_values_do_not_leak() {
        let prog = program(vec![decl(
            "d",
            vec![
                input(0, "items"),
                declare(1, 0),
                lp(2, "items", 0, 3, 4, vec![
                    constant(5, 7),
                    accumulate(1, "core.add", r(5)),
                ]),
                constant(6, 7),
                load_acc(7, 1),
                call(8, "core.add", vec![r(6), r(7)]),
                yield_of(8),
            ],
        )]);
        let out = pass().run(&prog).unwrap();
        assert!(!out.changed);
        verify_declaration(&out.program.declarations[0]).unwrap();
    }

    #[test]
    fn test_impure_calls_are_kept() {
        let prog = program(vec![decl(
            "d",
            vec![
                call(0, "core.trace", vec![imm(1)]),
                call(1, "core.trace", vec![imm(1)]),
                call(2, "core.add", vec![r(0), r(1)]),
                yield_of(2),
            ],
        )]);
        assert!(!pass().run(&prog).unwrap().changed);
    }
}
