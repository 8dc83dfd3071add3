//! Scalar reference hoisting
//!
//! A reference to a declaration without axes reads the same value in every
//! iteration, whatever else the loop body does. Each iteration lifts such
//! references one loop level; the pass repeats until nothing moves.

use tracing::{debug, warn};

use super::{OptimizationPass, Rewrite, rewrite_each};
use crate::error::{CompileError, Result};
use crate::lir::{Instruction, LirProgram, Loop, Node, Op};

/// Scalar reference hoisting pass
pub struct ScalarReferenceHoisting {
    max_iterations: usize,
}

impl ScalarReferenceHoisting {
    pub fn new(max_iterations: usize) -> Self {
        Self { max_iterations }
    }
}

fn is_scalar_reference(node: &Node) -> bool {
    matches!(
        node,
        Node::Inst(Instruction { op: Op::LoadDeclaration { axes, .. }, result: Some(_), .. }) if axes.is_empty()
    )
}

/// Lift every scalar reference one level
fn lift_once(nodes: &[Node]) -> Vec<Node> {
    let mut out = Vec::with_capacity(nodes.len());
    for node in nodes {
        match node {
            Node::Inst(_) => out.push(node.clone()),
            Node::Loop(lp) => {
                let (lifted, rest): (Vec<Node>, Vec<Node>) =
                    lp.body.iter().cloned().partition(is_scalar_reference);
                out.extend(lifted);
                out.push(Node::Loop(Loop {
                    body: lift_once(&rest),
                    ..lp.clone()
                }));
            }
        }
    }
    out
}

impl OptimizationPass for ScalarReferenceHoisting {
    fn name(&self) -> &'static str {
        "scalar_reference_hoisting"
    }

    fn run(&self, program: &LirProgram) -> Result<Rewrite> {
        let mut current = program.clone();
        let mut changed = false;
        for iteration in 0..=self.max_iterations {
            let step = rewrite_each(&current, |decl| Ok(lift_once(&decl.body)))?;
            if !step.changed {
                debug!(iterations = iteration, "scalar references settled");
                return Ok(Rewrite { program: current, changed });
            }
            changed = true;
            current = step.program;
        }
        warn!(cap = self.max_iterations, "scalar references did not settle");
        Err(CompileError::non_convergence(
            "scalar_reference_hoisting",
            self.max_iterations,
            "references still moving",
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::super::testutil::*;
    use super::*;
    use crate::lir::verify_declaration;

    fn nested() -> LirProgram {
        program(vec![decl(
            "d",
            vec![
                input(0, "rows"),
                declare(1, 0),
                lp(2, "rows", 0, 3, 4, vec![
                    field(5, 3, "cols", &["rows"]),
                    lp(6, "cols", 5, 7, 8, vec![
                        load_decl(9, "rate", &[]),
                        field(10, 7, "v", &["rows", "cols"]),
                        call(11, "core.mul", vec![r(10), r(9)]),
                        accumulate(1, "core.add", r(11)),
                    ]),
                ]),
                load_acc(12, 1),
                yield_of(12),
            ],
        )])
    }

    #[test]
    fn test_lifts_to_top_level() {
        let out = ScalarReferenceHoisting::new(8).run(&nested()).unwrap();
        assert!(out.changed);
        let body = &out.program.declarations[0].body;
        assert_eq!(body[2], load_decl(9, "rate", &[]));
        verify_declaration(&out.program.declarations[0]).unwrap();
    }

    #[test]
    fn test_vectorized_reference_stays() {
        let prog = program(vec![decl(
            "d",
            vec![
                input(0, "items"),
                declare(1, 0),
                lp(2, "items", 0, 3, 4, vec![
                    load_decl(5, "prices", &["items"]),
                    accumulate(1, "core.add", r(5)),
                ]),
                load_acc(6, 1),
                yield_of(6),
            ],
        )]);
        assert!(!ScalarReferenceHoisting::new(8).run(&prog).unwrap().changed);
    }

    #[test]
    fn test_iteration_cap() {
        let err = ScalarReferenceHoisting::new(1).run(&nested()).unwrap_err();
        assert_eq!(err.class(), crate::error::ErrorClass::NonConvergence);
    }

    #[test]
    fn test_settles_at_exact_cap() {
        // two lifts, then an unchanged check
        let out = ScalarReferenceHoisting::new(2).run(&nested()).unwrap();
        assert!(out.changed);
        assert_eq!(out.program.declarations[0].body[2], load_decl(9, "rate", &[]));
    }
}
