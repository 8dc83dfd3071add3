//! Loop fusion
//!
//! Two loops over the same collection register merge into one when only
//! accumulator declarations and accumulator reads separate them. The
//! declarations move ahead of the fused loop and the reads after it. The
//! second loop's element and index registers are renamed to the first's
//! and its body is appended.
//!
//! Fusion is refused when the second loop reads a value produced between
//! the two loops, reads an accumulator the first loop updates, or holds the
//! declaration's yield while reads would have to move after it.

use std::collections::{HashMap, HashSet};

use tracing::{debug, trace, warn};

use super::{OptimizationPass, Rewrite, rename_nodes, rewrite_each};
use crate::error::{CompileError, Result};
use crate::lir::{AccId, LirProgram, Loop, Node, Op, Register, walk_instructions};

/// Loop fusion pass
pub struct LoopFusion {
    max_iterations: usize,
}

impl LoopFusion {
    pub fn new(max_iterations: usize) -> Self {
        Self { max_iterations }
    }
}

/// What lies between a loop and a fusable successor
struct Gap {
    /// Accumulator declarations, moved ahead of the fused loop
    pre: Vec<Node>,
    /// Accumulator reads, moved after the fused loop
    post: Vec<Node>,
    /// Position of the successor loop
    next: usize,
}

/// Fuse adjacent loops in `nodes`, nested bodies included
fn fuse(nodes: Vec<Node>) -> Vec<Node> {
    let mut nodes: Vec<Node> = nodes
        .into_iter()
        .map(|node| match node {
            Node::Loop(lp) => Node::Loop(Loop {
                body: fuse(lp.body),
                ..lp
            }),
            inst => inst,
        })
        .collect();

    let mut i = 0;
    while i < nodes.len() {
        let Some(gap) = find_partner(&nodes, i) else {
            i += 1;
            continue;
        };
        let (Node::Loop(first), Node::Loop(second)) = (&nodes[i], &nodes[gap.next]) else {
            i += 1;
            continue;
        };
        trace!(first = %first.id, second = %second.id, "fusing");
        let fused = merge(first, second);

        let tail = nodes.split_off(gap.next + 1);
        nodes.truncate(i);
        nodes.extend(gap.pre);
        nodes.push(Node::Loop(fused));
        nodes.extend(gap.post);
        nodes.extend(tail);
        // stay at `i`: the fused loop may absorb its next neighbor too
    }
    nodes
}

/// Successor of the loop at `i` that it can fuse with
fn find_partner(nodes: &[Node], i: usize) -> Option<Gap> {
    let Node::Loop(first) = &nodes[i] else {
        return None;
    };
    let mut gap = Gap { pre: Vec::new(), post: Vec::new(), next: 0 };

    for (j, node) in nodes.iter().enumerate().skip(i + 1) {
        match node {
            Node::Inst(inst) => match inst.op {
                Op::DeclareAccumulator { .. } => gap.pre.push(node.clone()),
                Op::LoadAccumulator { .. } => gap.post.push(node.clone()),
                _ => return None,
            },
            Node::Loop(second) => {
                if second.collection != first.collection || second.axis != first.axis {
                    return None;
                }
                gap.next = j;
                return can_fuse(first, second, &gap).then_some(gap);
            }
        }
    }
    None
}

fn can_fuse(first: &Loop, second: &Loop, gap: &Gap) -> bool {
    let post_defined: HashSet<Register> = gap
        .post
        .iter()
        .filter_map(|n| n.as_inst().and_then(|i| i.result))
        .collect();
    let updated = updated_accumulators(&first.body);

    let mut reads_post = false;
    let mut reads_updated = false;
    let mut yields = false;
    walk_instructions(&second.body, &mut |inst| {
        inst.for_each_input(|r| reads_post |= post_defined.contains(&r));
        match &inst.op {
            Op::LoadAccumulator { acc } => reads_updated |= updated.contains(acc),
            Op::Yield { .. } => yields = true,
            _ => {}
        }
    });
    let mut nested_reads_post = false;
    crate::lir::walk_nodes(&second.body, &mut |node| {
        if let Node::Loop(lp) = node {
            nested_reads_post |= post_defined.contains(&lp.collection);
        }
    });

    !(reads_post || nested_reads_post || reads_updated || (yields && !gap.post.is_empty()))
}

fn updated_accumulators(body: &[Node]) -> HashSet<AccId> {
    let mut accs = HashSet::new();
    walk_instructions(body, &mut |inst| {
        if let Op::Accumulate { acc, .. } = &inst.op {
            accs.insert(*acc);
        }
    });
    accs
}

fn merge(first: &Loop, second: &Loop) -> Loop {
    let renames = HashMap::from([(second.element, first.element), (second.index, first.index)]);
    let mut appended = second.body.clone();
    rename_nodes(&mut appended, &renames);

    let mut body = first.body.clone();
    body.extend(appended);
    Loop {
        body: fuse(body),
        ..first.clone()
    }
}

impl OptimizationPass for LoopFusion {
    fn name(&self) -> &'static str {
        "loop_fusion"
    }

    fn run(&self, program: &LirProgram) -> Result<Rewrite> {
        let mut current = program.clone();
        let mut changed = false;
        for iteration in 0..=self.max_iterations {
            let step = rewrite_each(&current, |decl| Ok(fuse(decl.body.clone())))?;
            if !step.changed {
                debug!(iterations = iteration, "fusion settled");
                return Ok(Rewrite { program: current, changed });
            }
            changed = true;
            current = step.program;
        }
        warn!(cap = self.max_iterations, "loop fusion did not settle");
        Err(CompileError::non_convergence(
            "loop_fusion",
            self.max_iterations,
            "loops still merging",
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::super::testutil::*;
    use super::*;
    use crate::interp::{Value, evaluate};
    use crate::lir::verify_declaration;
    use crate::registry::FunctionRegistry;
    use serde_json::json;

    /// sum(items.price) + max(items.price), as lowering emits it
    fn sum_and_max() -> LirProgram {
        program(vec![decl(
            "d",
            vec![
                input(0, "items"),
                declare(1, 0),
                lp(2, "items", 0, 3, 4, vec![
                    field(5, 3, "price", &["items"]),
                    accumulate(1, "core.add", r(5)),
                ]),
                load_acc(6, 1),
                Node::Inst(crate::lir::Instruction::effect(Op::DeclareAccumulator {
                    acc: AccId(7),
                    initial: crate::lir::Literal::Nil,
                })),
                lp(8, "items", 0, 9, 10, vec![
                    field(11, 9, "price", &["items"]),
                    accumulate(7, "core.max", r(11)),
                ]),
                load_acc(12, 7),
                call(13, "core.add", vec![r(6), r(12)]),
                yield_of(13),
            ],
        )])
    }

    #[test]
    fn test_fuses_sum_and_max() {
        let prog = sum_and_max();
        let out = LoopFusion::new(8).run(&prog).unwrap();
        assert!(out.changed);
        let decl = &out.program.declarations[0];
        verify_declaration(decl).unwrap();

        let loops = decl.body.iter().filter(|n| matches!(n, Node::Loop(_))).count();
        assert_eq!(loops, 1);
        let Node::Loop(fused) = &decl.body[3] else {
            panic!("expected fused loop after both declarations");
        };
        assert_eq!(fused.body[2], field(11, 3, "price", &["items"]));

        let registry = FunctionRegistry::with_builtins();
        let input = json!({"items": [{"price": 10}, {"price": 30}, {"price": 20}]});
        let before = evaluate(&prog, &registry, &input).unwrap();
        let after = evaluate(&out.program, &registry, &input).unwrap();
        assert_eq!(before["d"], Value::Int(90));
        assert_eq!(before, after);
    }

    #[test]
    fn test_different_collections_stay_apart() {
        let prog = program(vec![decl(
            "d",
            vec![
                input(0, "items"),
                input(1, "other"),
                declare(2, 0),
                lp(3, "items", 0, 4, 5, vec![accumulate(2, "core.add", imm(1))]),
                lp(6, "items", 1, 7, 8, vec![accumulate(2, "core.add", imm(1))]),
                load_acc(9, 2),
                yield_of(9),
            ],
        )]);
        assert!(!LoopFusion::new(8).run(&prog).unwrap().changed);
    }

    #[test]
    fn test_dependent_loop_is_not_fused() {
        // second loop needs the finished sum of the first
        let prog = program(vec![decl(
            "d",
            vec![
                input(0, "items"),
                declare(1, 0),
                lp(2, "items", 0, 3, 4, vec![accumulate(1, "core.add", imm(1))]),
                load_acc(5, 1),
                declare(6, 0),
                lp(7, "items", 0, 8, 9, vec![accumulate(6, "core.add", r(5))]),
                load_acc(10, 6),
                yield_of(10),
            ],
        )]);
        assert!(!LoopFusion::new(8).run(&prog).unwrap().changed);
    }

    #[test]
    fn test_fuses_chain_of_three() {
        let prog = program(vec![decl_over(
            "d",
            &["items"],
            vec![
                input(0, "items"),
                declare(1, 0),
                lp(2, "items", 0, 3, 4, vec![accumulate(1, "core.add", imm(1))]),
                declare(5, 0),
                lp(6, "items", 0, 7, 8, vec![accumulate(5, "core.add", imm(2))]),
                lp(9, "items", 0, 10, 11, vec![field(12, 10, "v", &["items"]), yield_of(12)]),
            ],
        )]);
        let out = LoopFusion::new(8).run(&prog).unwrap();
        let decl = &out.program.declarations[0];
        let loops = decl.body.iter().filter(|n| matches!(n, Node::Loop(_))).count();
        assert_eq!(loops, 1);
        verify_declaration(decl).unwrap();
    }

    #[test]
    fn test_iteration_cap() {
        let err = LoopFusion::new(0).run(&sum_and_max()).unwrap_err();
        assert_eq!(err.class(), crate::error::ErrorClass::NonConvergence);
        assert!(LoopFusion::new(1).run(&sum_and_max()).unwrap().changed);
    }
}
