//! Instruction scheduling
//!
//! Reorders each body (loop bodies included) with a dependency-respecting
//! list scheduler. Among ready items the order of preference is:
//!
//! 1. instructions that do not depend on any loop of the body, and
//!    accumulator declarations
//! 2. loops, preferring one over the collection of the loop emitted last
//!    so that fusable loops end up adjacent
//! 3. instructions that depend on a loop
//! 4. the yield, or the item containing it
//!
//! Ties fall back to the original order.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use super::{OptimizationPass, Rewrite, has_side_effects, rewrite_each};
use crate::error::{CompileError, Result};
use crate::lir::{AccId, LirDeclaration, LirProgram, Loop, Node, Op, Register, defined_registers, walk_instructions};
use crate::registry::FunctionRegistry;

/// Instruction scheduling pass
pub struct InstructionScheduling {
    registry: Arc<FunctionRegistry>,
}

/// Register and accumulator traffic of one schedulable item
#[derive(Default)]
struct Footprint {
    defs: HashSet<Register>,
    uses: HashSet<Register>,
    writes: HashSet<AccId>,
    reads: HashSet<AccId>,
    effectful: bool,
    yields: bool,
}

impl Footprint {
    fn of(node: &Node, registry: &FunctionRegistry) -> Self {
        let mut fp = Footprint::default();
        let local = match node {
            Node::Loop(lp) => {
                let mut local = defined_registers(&lp.body);
                local.insert(lp.element);
                local.insert(lp.index);
                fp.uses.insert(lp.collection);
                local
            }
            Node::Inst(inst) => {
                fp.defs.extend(inst.result);
                HashSet::new()
            }
        };

        let body = std::slice::from_ref(node);
        walk_instructions(body, &mut |inst| {
            inst.for_each_input(|r| {
                if !local.contains(&r) {
                    fp.uses.insert(r);
                }
            });
            match &inst.op {
                Op::DeclareAccumulator { acc, .. } | Op::Accumulate { acc, .. } => {
                    fp.writes.insert(*acc);
                }
                Op::LoadAccumulator { acc } => {
                    fp.reads.insert(*acc);
                }
                Op::Yield { .. } => fp.yields = true,
                _ => {}
            }
            if matches!(inst.op, Op::KernelCall { .. }) && has_side_effects(inst, registry) {
                fp.effectful = true;
            }
        });
        fp
    }

    /// `self` must stay ahead of a later item `later`
    fn orders(&self, later: &Footprint) -> bool {
        !self.defs.is_disjoint(&later.uses)
            || !self.writes.is_disjoint(&later.reads)
            || !self.writes.is_disjoint(&later.writes)
            || !self.reads.is_disjoint(&later.writes)
            || (self.effectful && later.effectful)
    }
}

impl InstructionScheduling {
    pub fn new(registry: Arc<FunctionRegistry>) -> Self {
        Self { registry }
    }

    fn schedule(&self, decl: &LirDeclaration, nodes: &[Node]) -> Result<Vec<Node>> {
        let mut items = Vec::with_capacity(nodes.len());
        for node in nodes {
            items.push(match node {
                Node::Loop(lp) => Node::Loop(Loop {
                    body: self.schedule(decl, &lp.body)?,
                    ..lp.clone()
                }),
                inst => inst.clone(),
            });
        }

        let prints: Vec<Footprint> = items.iter().map(|n| Footprint::of(n, &self.registry)).collect();
        let n = items.len();
        let mut successors = vec![Vec::new(); n];
        let mut indegree = vec![0usize; n];
        for a in 0..n {
            for b in a + 1..n {
                if prints[a].orders(&prints[b]) {
                    successors[a].push(b);
                    indegree[b] += 1;
                }
            }
        }

        // an item depends on a loop if any loop reaches it
        let mut after_loop = vec![false; n];
        for a in 0..n {
            if matches!(items[a], Node::Loop(_)) || after_loop[a] {
                for &b in &successors[a] {
                    after_loop[b] = true;
                }
            }
        }

        let class = |i: usize| -> u8 {
            match &items[i] {
                _ if prints[i].yields => 3,
                Node::Loop(_) => 1,
                Node::Inst(inst) if matches!(inst.op, Op::DeclareAccumulator { .. }) => 0,
                Node::Inst(_) if after_loop[i] => 2,
                Node::Inst(_) => 0,
            }
        };

        let mut ready: BTreeSet<(u8, bool, usize)> = BTreeSet::new();
        let mut last_collection: Option<Register> = None;
        let key = |i: usize, last: Option<Register>| {
            let other_collection = match &items[i] {
                Node::Loop(lp) => Some(lp.collection) != last,
                Node::Inst(_) => false,
            };
            (class(i), other_collection, i)
        };
        for i in (0..n).filter(|&i| indegree[i] == 0) {
            ready.insert(key(i, last_collection));
        }

        let mut order = Vec::with_capacity(n);
        while let Some(entry) = ready.pop_first() {
            let i = entry.2;
            order.push(i);
            if let Node::Loop(lp) = &items[i] {
                if last_collection != Some(lp.collection) {
                    last_collection = Some(lp.collection);
                    // loop preference depends on the last loop: re-key
                    ready = ready.into_iter().map(|(_, _, j)| key(j, last_collection)).collect();
                }
            }
            for &b in &successors[i] {
                indegree[b] -= 1;
                if indegree[b] == 0 {
                    ready.insert(key(b, last_collection));
                }
            }
        }

        if order.len() != n {
            return Err(CompileError::consistency(
                &decl.name,
                "cyclic dependency between scheduled instructions",
            ));
        }

        let mut slots: Vec<Option<Node>> = items.into_iter().map(Some).collect();
        Ok(order.into_iter().filter_map(|i| slots[i].take()).collect())
    }
}

impl OptimizationPass for InstructionScheduling {
    fn name(&self) -> &'static str {
        "instruction_scheduling"
    }

    fn run(&self, program: &LirProgram) -> Result<Rewrite> {
        rewrite_each(program, |decl| self.schedule(decl, &decl.body))
    }
}

#[cfg(test)]
mod tests {
    use super::super::testutil::*;
    use super::*;
    use crate::interp::evaluate;
    use crate::lir::verify_declaration;
    use serde_json::json;

    fn pass() -> InstructionScheduling {
        InstructionScheduling::new(Arc::new(FunctionRegistry::with_builtins()))
    }

    #[test]
    fn test_groups_loops_over_same_collection() {
        let prog = program(vec![decl(
            "d",
            vec![
                input(0, "items"),
                input(1, "other"),
                declare(2, 0),
                lp(3, "items", 0, 4, 5, vec![accumulate(2, "core.add", imm(1))]),
                declare(6, 0),
                lp(7, "other", 1, 8, 9, vec![accumulate(6, "core.add", imm(1))]),
                declare(10, 0),
                lp(11, "items", 0, 12, 13, vec![accumulate(10, "core.add", imm(2))]),
                load_acc(14, 2),
                load_acc(15, 6),
                load_acc(16, 10),
                call(17, "core.add", vec![r(14), r(15)]),
                call(18, "core.add", vec![r(17), r(16)]),
                yield_of(18),
            ],
        )]);
        let out = pass().run(&prog).unwrap();
        let decl = &out.program.declarations[0];
        verify_declaration(decl).unwrap();

        let collections: Vec<Register> = decl
            .body
            .iter()
            .filter_map(|n| match n {
                Node::Loop(lp) => Some(lp.collection),
                _ => None,
            })
            .collect();
        assert_eq!(collections, vec![Register(0), Register(0), Register(1)]);
        assert_eq!(decl.body.last(), Some(&yield_of(18)));

        let registry = FunctionRegistry::with_builtins();
        let input = json!({"items": [1, 2], "other": [1, 2, 3]});
        assert_eq!(
            evaluate(&prog, &registry, &input).unwrap(),
            evaluate(&out.program, &registry, &input).unwrap()
        );
    }

    #[test]
    fn test_independent_work_moves_ahead_of_loops() {
        let prog = program(vec![decl(
            "d",
            vec![
                input(0, "items"),
                declare(1, 0),
                lp(2, "items", 0, 3, 4, vec![accumulate(1, "core.add", imm(1))]),
                load_acc(5, 1),
                constant(6, 10),
                call(7, "core.add", vec![r(5), r(6)]),
                yield_of(7),
            ],
        )]);
        let out = pass().run(&prog).unwrap();
        let body = &out.program.declarations[0].body;
        assert_eq!(body[2], constant(6, 10));
        verify_declaration(&out.program.declarations[0]).unwrap();
    }

    #[test]
    fn test_impure_calls_keep_their_order() {
        let prog = program(vec![decl(
            "d",
            vec![
                call(0, "core.trace", vec![imm(2)]),
                call(1, "core.trace", vec![imm(1)]),
                call(2, "core.add", vec![r(1), r(0)]),
                yield_of(2),
            ],
        )]);
        assert!(!pass().run(&prog).unwrap().changed);
    }
}
