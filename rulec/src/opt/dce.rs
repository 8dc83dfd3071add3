//! Dead code elimination
//!
//! A single backward sweep with a live set. An instruction survives if it
//! has side effects or its result is live. Loops always survive; their
//! collection becomes live and their element/index registers stop being
//! live once the body has been swept.

use std::collections::HashSet;
use std::sync::Arc;

use super::{OptimizationPass, Rewrite, has_side_effects, rewrite_each};
use crate::error::Result;
use crate::lir::{LirProgram, Node, Register};
use crate::registry::FunctionRegistry;

/// Dead code elimination pass
pub struct DeadCodeElimination {
    registry: Arc<FunctionRegistry>,
}

impl DeadCodeElimination {
    pub fn new(registry: Arc<FunctionRegistry>) -> Self {
        Self { registry }
    }

    fn sweep(&self, nodes: &[Node], live: &mut HashSet<Register>) -> Vec<Node> {
        let mut kept = Vec::with_capacity(nodes.len());
        for node in nodes.iter().rev() {
            match node {
                Node::Inst(inst) => {
                    let used = inst.result.is_some_and(|r| live.contains(&r));
                    if used || has_side_effects(inst, &self.registry) {
                        inst.for_each_input(|r| {
                            live.insert(r);
                        });
                        kept.push(node.clone());
                    }
                }
                Node::Loop(lp) => {
                    let mut lp = lp.clone();
                    lp.body = self.sweep(&lp.body, live);
                    live.remove(&lp.element);
                    live.remove(&lp.index);
                    live.insert(lp.collection);
                    kept.push(Node::Loop(lp));
                }
            }
        }
        kept.reverse();
        kept
    }
}

impl OptimizationPass for DeadCodeElimination {
    fn name(&self) -> &'static str {
        "dead_code_elimination"
    }

    fn run(&self, program: &LirProgram) -> Result<Rewrite> {
        rewrite_each(program, |decl| Ok(self.sweep(&decl.body, &mut HashSet::new())))
    }
}
