//! Cross-declaration inlining
//!
//! A `LoadDeclaration` is replaced by the callee's body when the callee's
//! gamma axes are a prefix of the loop frames open at the reference:
//!
//! - equal axes: the body is spliced at the reference, and references
//!   inside the spliced code are expanded right away
//! - strict prefix of length k: the body is placed ahead of the loop that
//!   opens frame k, so it runs once per matching outer iteration
//! - anything else: the reference stays opaque
//!
//! A callee whose non-gamma loops read references over their own frames
//! also stays opaque unless it splices at the depth it was lowered at.
//!
//! The callee's gamma loops are dissolved into the caller's frames: their
//! element and index registers map onto the caller's, every other register,
//! loop and accumulator is minted fresh. The reference's result register is
//! renamed to the callee's yielded value for the rest of the caller.
//!
//! Each iteration reads callees from the previous iteration's program; the
//! pass stops once no declaration changes.

use std::collections::{HashMap, HashSet};

use tracing::{debug, trace, warn};

use super::{OptimizationPass, Rewrite};
use crate::error::{CompileError, Result};
use crate::lir::{
    AccId, Axis, IdGenerator, LirDeclaration, LirProgram, Loop, LoopId, Node, Op, Register,
    instruction_count, resolve_rename, walk_instructions, walk_nodes,
};

/// Cross-declaration inlining pass
pub struct CrossDeclarationInlining {
    max_iterations: usize,
    max_callee_nodes: usize,
}

impl CrossDeclarationInlining {
    pub fn new(max_iterations: usize, max_callee_nodes: usize) -> Self {
        Self {
            max_iterations,
            max_callee_nodes,
        }
    }
}

impl OptimizationPass for CrossDeclarationInlining {
    fn name(&self) -> &'static str {
        "cross_declaration_inlining"
    }

    fn run(&self, program: &LirProgram) -> Result<Rewrite> {
        let mut current = program.clone();
        let mut changed = false;
        let mut changing = Vec::new();

        for iteration in 0..=self.max_iterations {
            changing.clear();
            let mut next = LirProgram::new();
            for decl in current.declarations.values() {
                let body = Inliner::new(self, &current, decl).run()?;
                if body != decl.body {
                    changing.push(decl.name.clone());
                }
                next.insert(LirDeclaration { body, ..decl.clone() });
            }
            if changing.is_empty() {
                debug!(iterations = iteration, "inlining settled");
                return Ok(Rewrite { program: current, changed });
            }
            trace!(iteration, declarations = ?changing, "inlined");
            changed = true;
            current = next;
        }

        warn!(declarations = ?changing, "inlining did not settle");
        Err(CompileError::non_convergence(
            "cross_declaration_inlining",
            self.max_iterations,
            format!("still changing: {}", changing.join(", ")),
        ))
    }
}

/// Loop frame open at the current position of the caller
struct OpenFrame {
    axis: Axis,
    element: Register,
    index: Register,
}

struct Inliner<'a> {
    pass: &'a CrossDeclarationInlining,
    snapshot: &'a LirProgram,
    caller: &'a LirDeclaration,
    ids: IdGenerator,
    frames: Vec<OpenFrame>,
    /// Code waiting to be placed ahead of the loop that opens frame k
    pending: Vec<Vec<Node>>,
    renames: HashMap<Register, Register>,
    /// Callees whose spliced bodies are being walked
    expanding: Vec<String>,
}

impl<'a> Inliner<'a> {
    fn new(pass: &'a CrossDeclarationInlining, snapshot: &'a LirProgram, caller: &'a LirDeclaration) -> Self {
        Self {
            pass,
            snapshot,
            caller,
            ids: IdGenerator::after(&caller.body),
            frames: Vec::new(),
            pending: Vec::new(),
            renames: HashMap::new(),
            expanding: Vec::new(),
        }
    }

    fn run(mut self) -> Result<Vec<Node>> {
        let caller = self.caller;
        let body = self.body(&caller.body)?;
        crate::lir::check_acyclic_renames(&caller.name, &self.renames)?;
        Ok(body)
    }

    fn body(&mut self, nodes: &[Node]) -> Result<Vec<Node>> {
        let mut out = Vec::with_capacity(nodes.len());
        for node in nodes {
            match node {
                Node::Inst(inst) => {
                    let mut inst = inst.clone();
                    inst.rename_inputs(&self.renames);
                    if let (Op::LoadDeclaration { name, .. }, Some(result)) = (&inst.op, inst.result) {
                        if let Some(expansion) = self.expand(name, result)? {
                            out.extend(expansion);
                            continue;
                        }
                    }
                    out.push(Node::Inst(inst));
                }
                Node::Loop(lp) => {
                    let depth = self.frames.len();
                    if self.pending.len() <= depth {
                        self.pending.resize_with(depth + 1, Vec::new);
                    }
                    self.frames.push(OpenFrame {
                        axis: lp.axis.clone(),
                        element: lp.element,
                        index: lp.index,
                    });
                    let body = self.body(&lp.body);
                    self.frames.pop();
                    let body = body?;

                    out.append(&mut self.pending[depth]);
                    out.push(Node::Loop(Loop {
                        collection: resolve_rename(&self.renames, lp.collection),
                        body,
                        ..lp.clone()
                    }));
                }
            }
        }
        Ok(out)
    }

    /// Inline the reference to `name` defining `result`
    ///
    /// Returns the code replacing the reference, or `None` when the
    /// reference stays opaque.
    fn expand(&mut self, name: &str, result: Register) -> Result<Option<Vec<Node>>> {
        let (snapshot, caller_decl) = (self.snapshot, self.caller);
        let caller = caller_decl.name.as_str();
        let callee = snapshot.get(name).ok_or_else(|| {
            CompileError::malformed(caller, format!("reference to unknown declaration `{name}`"))
        })?;
        if name == caller
            || self.expanding.iter().any(|n| n == name)
            || reaches(snapshot, name, caller)
            || instruction_count(&callee.body) > self.pass.max_callee_nodes
        {
            return Ok(None);
        }
        let gamma = callee
            .gamma()
            .ok_or_else(|| CompileError::malformed(name, "declaration has no yield"))?;

        let k = gamma.frames.len();
        let open = self.frames.len();
        if k > open || gamma.frames.iter().zip(&self.frames).any(|(g, f)| g.axis != f.axis) {
            return Ok(None);
        }
        if displaced_reference(&callee.body, 0, k) {
            trace!(caller = %caller, callee = name, depth = k, "callee loop reads a reference over its own frames");
            return Ok(None);
        }

        let mut seed = HashMap::new();
        for (g, f) in gamma.frames.iter().zip(&self.frames) {
            seed.insert(g.element, f.element);
            seed.insert(g.index, f.index);
        }
        let allowed: HashSet<Register> = seed.values().copied().collect();
        let code = dissolve_gamma(&callee.body, k);
        let (code, map) = freshen(&code, seed, &mut self.ids);
        let value = map.get(&gamma.value).copied().unwrap_or(gamma.value);
        self.check_placement(name, &code, allowed, value)?;

        trace!(caller = %caller, callee = name, depth = k, open, "inlining");
        self.renames.insert(result, value);

        if k == open {
            self.expanding.push(name.to_string());
            let spliced = self.body(&code);
            self.expanding.pop();
            Ok(Some(spliced?))
        } else {
            self.pending[k].extend(code);
            Ok(Some(Vec::new()))
        }
    }

    /// Every register the inlined code reads must be defined by that code
    /// or bound by a frame open at its placement
    fn check_placement(
        &self,
        callee: &str,
        code: &[Node],
        mut defined: HashSet<Register>,
        value: Register,
    ) -> Result<()> {
        let mut stray = None;
        walk_nodes(code, &mut |node| match node {
            Node::Inst(inst) => {
                inst.for_each_input(|r| {
                    if stray.is_none() && !defined.contains(&r) {
                        stray = Some(r);
                    }
                });
                if let Some(r) = inst.result {
                    defined.insert(r);
                }
            }
            Node::Loop(lp) => {
                if stray.is_none() && !defined.contains(&lp.collection) {
                    stray = Some(lp.collection);
                }
                defined.insert(lp.element);
                defined.insert(lp.index);
            }
        });

        let stray = stray.or((!defined.contains(&value)).then_some(value));
        match stray {
            Some(reg) => Err(CompileError::consistency_at(
                &self.caller.name,
                format!("code inlined from `{callee}` reads {reg}, which is not available at its placement"),
                reg,
            )),
            None => Ok(()),
        }
    }
}

/// Whether `from` refers to `target`, directly or through other declarations
fn reaches(program: &LirProgram, from: &str, target: &str) -> bool {
    let mut stack = vec![from.to_string()];
    let mut seen = HashSet::new();
    while let Some(name) = stack.pop() {
        if !seen.insert(name.clone()) {
            continue;
        }
        let Some(decl) = program.get(&name) else {
            continue;
        };
        let mut found = false;
        walk_instructions(&decl.body, &mut |inst| {
            if let Op::LoadDeclaration { name: referenced, .. } = &inst.op {
                found |= referenced == target;
                stack.push(referenced.clone());
            }
        });
        if found {
            return true;
        }
    }
    false
}

/// Body with its first `depth` yield-enclosing loops unwrapped and the
/// yield dropped
fn dissolve_gamma(nodes: &[Node], depth: usize) -> Vec<Node> {
    let mut out = Vec::new();
    for node in nodes {
        match node {
            Node::Inst(inst) if matches!(inst.op, Op::Yield { .. }) => {}
            Node::Loop(lp) if depth > 0 && contains_yield(&lp.body) => {
                out.extend(dissolve_gamma(&lp.body, depth - 1));
            }
            other => out.push(other.clone()),
        }
    }
    out
}

/// Whether a callee loop outside the gamma nest reads a reference bound
/// to its own frames
///
/// Dissolving moves such a loop from callee depth `level` to caller depth
/// `k`, so the reference would bind to the caller's frames instead.
fn displaced_reference(nodes: &[Node], level: usize, k: usize) -> bool {
    if level == k {
        return false;
    }
    nodes.iter().any(|node| match node {
        Node::Loop(lp) if contains_yield(&lp.body) => displaced_reference(&lp.body, level + 1, k),
        Node::Loop(lp) => {
            let mut found = false;
            walk_instructions(&lp.body, &mut |inst| {
                if let Op::LoadDeclaration { axes, .. } = &inst.op {
                    found |= axes.len() > level;
                }
            });
            found
        }
        Node::Inst(_) => false,
    })
}

fn contains_yield(nodes: &[Node]) -> bool {
    let mut found = false;
    walk_instructions(nodes, &mut |inst| found |= matches!(inst.op, Op::Yield { .. }));
    found
}

/// Copy of `nodes` with fresh registers, loops and accumulators
///
/// `seed` pre-assigns registers; the returned map covers every register
/// defined in `nodes` plus the seed.
fn freshen(
    nodes: &[Node],
    seed: HashMap<Register, Register>,
    ids: &mut IdGenerator,
) -> (Vec<Node>, HashMap<Register, Register>) {
    let mut regs = seed;
    let mut loops: HashMap<LoopId, LoopId> = HashMap::new();
    let mut accs: HashMap<AccId, AccId> = HashMap::new();

    walk_nodes(nodes, &mut |node| match node {
        Node::Inst(inst) => {
            if let Some(r) = inst.result {
                regs.entry(r).or_insert_with(|| ids.register());
            }
            if let Some(acc) = inst.op.accumulator() {
                accs.entry(acc).or_insert_with(|| ids.accumulator());
            }
        }
        Node::Loop(lp) => {
            loops.entry(lp.id).or_insert_with(|| ids.loop_id());
            regs.entry(lp.element).or_insert_with(|| ids.register());
            regs.entry(lp.index).or_insert_with(|| ids.register());
        }
    });

    let code = rewrite_ids(nodes, &regs, &loops, &accs);
    (code, regs)
}

fn rewrite_ids(
    nodes: &[Node],
    regs: &HashMap<Register, Register>,
    loops: &HashMap<LoopId, LoopId>,
    accs: &HashMap<AccId, AccId>,
) -> Vec<Node> {
    let reg = |r: Register| regs.get(&r).copied().unwrap_or(r);
    nodes
        .iter()
        .map(|node| match node {
            Node::Inst(inst) => {
                let mut inst = inst.clone();
                inst.result = inst.result.map(reg);
                inst.map_inputs(reg);
                match &mut inst.op {
                    Op::DeclareAccumulator { acc, .. }
                    | Op::Accumulate { acc, .. }
                    | Op::LoadAccumulator { acc } => {
                        if let Some(fresh) = accs.get(acc) {
                            *acc = *fresh;
                        }
                    }
                    _ => {}
                }
                Node::Inst(inst)
            }
            Node::Loop(lp) => Node::Loop(Loop {
                id: loops.get(&lp.id).copied().unwrap_or(lp.id),
                axis: lp.axis.clone(),
                collection: reg(lp.collection),
                element: reg(lp.element),
                index: reg(lp.index),
                body: rewrite_ids(&lp.body, regs, loops, accs),
                span: lp.span,
            }),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::super::testutil::*;
    use super::*;
    use crate::error::ErrorClass;
    use crate::interp::{Value, evaluate};
    use crate::lir::{verify_program, walk_instructions};
    use crate::registry::FunctionRegistry;
    use serde_json::json;

    fn pass() -> CrossDeclarationInlining {
        CrossDeclarationInlining::new(16, 256)
    }

    fn references(decl: &LirDeclaration) -> usize {
        let mut n = 0;
        walk_instructions(&decl.body, &mut |inst| {
            if matches!(inst.op, Op::LoadDeclaration { .. }) {
                n += 1;
            }
        });
        n
    }

    fn same_results(before: &LirProgram, after: &LirProgram, input: serde_json::Value) {
        let registry = FunctionRegistry::with_builtins();
        let a = evaluate(before, &registry, &input).unwrap();
        let b = evaluate(after, &registry, &input).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_splices_scalar_chain() {
        let prog = program(vec![
            decl("x", vec![constant(0, 5), yield_of(0)]),
            decl("y", vec![load_decl(0, "x", &[]), call(1, "core.add", vec![r(0), imm(1)]), yield_of(1)]),
            decl("z", vec![load_decl(0, "y", &[]), call(1, "core.mul", vec![r(0), imm(2)]), yield_of(1)]),
        ]);
        let out = pass().run(&prog).unwrap();
        assert!(out.changed);
        verify_program(&out.program).unwrap();
        assert_eq!(references(&out.program.declarations["z"]), 0);
        same_results(&prog, &out.program, json!({}));
    }

    #[test]
    fn test_prefix_callee_hoists_ahead_of_inner_loop() {
        let regional = decl_over(
            "regional",
            &["region"],
            vec![
                input(0, "regions"),
                lp(1, "region", 0, 2, 3, vec![field(4, 2, "rate", &["region"]), yield_of(4)]),
            ],
        );
        let cost = decl_over(
            "office_cost",
            &["region", "office"],
            vec![
                input(0, "regions"),
                lp(1, "region", 0, 2, 3, vec![
                    field(4, 2, "offices", &["region"]),
                    lp(5, "office", 4, 6, 7, vec![
                        load_decl(8, "regional", &["region"]),
                        field(9, 6, "cost", &["region", "office"]),
                        call(10, "core.mul", vec![r(9), r(8)]),
                        yield_of(10),
                    ]),
                ]),
            ],
        );
        let prog = program(vec![regional, cost]);
        let out = pass().run(&prog).unwrap();
        verify_program(&out.program).unwrap();

        let decl = &out.program.declarations["office_cost"];
        assert_eq!(references(decl), 0);
        let Node::Loop(region) = &decl.body[1] else {
            panic!("expected region loop");
        };
        let Node::Loop(office) = region.body.last().unwrap() else {
            panic!("expected office loop last");
        };
        assert_eq!(office.body.len(), 3);

        let input = json!({"regions": [
            {"rate": 2, "offices": [{"cost": 3}, {"cost": 4}]},
            {"rate": 10, "offices": [{"cost": 1}]},
        ]});
        same_results(&prog, &out.program, input.clone());
        let results = evaluate(&out.program, &FunctionRegistry::with_builtins(), &input).unwrap();
        assert_eq!(
            results["office_cost"],
            Value::Array(vec![
                Value::Array(vec![Value::Int(6), Value::Int(8)]),
                Value::Array(vec![Value::Int(10)]),
            ])
        );
    }

    #[test]
    fn test_vectorized_callee_outside_its_loop_stays_opaque() {
        let prices = decl_over(
            "prices",
            &["items"],
            vec![
                input(0, "items"),
                lp(1, "items", 0, 2, 3, vec![field(4, 2, "price", &["items"]), yield_of(4)]),
            ],
        );
        let first = decl("first", vec![load_decl(0, "prices", &["items"]), yield_of(0)]);
        let prog = program(vec![prices, first]);
        assert!(!pass().run(&prog).unwrap().changed);
    }

    /// `z = max over items of (price - sum(doubled))`, with `doubled` read
    /// inside a reduction loop that lives at the top level of `rel`
    fn nested_reduction() -> LirProgram {
        let doubled = decl_over(
            "doubled",
            &["items"],
            vec![
                input(0, "items"),
                lp(1, "items", 0, 2, 3, vec![
                    field(4, 2, "price", &["items"]),
                    call(5, "core.mul", vec![r(4), imm(2)]),
                    yield_of(5),
                ]),
            ],
        );
        let rel = decl_over(
            "rel",
            &["items"],
            vec![
                input(0, "items"),
                declare(1, 0),
                lp(2, "items", 0, 3, 4, vec![
                    load_decl(5, "doubled", &["items"]),
                    accumulate(1, "core.add", r(5)),
                ]),
                load_acc(6, 1),
                lp(7, "items", 0, 8, 9, vec![
                    field(10, 8, "price", &["items"]),
                    call(11, "core.sub", vec![r(10), r(6)]),
                    yield_of(11),
                ]),
            ],
        );
        let z = decl(
            "z",
            vec![
                input(0, "items"),
                Node::Inst(crate::lir::Instruction::effect(Op::DeclareAccumulator {
                    acc: crate::lir::AccId(1),
                    initial: crate::lir::Literal::Nil,
                })),
                lp(2, "items", 0, 3, 4, vec![
                    load_decl(5, "rel", &["items"]),
                    accumulate(1, "core.max", r(5)),
                ]),
                load_acc(6, 1),
                yield_of(6),
            ],
        );
        program(vec![doubled, rel, z])
    }

    #[test]
    fn test_nested_reduction_keeps_its_own_frame() {
        let prog = nested_reduction();
        let out = pass().run(&prog).unwrap();
        assert!(out.changed);
        verify_program(&out.program).unwrap();
        assert_eq!(references(&out.program.declarations["rel"]), 0);
        assert_eq!(references(&out.program.declarations["z"]), 0);

        let input = json!({"items": [{"price": 1}, {"price": 2}, {"price": 3}]});
        same_results(&prog, &out.program, input.clone());
        let results = evaluate(&out.program, &FunctionRegistry::with_builtins(), &input).unwrap();
        assert_eq!(results["z"], Value::Int(-9));
    }

    #[test]
    fn test_reference_in_displaced_loop_stays_opaque() {
        let prog = nested_reduction();
        let single = CrossDeclarationInlining::new(0, 256);
        let err = single.run(&prog).unwrap_err();
        // only `rel` takes in `doubled` on the first iteration
        assert!(err.to_string().ends_with("(still changing: rel)"));
    }

    #[test]
    fn test_unknown_callee_is_malformed() {
        let prog = program(vec![decl("a", vec![load_decl(0, "missing", &[]), yield_of(0)])]);
        let err = pass().run(&prog).unwrap_err();
        assert_eq!(err.class(), ErrorClass::MalformedInput);
    }

    #[test]
    fn test_cyclic_references_stay_opaque() {
        let prog = program(vec![
            decl("a", vec![load_decl(0, "b", &[]), yield_of(0)]),
            decl("b", vec![load_decl(0, "a", &[]), yield_of(0)]),
        ]);
        assert!(!pass().run(&prog).unwrap().changed);
    }

    #[test]
    fn test_large_callee_stays_opaque() {
        let prog = program(vec![
            decl("x", vec![constant(0, 5), yield_of(0)]),
            decl("y", vec![load_decl(0, "x", &[]), yield_of(0)]),
        ]);
        let small = CrossDeclarationInlining::new(16, 1);
        assert!(!small.run(&prog).unwrap().changed);
    }

    #[test]
    fn test_iteration_cap() {
        let prog = program(vec![
            decl("x", vec![constant(0, 5), yield_of(0)]),
            decl("y", vec![load_decl(0, "x", &[]), yield_of(0)]),
        ]);
        let err = CrossDeclarationInlining::new(0, 256).run(&prog).unwrap_err();
        assert_eq!(err.class(), ErrorClass::NonConvergence);
        assert!(err.to_string().contains("still changing: y"));

        let out = CrossDeclarationInlining::new(1, 256).run(&prog).unwrap();
        assert!(out.changed);
        assert_eq!(references(&out.program.declarations["y"]), 0);
    }
}
