//! LIR Optimization Passes
//!
//! Every pass is a pure function from one [`LirProgram`] to the next plus a
//! changed flag. Passes never mutate the program they are handed, so a
//! fixpoint driver can compare snapshots and cross-declaration passes can
//! read callees from the previous state while building the new one.
//!
//! # Optimization Levels
//!
//! - **Debug**: no passes
//! - **Release**: const-prop, CSE, DCE, LICM, scalar hoisting, fusion,
//!   inlining, scheduling
//! - **Aggressive**: Release followed by a CSE/LICM/fusion/DCE cleanup tail
//!
//! CSE runs before fusion in every level: fusion only merges loops whose
//! collections are the same register.

mod const_prop;
mod cse;
mod dce;
mod fusion;
mod inline;
mod licm;
mod scalar_hoist;
mod schedule;

pub use const_prop::ConstantPropagation;
pub use cse::CommonSubexpressionElimination;
pub use dce::DeadCodeElimination;
pub use fusion::LoopFusion;
pub use inline::CrossDeclarationInlining;
pub use licm::LoopInvariantCodeMotion;
pub use scalar_hoist::ScalarReferenceHoisting;
pub use schedule::InstructionScheduling;

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, debug_span, instrument, warn};

use crate::config::PipelineConfig;
use crate::error::{CompileError, Result};
use crate::lir::{
    Instruction, LirDeclaration, LirProgram, Node, Op, Register, resolve_rename, verify_program,
};
use crate::registry::FunctionRegistry;

/// Optimization pass trait
pub trait OptimizationPass {
    /// Name of the optimization pass
    fn name(&self) -> &'static str;

    /// Build the next program from `program`
    fn run(&self, program: &LirProgram) -> Result<Rewrite>;
}

/// Output of one pass run
#[derive(Debug, Clone)]
pub struct Rewrite {
    pub program: LirProgram,
    pub changed: bool,
}

/// Apply an intra-declaration rewrite to every declaration
///
/// `changed` is decided structurally, so a pass cannot report a change it
/// did not make.
pub fn rewrite_each(
    program: &LirProgram,
    mut f: impl FnMut(&LirDeclaration) -> Result<Vec<Node>>,
) -> Result<Rewrite> {
    let mut next = LirProgram::new();
    let mut changed = false;
    for decl in program.declarations.values() {
        let body = f(decl)?;
        if body != decl.body {
            changed = true;
        }
        next.insert(LirDeclaration { body, ..decl.clone() });
    }
    Ok(Rewrite { program: next, changed })
}

/// Rewrite every register read in `nodes`, loop collections included
pub fn rename_nodes(nodes: &mut [Node], renames: &HashMap<Register, Register>) {
    for node in nodes {
        match node {
            Node::Inst(inst) => inst.rename_inputs(renames),
            Node::Loop(lp) => {
                lp.collection = resolve_rename(renames, lp.collection);
                rename_nodes(&mut lp.body, renames);
            }
        }
    }
}

/// Instruction has an effect beyond defining its result
pub fn has_side_effects(inst: &Instruction, registry: &FunctionRegistry) -> bool {
    match &inst.op {
        Op::KernelCall { function, .. } => !registry.is_pure(function),
        op => op.has_intrinsic_side_effect(),
    }
}

/// Instruction may be deduplicated or moved
///
/// `LoadAccumulator` is removable when dead but reads loop-carried state,
/// so it is not movable.
pub fn is_movable(inst: &Instruction, registry: &FunctionRegistry) -> bool {
    match &inst.op {
        Op::Constant { .. }
        | Op::LoadInput { .. }
        | Op::LoadField { .. }
        | Op::LoadDeclaration { .. }
        | Op::Select { .. }
        | Op::MakeTuple { .. }
        | Op::MakeObject { .. }
        | Op::TupleGet { .. } => true,
        Op::KernelCall { function, .. } => registry.is_pure(function),
        _ => false,
    }
}

// ============================================================================
// Pass selection
// ============================================================================

/// Optimization level
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptLevel {
    #[default]
    Debug,
    Release,
    Aggressive,
}

impl OptLevel {
    /// Pass order for this level
    pub fn passes(self) -> Vec<PassKind> {
        use PassKind::*;
        match self {
            OptLevel::Debug => Vec::new(),
            OptLevel::Release => vec![ConstProp, Cse, Dce, Licm, ScalarHoist, Fusion, Inline, Schedule],
            OptLevel::Aggressive => {
                let mut passes = OptLevel::Release.passes();
                passes.extend([Cse, Licm, Fusion, Dce]);
                passes
            }
        }
    }
}

impl FromStr for OptLevel {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "debug" => Ok(OptLevel::Debug),
            "release" => Ok(OptLevel::Release),
            "aggressive" => Ok(OptLevel::Aggressive),
            other => Err(format!("unknown optimization level `{other}`")),
        }
    }
}

/// Selectable pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PassKind {
    ConstProp,
    Cse,
    Dce,
    Licm,
    ScalarHoist,
    Fusion,
    Inline,
    Schedule,
}

impl PassKind {
    pub const ALL: [PassKind; 8] = [
        PassKind::ConstProp,
        PassKind::Cse,
        PassKind::Dce,
        PassKind::Licm,
        PassKind::ScalarHoist,
        PassKind::Fusion,
        PassKind::Inline,
        PassKind::Schedule,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            PassKind::ConstProp => "const_prop",
            PassKind::Cse => "cse",
            PassKind::Dce => "dce",
            PassKind::Licm => "licm",
            PassKind::ScalarHoist => "scalar_hoist",
            PassKind::Fusion => "fusion",
            PassKind::Inline => "inline",
            PassKind::Schedule => "schedule",
        }
    }

    /// Instantiate the pass with settings from `config`
    pub fn build(self, config: &PipelineConfig, registry: &Arc<FunctionRegistry>) -> Box<dyn OptimizationPass> {
        match self {
            PassKind::ConstProp => Box::new(ConstantPropagation::new(Arc::clone(registry))),
            PassKind::Cse => Box::new(CommonSubexpressionElimination::new(Arc::clone(registry))),
            PassKind::Dce => Box::new(DeadCodeElimination::new(Arc::clone(registry))),
            PassKind::Licm => Box::new(LoopInvariantCodeMotion::new(
                Arc::clone(registry),
                config.licm_max_iterations,
            )),
            PassKind::ScalarHoist => Box::new(ScalarReferenceHoisting::new(config.hoist_max_iterations)),
            PassKind::Fusion => Box::new(LoopFusion::new(config.fusion_max_iterations)),
            PassKind::Inline => Box::new(CrossDeclarationInlining::new(
                config.inline_max_iterations,
                config.inline_max_callee_nodes,
            )),
            PassKind::Schedule => Box::new(InstructionScheduling::new(Arc::clone(registry))),
        }
    }
}

impl fmt::Display for PassKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PassKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        PassKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| format!("unknown pass `{s}`"))
    }
}

// ============================================================================
// Pipeline
// ============================================================================

/// Optimization pipeline
pub struct OptimizationPipeline {
    passes: Vec<Box<dyn OptimizationPass>>,
    max_rounds: usize,
    verify_each_pass: bool,
}

impl OptimizationPipeline {
    /// Create an empty pipeline
    pub fn new() -> Self {
        Self {
            passes: Vec::new(),
            max_rounds: 4,
            verify_each_pass: true,
        }
    }

    /// Create the pipeline described by `config`
    pub fn from_config(config: &PipelineConfig, registry: Arc<FunctionRegistry>) -> Self {
        let mut pipeline = Self::new();
        pipeline.set_max_rounds(config.max_rounds);
        pipeline.set_verify_each_pass(config.verify_each_pass);
        for kind in config.pass_list() {
            pipeline.add_pass(kind.build(config, &registry));
        }
        pipeline
    }

    pub fn add_pass(&mut self, pass: Box<dyn OptimizationPass>) {
        self.passes.push(pass);
    }

    /// Set the maximum number of whole-pipeline rounds
    pub fn set_max_rounds(&mut self, n: usize) {
        self.max_rounds = n;
    }

    pub fn set_verify_each_pass(&mut self, verify: bool) {
        self.verify_each_pass = verify;
    }

    pub fn pass_names(&self) -> Vec<&'static str> {
        self.passes.iter().map(|p| p.name()).collect()
    }

    /// Run the pass list until a round changes nothing or the round limit is hit
    #[instrument(level = "debug", skip_all, fields(passes = self.passes.len()))]
    pub fn optimize(&self, program: LirProgram) -> Result<(LirProgram, OptimizationStats)> {
        let mut stats = OptimizationStats::new();
        stats.instructions_before = program.instruction_count();
        let mut program = program;

        if self.verify_each_pass {
            verify_program(&program)?;
        }

        let mut round = 0;
        while !self.passes.is_empty() && round < self.max_rounds {
            round += 1;
            let mut changed = false;

            for pass in &self.passes {
                let rewrite = debug_span!("pass", name = pass.name(), round).in_scope(|| pass.run(&program))?;
                if self.verify_each_pass {
                    verify_program(&rewrite.program).map_err(|e| blame(pass.name(), e))?;
                }
                if rewrite.changed {
                    changed = true;
                    stats.record_pass(pass.name());
                    debug!(pass = pass.name(), round, "changed");
                }
                program = rewrite.program;
            }

            if !changed {
                break;
            }
            if round == self.max_rounds {
                warn!(rounds = round, "pipeline stopped at its round limit while still changing");
            }
        }

        stats.iterations = round;
        stats.instructions_after = program.instruction_count();
        Ok((program, stats))
    }
}

impl Default for OptimizationPipeline {
    fn default() -> Self {
        Self::new()
    }
}

/// Attribute a verification failure to the pass that produced the program
fn blame(pass: &str, err: CompileError) -> CompileError {
    let declaration = err.declaration().unwrap_or("<program>").to_string();
    let register = match &err {
        CompileError::Consistency { register, .. } => *register,
        _ => None,
    };
    let message = format!("invariant broken after {pass}: {err}");
    match register {
        Some(reg) => CompileError::consistency_at(declaration, message, reg),
        None => CompileError::consistency(declaration, message),
    }
}

/// Statistics from optimization passes
#[derive(Debug, Default, Clone, Serialize)]
pub struct OptimizationStats {
    /// Number of pipeline rounds run
    pub iterations: usize,
    /// Rounds in which each pass changed the program
    pub pass_counts: HashMap<String, usize>,
    pub instructions_before: usize,
    pub instructions_after: usize,
}

impl OptimizationStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_pass(&mut self, name: &str) {
        *self.pass_counts.entry(name.to_string()).or_insert(0) += 1;
    }
}
