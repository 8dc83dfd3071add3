//! Pipeline configuration
//!
//! Built in code with the builder methods or loaded from TOML:
//!
//! ```toml
//! opt_level = "aggressive"
//! max_rounds = 6
//! verify_each_pass = true
//! target = "rust"
//! ```
//!
//! Keys left out fall back to [`PipelineConfig::default`].

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::kernels::Target;
use crate::opt::{OptLevel, PassKind};

/// Optimization pipeline configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Pass list used when `passes` is not set
    pub opt_level: OptLevel,
    /// Explicit pass order
    pub passes: Option<Vec<PassKind>>,
    /// Whole-pipeline repetitions while anything changes
    pub max_rounds: usize,
    pub licm_max_iterations: usize,
    pub hoist_max_iterations: usize,
    pub inline_max_iterations: usize,
    pub fusion_max_iterations: usize,
    /// Callees with more instructions stay opaque references
    pub inline_max_callee_nodes: usize,
    /// Check LIR invariants after every pass
    pub verify_each_pass: bool,
    /// Kernel binding target
    pub target: Target,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            opt_level: OptLevel::Release,
            passes: None,
            max_rounds: 4,
            licm_max_iterations: 64,
            hoist_max_iterations: 64,
            inline_max_iterations: 32,
            fusion_max_iterations: 32,
            inline_max_callee_nodes: 256,
            verify_each_pass: true,
            target: Target::Reference,
        }
    }
}

impl PipelineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_toml_str(source: &str) -> Result<Self> {
        Ok(toml::from_str(source)?)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let source = std::fs::read_to_string(path)?;
        Self::from_toml_str(&source)
    }

    /// Passes to run, in order
    pub fn pass_list(&self) -> Vec<PassKind> {
        match &self.passes {
            Some(passes) => passes.clone(),
            None => self.opt_level.passes(),
        }
    }

    /// Set optimization level
    pub fn opt_level(mut self, level: OptLevel) -> Self {
        self.opt_level = level;
        self
    }

    /// Run exactly these passes, in order
    pub fn passes(mut self, passes: Vec<PassKind>) -> Self {
        self.passes = Some(passes);
        self
    }

    pub fn max_rounds(mut self, rounds: usize) -> Self {
        self.max_rounds = rounds;
        self
    }

    pub fn licm_max_iterations(mut self, n: usize) -> Self {
        self.licm_max_iterations = n;
        self
    }

    pub fn hoist_max_iterations(mut self, n: usize) -> Self {
        self.hoist_max_iterations = n;
        self
    }

    pub fn inline_max_iterations(mut self, n: usize) -> Self {
        self.inline_max_iterations = n;
        self
    }

    pub fn fusion_max_iterations(mut self, n: usize) -> Self {
        self.fusion_max_iterations = n;
        self
    }

    pub fn inline_max_callee_nodes(mut self, n: usize) -> Self {
        self.inline_max_callee_nodes = n;
        self
    }

    pub fn verify_each_pass(mut self, verify: bool) -> Self {
        self.verify_each_pass = verify;
        self
    }

    /// Set kernel binding target
    pub fn target(mut self, target: Target) -> Self {
        self.target = target;
        self
    }
}
