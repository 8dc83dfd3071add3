//! Kernel binding
//!
//! Last step of compilation: every `KernelCall` function and every reducer
//! step used by an `Accumulate` is resolved to a symbol of the selected
//! backend. Instructions are not rewritten; the result is a manifest the
//! backend binder consumes next to the optimized LIR.

use std::fmt;
use std::str::FromStr;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::error::{CompileError, Result};
use crate::lir::{LirProgram, Op, walk_instructions};
use crate::registry::FunctionRegistry;

/// Backend to bind kernels for
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Target {
    /// Builtin kernels of the reference evaluator
    #[default]
    Reference,
    /// Symbol paths of a generated Rust evaluator
    Rust,
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Reference => write!(f, "reference"),
            Target::Rust => write!(f, "rust"),
        }
    }
}

impl FromStr for Target {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "reference" => Ok(Target::Reference),
            "rust" => Ok(Target::Rust),
            other => Err(format!("unknown target `{other}` (expected reference or rust)")),
        }
    }
}

/// How a kernel is used at its sites
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BindingRole {
    /// Called by `KernelCall`
    Call,
    /// Step function of an `Accumulate`
    Reducer,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KernelBinding {
    pub function: String,
    pub role: BindingRole,
    pub symbol: String,
    /// Number of instructions using this binding
    pub sites: usize,
}

/// Per-declaration kernel bindings for one target
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BindingManifest {
    pub target: Target,
    pub declarations: IndexMap<String, Vec<KernelBinding>>,
}

impl BindingManifest {
    pub fn symbol(&self, declaration: &str, function: &str) -> Option<&str> {
        self.declarations
            .get(declaration)?
            .iter()
            .find(|b| b.function == function)
            .map(|b| b.symbol.as_str())
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Resolve every kernel used by `program` for `target`
#[instrument(level = "debug", skip_all, fields(target = %target))]
pub fn bind(program: &LirProgram, registry: &FunctionRegistry, target: Target) -> Result<BindingManifest> {
    let mut declarations = IndexMap::new();

    for (name, decl) in &program.declarations {
        let mut uses: Vec<(String, BindingRole)> = Vec::new();
        walk_instructions(&decl.body, &mut |inst| match &inst.op {
            Op::KernelCall { function, .. } => uses.push((function.clone(), BindingRole::Call)),
            Op::Accumulate { function, .. } => uses.push((function.clone(), BindingRole::Reducer)),
            _ => {}
        });

        let mut bindings: Vec<KernelBinding> = Vec::new();
        for (function, role) in uses {
            if let Some(existing) = bindings
                .iter_mut()
                .find(|b| b.function == function && b.role == role)
            {
                existing.sites += 1;
                continue;
            }
            let sig = registry.get(&function).ok_or_else(|| {
                CompileError::malformed(name, format!("kernel `{function}` is not registered"))
            })?;
            let symbol = sig.kernels.get(&target).ok_or_else(|| {
                CompileError::malformed(
                    name,
                    format!("kernel `{function}` has no binding for target {target}"),
                )
            })?;
            bindings.push(KernelBinding {
                function,
                role,
                symbol: symbol.clone(),
                sites: 1,
            });
        }

        debug!(declaration = %name, kernels = bindings.len(), "bound");
        declarations.insert(name.clone(), bindings);
    }

    Ok(BindingManifest { target, declarations })
}
