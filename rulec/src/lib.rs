//! Rule Compiler Core
//!
//! Lowers scope-annotated rule declarations into a loop-oriented IR (LIR),
//! optimizes it and binds the remaining kernels to a backend target.

pub mod config;
pub mod error;
pub mod interp;
pub mod kernels;
pub mod lir;
pub mod lower;
pub mod opt;
pub mod registry;
pub mod scope;
pub mod span;

use std::sync::Arc;

use tracing::{debug, instrument};

pub use config::PipelineConfig;
pub use error::{CompileError, ErrorClass, Result};
pub use kernels::{BindingManifest, Target};
pub use lir::{LirDeclaration, LirProgram};
pub use opt::{OptLevel, OptimizationPipeline, OptimizationStats, PassKind};
pub use registry::FunctionRegistry;
pub use scope::ScopedSchema;
pub use span::Span;

/// Result of compiling one schema
#[derive(Debug, Clone)]
pub struct Compilation {
    pub program: LirProgram,
    pub manifest: BindingManifest,
    pub stats: OptimizationStats,
}

/// Lower, optimize and bind every declaration of `schema`
#[instrument(level = "debug", skip_all, fields(declarations = schema.declarations.len()))]
pub fn compile(
    schema: &ScopedSchema,
    registry: Arc<FunctionRegistry>,
    config: &PipelineConfig,
) -> Result<Compilation> {
    let program = lower::lower_schema(schema, &registry)?;
    let pipeline = OptimizationPipeline::from_config(config, Arc::clone(&registry));
    debug!(passes = ?pipeline.pass_names(), "optimizing");
    let (program, stats) = pipeline.optimize(program)?;
    let manifest = kernels::bind(&program, &registry, config.target)?;
    Ok(Compilation {
        program,
        manifest,
        stats,
    })
}
