//! Rule compiler debug CLI

use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rulec::{FunctionRegistry, OptLevel, PipelineConfig, ScopedSchema, Target};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "rulec", version, about = "Rule compiler - loop IR lowering and optimization")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Args)]
struct PipelineArgs {
    /// Pipeline configuration (TOML)
    #[arg(long)]
    config: Option<PathBuf>,
    /// Optimization level: debug, release or aggressive
    #[arg(short = 'O', long)]
    opt_level: Option<OptLevel>,
    /// Kernel binding target: reference or rust
    #[arg(long)]
    target: Option<Target>,
}

impl PipelineArgs {
    fn load(&self) -> Result<PipelineConfig, Box<dyn std::error::Error>> {
        let mut config = match &self.config {
            Some(path) => PipelineConfig::from_file(path)?,
            None => PipelineConfig::default(),
        };
        if let Some(level) = self.opt_level {
            config = config.opt_level(level);
            config.passes = None;
        }
        if let Some(target) = self.target {
            config = config.target(target);
        }
        Ok(config)
    }
}

#[derive(Subcommand)]
enum Command {
    /// Lower a schema and dump unoptimized LIR
    Lower {
        /// Scoped schema (JSON)
        schema: PathBuf,
    },
    /// Lower, optimize and bind a schema
    Compile {
        /// Scoped schema (JSON)
        schema: PathBuf,
        #[command(flatten)]
        pipeline: PipelineArgs,
        /// Print the kernel binding manifest instead of LIR
        #[arg(long)]
        manifest: bool,
    },
    /// Compile a schema and evaluate it against an input record
    Eval {
        /// Scoped schema (JSON)
        schema: PathBuf,
        /// Input record (JSON)
        input: PathBuf,
        #[command(flatten)]
        pipeline: PipelineArgs,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Command::Lower { schema } => lower_file(&schema),
        Command::Compile { schema, pipeline, manifest } => compile_file(&schema, &pipeline, manifest),
        Command::Eval { schema, input, pipeline } => eval_file(&schema, &input, &pipeline),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

fn read_schema(path: &Path) -> Result<ScopedSchema, Box<dyn std::error::Error>> {
    let source = std::fs::read_to_string(path)?;
    Ok(ScopedSchema::from_json_str(&source)?)
}

fn lower_file(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let schema = read_schema(path)?;
    let registry = FunctionRegistry::with_builtins();
    let program = rulec::lower::lower_schema(&schema, &registry)?;
    print!("{}", rulec::lir::format_lir(&program));
    Ok(())
}

fn compile_file(path: &Path, args: &PipelineArgs, manifest: bool) -> Result<(), Box<dyn std::error::Error>> {
    let schema = read_schema(path)?;
    let config = args.load()?;
    let compiled = rulec::compile(&schema, Arc::new(FunctionRegistry::with_builtins()), &config)?;

    if manifest {
        println!("{}", compiled.manifest.to_json()?);
    } else {
        print!("{}", rulec::lir::format_lir(&compiled.program));
        eprintln!(
            "{} -> {} instructions in {} round(s)",
            compiled.stats.instructions_before, compiled.stats.instructions_after, compiled.stats.iterations
        );
    }
    Ok(())
}

fn eval_file(schema: &Path, input: &Path, args: &PipelineArgs) -> Result<(), Box<dyn std::error::Error>> {
    let schema = read_schema(schema)?;
    let input: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(input)?)?;
    let config = args.load()?;
    let registry = Arc::new(FunctionRegistry::with_builtins());
    let compiled = rulec::compile(&schema, Arc::clone(&registry), &config)?;

    let results = rulec::interp::evaluate(&compiled.program, &registry, &input)?;
    let json: serde_json::Map<String, serde_json::Value> = results
        .iter()
        .map(|(name, value)| (name.clone(), serde_json::Value::from(value)))
        .collect();
    println!("{}", serde_json::to_string_pretty(&json)?);
    Ok(())
}
