//! Error types
//!
//! Every error raised by lowering or the optimization pipeline is a
//! compiler-internal failure: user-facing validation happens upstream, so
//! nothing here is retried or recovered.

use crate::interp::EvalError;
use crate::lir::Register;
use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, CompileError>;

/// Broad classification of a [`CompileError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// The scope-analysis stage handed over something structurally broken
    MalformedInput,
    /// A fixpoint pass hit its iteration cap
    NonConvergence,
    /// An internal dominance or ordering guard tripped
    Consistency,
    /// IO, JSON, configuration or evaluation trouble around the core
    Environment,
}

/// Compile error
#[derive(Debug, Error)]
pub enum CompileError {
    #[error("malformed input in `{declaration}`: {message}")]
    MalformedInput { declaration: String, message: String },

    #[error("{pass} did not converge after {iterations} iterations ({context})")]
    NonConvergence {
        pass: &'static str,
        iterations: usize,
        context: String,
    },

    #[error("consistency violation in `{declaration}`: {message}")]
    Consistency {
        declaration: String,
        message: String,
        register: Option<Register>,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("config error: {0}")]
    Config(#[from] toml::de::Error),

    #[error("{0}")]
    Eval(#[from] EvalError),
}

impl CompileError {
    pub fn malformed(declaration: impl Into<String>, message: impl Into<String>) -> Self {
        Self::MalformedInput {
            declaration: declaration.into(),
            message: message.into(),
        }
    }

    pub fn non_convergence(pass: &'static str, iterations: usize, context: impl Into<String>) -> Self {
        Self::NonConvergence {
            pass,
            iterations,
            context: context.into(),
        }
    }

    pub fn consistency(declaration: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Consistency {
            declaration: declaration.into(),
            message: message.into(),
            register: None,
        }
    }

    /// Consistency violation pinned to a specific register
    pub fn consistency_at(
        declaration: impl Into<String>,
        message: impl Into<String>,
        register: Register,
    ) -> Self {
        Self::Consistency {
            declaration: declaration.into(),
            message: message.into(),
            register: Some(register),
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            Self::MalformedInput { .. } => ErrorClass::MalformedInput,
            Self::NonConvergence { .. } => ErrorClass::NonConvergence,
            Self::Consistency { .. } => ErrorClass::Consistency,
            Self::Io(_) | Self::Json(_) | Self::Config(_) | Self::Eval(_) => ErrorClass::Environment,
        }
    }

    /// Declaration the error is attributed to, when there is one
    pub fn declaration(&self) -> Option<&str> {
        match self {
            Self::MalformedInput { declaration, .. } | Self::Consistency { declaration, .. } => {
                Some(declaration)
            }
            _ => None,
        }
    }
}
