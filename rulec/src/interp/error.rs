//! Evaluation errors for the reference evaluator

use std::fmt;

/// Error raised while evaluating LIR or a kernel
#[derive(Debug, Clone)]
pub struct EvalError {
    pub kind: EvalErrorKind,
    pub message: String,
}

/// Kinds of evaluation errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvalErrorKind {
    TypeError,
    DivisionByZero,
    IndexOutOfBounds,
    /// Kernel name not in the registry or has no reference implementation
    UndefinedFunction,
    ArityMismatch,
    /// Input record lacks a requested key
    MissingInput,
    /// Register read before the evaluator assigned it
    UndefinedRegister,
    /// Declaration referenced before it was evaluated
    UndefinedDeclaration,
    /// Instruction the evaluator cannot execute in its position
    Unsupported,
}

impl EvalError {
    fn new(kind: EvalErrorKind, message: String) -> Self {
        EvalError { kind, message }
    }

    pub fn type_error(expected: &str, got: &str) -> Self {
        Self::new(EvalErrorKind::TypeError, format!("type error: expected {expected}, got {got}"))
    }

    pub fn division_by_zero() -> Self {
        Self::new(EvalErrorKind::DivisionByZero, "division by zero".to_string())
    }

    pub fn index_out_of_bounds(index: i64, len: usize) -> Self {
        Self::new(
            EvalErrorKind::IndexOutOfBounds,
            format!("index {index} out of bounds for length {len}"),
        )
    }

    pub fn undefined_function(name: &str) -> Self {
        Self::new(EvalErrorKind::UndefinedFunction, format!("undefined function: {name}"))
    }

    pub fn arity_mismatch(name: &str, expected: usize, got: usize) -> Self {
        Self::new(
            EvalErrorKind::ArityMismatch,
            format!("function {name} expects {expected} argument(s), got {got}"),
        )
    }

    pub fn missing_input(key: &str) -> Self {
        Self::new(EvalErrorKind::MissingInput, format!("input has no field `{key}`"))
    }

    pub fn undefined_register(reg: impl fmt::Display) -> Self {
        Self::new(EvalErrorKind::UndefinedRegister, format!("register {reg} has no value"))
    }

    pub fn undefined_declaration(name: &str) -> Self {
        Self::new(
            EvalErrorKind::UndefinedDeclaration,
            format!("declaration `{name}` has not been evaluated"),
        )
    }

    pub fn unsupported(what: impl fmt::Display) -> Self {
        Self::new(EvalErrorKind::Unsupported, format!("cannot evaluate {what}"))
    }
}

impl fmt::Display for EvalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "evaluation error: {}", self.message)
    }
}

impl std::error::Error for EvalError {}

/// Result type for evaluator operations
pub type EvalResult<T> = Result<T, EvalError>;
