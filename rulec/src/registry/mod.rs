//! Function registry
//!
//! Maps symbolic function names to the metadata lowering and the
//! optimizer rely on: arity, result type, purity, reducer identity/step and
//! per-target kernel symbols. Purity is what lets CSE, DCE and LICM touch a
//! `KernelCall`; reducer metadata is what lets lowering turn an aggregate
//! into an accumulator loop.

use std::collections::BTreeMap;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::interp::{EvalError, EvalResult, Value};
use crate::kernels::Target;
use crate::lir::{DType, Literal};

/// Reference implementation of a kernel
pub type KernelFn = fn(&[Value]) -> EvalResult<Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Purity {
    Pure,
    /// Observable effect; never deduplicated, removed or moved across another impure call
    Impure,
}

/// Reduction metadata: `acc = step(acc, value)` starting from `identity`
#[derive(Debug, Clone, PartialEq)]
pub struct Reducer {
    pub identity: Literal,
    pub step: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
    Exact(usize),
    AtLeast(usize),
}

impl Arity {
    pub fn accepts(self, n: usize) -> bool {
        match self {
            Arity::Exact(k) => n == k,
            Arity::AtLeast(k) => n >= k,
        }
    }

    fn expected(self) -> usize {
        match self {
            Arity::Exact(k) | Arity::AtLeast(k) => k,
        }
    }
}

/// Function signature and binding metadata
#[derive(Debug, Clone)]
pub struct FunctionSig {
    pub name: String,
    pub arity: Arity,
    /// Result type when it does not depend on the arguments
    pub returns: Option<DType>,
    pub purity: Purity,
    /// Can fail on well-typed arguments (zero divisor, index out of range)
    pub partial: bool,
    pub reducer: Option<Reducer>,
    pub eval: Option<KernelFn>,
    /// Backend symbol per binding target
    pub kernels: BTreeMap<Target, String>,
}

impl FunctionSig {
    pub fn new(name: impl Into<String>, arity: Arity) -> Self {
        Self {
            name: name.into(),
            arity,
            returns: None,
            purity: Purity::Pure,
            partial: false,
            reducer: None,
            eval: None,
            kernels: BTreeMap::new(),
        }
    }

    pub fn returns(mut self, dtype: DType) -> Self {
        self.returns = Some(dtype);
        self
    }

    pub fn impure(mut self) -> Self {
        self.purity = Purity::Impure;
        self
    }

    pub fn partial(mut self) -> Self {
        self.partial = true;
        self
    }

    pub fn reducer(mut self, identity: Literal, step: impl Into<String>) -> Self {
        self.reducer = Some(Reducer { identity, step: step.into() });
        self
    }

    pub fn eval(mut self, f: KernelFn) -> Self {
        self.eval = Some(f);
        self
    }

    pub fn kernel(mut self, target: Target, symbol: impl Into<String>) -> Self {
        self.kernels.insert(target, symbol.into());
        self
    }

    pub fn is_pure(&self) -> bool {
        self.purity == Purity::Pure
    }
}

/// Name → signature table
#[derive(Debug, Clone, Default)]
pub struct FunctionRegistry {
    functions: IndexMap<String, FunctionSig>,
}

impl FunctionRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the `core.*` and `agg.*` library
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        for sig in builtins() {
            registry.register(sig);
        }
        registry
    }

    pub fn register(&mut self, sig: FunctionSig) {
        self.functions.insert(sig.name.clone(), sig);
    }

    pub fn get(&self, name: &str) -> Option<&FunctionSig> {
        self.functions.get(name)
    }

    /// Unknown functions are treated as impure
    pub fn is_pure(&self, name: &str) -> bool {
        self.get(name).is_some_and(FunctionSig::is_pure)
    }

    /// Unknown functions are treated as partial
    pub fn is_partial(&self, name: &str) -> bool {
        self.get(name).is_none_or(|sig| sig.partial)
    }

    pub fn reducer(&self, name: &str) -> Option<&Reducer> {
        self.get(name).and_then(|sig| sig.reducer.as_ref())
    }

    pub fn iter(&self) -> impl Iterator<Item = &FunctionSig> {
        self.functions.values()
    }

    /// Run the reference implementation of `name`
    pub fn call(&self, name: &str, args: &[Value]) -> EvalResult<Value> {
        let sig = self.get(name).ok_or_else(|| EvalError::undefined_function(name))?;
        if !sig.arity.accepts(args.len()) {
            return Err(EvalError::arity_mismatch(name, sig.arity.expected(), args.len()));
        }
        let f = sig.eval.ok_or_else(|| EvalError::undefined_function(name))?;
        f(args)
    }
}

// ============================================================================
// Builtin library
// ============================================================================

fn builtin(name: &str, arity: Arity, f: KernelFn) -> FunctionSig {
    let rust_symbol = format!("kernels::{}", name.replace('.', "::"));
    FunctionSig::new(name, arity)
        .eval(f)
        .kernel(Target::Reference, name)
        .kernel(Target::Rust, rust_symbol)
}

fn builtins() -> Vec<FunctionSig> {
    use Arity::Exact;
    vec![
        builtin("core.add", Exact(2), add),
        builtin("core.sub", Exact(2), sub),
        builtin("core.mul", Exact(2), mul),
        builtin("core.div", Exact(2), div).partial(),
        builtin("core.mod", Exact(2), modulo).partial(),
        builtin("core.neg", Exact(1), neg),
        builtin("core.eq", Exact(2), |a| Ok(Value::Bool(a[0] == a[1]))).returns(DType::Boolean),
        builtin("core.ne", Exact(2), |a| Ok(Value::Bool(a[0] != a[1]))).returns(DType::Boolean),
        builtin("core.lt", Exact(2), |a| compare(a, |o| o.is_lt())).returns(DType::Boolean),
        builtin("core.le", Exact(2), |a| compare(a, |o| o.is_le())).returns(DType::Boolean),
        builtin("core.gt", Exact(2), |a| compare(a, |o| o.is_gt())).returns(DType::Boolean),
        builtin("core.ge", Exact(2), |a| compare(a, |o| o.is_ge())).returns(DType::Boolean),
        builtin("core.and", Exact(2), |a| Ok(Value::Bool(bool_arg(&a[0])? && bool_arg(&a[1])?)))
            .returns(DType::Boolean),
        builtin("core.or", Exact(2), |a| Ok(Value::Bool(bool_arg(&a[0])? || bool_arg(&a[1])?)))
            .returns(DType::Boolean),
        builtin("core.not", Exact(1), |a| Ok(Value::Bool(!bool_arg(&a[0])?))).returns(DType::Boolean),
        builtin("core.max", Exact(2), |a| extremum(a, true)),
        builtin("core.min", Exact(2), |a| extremum(a, false)),
        builtin("core.clamp", Exact(3), clamp),
        builtin("core.length", Exact(1), length).returns(DType::Integer),
        builtin("core.at", Exact(2), at).partial(),
        builtin("core.count_step", Exact(2), |a| add(&[a[0].clone(), Value::Int(1)]))
            .returns(DType::Integer),
        builtin("core.trace", Exact(1), trace).impure(),
        FunctionSig::new("agg.sum", Exact(1))
            .reducer(Literal::Int(0), "core.add"),
        FunctionSig::new("agg.max", Exact(1)).reducer(Literal::Nil, "core.max"),
        FunctionSig::new("agg.min", Exact(1)).reducer(Literal::Nil, "core.min"),
        FunctionSig::new("agg.count", Exact(1))
            .returns(DType::Integer)
            .reducer(Literal::Int(0), "core.count_step"),
        FunctionSig::new("agg.any", Exact(1))
            .returns(DType::Boolean)
            .reducer(Literal::Bool(false), "core.or"),
        FunctionSig::new("agg.all", Exact(1))
            .returns(DType::Boolean)
            .reducer(Literal::Bool(true), "core.and"),
    ]
}

fn bool_arg(v: &Value) -> EvalResult<bool> {
    v.as_bool().ok_or_else(|| EvalError::type_error("boolean", v.type_name()))
}

fn int_arg(v: &Value) -> EvalResult<i64> {
    v.as_int().ok_or_else(|| EvalError::type_error("integer", v.type_name()))
}

/// Integer op when both sides are integers, float op otherwise
fn arith(
    args: &[Value],
    int_op: fn(i64, i64) -> Option<i64>,
    float_op: fn(f64, f64) -> f64,
) -> EvalResult<Value> {
    match (&args[0], &args[1]) {
        (Value::Int(a), Value::Int(b)) => int_op(*a, *b)
            .map(Value::Int)
            .ok_or_else(|| EvalError::type_error("integer in range", "overflow")),
        (a, b) => match (a.as_float(), b.as_float()) {
            (Some(x), Some(y)) => Ok(Value::Float(float_op(x, y))),
            (None, _) => Err(EvalError::type_error("number", a.type_name())),
            (_, None) => Err(EvalError::type_error("number", b.type_name())),
        },
    }
}

fn add(args: &[Value]) -> EvalResult<Value> {
    if let (Value::Str(a), Value::Str(b)) = (&args[0], &args[1]) {
        return Ok(Value::Str(format!("{a}{b}")));
    }
    arith(args, i64::checked_add, |x, y| x + y)
}

fn sub(args: &[Value]) -> EvalResult<Value> {
    arith(args, i64::checked_sub, |x, y| x - y)
}

fn mul(args: &[Value]) -> EvalResult<Value> {
    arith(args, i64::checked_mul, |x, y| x * y)
}

fn div(args: &[Value]) -> EvalResult<Value> {
    if let Value::Int(0) = args[1] {
        if matches!(args[0], Value::Int(_)) {
            return Err(EvalError::division_by_zero());
        }
    }
    arith(args, i64::checked_div, |x, y| x / y)
}

/// Euclidean remainder: the result has the sign of the divisor
fn modulo(args: &[Value]) -> EvalResult<Value> {
    if let Value::Int(0) = args[1] {
        return Err(EvalError::division_by_zero());
    }
    arith(args, i64::checked_rem_euclid, f64::rem_euclid)
}

fn neg(args: &[Value]) -> EvalResult<Value> {
    match &args[0] {
        Value::Int(n) => n
            .checked_neg()
            .map(Value::Int)
            .ok_or_else(|| EvalError::type_error("integer in range", "overflow")),
        Value::Float(x) => Ok(Value::Float(-x)),
        other => Err(EvalError::type_error("number", other.type_name())),
    }
}

fn ordering(a: &Value, b: &Value) -> EvalResult<std::cmp::Ordering> {
    match (a, b) {
        (Value::Int(x), Value::Int(y)) => Ok(x.cmp(y)),
        (Value::Str(x), Value::Str(y)) => Ok(x.cmp(y)),
        _ => match (a.as_float(), b.as_float()) {
            (Some(x), Some(y)) => x
                .partial_cmp(&y)
                .ok_or_else(|| EvalError::type_error("comparable number", "NaN")),
            _ => Err(EvalError::type_error(a.type_name(), b.type_name())),
        },
    }
}

fn compare(args: &[Value], pick: fn(std::cmp::Ordering) -> bool) -> EvalResult<Value> {
    Ok(Value::Bool(pick(ordering(&args[0], &args[1])?)))
}

/// `nil` is the identity, so `agg.max`/`agg.min` start from it
fn extremum(args: &[Value], max: bool) -> EvalResult<Value> {
    match (&args[0], &args[1]) {
        (Value::Nil, other) | (other, Value::Nil) => Ok(other.clone()),
        (a, b) => {
            let a_wins = if max { ordering(a, b)?.is_ge() } else { ordering(a, b)?.is_le() };
            Ok(if a_wins { a.clone() } else { b.clone() })
        }
    }
}

fn clamp(args: &[Value]) -> EvalResult<Value> {
    let lo_first = extremum(&[args[0].clone(), args[1].clone()], true)?;
    extremum(&[lo_first, args[2].clone()], false)
}

fn length(args: &[Value]) -> EvalResult<Value> {
    match &args[0] {
        Value::Array(items) | Value::Tuple(items) => Ok(Value::Int(items.len() as i64)),
        Value::Str(s) => Ok(Value::Int(s.chars().count() as i64)),
        other => Err(EvalError::type_error("array", other.type_name())),
    }
}

fn at(args: &[Value]) -> EvalResult<Value> {
    let items = args[0]
        .as_array()
        .ok_or_else(|| EvalError::type_error("array", args[0].type_name()))?;
    let index = int_arg(&args[1])?;
    usize::try_from(index)
        .ok()
        .and_then(|i| items.get(i))
        .cloned()
        .ok_or_else(|| EvalError::index_out_of_bounds(index, items.len()))
}

fn trace(args: &[Value]) -> EvalResult<Value> {
    tracing::info!(value = %args[0], "core.trace");
    Ok(args[0].clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_arith() {
        let reg = FunctionRegistry::with_builtins();
        assert_eq!(reg.call("core.add", &[Value::Int(2), Value::Int(3)]).unwrap(), Value::Int(5));
        assert_eq!(
            reg.call("core.mul", &[Value::Int(2), Value::Float(1.5)]).unwrap(),
            Value::Float(3.0)
        );
        assert_eq!(reg.call("core.mod", &[Value::Int(-1), Value::Int(3)]).unwrap(), Value::Int(2));
    }

    #[test]
    fn test_division_by_zero() {
        let reg = FunctionRegistry::with_builtins();
        let err = reg.call("core.div", &[Value::Int(1), Value::Int(0)]).unwrap_err();
        assert_eq!(err.kind, crate::interp::EvalErrorKind::DivisionByZero);
    }

    #[test]
    fn test_negation_overflow() {
        let reg = FunctionRegistry::with_builtins();
        assert!(reg.call("core.neg", &[Value::Int(i64::MIN)]).is_err());
        assert_eq!(reg.call("core.neg", &[Value::Int(-4)]).unwrap(), Value::Int(4));
    }

    #[test]
    fn test_partial_kernels() {
        let reg = FunctionRegistry::with_builtins();
        assert!(reg.is_partial("core.div"));
        assert!(reg.is_partial("core.at"));
        assert!(!reg.is_partial("core.mul"));
        assert!(reg.is_partial("no.such.fn"));
    }

    #[test]
    fn test_arity_checked() {
        let reg = FunctionRegistry::with_builtins();
        let err = reg.call("core.not", &[]).unwrap_err();
        assert_eq!(err.kind, crate::interp::EvalErrorKind::ArityMismatch);
    }

    #[test]
    fn test_extremum_nil_identity() {
        let reg = FunctionRegistry::with_builtins();
        assert_eq!(reg.call("core.max", &[Value::Nil, Value::Int(4)]).unwrap(), Value::Int(4));
        assert_eq!(reg.call("core.min", &[Value::Int(4), Value::Int(2)]).unwrap(), Value::Int(2));
        assert_eq!(
            reg.call("core.clamp", &[Value::Int(9), Value::Int(0), Value::Int(4)]).unwrap(),
            Value::Int(4)
        );
    }

    #[test]
    fn test_reducers_and_purity() {
        let reg = FunctionRegistry::with_builtins();
        let sum = reg.reducer("agg.sum").unwrap();
        assert_eq!(sum.identity, Literal::Int(0));
        assert_eq!(sum.step, "core.add");
        assert!(reg.reducer("core.add").is_none());
        assert!(reg.is_pure("core.add"));
        assert!(!reg.is_pure("core.trace"));
        assert!(!reg.is_pure("no.such.fn"));
    }

    #[test]
    fn test_builtin_kernel_symbols() {
        let reg = FunctionRegistry::with_builtins();
        let sig = reg.get("core.at").unwrap();
        assert_eq!(sig.kernels[&Target::Reference], "core.at");
        assert_eq!(sig.kernels[&Target::Rust], "kernels::core::at");
    }

    #[test]
    fn test_at_out_of_bounds() {
        let reg = FunctionRegistry::with_builtins();
        let arr = Value::Array(vec![Value::Int(1)]);
        assert_eq!(reg.call("core.at", &[arr.clone(), Value::Int(0)]).unwrap(), Value::Int(1));
        assert!(reg.call("core.at", &[arr, Value::Int(3)]).is_err());
    }

    #[test]
    fn test_reducer_steps_are_kernels() {
        let reg = FunctionRegistry::with_builtins();
        for sig in reg.iter() {
            if let Some(reducer) = &sig.reducer {
                let step = reg.get(&reducer.step).unwrap();
                assert!(step.eval.is_some(), "{} steps with {}", sig.name, reducer.step);
                assert!(step.is_pure());
            }
        }
    }
}
