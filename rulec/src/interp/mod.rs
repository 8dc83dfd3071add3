//! Reference evaluator for LIR
//!
//! Runs a [`LirProgram`] against a JSON input record. Kernel calls go
//! through the registry's reference implementations, so the same program
//! evaluated before and after optimization must agree; the pass tests lean
//! on that.
//!
//! A declaration whose yield sits under open loops evaluates to nested
//! arrays, one level per loop frame.

mod error;
mod value;

pub use error::{EvalError, EvalErrorKind, EvalResult};
pub use value::Value;

use std::collections::{HashMap, HashSet};

use indexmap::IndexMap;
use tracing::{debug, instrument};

use crate::error::Result;
use crate::lir::{AccId, Axis, Instruction, LirDeclaration, LirProgram, LoopId, Node, Op, Operand, Register};
use crate::registry::FunctionRegistry;

/// Stack red zone for nested loop bodies
const STACK_RED_ZONE: usize = 128 * 1024;
const STACK_GROW_SIZE: usize = 4 * 1024 * 1024;

/// Evaluate every declaration of `program`, in declaration order
#[instrument(level = "debug", skip_all, fields(declarations = program.declarations.len()))]
pub fn evaluate(
    program: &LirProgram,
    registry: &FunctionRegistry,
    input: &serde_json::Value,
) -> Result<IndexMap<String, Value>> {
    let mut evaluator = Evaluator::new(program, registry, Value::from(input));
    for name in program.declarations.keys() {
        evaluator.declaration(name)?;
    }
    Ok(evaluator.results)
}

/// Evaluates declarations on demand, memoizing each result
pub struct Evaluator<'a> {
    program: &'a LirProgram,
    registry: &'a FunctionRegistry,
    input: Value,
    results: IndexMap<String, Value>,
    in_progress: HashSet<String>,
}

impl<'a> Evaluator<'a> {
    pub fn new(program: &'a LirProgram, registry: &'a FunctionRegistry, input: Value) -> Self {
        Self {
            program,
            registry,
            input,
            results: IndexMap::new(),
            in_progress: HashSet::new(),
        }
    }

    /// Value of declaration `name`, evaluating it first if needed
    pub fn declaration(&mut self, name: &str) -> EvalResult<Value> {
        if let Some(value) = self.results.get(name) {
            return Ok(value.clone());
        }
        let decl = self
            .program
            .get(name)
            .ok_or_else(|| EvalError::undefined_declaration(name))?;
        if !self.in_progress.insert(name.to_string()) {
            return Err(EvalError::unsupported(format!("cyclic reference to `{name}`")));
        }

        let value = self.run(decl);
        self.in_progress.remove(name);
        let value = value?;
        debug!(declaration = name, value = %value, "evaluated");
        self.results.insert(name.to_string(), value.clone());
        Ok(value)
    }

    fn run(&mut self, decl: &LirDeclaration) -> EvalResult<Value> {
        let gamma_loops = decl
            .gamma()
            .map(|g| g.frames.iter().map(|f| f.loop_id).collect())
            .unwrap_or_default();
        let mut frame = Frame {
            registers: HashMap::new(),
            accumulators: HashMap::new(),
            indices: Vec::new(),
            gamma_loops,
            result: None,
        };
        self.body(&decl.body, &mut frame)?;
        frame
            .result
            .ok_or_else(|| EvalError::unsupported(format!("declaration `{}` without a yield", decl.name)))
    }

    fn body(&mut self, nodes: &[Node], frame: &mut Frame) -> EvalResult<()> {
        for node in nodes {
            match node {
                Node::Inst(inst) => self.instruction(inst, frame)?,
                Node::Loop(lp) => {
                    let items = match frame.register(lp.collection)? {
                        Value::Array(items) => items,
                        Value::Nil => Vec::new(),
                        other => return Err(EvalError::type_error("array", other.type_name())),
                    };
                    let vectorized = frame.gamma_loops.contains(&lp.id);
                    if vectorized {
                        let path = frame.indices.clone();
                        let entry = slot(frame.result.get_or_insert(Value::Nil), &path);
                        if !matches!(entry, Value::Array(_)) {
                            *entry = Value::Array(Vec::new());
                        }
                    }
                    for (i, item) in items.into_iter().enumerate() {
                        frame.registers.insert(lp.element, item);
                        frame.registers.insert(lp.index, Value::Int(i as i64));
                        frame.indices.push(i);
                        let outcome = stacker::maybe_grow(STACK_RED_ZONE, STACK_GROW_SIZE, || {
                            self.body(&lp.body, frame)
                        });
                        frame.indices.pop();
                        outcome?;
                    }
                }
            }
        }
        Ok(())
    }

    fn instruction(&mut self, inst: &Instruction, frame: &mut Frame) -> EvalResult<()> {
        let value = match &inst.op {
            Op::Constant { value } => Value::from(value),
            Op::LoadInput { key } => match &self.input {
                Value::Object(fields) => fields
                    .get(key)
                    .cloned()
                    .ok_or_else(|| EvalError::missing_input(key))?,
                other => return Err(EvalError::type_error("object", other.type_name())),
            },
            Op::LoadField { object, key } => match frame.register(*object)? {
                Value::Object(fields) => fields.get(key).cloned().unwrap_or(Value::Nil),
                Value::Nil => Value::Nil,
                other => return Err(EvalError::type_error("object", other.type_name())),
            },
            Op::LoadDeclaration { name, axes } => {
                let target = self.declaration(name)?;
                index_into(target, &frame.indices, axes)?
            }
            Op::KernelCall { function, args } => {
                let args = args
                    .iter()
                    .map(|a| frame.operand(a))
                    .collect::<EvalResult<Vec<_>>>()?;
                self.registry.call(function, &args)?
            }
            Op::Select { cond, on_true, on_false } => {
                if frame.operand(cond)?.is_truthy() {
                    frame.operand(on_true)?
                } else {
                    frame.operand(on_false)?
                }
            }
            Op::DeclareAccumulator { acc, initial } => {
                frame.accumulators.insert(*acc, Value::from(initial));
                return Ok(());
            }
            Op::Accumulate { acc, function, value } => {
                let current = frame.accumulator(*acc)?;
                let next = self.registry.call(function, &[current, frame.operand(value)?])?;
                frame.accumulators.insert(*acc, next);
                return Ok(());
            }
            Op::LoadAccumulator { acc } => frame.accumulator(*acc)?,
            Op::MakeTuple { elements } => Value::Tuple(
                elements
                    .iter()
                    .map(|e| frame.operand(e))
                    .collect::<EvalResult<Vec<_>>>()?,
            ),
            Op::MakeObject { fields } => {
                let mut object = IndexMap::new();
                for (key, value) in fields {
                    object.insert(key.clone(), frame.operand(value)?);
                }
                Value::Object(object)
            }
            Op::TupleGet { tuple, index } => match frame.register(*tuple)? {
                Value::Tuple(items) | Value::Array(items) => items
                    .get(*index)
                    .cloned()
                    .ok_or_else(|| EvalError::index_out_of_bounds(*index as i64, items.len()))?,
                other => return Err(EvalError::type_error("tuple", other.type_name())),
            },
            Op::Yield { value } => {
                let value = frame.register(*value)?;
                let path = frame.indices.clone();
                *slot(frame.result.get_or_insert(Value::Nil), &path) = value;
                return Ok(());
            }
            Op::LoopStart { .. } | Op::LoopEnd { .. } => {
                return Err(EvalError::unsupported(format!("loop marker `{inst}`")));
            }
        };

        match inst.result {
            Some(reg) => {
                frame.registers.insert(reg, value);
                Ok(())
            }
            None => Err(EvalError::unsupported(format!("`{inst}` without a result register"))),
        }
    }
}

struct Frame {
    registers: HashMap<Register, Value>,
    accumulators: HashMap<AccId, Value>,
    /// Iteration index of every open loop, outermost first
    indices: Vec<usize>,
    gamma_loops: HashSet<LoopId>,
    result: Option<Value>,
}

impl Frame {
    fn register(&self, reg: Register) -> EvalResult<Value> {
        self.registers
            .get(&reg)
            .cloned()
            .ok_or_else(|| EvalError::undefined_register(reg))
    }

    fn accumulator(&self, acc: AccId) -> EvalResult<Value> {
        self.accumulators
            .get(&acc)
            .cloned()
            .ok_or_else(|| EvalError::undefined_register(acc))
    }

    fn operand(&self, operand: &Operand) -> EvalResult<Value> {
        match operand {
            Operand::Reg(reg) => self.register(*reg),
            Operand::Imm(lit) => Ok(Value::from(lit)),
        }
    }
}

/// Element of a vectorized result at `path`, growing arrays as needed
fn slot<'v>(root: &'v mut Value, path: &[usize]) -> &'v mut Value {
    let Some((&first, rest)) = path.split_first() else {
        return root;
    };
    match root {
        Value::Array(items) => {
            if items.len() <= first {
                items.resize(first + 1, Value::Nil);
            }
            slot(&mut items[first], rest)
        }
        other => {
            *other = Value::Array(Vec::new());
            slot(other, path)
        }
    }
}

/// Element of a referenced declaration at the caller's matching loop indices
fn index_into(mut value: Value, indices: &[usize], axes: &[Axis]) -> EvalResult<Value> {
    if indices.len() < axes.len() {
        return Err(EvalError::unsupported(format!(
            "reference over {} axes from {} open loops",
            axes.len(),
            indices.len()
        )));
    }
    for &i in &indices[..axes.len()] {
        value = match value {
            Value::Array(mut items) => {
                if i >= items.len() {
                    return Err(EvalError::index_out_of_bounds(i as i64, items.len()));
                }
                items.swap_remove(i)
            }
            other => return Err(EvalError::type_error("array", other.type_name())),
        };
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lir::DType;
    use crate::lower::lower_schema;
    use crate::scope::{ScopedExpr, ScopedSchema};
    use serde_json::json;

    fn run(schema: &ScopedSchema, input: serde_json::Value) -> IndexMap<String, Value> {
        let registry = FunctionRegistry::with_builtins();
        let program = lower_schema(schema, &registry).unwrap();
        evaluate(&program, &registry, &input).unwrap()
    }

    fn items_schema() -> ScopedSchema {
        ScopedSchema::new().plan("order", &[("items", &["items"])])
    }

    #[test]
    fn test_eval_sum() {
        let price = ScopedExpr::input(DType::Integer, &["items"], &["price"]);
        let schema = items_schema().declare(
            "total",
            ScopedExpr::reduce(DType::Integer, &[], "agg.sum", &["items"], price),
        );
        let results = run(
            &schema,
            json!({"items": [{"price": 10}, {"price": 20}, {"price": 30}]}),
        );
        assert_eq!(results["total"], Value::Int(60));
    }

    #[test]
    fn test_eval_vectorized() {
        let price = ScopedExpr::input(DType::Integer, &["items"], &["price"]);
        let doubled = ScopedExpr::call(
            DType::Integer,
            &["items"],
            "core.mul",
            vec![price, ScopedExpr::literal(crate::lir::Literal::Int(2))],
        );
        let schema = items_schema().declare("doubled", doubled);
        let results = run(&schema, json!({"items": [{"price": 1}, {"price": 4}]}));
        assert_eq!(results["doubled"], Value::Array(vec![Value::Int(2), Value::Int(8)]));
    }

    #[test]
    fn test_eval_empty_collection() {
        let price = ScopedExpr::input(DType::Integer, &["items"], &["price"]);
        let schema = items_schema()
            .declare("prices", price.clone())
            .declare("top", ScopedExpr::reduce(DType::Integer, &[], "agg.max", &["items"], price));
        let results = run(&schema, json!({"items": []}));
        assert_eq!(results["prices"], Value::Array(vec![]));
        assert_eq!(results["top"], Value::Nil);
    }

    #[test]
    fn test_eval_reference_indexes_by_loop() {
        let price = ScopedExpr::input(DType::Integer, &["items"], &["price"]);
        let one = ScopedExpr::literal(crate::lir::Literal::Int(1));
        let schema = items_schema().declare("prices", price).declare(
            "bumped",
            ScopedExpr::call(
                DType::Integer,
                &["items"],
                "core.add",
                vec![ScopedExpr::decl_ref(DType::Integer, &["items"], "prices"), one],
            ),
        );
        let results = run(&schema, json!({"items": [{"price": 5}, {"price": 7}]}));
        assert_eq!(results["bumped"], Value::Array(vec![Value::Int(6), Value::Int(8)]));
    }

    #[test]
    fn test_eval_missing_input() {
        let schema = ScopedSchema::new().declare("x", ScopedExpr::input(DType::Integer, &[], &["x"]));
        let registry = FunctionRegistry::with_builtins();
        let program = lower_schema(&schema, &registry).unwrap();
        let err = evaluate(&program, &registry, &json!({})).unwrap_err();
        assert!(err.to_string().contains("input has no field `x`"));
    }
}
