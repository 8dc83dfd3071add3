//! Loop-oriented Intermediate Representation (LIR)
//!
//! LIR sits between the scope-annotated expression tree and the backend
//! binder. Every declaration becomes a linear instruction stream built
//! from loops, registers and accumulators.
//!
//! # Two shapes of the same stream
//!
//! - **Flat**: a `Vec<Instruction>` where loops are delimited by
//!   `LoopStart`/`LoopEnd` markers. This is what the printer shows and what
//!   the binder consumes.
//! - **Tree**: a `Vec<Node>` where [`Node::Loop`] owns its body. Lowering
//!   builds this shape directly and every optimization pass works on it, so
//!   no pass ever searches for a matching `LoopEnd`.
//!
//! [`flatten`] and [`structure`] convert between the two.

mod verify;

pub use verify::{check_acyclic_renames, verify_declaration, verify_flat, verify_program};

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::hash::{Hash, Hasher};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::{CompileError, Result};
use crate::span::Span;

// ============================================================================
// Identifiers
// ============================================================================

/// Declaration-local value identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Register(pub u32);

/// Loop identifier (shares the register counter, separate namespace)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LoopId(pub u32);

/// Accumulator name (shares the register counter, separate namespace)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccId(pub u32);

impl fmt::Display for Register {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%{}", self.0)
    }
}

impl fmt::Display for LoopId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "L{}", self.0)
    }
}

impl fmt::Display for AccId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "acc{}", self.0)
    }
}

/// Monotonic generator for registers, loop ids and accumulator names
///
/// One generator is threaded explicitly through whatever needs to mint
/// identifiers for a declaration (lowering, inlining). There is no ambient
/// counter.
#[derive(Debug, Clone, Default)]
pub struct IdGenerator {
    next: u32,
}

impl IdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Generator whose first id is `next`
    pub fn starting_at(next: u32) -> Self {
        Self { next }
    }

    /// Generator that cannot collide with any id already used in `body`
    pub fn after(body: &[Node]) -> Self {
        let mut max: Option<u32> = None;
        let mut bump = |n: u32| max = Some(max.map_or(n, |m| m.max(n)));
        walk_nodes(body, &mut |node| match node {
            Node::Inst(inst) => {
                if let Some(r) = inst.result {
                    bump(r.0);
                }
                inst.for_each_input(|r| bump(r.0));
                if let Some(acc) = inst.op.accumulator() {
                    bump(acc.0);
                }
            }
            Node::Loop(lp) => {
                bump(lp.id.0);
                bump(lp.collection.0);
                bump(lp.element.0);
                bump(lp.index.0);
            }
        });
        Self::starting_at(max.map_or(0, |m| m + 1))
    }

    fn bump(&mut self) -> u32 {
        let id = self.next;
        self.next += 1;
        id
    }

    pub fn register(&mut self) -> Register {
        Register(self.bump())
    }

    pub fn loop_id(&mut self) -> LoopId {
        LoopId(self.bump())
    }

    pub fn accumulator(&mut self) -> AccId {
        AccId(self.bump())
    }
}

// ============================================================================
// Stamps
// ============================================================================

/// One named iteration dimension
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Axis(pub String);

impl Axis {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn name(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Axis {
    fn from(name: &str) -> Self {
        Axis::new(name)
    }
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, ":{}", self.0)
    }
}

/// Value types as seen by the core
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DType {
    Integer,
    Float,
    Boolean,
    String,
    Nil,
    Any,
    Object,
    Array(Box<DType>),
    Tuple(Vec<DType>),
}

impl DType {
    pub fn array_of(element: DType) -> Self {
        DType::Array(Box::new(element))
    }

    /// Element type when this is an array
    pub fn element(&self) -> Option<&DType> {
        match self {
            DType::Array(inner) => Some(inner),
            _ => None,
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DType::Integer => write!(f, "integer"),
            DType::Float => write!(f, "float"),
            DType::Boolean => write!(f, "boolean"),
            DType::String => write!(f, "string"),
            DType::Nil => write!(f, "nil"),
            DType::Any => write!(f, "any"),
            DType::Object => write!(f, "object"),
            DType::Array(inner) => write!(f, "array<{inner}>"),
            DType::Tuple(elems) => {
                write!(f, "tuple<")?;
                for (i, e) in elems.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{e}")?;
                }
                write!(f, ">")
            }
        }
    }
}

/// Result metadata: dtype plus the axes the value varies over
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Stamp {
    pub dtype: DType,
    pub axes: Vec<Axis>,
}

impl Stamp {
    pub fn new(dtype: DType, axes: Vec<Axis>) -> Self {
        Self { dtype, axes }
    }

    pub fn scalar(dtype: DType) -> Self {
        Self { dtype, axes: Vec::new() }
    }
}

impl fmt::Display for Stamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [", self.dtype)?;
        for (i, axis) in self.axes.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{axis}")?;
        }
        write!(f, "]")
    }
}

// ============================================================================
// Literals and operands
// ============================================================================

/// Compile-time literal value
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Literal {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Array(Vec<Literal>),
    Nil,
}

impl Literal {
    pub fn dtype(&self) -> DType {
        match self {
            Literal::Bool(_) => DType::Boolean,
            Literal::Int(_) => DType::Integer,
            Literal::Float(_) => DType::Float,
            Literal::Str(_) => DType::String,
            Literal::Nil => DType::Nil,
            Literal::Array(items) => {
                let element = items.first().map_or(DType::Any, Literal::dtype);
                if items.iter().all(|i| i.dtype() == element) {
                    DType::array_of(element)
                } else {
                    DType::array_of(DType::Any)
                }
            }
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Literal::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

// Floats compare by bit pattern so literals can key CSE tables and a NaN
// constant never makes a pass report a change forever.
impl PartialEq for Literal {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Literal::Bool(a), Literal::Bool(b)) => a == b,
            (Literal::Int(a), Literal::Int(b)) => a == b,
            (Literal::Float(a), Literal::Float(b)) => a.to_bits() == b.to_bits(),
            (Literal::Str(a), Literal::Str(b)) => a == b,
            (Literal::Array(a), Literal::Array(b)) => a == b,
            (Literal::Nil, Literal::Nil) => true,
            _ => false,
        }
    }
}

impl Eq for Literal {}

impl Hash for Literal {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Literal::Bool(b) => b.hash(state),
            Literal::Int(n) => n.hash(state),
            Literal::Float(x) => x.to_bits().hash(state),
            Literal::Str(s) => s.hash(state),
            Literal::Array(items) => items.hash(state),
            Literal::Nil => {}
        }
    }
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Literal::Bool(b) => write!(f, "{b}"),
            Literal::Int(n) => write!(f, "{n}"),
            Literal::Float(x) => write!(f, "{x:?}"),
            Literal::Str(s) => write!(f, "{s:?}"),
            Literal::Nil => write!(f, "nil"),
            Literal::Array(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
        }
    }
}

/// A value position: either a register or an inline immediate
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Operand {
    Reg(Register),
    Imm(Literal),
}

impl From<Register> for Operand {
    fn from(r: Register) -> Self {
        Operand::Reg(r)
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Reg(r) => write!(f, "{r}"),
            Operand::Imm(lit) => write!(f, "{lit}"),
        }
    }
}

// ============================================================================
// Instructions
// ============================================================================

/// Opcode tag of an [`Op`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    Constant,
    LoadInput,
    LoadDeclaration,
    LoadField,
    LoopStart,
    LoopEnd,
    KernelCall,
    Select,
    DeclareAccumulator,
    Accumulate,
    LoadAccumulator,
    MakeTuple,
    MakeObject,
    TupleGet,
    Yield,
}

/// Operation performed by an instruction
///
/// Structural positions (loop collections, field owners, tuple sources and
/// the yielded value) are plain registers; value positions are [`Operand`]s
/// and may hold immediates after constant propagation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Op {
    /// `%dest = const value`
    Constant { value: Literal },
    /// `%dest = load_input key`: top-level field of the input record
    LoadInput { key: String },
    /// `%dest = load_field %object key`
    LoadField { object: Register, key: String },
    /// `%dest = load_decl name`, tagged with the target's axes
    LoadDeclaration { name: String, axes: Vec<Axis> },
    /// Opens a loop over `collection`, binding `element` and `index`
    LoopStart {
        id: LoopId,
        axis: Axis,
        collection: Register,
        element: Register,
        index: Register,
    },
    /// Closes the loop `id`
    LoopEnd { id: LoopId },
    /// `%dest = call function(args...)`
    KernelCall { function: String, args: Vec<Operand> },
    /// `%dest = select cond, on_true, on_false`
    Select {
        cond: Operand,
        on_true: Operand,
        on_false: Operand,
    },
    /// `declare acc = initial`, placed before the loop it reduces over
    DeclareAccumulator { acc: AccId, initial: Literal },
    /// `accumulate acc function value`, placed inside the loop
    Accumulate {
        acc: AccId,
        function: String,
        value: Operand,
    },
    /// `%dest = load_acc acc`, placed after the loop
    LoadAccumulator { acc: AccId },
    /// `%dest = tuple(elements...)`
    MakeTuple { elements: Vec<Operand> },
    /// `%dest = object(key: value, ...)`
    MakeObject { fields: Vec<(String, Operand)> },
    /// `%dest = tuple_get %tuple.index`
    TupleGet { tuple: Register, index: usize },
    /// Terminal result of the declaration
    Yield { value: Register },
}

impl Op {
    pub fn opcode(&self) -> Opcode {
        match self {
            Op::Constant { .. } => Opcode::Constant,
            Op::LoadInput { .. } => Opcode::LoadInput,
            Op::LoadField { .. } => Opcode::LoadField,
            Op::LoadDeclaration { .. } => Opcode::LoadDeclaration,
            Op::LoopStart { .. } => Opcode::LoopStart,
            Op::LoopEnd { .. } => Opcode::LoopEnd,
            Op::KernelCall { .. } => Opcode::KernelCall,
            Op::Select { .. } => Opcode::Select,
            Op::DeclareAccumulator { .. } => Opcode::DeclareAccumulator,
            Op::Accumulate { .. } => Opcode::Accumulate,
            Op::LoadAccumulator { .. } => Opcode::LoadAccumulator,
            Op::MakeTuple { .. } => Opcode::MakeTuple,
            Op::MakeObject { .. } => Opcode::MakeObject,
            Op::TupleGet { .. } => Opcode::TupleGet,
            Op::Yield { .. } => Opcode::Yield,
        }
    }

    /// Accumulator touched by this op, if any
    pub fn accumulator(&self) -> Option<AccId> {
        match self {
            Op::DeclareAccumulator { acc, .. }
            | Op::Accumulate { acc, .. }
            | Op::LoadAccumulator { acc } => Some(*acc),
            _ => None,
        }
    }

    /// Side effects that do not depend on the function registry
    pub fn has_intrinsic_side_effect(&self) -> bool {
        matches!(
            self,
            Op::LoopStart { .. }
                | Op::LoopEnd { .. }
                | Op::DeclareAccumulator { .. }
                | Op::Accumulate { .. }
                | Op::Yield { .. }
        )
    }
}

/// A single LIR instruction
///
/// Instructions are treated as immutable values: passes build new ones
/// instead of patching them in place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instruction {
    pub result: Option<Register>,
    pub stamp: Option<Stamp>,
    pub op: Op,
    pub span: Option<Span>,
}

impl Instruction {
    /// Instruction without a result register
    pub fn effect(op: Op) -> Self {
        Self {
            result: None,
            stamp: None,
            op,
            span: None,
        }
    }

    /// Instruction defining `result`
    pub fn define(result: Register, stamp: Stamp, op: Op) -> Self {
        Self {
            result: Some(result),
            stamp: Some(stamp),
            op,
            span: None,
        }
    }

    pub fn at(mut self, span: Option<Span>) -> Self {
        self.span = span;
        self
    }

    pub fn opcode(&self) -> Opcode {
        self.op.opcode()
    }

    /// Visit every register this instruction reads
    pub fn for_each_input(&self, mut f: impl FnMut(Register)) {
        let mut operand = |op: &Operand| {
            if let Operand::Reg(r) = op {
                f(*r);
            }
        };
        match &self.op {
            Op::Constant { .. }
            | Op::LoadInput { .. }
            | Op::LoadDeclaration { .. }
            | Op::LoopEnd { .. }
            | Op::DeclareAccumulator { .. }
            | Op::LoadAccumulator { .. } => {}
            Op::LoadField { object, .. } => operand(&Operand::Reg(*object)),
            Op::LoopStart { collection, .. } => operand(&Operand::Reg(*collection)),
            Op::KernelCall { args, .. } => args.iter().for_each(&mut operand),
            Op::Select { cond, on_true, on_false } => {
                operand(cond);
                operand(on_true);
                operand(on_false);
            }
            Op::Accumulate { value, .. } => operand(value),
            Op::MakeTuple { elements } => elements.iter().for_each(&mut operand),
            Op::MakeObject { fields } => fields.iter().for_each(|(_, v)| operand(v)),
            Op::TupleGet { tuple, .. } => operand(&Operand::Reg(*tuple)),
            Op::Yield { value } => operand(&Operand::Reg(*value)),
        }
    }

    /// Registers read by this instruction, in operand order
    pub fn inputs(&self) -> Vec<Register> {
        let mut regs = Vec::new();
        self.for_each_input(|r| regs.push(r));
        regs
    }

    /// Rewrite every register this instruction reads
    pub fn map_inputs(&mut self, mut f: impl FnMut(Register) -> Register) {
        let mut operand = |op: &mut Operand| {
            if let Operand::Reg(r) = op {
                *r = f(*r);
            }
        };
        match &mut self.op {
            Op::Constant { .. }
            | Op::LoadInput { .. }
            | Op::LoadDeclaration { .. }
            | Op::LoopEnd { .. }
            | Op::DeclareAccumulator { .. }
            | Op::LoadAccumulator { .. } => {}
            Op::LoadField { object, .. } => {
                let mut wrapped = Operand::Reg(*object);
                operand(&mut wrapped);
                if let Operand::Reg(r) = wrapped {
                    *object = r;
                }
            }
            Op::LoopStart { collection, .. } => {
                let mut wrapped = Operand::Reg(*collection);
                operand(&mut wrapped);
                if let Operand::Reg(r) = wrapped {
                    *collection = r;
                }
            }
            Op::KernelCall { args, .. } => args.iter_mut().for_each(&mut operand),
            Op::Select { cond, on_true, on_false } => {
                operand(cond);
                operand(on_true);
                operand(on_false);
            }
            Op::Accumulate { value, .. } => operand(value),
            Op::MakeTuple { elements } => elements.iter_mut().for_each(&mut operand),
            Op::MakeObject { fields } => fields.iter_mut().for_each(|(_, v)| operand(v)),
            Op::TupleGet { tuple, .. } => {
                let mut wrapped = Operand::Reg(*tuple);
                operand(&mut wrapped);
                if let Operand::Reg(r) = wrapped {
                    *tuple = r;
                }
            }
            Op::Yield { value } => {
                let mut wrapped = Operand::Reg(*value);
                operand(&mut wrapped);
                if let Operand::Reg(r) = wrapped {
                    *value = r;
                }
            }
        }
    }

    /// Rewrite inputs through a rename table
    pub fn rename_inputs(&mut self, renames: &HashMap<Register, Register>) {
        if renames.is_empty() {
            return;
        }
        self.map_inputs(|r| resolve_rename(renames, r));
    }

    /// Value positions that may carry immediates
    pub fn value_operands_mut(&mut self) -> Vec<&mut Operand> {
        match &mut self.op {
            Op::KernelCall { args, .. } => args.iter_mut().collect(),
            Op::Select { cond, on_true, on_false } => vec![cond, on_true, on_false],
            Op::Accumulate { value, .. } => vec![value],
            Op::MakeTuple { elements } => elements.iter_mut().collect(),
            Op::MakeObject { fields } => fields.iter_mut().map(|(_, v)| v).collect(),
            _ => Vec::new(),
        }
    }
}

/// Follow a rename chain to its canonical register
///
/// Chains are at most as long as the table; a longer walk means the table
/// is cyclic and the register is returned unchanged.
pub fn resolve_rename(renames: &HashMap<Register, Register>, mut reg: Register) -> Register {
    let start = reg;
    for _ in 0..=renames.len() {
        match renames.get(&reg) {
            Some(next) if *next != reg => reg = *next,
            _ => return reg,
        }
    }
    start
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(result) = self.result {
            write!(f, "{result} = ")?;
        }
        match &self.op {
            Op::Constant { value } => write!(f, "const {value}")?,
            Op::LoadInput { key } => write!(f, "load_input {key:?}")?,
            Op::LoadField { object, key } => write!(f, "load_field {object} {key:?}")?,
            Op::LoadDeclaration { name, axes } => {
                write!(f, "load_decl {name}")?;
                if !axes.is_empty() {
                    let axes: Vec<String> = axes.iter().map(|a| a.to_string()).collect();
                    write!(f, " @[{}]", axes.join(", "))?;
                }
            }
            Op::LoopStart { id, axis, collection, element, index } => {
                write!(f, "loop_start {id} {axis} {collection} -> ({element}, {index})")?
            }
            Op::LoopEnd { id } => write!(f, "loop_end {id}")?,
            Op::KernelCall { function, args } => {
                let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
                write!(f, "call {function}({})", args.join(", "))?
            }
            Op::Select { cond, on_true, on_false } => {
                write!(f, "select {cond}, {on_true}, {on_false}")?
            }
            Op::DeclareAccumulator { acc, initial } => write!(f, "declare {acc} = {initial}")?,
            Op::Accumulate { acc, function, value } => {
                write!(f, "accumulate {acc} {function} {value}")?
            }
            Op::LoadAccumulator { acc } => write!(f, "load_acc {acc}")?,
            Op::MakeTuple { elements } => {
                let elems: Vec<String> = elements.iter().map(|e| e.to_string()).collect();
                write!(f, "tuple({})", elems.join(", "))?
            }
            Op::MakeObject { fields } => {
                let fields: Vec<String> =
                    fields.iter().map(|(k, v)| format!("{k}: {v}")).collect();
                write!(f, "object({})", fields.join(", "))?
            }
            Op::TupleGet { tuple, index } => write!(f, "tuple_get {tuple}.{index}")?,
            Op::Yield { value } => write!(f, "yield {value}")?,
        }
        if let (Some(_), Some(stamp)) = (self.result, &self.stamp) {
            write!(f, " : {stamp}")?;
        }
        Ok(())
    }
}

// ============================================================================
// Tree form
// ============================================================================

/// A loop frame with its body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Loop {
    pub id: LoopId,
    pub axis: Axis,
    /// Register holding the iterated collection
    pub collection: Register,
    pub element: Register,
    pub index: Register,
    pub body: Vec<Node>,
    pub span: Option<Span>,
}

impl Loop {
    fn start_marker(&self) -> Instruction {
        Instruction::effect(Op::LoopStart {
            id: self.id,
            axis: self.axis.clone(),
            collection: self.collection,
            element: self.element,
            index: self.index,
        })
        .at(self.span)
    }
}

/// One element of a structured instruction stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Inst(Instruction),
    Loop(Loop),
}

impl Node {
    pub fn as_inst(&self) -> Option<&Instruction> {
        match self {
            Node::Inst(inst) => Some(inst),
            Node::Loop(_) => None,
        }
    }
}

/// Pre-order walk over every node, descending into loop bodies
pub fn walk_nodes(nodes: &[Node], f: &mut impl FnMut(&Node)) {
    for node in nodes {
        f(node);
        if let Node::Loop(lp) = node {
            walk_nodes(&lp.body, f);
        }
    }
}

/// Pre-order walk over every instruction, descending into loop bodies
pub fn walk_instructions(nodes: &[Node], f: &mut impl FnMut(&Instruction)) {
    walk_nodes(nodes, &mut |node| {
        if let Node::Inst(inst) = node {
            f(inst);
        }
    });
}

/// Every register defined anywhere in `nodes`, loop-bound registers included
pub fn defined_registers(nodes: &[Node]) -> HashSet<Register> {
    let mut defined = HashSet::new();
    walk_nodes(nodes, &mut |node| match node {
        Node::Inst(inst) => {
            if let Some(r) = inst.result {
                defined.insert(r);
            }
        }
        Node::Loop(lp) => {
            defined.insert(lp.element);
            defined.insert(lp.index);
        }
    });
    defined
}

/// Number of instructions in the flattened form
pub fn instruction_count(nodes: &[Node]) -> usize {
    nodes
        .iter()
        .map(|node| match node {
            Node::Inst(_) => 1,
            Node::Loop(lp) => 2 + instruction_count(&lp.body),
        })
        .sum()
}

/// Tree form to flat `LoopStart`/`LoopEnd` form
pub fn flatten(nodes: &[Node]) -> Vec<Instruction> {
    let mut out = Vec::with_capacity(instruction_count(nodes));
    flatten_into(nodes, &mut out);
    out
}

fn flatten_into(nodes: &[Node], out: &mut Vec<Instruction>) {
    for node in nodes {
        match node {
            Node::Inst(inst) => out.push(inst.clone()),
            Node::Loop(lp) => {
                out.push(lp.start_marker());
                flatten_into(&lp.body, out);
                out.push(Instruction::effect(Op::LoopEnd { id: lp.id }).at(lp.span));
            }
        }
    }
}

/// Flat form to tree form
///
/// Fails on a `LoopEnd` without an open loop, on crossing loops and on a
/// loop that is never closed.
pub fn structure(declaration: &str, flat: Vec<Instruction>) -> Result<Vec<Node>> {
    let mut stack: Vec<(Loop, usize)> = Vec::new();
    let mut top: Vec<Node> = Vec::new();

    for (idx, inst) in flat.into_iter().enumerate() {
        match inst.op {
            Op::LoopStart { id, axis, collection, element, index } => {
                let lp = Loop {
                    id,
                    axis,
                    collection,
                    element,
                    index,
                    body: Vec::new(),
                    span: inst.span,
                };
                stack.push((lp, idx));
            }
            Op::LoopEnd { id } => {
                let Some((lp, _)) = stack.pop() else {
                    return Err(CompileError::malformed(
                        declaration,
                        format!("loop_end {id} at index {idx} has no open loop"),
                    ));
                };
                if lp.id != id {
                    return Err(CompileError::malformed(
                        declaration,
                        format!("loop_end {id} at index {idx} crosses open loop {}", lp.id),
                    ));
                }
                match stack.last_mut() {
                    Some((parent, _)) => parent.body.push(Node::Loop(lp)),
                    None => top.push(Node::Loop(lp)),
                }
            }
            _ => match stack.last_mut() {
                Some((parent, _)) => parent.body.push(Node::Inst(inst)),
                None => top.push(Node::Inst(inst)),
            },
        }
    }

    if let Some((lp, idx)) = stack.pop() {
        return Err(CompileError::malformed(
            declaration,
            format!("loop_start {} at index {idx} is never closed", lp.id),
        ));
    }
    Ok(top)
}

// ============================================================================
// Declarations and programs
// ============================================================================

/// A lowered declaration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LirDeclaration {
    pub name: String,
    /// Axes of the declaration's result
    pub axes: Vec<Axis>,
    pub dtype: DType,
    pub body: Vec<Node>,
}

impl LirDeclaration {
    /// Gamma: the loop frames open at the terminal `Yield`
    pub fn gamma(&self) -> Option<Gamma> {
        fn search(nodes: &[Node], frames: &mut Vec<GammaFrame>) -> Option<Register> {
            for node in nodes {
                match node {
                    Node::Inst(Instruction { op: Op::Yield { value }, .. }) => return Some(*value),
                    Node::Inst(_) => {}
                    Node::Loop(lp) => {
                        frames.push(GammaFrame {
                            loop_id: lp.id,
                            axis: lp.axis.clone(),
                            element: lp.element,
                            index: lp.index,
                        });
                        if let Some(value) = search(&lp.body, frames) {
                            return Some(value);
                        }
                        frames.pop();
                    }
                }
            }
            None
        }

        let mut frames = Vec::new();
        search(&self.body, &mut frames).map(|value| Gamma { frames, value })
    }
}

/// One loop frame open at a declaration's yield
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GammaFrame {
    pub loop_id: LoopId,
    pub axis: Axis,
    pub element: Register,
    pub index: Register,
}

/// Shape of a declaration's result: frames open at its yield
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Gamma {
    pub frames: Vec<GammaFrame>,
    /// Register the declaration yields
    pub value: Register,
}

impl Gamma {
    pub fn axes(&self) -> Vec<Axis> {
        self.frames.iter().map(|f| f.axis.clone()).collect()
    }
}

/// All lowered declarations of one schema, in declaration order
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LirProgram {
    pub declarations: IndexMap<String, LirDeclaration>,
}

impl LirProgram {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, decl: LirDeclaration) {
        self.declarations.insert(decl.name.clone(), decl);
    }

    pub fn get(&self, name: &str) -> Option<&LirDeclaration> {
        self.declarations.get(name)
    }

    pub fn instruction_count(&self) -> usize {
        self.declarations
            .values()
            .map(|d| instruction_count(&d.body))
            .sum()
    }
}

// ============================================================================
// LIR Text Formatting
// ============================================================================

/// Format a whole program
pub fn format_lir(program: &LirProgram) -> String {
    let mut output = String::new();
    for (i, decl) in program.declarations.values().enumerate() {
        if i > 0 {
            output.push('\n');
        }
        output.push_str(&format_declaration(decl));
    }
    output
}

/// Format one declaration in flat form, indenting loop bodies
pub fn format_declaration(decl: &LirDeclaration) -> String {
    let mut out = format!("decl {} : {} {{\n", decl.name, Stamp::new(decl.dtype.clone(), decl.axes.clone()));
    let mut depth = 1usize;
    for inst in flatten(&decl.body) {
        if matches!(inst.op, Op::LoopEnd { .. }) {
            depth = depth.saturating_sub(1);
        }
        out.push_str(&"  ".repeat(depth));
        out.push_str(&inst.to_string());
        out.push('\n');
        if matches!(inst.op, Op::LoopStart { .. }) {
            depth += 1;
        }
    }
    out.push_str("}\n");
    out
}
