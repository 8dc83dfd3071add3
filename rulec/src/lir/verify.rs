//! Structural invariant checks for LIR
//!
//! - `LoopStart`/`LoopEnd` balance and nesting (flat form)
//! - definition before use, including loop-bound registers
//! - single definition per register
//! - accumulators declared before they are touched
//! - exactly one `Yield`, and nothing but loop ends after it

use std::collections::{HashMap, HashSet};

use super::{AccId, Instruction, LirDeclaration, LirProgram, Node, Op, Register, resolve_rename};
use crate::error::{CompileError, Result};

/// Verify every declaration of a program
pub fn verify_program(program: &LirProgram) -> Result<()> {
    for decl in program.declarations.values() {
        verify_declaration(decl)?;
    }
    Ok(())
}

/// Verify one declaration in tree form
pub fn verify_declaration(decl: &LirDeclaration) -> Result<()> {
    let mut checker = Checker {
        declaration: &decl.name,
        scopes: vec![HashSet::new()],
        accumulators: vec![HashSet::new()],
        defined_once: HashSet::new(),
        yields: 0,
    };
    checker.body(&decl.body)?;

    if checker.yields != 1 {
        return Err(CompileError::malformed(
            &decl.name,
            format!("expected exactly one yield, found {}", checker.yields),
        ));
    }
    verify_flat(&decl.name, &super::flatten(&decl.body))
}

struct Checker<'a> {
    declaration: &'a str,
    scopes: Vec<HashSet<Register>>,
    accumulators: Vec<HashSet<AccId>>,
    defined_once: HashSet<Register>,
    yields: usize,
}

impl Checker<'_> {
    fn visible(&self, reg: Register) -> bool {
        self.scopes.iter().any(|s| s.contains(&reg))
    }

    fn acc_visible(&self, acc: AccId) -> bool {
        self.accumulators.iter().any(|s| s.contains(&acc))
    }

    fn define(&mut self, reg: Register) -> Result<()> {
        if !self.defined_once.insert(reg) {
            return Err(CompileError::consistency_at(
                self.declaration,
                format!("register {reg} defined more than once"),
                reg,
            ));
        }
        if let Some(scope) = self.scopes.last_mut() {
            scope.insert(reg);
        }
        Ok(())
    }

    fn body(&mut self, nodes: &[Node]) -> Result<()> {
        for node in nodes {
            match node {
                Node::Inst(inst) => self.instruction(inst)?,
                Node::Loop(lp) => {
                    if !self.visible(lp.collection) {
                        return Err(CompileError::consistency_at(
                            self.declaration,
                            format!("loop {} iterates {} before it is defined", lp.id, lp.collection),
                            lp.collection,
                        ));
                    }
                    self.scopes.push(HashSet::new());
                    self.accumulators.push(HashSet::new());
                    self.define(lp.element)?;
                    self.define(lp.index)?;
                    self.body(&lp.body)?;
                    self.accumulators.pop();
                    self.scopes.pop();
                }
            }
        }
        Ok(())
    }

    fn instruction(&mut self, inst: &Instruction) -> Result<()> {
        let mut undefined = None;
        inst.for_each_input(|r| {
            if undefined.is_none() && !self.visible(r) {
                undefined = Some(r);
            }
        });
        if let Some(reg) = undefined {
            return Err(CompileError::consistency_at(
                self.declaration,
                format!("`{inst}` reads {reg} before it is defined"),
                reg,
            ));
        }

        match &inst.op {
            Op::DeclareAccumulator { acc, .. } => {
                if let Some(scope) = self.accumulators.last_mut() {
                    scope.insert(*acc);
                }
            }
            Op::Accumulate { acc, .. } | Op::LoadAccumulator { acc } => {
                if !self.acc_visible(*acc) {
                    return Err(CompileError::consistency(
                        self.declaration,
                        format!("`{inst}` uses undeclared accumulator {acc}"),
                    ));
                }
            }
            Op::Yield { .. } => self.yields += 1,
            Op::LoopStart { .. } | Op::LoopEnd { .. } => {
                return Err(CompileError::malformed(
                    self.declaration,
                    format!("loop marker `{inst}` inside structured body"),
                ));
            }
            _ => {}
        }

        if let Some(result) = inst.result {
            self.define(result)?;
        }
        Ok(())
    }
}

/// Linear balance scan over the flat form
///
/// Depth never goes negative, every `LoopEnd` closes the innermost open
/// loop, and only loop ends may follow the `Yield`.
pub fn verify_flat(declaration: &str, flat: &[Instruction]) -> Result<()> {
    let mut open = Vec::new();
    let mut yielded_at = None;

    for (idx, inst) in flat.iter().enumerate() {
        match &inst.op {
            Op::LoopStart { id, .. } => open.push(*id),
            Op::LoopEnd { id } => match open.pop() {
                Some(top) if top == *id => {}
                Some(top) => {
                    return Err(CompileError::malformed(
                        declaration,
                        format!("loop_end {id} at index {idx} crosses open loop {top}"),
                    ));
                }
                None => {
                    return Err(CompileError::malformed(
                        declaration,
                        format!("loop_end {id} at index {idx} has no open loop"),
                    ));
                }
            },
            Op::Yield { .. } => yielded_at = Some(idx),
            _ => {}
        }
        if let Some(y) = yielded_at {
            if idx > y && !matches!(inst.op, Op::LoopEnd { .. }) {
                return Err(CompileError::malformed(
                    declaration,
                    format!("`{inst}` at index {idx} follows the yield at index {y}"),
                ));
            }
        }
    }

    if let Some(id) = open.last() {
        return Err(CompileError::malformed(declaration, format!("loop {id} is never closed")));
    }
    if yielded_at.is_none() {
        return Err(CompileError::malformed(declaration, "missing yield"));
    }
    Ok(())
}

/// A rename table must never lead a register back to itself
pub fn check_acyclic_renames(declaration: &str, renames: &HashMap<Register, Register>) -> Result<()> {
    for &from in renames.keys() {
        if renames.get(&from) == Some(&from) || resolve_rename(renames, from) == from {
            return Err(CompileError::consistency_at(
                declaration,
                format!("rename of {from} is cyclic"),
                from,
            ));
        }
    }
    Ok(())
}
