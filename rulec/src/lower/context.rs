//! Loop-frame environment used while lowering one declaration
//!
//! The emitter builds the tree form directly: one open body per open
//! frame, plus a memo table per depth for repeated path loads. Closing a
//! frame wraps its body into a [`Node::Loop`] and appends it to the parent.

use std::collections::HashMap;

use crate::lir::{
    Axis, IdGenerator, Instruction, Loop, LoopId, Node, Op, Register, Stamp,
};
use crate::span::Span;

/// One open loop
#[derive(Debug, Clone)]
pub(super) struct Frame {
    pub id: LoopId,
    pub axis: Axis,
    pub collection: Register,
    pub element: Register,
    pub index: Register,
    pub span: Option<Span>,
}

/// Load of `key` from the input root (`None`) or from an object register
type PathKey = (Option<Register>, String);

pub(super) struct Emitter {
    pub ids: IdGenerator,
    frames: Vec<Frame>,
    /// `bodies[0]` is the top level, `bodies[d]` the body of `frames[d - 1]`
    bodies: Vec<Vec<Node>>,
    memo: Vec<HashMap<PathKey, Register>>,
}

impl Emitter {
    pub fn new() -> Self {
        Self {
            ids: IdGenerator::new(),
            frames: Vec::new(),
            bodies: vec![Vec::new()],
            memo: vec![HashMap::new()],
        }
    }

    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    pub fn open_axes(&self) -> Vec<Axis> {
        self.frames.iter().map(|f| f.axis.clone()).collect()
    }

    /// True when `axes` is a prefix of the open loop nest
    pub fn is_open_prefix(&self, axes: &[Axis]) -> bool {
        axes.len() <= self.frames.len() && self.frames.iter().zip(axes).all(|(f, a)| &f.axis == a)
    }

    pub fn emit(&mut self, inst: Instruction) {
        if let Some(body) = self.bodies.last_mut() {
            body.push(Node::Inst(inst));
        }
    }

    /// Mint a register, emit `op` defining it
    pub fn define(&mut self, stamp: Stamp, op: Op, span: Option<Span>) -> Register {
        let reg = self.ids.register();
        self.emit(Instruction::define(reg, stamp, op).at(span));
        reg
    }

    /// Open a loop over `collection`
    pub fn open(&mut self, axis: Axis, collection: Register, span: Option<Span>) -> &Frame {
        let id = self.ids.loop_id();
        let element = self.ids.register();
        let index = self.ids.register();
        self.frames.push(Frame {
            id,
            axis,
            collection,
            element,
            index,
            span,
        });
        self.bodies.push(Vec::new());
        self.memo.push(HashMap::new());
        &self.frames[self.frames.len() - 1]
    }

    /// Close the innermost loop; false when nothing is open
    pub fn close(&mut self) -> bool {
        let (Some(frame), Some(body)) = (self.frames.pop(), self.bodies.pop()) else {
            return false;
        };
        self.memo.pop();
        let lp = Loop {
            id: frame.id,
            axis: frame.axis,
            collection: frame.collection,
            element: frame.element,
            index: frame.index,
            body,
            span: frame.span,
        };
        if let Some(parent) = self.bodies.last_mut() {
            parent.push(Node::Loop(lp));
        }
        true
    }

    pub fn close_to(&mut self, depth: usize) {
        while self.frames.len() > depth && self.close() {}
    }

    /// Register already holding `key` loaded from `base`, visible here
    pub fn memo_get(&self, base: Option<Register>, key: &str) -> Option<Register> {
        let lookup = (base, key.to_string());
        self.memo.iter().rev().find_map(|table| table.get(&lookup).copied())
    }

    pub fn memo_insert(&mut self, base: Option<Register>, key: &str, reg: Register) {
        if let Some(table) = self.memo.last_mut() {
            table.insert((base, key.to_string()), reg);
        }
    }

    /// Close every open frame and hand back the top-level body
    pub fn finish(mut self) -> Vec<Node> {
        self.close_to(0);
        self.bodies.pop().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lir::{DType, Literal};

    #[test]
    fn test_open_close_builds_tree() {
        let mut em = Emitter::new();
        let xs = em.define(
            Stamp::scalar(DType::array_of(DType::Integer)),
            Op::LoadInput { key: "xs".to_string() },
            None,
        );
        let element = em.open(Axis::new("xs"), xs, None).element;
        em.emit(Instruction::effect(Op::Yield { value: element }));
        assert_eq!(em.frames().len(), 1);
        assert!(em.is_open_prefix(&[Axis::new("xs")]));
        assert!(em.is_open_prefix(&[]));

        let body = em.finish();
        assert_eq!(body.len(), 2);
        let Node::Loop(lp) = &body[1] else {
            panic!("expected loop");
        };
        assert_eq!(lp.collection, xs);
        assert_eq!(lp.body.len(), 1);
    }

    #[test]
    fn test_memo_scoped_by_depth() {
        let mut em = Emitter::new();
        let outer = em.define(
            Stamp::scalar(DType::Any),
            Op::Constant { value: Literal::Nil },
            None,
        );
        em.memo_insert(None, "a", outer);
        em.open(Axis::new("xs"), outer, None);
        assert_eq!(em.memo_get(None, "a"), Some(outer));
        em.memo_insert(None, "b", Register(99));
        em.close();
        assert_eq!(em.memo_get(None, "b"), None);
        assert_eq!(em.memo_get(None, "a"), Some(outer));
    }
}
