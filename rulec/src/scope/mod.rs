//! Scope-annotated expression trees
//!
//! This is what the analysis front-end hands to lowering: one expression
//! tree per declaration, every node tagged with its dtype and the axes it
//! runs under, plus the anchor plans that say how each axis is reached in
//! the input record.
//!
//! The whole structure deserializes from JSON so the CLI can load it.

use std::fmt;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::{CompileError, Result};
use crate::lir::{Axis, DType, Literal};
use crate::span::Span;

/// All declarations of one schema plus its traversal plans
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScopedSchema {
    /// Declarations in dependency order
    pub declarations: Vec<ScopedDeclaration>,
    /// Traversal plans keyed by anchor
    #[serde(default)]
    pub plans: IndexMap<String, AnchorPlan>,
}

impl ScopedSchema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a value declaration
    pub fn declare(mut self, name: &str, expr: ScopedExpr) -> Self {
        self.declarations.push(ScopedDeclaration {
            name: name.to_string(),
            kind: DeclKind::Value,
            expr,
            span: None,
        });
        self
    }

    /// Add an anchor plan; `steps` lists `(axis, path)` from the outermost loop in
    pub fn plan(mut self, anchor: &str, steps: &[(&str, &[&str])]) -> Self {
        let steps = steps
            .iter()
            .enumerate()
            .map(|(loop_index, (axis, path))| AxisStep {
                axis: Axis::new(*axis),
                loop_index,
                path: path.iter().map(|p| p.to_string()).collect(),
            })
            .collect();
        self.plans.insert(anchor.to_string(), AnchorPlan { steps });
        self
    }

    pub fn from_json_str(source: &str) -> Result<Self> {
        Ok(serde_json::from_str(source)?)
    }

    pub fn get(&self, name: &str) -> Option<&ScopedDeclaration> {
        self.declarations.iter().find(|d| d.name == name)
    }

    /// Locate the traversal step for `axis`
    ///
    /// An axis may appear in several plans (every plan through `:offices`
    /// also passes `:regions`); the steps must agree.
    pub fn step_for(&self, declaration: &str, axis: &Axis) -> Result<&AxisStep> {
        let mut found: Option<&AxisStep> = None;
        for plan in self.plans.values() {
            for step in plan.steps.iter().filter(|s| &s.axis == axis) {
                match found {
                    Some(prev) if prev != step => {
                        return Err(CompileError::malformed(
                            declaration,
                            format!("conflicting traversal steps for axis {axis}"),
                        ));
                    }
                    _ => found = Some(step),
                }
            }
        }
        found.ok_or_else(|| {
            CompileError::malformed(declaration, format!("axis {axis} missing from traversal plan"))
        })
    }

    /// Axis whose element the traversal of `axis` hops from
    pub fn parent_of(&self, axis: &Axis) -> Option<&Axis> {
        self.plans.values().find_map(|plan| {
            let pos = plan.steps.iter().position(|s| &s.axis == axis)?;
            pos.checked_sub(1).map(|p| &plan.steps[p].axis)
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeclKind {
    /// Derived value
    #[default]
    Value,
    /// Boolean trait
    Trait,
}

/// One declaration and its expression tree
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScopedDeclaration {
    pub name: String,
    #[serde(default)]
    pub kind: DeclKind,
    pub expr: ScopedExpr,
    #[serde(default)]
    pub span: Option<Span>,
}

impl ScopedDeclaration {
    /// Axes of the declaration's result
    pub fn axes(&self) -> &[Axis] {
        &self.expr.axes
    }
}

/// Expression node with its stamp
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScopedExpr {
    pub dtype: DType,
    #[serde(default)]
    pub axes: Vec<Axis>,
    pub kind: ExprKind,
    #[serde(default)]
    pub span: Option<Span>,
}

fn axes_of(names: &[&str]) -> Vec<Axis> {
    names.iter().map(|n| Axis::new(*n)).collect()
}

impl ScopedExpr {
    pub fn new(dtype: DType, axes: Vec<Axis>, kind: ExprKind) -> Self {
        Self { dtype, axes, kind, span: None }
    }

    pub fn literal(value: Literal) -> Self {
        Self::new(value.dtype(), Vec::new(), ExprKind::Literal { value })
    }

    pub fn input(dtype: DType, axes: &[&str], path: &[&str]) -> Self {
        let path = path.iter().map(|p| p.to_string()).collect();
        Self::new(dtype, axes_of(axes), ExprKind::InputRef { path })
    }

    pub fn decl_ref(dtype: DType, axes: &[&str], name: &str) -> Self {
        Self::new(dtype, axes_of(axes), ExprKind::DeclRef { name: name.to_string() })
    }

    pub fn index(axes: &[&str], axis: &str) -> Self {
        Self::new(DType::Integer, axes_of(axes), ExprKind::IndexRef { axis: Axis::new(axis) })
    }

    pub fn call(dtype: DType, axes: &[&str], function: &str, args: Vec<ScopedExpr>) -> Self {
        let function = function.to_string();
        Self::new(dtype, axes_of(axes), ExprKind::Call { function, args })
    }

    pub fn reduce(dtype: DType, axes: &[&str], function: &str, over: &[&str], arg: ScopedExpr) -> Self {
        let kind = ExprKind::Reduce {
            function: function.to_string(),
            over: axes_of(over),
            arg: Box::new(arg),
        };
        Self::new(dtype, axes_of(axes), kind)
    }

    pub fn select(axes: &[&str], cond: ScopedExpr, on_true: ScopedExpr, on_false: ScopedExpr) -> Self {
        let dtype = on_true.dtype.clone();
        let kind = ExprKind::Select {
            cond: Box::new(cond),
            on_true: Box::new(on_true),
            on_false: Box::new(on_false),
        };
        Self::new(dtype, axes_of(axes), kind)
    }

    pub fn shift(self, axis: &str, offset: i64, policy: BoundaryPolicy) -> Self {
        let (dtype, axes) = (self.dtype.clone(), self.axes.clone());
        let kind = ExprKind::Shift {
            base: Box::new(self),
            axis: Axis::new(axis),
            offset,
            policy,
        };
        Self::new(dtype, axes, kind)
    }
}

/// Out-of-range policy of a stencil shift
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BoundaryPolicy {
    /// Modulo-normalize into `[0, length)`
    Wrap,
    /// Clip into `[0, length - 1]`
    Clamp,
    /// Out-of-range neighbors read as zero
    Zero,
}

impl fmt::Display for BoundaryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BoundaryPolicy::Wrap => write!(f, "wrap"),
            BoundaryPolicy::Clamp => write!(f, "clamp"),
            BoundaryPolicy::Zero => write!(f, "zero"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CascadeCase {
    pub when: ScopedExpr,
    pub then: ScopedExpr,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectField {
    pub key: String,
    pub value: ScopedExpr,
}

/// Node kinds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "node", rename_all = "snake_case")]
pub enum ExprKind {
    Literal { value: Literal },
    /// Field path from the input root (scalar nodes) or from the element of
    /// the innermost axis the node runs under
    InputRef { path: Vec<String> },
    DeclRef { name: String },
    /// Index of the current element along `axis`
    IndexRef { axis: Axis },
    Call { function: String, args: Vec<ScopedExpr> },
    /// Aggregate `arg` over the `over` axes
    Reduce {
        function: String,
        over: Vec<Axis>,
        arg: Box<ScopedExpr>,
    },
    Select {
        cond: Box<ScopedExpr>,
        on_true: Box<ScopedExpr>,
        on_false: Box<ScopedExpr>,
    },
    /// First matching case wins, `default` otherwise
    Cascade {
        cases: Vec<CascadeCase>,
        default: Box<ScopedExpr>,
    },
    MakeTuple { elements: Vec<ScopedExpr> },
    MakeObject { fields: Vec<ObjectField> },
    TupleGet { tuple: Box<ScopedExpr>, index: usize },
    /// Neighbor access: element at `offset` along `axis`
    Shift {
        base: Box<ScopedExpr>,
        axis: Axis,
        offset: i64,
        policy: BoundaryPolicy,
    },
}

/// Per-anchor traversal plan
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnchorPlan {
    pub steps: Vec<AxisStep>,
}

/// How to reach the collection iterated by one axis
///
/// At loop index 0 `path` starts at the input root (head path); deeper
/// steps hop from the element bound by the loop one level up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AxisStep {
    pub axis: Axis,
    pub loop_index: usize,
    pub path: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCHEMA: &str = r#"{
        "declarations": [{
            "name": "total",
            "expr": {
                "dtype": "integer",
                "kind": {
                    "node": "reduce",
                    "function": "agg.sum",
                    "over": ["items"],
                    "arg": {
                        "dtype": "integer",
                        "axes": ["items"],
                        "kind": {"node": "input_ref", "path": ["price"]}
                    }
                }
            }
        }],
        "plans": {
            "items": {"steps": [{"axis": "items", "loop_index": 0, "path": ["items"]}]}
        }
    }"#;

    #[test]
    fn test_schema_from_json() {
        let schema = ScopedSchema::from_json_str(SCHEMA).unwrap();
        let total = schema.get("total").unwrap();
        assert_eq!(total.kind, DeclKind::Value);
        assert!(total.axes().is_empty());
        let ExprKind::Reduce { function, over, arg } = &total.expr.kind else {
            panic!("expected reduce");
        };
        assert_eq!(function, "agg.sum");
        assert_eq!(over, &vec![Axis::new("items")]);
        assert!(matches!(arg.kind, ExprKind::InputRef { .. }));
    }

    #[test]
    fn test_literal_node_from_json() {
        let expr: ScopedExpr = serde_json::from_str(
            r#"{"dtype": "float", "kind": {"node": "literal", "value": 1.5}}"#,
        )
        .unwrap();
        assert!(matches!(expr.kind, ExprKind::Literal { value: Literal::Float(_) }));
    }

    #[test]
    fn test_step_for_missing_axis() {
        let schema = ScopedSchema::from_json_str(SCHEMA).unwrap();
        assert_eq!(schema.step_for("total", &Axis::new("items")).unwrap().path, vec!["items"]);
        let err = schema.step_for("total", &Axis::new("offices")).unwrap_err();
        assert!(err.to_string().contains("missing from traversal plan"));
    }

    #[test]
    fn test_builder_plans() {
        let schema = ScopedSchema::new()
            .plan("offices", &[("regions", &["regions"]), ("offices", &["offices"])])
            .declare("n", ScopedExpr::literal(Literal::Int(1)));
        let step = schema.step_for("n", &Axis::new("offices")).unwrap();
        assert_eq!(step.loop_index, 1);
        assert_eq!(schema.parent_of(&Axis::new("offices")), Some(&Axis::new("regions")));
        assert_eq!(schema.parent_of(&Axis::new("regions")), None);
        assert_eq!(schema.get("n").unwrap().expr.dtype, DType::Integer);
    }

    #[test]
    fn test_step_for_conflict() {
        let mut schema = ScopedSchema::from_json_str(SCHEMA).unwrap();
        schema.plans.insert(
            "other".to_string(),
            AnchorPlan {
                steps: vec![AxisStep {
                    axis: Axis::new("items"),
                    loop_index: 0,
                    path: vec!["goods".to_string()],
                }],
            },
        );
        assert!(schema.step_for("total", &Axis::new("items")).is_err());
    }
}
