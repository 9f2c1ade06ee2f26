//! Abstract syntax tree for FQL
//!
//! Statement nodes mirror the surface language; expression nodes support the
//! three interrogations the planner needs: the set of referenced relations,
//! alpha-renaming of a referenced relation, and foldability (whether the
//! subtree reduces to a constant at plan time).
//!
//! Relations are identified by plain strings; the empty string stands for an
//! unqualified column reference, which the planner rewrites to the single
//! FROM relation before execution.

use crate::path::Path;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

// ============================================================================
// Statements
// ============================================================================

/// A top-level FQL statement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Stmt {
    CreateSource {
        paused: bool,
        name: String,
        source_type: String,
        params: Vec<(String, Expr)>,
    },
    CreateSink {
        name: String,
        sink_type: String,
        params: Vec<(String, Expr)>,
    },
    CreateState {
        name: String,
        state_type: String,
        params: Vec<(String, Expr)>,
    },
    CreateStream {
        name: String,
        select: SelectUnion,
    },
    UpdateNode {
        kind: UpdateTarget,
        name: String,
        params: Vec<(String, Expr)>,
    },
    Drop {
        kind: DropTarget,
        name: String,
    },
    InsertInto {
        sink: String,
        stream: String,
    },
    PauseSource(String),
    ResumeSource(String),
    RewindSource(String),
    LoadState {
        name: String,
        state_type: String,
        tag: Option<String>,
        params: Vec<(String, Expr)>,
        /// `OR CREATE IF NOT SAVED [WITH ..]` - Some means the fallback is
        /// enabled, carrying its WITH parameters.
        create_if_not_saved: Option<Vec<(String, Expr)>>,
    },
    SaveState {
        name: String,
        tag: Option<String>,
    },
    /// Ad-hoc SELECT streaming results back to the caller.
    Select(SelectUnion),
    Eval {
        expr: Expr,
        input: Option<Expr>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpdateTarget {
    Source,
    Sink,
    State,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DropTarget {
    Source,
    Stream,
    Sink,
    State,
}

// ============================================================================
// SELECT
// ============================================================================

/// One or more SELECTs joined by UNION ALL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectUnion {
    pub selects: Vec<Select>,
}

/// A single SELECT clause.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Select {
    pub emitter: Emitter,
    pub projections: Vec<Projection>,
    pub from: Vec<Relation>,
    pub filter: Option<Expr>,
    pub group_by: Vec<Expr>,
    pub having: Option<Expr>,
}

/// Emitter mode plus its sampling modifiers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Emitter {
    pub mode: EmitterMode,
    pub samplers: Vec<Sampler>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EmitterMode {
    Istream,
    Dstream,
    Rstream,
}

impl fmt::Display for EmitterMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EmitterMode::Istream => write!(f, "ISTREAM"),
            EmitterMode::Dstream => write!(f, "DSTREAM"),
            EmitterMode::Rstream => write!(f, "RSTREAM"),
        }
    }
}

/// Sampling modifier attached to an emitter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Sampler {
    /// Stop emitting after k outputs total.
    Limit(i64),
    /// Emit one in every k tuples.
    EveryKth(i64),
    /// Bernoulli sampling with probability p/100.
    SamplePercent(f64),
    /// Rate-limit to at most one emission per interval.
    EveryInterval { millis: i64 },
}

/// One projected output column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Projection {
    Expr { expr: Expr, alias: Option<String> },
    Wildcard { relation: Option<String> },
}

impl Projection {
    /// The output column name: the alias when given, otherwise a name derived
    /// from the expression (column name for row references, function name for
    /// calls).
    pub fn output_name(&self, position: usize) -> String {
        match self {
            Projection::Expr {
                alias: Some(a), ..
            } => a.clone(),
            Projection::Expr { expr, .. } => expr.derived_name(position),
            Projection::Wildcard { .. } => format!("col_{}", position),
        }
    }
}

/// A windowed FROM relation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relation {
    pub source: RelationSource,
    pub alias: Option<String>,
    pub window: WindowSpec,
}

impl Relation {
    /// The name this relation binds in the row context.
    pub fn binding_name(&self) -> &str {
        match (&self.alias, &self.source) {
            (Some(a), _) => a,
            (None, RelationSource::Stream(name)) => name,
            (None, RelationSource::Udsf { name, .. }) => name,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RelationSource {
    /// Reference to an existing stream/source node.
    Stream(String),
    /// User-defined stream function: `name(args)`.
    Udsf { name: String, args: Vec<Expr> },
}

/// Window declaration: `[RANGE n UNIT, BUFFER SIZE n, SHEDDING IF FULL]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowSpec {
    pub range: i64,
    pub unit: WindowUnit,
    pub capacity: Option<i64>,
    pub shedding: Shedding,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WindowUnit {
    Tuples,
    Seconds,
    Milliseconds,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Shedding {
    #[default]
    Wait,
    DropOldest,
    DropNewest,
}

// ============================================================================
// Expressions
// ============================================================================

/// An FQL expression.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expr {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Array(Vec<Expr>),
    Map(Vec<(String, Expr)>),

    /// Row reference `rel:col.path`. `relation` is empty for unqualified
    /// references; the path's first segment is the column.
    RowValue { relation: String, path: Path },

    Binary {
        op: BinOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Unary {
        op: UnaryOp,
        expr: Box<Expr>,
    },
    /// `expr IS [NOT] NULL` / `expr IS [NOT] MISSING`
    IsCheck {
        expr: Box<Expr>,
        negated: bool,
        missing: bool,
    },
    Case {
        /// Some for the simple form `CASE operand WHEN ..`.
        operand: Option<Box<Expr>>,
        whens: Vec<(Expr, Expr)>,
        else_branch: Option<Box<Expr>>,
    },
    Cast {
        expr: Box<Expr>,
        target: CastType,
    },
    FuncCall {
        name: String,
        args: Vec<Expr>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BinOp {
    Or,
    And,
    Eq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
    Concat,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
}

impl BinOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            BinOp::Or => "OR",
            BinOp::And => "AND",
            BinOp::Eq => "=",
            BinOp::NotEq => "!=",
            BinOp::Lt => "<",
            BinOp::Le => "<=",
            BinOp::Gt => ">",
            BinOp::Ge => ">=",
            BinOp::Concat => "||",
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::Mod => "%",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UnaryOp {
    Neg,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CastType {
    Bool,
    Int,
    Float,
    Str,
    Blob,
    Timestamp,
}

impl CastType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CastType::Bool => "BOOL",
            CastType::Int => "INT",
            CastType::Float => "FLOAT",
            CastType::Str => "STRING",
            CastType::Blob => "BLOB",
            CastType::Timestamp => "TIMESTAMP",
        }
    }
}

impl Expr {
    /// Set of relation names the subtree depends on. The empty string stands
    /// for unqualified references.
    pub fn referenced_relations(&self) -> HashSet<String> {
        let mut rels = HashSet::new();
        self.collect_relations(&mut rels);
        rels
    }

    fn collect_relations(&self, rels: &mut HashSet<String>) {
        match self {
            Expr::RowValue { relation, .. } => {
                rels.insert(relation.clone());
            }
            Expr::Array(items) => {
                for e in items {
                    e.collect_relations(rels);
                }
            }
            Expr::Map(entries) => {
                for (_, e) in entries {
                    e.collect_relations(rels);
                }
            }
            Expr::Binary { left, right, .. } => {
                left.collect_relations(rels);
                right.collect_relations(rels);
            }
            Expr::Unary { expr, .. } | Expr::IsCheck { expr, .. } | Expr::Cast { expr, .. } => {
                expr.collect_relations(rels);
            }
            Expr::Case {
                operand,
                whens,
                else_branch,
            } => {
                if let Some(op) = operand {
                    op.collect_relations(rels);
                }
                for (w, t) in whens {
                    w.collect_relations(rels);
                    t.collect_relations(rels);
                }
                if let Some(e) = else_branch {
                    e.collect_relations(rels);
                }
            }
            Expr::FuncCall { args, .. } => {
                for e in args {
                    e.collect_relations(rels);
                }
            }
            _ => {}
        }
    }

    /// Rewrites every reference to relation `from` into `to`. Composing with
    /// the inverse rename is the identity.
    pub fn rename_referenced_relation(&self, from: &str, to: &str) -> Expr {
        let rename = |e: &Expr| e.rename_referenced_relation(from, to);
        match self {
            Expr::RowValue { relation, path } if relation == from => Expr::RowValue {
                relation: to.to_string(),
                path: path.clone(),
            },
            Expr::Array(items) => Expr::Array(items.iter().map(rename).collect()),
            Expr::Map(entries) => Expr::Map(
                entries
                    .iter()
                    .map(|(k, e)| (k.clone(), rename(e)))
                    .collect(),
            ),
            Expr::Binary { op, left, right } => Expr::Binary {
                op: *op,
                left: Box::new(rename(left)),
                right: Box::new(rename(right)),
            },
            Expr::Unary { op, expr } => Expr::Unary {
                op: *op,
                expr: Box::new(rename(expr)),
            },
            Expr::IsCheck {
                expr,
                negated,
                missing,
            } => Expr::IsCheck {
                expr: Box::new(rename(expr)),
                negated: *negated,
                missing: *missing,
            },
            Expr::Case {
                operand,
                whens,
                else_branch,
            } => Expr::Case {
                operand: operand.as_ref().map(|e| Box::new(rename(e))),
                whens: whens.iter().map(|(w, t)| (rename(w), rename(t))).collect(),
                else_branch: else_branch.as_ref().map(|e| Box::new(rename(e))),
            },
            Expr::Cast { expr, target } => Expr::Cast {
                expr: Box::new(rename(expr)),
                target: *target,
            },
            Expr::FuncCall { name, args } => Expr::FuncCall {
                name: name.clone(),
                args: args.iter().map(rename).collect(),
            },
            other => other.clone(),
        }
    }

    /// Whether the subtree yields a constant at plan time. `now()` is not
    /// evaluable outside an execution context, so it is never foldable.
    /// Aggregate calls are excluded by the planner, which knows the function
    /// registry.
    pub fn foldable(&self) -> bool {
        match self {
            Expr::Null | Expr::Bool(_) | Expr::Int(_) | Expr::Float(_) | Expr::Str(_) => true,
            Expr::Array(items) => items.iter().all(Expr::foldable),
            Expr::Map(entries) => entries.iter().all(|(_, e)| e.foldable()),
            Expr::RowValue { .. } => false,
            Expr::Binary { left, right, .. } => left.foldable() && right.foldable(),
            Expr::Unary { expr, .. } | Expr::IsCheck { expr, .. } | Expr::Cast { expr, .. } => {
                expr.foldable()
            }
            Expr::Case {
                operand,
                whens,
                else_branch,
            } => {
                operand.as_ref().map(|e| e.foldable()).unwrap_or(true)
                    && whens.iter().all(|(w, t)| w.foldable() && t.foldable())
                    && else_branch.as_ref().map(|e| e.foldable()).unwrap_or(true)
            }
            Expr::FuncCall { name, args } => {
                if name == "now" && args.is_empty() {
                    return false;
                }
                args.iter().all(Expr::foldable)
            }
        }
    }

    /// Output column name derived from the expression shape.
    pub fn derived_name(&self, position: usize) -> String {
        match self {
            Expr::RowValue { path, .. } => match path.segments().first() {
                Some(crate::path::Segment::Field(name)) => name.clone(),
                _ => format!("col_{}", position),
            },
            Expr::FuncCall { name, .. } => name.clone(),
            _ => format!("col_{}", position),
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Null => write!(f, "NULL"),
            Expr::Bool(b) => write!(f, "{}", if *b { "TRUE" } else { "FALSE" }),
            Expr::Int(n) => write!(f, "{}", n),
            Expr::Float(n) => write!(f, "{}", n),
            Expr::Str(s) => write!(f, "\"{}\"", s.replace('"', "\"\"")),
            Expr::Array(items) => {
                write!(f, "[")?;
                for (i, e) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", e)?;
                }
                write!(f, "]")
            }
            Expr::Map(entries) => {
                write!(f, "{{")?;
                for (i, (k, e)) in entries.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "\"{}\": {}", k, e)?;
                }
                write!(f, "}}")
            }
            Expr::RowValue { relation, path } => {
                if relation.is_empty() {
                    write!(f, "{}", path)
                } else {
                    write!(f, "{}:{}", relation, path)
                }
            }
            Expr::Binary { op, left, right } => {
                write!(f, "({} {} {})", left, op.as_str(), right)
            }
            Expr::Unary { op, expr } => match op {
                UnaryOp::Neg => write!(f, "-{}", expr),
                UnaryOp::Not => write!(f, "NOT {}", expr),
            },
            Expr::IsCheck {
                expr,
                negated,
                missing,
            } => {
                let what = if *missing { "MISSING" } else { "NULL" };
                if *negated {
                    write!(f, "{} IS NOT {}", expr, what)
                } else {
                    write!(f, "{} IS {}", expr, what)
                }
            }
            Expr::Case {
                operand,
                whens,
                else_branch,
            } => {
                write!(f, "CASE")?;
                if let Some(op) = operand {
                    write!(f, " {}", op)?;
                }
                for (w, t) in whens {
                    write!(f, " WHEN {} THEN {}", w, t)?;
                }
                if let Some(e) = else_branch {
                    write!(f, " ELSE {}", e)?;
                }
                write!(f, " END")
            }
            Expr::Cast { expr, target } => write!(f, "CAST({} AS {})", expr, target.as_str()),
            Expr::FuncCall { name, args } => {
                write!(f, "{}(", name)?;
                for (i, e) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", e)?;
                }
                write!(f, ")")
            }
        }
    }
}

/// Convenience constructor for a simple column reference.
pub fn row_value(relation: &str, column: &str) -> Expr {
    Expr::RowValue {
        relation: relation.to_string(),
        path: Path::new(vec![crate::path::Segment::Field(column.to_string())]),
    }
}
