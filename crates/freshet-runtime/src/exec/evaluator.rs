//! Expression evaluation against row contexts
//!
//! A row context maps relation aliases to the tuples joined into one row.
//! Coercion is weak (the value model's `to_*` conversions) except inside
//! CAST, which surfaces conversion failures. NULL propagates through
//! comparisons and arithmetic; predicates treat non-true as false.

use crate::context::Context;
use crate::error::{Result, RuntimeError};
use crate::udf::UdfRegistry;
use freshet_core::ast::{BinOp, CastType, Expr, UnaryOp};
use freshet_core::{Map, Tuple, Value};
use indexmap::IndexMap;
use rustc_hash::FxHashMap;

/// Relation alias -> tuple bound to it in the current row.
pub type RowContext = IndexMap<String, Tuple>;

/// Precomputed aggregate results, keyed by the display form of the call.
pub type AggregateValues = FxHashMap<String, Value>;

/// Evaluates an expression against a row. `aggregates` carries per-group
/// aggregate results when evaluating grouped projections and HAVING.
pub fn eval(
    expr: &Expr,
    row: &RowContext,
    udfs: &UdfRegistry,
    ctx: &Context,
    aggregates: Option<&AggregateValues>,
) -> Result<Value> {
    match expr {
        Expr::Null => Ok(Value::Null),
        Expr::Bool(b) => Ok(Value::Bool(*b)),
        Expr::Int(n) => Ok(Value::Int(*n)),
        Expr::Float(f) => Ok(Value::Float(*f)),
        Expr::Str(s) => Ok(Value::Str(s.clone())),

        Expr::Array(items) => {
            let values: Result<Vec<Value>> = items
                .iter()
                .map(|e| eval(e, row, udfs, ctx, aggregates))
                .collect();
            Ok(Value::Array(values?))
        }
        Expr::Map(entries) => {
            let mut map = Map::new();
            for (key, e) in entries {
                map.insert(key.clone(), eval(e, row, udfs, ctx, aggregates)?);
            }
            Ok(Value::Map(map))
        }

        Expr::RowValue { relation, path } => {
            let tuple = if relation.is_empty() {
                // Unqualified references are rewritten at plan time; inside
                // EVAL a single pseudo-tuple is bound to the empty alias.
                row.get("").or_else(|| {
                    if row.len() == 1 {
                        row.values().next()
                    } else {
                        None
                    }
                })
            } else {
                row.get(relation.as_str())
            };
            match tuple {
                Some(t) => Ok(path.evaluate_map(t.data())),
                None => Err(RuntimeError::Runtime(format!(
                    "unknown relation '{}' in row reference",
                    relation
                ))),
            }
        }

        Expr::Binary { op, left, right } => match op {
            BinOp::And => {
                let l = eval(left, row, udfs, ctx, aggregates)?;
                if !l.to_bool()? {
                    return Ok(Value::Bool(false));
                }
                let r = eval(right, row, udfs, ctx, aggregates)?;
                Ok(Value::Bool(r.to_bool()?))
            }
            BinOp::Or => {
                let l = eval(left, row, udfs, ctx, aggregates)?;
                if l.to_bool()? {
                    return Ok(Value::Bool(true));
                }
                let r = eval(right, row, udfs, ctx, aggregates)?;
                Ok(Value::Bool(r.to_bool()?))
            }
            _ => {
                let l = eval(left, row, udfs, ctx, aggregates)?;
                let r = eval(right, row, udfs, ctx, aggregates)?;
                binary_op(*op, &l, &r)
            }
        },

        Expr::Unary { op, expr } => {
            let v = eval(expr, row, udfs, ctx, aggregates)?;
            match op {
                UnaryOp::Not => Ok(Value::Bool(!v.to_bool()?)),
                UnaryOp::Neg => match v {
                    Value::Int(n) => Ok(Value::Int(-n)),
                    Value::Float(f) => Ok(Value::Float(-f)),
                    Value::Null => Ok(Value::Null),
                    other => Err(RuntimeError::Type(format!(
                        "cannot negate a {} value",
                        other.type_name()
                    ))),
                },
            }
        }

        Expr::IsCheck {
            expr,
            negated,
            missing,
        } => {
            let v = eval(expr, row, udfs, ctx, aggregates)?;
            let hit = if *missing { v.is_missing() } else { v.is_null() };
            Ok(Value::Bool(hit != *negated))
        }

        Expr::Case {
            operand,
            whens,
            else_branch,
        } => {
            match operand {
                Some(op_expr) => {
                    let operand = eval(op_expr, row, udfs, ctx, aggregates)?;
                    for (when, then) in whens {
                        let candidate = eval(when, row, udfs, ctx, aggregates)?;
                        // NULL never matches in the simple form.
                        if !operand.is_null()
                            && !operand.is_missing()
                            && values_equal(&operand, &candidate)
                        {
                            return eval(then, row, udfs, ctx, aggregates);
                        }
                    }
                }
                None => {
                    for (when, then) in whens {
                        let pred = eval(when, row, udfs, ctx, aggregates)?;
                        // NULL in the controlling predicate counts as false.
                        if pred.to_bool()? {
                            return eval(then, row, udfs, ctx, aggregates);
                        }
                    }
                }
            }
            match else_branch {
                Some(e) => eval(e, row, udfs, ctx, aggregates),
                None => Ok(Value::Null),
            }
        }

        Expr::Cast { expr, target } => {
            let v = eval(expr, row, udfs, ctx, aggregates)?;
            cast(&v, *target)
        }

        Expr::FuncCall { name, args } => {
            if let Some(aggregates) = aggregates {
                if udfs.is_aggregate(name) {
                    let key = expr.to_string();
                    return aggregates.get(&key).cloned().ok_or_else(|| {
                        RuntimeError::Runtime(format!(
                            "aggregate '{}' was not computed for this group",
                            key
                        ))
                    });
                }
            }
            let udf = udfs.lookup(name).ok_or_else(|| {
                RuntimeError::Type(format!("unknown function '{}'", name))
            })?;
            if udf.is_aggregate() {
                return Err(RuntimeError::Type(format!(
                    "aggregate function '{}' is not allowed here",
                    name
                )));
            }
            let values: Result<Vec<Value>> = args
                .iter()
                .map(|e| eval(e, row, udfs, ctx, aggregates))
                .collect();
            udf.call(ctx, &values?)
        }
    }
}

fn binary_op(op: BinOp, l: &Value, r: &Value) -> Result<Value> {
    // NULL (and MISSING) propagate through comparisons and arithmetic.
    if l.is_null() || r.is_null() || l.is_missing() || r.is_missing() {
        return Ok(Value::Null);
    }
    match op {
        BinOp::Eq => Ok(Value::Bool(values_equal(l, r))),
        BinOp::NotEq => Ok(Value::Bool(!values_equal(l, r))),
        BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => {
            let ordering = compare_values(l, r)?;
            let hit = match op {
                BinOp::Lt => ordering == std::cmp::Ordering::Less,
                BinOp::Le => ordering != std::cmp::Ordering::Greater,
                BinOp::Gt => ordering == std::cmp::Ordering::Greater,
                BinOp::Ge => ordering != std::cmp::Ordering::Less,
                _ => unreachable!(),
            };
            Ok(Value::Bool(hit))
        }
        BinOp::Concat => Ok(Value::Str(format!(
            "{}{}",
            l.to_str_lossy()?,
            r.to_str_lossy()?
        ))),
        BinOp::Add | BinOp::Sub | BinOp::Mul | BinOp::Div | BinOp::Mod => arith(op, l, r),
        BinOp::And | BinOp::Or => unreachable!("handled with short-circuiting"),
    }
}

fn arith(op: BinOp, l: &Value, r: &Value) -> Result<Value> {
    match (l, r) {
        // `+` concatenates arrays; the other operators stay numeric.
        (Value::Array(a), Value::Array(b)) if op == BinOp::Add => {
            Ok(Value::Array(a.iter().chain(b).cloned().collect()))
        }
        (Value::Int(a), Value::Int(b)) => {
            let a = *a;
            let b = *b;
            match op {
                BinOp::Add => Ok(Value::Int(a.wrapping_add(b))),
                BinOp::Sub => Ok(Value::Int(a.wrapping_sub(b))),
                BinOp::Mul => Ok(Value::Int(a.wrapping_mul(b))),
                BinOp::Div => {
                    if b == 0 {
                        Err(RuntimeError::Type("division by zero".to_string()))
                    } else {
                        Ok(Value::Int(a.wrapping_div(b)))
                    }
                }
                BinOp::Mod => {
                    if b == 0 {
                        Err(RuntimeError::Type("division by zero".to_string()))
                    } else {
                        Ok(Value::Int(a.wrapping_rem(b)))
                    }
                }
                _ => unreachable!(),
            }
        }
        _ => {
            let a = numeric(l)?;
            let b = numeric(r)?;
            let out = match op {
                BinOp::Add => a + b,
                BinOp::Sub => a - b,
                BinOp::Mul => a * b,
                BinOp::Div => {
                    if b == 0.0 {
                        return Err(RuntimeError::Type("division by zero".to_string()));
                    }
                    a / b
                }
                BinOp::Mod => {
                    if b == 0.0 {
                        return Err(RuntimeError::Type("division by zero".to_string()));
                    }
                    a % b
                }
                _ => unreachable!(),
            };
            Ok(Value::Float(out))
        }
    }
}

fn numeric(v: &Value) -> Result<f64> {
    match v {
        Value::Int(n) => Ok(*n as f64),
        Value::Float(f) => Ok(*f),
        other => Err(RuntimeError::Type(format!(
            "a {} value is not numeric",
            other.type_name()
        ))),
    }
}

/// Equality with numeric promotion; other cross-type pairs are unequal.
fn values_equal(l: &Value, r: &Value) -> bool {
    match (l, r) {
        (Value::Int(a), Value::Float(b)) | (Value::Float(b), Value::Int(a)) => *a as f64 == *b,
        _ => l == r,
    }
}

fn compare_values(l: &Value, r: &Value) -> Result<std::cmp::Ordering> {
    match (l, r) {
        (Value::Str(a), Value::Str(b)) => Ok(a.cmp(b)),
        (Value::Timestamp(a), Value::Timestamp(b)) => Ok(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => Ok(a.cmp(b)),
        _ => {
            let (a, b) = (numeric(l)?, numeric(r)?);
            a.partial_cmp(&b)
                .ok_or_else(|| RuntimeError::Type("values are not comparable".to_string()))
        }
    }
}

/// Strict conversion backing `CAST(x AS T)`. NULL casts to NULL; anything
/// else that does not convert is a type error.
pub fn cast(v: &Value, target: CastType) -> Result<Value> {
    if v.is_null() {
        return Ok(Value::Null);
    }
    if v.is_missing() {
        return Err(RuntimeError::Type(
            "cannot CAST a missing value".to_string(),
        ));
    }
    let out = match target {
        CastType::Bool => Value::Bool(v.to_bool()?),
        CastType::Int => Value::Int(v.to_int()?),
        CastType::Float => Value::Float(v.to_float()?),
        CastType::Str => Value::Str(v.to_str_lossy()?),
        CastType::Blob => Value::Blob(v.to_blob()?),
        CastType::Timestamp => Value::Timestamp(v.to_timestamp()?),
    };
    Ok(out)
}

/// Returns whether any subtree is an aggregate function call.
pub fn contains_aggregate(expr: &Expr, udfs: &UdfRegistry) -> bool {
    let mut found = false;
    walk(expr, &mut |e| {
        if let Expr::FuncCall { name, .. } = e {
            if udfs.is_aggregate(name) {
                found = true;
            }
        }
    });
    found
}

/// Collects every distinct aggregate call in the expression, keyed by its
/// display form.
pub fn collect_aggregates(expr: &Expr, udfs: &UdfRegistry, out: &mut Vec<(String, Expr)>) {
    walk(expr, &mut |e| {
        if let Expr::FuncCall { name, .. } = e {
            if udfs.is_aggregate(name) {
                let key = e.to_string();
                if !out.iter().any(|(k, _)| *k == key) {
                    out.push((key, e.clone()));
                }
            }
        }
    });
}

fn walk(expr: &Expr, visit: &mut impl FnMut(&Expr)) {
    visit(expr);
    match expr {
        Expr::Array(items) => items.iter().for_each(|e| walk(e, visit)),
        Expr::Map(entries) => entries.iter().for_each(|(_, e)| walk(e, visit)),
        Expr::Binary { left, right, .. } => {
            walk(left, visit);
            walk(right, visit);
        }
        Expr::Unary { expr, .. } | Expr::IsCheck { expr, .. } | Expr::Cast { expr, .. } => {
            walk(expr, visit)
        }
        Expr::Case {
            operand,
            whens,
            else_branch,
        } => {
            if let Some(e) = operand {
                walk(e, visit);
            }
            for (w, t) in whens {
                walk(w, visit);
                walk(t, visit);
            }
            if let Some(e) = else_branch {
                walk(e, visit);
            }
        }
        Expr::FuncCall { args, .. } => args.iter().for_each(|e| walk(e, visit)),
        _ => {}
    }
}

/// Plan-time constant folding: rewrites every foldable aggregate-free
/// subtree into a literal. Evaluation errors in constants surface as plan
/// errors.
pub fn fold_expr(expr: &Expr, udfs: &UdfRegistry, ctx: &Context) -> Result<Expr> {
    if expr.foldable() && !contains_aggregate(expr, udfs) {
        let value = eval(expr, &RowContext::new(), udfs, ctx, None)
            .map_err(|e| RuntimeError::plan(format!("cannot fold constant expression: {}", e)))?;
        if let Some(folded) = value_to_expr(&value) {
            return Ok(folded);
        }
        return Ok(expr.clone());
    }
    // Fold children so partially constant trees still shrink.
    let folded = match expr {
        Expr::Array(items) => Expr::Array(
            items
                .iter()
                .map(|e| fold_expr(e, udfs, ctx))
                .collect::<Result<_>>()?,
        ),
        Expr::Map(entries) => Expr::Map(
            entries
                .iter()
                .map(|(k, e)| Ok((k.clone(), fold_expr(e, udfs, ctx)?)))
                .collect::<Result<_>>()?,
        ),
        Expr::Binary { op, left, right } => Expr::Binary {
            op: *op,
            left: Box::new(fold_expr(left, udfs, ctx)?),
            right: Box::new(fold_expr(right, udfs, ctx)?),
        },
        Expr::Unary { op, expr } => Expr::Unary {
            op: *op,
            expr: Box::new(fold_expr(expr, udfs, ctx)?),
        },
        Expr::IsCheck {
            expr,
            negated,
            missing,
        } => Expr::IsCheck {
            expr: Box::new(fold_expr(expr, udfs, ctx)?),
            negated: *negated,
            missing: *missing,
        },
        Expr::Case {
            operand,
            whens,
            else_branch,
        } => Expr::Case {
            operand: match operand {
                Some(e) => Some(Box::new(fold_expr(e, udfs, ctx)?)),
                None => None,
            },
            whens: whens
                .iter()
                .map(|(w, t)| Ok((fold_expr(w, udfs, ctx)?, fold_expr(t, udfs, ctx)?)))
                .collect::<Result<_>>()?,
            else_branch: match else_branch {
                Some(e) => Some(Box::new(fold_expr(e, udfs, ctx)?)),
                None => None,
            },
        },
        Expr::Cast { expr, target } => Expr::Cast {
            expr: Box::new(fold_expr(expr, udfs, ctx)?),
            target: *target,
        },
        Expr::FuncCall { name, args } => Expr::FuncCall {
            name: name.clone(),
            args: args
                .iter()
                .map(|e| fold_expr(e, udfs, ctx))
                .collect::<Result<_>>()?,
        },
        other => other.clone(),
    };
    Ok(folded)
}

fn value_to_expr(v: &Value) -> Option<Expr> {
    match v {
        Value::Null => Some(Expr::Null),
        Value::Bool(b) => Some(Expr::Bool(*b)),
        Value::Int(n) => Some(Expr::Int(*n)),
        Value::Float(f) => Some(Expr::Float(*f)),
        Value::Str(s) => Some(Expr::Str(s.clone())),
        Value::Array(items) => items
            .iter()
            .map(value_to_expr)
            .collect::<Option<Vec<_>>>()
            .map(Expr::Array),
        Value::Map(m) => m
            .iter()
            .map(|(k, v)| value_to_expr(v).map(|e| (k.clone(), e)))
            .collect::<Option<Vec<_>>>()
            .map(Expr::Map),
        // Timestamps, blobs and missing have no literal form.
        _ => None,
    }
}
