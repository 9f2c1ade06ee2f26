//! User-defined functions
//!
//! Every UDF conforms to one sum-typed calling convention: a function from a
//! slice of [`Value`]s to a [`Value`]. A typed adapter layer converts each
//! runtime argument to the parameter type declared at registration, with
//! range checks for the sized integer types. Aggregate UDFs declare which
//! parameters receive the whole aggregation group as an array.

use crate::context::Context;
use crate::error::{Result, RuntimeError};
use freshet_core::Value;
use indexmap::IndexMap;
use std::sync::{Arc, RwLock};

/// Parameter type declared at registration; drives argument conversion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArgType {
    Bool,
    Int8,
    Int16,
    Int32,
    Int64,
    UInt8,
    UInt16,
    UInt32,
    UInt64,
    Float32,
    Float64,
    Str,
    Blob,
    Timestamp,
    Array(Box<ArgType>),
    Map,
    /// Raw value, passed through unaltered.
    Any,
}

impl ArgType {
    fn name(&self) -> String {
        match self {
            ArgType::Array(elem) => format!("array of {}", elem.name()),
            other => format!("{:?}", other).to_lowercase(),
        }
    }

    fn int_in_range(&self, v: &Value, min: i64, max: i64) -> Result<Value> {
        let i = v.to_int()?;
        if i < min {
            return Err(RuntimeError::Type(format!(
                "{} is too small for {}",
                i,
                self.name()
            )));
        }
        if i > max {
            return Err(RuntimeError::Type(format!(
                "{} is too big for {}",
                i,
                self.name()
            )));
        }
        Ok(Value::Int(i))
    }

    /// Coerces a runtime value into this parameter type.
    pub fn convert(&self, v: &Value) -> Result<Value> {
        match self {
            ArgType::Bool => Ok(Value::Bool(v.to_bool()?)),
            ArgType::Int8 => self.int_in_range(v, i8::MIN as i64, i8::MAX as i64),
            ArgType::Int16 => self.int_in_range(v, i16::MIN as i64, i16::MAX as i64),
            ArgType::Int32 => self.int_in_range(v, i32::MIN as i64, i32::MAX as i64),
            ArgType::Int64 => Ok(Value::Int(v.to_int()?)),
            ArgType::UInt8 => self.int_in_range(v, 0, u8::MAX as i64),
            ArgType::UInt16 => self.int_in_range(v, 0, u16::MAX as i64),
            ArgType::UInt32 => self.int_in_range(v, 0, u32::MAX as i64),
            ArgType::UInt64 => self.int_in_range(v, 0, i64::MAX),
            ArgType::Float32 => Ok(Value::Float(v.to_float()? as f32 as f64)),
            ArgType::Float64 => Ok(Value::Float(v.to_float()?)),
            ArgType::Str => Ok(Value::Str(v.to_str_lossy()?)),
            ArgType::Blob => Ok(Value::Blob(v.to_blob()?)),
            ArgType::Timestamp => Ok(Value::Timestamp(v.to_timestamp()?)),
            ArgType::Array(elem) => match v {
                Value::Array(items) => {
                    let converted: Result<Vec<Value>> =
                        items.iter().map(|item| elem.convert(item)).collect();
                    Ok(Value::Array(converted?))
                }
                other => Err(RuntimeError::Type(format!(
                    "{} value is not an array",
                    other.type_name()
                ))),
            },
            ArgType::Map => match v {
                Value::Map(_) => Ok(v.clone()),
                other => Err(RuntimeError::Type(format!(
                    "{} value is not a map",
                    other.type_name()
                ))),
            },
            ArgType::Any => Ok(v.clone()),
        }
    }
}

pub type UdfFn = dyn Fn(&Context, &[Value]) -> Result<Value> + Send + Sync;

/// A registered function: the implementation plus its argument signature.
pub struct Udf {
    func: Arc<UdfFn>,
    arg_types: Vec<ArgType>,
    variadic: bool,
    agg_params: Vec<bool>,
}

impl std::fmt::Debug for Udf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Udf")
            .field("arg_types", &self.arg_types)
            .field("variadic", &self.variadic)
            .field("agg_params", &self.agg_params)
            .finish()
    }
}

impl Udf {
    /// Registers a scalar function. With `variadic`, the last declared
    /// parameter type applies to the whole tail.
    pub fn scalar<F>(arg_types: Vec<ArgType>, variadic: bool, func: F) -> Arc<Self>
    where
        F: Fn(&Context, &[Value]) -> Result<Value> + Send + Sync + 'static,
    {
        let arity = arg_types.len();
        Arc::new(Self {
            func: Arc::new(func),
            arg_types,
            variadic,
            agg_params: vec![false; arity],
        })
    }

    /// Registers an aggregate function. `agg_params[k]` marks the k-th
    /// parameter as receiving the whole group as an array.
    pub fn aggregate<F>(
        arg_types: Vec<ArgType>,
        variadic: bool,
        agg_params: Vec<bool>,
        func: F,
    ) -> Result<Arc<Self>>
    where
        F: Fn(&Context, &[Value]) -> Result<Value> + Send + Sync + 'static,
    {
        if arg_types.is_empty() {
            return Err(RuntimeError::plan(
                "an aggregate function must have at least one argument",
            ));
        }
        if agg_params.len() != arg_types.len() {
            return Err(RuntimeError::plan(
                "the aggregate mask must cover every argument of the function",
            ));
        }
        if !agg_params.iter().any(|b| *b) {
            return Err(RuntimeError::plan(
                "the function does not have an aggregation parameter",
            ));
        }
        for (idx, marked) in agg_params.iter().enumerate() {
            if *marked && !matches!(arg_types[idx], ArgType::Array(_)) {
                return Err(RuntimeError::plan(format!(
                    "the {}-th parameter receives the aggregation group and must be an array type",
                    idx + 1
                )));
            }
        }
        Ok(Arc::new(Self {
            func: Arc::new(func),
            arg_types,
            variadic,
            agg_params,
        }))
    }

    pub fn is_aggregate(&self) -> bool {
        self.agg_params.iter().any(|b| *b)
    }

    /// Whether the k-th call argument receives the aggregation group.
    pub fn is_aggregation_parameter(&self, k: usize) -> bool {
        match self.agg_params.get(k) {
            Some(b) => *b,
            None => self.variadic && self.agg_params.last().copied().unwrap_or(false),
        }
    }

    /// Whether a call with `arity` arguments is well-formed.
    pub fn accept(&self, arity: usize) -> bool {
        let declared = self.arg_types.len();
        if arity < declared {
            // An empty variadic tail is fine.
            self.variadic && arity == declared - 1
        } else {
            arity == declared || self.variadic
        }
    }

    pub fn call(&self, ctx: &Context, args: &[Value]) -> Result<Value> {
        if !self.accept(args.len()) {
            return Err(RuntimeError::Type(format!(
                "wrong number of arguments: got {}, want {}{}",
                args.len(),
                self.arg_types.len(),
                if self.variadic { "+" } else { "" }
            )));
        }
        let mut converted = Vec::with_capacity(args.len());
        for (idx, arg) in args.iter().enumerate() {
            let ty = self
                .arg_types
                .get(idx)
                .or_else(|| self.arg_types.last())
                .expect("arity checked above");
            converted.push(ty.convert(arg)?);
        }
        (self.func)(ctx, &converted)
    }
}

/// Catalog of registered functions. Built once at startup; tests pass their
/// own instance instead of patching a process-global.
pub struct UdfRegistry {
    funcs: RwLock<IndexMap<String, Arc<Udf>>>,
}

impl UdfRegistry {
    pub fn empty() -> Self {
        Self {
            funcs: RwLock::new(IndexMap::new()),
        }
    }

    pub fn register(&self, name: &str, udf: Arc<Udf>) -> Result<()> {
        let mut funcs = self.funcs.write().unwrap();
        let key = name.to_lowercase();
        if funcs.contains_key(&key) {
            return Err(RuntimeError::plan(format!(
                "a function named '{}' is already registered",
                name
            )));
        }
        funcs.insert(key, udf);
        Ok(())
    }

    pub fn lookup(&self, name: &str) -> Option<Arc<Udf>> {
        self.funcs.read().unwrap().get(&name.to_lowercase()).cloned()
    }

    pub fn is_aggregate(&self, name: &str) -> bool {
        self.lookup(name).map(|u| u.is_aggregate()).unwrap_or(false)
    }
}

impl Default for UdfRegistry {
    fn default() -> Self {
        let registry = Self::empty();
        register_builtins(&registry);
        registry
    }
}

fn register_builtins(registry: &UdfRegistry) {
    let array_any = || vec![ArgType::Array(Box::new(ArgType::Any))];

    registry
        .register(
            "count",
            Udf::aggregate(array_any(), false, vec![true], |_, args| {
                let group = args[0].as_array().unwrap_or(&[]);
                let n = group
                    .iter()
                    .filter(|v| !v.is_null() && !v.is_missing())
                    .count();
                Ok(Value::Int(n as i64))
            })
            .expect("count registration"),
        )
        .expect("count");

    registry
        .register(
            "sum",
            Udf::aggregate(array_any(), false, vec![true], |_, args| {
                numeric_fold(args[0].as_array().unwrap_or(&[]), |acc, v| acc + v)
            })
            .expect("sum registration"),
        )
        .expect("sum");

    registry
        .register(
            "avg",
            Udf::aggregate(array_any(), false, vec![true], |_, args| {
                let group: Vec<&Value> = args[0]
                    .as_array()
                    .unwrap_or(&[])
                    .iter()
                    .filter(|v| !v.is_null() && !v.is_missing())
                    .collect();
                if group.is_empty() {
                    return Ok(Value::Null);
                }
                let mut total = 0.0;
                for v in &group {
                    total += v.to_float()?;
                }
                Ok(Value::Float(total / group.len() as f64))
            })
            .expect("avg registration"),
        )
        .expect("avg");

    registry
        .register(
            "min",
            Udf::aggregate(array_any(), false, vec![true], |_, args| {
                extremum(args[0].as_array().unwrap_or(&[]), false)
            })
            .expect("min registration"),
        )
        .expect("min");

    registry
        .register(
            "max",
            Udf::aggregate(array_any(), false, vec![true], |_, args| {
                extremum(args[0].as_array().unwrap_or(&[]), true)
            })
            .expect("max registration"),
        )
        .expect("max");

    registry
        .register(
            "str",
            Udf::scalar(vec![ArgType::Any], false, |_, args| {
                Ok(Value::Str(args[0].to_str_lossy()?))
            }),
        )
        .expect("str");

    registry
        .register(
            "abs",
            Udf::scalar(vec![ArgType::Any], false, |_, args| match &args[0] {
                Value::Int(n) => Ok(Value::Int(n.wrapping_abs())),
                Value::Float(n) => Ok(Value::Float(n.abs())),
                other => Err(RuntimeError::Type(format!(
                    "abs expects a numeric argument, got {}",
                    other.type_name()
                ))),
            }),
        )
        .expect("abs");

    registry
        .register(
            "now",
            Udf::scalar(Vec::new(), false, |_, _| {
                Ok(Value::Timestamp(chrono::Utc::now()))
            }),
        )
        .expect("now");
}

fn numeric_fold(group: &[Value], fold: impl Fn(f64, f64) -> f64) -> Result<Value> {
    let mut acc: Option<f64> = None;
    let mut all_int = true;
    for v in group {
        if v.is_null() || v.is_missing() {
            continue;
        }
        if !matches!(v, Value::Int(_)) {
            all_int = false;
        }
        let f = v.to_float()?;
        acc = Some(match acc {
            Some(a) => fold(a, f),
            None => f,
        });
    }
    Ok(match acc {
        Some(total) if all_int => Value::Int(total as i64),
        Some(total) => Value::Float(total),
        None => Value::Null,
    })
}

fn extremum(group: &[Value], want_max: bool) -> Result<Value> {
    let mut best: Option<Value> = None;
    for v in group {
        if v.is_null() || v.is_missing() {
            continue;
        }
        best = Some(match best {
            None => v.clone(),
            Some(b) => {
                let ordering = compare(v, &b)?;
                if (want_max && ordering == std::cmp::Ordering::Greater)
                    || (!want_max && ordering == std::cmp::Ordering::Less)
                {
                    v.clone()
                } else {
                    b
                }
            }
        });
    }
    Ok(best.unwrap_or(Value::Null))
}

fn compare(a: &Value, b: &Value) -> Result<std::cmp::Ordering> {
    match (a, b) {
        (Value::Str(x), Value::Str(y)) => Ok(x.cmp(y)),
        (Value::Timestamp(x), Value::Timestamp(y)) => Ok(x.cmp(y)),
        _ => {
            let (x, y) = (a.to_float()?, b.to_float()?);
            x.partial_cmp(&y).ok_or_else(|| {
                RuntimeError::Type("values are not comparable".to_string())
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ints(values: &[i64]) -> Value {
        Value::Array(values.iter().map(|n| Value::Int(*n)).collect())
    }

    #[test]
    fn test_scalar_conversion_and_call() {
        let ctx = Context::new();
        let udf = Udf::scalar(vec![ArgType::Int64], false, |_, args| {
            Ok(Value::Int(args[0].as_int().unwrap() * 2))
        });
        // Weak conversion: a numeric string becomes an int.
        let out = udf.call(&ctx, &[Value::Str("21".to_string())]).unwrap();
        assert_eq!(out, Value::Int(42));
    }

    #[test]
    fn test_int_range_checks() {
        let ctx = Context::new();
        let udf = Udf::scalar(vec![ArgType::Int8], false, |_, args| Ok(args[0].clone()));
        assert!(udf.call(&ctx, &[Value::Int(127)]).is_ok());
        let err = udf.call(&ctx, &[Value::Int(128)]).unwrap_err();
        assert!(err.to_string().contains("too big for int8"));
        let err = udf.call(&ctx, &[Value::Int(-129)]).unwrap_err();
        assert!(err.to_string().contains("too small for int8"));
    }

    #[test]
    fn test_uint_rejects_negative() {
        let ctx = Context::new();
        let udf = Udf::scalar(vec![ArgType::UInt32], false, |_, args| Ok(args[0].clone()));
        assert!(udf.call(&ctx, &[Value::Int(-1)]).is_err());
    }

    #[test]
    fn test_arity_checks() {
        let ctx = Context::new();
        let udf = Udf::scalar(vec![ArgType::Any, ArgType::Any], false, |_, _| {
            Ok(Value::Null)
        });
        assert!(udf.accept(2));
        assert!(!udf.accept(1));
        assert!(!udf.accept(3));
        assert!(udf.call(&ctx, &[Value::Int(1)]).is_err());
    }

    #[test]
    fn test_variadic_tail() {
        let udf = Udf::scalar(vec![ArgType::Str, ArgType::Int64], true, |_, args| {
            Ok(Value::Int(args.len() as i64 - 1))
        });
        assert!(udf.accept(1)); // empty tail
        assert!(udf.accept(5));
        let ctx = Context::new();
        let out = udf
            .call(
                &ctx,
                &[Value::Str("x".into()), Value::Int(1), Value::Int(2)],
            )
            .unwrap();
        assert_eq!(out, Value::Int(2));
    }

    #[test]
    fn test_aggregate_registration_validation() {
        // No parameter marked aggregate.
        let err = Udf::aggregate(
            vec![ArgType::Array(Box::new(ArgType::Any))],
            false,
            vec![false],
            |_, _| Ok(Value::Null),
        )
        .unwrap_err();
        assert!(err.to_string().contains("aggregation parameter"));

        // Aggregate parameter must be an array type.
        let err = Udf::aggregate(vec![ArgType::Int64], false, vec![true], |_, _| {
            Ok(Value::Null)
        })
        .unwrap_err();
        assert!(err.to_string().contains("must be an array"));

        // No arguments at all.
        let err =
            Udf::aggregate(Vec::new(), false, Vec::new(), |_, _| Ok(Value::Null)).unwrap_err();
        assert!(err.to_string().contains("at least one argument"));
    }

    #[test]
    fn test_builtin_count_skips_nulls() {
        let ctx = Context::new();
        let registry = UdfRegistry::default();
        let count = registry.lookup("count").unwrap();
        assert!(count.is_aggregate());
        assert!(count.is_aggregation_parameter(0));

        let group = Value::Array(vec![Value::Int(1), Value::Null, Value::Int(2)]);
        assert_eq!(count.call(&ctx, &[group]).unwrap(), Value::Int(2));
        assert_eq!(
            count.call(&ctx, &[Value::Array(vec![])]).unwrap(),
            Value::Int(0)
        );
    }

    #[test]
    fn test_builtin_sum_avg_min_max() {
        let ctx = Context::new();
        let registry = UdfRegistry::default();
        let sum = registry.lookup("sum").unwrap();
        assert_eq!(sum.call(&ctx, &[ints(&[1, 2, 3])]).unwrap(), Value::Int(6));
        assert_eq!(sum.call(&ctx, &[ints(&[])]).unwrap(), Value::Null);

        let avg = registry.lookup("avg").unwrap();
        assert_eq!(
            avg.call(&ctx, &[ints(&[1, 2, 3])]).unwrap(),
            Value::Float(2.0)
        );

        let min = registry.lookup("min").unwrap();
        assert_eq!(min.call(&ctx, &[ints(&[3, 1, 2])]).unwrap(), Value::Int(1));
        let max = registry.lookup("max").unwrap();
        assert_eq!(max.call(&ctx, &[ints(&[3, 1, 2])]).unwrap(), Value::Int(3));
    }

    #[test]
    fn test_builtin_str() {
        let ctx = Context::new();
        let registry = UdfRegistry::default();
        let str_fn = registry.lookup("str").unwrap();
        assert_eq!(
            str_fn.call(&ctx, &[Value::Int(0)]).unwrap(),
            Value::Str("0".to_string())
        );
    }

    #[test]
    fn test_lookup_is_case_insensitive() {
        let registry = UdfRegistry::default();
        assert!(registry.lookup("COUNT").is_some());
        assert!(registry.is_aggregate("Count"));
        assert!(!registry.is_aggregate("str"));
        assert!(!registry.is_aggregate("no_such_fn"));
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let registry = UdfRegistry::default();
        let udf = Udf::scalar(Vec::new(), false, |_, _| Ok(Value::Null));
        assert!(registry.register("str", udf).is_err());
    }
}
