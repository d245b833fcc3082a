//! Builtin template functions

use std::cmp::Ordering;
use std::fmt;

use serde_json::{Number, Value};

use super::render::{is_truthy, type_name};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Func {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Not,
    And,
    Or,
    Len,
    Index,
}

impl Func {
    pub(crate) fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "eq" => Func::Eq,
            "ne" => Func::Ne,
            "lt" => Func::Lt,
            "le" => Func::Le,
            "gt" => Func::Gt,
            "ge" => Func::Ge,
            "not" => Func::Not,
            "and" => Func::And,
            "or" => Func::Or,
            "len" => Func::Len,
            "index" => Func::Index,
            _ => return None,
        })
    }

    fn name(self) -> &'static str {
        match self {
            Func::Eq => "eq",
            Func::Ne => "ne",
            Func::Lt => "lt",
            Func::Le => "le",
            Func::Gt => "gt",
            Func::Ge => "ge",
            Func::Not => "not",
            Func::And => "and",
            Func::Or => "or",
            Func::Len => "len",
            Func::Index => "index",
        }
    }
}

impl fmt::Display for Func {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

fn arity(func: Func, want: &str, got: usize) -> String {
    format!("wrong number of args for {func}: want {want} got {got}")
}

/// `and` / `or`: the first argument that decides the result, else the last
///
/// Arguments are pulled one at a time so later ones are never evaluated once
/// the result is known.
pub(super) fn logical<I>(func: Func, args: I) -> Result<Value, String>
where
    I: IntoIterator<Item = Result<Value, String>>,
{
    let stop_on = func == Func::Or;
    let mut last = None;
    for arg in args {
        let value = arg?;
        if is_truthy(&value) == stop_on {
            return Ok(value);
        }
        last = Some(value);
    }
    last.ok_or_else(|| arity(func, "at least 1", 0))
}

/// Apply a builtin to evaluated arguments
pub(super) fn apply(func: Func, args: &[Value]) -> Result<Value, String> {
    match func {
        Func::Eq => {
            let [first, rest @ ..] = args else {
                return Err(arity(func, "at least 2", args.len()));
            };
            if rest.is_empty() {
                return Err(arity(func, "at least 2", args.len()));
            }
            for other in rest {
                if equal(first, other)? {
                    return Ok(Value::Bool(true));
                }
            }
            Ok(Value::Bool(false))
        }
        Func::Ne => {
            let [a, b] = args else {
                return Err(arity(func, "2", args.len()));
            };
            Ok(Value::Bool(!equal(a, b)?))
        }
        Func::Lt => ordered(func, args, Ordering::is_lt),
        Func::Le => ordered(func, args, Ordering::is_le),
        Func::Gt => ordered(func, args, Ordering::is_gt),
        Func::Ge => ordered(func, args, Ordering::is_ge),
        Func::Not => {
            let [a] = args else {
                return Err(arity(func, "1", args.len()));
            };
            Ok(Value::Bool(!is_truthy(a)))
        }
        Func::And | Func::Or => logical(func, args.iter().cloned().map(Ok)),
        Func::Len => {
            let [a] = args else {
                return Err(arity(func, "1", args.len()));
            };
            let len = match a {
                Value::String(s) => s.len(),
                Value::Array(items) => items.len(),
                Value::Object(map) => map.len(),
                other => return Err(format!("len of {}", type_name(other))),
            };
            Ok(Value::from(len))
        }
        Func::Index => {
            let [item, keys @ ..] = args else {
                return Err(arity(func, "at least 1", 0));
            };
            keys.iter().try_fold(item.clone(), |current, key| index(&current, key))
        }
    }
}

fn index(item: &Value, key: &Value) -> Result<Value, String> {
    match (item, key) {
        (Value::Array(items), Value::Number(n)) => n
            .as_u64()
            .and_then(|i| usize::try_from(i).ok())
            .and_then(|i| items.get(i))
            .cloned()
            .ok_or_else(|| format!("index out of range: {n}")),
        // Missing keys read as null, like a missing map entry
        (Value::Object(map), Value::String(k)) => Ok(map.get(k).cloned().unwrap_or(Value::Null)),
        (Value::Null, _) => Err("index of untyped nil".to_string()),
        (item, key) => Err(format!(
            "can't index item of type {} with {}",
            type_name(item),
            type_name(key)
        )),
    }
}

fn compare_numbers(a: &Number, b: &Number) -> Option<Ordering> {
    if let (Some(a), Some(b)) = (a.as_i64(), b.as_i64()) {
        return Some(a.cmp(&b));
    }
    if let (Some(a), Some(b)) = (a.as_u64(), b.as_u64()) {
        return Some(a.cmp(&b));
    }
    a.as_f64()?.partial_cmp(&b.as_f64()?)
}

fn equal(a: &Value, b: &Value) -> Result<bool, String> {
    match (a, b) {
        (Value::Array(_) | Value::Object(_), _) | (_, Value::Array(_) | Value::Object(_)) => {
            Err(format!(
                "non-comparable types {} and {}",
                type_name(a),
                type_name(b)
            ))
        }
        (Value::Null, other) | (other, Value::Null) => Ok(other.is_null()),
        (Value::Bool(x), Value::Bool(y)) => Ok(x == y),
        (Value::String(x), Value::String(y)) => Ok(x == y),
        (Value::Number(x), Value::Number(y)) => Ok(compare_numbers(x, y) == Some(Ordering::Equal)),
        _ => Err(format!(
            "incompatible types for comparison: {} and {}",
            type_name(a),
            type_name(b)
        )),
    }
}

fn ordered(func: Func, args: &[Value], test: fn(Ordering) -> bool) -> Result<Value, String> {
    let [a, b] = args else {
        return Err(arity(func, "2", args.len()));
    };
    let ordering = match (a, b) {
        (Value::Number(x), Value::Number(y)) => {
            compare_numbers(x, y).ok_or_else(|| format!("{func}: cannot order {x} and {y}"))?
        }
        (Value::String(x), Value::String(y)) => x.cmp(y),
        _ => {
            return Err(format!(
                "incompatible types for comparison: {} and {}",
                type_name(a),
                type_name(b)
            ));
        }
    };
    Ok(Value::Bool(test(ordering)))
}
