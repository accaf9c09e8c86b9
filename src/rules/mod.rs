//! Routing-rule DSL evaluator.
//!
//! Pure function `eval(rule, ctx) -> bool` over `serde_json::Value`,
//! supporting a small Mongo-like query language: `$and`/`$or`/`$not`,
//! dot-path field lookup, shorthand equality, and per-field operators.

use crate::error::{RelayError, Result};
use chrono::{DateTime, Utc};
use serde_json::Value;

fn get_by_path<'a>(ctx: &'a Value, path: &str) -> Option<&'a Value> {
    let mut cur = ctx;
    for part in path.split('.') {
        cur = cur.as_object()?.get(part)?;
    }
    Some(cur)
}

/// Promote an ISO-8601 string to a timestamp; pass through everything
/// else unchanged. Lets `$gt`/`$lt`/`$between` compare timestamps
/// correctly instead of falling back to lexical string ordering.
fn to_comparable(v: &Value) -> Comparable {
    if let Value::String(s) = v {
        if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
            return Comparable::Time(dt.with_timezone(&Utc));
        }
    }
    Comparable::Raw(v.clone())
}

#[derive(Debug, Clone, PartialEq, PartialOrd)]
enum Comparable {
    Time(DateTime<Utc>),
    Raw(Value),
}

fn cmp_values(op: &str, left: &Value, right: &Value) -> Result<bool> {
    let (l, r) = (to_comparable(left), to_comparable(right));
    let ordering = match (&l, &r) {
        (Comparable::Time(a), Comparable::Time(b)) => a.partial_cmp(b),
        _ => json_partial_cmp(left, right),
    };

    Ok(match op {
        "$eq" => values_equal(left, right),
        "$ne" => !values_equal(left, right),
        "$gt" => matches!(ordering, Some(std::cmp::Ordering::Greater)),
        "$gte" => matches!(ordering, Some(std::cmp::Ordering::Greater) | Some(std::cmp::Ordering::Equal)),
        "$lt" => matches!(ordering, Some(std::cmp::Ordering::Less)),
        "$lte" => matches!(ordering, Some(std::cmp::Ordering::Less) | Some(std::cmp::Ordering::Equal)),
        other => return Err(RelayError::UnsupportedOperator(other.to_string())),
    })
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (to_comparable(a), to_comparable(b)) {
        (Comparable::Time(x), Comparable::Time(y)) => x == y,
        _ => a == b,
    }
}

fn json_partial_cmp(a: &Value, b: &Value) -> Option<std::cmp::Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

fn regex_match(val: &Value, spec: &Value) -> Result<bool> {
    let Some(s) = val.as_str() else { return Ok(false) };
    let (pattern, flags) = match spec {
        Value::Object(o) => (
            o.get("pattern").and_then(Value::as_str).unwrap_or("").to_string(),
            o.get("flags").and_then(Value::as_str).unwrap_or("").to_string(),
        ),
        Value::String(p) => (p.clone(), String::new()),
        _ => return Ok(false),
    };

    let mut builder = regex::RegexBuilder::new(&pattern);
    builder.case_insensitive(flags.contains('i'));
    builder.multi_line(flags.contains('m'));
    let re = builder
        .build()
        .map_err(|e| RelayError::UnsupportedOperator(format!("invalid $regex pattern: {e}")))?;
    Ok(re.is_match(s))
}

fn contains(container: &Value, needle: &Value) -> bool {
    match container {
        Value::String(s) => needle.as_str().map(|n| s.contains(n)).unwrap_or(false),
        Value::Array(items) => items.contains(needle),
        _ => false,
    }
}

fn between(val: &Value, range: &Value) -> bool {
    let Some(items) = range.as_array() else { return false };
    if items.len() != 2 {
        return false;
    }
    let (lo, hi) = (&items[0], &items[1]);
    let lo_le_val = json_partial_cmp(lo, val).map(|o| o != std::cmp::Ordering::Greater).unwrap_or(false)
        || matches!((to_comparable(lo), to_comparable(val)), (Comparable::Time(a), Comparable::Time(b)) if a <= b);
    let val_le_hi = json_partial_cmp(val, hi).map(|o| o != std::cmp::Ordering::Greater).unwrap_or(false)
        || matches!((to_comparable(val), to_comparable(hi)), (Comparable::Time(a), Comparable::Time(b)) if a <= b);
    lo_le_val && val_le_hi
}

/// Evaluate a rule expression against a message context.
///
/// `ctx` is typically `{"device": ..., "device_type": ..., "topic": ...,
/// "message": {...}}`.
pub fn eval(rule: &Value, ctx: &Value) -> Result<bool> {
    match rule {
        Value::Bool(b) => Ok(*b),
        Value::Array(items) => {
            for item in items {
                if !eval(item, ctx)? {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        Value::Object(map) => {
            if let Some(and) = map.get("$and") {
                let items = and.as_array().ok_or_else(|| {
                    RelayError::UnsupportedOperator("$and requires an array".to_string())
                })?;
                for item in items {
                    if !eval(item, ctx)? {
                        return Ok(false);
                    }
                }
                return Ok(true);
            }
            if let Some(or) = map.get("$or") {
                let items = or.as_array().ok_or_else(|| {
                    RelayError::UnsupportedOperator("$or requires an array".to_string())
                })?;
                for item in items {
                    if eval(item, ctx)? {
                        return Ok(true);
                    }
                }
                return Ok(false);
            }
            if let Some(not) = map.get("$not") {
                return Ok(!eval(not, ctx)?);
            }

            for (field, cond) in map {
                let val = get_by_path(ctx, field);
                let is_op_map = cond
                    .as_object()
                    .map(|o| o.keys().any(|k| k.starts_with('$')))
                    .unwrap_or(false);

                if !is_op_map {
                    // equality shorthand
                    match val {
                        Some(v) if values_equal(v, cond) => continue,
                        _ => return Ok(false),
                    }
                }

                let cond_map = cond.as_object().unwrap();
                for (op, arg) in cond_map {
                    let ok = match op.as_str() {
                        "$eq" | "$ne" | "$gt" | "$gte" | "$lt" | "$lte" => {
                            let left = val.cloned().unwrap_or(Value::Null);
                            cmp_values(op, &left, arg)?
                        }
                        "$in" => {
                            let arr = arg.as_array().ok_or_else(|| {
                                RelayError::UnsupportedOperator("$in requires an array".to_string())
                            })?;
                            val.map(|v| arr.contains(v)).unwrap_or(false)
                        }
                        "$nin" => {
                            let arr = arg.as_array().ok_or_else(|| {
                                RelayError::UnsupportedOperator("$nin requires an array".to_string())
                            })?;
                            !val.map(|v| arr.contains(v)).unwrap_or(false)
                        }
                        "$exists" => {
                            let exists = val.map(|v| !v.is_null()).unwrap_or(false);
                            arg.as_bool().unwrap_or(true) == exists
                        }
                        "$regex" => val.map(|v| regex_match(v, arg)).transpose()?.unwrap_or(false),
                        "$contains" => val.map(|v| contains(v, arg)).unwrap_or(false),
                        "$startswith" => val
                            .and_then(Value::as_str)
                            .zip(arg.as_str())
                            .map(|(v, a)| v.starts_with(a))
                            .unwrap_or(false),
                        "$endswith" => val
                            .and_then(Value::as_str)
                            .zip(arg.as_str())
                            .map(|(v, a)| v.ends_with(a))
                            .unwrap_or(false),
                        "$between" => val.map(|v| between(v, arg)).unwrap_or(false),
                        "$elemMatch" => match val.and_then(Value::as_array) {
                            Some(items) => {
                                let mut matched = false;
                                for item in items {
                                    let mut sub_ctx = ctx.clone();
                                    if let Value::Object(m) = &mut sub_ctx {
                                        m.insert("this".to_string(), item.clone());
                                    }
                                    if eval(arg, &sub_ctx)? || eval(arg, item)? {
                                        matched = true;
                                        break;
                                    }
                                }
                                matched
                            }
                            None => false,
                        },
                        other => return Err(RelayError::UnsupportedOperator(other.to_string())),
                    };
                    if !ok {
                        return Ok(false);
                    }
                }
            }
            Ok(true)
        }
        _ => Ok(false),
    }
}
