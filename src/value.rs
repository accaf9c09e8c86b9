//! Canonical point values.
//!
//! A [`ParsedPoint`](crate::model::ParsedPoint) carries exactly one of
//! `num_value`, `str_value`, `bool_value`, `json_value`. We model that as
//! a tagged enum here and serialize to the columnar split at the
//! repository/dispatcher boundary instead of passing four `Option` fields
//! around everywhere.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PointValue {
    Num(f64),
    Str(String),
    Bool(bool),
    Json(serde_json::Value),
}

impl PointValue {
    /// Classify a raw parser-returned JSON value into the canonical
    /// column it belongs in.
    ///
    /// Order matters: `serde_json::Value::Bool` must be checked before
    /// `Number`, since a naive `as_i64()`/`as_bool()` probe on a JSON
    /// value would accept `0`/`1` as booleans and silently corrupt the
    /// `bool_value` column.
    pub fn classify(raw: &serde_json::Value) -> Option<Self> {
        match raw {
            serde_json::Value::Bool(b) => Some(PointValue::Bool(*b)),
            serde_json::Value::Number(n) => n.as_f64().map(PointValue::Num),
            serde_json::Value::String(s) => Some(PointValue::Str(s.clone())),
            serde_json::Value::Array(_) | serde_json::Value::Object(_) => {
                Some(PointValue::Json(raw.clone()))
            }
            serde_json::Value::Null => None,
        }
    }

    pub fn as_num(&self) -> Option<f64> {
        match self {
            PointValue::Num(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            PointValue::Str(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            PointValue::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            PointValue::Json(v) => Some(v),
            _ => None,
        }
    }
}
