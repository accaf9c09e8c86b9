//! MySQL destination dispatcher.
//!
//! A configurable `column_map`/`conflict_keys`/`on_conflict`/`batch_size`
//! drive an `INSERT ... ON DUPLICATE KEY UPDATE` (or `INSERT IGNORE`, or
//! plain `INSERT`) built per destination. Connects fresh per dispatch call
//! since each client destination carries its own credentials.
//!
//! `device_id`/`metric_id` are rewritten through the `devices`/`metrics`
//! lookup tables embedded in each point's `meta_json` (keyed on the
//! stringified raw id), falling back to the raw id when a point's
//! `meta_json` carries no entry for it.

use super::{DispatchOutcome, DispatchPoint, Dispatcher};
use crate::error::{RelayError, Result};
use crate::model::ClientDestination;
use crate::value::PointValue;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use sqlx::mysql::{MySqlConnectOptions, MySqlPoolOptions};
use sqlx::{MySql, Pool, QueryBuilder};
use std::collections::HashMap;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct MysqlOptions {
    table: String,
    column_map: HashMap<String, String>,
    conflict_keys: Vec<String>,
    on_conflict: String,
    batch_size: usize,
}

impl Default for MysqlOptions {
    fn default() -> Self {
        let column_map = [
            ("device_id", "device_id"),
            ("key_name", "key_name"),
            ("ts", "ts"),
            ("value", "value"),
            ("unit", "unit"),
            ("quality", "quality"),
            ("meta_json", "meta_json"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        Self {
            table: "parsed_points".to_string(),
            column_map,
            conflict_keys: vec!["device_id".to_string(), "key_name".to_string(), "ts".to_string()],
            on_conflict: "update".to_string(),
            batch_size: 1000,
        }
    }
}

pub struct MysqlDispatcher {
    host: String,
    port: u16,
    database: String,
    username: String,
    password: Option<String>,
    opts: MysqlOptions,
}

impl MysqlDispatcher {
    pub fn new(destination: &ClientDestination, decoded_password: Option<String>) -> Result<Self> {
        let opts: MysqlOptions = match &destination.options_json {
            Some(raw) if !raw.trim().is_empty() => serde_json::from_str(raw)
                .map_err(|e| RelayError::Config(format!("invalid options_json for destination #{}: {e}", destination.id)))?,
            _ => MysqlOptions::default(),
        };

        Ok(Self {
            host: destination.host.clone().unwrap_or_else(|| "127.0.0.1".to_string()),
            port: destination.port.unwrap_or(3306) as u16,
            database: destination.database_name.clone().unwrap_or_default(),
            username: destination.username.clone().unwrap_or_default(),
            password: decoded_password,
            opts,
        })
    }

    async fn connect(&self) -> Result<Pool<MySql>> {
        let options = MySqlConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .database(&self.database)
            .username(&self.username)
            .password(self.password.as_deref().unwrap_or(""));
        Ok(MySqlPoolOptions::new().max_connections(1).connect_with(options).await?)
    }
}

fn resolve_one_value(point: &crate::model::ParsedPoint) -> Result<String> {
    match &point.value {
        PointValue::Num(n) => Ok(n.to_string()),
        PointValue::Str(s) => Ok(s.clone()),
        PointValue::Bool(b) => Ok(b.to_string()),
        PointValue::Json(v) => Ok(v.to_string()),
    }
}

/// Rewrite `raw_id` via `meta.get(table).get(str(raw_id))`, falling back to
/// the raw id unchanged when the table or the entry is absent.
fn remap_id(meta: &Value, table: &str, raw_id: i64) -> String {
    match meta.get(table).and_then(|t| t.get(raw_id.to_string())) {
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => raw_id.to_string(),
    }
}

#[async_trait]
impl Dispatcher for MysqlDispatcher {
    async fn dispatch(&self, points: &[DispatchPoint]) -> Result<DispatchOutcome> {
        if self.username.is_empty() || self.database.is_empty() {
            return Ok(DispatchOutcome::failed("missing username or database_name for mysql destination"));
        }
        if points.is_empty() {
            return Ok(DispatchOutcome::sent("no points to send"));
        }

        let pool = match self.connect().await {
            Ok(p) => p,
            Err(e) => return Ok(DispatchOutcome::failed(format!("connect error: {e}"))),
        };

        let src_keys: Vec<String> = self.opts.column_map.keys().cloned().collect();
        let dest_cols: Vec<&str> = src_keys.iter().map(|k| self.opts.column_map[k].as_str()).collect();
        let conflict_cols: Vec<&str> = self
            .opts
            .conflict_keys
            .iter()
            .filter_map(|k| self.opts.column_map.get(k).map(String::as_str))
            .collect();

        let mut total = 0usize;
        let mut affected_total = 0u64;

        for batch in points.chunks(self.opts.batch_size.max(1)) {
            let mut builder: QueryBuilder<MySql> = QueryBuilder::new(format!(
                "{} INTO `{}` ({})",
                match self.opts.on_conflict.as_str() {
                    "ignore" => "INSERT IGNORE",
                    _ => "INSERT",
                },
                self.opts.table,
                dest_cols.iter().map(|c| format!("`{c}`")).collect::<Vec<_>>().join(", ")
            ));

            let mut row_values: Vec<Vec<String>> = Vec::with_capacity(batch.len());
            for dp in batch {
                let meta: Value = serde_json::from_str(&dp.point.meta_json).unwrap_or(Value::Null);
                let mut row = Vec::with_capacity(src_keys.len());
                for key in &src_keys {
                    let val = match key.as_str() {
                        "ts" => dp.point.ts.to_rfc3339(),
                        "value" => resolve_one_value(&dp.point)?,
                        "device_id" => remap_id(&meta, "devices", dp.point.device_id),
                        "metric_id" => remap_id(&meta, "metrics", dp.point.metric_id),
                        "key_name" => dp.key_name.clone(),
                        "unit" => dp.point.unit.clone().unwrap_or_default(),
                        "quality" => dp.point.quality.clone(),
                        "meta_json" => dp.point.meta_json.clone(),
                        _ => String::new(),
                    };
                    row.push(val);
                }
                row_values.push(row);
            }

            builder.push_values(&row_values, |mut b, row| {
                for val in row {
                    b.push_bind(val.clone());
                }
            });

            if self.opts.on_conflict == "update" {
                let update_cols: Vec<&str> = dest_cols.iter().filter(|c| !conflict_cols.contains(c)).copied().collect();
                if !update_cols.is_empty() {
                    let set_sql = update_cols.iter().map(|c| format!("`{c}`=VALUES(`{c}`)")).collect::<Vec<_>>().join(", ");
                    builder.push(" ON DUPLICATE KEY UPDATE ").push(set_sql);
                }
            }

            let result = builder.build().execute(&pool).await;
            match result {
                Ok(r) => {
                    affected_total += r.rows_affected();
                    total += batch.len();
                }
                Err(e) => return Ok(DispatchOutcome::failed(format!("insert failed: {e}"))),
            }
        }

        Ok(DispatchOutcome::sent(format!(
            "table={}; rows={total}; affected={affected_total}; mode={}",
            self.opts.table, self.opts.on_conflict
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_options_match_original_job() {
        let opts = MysqlOptions::default();
        assert_eq!(opts.table, "parsed_points");
        assert_eq!(opts.on_conflict, "update");
        assert_eq!(opts.batch_size, 1000);
        assert_eq!(opts.conflict_keys, vec!["device_id", "key_name", "ts"]);
    }

    #[test]
    fn options_json_overrides_defaults() {
        let raw = r#"{"table":"custom_table","on_conflict":"ignore","batch_size":50}"#;
        let opts: MysqlOptions = serde_json::from_str(raw).unwrap();
        assert_eq!(opts.table, "custom_table");
        assert_eq!(opts.on_conflict, "ignore");
        assert_eq!(opts.batch_size, 50);
    }

    #[test]
    fn remap_id_rewrites_when_present_in_meta() {
        let meta: Value = serde_json::from_str(r#"{"devices":{"5":"dev-mapped"}}"#).unwrap();
        assert_eq!(remap_id(&meta, "devices", 5), "dev-mapped");
    }

    #[test]
    fn remap_id_falls_back_to_raw_id_when_absent() {
        let meta: Value = serde_json::from_str(r#"{"devices":{}}"#).unwrap();
        assert_eq!(remap_id(&meta, "devices", 5), "5");
        assert_eq!(remap_id(&Value::Null, "metrics", 9), "9");
    }

    #[test]
    fn remap_id_handles_both_tables_independently() {
        let meta: Value = serde_json::from_str(r#"{"devices":{"5":"dev-mapped"},"metrics":{"7":"metric-mapped"}}"#).unwrap();
        assert_eq!(remap_id(&meta, "devices", 5), "dev-mapped");
        assert_eq!(remap_id(&meta, "metrics", 7), "metric-mapped");
        assert_eq!(remap_id(&meta, "metrics", 8), "8");
    }
}
