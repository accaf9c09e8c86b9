//! HTTP destination dispatcher.
//!
//! Posts a batch of points as one JSON array to `destination.uri`.

use super::{DispatchOutcome, DispatchPoint, Dispatcher};
use crate::error::{RelayError, Result};
use crate::model::ClientDestination;
use async_trait::async_trait;
use serde::Serialize;

#[derive(Serialize)]
struct HttpPoint<'a> {
    device_id: i64,
    key_name: &'a str,
    ts: chrono::DateTime<chrono::Utc>,
    unit: Option<&'a str>,
    quality: &'a str,
    #[serde(flatten)]
    value: serde_json::Value,
}

pub struct HttpDispatcher {
    client: reqwest::Client,
    uri: String,
}

impl HttpDispatcher {
    pub fn new(destination: &ClientDestination) -> Result<Self> {
        let uri = destination
            .uri
            .clone()
            .ok_or_else(|| RelayError::Config(format!("http destination #{} has no uri", destination.id)))?;
        Ok(Self { client: reqwest::Client::new(), uri })
    }
}

fn point_value_json(value: &crate::value::PointValue) -> serde_json::Value {
    use crate::value::PointValue;
    match value {
        PointValue::Num(n) => serde_json::json!({ "value": n }),
        PointValue::Str(s) => serde_json::json!({ "value": s }),
        PointValue::Bool(b) => serde_json::json!({ "value": b }),
        PointValue::Json(v) => serde_json::json!({ "value": v }),
    }
}

#[async_trait]
impl Dispatcher for HttpDispatcher {
    async fn dispatch(&self, points: &[DispatchPoint]) -> Result<DispatchOutcome> {
        if points.is_empty() {
            return Ok(DispatchOutcome::sent("no points to send"));
        }

        let body: Vec<HttpPoint> = points
            .iter()
            .map(|dp| HttpPoint {
                device_id: dp.point.device_id,
                key_name: &dp.key_name,
                ts: dp.point.ts,
                unit: dp.point.unit.as_deref(),
                quality: &dp.point.quality,
                value: point_value_json(&dp.point.value),
            })
            .collect();

        let response = match self.client.post(&self.uri).json(&body).send().await {
            Ok(r) => r,
            Err(e) => return Ok(DispatchOutcome::failed(format!("http request failed: {e}"))),
        };

        let status = response.status();
        let snippet: String = response.text().await.unwrap_or_default().chars().take(200).collect();

        Ok(DispatchOutcome {
            sent: status.is_success(),
            http_status: Some(status.as_u16() as i32),
            response_snippet: snippet,
        })
    }
}
