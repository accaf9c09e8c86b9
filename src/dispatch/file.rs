//! File destination dispatcher. Appends one newline-delimited JSON object
//! per point to `destination.uri`, an append-only line-oriented format
//! good for local testing and archival destinations alike.

use super::{DispatchOutcome, DispatchPoint, Dispatcher};
use crate::error::{RelayError, Result};
use crate::model::ClientDestination;
use async_trait::async_trait;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;

pub struct FileDispatcher {
    path: std::path::PathBuf,
}

impl FileDispatcher {
    pub fn new(destination: &ClientDestination) -> Result<Self> {
        let uri = destination
            .uri
            .clone()
            .ok_or_else(|| RelayError::Config(format!("file destination #{} has no uri", destination.id)))?;
        Ok(Self { path: std::path::PathBuf::from(uri) })
    }
}

#[async_trait]
impl Dispatcher for FileDispatcher {
    async fn dispatch(&self, points: &[DispatchPoint]) -> Result<DispatchOutcome> {
        if points.is_empty() {
            return Ok(DispatchOutcome::sent("no points to send"));
        }

        let mut file = OpenOptions::new().create(true).append(true).open(&self.path).await?;

        for dp in points {
            let line = serde_json::json!({
                "device_id": dp.point.device_id,
                "key_name": dp.key_name,
                "ts": dp.point.ts,
                "unit": dp.point.unit,
                "quality": dp.point.quality,
                "value": &dp.point.value,
                "meta_json": dp.point.meta_json,
            });
            file.write_all(line.to_string().as_bytes()).await?;
            file.write_all(b"\n").await?;
        }
        file.flush().await?;

        Ok(DispatchOutcome::sent(format!("appended {} lines to {}", points.len(), self.path.display())))
    }
}
