//! Per-destination dispatch subsystem.
//!
//! Each [`Dispatcher`] impl owns delivering a batch of [`ParsedPoint`]s to
//! one destination type and reporting back a [`DispatchOutcome`]. The
//! retry state machine (`queued -> {sent | retrying -> {sent | dead} |
//! failed}`) lives in [`next_retry_at`] / [`DispatchStatus`] transitions,
//! applied by the processor after a dispatcher call returns.

#[cfg(feature = "dispatch-file")]
pub mod file;
#[cfg(feature = "dispatch-http")]
pub mod http;
#[cfg(feature = "dispatch-kafka")]
pub mod kafka;
#[cfg(feature = "dispatch-mysql")]
pub mod mysql;
#[cfg(feature = "dispatch-postgres")]
pub mod postgres;

use crate::error::{RelayError, Result};
use crate::model::{ClientDestination, DestinationType, ParsedPoint};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

/// A [`ParsedPoint`] paired with its metric's `key_name`, the shape
/// dispatchers actually serialize (original canonical point dict keys on
/// `key_name`, not the relay's internal `metric_id`).
#[derive(Debug, Clone)]
pub struct DispatchPoint {
    pub point: ParsedPoint,
    pub key_name: String,
}

#[derive(Debug, Clone)]
pub struct DispatchOutcome {
    pub sent: bool,
    pub http_status: Option<i32>,
    pub response_snippet: String,
}

impl DispatchOutcome {
    pub fn sent(snippet: impl Into<String>) -> Self {
        Self { sent: true, http_status: None, response_snippet: snippet.into() }
    }

    pub fn failed(snippet: impl Into<String>) -> Self {
        Self { sent: false, http_status: None, response_snippet: snippet.into() }
    }
}

#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn dispatch(&self, points: &[DispatchPoint]) -> Result<DispatchOutcome>;
}

/// Build the dispatcher for `destination`'s type, decoding its secret with
/// `master_key` (already resolved from the key ring for
/// `destination.encryption_version`) when it has one.
pub fn build(destination: &ClientDestination, decoded_password: Option<String>) -> Result<Box<dyn Dispatcher>> {
    let kind: DestinationType = destination.type_.parse()?;
    match kind {
        #[cfg(feature = "dispatch-mysql")]
        DestinationType::Mysql => Ok(Box::new(mysql::MysqlDispatcher::new(destination, decoded_password)?)),
        #[cfg(feature = "dispatch-postgres")]
        DestinationType::Postgres => Ok(Box::new(postgres::PostgresDispatcher::new(destination, decoded_password)?)),
        #[cfg(feature = "dispatch-http")]
        DestinationType::Http => Ok(Box::new(http::HttpDispatcher::new(destination)?)),
        #[cfg(feature = "dispatch-kafka")]
        DestinationType::Kafka => Ok(Box::new(kafka::KafkaDispatcher::new(destination)?)),
        #[cfg(feature = "dispatch-file")]
        DestinationType::File => Ok(Box::new(file::FileDispatcher::new(destination)?)),
        other => Err(RelayError::DispatcherNotFound(other.as_str().to_string())),
    }
}

/// Exponential backoff for `retrying` dispatches: 30s * 2^(attempts-1),
/// capped at one hour.
pub fn next_retry_at(attempts: i32, now: DateTime<Utc>) -> DateTime<Utc> {
    let backoff_secs = 30i64.saturating_mul(1i64 << attempts.clamp(0, 6));
    now + Duration::seconds(backoff_secs.min(3600))
}

/// A dispatch gives up after this many attempts and moves to `dead`.
pub const MAX_ATTEMPTS: i32 = 8;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_caps() {
        let now = Utc::now();
        let first = next_retry_at(1, now);
        let second = next_retry_at(2, now);
        assert!(second > first);
        let capped = next_retry_at(20, now);
        assert_eq!(capped, now + Duration::seconds(3600));
    }
}
