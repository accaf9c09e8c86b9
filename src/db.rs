//! Persistence layer for the relay's own metadata schema.
//!
//! [`Repository`] abstracts every query/write the processor needs behind a
//! trait, following the thin `sqlx::FromRow`-per-method idiom used
//! elsewhere in this codebase (adapted from Postgres `$1` placeholders to
//! MySQL `?` placeholders).
//! [`SqlxRepository`] is the real `MySqlPool`-backed implementation; tests
//! use an in-memory fake (`src/processor/tests.rs`) instead of standing up
//! a database.

use crate::error::Result;
use crate::model::*;
use async_trait::async_trait;
use sqlx::mysql::MySqlPoolOptions;
use sqlx::MySqlPool;
use uuid::Uuid;

pub async fn connect(url: &str, max_connections: u32) -> Result<MySqlPool> {
    let pool = MySqlPoolOptions::new().max_connections(max_connections).connect(url).await?;
    Ok(pool)
}

#[async_trait]
pub trait Repository: Send + Sync {
    async fn topic_by_name(&self, topic: &str, active_only: bool) -> Result<Option<MqttTopic>>;
    async fn device(&self, id: i64) -> Result<Option<Device>>;
    async fn client(&self, id: i64) -> Result<Option<Client>>;
    async fn device_type(&self, id: i64) -> Result<Option<DeviceType>>;
    async fn metric(&self, id: i64) -> Result<Option<Metric>>;

    /// Active routes whose `client_id`/`topic_id` match and whose
    /// `device_id` is either this device or NULL.
    async fn candidate_routes(&self, client_id: i64, topic_id: i64, device_id: i64) -> Result<Vec<RoutingRule>>;
    async fn parser(&self, id: i64) -> Result<Option<Parser>>;
    async fn deposits_for_rule(&self, rule_id: Uuid) -> Result<Vec<RouteDeposit>>;
    async fn destination(&self, id: i64) -> Result<Option<ClientDestination>>;

    async fn create_extraction(&self, extraction: &Extraction) -> Result<()>;
    async fn create_parsed_point(&self, point: &ParsedPoint) -> Result<()>;
    async fn create_dispatch(&self, dispatch: &Dispatch) -> Result<()>;
    async fn update_dispatch(&self, dispatch: &Dispatch) -> Result<()>;

    async fn unprocessed_messages(&self) -> Result<Vec<MqttMessage>>;
    async fn mark_message_processed(&self, message_id: i64, extraction_id: Uuid, processed: bool) -> Result<()>;

    async fn job(&self, name: &str) -> Result<Option<Job>>;
    async fn set_job_state(&self, name: &str, state: JobState) -> Result<()>;
    async fn finish_job(&self, name: &str, exit_code: i32) -> Result<()>;

    async fn client_destinations_for_reencryption(&self) -> Result<Vec<ClientDestination>>;
    async fn update_destination_secret(&self, destination_id: i64, password_enc: &str, encryption_version: &str) -> Result<()>;
    async fn crypto_keys(&self) -> Result<Vec<CryptoKeyRow>>;
    async fn crypto_config(&self) -> Result<Option<CryptoConfigRow>>;
    async fn update_crypto_config(&self, algorithm: &str, key_source: &str, key_id: &str, version: i32) -> Result<()>;
    async fn create_crypto_key(&self, key_id: &str, version: i32, key_material: &str) -> Result<()>;
}

pub struct SqlxRepository {
    pool: MySqlPool,
}

impl SqlxRepository {
    pub fn new(pool: MySqlPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Repository for SqlxRepository {
    async fn topic_by_name(&self, topic: &str, active_only: bool) -> Result<Option<MqttTopic>> {
        let row = if active_only {
            sqlx::query_as::<_, MqttTopic>("SELECT * FROM mqtt_topic WHERE topic = ? AND active = 1")
                .bind(topic)
                .fetch_optional(&self.pool)
                .await?
        } else {
            sqlx::query_as::<_, MqttTopic>("SELECT * FROM mqtt_topic WHERE topic = ?")
                .bind(topic)
                .fetch_optional(&self.pool)
                .await?
        };
        Ok(row)
    }

    async fn device(&self, id: i64) -> Result<Option<Device>> {
        Ok(sqlx::query_as::<_, Device>("SELECT * FROM device WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn client(&self, id: i64) -> Result<Option<Client>> {
        Ok(sqlx::query_as::<_, Client>("SELECT * FROM client WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn device_type(&self, id: i64) -> Result<Option<DeviceType>> {
        Ok(sqlx::query_as::<_, DeviceType>("SELECT * FROM device_type WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn metric(&self, id: i64) -> Result<Option<Metric>> {
        Ok(sqlx::query_as::<_, Metric>("SELECT * FROM metric_catalog WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn candidate_routes(&self, client_id: i64, topic_id: i64, device_id: i64) -> Result<Vec<RoutingRule>> {
        Ok(sqlx::query_as::<_, RoutingRule>(
            "SELECT * FROM routing_rule \
             WHERE client_id = ? AND topic_id = ? AND active = 1 \
             AND (device_id = ? OR device_id IS NULL)",
        )
        .bind(client_id)
        .bind(topic_id)
        .bind(device_id)
        .fetch_all(&self.pool)
        .await?)
    }

    async fn parser(&self, id: i64) -> Result<Option<Parser>> {
        Ok(sqlx::query_as::<_, Parser>("SELECT * FROM parser WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn deposits_for_rule(&self, rule_id: Uuid) -> Result<Vec<RouteDeposit>> {
        Ok(sqlx::query_as::<_, RouteDeposit>("SELECT * FROM route_deposit WHERE rule_id = ?")
            .bind(rule_id)
            .fetch_all(&self.pool)
            .await?)
    }

    async fn destination(&self, id: i64) -> Result<Option<ClientDestination>> {
        Ok(sqlx::query_as::<_, ClientDestination>("SELECT * FROM client_destination WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn create_extraction(&self, extraction: &Extraction) -> Result<()> {
        sqlx::query(
            "INSERT INTO extraction (id, message_id, parser_id, parser_config, parsed_at, success, error_text, extracted_count) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(extraction.id)
        .bind(extraction.message_id)
        .bind(extraction.parser_id)
        .bind(&extraction.parser_config)
        .bind(extraction.parsed_at)
        .bind(extraction.success)
        .bind(&extraction.error_text)
        .bind(extraction.extracted_count)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn create_parsed_point(&self, point: &ParsedPoint) -> Result<()> {
        let (num_value, str_value, bool_value, json_value) = split_point_value(&point.value);
        sqlx::query(
            "INSERT INTO parsed_point (extraction_id, device_id, metric_id, ts, num_value, str_value, bool_value, json_value, unit, quality, meta_json) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(point.extraction_id)
        .bind(point.device_id)
        .bind(point.metric_id)
        .bind(point.ts)
        .bind(num_value)
        .bind(str_value)
        .bind(bool_value)
        .bind(json_value)
        .bind(&point.unit)
        .bind(&point.quality)
        .bind(&point.meta_json)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn create_dispatch(&self, dispatch: &Dispatch) -> Result<()> {
        sqlx::query(
            "INSERT INTO dispatch (id, extraction_id, destination_id, rule_id, status, http_status, response_snippet, attempts, next_retry_at, sent_at, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(dispatch.id)
        .bind(dispatch.extraction_id)
        .bind(dispatch.destination_id)
        .bind(dispatch.rule_id)
        .bind(&dispatch.status)
        .bind(dispatch.http_status)
        .bind(&dispatch.response_snippet)
        .bind(dispatch.attempts)
        .bind(dispatch.next_retry_at)
        .bind(dispatch.sent_at)
        .bind(dispatch.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_dispatch(&self, dispatch: &Dispatch) -> Result<()> {
        sqlx::query(
            "UPDATE dispatch SET status = ?, http_status = ?, response_snippet = ?, attempts = ?, next_retry_at = ?, sent_at = ?, updated_at = ? \
             WHERE id = ?",
        )
        .bind(&dispatch.status)
        .bind(dispatch.http_status)
        .bind(&dispatch.response_snippet)
        .bind(dispatch.attempts)
        .bind(dispatch.next_retry_at)
        .bind(dispatch.sent_at)
        .bind(dispatch.updated_at)
        .bind(dispatch.id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn unprocessed_messages(&self) -> Result<Vec<MqttMessage>> {
        Ok(sqlx::query_as::<_, MqttMessage>("SELECT * FROM mqtt_messages WHERE processed = 0")
            .fetch_all(&self.pool)
            .await?)
    }

    async fn mark_message_processed(&self, message_id: i64, extraction_id: Uuid, processed: bool) -> Result<()> {
        sqlx::query("UPDATE mqtt_messages SET processor = ?, processed = ? WHERE id = ?")
            .bind(extraction_id)
            .bind(processed)
            .bind(message_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn job(&self, name: &str) -> Result<Option<Job>> {
        Ok(sqlx::query_as::<_, Job>("SELECT * FROM job WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn set_job_state(&self, name: &str, state: JobState) -> Result<()> {
        sqlx::query("UPDATE job SET state = ?, last_state_update = NOW() WHERE name = ?")
            .bind(state.as_str())
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn finish_job(&self, name: &str, exit_code: i32) -> Result<()> {
        sqlx::query("UPDATE job SET state = ?, last_exit_code = ?, last_state_update = NOW() WHERE name = ?")
            .bind(JobState::Idle.as_str())
            .bind(exit_code)
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn client_destinations_for_reencryption(&self) -> Result<Vec<ClientDestination>> {
        Ok(
            sqlx::query_as::<_, ClientDestination>("SELECT * FROM client_destination WHERE password_enc IS NOT NULL")
                .fetch_all(&self.pool)
                .await?,
        )
    }

    async fn update_destination_secret(&self, destination_id: i64, password_enc: &str, encryption_version: &str) -> Result<()> {
        sqlx::query("UPDATE client_destination SET password_enc = ?, encryption_version = ? WHERE id = ?")
            .bind(password_enc.as_bytes())
            .bind(encryption_version)
            .bind(destination_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn crypto_keys(&self) -> Result<Vec<CryptoKeyRow>> {
        Ok(sqlx::query_as::<_, CryptoKeyRow>("SELECT * FROM crypto_key")
            .fetch_all(&self.pool)
            .await?)
    }

    async fn crypto_config(&self) -> Result<Option<CryptoConfigRow>> {
        Ok(sqlx::query_as::<_, CryptoConfigRow>("SELECT * FROM crypto_config WHERE id = 1")
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn update_crypto_config(&self, algorithm: &str, key_source: &str, key_id: &str, version: i32) -> Result<()> {
        sqlx::query(
            "INSERT INTO crypto_config (id, algorithm, key_source, key_id, version) VALUES (1, ?, ?, ?, ?) \
             ON DUPLICATE KEY UPDATE algorithm = VALUES(algorithm), key_source = VALUES(key_source), \
             key_id = VALUES(key_id), version = VALUES(version)",
        )
        .bind(algorithm)
        .bind(key_source)
        .bind(key_id)
        .bind(version)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn create_crypto_key(&self, key_id: &str, version: i32, key_material: &str) -> Result<()> {
        sqlx::query("INSERT INTO crypto_key (key_id, version, key_material, updated_at) VALUES (?, ?, ?, NOW())")
            .bind(key_id)
            .bind(version)
            .bind(key_material)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

/// Split a [`PointValue`](crate::value::PointValue) into the four nullable
/// columns `parsed_point` actually has.
fn split_point_value(value: &crate::value::PointValue) -> (Option<f64>, Option<String>, Option<bool>, Option<String>) {
    use crate::value::PointValue;
    match value {
        PointValue::Num(n) => (Some(*n), None, None, None),
        PointValue::Str(s) => (None, Some(s.clone()), None, None),
        PointValue::Bool(b) => (None, None, Some(*b), None),
        PointValue::Json(v) => (None, None, None, Some(v.to_string())),
    }
}
