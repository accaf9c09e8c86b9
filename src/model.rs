//! Entity types for the relay's own metadata schema.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "varchar", rename_all = "lowercase")]
pub enum ClientStatus {
    Active,
    Paused,
    Disabled,
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
pub struct Client {
    pub id: i64,
    pub slug: String,
    pub name: String,
    pub status: String,
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
pub struct DeviceType {
    pub id: i64,
    pub vendor: String,
    pub model: String,
    pub kind: String,
    pub capabilities: String,
    pub payload_schema: String,
    pub defaults_json: String,
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
pub struct Device {
    pub id: i64,
    pub client_id: Option<i64>,
    pub device_type_id: i64,
    pub topic: Option<String>,
    pub emission_rate: i64,
    pub working: bool,
    pub installed: bool,
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
pub struct MqttTopic {
    pub id: i64,
    pub topic: String,
    pub client_id: Option<i64>,
    pub device_id: Option<i64>,
    pub qos_default: i32,
    pub active: bool,
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
pub struct MqttMessage {
    pub id: i64,
    pub client: String,
    pub topic: String,
    pub payload: String,
    pub qos: i32,
    pub at: DateTime<Utc>,
    pub processed: bool,
    pub processor: Option<Uuid>,
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
pub struct Parser {
    pub id: i64,
    pub name: String,
    pub version: String,
    pub language: String,
    pub config_schema: Option<String>,
    pub active: bool,
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
pub struct Metric {
    pub id: i64,
    pub key_name: String,
    pub default_unit: Option<String>,
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
pub struct RoutingRule {
    pub id: Uuid,
    pub client_id: i64,
    pub topic_id: Option<i64>,
    pub device_id: Option<i64>,
    pub parser_id: i64,
    pub parser_config: Option<String>,
    pub active: bool,
    pub priority: i32,
    pub conditions: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
pub struct RouteDeposit {
    pub rule_id: Uuid,
    pub destination_id: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DestinationType {
    Mysql,
    Postgres,
    Http,
    Kafka,
    File,
    Other,
}

impl std::str::FromStr for DestinationType {
    type Err = crate::error::RelayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mysql" => Ok(Self::Mysql),
            "postgres" => Ok(Self::Postgres),
            "http" => Ok(Self::Http),
            "kafka" => Ok(Self::Kafka),
            "file" => Ok(Self::File),
            "other" => Ok(Self::Other),
            other => Err(crate::error::RelayError::DispatcherNotFound(other.to_string())),
        }
    }
}

impl DestinationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Mysql => "mysql",
            Self::Postgres => "postgres",
            Self::Http => "http",
            Self::Kafka => "kafka",
            Self::File => "file",
            Self::Other => "other",
        }
    }
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
pub struct ClientDestination {
    pub id: i64,
    pub client_id: i64,
    #[sqlx(rename = "type")]
    pub type_: String,
    pub host: Option<String>,
    pub port: Option<i32>,
    pub database_name: Option<String>,
    pub username: Option<String>,
    pub password_enc: Option<Vec<u8>>,
    pub encryption_version: Option<String>,
    pub uri: Option<String>,
    pub options_json: Option<String>,
    pub active: bool,
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
pub struct Extraction {
    pub id: Uuid,
    pub message_id: i64,
    pub parser_id: i64,
    pub parser_config: Option<String>,
    pub parsed_at: DateTime<Utc>,
    pub success: bool,
    pub error_text: Option<String>,
    pub extracted_count: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParsedPoint {
    pub id: i64,
    pub extraction_id: Uuid,
    pub device_id: i64,
    pub metric_id: i64,
    pub ts: DateTime<Utc>,
    pub value: crate::value::PointValue,
    pub unit: Option<String>,
    pub quality: String,
    pub meta_json: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DispatchStatus {
    Queued,
    Retrying,
    Sent,
    Failed,
    Dead,
}

impl DispatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Retrying => "retrying",
            Self::Sent => "sent",
            Self::Failed => "failed",
            Self::Dead => "dead",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Sent | Self::Dead)
    }
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
pub struct Dispatch {
    pub id: Uuid,
    pub extraction_id: Uuid,
    pub destination_id: i64,
    pub rule_id: Uuid,
    pub status: String,
    pub http_status: Option<i32>,
    pub response_snippet: Option<String>,
    pub attempts: i32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub sent_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
pub struct CryptoConfigRow {
    pub id: i32,
    pub algorithm: String,
    pub key_source: String,
    pub key_id: String,
    pub version: i32,
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
pub struct CryptoKeyRow {
    pub key_id: String,
    pub version: i32,
    pub key_material: String,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    Idle,
    Running,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "IDLE",
            Self::Running => "RUNNING",
        }
    }
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
pub struct Job {
    pub name: String,
    pub state: String,
    pub last_state_update: DateTime<Utc>,
    pub last_exit_code: Option<i32>,
}

pub const MQTT_TRANSFER_JOB_NAME: &str = "MqttTransfer";
