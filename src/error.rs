//! Error types for the relay.
//!
//! Routing, parsing and dispatch failures are contained per-message by
//! the processor and never abort a batch pass. Only infrastructure
//! failures (database, crypto master key) should propagate out of `main`.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, RelayError>;

#[derive(Error, Debug)]
pub enum RelayError {
    // --- routing ---
    #[error("message published to unknown topic: {0}")]
    TopicNotFound(String),

    #[error("message published to disabled topic: {0}")]
    DisabledTopic(String),

    #[error("topic {0} is not linked to any device")]
    DeviceNotFound(String),

    #[error("topic {0} is not linked to any client")]
    ClientNotFound(String),

    #[error("device type #{0} does not exist")]
    DeviceTypeNotFound(i64),

    #[error("metric #{0} does not exist")]
    MetricNotFound(i64),

    #[error("no route found for message #{0}")]
    NoRouteFound(i64),

    #[error("parser #{0} does not exist")]
    ParserNotFound(i64),

    #[error("no destination deposit configured for rule {0}")]
    DepositNotFound(uuid::Uuid),

    #[error("client destination #{0} not found")]
    DestinationNotFound(i64),

    // --- parsing ---
    #[error("parser #{0} source not found in store")]
    ParserCodeNotFound(i64),

    #[error("parser #{0} is coded in an unhandled language: {1}")]
    LanguageNotHandled(i64, String),

    #[error("parser configuration for route {0} is not valid JSON: {1}")]
    BadParserConfig(uuid::Uuid, String),

    #[error("parser execution failed: {0}")]
    ParserRuntime(String),

    #[error("dispatcher for destination type '{0}' is not implemented")]
    DispatcherNotFound(String),

    // --- crypto ---
    #[error("key material not found for key_id '{0}'")]
    KeyNotFound(String),

    #[error("key material has invalid length: expected {expected} bytes, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    #[error("envelope token is malformed: {0}")]
    InvalidToken(String),

    #[error("authentication tag mismatch during decrypt")]
    AuthTagMismatch,

    #[error("unsupported envelope algorithm: {0}")]
    UnsupportedAlgorithm(String),

    // --- rule DSL ---
    #[error("unsupported rule operator: {0}")]
    UnsupportedOperator(String),

    // --- infrastructure ---
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("mqtt error: {0}")]
    Mqtt(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("job '{0}' is already running")]
    JobAlreadyRunning(String),
}

impl RelayError {
    /// True for failures that leave the message unprocessed but do not
    /// abort the batch pass.
    pub fn is_per_message(&self) -> bool {
        matches!(
            self,
            RelayError::TopicNotFound(_)
                | RelayError::DisabledTopic(_)
                | RelayError::DeviceNotFound(_)
                | RelayError::ClientNotFound(_)
                | RelayError::DeviceTypeNotFound(_)
                | RelayError::MetricNotFound(_)
                | RelayError::NoRouteFound(_)
                | RelayError::ParserNotFound(_)
                | RelayError::DepositNotFound(_)
                | RelayError::DestinationNotFound(_)
                | RelayError::ParserCodeNotFound(_)
                | RelayError::LanguageNotHandled(_, _)
                | RelayError::BadParserConfig(_, _)
                | RelayError::ParserRuntime(_)
                | RelayError::DispatcherNotFound(_)
        )
    }
}
