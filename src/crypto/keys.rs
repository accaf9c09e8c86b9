//! Master key resolution and rotation bookkeeping.
//!
//! `CryptoConfigToml::key_source` (src/config.rs) selects where key
//! material comes from: `env` reads base64-or-hex keys from environment
//! variables, `db` loads rows persisted in the relay's own `crypto_key`
//! table (see [`crate::model::CryptoKeyRow`]). The currently active
//! `(key_id, version)` pair lives in the `crypto_config` singleton row
//! ([`crate::model::CryptoConfigRow`]), not in the static config file,
//! because `rotate` advances it at runtime regardless of key source.
//! Either way the result is a [`KeyRing`]: an in-memory map from
//! `(key_id, version)` to raw 32-byte key, keeping every retired version so
//! historical ciphertext can still be decrypted, looked up once per
//! process and handed to [`super::encrypt`]/[`super::decrypt`].

use crate::db::Repository;
use crate::error::{RelayError, Result};
use crate::model::CryptoKeyRow;
use base64::{engine::general_purpose::STANDARD, Engine};
use rand::RngCore;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeySource {
    Env,
    Db,
}

impl KeySource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Env => "env",
            Self::Db => "db",
        }
    }
}

impl std::str::FromStr for KeySource {
    type Err = RelayError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "env" => Ok(Self::Env),
            "db" => Ok(Self::Db),
            other => Err(RelayError::Config(format!("unknown crypto key_source: {other}"))),
        }
    }
}

/// `(key_id, version)` -> 32-byte master key, with the currently active
/// pair tracked separately so new envelopes always seal under it while old
/// envelopes sealed under retired versions still decrypt.
pub struct KeyRing {
    keys: HashMap<(String, i32), [u8; 32]>,
    active_key_id: String,
    active_version: i32,
}

impl KeyRing {
    fn env_var_name(key_id: &str) -> String {
        format!("MQTT_RELAY_ENC_KEY_{}", key_id.to_ascii_uppercase())
    }

    /// Read `MQTT_RELAY_ENC_KEY_<KEY_ID>` (base64 or hex, 32 decoded bytes)
    /// for the active `key_id`/`version`. `history` supplies key material
    /// for any retired versions still needed to decrypt old ciphertext;
    /// `rotate` persists those even under `key_source = env`.
    pub fn from_env(active_key_id: &str, active_version: i32, history: Vec<CryptoKeyRow>) -> Result<Self> {
        let raw = std::env::var(Self::env_var_name(active_key_id))
            .map_err(|_| RelayError::KeyNotFound(active_key_id.to_string()))?;
        let active_key = decode_key(&raw)?;

        let mut keys = HashMap::new();
        for row in history {
            keys.insert((row.key_id.clone(), row.version), decode_key(&row.key_material)?);
        }
        keys.insert((active_key_id.to_string(), active_version), active_key);

        Ok(Self { keys, active_key_id: active_key_id.to_string(), active_version })
    }

    /// Build a ring from every persisted `crypto_key` row, keeping every
    /// version (not just the newest) so retired-key ciphertext stays
    /// decryptable.
    pub fn from_db_rows(rows: Vec<CryptoKeyRow>, active_key_id: &str, active_version: i32) -> Result<Self> {
        let mut keys = HashMap::new();
        for row in rows {
            keys.insert((row.key_id.clone(), row.version), decode_key(&row.key_material)?);
        }

        if !keys.contains_key(&(active_key_id.to_string(), active_version)) {
            return Err(RelayError::KeyNotFound(format!("{active_key_id}.{active_version}")));
        }

        Ok(Self { keys, active_key_id: active_key_id.to_string(), active_version })
    }

    pub fn get(&self, key_id: &str, version: i32) -> Result<&[u8; 32]> {
        self.keys
            .get(&(key_id.to_string(), version))
            .ok_or_else(|| RelayError::KeyNotFound(format!("{key_id}.{version}")))
    }

    pub fn active_key_id(&self) -> &str {
        &self.active_key_id
    }

    pub fn active_version(&self) -> i32 {
        self.active_version
    }

    /// The compound `"<key_id>.<version>"` string stored in
    /// `client_destination.encryption_version` for anything sealed right now.
    pub fn active_encryption_version(&self) -> String {
        format!("{}.{}", self.active_key_id, self.active_version)
    }

    pub fn active_key(&self) -> Result<&[u8; 32]> {
        self.get(&self.active_key_id, self.active_version)
    }

    /// Insert a key under an explicit `(key_id, version)`, leaving
    /// previously active keys in place so already-sealed envelopes keep
    /// decrypting.
    pub fn insert(&mut self, key_id: String, version: i32, key: [u8; 32]) {
        self.keys.insert((key_id, version), key);
    }

    pub fn set_active(&mut self, key_id: String, version: i32) {
        self.active_key_id = key_id;
        self.active_version = version;
    }
}

/// Split a stored `encryption_version` column value into its `(key_id,
/// version)` parts. The version is always the last `.`-separated segment,
/// so `key_id` itself may contain dots.
pub fn parse_encryption_version(encryption_version: &str) -> Result<(String, i32)> {
    let (key_id, version) = encryption_version
        .rsplit_once('.')
        .ok_or_else(|| RelayError::InvalidToken(format!("malformed encryption_version: {encryption_version}")))?;
    let version: i32 = version
        .parse()
        .map_err(|_| RelayError::InvalidToken(format!("malformed encryption_version: {encryption_version}")))?;
    Ok((key_id.to_string(), version))
}

fn decode_key(raw: &str) -> Result<[u8; 32]> {
    let trimmed = raw.trim();
    let bytes = match STANDARD.decode(trimmed) {
        Ok(b) => b,
        Err(_) => hex::decode(trimmed)
            .map_err(|e| RelayError::Config(format!("key material is neither valid base64 nor hex: {e}")))?,
    };
    bytes
        .try_into()
        .map_err(|v: Vec<u8>| RelayError::InvalidKeyLength { expected: 32, actual: v.len() })
}

/// Generate a fresh random 32-byte key plus its base64 encoding, the form
/// persisted into `crypto_key.key_material`.
pub fn generate_key() -> ([u8; 32], String) {
    let mut key = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut key);
    let encoded = STANDARD.encode(key);
    (key, encoded)
}

/// Resolve the active `(key_id, version)` from the `crypto_config`
/// singleton row, falling back to `toml_key_id`/version 1 when no row has
/// been persisted yet (first run before any rotation), and build a
/// [`KeyRing`] from it.
pub async fn build_ring(repo: &dyn Repository, source: KeySource, toml_key_id: &str) -> Result<KeyRing> {
    let (key_id, version) = match repo.crypto_config().await? {
        Some(row) => (row.key_id, row.version),
        None => (toml_key_id.to_string(), 1),
    };
    let history = repo.crypto_keys().await?;
    match source {
        KeySource::Env => KeyRing::from_env(&key_id, version, history),
        KeySource::Db => KeyRing::from_db_rows(history, &key_id, version),
    }
}

/// Bump the active crypto version per `source`:
/// - `Env`: persist the currently active key as a historical `crypto_key`
///   row under its current version, so it keeps decrypting retired
///   ciphertext once the operator replaces the environment variable with
///   fresh material, then bump `crypto_config.version`.
/// - `Db`: generate a fresh random key, persist it under the bumped
///   version, and make it active immediately.
///
/// Either way `crypto_config` is updated atomically with the key
/// bookkeeping so a reload always sees a consistent `(key_id, version)`.
pub async fn rotate(repo: &dyn Repository, ring: &KeyRing, source: KeySource, algorithm: &str) -> Result<KeyRing> {
    let key_id = ring.active_key_id().to_string();
    let new_version = ring.active_version() + 1;

    match source {
        KeySource::Env => {
            let prev_key = *ring.active_key()?;
            repo.create_crypto_key(&key_id, ring.active_version(), &STANDARD.encode(prev_key)).await?;
            repo.update_crypto_config(algorithm, source.as_str(), &key_id, new_version).await?;
            let history = repo.crypto_keys().await?;
            KeyRing::from_env(&key_id, new_version, history)
        }
        KeySource::Db => {
            let (_, encoded) = generate_key();
            repo.create_crypto_key(&key_id, new_version, &encoded).await?;
            repo.update_crypto_config(algorithm, source.as_str(), &key_id, new_version).await?;
            let history = repo.crypto_keys().await?;
            KeyRing::from_db_rows(history, &key_id, new_version)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Client, CryptoConfigRow, Device, DeviceType, Dispatch, Extraction, Job, JobState, Metric, MqttMessage, MqttTopic, ParsedPoint, Parser, RouteDeposit, RoutingRule};
    use async_trait::async_trait;
    use std::sync::Mutex;
    use uuid::Uuid;

    #[test]
    fn decodes_base64_and_rejects_bad_length() {
        let (_, encoded) = generate_key();
        assert!(decode_key(&encoded).is_ok());
        assert!(decode_key(&STANDARD.encode(b"too-short")).is_err());
    }

    #[test]
    fn decodes_hex_when_not_valid_base64() {
        let hex_key = "ff".repeat(32);
        assert!(decode_key(&hex_key).is_ok());
    }

    #[test]
    fn env_var_name_matches_expected_format() {
        assert_eq!(KeyRing::env_var_name("primary"), "MQTT_RELAY_ENC_KEY_PRIMARY");
    }

    #[test]
    fn db_ring_keeps_every_version_for_historical_decrypt() {
        let now = chrono::DateTime::parse_from_rfc3339("2024-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&chrono::Utc);
        let (_, old) = generate_key();
        let (_, new) = generate_key();
        let rows = vec![
            CryptoKeyRow { key_id: "PRIMARY".into(), version: 1, key_material: old.clone(), updated_at: now },
            CryptoKeyRow { key_id: "PRIMARY".into(), version: 2, key_material: new.clone(), updated_at: now },
        ];
        let ring = KeyRing::from_db_rows(rows, "PRIMARY", 2).unwrap();
        assert_eq!(ring.active_key().unwrap(), &decode_key(&new).unwrap());
        assert_eq!(ring.get("PRIMARY", 1).unwrap(), &decode_key(&old).unwrap());
        assert_eq!(ring.active_encryption_version(), "PRIMARY.2");
    }

    #[test]
    fn missing_active_key_id_errors() {
        let rows = vec![];
        assert!(KeyRing::from_db_rows(rows, "PRIMARY", 1).is_err());
    }

    #[test]
    fn parses_compound_encryption_version() {
        assert_eq!(parse_encryption_version("PRIMARY.2").unwrap(), ("PRIMARY".to_string(), 2));
        assert!(parse_encryption_version("PRIMARY").is_err());
        assert!(parse_encryption_version("PRIMARY.not-a-number").is_err());
    }

    #[derive(Default)]
    struct TestRepo {
        config: Mutex<Option<CryptoConfigRow>>,
        keys: Mutex<Vec<CryptoKeyRow>>,
    }

    #[async_trait]
    impl Repository for TestRepo {
        async fn topic_by_name(&self, _topic: &str, _active_only: bool) -> Result<Option<MqttTopic>> {
            Ok(None)
        }
        async fn device(&self, _id: i64) -> Result<Option<Device>> {
            Ok(None)
        }
        async fn client(&self, _id: i64) -> Result<Option<Client>> {
            Ok(None)
        }
        async fn device_type(&self, _id: i64) -> Result<Option<DeviceType>> {
            Ok(None)
        }
        async fn metric(&self, _id: i64) -> Result<Option<Metric>> {
            Ok(None)
        }
        async fn candidate_routes(&self, _client_id: i64, _topic_id: i64, _device_id: i64) -> Result<Vec<RoutingRule>> {
            Ok(vec![])
        }
        async fn parser(&self, _id: i64) -> Result<Option<Parser>> {
            Ok(None)
        }
        async fn deposits_for_rule(&self, _rule_id: Uuid) -> Result<Vec<RouteDeposit>> {
            Ok(vec![])
        }
        async fn destination(&self, _id: i64) -> Result<Option<crate::model::ClientDestination>> {
            Ok(None)
        }
        async fn create_extraction(&self, _extraction: &Extraction) -> Result<()> {
            Ok(())
        }
        async fn create_parsed_point(&self, _point: &ParsedPoint) -> Result<()> {
            Ok(())
        }
        async fn create_dispatch(&self, _dispatch: &Dispatch) -> Result<()> {
            Ok(())
        }
        async fn update_dispatch(&self, _dispatch: &Dispatch) -> Result<()> {
            Ok(())
        }
        async fn unprocessed_messages(&self) -> Result<Vec<MqttMessage>> {
            Ok(vec![])
        }
        async fn mark_message_processed(&self, _message_id: i64, _extraction_id: Uuid, _processed: bool) -> Result<()> {
            Ok(())
        }
        async fn job(&self, _name: &str) -> Result<Option<Job>> {
            Ok(None)
        }
        async fn set_job_state(&self, _name: &str, _state: JobState) -> Result<()> {
            Ok(())
        }
        async fn finish_job(&self, _name: &str, _exit_code: i32) -> Result<()> {
            Ok(())
        }
        async fn client_destinations_for_reencryption(&self) -> Result<Vec<crate::model::ClientDestination>> {
            Ok(vec![])
        }
        async fn update_destination_secret(&self, _destination_id: i64, _password_enc: &str, _encryption_version: &str) -> Result<()> {
            Ok(())
        }
        async fn crypto_keys(&self) -> Result<Vec<CryptoKeyRow>> {
            Ok(self.keys.lock().unwrap().clone())
        }
        async fn crypto_config(&self) -> Result<Option<CryptoConfigRow>> {
            Ok(self.config.lock().unwrap().clone())
        }
        async fn update_crypto_config(&self, algorithm: &str, key_source: &str, key_id: &str, version: i32) -> Result<()> {
            *self.config.lock().unwrap() = Some(CryptoConfigRow {
                id: 1,
                algorithm: algorithm.to_string(),
                key_source: key_source.to_string(),
                key_id: key_id.to_string(),
                version,
            });
            Ok(())
        }
        async fn create_crypto_key(&self, key_id: &str, version: i32, key_material: &str) -> Result<()> {
            self.keys.lock().unwrap().push(CryptoKeyRow {
                key_id: key_id.to_string(),
                version,
                key_material: key_material.to_string(),
                updated_at: chrono::Utc::now(),
            });
            Ok(())
        }
    }

    #[tokio::test]
    async fn db_rotate_generates_new_key_and_bumps_version() {
        let (_, material) = generate_key();
        let repo = TestRepo {
            config: Mutex::new(Some(CryptoConfigRow { id: 1, algorithm: "aes-256-gcm".into(), key_source: "db".into(), key_id: "PRIMARY".into(), version: 1 })),
            keys: Mutex::new(vec![CryptoKeyRow { key_id: "PRIMARY".into(), version: 1, key_material: material, updated_at: chrono::Utc::now() }]),
        };
        let ring = build_ring(&repo, KeySource::Db, "PRIMARY").await.unwrap();
        assert_eq!(ring.active_version(), 1);

        let rotated = rotate(&repo, &ring, KeySource::Db, "aes-256-gcm").await.unwrap();
        assert_eq!(rotated.active_encryption_version(), "PRIMARY.2");
        // old version's key material is still resolvable for historical decrypt
        assert!(rotated.get("PRIMARY", 1).is_ok());

        let cfg = repo.crypto_config().await.unwrap().unwrap();
        assert_eq!(cfg.version, 2);
    }

    #[tokio::test]
    async fn env_rotate_bumps_version_and_retains_prior_key() {
        std::env::set_var("MQTT_RELAY_ENC_KEY_PRIMARY", STANDARD.encode([9u8; 32]));
        let repo = TestRepo {
            config: Mutex::new(Some(CryptoConfigRow { id: 1, algorithm: "aes-256-gcm".into(), key_source: "env".into(), key_id: "PRIMARY".into(), version: 1 })),
            keys: Mutex::new(vec![]),
        };
        let ring = build_ring(&repo, KeySource::Env, "PRIMARY").await.unwrap();

        let rotated = rotate(&repo, &ring, KeySource::Env, "aes-256-gcm").await.unwrap();
        assert_eq!(rotated.active_encryption_version(), "PRIMARY.2");
        // the pre-rotation key is now retrievable as the historical version 1 entry
        assert_eq!(rotated.get("PRIMARY", 1).unwrap(), &[9u8; 32]);
        std::env::remove_var("MQTT_RELAY_ENC_KEY_PRIMARY");
    }
}
