//! In-memory [`Repository`] fake plus end-to-end scenario tests covering
//! routing, parsing and dispatch, exercised without a database.

use super::*;
use crate::model::*;
use crate::parser::store::ParserStore;
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Default)]
struct State {
    topics: Vec<MqttTopic>,
    devices: Vec<Device>,
    device_types: Vec<DeviceType>,
    clients: Vec<Client>,
    routes: Vec<RoutingRule>,
    parsers: Vec<Parser>,
    metrics: Vec<Metric>,
    deposits: Vec<RouteDeposit>,
    destinations: Vec<ClientDestination>,
    messages: Vec<MqttMessage>,
    extractions: Mutex<Vec<Extraction>>,
    points: Mutex<Vec<ParsedPoint>>,
    dispatches: Mutex<Vec<Dispatch>>,
    processed: Mutex<HashMap<i64, (Uuid, bool)>>,
}

#[derive(Default)]
struct MockRepository {
    state: State,
}

#[async_trait::async_trait]
impl Repository for MockRepository {
    async fn topic_by_name(&self, topic: &str, active_only: bool) -> Result<Option<MqttTopic>> {
        Ok(self.state.topics.iter().find(|t| t.topic == topic && (!active_only || t.active)).cloned())
    }

    async fn device(&self, id: i64) -> Result<Option<Device>> {
        Ok(self.state.devices.iter().find(|d| d.id == id).cloned())
    }

    async fn client(&self, id: i64) -> Result<Option<Client>> {
        Ok(self.state.clients.iter().find(|c| c.id == id).cloned())
    }

    async fn device_type(&self, id: i64) -> Result<Option<DeviceType>> {
        Ok(self.state.device_types.iter().find(|d| d.id == id).cloned())
    }

    async fn metric(&self, id: i64) -> Result<Option<Metric>> {
        Ok(self.state.metrics.iter().find(|m| m.id == id).cloned())
    }

    async fn candidate_routes(&self, client_id: i64, topic_id: i64, device_id: i64) -> Result<Vec<RoutingRule>> {
        Ok(self
            .state
            .routes
            .iter()
            .filter(|r| {
                r.active
                    && r.client_id == client_id
                    && r.topic_id == Some(topic_id)
                    && (r.device_id.is_none() || r.device_id == Some(device_id))
            })
            .cloned()
            .collect())
    }

    async fn parser(&self, id: i64) -> Result<Option<Parser>> {
        Ok(self.state.parsers.iter().find(|p| p.id == id).cloned())
    }

    async fn deposits_for_rule(&self, rule_id: Uuid) -> Result<Vec<RouteDeposit>> {
        Ok(self.state.deposits.iter().filter(|d| d.rule_id == rule_id).cloned().collect())
    }

    async fn destination(&self, id: i64) -> Result<Option<ClientDestination>> {
        Ok(self.state.destinations.iter().find(|d| d.id == id).cloned())
    }

    async fn create_extraction(&self, extraction: &Extraction) -> Result<()> {
        self.state.extractions.lock().unwrap().push(extraction.clone());
        Ok(())
    }

    async fn create_parsed_point(&self, point: &ParsedPoint) -> Result<()> {
        self.state.points.lock().unwrap().push(point.clone());
        Ok(())
    }

    async fn create_dispatch(&self, dispatch: &Dispatch) -> Result<()> {
        self.state.dispatches.lock().unwrap().push(dispatch.clone());
        Ok(())
    }

    async fn update_dispatch(&self, dispatch: &Dispatch) -> Result<()> {
        let mut dispatches = self.state.dispatches.lock().unwrap();
        if let Some(existing) = dispatches.iter_mut().find(|d| d.id == dispatch.id) {
            *existing = dispatch.clone();
        }
        Ok(())
    }

    async fn unprocessed_messages(&self) -> Result<Vec<MqttMessage>> {
        Ok(self.state.messages.clone())
    }

    async fn mark_message_processed(&self, message_id: i64, extraction_id: Uuid, processed: bool) -> Result<()> {
        self.state.processed.lock().unwrap().insert(message_id, (extraction_id, processed));
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

    async fn client_destinations_for_reencryption(&self) -> Result<Vec<ClientDestination>> {
        Ok(self.state.destinations.clone())
    }

    async fn update_destination_secret(&self, _destination_id: i64, _password_enc: &str, _encryption_version: &str) -> Result<()> {
        Ok(())
    }

    async fn crypto_keys(&self) -> Result<Vec<CryptoKeyRow>> {
        Ok(vec![])
    }

    async fn crypto_config(&self) -> Result<Option<CryptoConfigRow>> {
        Ok(None)
    }

    async fn update_crypto_config(&self, _algorithm: &str, _key_source: &str, _key_id: &str, _version: i32) -> Result<()> {
        Ok(())
    }

    async fn create_crypto_key(&self, _key_id: &str, _version: i32, _key_material: &str) -> Result<()> {
        Ok(())
    }
}

fn key_ring() -> KeyRing {
    let (_, material) = crate::crypto::keys::generate_key();
    KeyRing::from_db_rows(
        vec![CryptoKeyRow { key_id: "PRIMARY".into(), version: 1, key_material: material, updated_at: Utc::now() }],
        "PRIMARY",
        1,
    )
    .unwrap()
}

fn parser_registry(tmp: &std::path::Path) -> ParserRegistry {
    let store = ParserStore::new(tmp);
    store.put("echo", "1.0", crate::parser::store::Language::Python, "print(__import__('json').dumps({**__import__('json').load(__import__('sys').stdin)['payload']}))").unwrap();
    ParserRegistry::new(store)
}

fn base_state() -> State {
    let mut state = State::default();
    state.clients.push(Client { id: 1, slug: "acme".into(), name: "Acme".into(), status: "active".into() });
    state.devices.push(Device {
        id: 10,
        client_id: Some(1),
        device_type_id: 1,
        topic: Some("acme/dev-1/data".into()),
        emission_rate: 60,
        working: true,
        installed: true,
    });
    state.topics.push(MqttTopic {
        id: 100,
        topic: "acme/dev-1/data".into(),
        client_id: Some(1),
        device_id: Some(10),
        qos_default: 0,
        active: true,
    });
    state.device_types.push(DeviceType {
        id: 1,
        vendor: "acme-corp".into(),
        model: "sensor-x".into(),
        kind: "sensor".into(),
        capabilities: "{}".into(),
        payload_schema: "{}".into(),
        defaults_json: "{}".into(),
    });
    state.parsers.push(Parser { id: 1, name: "echo".into(), version: "1.0".into(), language: "python".into(), config_schema: None, active: true });
    state.metrics.push(Metric { id: 7, key_name: "temperature".into(), default_unit: Some("C".into()) });
    state
}

fn message(topic: &str, payload: &str) -> MqttMessage {
    MqttMessage { id: 1, client: "acme".into(), topic: topic.into(), payload: payload.into(), qos: 0, at: Utc::now(), processed: false, processor: None }
}

#[tokio::test]
async fn unknown_topic_is_skipped_with_no_extraction() {
    let mut state = base_state();
    state.messages.push(message("acme/unknown/data", "{}"));
    let repo = MockRepository { state };
    let tmp = tempdir();
    let parsers = parser_registry(tmp.path());
    let ring = key_ring();

    let all_ok = process(&repo, &parsers, &ring).await.unwrap();
    assert!(!all_ok);
    assert!(repo.state.extractions.lock().unwrap().is_empty());
}

#[tokio::test]
async fn disabled_topic_is_skipped_with_no_extraction() {
    let mut state = base_state();
    state.topics[0].active = false;
    state.messages.push(message("acme/dev-1/data", r#"{"7": 21.5}"#));
    let repo = MockRepository { state };
    let tmp = tempdir();
    let parsers = parser_registry(tmp.path());
    let ring = key_ring();

    let all_ok = process(&repo, &parsers, &ring).await.unwrap();
    assert!(!all_ok);
    assert!(repo.state.extractions.lock().unwrap().is_empty());
}

#[tokio::test]
async fn no_route_found_is_skipped_with_no_extraction() {
    let mut state = base_state();
    // no routing_rule rows at all -> select_route errors NoRouteFound
    state.messages.push(message("acme/dev-1/data", r#"{"7": 21.5}"#));
    let repo = MockRepository { state };
    let tmp = tempdir();
    let parsers = parser_registry(tmp.path());
    let ring = key_ring();

    let all_ok = process(&repo, &parsers, &ring).await.unwrap();
    assert!(!all_ok);
    assert!(repo.state.extractions.lock().unwrap().is_empty());
}

#[tokio::test]
async fn bad_parser_config_creates_failed_extraction() {
    let mut state = base_state();
    state.routes.push(RoutingRule {
        id: Uuid::from_u128(1),
        client_id: 1,
        topic_id: Some(100),
        device_id: None,
        parser_id: 1,
        parser_config: Some("not json".into()),
        active: true,
        priority: 100,
        conditions: None,
        created_at: Utc::now(),
    });
    state.messages.push(message("acme/dev-1/data", r#"{"7": 21.5}"#));
    let repo = MockRepository { state };
    let tmp = tempdir();
    let parsers = parser_registry(tmp.path());
    let ring = key_ring();

    let all_ok = process(&repo, &parsers, &ring).await.unwrap();
    assert!(!all_ok);
    let extractions = repo.state.extractions.lock().unwrap();
    assert_eq!(extractions.len(), 1);
    assert!(!extractions[0].success);
    assert!(extractions[0].error_text.is_some());
}

#[tokio::test]
async fn successful_route_dispatches_to_file_destination() {
    let dir = tempdir();
    let out_path = dir.path().join("out.ndjson");

    let mut state = base_state();
    state.routes.push(RoutingRule {
        id: Uuid::from_u128(1),
        client_id: 1,
        topic_id: Some(100),
        device_id: None,
        parser_id: 1,
        parser_config: None,
        active: true,
        priority: 100,
        conditions: None,
        created_at: Utc::now(),
    });
    state.destinations.push(ClientDestination {
        id: 1,
        client_id: 1,
        type_: "file".into(),
        host: None,
        port: None,
        database_name: None,
        username: None,
        password_enc: None,
        encryption_version: None,
        uri: Some(out_path.to_string_lossy().to_string()),
        options_json: None,
        active: true,
    });
    state.deposits.push(RouteDeposit { rule_id: Uuid::from_u128(1), destination_id: 1 });
    state.messages.push(message("acme/dev-1/data", r#"{"7": 21.5}"#));

    let repo = MockRepository { state };
    let parsers = parser_registry(dir.path());
    let ring = key_ring();

    let all_ok = process(&repo, &parsers, &ring).await.unwrap();
    assert!(all_ok);

    let extractions = repo.state.extractions.lock().unwrap();
    assert_eq!(extractions.len(), 1);
    assert!(extractions[0].success);

    let points = repo.state.points.lock().unwrap();
    assert_eq!(points.len(), 1);
    assert_eq!(points[0].metric_id, 7);

    let dispatches = repo.state.dispatches.lock().unwrap();
    assert_eq!(dispatches.len(), 1);
    assert_eq!(dispatches[0].status, "sent");

    assert!(out_path.exists());
}

fn tempdir() -> TempDir {
    TempDir::new()
}

/// Minimal scoped temp-directory helper (no extra dev-dependency needed:
/// the parser store and file dispatcher only need a throwaway directory
/// that outlives one test).
struct TempDir {
    path: std::path::PathBuf,
}

impl TempDir {
    fn new() -> Self {
        let mut path = std::env::temp_dir();
        path.push(format!("mqtt-relay-test-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&path).unwrap();
        Self { path }
    }

    fn path(&self) -> &std::path::Path {
        &self.path
    }
}

impl Drop for TempDir {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.path);
    }
}
