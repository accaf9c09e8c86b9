//! MQTT ingest sink.
//!
//! Subscribes to every topic at QoS 0 and durably persists each inbound
//! frame into `mqtt_messages` with `processed=false`; the processor picks
//! them up in a later batch pass. The connect/reconnect loop (`rumqttc`
//! event polling with exponential backoff) is trimmed to what a pure
//! ingest sink needs: no publications, no signal bus, no TLS/mqtt5
//! feature gates.

use crate::config::MqttConfig;
use crate::error::{RelayError, Result};
use chrono::Utc;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use sqlx::MySqlPool;
use std::time::Duration;
use tracing::{debug, error, info, warn};

#[derive(Clone)]
struct ReconnectStrategy {
    initial_delay_ms: u64,
    max_delay_ms: u64,
}

impl Default for ReconnectStrategy {
    fn default() -> Self {
        Self { initial_delay_ms: 1000, max_delay_ms: 60_000 }
    }
}

pub struct IngestSink {
    client: AsyncClient,
    eventloop: EventLoop,
    pool: MySqlPool,
    client_id: String,
    reconnect_strategy: ReconnectStrategy,
}

// rumqttc's EventLoop is not Sync, so MqttClient can't auto-derive Send.
// IngestSink runs to completion inside a single dedicated task and never
// shares a reference across threads, so this is safe.
unsafe impl Send for IngestSink {}

impl IngestSink {
    pub fn new(config: &MqttConfig, pool: MySqlPool) -> Result<Self> {
        let mut opts = MqttOptions::new(&config.client_id, &config.broker_host, config.broker_port);
        opts.set_keep_alive(Duration::from_secs(config.keep_alive_secs));
        if let (Some(user), Some(pass)) = (&config.username, &config.password) {
            opts.set_credentials(user, pass);
        }

        let (client, eventloop) = AsyncClient::new(opts, 256);
        Ok(Self {
            client,
            eventloop,
            pool,
            client_id: config.client_id.clone(),
            reconnect_strategy: ReconnectStrategy::default(),
        })
    }

    /// Run the ingest loop forever, subscribing to every topic and storing
    /// each publish as a row. Returns only on an unrecoverable error.
    pub async fn run(mut self) -> Result<()> {
        self.client
            .subscribe("+/+/+", QoS::AtMostOnce)
            .await
            .map_err(|e| RelayError::Mqtt(format!("subscribe failed: {e}")))?;
        info!("ingest sink subscribed, entering event loop");

        let mut reconnect_delay = self.reconnect_strategy.initial_delay_ms;

        loop {
            match self.eventloop.poll().await {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    reconnect_delay = self.reconnect_strategy.initial_delay_ms;
                    if let Err(e) = self.store_message(&publish).await {
                        error!(topic = %publish.topic, error = %e, "failed to persist inbound mqtt message");
                    }
                }
                Ok(Event::Incoming(_)) | Ok(Event::Outgoing(_)) => {
                    reconnect_delay = self.reconnect_strategy.initial_delay_ms;
                }
                Err(e) => {
                    warn!(error = %e, delay_ms = reconnect_delay, "mqtt connection error, reconnecting");
                    tokio::time::sleep(Duration::from_millis(reconnect_delay)).await;
                    reconnect_delay = (reconnect_delay * 2).min(self.reconnect_strategy.max_delay_ms);
                }
            }
        }
    }

    async fn store_message(&self, publish: &rumqttc::Publish) -> Result<()> {
        let payload = String::from_utf8_lossy(&publish.payload).to_string();
        let qos = match publish.qos {
            QoS::AtMostOnce => 0,
            QoS::AtLeastOnce => 1,
            QoS::ExactlyOnce => 2,
        };
        debug!(topic = %publish.topic, bytes = publish.payload.len(), "ingested mqtt publish");

        sqlx::query(
            "INSERT INTO mqtt_messages (client, topic, payload, qos, at, processed) VALUES (?, ?, ?, ?, ?, 0)",
        )
        .bind(self.client_identity())
        .bind(&publish.topic)
        .bind(&payload)
        .bind(qos)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    fn client_identity(&self) -> String {
        // rumqttc's AsyncClient doesn't expose the client_id it was built
        // with; the ingest sink has exactly one identity per process so we
        // stash it at construction time instead of threading it through.
        self.client_id.clone()
    }
}
