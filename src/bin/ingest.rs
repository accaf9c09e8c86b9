//! `mqtt-relay-ingest`: subscribes to the broker and durably persists every
//! inbound publish. Runs forever; the processor binary drains what this
//! writes in separate batch passes.

use anyhow::Result;
use mqtt_relay::build_info;
use mqtt_relay::config::Config;
use mqtt_relay::db;
use mqtt_relay::ingest::IngestSink;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "mqtt_relay=info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    build_info::log_startup_banner("mqtt-relay-ingest");

    let config_path = std::env::args().nth(1).unwrap_or_else(|| "config.yaml".to_string());
    let config = Config::from_file(&config_path)?;

    let pool = db::connect(&config.database.url, config.database.max_connections).await?;
    let sink = IngestSink::new(&config.mqtt, pool)?;
    sink.run().await?;

    Ok(())
}
