//! `mqtt-relay-processor`: one batch pass over unprocessed MQTT messages.
//! Meant to run on a schedule (cron, systemd timer); [`JobGuard`] makes
//! concurrent invocations a no-op instead of a race.
//!
//! Exit codes: `0` everything dispatched, `2` some messages were skipped
//! or failed to dispatch, `1` an infrastructure error aborted the pass
//! outright.

use anyhow::Result;
use mqtt_relay::build_info;
use mqtt_relay::config::Config;
use mqtt_relay::crypto::keys::KeyRing;
use mqtt_relay::db::{self, Repository, SqlxRepository};
use mqtt_relay::job::JobGuard;
use mqtt_relay::parser::store::ParserStore;
use mqtt_relay::parser::ParserRegistry;
use mqtt_relay::processor;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "mqtt_relay=info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    build_info::log_startup_banner("mqtt-relay-processor");

    let config_path = std::env::args().nth(1).unwrap_or_else(|| "config.yaml".to_string());
    let config = Config::from_file(&config_path)?;

    let pool = db::connect(&config.database.url, config.database.max_connections).await?;
    let repo = SqlxRepository::new(pool);

    let guard = match JobGuard::acquire(&repo).await? {
        Some(guard) => guard,
        None => {
            info!("processor job already running; postponing this invocation");
            return Ok(());
        }
    };

    let ring = match build_key_ring(&config, &repo).await {
        Ok(ring) => ring,
        Err(e) => {
            error!(error = %e, "failed to build crypto key ring");
            guard.finish(1).await?;
            std::process::exit(1);
        }
    };

    let store = ParserStore::new(config.parser_store_dir.clone());
    let parsers = ParserRegistry::new(store);

    let exit_code = match processor::process(&repo, &parsers, &ring).await {
        Ok(true) => {
            info!("all new data treated successfully");
            0
        }
        Ok(false) => {
            info!("some data was not treated successfully");
            2
        }
        Err(e) => {
            error!(error = %e, "processor pass failed");
            1
        }
    };

    guard.finish(exit_code).await?;
    if exit_code != 0 {
        std::process::exit(exit_code);
    }
    Ok(())
}

async fn build_key_ring(config: &Config, repo: &dyn Repository) -> anyhow::Result<KeyRing> {
    use mqtt_relay::crypto::keys::KeySource;
    let source: KeySource = config.crypto.key_source.parse()?;
    Ok(mqtt_relay::crypto::keys::build_ring(repo, source, &config.crypto.key_id).await?)
}
