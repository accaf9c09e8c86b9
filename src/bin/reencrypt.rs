//! `mqtt-relay-reencrypt`: one pass of the key-rotation re-encryption
//! walker. Pass `--rotate` to bump the active `key_id`/version first, or
//! run it bare after rotating out of band, so every `client_destination`
//! secret still sealed under a retired key gets re-sealed under the new one.

use anyhow::Result;
use mqtt_relay::config::Config;
use mqtt_relay::crypto::keys::{self, KeySource};
use mqtt_relay::crypto::reencrypt::run_reencryption_pass;
use mqtt_relay::db::{self, SqlxRepository};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "mqtt_relay=info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let rotate = args.iter().any(|a| a == "--rotate");
    let config_path = args.iter().find(|a| a.as_str() != "--rotate").cloned().unwrap_or_else(|| "config.yaml".to_string());
    let config = Config::from_file(&config_path)?;

    let pool = db::connect(&config.database.url, config.database.max_connections).await?;
    let repo = SqlxRepository::new(pool);

    let source: KeySource = config.crypto.key_source.parse()?;
    let ring = keys::build_ring(&repo, source, &config.crypto.key_id).await?;
    let ring = if rotate {
        info!("rotating active crypto key before re-encryption pass");
        keys::rotate(&repo, &ring, source, &config.crypto.algorithm).await?
    } else {
        ring
    };

    let (updated, failed) = run_reencryption_pass(&repo, &ring, &config.crypto.algorithm).await?;
    info!(updated, failed, "re-encryption pass complete");
    if failed > 0 {
        std::process::exit(2);
    }
    Ok(())
}
