//! Standalone publisher host: loads a TOML config file, connects to the
//! configured MQTT bus, and runs a [`Publisher`] until interrupted.

use iotpubsub::bus::MqttBus;
use iotpubsub::{Config, Publisher};
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .json()
        .init();

    let Some(config_path) = std::env::args().nth(1) else {
        eprintln!("usage: iotpubsub-publisher <config.toml>");
        return ExitCode::FAILURE;
    };

    if let Err(e) = run(&config_path).await {
        tracing::error!(error = %e, "publisher exited with error");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

async fn run(config_path: &str) -> iotpubsub::Result<()> {
    let config = Config::from_file(config_path)?;
    tracing::info!(domain = %config.domain, publisher_id = %config.publisher_id, "starting publisher");

    let (lwt_topic, lwt_payload) = iotpubsub::runtime::last_will(&config.domain, &config.publisher_id)?;
    let bus = MqttBus::connect_mqtt(
        &config.publisher_id,
        &config.bus.address,
        config.bus.port,
        config.bus.login.as_deref(),
        config.bus.password.as_deref(),
        config.bus.use_tls,
        &lwt_topic,
        &lwt_payload,
    )
    .await?;

    let publisher = Publisher::builder(config, bus).build()?;
    publisher.start().await?;

    tokio::signal::ctrl_c().await.map_err(iotpubsub::PubSubError::Io)?;

    tracing::info!("shutdown signal received");
    publisher.stop().await?;
    Ok(())
}
