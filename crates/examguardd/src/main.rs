use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod engine;

const BUS_NAME: &str = "org.examguard.Proctor1";
const OBJECT_PATH: &str = "/org/examguard/Proctor1";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("examguardd starting");

    let config = config::Config::from_env().context("failed to load configuration")?;
    let engine = engine::spawn_engine(config.proctor).context("failed to start engine")?;

    let service = dbus_interface::ProctorService { engine };
    let builder = if config.system_bus {
        zbus::connection::Builder::system()?
    } else {
        zbus::connection::Builder::session()?
    };
    let _connection = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await
        .context("failed to register on D-Bus")?;

    tracing::info!(
        bus = if config.system_bus { "system" } else { "session" },
        name = BUS_NAME,
        path = OBJECT_PATH,
        "examguardd ready"
    );

    // Keep running until signaled
    tokio::signal::ctrl_c().await?;
    tracing::info!("examguardd shutting down");

    Ok(())
}
