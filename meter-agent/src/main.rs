//! Meter Agent - edge agent for an energy meter gateway
//!
//! Runs on the gateway next to the meter and the cellular/GNSS modem:
//! - Polls the meter over Modbus RTU and decodes the register map
//! - Tracks the GNSS position and publishes telemetry on movement or on a timer
//! - Publishes through the modem's AT MQTT commands
//! - Pulls program updates from a version manifest

mod config;
mod error;
mod gnss;
mod meter;
mod modem;
mod movement;
mod publisher;
mod supervisor;
mod system;
mod updater;

use anyhow::{Context, Result};
use config::AgentConfig;
use meter::ModbusRtuBus;
use modem::AtChannel;
use supervisor::{RunOutcome, Supervisor};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // .env is optional
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("meter_agent=info")),
        )
        .init();

    info!("Meter Agent v{} starting...", updater::CURRENT_VERSION);

    let config = AgentConfig::load().await.context("Failed to load configuration")?;

    let bus = ModbusRtuBus::new(&config.meter.port, config.meter.baud_rate);
    let at = AtChannel::open(&config.modem)
        .with_context(|| format!("Failed to open modem on {}", config.modem.port))?;

    let mut supervisor = Supervisor::new(&config, bus, at).context("Failed to create supervisor")?;

    match supervisor.run().await {
        RunOutcome::Stopped => info!("Meter Agent stopped"),
        RunOutcome::RestartRequested => info!("Exiting to start the updated program"),
        RunOutcome::Rebooting => info!("Waiting for system reboot"),
    }

    Ok(())
}
