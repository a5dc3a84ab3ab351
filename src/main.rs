use anyhow::{Context, Result};
use tracing::info;

use solar_evse_controller::adapter::{home_assistant::HomeAssistantClient, Adapter};
use solar_evse_controller::config::AppConfig;
use solar_evse_controller::controller::ControlService;
use solar_evse_controller::telemetry::{init_tracing, shutdown_signal};

#[tokio::main]
async fn main() -> Result<()> {
    let config = match AppConfig::load() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("failed to load configuration: {err:#}");
            std::process::exit(2);
        }
    };

    let steps = match config.step_table() {
        Ok(steps) => steps,
        Err(err) => {
            eprintln!("failed to load configuration: {err:#}");
            std::process::exit(2);
        }
    };

    init_tracing(&config.telemetry.log_level, config.telemetry.log_json);
    info!("starting solar surplus EVSE controller");

    let source = HomeAssistantClient::new(&config.home_assistant.base_url, &config.home_assistant.token)
        .context("failed to build Home Assistant client")?;
    let adapter = Adapter::new(source, config.entities.clone());

    let service = ControlService::new(adapter, config.controller, steps, config.tick_seconds, config.ui_state_path.clone());

    service.run(shutdown_signal()).await;
    info!("shutdown complete");
    Ok(())
}
