#![allow(dead_code)]
//! Application configuration: FSM tuning, Home Assistant connection, entity
//! map and the handful of process-level knobs (tick period, UI snapshot
//! path, log level).
//!
//! Loaded once at startup via `figment` (TOML file, overridable by `EVSE__`
//! prefixed environment variables) and validated with `validator` before the
//! controller is built — a malformed config is a startup-time failure, never
//! a runtime one.

use anyhow::{Context, Result};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use validator::Validate;

use crate::adapter::EntityConfig;
use crate::domain::ControllerConfig;

/// Top-level application configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct AppConfig {
    #[validate(nested)]
    #[serde(default)]
    pub controller: ControllerConfig,

    #[validate(range(min = 1, max = 2))]
    #[serde(default = "default_tick_seconds")]
    pub tick_seconds: u64,

    #[serde(default = "default_auto_enabled_default")]
    pub auto_enabled_default: bool,

    #[validate(nested)]
    pub home_assistant: HomeAssistantConfig,

    #[validate(nested)]
    pub entities: EntityConfig,

    #[serde(default = "default_ui_state_path")]
    pub ui_state_path: PathBuf,

    #[validate(nested)]
    #[serde(default)]
    pub telemetry: TelemetryConfig,

    /// Allowed EVSE amperage ladder, first entry always 0 (off). Falls back
    /// to [`crate::domain::DEFAULT_STEPS_AMPS`] when absent.
    #[serde(default = "default_step_amps")]
    pub step_amps: Vec<u32>,

    #[validate(range(min = 1))]
    #[serde(default = "default_min_operating_current_a")]
    pub min_operating_current_a: u32,
}

/// Home Assistant REST endpoint this controller reads sensors from and
/// issues service calls against.
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct HomeAssistantConfig {
    #[validate(url)]
    pub base_url: String,

    #[validate(length(min = 1))]
    pub token: String,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct TelemetryConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub log_json: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_json: false,
        }
    }
}

fn default_tick_seconds() -> u64 {
    2
}

fn default_auto_enabled_default() -> bool {
    true
}

fn default_ui_state_path() -> PathBuf {
    PathBuf::from("/data/ui_state.json")
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_step_amps() -> Vec<u32> {
    crate::domain::DEFAULT_STEPS_AMPS.to_vec()
}

fn default_min_operating_current_a() -> u32 {
    6
}

impl AppConfig {
    /// Load configuration from `config.toml` plus `EVSE__`-prefixed
    /// environment variable overrides (e.g. `EVSE__HOME_ASSISTANT__TOKEN`).
    pub fn load() -> Result<Self> {
        Self::load_from(&default_config_path())
    }

    pub fn load_from(path: &std::path::Path) -> Result<Self> {
        let config: AppConfig = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("EVSE__").split("__"))
            .extract()
            .context("failed to parse configuration")?;

        config.validate().context("configuration validation failed")?;
        Ok(config)
    }

    /// Build the configured [`crate::domain::StepTable`], validating its
    /// invariants (spec.md §3/§4.4). A malformed ladder is a startup-time
    /// failure, same as any other config error.
    pub fn step_table(&self) -> Result<crate::domain::StepTable> {
        crate::domain::StepTable::new(self.step_amps.clone(), self.min_operating_current_a)
            .context("invalid step_amps configuration")
    }
}

fn default_config_path() -> PathBuf {
    std::env::var("EVSE_CONFIG_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("config.toml"))
}
