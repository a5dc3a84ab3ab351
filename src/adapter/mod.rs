#![allow(dead_code)]
//! The sole boundary between the deterministic FSM and the outside world.
//!
//! Nothing upstream of [`Adapter`] knows that Home Assistant (or any other
//! home-automation surface) exists; nothing downstream of it knows the FSM
//! exists. It translates a [`DataSource`]'s raw string states into a typed
//! [`Inputs`] snapshot, and a [`Decision`] back into one or two service
//! calls.

pub mod home_assistant;

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use validator::Validate;

use crate::domain::{Decision, Inputs};

/// The home-automation read/write surface the Adapter depends on. Polling
/// only — spec.md §6 explicitly rules out eventing/subscriptions.
#[async_trait]
pub trait DataSource: Send + Sync {
    /// Current reported state of an entity, or `None` if it does not exist.
    /// An `Err` means the call itself failed (timeout, transport error);
    /// the Adapter treats that identically to `None` — as an absent sensor.
    async fn get_state(&self, entity_id: &str) -> Result<Option<String>>;

    /// Invoke a service (`switch.turn_on`, `switch.turn_off`,
    /// `number.set_value`, ...). `value` carries the payload for services
    /// that take one (e.g. `number.set_value`).
    async fn call_service(
        &self,
        domain: &str,
        service: &str,
        entity_id: &str,
        value: Option<f64>,
    ) -> Result<()>;
}

/// Entity-ID map plus the handful of adapter-local knobs that aren't part of
/// the FSM's policy (spec.md §6 "entities.*").
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct EntityConfig {
    #[validate(length(min = 1))]
    pub charger_switch: String,
    #[validate(length(min = 1))]
    pub charger_current: String,
    #[validate(length(min = 1))]
    pub charger_status: String,

    #[serde(default)]
    pub battery_soc: Option<String>,
    #[serde(default)]
    pub battery_power: Option<String>,
    #[serde(default)]
    pub inverter_power: Option<String>,
    #[serde(default)]
    pub pv_power: Option<String>,
    #[serde(default)]
    pub auto_enabled: Option<String>,

    #[serde(default = "default_auto_enabled_default")]
    pub auto_enabled_default: bool,

    /// How many times to pulse `switch.turn_on` before giving up on a relay
    /// that does not reliably latch on the first call. 1 = no extra jiggle.
    #[serde(default = "default_switch_jiggle_attempts")]
    #[validate(range(min = 1, max = 10))]
    pub switch_jiggle_attempts: u32,

    /// Delay between jiggle attempts while waiting for the switch's
    /// read-back to report "on".
    #[serde(default = "default_switch_jiggle_delay_s")]
    pub switch_jiggle_delay_s: f64,
}

fn default_auto_enabled_default() -> bool {
    true
}

fn default_switch_jiggle_attempts() -> u32 {
    1
}

fn default_switch_jiggle_delay_s() -> f64 {
    0.2
}

const AUTO_ENABLED_TRUE_VALUES: &[&str] = &["on", "true", "1", "enabled"];
const AUTO_ENABLED_FALSE_VALUES: &[&str] = &["off", "false", "0", "disabled"];

/// Translates a [`DataSource`] into [`Inputs`] snapshots and [`Decision`]s
/// back into service calls.
pub struct Adapter<D: DataSource> {
    source: D,
    entities: EntityConfig,
}

impl<D: DataSource> Adapter<D> {
    pub fn new(source: D, entities: EntityConfig) -> Self {
        Self { source, entities }
    }

    pub fn entities(&self) -> &EntityConfig {
        &self.entities
    }

    /// Sample every configured entity into a single typed snapshot. Best
    /// effort throughout: an unreadable or unparseable entity becomes
    /// `None`/a fallback rather than aborting the tick.
    pub async fn read_inputs(&self, now_s: f64) -> Inputs {
        let batt_soc_percent = self.read_float(self.entities.battery_soc.as_deref()).await;
        let batt_power_w = self.read_float(self.entities.battery_power.as_deref()).await;
        let inverter_power_w = self.read_float(self.entities.inverter_power.as_deref()).await;
        let pv_power_w = self.read_float(self.entities.pv_power.as_deref()).await;
        let charger_status = self
            .read_text(Some(self.entities.charger_status.as_str()), "unknown")
            .await;
        let charger_switch_on = self
            .read_text(Some(self.entities.charger_switch.as_str()), "off")
            .await
            == "on";
        let charger_current_a = self.read_float(Some(self.entities.charger_current.as_str())).await;
        let auto_enabled = self.read_auto_enabled().await;

        Inputs {
            batt_soc_percent,
            batt_power_w,
            inverter_power_w,
            pv_power_w,
            charger_status,
            charger_switch_on,
            charger_current_a,
            auto_enabled,
            now_s,
        }
    }

    /// Apply a [`Decision`]'s side effects: at most one switch command and
    /// one amperage command. A failed call is logged and left for the next
    /// tick's resync to reconcile (spec.md §4.2, §7).
    pub async fn apply_decision(&self, decision: &Decision) {
        if let Some(desired) = decision.switch_command {
            self.apply_switch_command(desired, decision.reason.as_str()).await;
        }
        if let Some(amps) = decision.current_command_amps {
            let entity_id = &self.entities.charger_current;
            info!(entity_id, amps, reason = decision.reason.as_str(), "setting charger current");
            if let Err(err) = self
                .source
                .call_service("number", "set_value", entity_id, Some(amps as f64))
                .await
            {
                warn!(entity_id, %err, "failed to set charger current");
            }
        }
    }

    async fn apply_switch_command(&self, desired: bool, reason: &str) {
        let entity_id = &self.entities.charger_switch;
        let service = if desired { "turn_on" } else { "turn_off" };
        info!(entity_id, service, reason, "setting charger switch");

        if let Err(err) = self.source.call_service("switch", service, entity_id, None).await {
            warn!(entity_id, service, %err, "failed to call switch service");
            return;
        }

        // Turning off never needs the jiggle — only a relay that fails to
        // latch "on" on the first pulse does (original_source/tests/test_ha_adapter.py).
        if !desired {
            return;
        }

        for attempt in 1..self.entities.switch_jiggle_attempts {
            if self.read_text(Some(entity_id.as_str()), "off").await == "on" {
                return;
            }
            if self.entities.switch_jiggle_delay_s > 0.0 {
                tokio::time::sleep(std::time::Duration::from_secs_f64(self.entities.switch_jiggle_delay_s)).await;
            }
            info!(entity_id, attempt, "re-pulsing switch.turn_on, relay has not latched yet");
            if let Err(err) = self.source.call_service("switch", "turn_on", entity_id, None).await {
                warn!(entity_id, %err, "failed to re-pulse switch.turn_on");
                return;
            }
        }
    }

    async fn read_auto_enabled(&self) -> bool {
        let Some(entity_id) = self.entities.auto_enabled.as_deref() else {
            return self.entities.auto_enabled_default;
        };
        let Ok(Some(raw)) = self.source.get_state(entity_id).await else {
            return self.entities.auto_enabled_default;
        };
        let normalized = raw.trim().to_lowercase();
        if AUTO_ENABLED_TRUE_VALUES.contains(&normalized.as_str()) {
            true
        } else if AUTO_ENABLED_FALSE_VALUES.contains(&normalized.as_str()) {
            false
        } else {
            self.entities.auto_enabled_default
        }
    }

    async fn read_text(&self, entity_id: Option<&str>, default: &str) -> String {
        let Some(entity_id) = entity_id else {
            return default.to_string();
        };
        match self.source.get_state(entity_id).await {
            Ok(Some(state)) => state.to_lowercase(),
            Ok(None) => default.to_string(),
            Err(err) => {
                warn!(entity_id, %err, "failed to read entity state");
                default.to_string()
            }
        }
    }

    async fn read_float(&self, entity_id: Option<&str>) -> Option<f64> {
        let entity_id = entity_id?;
        match self.source.get_state(entity_id).await {
            Ok(Some(state)) => state.trim().parse::<f64>().ok(),
            Ok(None) => None,
            Err(err) => {
                warn!(entity_id, %err, "failed to read entity state");
                None
            }
        }
    }
}

/// In-memory [`DataSource`] used by tests and the scenario fixtures in
/// `tests/`. Not wired into the production binary.
#[derive(Debug, Default)]
pub struct MockDataSource {
    states: std::sync::Mutex<HashMap<String, String>>,
    pub calls: std::sync::Mutex<Vec<(String, String, String, Option<f64>)>>,
}

impl MockDataSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, entity_id: &str, value: impl Into<String>) {
        self.states.lock().unwrap().insert(entity_id.to_string(), value.into());
    }
}

#[async_trait]
impl DataSource for MockDataSource {
    async fn get_state(&self, entity_id: &str) -> Result<Option<String>> {
        Ok(self.states.lock().unwrap().get(entity_id).cloned())
    }

    async fn call_service(
        &self,
        domain: &str,
        service: &str,
        entity_id: &str,
        value: Option<f64>,
    ) -> Result<()> {
        self.calls
            .lock()
            .unwrap()
            .push((domain.to_string(), service.to_string(), entity_id.to_string(), value));
        if domain == "switch" {
            let state = if service == "turn_on" { "on" } else { "off" };
            self.set(entity_id, state);
        }
        Ok(())
    }
}
