#![allow(dead_code)]
//! Fixed-period tick loop: Adapter -> StateMachine -> Adapter, plus the UI
//! snapshot the out-of-band dashboard reads.
//!
//! Grounded in `original_source/evse_manager/app/controller_service.py`'s
//! `ControlService` — `run_forever`/`_run_tick`/`_persist_ui_state` map
//! directly onto [`ControlService::run`]/[`ControlService::tick_once`]/
//! [`ControlService::write_ui_snapshot`].

use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use crate::adapter::{Adapter, DataSource};
use crate::domain::{ControllerConfig, Decision, DerivedValues, Inputs, Region, StateMachine, StepTable};

/// Number of history samples retained for the UI's energy-map sparkline.
/// Matches the add-on this controller descends from: 180 ticks, i.e. 6
/// minutes of history at the default 2s tick period.
const HISTORY_LIMIT: usize = 180;

/// One entry in the UI snapshot's `energy_map.history` array.
#[derive(Debug, Clone, Serialize)]
pub struct HistorySample {
    pub ts: DateTime<Utc>,
    pub available: Option<f64>,
    pub pv: Option<f64>,
    pub load: Option<f64>,
    pub current: u32,
    pub target: Option<u32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatterySnapshot {
    pub soc: Option<f64>,
    pub power: Option<f64>,
    pub direction: &'static str,
}

#[derive(Debug, Clone, Serialize)]
pub struct EvseStepEntry {
    pub amps: u32,
    pub watts: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct EnergyMap {
    pub history: Vec<HistorySample>,
    pub evse_steps: Vec<EvseStepEntry>,
    pub current_watts: f64,
    pub target_watts: Option<f64>,
    pub available_power: Option<f64>,
    pub inverter_limit: f64,
    pub battery_guard_soc: f64,
}

/// Full contents of the UI snapshot file. Consumers must tolerate missing
/// fields (spec.md §6) — this is the writer's side of that contract, not a
/// schema either side is required to treat as frozen.
#[derive(Debug, Clone, Serialize)]
pub struct UiSnapshot {
    pub mode: &'static str,
    pub status: &'static str,
    pub mode_state: String,
    pub region: String,
    pub charger_status: String,
    pub current_amps: u32,
    pub target_current: Option<u32>,
    pub available_power: Option<f64>,
    pub charging_power: f64,
    pub inverter_power: Option<f64>,
    pub pv_power_w: Option<f64>,
    pub battery: BatterySnapshot,
    pub battery_priority_soc: f64,
    pub limiting_factors: Vec<String>,
    pub auto_state: &'static str,
    pub auto_state_label: &'static str,
    pub auto_state_help: &'static str,
    pub energy_map: EnergyMap,
    // Supplemental UI-only fields from original_source/: what the dashboard
    // actually renders when the car isn't home, and a human-readable PV
    // figure even when the excess-power computation returns None.
    pub ui_available_for_ev: Option<f64>,
    pub ui_pv_display: Option<f64>,
    pub updated_at: DateTime<Utc>,
}

pub struct ControlService<D: DataSource> {
    adapter: Adapter<D>,
    machine: StateMachine,
    tick_seconds: u64,
    ui_state_path: PathBuf,
    monotonic_start: std::time::Instant,
    history: VecDeque<HistorySample>,
}

impl<D: DataSource> ControlService<D> {
    pub fn new(
        adapter: Adapter<D>,
        config: ControllerConfig,
        steps: StepTable,
        tick_seconds: u64,
        ui_state_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            adapter,
            machine: StateMachine::new(config, steps),
            tick_seconds: tick_seconds.clamp(1, 2),
            ui_state_path: ui_state_path.into(),
            monotonic_start: std::time::Instant::now(),
            history: VecDeque::with_capacity(HISTORY_LIMIT),
        }
    }

    fn now_s(&self) -> f64 {
        self.monotonic_start.elapsed().as_secs_f64()
    }

    /// Run forever at `tick_seconds` cadence until the provided signal
    /// future resolves. A failing tick is logged and retried next period —
    /// the loop itself never exits on a tick error (spec.md §7).
    pub async fn run(mut self, shutdown: impl std::future::Future<Output = ()>) {
        tokio::pin!(shutdown);

        let first_inputs = self.adapter.read_inputs(self.now_s()).await;
        self.machine.sync_with_charger(&first_inputs);
        info!(
            evse_step_index = self.machine.state().evse_step_index,
            "adopted startup charger session"
        );

        let mut interval = tokio::time::interval(std::time::Duration::from_secs(self.tick_seconds));
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(err) = self.tick_once().await {
                        error!(%err, "tick failed, will retry next period");
                    }
                }
                _ = &mut shutdown => {
                    info!("shutdown requested, exiting tick loop");
                    break;
                }
            }
        }
    }

    /// Run a single tick: sample, decide, actuate, snapshot. Exposed
    /// separately from [`Self::run`] so it can be driven directly in tests.
    pub async fn tick_once(&mut self) -> anyhow::Result<()> {
        let inputs = self.adapter.read_inputs(self.now_s()).await;
        let (decision, derived) = self.machine.tick(&inputs);

        if let Some(decision) = &decision {
            self.log_transition(decision);
            self.adapter.apply_decision(decision).await;
        }

        self.record_history(&inputs, &derived);
        self.write_ui_snapshot(&inputs, &derived, decision.as_ref()).await;
        Ok(())
    }

    fn log_transition(&self, decision: &Decision) {
        info!(
            reason = decision.reason.as_str(),
            new_step_index = decision.new_state.evse_step_index,
            switch_command = ?decision.switch_command,
            current_command_amps = ?decision.current_command_amps,
            "state transition"
        );
    }

    fn record_history(&mut self, inputs: &Inputs, derived: &DerivedValues) {
        let state = self.machine.state();
        let sample = HistorySample {
            ts: Utc::now(),
            available: derived.excess_w,
            pv: inputs.pv_power_w,
            load: None,
            current: self.machine.steps().amps(state.evse_step_index),
            target: (state.evse_step_index > 0).then(|| self.machine.steps().amps(state.evse_step_index)),
        };
        while self.history.len() >= HISTORY_LIMIT {
            self.history.pop_front();
        }
        self.history.push_back(sample);
    }

    fn limiting_factors(&self, inputs: &Inputs, derived: &DerivedValues) -> Vec<String> {
        let mut factors = Vec::new();
        if !derived.ev_plugged {
            factors.push("car_unplugged".to_string());
        }
        if !inputs.auto_enabled {
            factors.push("auto_disabled".to_string());
        }
        if derived.inverter_over_limit {
            factors.push("inverter_limit".to_string());
        }
        if derived.waiting_timed_out {
            factors.push("vehicle_waiting".to_string());
        }
        if derived.cooldown_active {
            factors.push("cooldown".to_string());
        }
        if !derived.effect_ready {
            factors.push("sensor_latency".to_string());
        }
        factors
    }

    fn auto_state(&self, inputs: &Inputs, derived: &DerivedValues) -> (&'static str, &'static str, &'static str) {
        if !inputs.auto_enabled {
            return ("disabled", "Automation disabled", "Auto-charging is turned off in settings.");
        }
        if !derived.ev_plugged {
            return ("idle", "No vehicle", "Plug in the vehicle to start solar charging.");
        }
        if self.machine.state().evse_step_index == 0 {
            return ("waiting", "Waiting for surplus", "Not enough solar surplus to start charging yet.");
        }
        ("charging", "Charging from surplus", "Charging current is being adjusted to match available solar power.")
    }

    async fn write_ui_snapshot(&self, inputs: &Inputs, derived: &DerivedValues, decision: Option<&Decision>) {
        let config = self.machine.config();
        let state = self.machine.state();
        let steps = self.machine.steps();

        let current_amps = steps.amps(state.evse_step_index);
        let current_watts = steps.watts(state.evse_step_index, config.line_voltage_v);
        let target_current = decision.and_then(|d| d.current_command_amps);
        let target_watts = target_current.map(|a| a as f64 * config.line_voltage_v);

        let direction = match inputs.batt_power_w {
            Some(p) if p > 5.0 => "discharging",
            Some(p) if p < -5.0 => "charging",
            Some(_) => "idle",
            None => "idle",
        };

        let ui_available_for_ev = match derived.region {
            Region::Main => derived.excess_w,
            Region::Probe => Some(0.0_f64.max(-inputs.batt_power_w.unwrap_or(0.0))),
        };
        let ui_pv_display = inputs.pv_power_w.or(derived.excess_w);

        let (auto_state, auto_state_label, auto_state_help) = self.auto_state(inputs, derived);

        let snapshot = UiSnapshot {
            mode: "solar_surplus",
            status: if state.evse_step_index > 0 { "active" } else { "idle" },
            mode_state: state.mode_state.to_string(),
            region: derived.region.to_string(),
            charger_status: inputs.charger_status.clone(),
            current_amps,
            target_current,
            available_power: derived.excess_w,
            charging_power: current_watts,
            inverter_power: inputs.inverter_power_w,
            pv_power_w: inputs.pv_power_w,
            battery: BatterySnapshot {
                soc: inputs.batt_soc_percent,
                power: inputs.batt_power_w,
                direction,
            },
            battery_priority_soc: config.soc_main_max,
            limiting_factors: self.limiting_factors(inputs, derived),
            auto_state,
            auto_state_label,
            auto_state_help,
            energy_map: EnergyMap {
                history: self.history.iter().cloned().collect(),
                evse_steps: steps
                    .steps()
                    .iter()
                    .map(|&amps| EvseStepEntry { amps, watts: amps as f64 * config.line_voltage_v })
                    .collect(),
                current_watts,
                target_watts,
                available_power: derived.excess_w,
                inverter_limit: config.safe_inverter_max_w(),
                battery_guard_soc: config.soc_main_max,
            },
            ui_available_for_ev,
            ui_pv_display,
            updated_at: Utc::now(),
        };

        if let Err(err) = write_atomic(&self.ui_state_path, &snapshot).await {
            warn!(%err, path = %self.ui_state_path.display(), "failed to write UI snapshot");
        }
    }
}

/// Write `value` as JSON to `path` via write-to-temp-then-rename, so a
/// concurrent dashboard read never observes a partially written file
/// (spec.md §6).
async fn write_atomic<T: Serialize>(path: &Path, value: &T) -> anyhow::Result<()> {
    let body = serde_json::to_vec_pretty(value)?;
    let tmp_path = path.with_extension("json.tmp");
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.ok();
    }
    tokio::fs::write(&tmp_path, &body).await?;
    tokio::fs::rename(&tmp_path, path).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{EntityConfig, MockDataSource};

    fn entity_config() -> EntityConfig {
        EntityConfig {
            charger_switch: "switch.ev_charger".to_string(),
            charger_current: "number.ev_charger_set_current".to_string(),
            charger_status: "sensor.ev_charger_status".to_string(),
            battery_soc: Some("sensor.battery_soc".to_string()),
            battery_power: Some("sensor.battery_power".to_string()),
            inverter_power: Some("sensor.inverter_power".to_string()),
            pv_power: Some("sensor.pv_power".to_string()),
            auto_enabled: None,
            auto_enabled_default: true,
            switch_jiggle_attempts: 1,
            switch_jiggle_delay_s: 0.0,
        }
    }

    #[tokio::test]
    async fn tick_once_writes_snapshot_and_actuates_on_surplus() {
        let source = MockDataSource::new();
        source.set("sensor.battery_soc", "60.0");
        source.set("sensor.battery_power", "-500");
        source.set("sensor.inverter_power", "2000");
        source.set("sensor.pv_power", "6000");
        source.set("sensor.ev_charger_status", "charging");
        source.set("switch.ev_charger", "off");

        let adapter = Adapter::new(source, entity_config());
        let tmp_dir = std::env::temp_dir().join(format!("evse-ui-test-{}", std::process::id()));
        let ui_path = tmp_dir.join("ui_state.json");

        let mut service = ControlService::new(
            adapter,
            ControllerConfig::default(),
            StepTable::default_table(),
            2,
            &ui_path,
        );

        service.tick_once().await.expect("tick should succeed");
        assert_eq!(service.machine.state().evse_step_index, 1);

        let written = tokio::fs::read_to_string(&ui_path).await.expect("snapshot file should exist");
        let parsed: serde_json::Value = serde_json::from_str(&written).expect("snapshot should be valid JSON");
        assert_eq!(parsed["current_amps"], 6);
        assert_eq!(parsed["status"], "active");

        tokio::fs::remove_dir_all(&tmp_dir).await.ok();
    }

    #[tokio::test]
    async fn limiting_factors_flag_unplugged_vehicle() {
        let source = MockDataSource::new();
        source.set("sensor.ev_charger_status", "available");
        let adapter = Adapter::new(source, entity_config());
        let service = ControlService::new(
            adapter,
            ControllerConfig::default(),
            StepTable::default_table(),
            2,
            "/tmp/unused_ui_state.json",
        );
        let inputs = Inputs {
            batt_soc_percent: None,
            batt_power_w: None,
            inverter_power_w: None,
            pv_power_w: None,
            charger_status: "available".to_string(),
            charger_switch_on: false,
            charger_current_a: None,
            auto_enabled: true,
            now_s: 0.0,
        };
        let derived = DerivedValues {
            region: Region::Main,
            ev_plugged: false,
            excess_w: None,
            inverter_over_limit: false,
            cooldown_active: false,
            time_since_last_change_s: 0.0,
            waiting_timed_out: false,
            effect_ready: true,
        };
        let factors = service.limiting_factors(&inputs, &derived);
        assert!(factors.contains(&"car_unplugged".to_string()));
    }

    #[tokio::test]
    async fn limiting_factors_vehicle_waiting_requires_timeout_not_raw_status() {
        let source = MockDataSource::new();
        let adapter = Adapter::new(source, entity_config());
        let service = ControlService::new(
            adapter,
            ControllerConfig::default(),
            StepTable::default_table(),
            2,
            "/tmp/unused_ui_state.json",
        );
        let inputs = Inputs {
            batt_soc_percent: Some(60.0),
            batt_power_w: Some(-500.0),
            inverter_power_w: Some(2000.0),
            pv_power_w: Some(6000.0),
            charger_status: "waiting".to_string(),
            charger_switch_on: false,
            charger_current_a: None,
            auto_enabled: true,
            now_s: 10.0,
        };
        let derived = DerivedValues {
            region: Region::Main,
            ev_plugged: true,
            excess_w: Some(4000.0),
            inverter_over_limit: false,
            cooldown_active: false,
            time_since_last_change_s: 0.0,
            waiting_timed_out: false,
            effect_ready: true,
        };
        let factors = service.limiting_factors(&inputs, &derived);
        assert!(
            !factors.contains(&"vehicle_waiting".to_string()),
            "raw \"waiting\" status alone should not surface vehicle_waiting before the timeout elapses"
        );

        let derived_timed_out = DerivedValues { waiting_timed_out: true, ..derived };
        let factors = service.limiting_factors(&inputs, &derived_timed_out);
        assert!(factors.contains(&"vehicle_waiting".to_string()));
    }
}
