#![allow(dead_code)]
//! The deterministic EVSE state machine.
//!
//! This is the only place policy lives. It does no I/O: every input arrives
//! through [`Inputs`], every output is a plain [`Decision`] value, and the
//! machine's own state is replaced wholesale rather than mutated field by
//! field (see the module-level design notes in SPEC_FULL.md §9). That makes
//! `tick` a pure function of `(ControllerState, Inputs) -> (ControllerState,
//! Option<Decision>, DerivedValues)`, which is what makes it tractable to
//! property-test.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use validator::Validate;

use super::step_table::StepTable;

/// Immutable constants that shape FSM behaviour. Loaded once at process
/// start from [`crate::config::AppConfig`] and never mutated afterward.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ControllerConfig {
    #[validate(range(min = 1.0, max = 1000.0))]
    pub line_voltage_v: f64,
    #[validate(range(min = 0.0, max = 100.0))]
    pub soc_main_max: f64,
    #[validate(range(min = 0.0, max = 100.0))]
    pub soc_conservative_below: f64,
    pub small_discharge_margin_w: f64,
    pub conservative_charge_target_w: f64,
    pub conservative_discharge_threshold_w: f64,
    pub probe_max_discharge_w: f64,
    #[validate(range(min = 1.0))]
    pub inverter_limit_w: f64,
    #[validate(range(min = 0.0))]
    pub inverter_margin_w: f64,
    #[validate(range(min = 0.0))]
    pub cooldown_s: f64,
    #[validate(range(min = 0.0))]
    pub waiting_timeout_s: f64,
    #[validate(range(min = 0.0))]
    pub sensor_latency_s: f64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            line_voltage_v: 230.0,
            soc_main_max: 95.0,
            soc_conservative_below: 94.0,
            small_discharge_margin_w: 200.0,
            conservative_charge_target_w: 100.0,
            conservative_discharge_threshold_w: 50.0,
            probe_max_discharge_w: 1000.0,
            inverter_limit_w: 8000.0,
            inverter_margin_w: 500.0,
            cooldown_s: 5.0,
            waiting_timeout_s: 60.0,
            sensor_latency_s: 25.0,
        }
    }
}

impl ControllerConfig {
    pub fn safe_inverter_max_w(&self) -> f64 {
        self.inverter_limit_w - self.inverter_margin_w
    }
}

/// FSM macro states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModeState {
    Off,
    MainReady,
    MainCooldown,
    ProbeReady,
    ProbeCooldown,
}

impl fmt::Display for ModeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ModeState::Off => "OFF",
            ModeState::MainReady => "MAIN_READY",
            ModeState::MainCooldown => "MAIN_COOLDOWN",
            ModeState::ProbeReady => "PROBE_READY",
            ModeState::ProbeCooldown => "PROBE_COOLDOWN",
        };
        f.write_str(s)
    }
}

/// SOC-derived operating region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Region {
    Main,
    Probe,
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Region::Main => "MAIN",
            Region::Probe => "PROBE",
        })
    }
}

/// Stable, closed set of decision reasons. `Display` yields the exact
/// identifier spec'd for logs and tests (e.g. `"main_start"`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Reason {
    FaultState,
    WaitingTimeout,
    EvUnplugged,
    AutoDisabled,
    MainStart,
    ProbeStart,
    InverterDrop,
    InverterStepDown,
    MainConservativeBattDischarge,
    MainConservativeStepDown,
    MainStepUp,
    MainStepDown,
    ProbeStepUp,
    ProbeStepDown,
}

impl Reason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Reason::FaultState => "fault_state",
            Reason::WaitingTimeout => "waiting_timeout",
            Reason::EvUnplugged => "ev_unplugged",
            Reason::AutoDisabled => "auto_disabled",
            Reason::MainStart => "main_start",
            Reason::ProbeStart => "probe_start",
            Reason::InverterDrop => "inverter_drop",
            Reason::InverterStepDown => "inverter_step_down",
            Reason::MainConservativeBattDischarge => "main_conservative_batt_discharge",
            Reason::MainConservativeStepDown => "main_conservative_step_down",
            Reason::MainStepUp => "main_step_up",
            Reason::MainStepDown => "main_step_down",
            Reason::ProbeStepUp => "probe_step_up",
            Reason::ProbeStepDown => "probe_step_down",
        }
    }
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Internal state owned solely by [`StateMachine`]. Replaced wholesale on
/// every transition rather than mutated field by field.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ControllerState {
    pub mode_state: ModeState,
    pub evse_step_index: usize,
    pub last_change_ts_s: f64,
    pub waiting_since_ts_s: Option<f64>,
    pub pending_effect_ts_s: Option<f64>,
}

impl Default for ControllerState {
    fn default() -> Self {
        Self {
            mode_state: ModeState::Off,
            evse_step_index: 0,
            last_change_ts_s: 0.0,
            waiting_since_ts_s: None,
            pending_effect_ts_s: None,
        }
    }
}

/// Per-tick snapshot of every upstream entity. Every sensor field is
/// `Option` because the Adapter treats an unreadable or unparseable sensor
/// as absent rather than guessing a value.
#[derive(Debug, Clone, PartialEq)]
pub struct Inputs {
    pub batt_soc_percent: Option<f64>,
    pub batt_power_w: Option<f64>,
    pub inverter_power_w: Option<f64>,
    pub pv_power_w: Option<f64>,
    pub charger_status: String,
    pub charger_switch_on: bool,
    pub charger_current_a: Option<f64>,
    pub auto_enabled: bool,
    pub now_s: f64,
}

impl Inputs {
    fn status(&self) -> String {
        self.charger_status.to_lowercase()
    }

    fn ev_plugged(&self) -> bool {
        self.status() != "available"
    }
}

/// Facts derived from `(state, inputs)` before rule evaluation, exposed to
/// the caller for UI-snapshot / logging purposes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DerivedValues {
    pub region: Region,
    pub ev_plugged: bool,
    pub excess_w: Option<f64>,
    pub inverter_over_limit: bool,
    pub cooldown_active: bool,
    pub time_since_last_change_s: f64,
    pub waiting_timed_out: bool,
    pub effect_ready: bool,
}

/// A single per-tick FSM output: the next state plus whatever side effects
/// the Adapter must apply.
#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    pub new_state: ControllerState,
    pub switch_command: Option<bool>,
    pub current_command_amps: Option<u32>,
    pub reason: Reason,
    pub metadata: BTreeMap<String, f64>,
}

/// Pure, single-owner FSM. Holds no I/O handles; everything it needs arrives
/// through `Inputs`.
pub struct StateMachine {
    config: ControllerConfig,
    steps: StepTable,
    state: ControllerState,
}

/// Tolerance (A) for detecting an externally-changed commanded current.
const EXTERNAL_CHANGE_TOLERANCE_A: f64 = 2.0;
/// Tolerance (A) for matching a reported current to the closest step.
const RESYNC_MATCH_TOLERANCE_A: f64 = 3.0;

impl StateMachine {
    pub fn new(config: ControllerConfig, steps: StepTable) -> Self {
        Self {
            config,
            steps,
            state: ControllerState::default(),
        }
    }

    pub fn with_state(config: ControllerConfig, steps: StepTable, state: ControllerState) -> Self {
        Self { config, steps, state }
    }

    pub fn state(&self) -> ControllerState {
        self.state
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn steps(&self) -> &StepTable {
        &self.steps
    }

    /// Run once at startup. If the FSM is at step 0 but the charger reports
    /// a live session at a recognisable current, adopt it.
    pub fn sync_with_charger(&mut self, inputs: &Inputs) {
        if self.state.evse_step_index != 0 {
            return;
        }
        let status = inputs.status();
        if status != "charging" && status != "connected" {
            return;
        }
        let Some(current_amps) = inputs.charger_current_a else {
            return;
        };
        if current_amps < 1.0 {
            return;
        }
        let Some(best_index) = self.nearest_nonzero_step(current_amps) else {
            return;
        };
        let region = self.region_for_soc(inputs.batt_soc_percent);
        let mode_state = match region {
            Region::Main => ModeState::MainReady,
            Region::Probe => ModeState::ProbeReady,
        };
        self.state = ControllerState {
            mode_state,
            evse_step_index: best_index,
            last_change_ts_s: inputs.now_s,
            waiting_since_ts_s: None,
            pending_effect_ts_s: None,
        };
    }

    /// Closest step index within [`RESYNC_MATCH_TOLERANCE_A`], excluding
    /// index 0 (off).
    fn nearest_nonzero_step(&self, amps: f64) -> Option<usize> {
        let mut best: Option<(usize, f64)> = None;
        for idx in 1..self.steps.len() {
            let diff = (self.steps.amps(idx) as f64 - amps).abs();
            let replace = match best {
                Some((_, best_diff)) => diff < best_diff,
                None => true,
            };
            if replace {
                best = Some((idx, diff));
            }
        }
        best.filter(|(_, diff)| *diff <= RESYNC_MATCH_TOLERANCE_A)
            .map(|(idx, _)| idx)
    }

    /// Run once per control period.
    pub fn tick(&mut self, inputs: &Inputs) -> (Option<Decision>, DerivedValues) {
        self.detect_external_change(inputs);

        // `derive` must read `waiting_since_ts_s` before `update_waiting_timer`
        // clears it, so a tick where the status flips away from "waiting" in
        // the same tick the timeout elapses still observes the stale
        // `waiting_timed_out = true` the global gates need to force off.
        let derived = self.derive(inputs);
        self.update_waiting_timer(inputs);
        self.sync_mode_state(derived.region, derived.cooldown_active);

        let decision = self.evaluate_rules(inputs, &derived);
        if let Some(decision) = &decision {
            self.state = decision.new_state;
        }
        (decision, derived)
    }

    /// Pre-rule resync: reconcile FSM state to the charger's actual
    /// commanded current after an external change (spec.md §4.1.4).
    fn detect_external_change(&mut self, inputs: &Inputs) {
        let Some(actual_amps) = inputs.charger_current_a else {
            return;
        };
        if actual_amps < 1.0 {
            return;
        }
        let expected_amps = self.steps.amps(self.state.evse_step_index) as f64;
        let diff = if self.state.evse_step_index == 0 {
            actual_amps
        } else {
            (expected_amps - actual_amps).abs()
        };
        if diff <= EXTERNAL_CHANGE_TOLERANCE_A {
            return;
        }
        let Some(best_index) = self.nearest_any_step(actual_amps) else {
            return;
        };
        let region = self.region_for_soc(inputs.batt_soc_percent);
        let mode_state = if best_index == 0 {
            ModeState::Off
        } else {
            match region {
                Region::Main => ModeState::MainReady,
                Region::Probe => ModeState::ProbeReady,
            }
        };
        self.state = ControllerState {
            mode_state,
            evse_step_index: best_index,
            last_change_ts_s: inputs.now_s,
            waiting_since_ts_s: self.state.waiting_since_ts_s,
            pending_effect_ts_s: None,
        };
    }

    fn nearest_any_step(&self, amps: f64) -> Option<usize> {
        let mut best: Option<(usize, f64)> = None;
        for idx in 0..self.steps.len() {
            let diff = (self.steps.amps(idx) as f64 - amps).abs();
            let replace = match best {
                Some((_, best_diff)) => diff < best_diff,
                None => true,
            };
            if replace {
                best = Some((idx, diff));
            }
        }
        best.filter(|(_, diff)| *diff <= RESYNC_MATCH_TOLERANCE_A)
            .map(|(idx, _)| idx)
    }

    fn update_waiting_timer(&mut self, inputs: &Inputs) {
        if inputs.status() == "waiting" {
            if self.state.waiting_since_ts_s.is_none() {
                self.state.waiting_since_ts_s = Some(inputs.now_s);
            }
        } else if self.state.waiting_since_ts_s.is_some() {
            self.state.waiting_since_ts_s = None;
        }
    }

    fn derive(&mut self, inputs: &Inputs) -> DerivedValues {
        let region = self.region_for_soc(inputs.batt_soc_percent);
        let time_since_last_change_s = (inputs.now_s - self.state.last_change_ts_s).max(0.0);
        let cooldown_active = time_since_last_change_s < self.config.cooldown_s;

        let inverter_over_limit = inputs
            .inverter_power_w
            .is_some_and(|p| p > self.config.safe_inverter_max_w());

        let excess_w = match region {
            Region::Main => match (inputs.pv_power_w, inputs.inverter_power_w) {
                (Some(pv), Some(inv)) => Some(pv - inv),
                _ => inputs.batt_power_w.map(|batt| -batt),
            },
            Region::Probe => None,
        };

        let waiting_timed_out = self
            .state
            .waiting_since_ts_s
            .is_some_and(|since| (inputs.now_s - since) > self.config.waiting_timeout_s);

        let mut effect_ready = true;
        if let Some(pending_ts) = self.state.pending_effect_ts_s {
            effect_ready = (inputs.now_s - pending_ts) >= self.config.sensor_latency_s;
            if effect_ready {
                self.state.pending_effect_ts_s = None;
            }
        }

        DerivedValues {
            region,
            ev_plugged: inputs.ev_plugged(),
            excess_w,
            inverter_over_limit,
            cooldown_active,
            time_since_last_change_s,
            waiting_timed_out,
            effect_ready,
        }
    }

    fn sync_mode_state(&mut self, region: Region, cooldown_active: bool) {
        let desired = self.desired_mode_state(region, cooldown_active);
        if self.state.mode_state != desired {
            self.state.mode_state = desired;
        }
    }

    fn desired_mode_state(&self, region: Region, cooldown_active: bool) -> ModeState {
        if self.state.evse_step_index == 0 {
            return ModeState::Off;
        }
        match region {
            Region::Main => {
                if cooldown_active {
                    ModeState::MainCooldown
                } else {
                    ModeState::MainReady
                }
            }
            Region::Probe => {
                if cooldown_active {
                    ModeState::ProbeCooldown
                } else {
                    ModeState::ProbeReady
                }
            }
        }
    }

    fn region_for_soc(&self, batt_soc: Option<f64>) -> Region {
        match batt_soc {
            Some(soc) if soc >= self.config.soc_main_max => Region::Probe,
            _ => Region::Main,
        }
    }

    fn evaluate_rules(&mut self, inputs: &Inputs, derived: &DerivedValues) -> Option<Decision> {
        if let Some(decision) = self.global_gates(inputs, derived) {
            return Some(decision);
        }
        match self.state.mode_state {
            ModeState::Off => {
                if derived.cooldown_active {
                    return None;
                }
                match derived.region {
                    Region::Main => self.main_start(inputs, derived),
                    Region::Probe => self.probe_start(inputs),
                }
            }
            ModeState::MainCooldown | ModeState::ProbeCooldown => None,
            ModeState::MainReady | ModeState::ProbeReady => {
                if let Some(decision) = self.inverter_emergency(inputs, derived) {
                    return Some(decision);
                }
                match derived.region {
                    Region::Main => self.main_ready(inputs, derived),
                    Region::Probe => self.probe_ready(inputs, derived),
                }
            }
        }
    }

    fn global_gates(&mut self, inputs: &Inputs, derived: &DerivedValues) -> Option<Decision> {
        if inputs.status() == "fault" {
            return Some(self.force_off(inputs, Reason::FaultState, true));
        }
        if derived.waiting_timed_out {
            return Some(self.force_off(inputs, Reason::WaitingTimeout, true));
        }
        if !derived.ev_plugged {
            return Some(self.force_off(inputs, Reason::EvUnplugged, false));
        }
        if !inputs.auto_enabled {
            return Some(self.force_off(inputs, Reason::AutoDisabled, false));
        }
        None
    }

    fn force_off(&self, inputs: &Inputs, reason: Reason, latch_wait: bool) -> Decision {
        let waiting_since_ts_s = if latch_wait {
            self.state.waiting_since_ts_s
        } else {
            None
        };
        let new_state = ControllerState {
            mode_state: ModeState::Off,
            evse_step_index: 0,
            last_change_ts_s: inputs.now_s,
            waiting_since_ts_s,
            pending_effect_ts_s: None,
        };
        let mut metadata = BTreeMap::new();
        metadata.insert("soc".to_string(), inputs.batt_soc_percent.unwrap_or(0.0));
        Decision {
            new_state,
            switch_command: Some(false),
            current_command_amps: None,
            reason,
            metadata,
        }
    }

    fn main_start(&self, inputs: &Inputs, derived: &DerivedValues) -> Option<Decision> {
        let excess_w = derived.excess_w?;
        let threshold = self.steps.amps(1) as f64 * self.config.line_voltage_v;
        if excess_w < threshold {
            return None;
        }
        if !self.inverter_safe(inputs, 0) {
            return None;
        }
        Some(self.set_step(inputs, 1, Reason::MainStart))
    }

    fn probe_start(&self, inputs: &Inputs) -> Option<Decision> {
        let batt_power = inputs.batt_power_w?;
        if batt_power > 0.0 {
            return None;
        }
        if !self.inverter_safe(inputs, 0) {
            return None;
        }
        Some(self.set_step(inputs, 1, Reason::ProbeStart))
    }

    fn inverter_emergency(&self, inputs: &Inputs, derived: &DerivedValues) -> Option<Decision> {
        if self.state.evse_step_index == 0 {
            return None;
        }
        if !derived.inverter_over_limit {
            return None;
        }
        if self.state.evse_step_index == 1 {
            Some(self.set_step(inputs, 0, Reason::InverterDrop))
        } else {
            Some(self.set_step(inputs, self.state.evse_step_index - 1, Reason::InverterStepDown))
        }
    }

    fn is_conservative_mode(&self, batt_soc: Option<f64>) -> bool {
        batt_soc.is_some_and(|soc| soc < self.config.soc_conservative_below)
    }

    fn main_ready(&self, inputs: &Inputs, derived: &DerivedValues) -> Option<Decision> {
        if self.state.evse_step_index == 0 {
            return None;
        }
        let conservative = self.is_conservative_mode(inputs.batt_soc_percent);

        if conservative && derived.excess_w.is_none() {
            if let Some(batt_power) = inputs.batt_power_w {
                if batt_power > self.config.conservative_discharge_threshold_w {
                    let next = self.state.evse_step_index.saturating_sub(1);
                    return Some(self.set_step(inputs, next, Reason::MainConservativeBattDischarge));
                }
            }
            return None;
        }

        let Some(excess_w) = derived.excess_w else {
            return None;
        };

        if self.state.evse_step_index < self.steps.max_index() {
            let required = self.steps.step_up_power(self.state.evse_step_index, self.config.line_voltage_v);
            if derived.effect_ready && excess_w >= required && self.inverter_safe(inputs, self.state.evse_step_index) {
                return Some(self.set_step(inputs, self.state.evse_step_index + 1, Reason::MainStepUp));
            }
        }

        if conservative {
            if excess_w >= self.config.conservative_charge_target_w {
                return None;
            }
            let next = self.state.evse_step_index.saturating_sub(1);
            Some(self.set_step(inputs, next, Reason::MainConservativeStepDown))
        } else {
            if excess_w >= -self.config.small_discharge_margin_w {
                return None;
            }
            let next = self.state.evse_step_index.saturating_sub(1);
            Some(self.set_step(inputs, next, Reason::MainStepDown))
        }
    }

    fn probe_ready(&self, inputs: &Inputs, derived: &DerivedValues) -> Option<Decision> {
        if self.state.evse_step_index == 0 {
            return None;
        }
        let batt_power = inputs.batt_power_w?;
        if batt_power <= 0.0 {
            if self.state.evse_step_index < self.steps.max_index()
                && derived.effect_ready
                && self.inverter_safe(inputs, self.state.evse_step_index)
            {
                return Some(self.set_step(inputs, self.state.evse_step_index + 1, Reason::ProbeStepUp));
            }
            return None;
        }
        if batt_power <= self.config.probe_max_discharge_w {
            return None;
        }
        let next = self.state.evse_step_index.saturating_sub(1);
        Some(self.set_step(inputs, next, Reason::ProbeStepDown))
    }

    fn inverter_safe(&self, inputs: &Inputs, index: usize) -> bool {
        let Some(inverter_power_w) = inputs.inverter_power_w else {
            return true;
        };
        let projected = inverter_power_w + self.steps.step_up_power(index, self.config.line_voltage_v);
        projected <= self.config.safe_inverter_max_w()
    }

    fn set_step(&self, inputs: &Inputs, new_index: usize, reason: Reason) -> Decision {
        let new_index = new_index.min(self.steps.max_index());
        let old_index = self.state.evse_step_index;

        let target_mode = if new_index == 0 {
            ModeState::Off
        } else {
            match self.region_for_soc(inputs.batt_soc_percent) {
                Region::Main => ModeState::MainCooldown,
                Region::Probe => ModeState::ProbeCooldown,
            }
        };

        let pending_effect_ts_s = if new_index > old_index {
            Some(inputs.now_s)
        } else if new_index < old_index || new_index == 0 {
            None
        } else {
            self.state.pending_effect_ts_s
        };

        let new_state = ControllerState {
            mode_state: target_mode,
            evse_step_index: new_index,
            last_change_ts_s: inputs.now_s,
            waiting_since_ts_s: self.state.waiting_since_ts_s,
            pending_effect_ts_s,
        };

        let switch_command = Some(new_index > 0);
        let current_command_amps = (new_index > 0).then(|| self.steps.amps(new_index));

        let mut metadata = BTreeMap::new();
        metadata.insert("index".to_string(), new_index as f64);
        if let Some(amps) = current_command_amps {
            metadata.insert("target_amps".to_string(), amps as f64);
        }

        Decision {
            new_state,
            switch_command,
            current_command_amps,
            reason,
            metadata,
        }
    }
}
