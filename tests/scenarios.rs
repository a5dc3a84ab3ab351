//! The eight literal end-to-end scenarios from spec.md §8, as parameterized
//! `rstest` cases so each scenario's expected step index and switch command
//! are visible side by side rather than scattered across separate `#[test]`
//! functions.

use rstest::rstest;

use solar_evse_controller::domain::{
    ControllerConfig, ControllerState, Inputs, ModeState, StateMachine, StepTable,
};

fn base_inputs(now_s: f64) -> Inputs {
    Inputs {
        batt_soc_percent: Some(60.0),
        batt_power_w: Some(-500.0),
        inverter_power_w: Some(2000.0),
        pv_power_w: Some(6000.0),
        charger_status: "charging".to_string(),
        charger_switch_on: true,
        charger_current_a: None,
        auto_enabled: true,
        now_s,
    }
}

#[rstest]
// Scenario 1: cold start with headroom -> main_start at 6A.
#[case(60.0, -500.0, 2000.0, 6000.0, "charging", 1, Some(6))]
// Scenario 5: inverter at the safe ceiling blocks a cold start entirely.
#[case(60.0, -500.0, 7000.0, 7000.0, "charging", 0, None)]
fn cold_start_scenarios(
    #[case] soc: f64,
    #[case] batt_power: f64,
    #[case] inverter: f64,
    #[case] pv: f64,
    #[case] status: &str,
    #[case] expected_index: usize,
    #[case] expected_amps: Option<u32>,
) {
    let mut machine = StateMachine::new(ControllerConfig::default(), StepTable::default_table());
    let mut inputs = base_inputs(200.0);
    inputs.batt_soc_percent = Some(soc);
    inputs.batt_power_w = Some(batt_power);
    inputs.inverter_power_w = Some(inverter);
    inputs.pv_power_w = Some(pv);
    inputs.charger_status = status.to_string();

    let (decision, _) = machine.tick(&inputs);
    assert_eq!(machine.state().evse_step_index, expected_index);
    assert_eq!(decision.and_then(|d| d.current_command_amps), expected_amps);
}

// Scenario 2+3+4: cooldown, then latency, then a step-up once both windows
// have elapsed.
#[rstest]
fn cooldown_then_latency_then_step_up() {
    let mut machine = StateMachine::new(ControllerConfig::default(), StepTable::default_table());
    let (decision, _) = machine.tick(&base_inputs(100.0));
    assert_eq!(decision.unwrap().current_command_amps, Some(6));

    let (decision, _) = machine.tick(&base_inputs(102.0));
    assert!(decision.is_none(), "cooldown should block a second step at t=102");
    assert_eq!(machine.state().evse_step_index, 1);

    let mut heavy_surplus = base_inputs(110.0);
    heavy_surplus.pv_power_w = Some(8000.0);
    heavy_surplus.inverter_power_w = Some(2500.0);
    let (decision, _) = machine.tick(&heavy_surplus);
    assert!(decision.is_none(), "sensor-latency window should still be active at t=110");
    assert_eq!(machine.state().evse_step_index, 1);

    let mut still_heavy = base_inputs(130.0);
    still_heavy.pv_power_w = Some(8000.0);
    still_heavy.inverter_power_w = Some(2500.0);
    let (decision, _) = machine.tick(&still_heavy);
    let decision = decision.expect("both windows elapsed, step-up should fire");
    assert_eq!(decision.current_command_amps, Some(8));
    assert_eq!(machine.state().evse_step_index, 2);
}

// Scenario 6: a vehicle stuck in "waiting" past the timeout is forced off.
#[rstest]
fn waiting_timeout_forces_off() {
    let mut machine = StateMachine::with_state(
        ControllerConfig::default(),
        StepTable::default_table(),
        ControllerState {
            mode_state: ModeState::MainReady,
            evse_step_index: 3,
            last_change_ts_s: 900.0,
            waiting_since_ts_s: Some(1000.0),
            pending_effect_ts_s: None,
        },
    );
    let mut inputs = base_inputs(1065.0);
    inputs.charger_status = "waiting".to_string();

    let (decision, _) = machine.tick(&inputs);
    let decision = decision.expect("waiting timeout should force off");
    assert_eq!(decision.switch_command, Some(false));
    assert_eq!(machine.state().evse_step_index, 0);
}

// Scenario 7: an externally-set commanded current is adopted verbatim.
#[rstest]
#[case(16.0, 5)]
fn external_change_resyncs(#[case] reported_amps: f64, #[case] expected_index: usize) {
    let mut machine = StateMachine::with_state(
        ControllerConfig::default(),
        StepTable::default_table(),
        ControllerState {
            mode_state: ModeState::MainReady,
            evse_step_index: 2,
            last_change_ts_s: 0.0,
            waiting_since_ts_s: None,
            pending_effect_ts_s: None,
        },
    );
    let mut inputs = base_inputs(500.0);
    inputs.charger_current_a = Some(reported_amps);

    machine.tick(&inputs);
    assert_eq!(machine.state().evse_step_index, expected_index);
    assert_eq!(machine.state().last_change_ts_s, 500.0);
    assert_eq!(machine.state().pending_effect_ts_s, None);
}

// Scenario 8: in PROBE region, a battery that is charging (not discharging)
// is read as headroom and the FSM steps up.
#[rstest]
fn probe_step_up_on_battery_not_discharging() {
    let mut machine = StateMachine::with_state(
        ControllerConfig::default(),
        StepTable::default_table(),
        ControllerState {
            mode_state: ModeState::ProbeReady,
            evse_step_index: 2,
            last_change_ts_s: 0.0,
            waiting_since_ts_s: None,
            pending_effect_ts_s: None,
        },
    );
    let mut inputs = base_inputs(100.0);
    inputs.batt_soc_percent = Some(96.0);
    inputs.batt_power_w = Some(-100.0);
    inputs.pv_power_w = Some(0.0);
    inputs.inverter_power_w = Some(3000.0);

    let (decision, _) = machine.tick(&inputs);
    let decision = decision.expect("probe step-up should fire");
    assert_eq!(decision.current_command_amps, Some(10));
    assert_eq!(machine.state().evse_step_index, 3);
}
