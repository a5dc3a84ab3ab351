pub mod state_machine;
pub mod step_table;

pub use state_machine::{
    ControllerConfig, ControllerState, Decision, DerivedValues, Inputs, ModeState, Reason, Region,
    StateMachine,
};
pub use step_table::{StepTable, StepTableError, DEFAULT_STEPS_AMPS};
