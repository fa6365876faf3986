//! gaitctl core library.
//!
//! This crate exposes the mode state machine, the policy-backed states with
//! their background inference loops, the RL environment (observation pipeline,
//! action processing, reference motion) and the robot channel seam. The binary
//! (`src/main.rs`) is a thin harness that loads a controller config and drives
//! the state machine against a simulated robot.

pub mod config;
pub mod controller;
pub mod fsm;
pub mod rl;
pub mod robot;
pub mod scheduler;
pub mod sync;
pub mod telemetry;

// --- Re-exports for ergonomic external use ---------------------------------

pub use config::{ConfigError, ControllerConfig, DeployConfig};

pub use controller::{build_state_machine, BuildError};

pub use fsm::{
    ControlContext, ControlLoop, FsmError, Mode, ModeRegistry, State, StateMachine, TickSnapshot, Transition,
    TransitionRule,
};

pub use rl::{EnvContext, EnvError, MotionLoader, ObservationManager, ObservationRegistry, RlEnv};

pub use robot::{Button, Gamepad, LowCmd, LowState, RobotChannel, SimRobot};

pub use scheduler::DeadlineSchedule;

pub use sync::LatestCell;

pub use telemetry::{DataLogger, TelemetryWriter};
