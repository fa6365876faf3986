// src/controller.rs
//
// Composition: build the state machine described by a `ControllerConfig`.
//
// Mode layout:
//   Passive  --(fix_stand.chord)-->  FixStand
//   FixStand --(policy chord)------> any configured policy
//   policy   --(policy chord)------> any other configured policy
//   every mode: stop chord / timeout / fault / tilt --> Passive

use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;

use crate::config::{ControllerConfig, FIX_STAND_MODE, PASSIVE_MODE};
use crate::fsm::policy_state::PolicyTelemetry;
use crate::fsm::{
    safety_rules, ControlContext, FixStandState, FsmError, Mode, PassiveState, PolicyState, StateMachine,
    TransitionRule,
};
use crate::rl::command::FixedCommand;
use crate::rl::env::{EnvError, RlEnv};
use crate::rl::observation::ObservationRegistry;
use crate::robot::RobotChannel;
use crate::telemetry::{DataLogger, TelemetryError, TelemetryWriter};

#[derive(Debug, Error)]
pub enum BuildError {
    #[error(transparent)]
    Fsm(#[from] FsmError),
    #[error("config declares {config} motors but the robot channel has {channel}")]
    MotorCount { config: usize, channel: usize },
    #[error("policy '{name}': {source}")]
    Policy {
        name: String,
        #[source]
        source: EnvError,
    },
    #[error("policy '{name}': joint_ids_map refers to motor {motor}, robot has {num_motors}")]
    JointMap {
        name: String,
        motor: usize,
        num_motors: usize,
    },
    #[error("policy '{name}': cannot open telemetry: {source}")]
    Telemetry {
        name: String,
        #[source]
        source: TelemetryError,
    },
}

pub fn passive_mode() -> Mode {
    Mode(PASSIVE_MODE)
}

pub fn fix_stand_mode() -> Mode {
    Mode(FIX_STAND_MODE)
}

/// Build with the built-in observation terms.
pub fn build_state_machine(
    cfg: &ControllerConfig,
    channel: Arc<dyn RobotChannel>,
) -> Result<StateMachine, BuildError> {
    build_state_machine_with(cfg, channel, &ObservationRegistry::with_builtin_terms())
}

pub fn build_state_machine_with(
    cfg: &ControllerConfig,
    channel: Arc<dyn RobotChannel>,
    registry: &ObservationRegistry,
) -> Result<StateMachine, BuildError> {
    if channel.num_motors() != cfg.num_motors {
        return Err(BuildError::MotorCount {
            config: cfg.num_motors,
            channel: channel.num_motors(),
        });
    }

    let passive = passive_mode();
    let stand = fix_stand_mode();
    let ctx = ControlContext::new(Arc::clone(&channel), cfg.control_dt);
    let mut machine = StateMachine::new(Box::new(PassiveState::new(passive, &cfg.passive)), ctx)?;
    machine.register_state(Box::new(FixStandState::new(stand, &cfg.fix_stand)))?;
    machine.add_transition(passive, TransitionRule::on_chord("fix stand", stand, cfg.fix_stand.chord))?;

    let mut selectable = Vec::new();
    for p in &cfg.policies {
        let mode = Mode(p.mode);
        let state = match &p.policy_dir {
            None => {
                log::warn!("[controller] policy '{}' has no policy_dir; state is inert", p.name);
                PolicyState::inert(mode, &p.name)
            }
            Some(dir) => {
                let dir = cfg.resolve(dir);
                let fixed = Arc::new(Mutex::new(FixedCommand::new([0.0; 3], 0.0)));
                let env = RlEnv::from_policy_dir(&dir, Arc::clone(&channel), registry, fixed).map_err(|e| {
                    BuildError::Policy {
                        name: p.name.clone(),
                        source: e,
                    }
                })?;
                if let Some(&motor) = env
                    .robot_data()
                    .joint_ids_map
                    .iter()
                    .find(|&&m| m >= cfg.num_motors)
                {
                    return Err(BuildError::JointMap {
                        name: p.name.clone(),
                        motor,
                        num_motors: cfg.num_motors,
                    });
                }
                log::info!(
                    "[controller] policy '{}' loaded from {} (obs width {}, step_dt {}s)",
                    p.name,
                    dir.display(),
                    env.observation_width(),
                    env.step_dt()
                );

                let mut state = PolicyState::new(mode, &p.name, env).with_fixed_command(&p.fixed_command);
                if p.logging {
                    let log_dir = match &cfg.log_dir {
                        Some(d) => cfg.resolve(d),
                        None => dir.join("logs"),
                    };
                    let telemetry_err = |e| BuildError::Telemetry {
                        name: p.name.clone(),
                        source: e,
                    };
                    let (logger, path) = DataLogger::create_in(&log_dir).map_err(telemetry_err)?;
                    let writer = TelemetryWriter::spawn(&p.name, logger).map_err(telemetry_err)?;
                    log::info!("[controller] logging enabled for '{}'; saving to {}", p.name, path.display());
                    state = state.with_telemetry(PolicyTelemetry::new(writer, p.logging_dt));
                }
                selectable.push((p.name.clone(), mode, p.chord));
                state
            }
        };
        machine.register_state(Box::new(state))?;
    }

    for (name, mode, chord) in &selectable {
        machine.add_transition(stand, TransitionRule::on_chord(name, *mode, *chord))?;
        for (from_name, from, _) in &selectable {
            if from != mode {
                let label = format!("{from_name} -> {name}");
                machine.add_transition(*from, TransitionRule::on_chord(&label, *mode, *chord))?;
            }
        }
    }

    for rule in safety_rules(passive, &cfg.safety) {
        machine.add_safety_rule(rule);
    }

    log::info!(
        "[controller] {} states registered; {:?}+{:?} enters FixStand",
        machine.state_count(),
        cfg.fix_stand.chord.held,
        cfg.fix_stand.chord.trigger
    );
    Ok(machine)
}
