// src/fsm/states.rs
//
// Utility modes: Passive (damping only) and FixStand (interpolate to a pose).

use crate::config::{FixStandConfig, PassiveConfig};
use crate::robot::MotorCmd;

use super::{ControlContext, Mode, State};

/// Zero stiffness, configurable damping. The safe fallback mode.
pub struct PassiveState {
    mode: Mode,
    kd: f32,
}

impl PassiveState {
    pub fn new(mode: Mode, cfg: &PassiveConfig) -> Self {
        Self { mode, kd: cfg.kd }
    }
}

impl State for PassiveState {
    fn mode(&self) -> Mode {
        self.mode
    }

    fn name(&self) -> &str {
        "Passive"
    }

    fn enter(&mut self, ctx: &mut ControlContext) {
        for m in ctx.cmd.motors.iter_mut() {
            *m = MotorCmd {
                kd: self.kd,
                ..MotorCmd::default()
            };
        }
    }

    fn run(&mut self, ctx: &mut ControlContext) {
        let ControlContext { cmd, state, .. } = ctx;
        for (c, s) in cmd.motors.iter_mut().zip(&state.motors) {
            c.q = s.q;
            c.dq = 0.0;
            c.kp = 0.0;
            c.kd = self.kd;
            c.tau = 0.0;
        }
    }
}

/// Linear interpolation from the pose at entry to a fixed target pose.
pub struct FixStandState {
    mode: Mode,
    cfg: FixStandConfig,
    start_pose: Vec<f32>,
    start_tick: u64,
}

impl FixStandState {
    pub fn new(mode: Mode, cfg: &FixStandConfig) -> Self {
        Self {
            mode,
            cfg: cfg.clone(),
            start_pose: Vec::new(),
            start_tick: 0,
        }
    }

    /// Interpolation progress in [0, 1].
    pub fn progress(&self, ctx: &ControlContext) -> f64 {
        let elapsed = ctx.tick.saturating_sub(self.start_tick) as f64 * ctx.control_dt;
        (elapsed / self.cfg.duration).clamp(0.0, 1.0)
    }
}

impl State for FixStandState {
    fn mode(&self) -> Mode {
        self.mode
    }

    fn name(&self) -> &str {
        "FixStand"
    }

    fn enter(&mut self, ctx: &mut ControlContext) {
        self.start_pose = ctx.state.motors.iter().map(|m| m.q).collect();
        self.start_tick = ctx.tick;
        for m in ctx.cmd.motors.iter_mut() {
            m.kp = self.cfg.kp;
            m.kd = self.cfg.kd;
            m.dq = 0.0;
            m.tau = 0.0;
        }
    }

    fn run(&mut self, ctx: &mut ControlContext) {
        let ratio = self.progress(ctx) as f32;
        for (i, c) in ctx.cmd.motors.iter_mut().enumerate() {
            let q0 = self.start_pose.get(i).copied().unwrap_or(0.0);
            let q1 = self.cfg.target.get(i).copied().unwrap_or(q0);
            c.q = q0 + (q1 - q0) * ratio;
            c.kp = self.cfg.kp;
            c.kd = self.cfg.kd;
        }
    }
}
