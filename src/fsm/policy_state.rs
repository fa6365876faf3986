// src/fsm/policy_state.rs
//
// Mode backed by a learned policy.
//
// On `enter` the environment is moved into a dedicated thread that calls
// `reset` once and then `step` every `step_dt` on an absolute-deadline
// schedule. The control thread never waits on inference: `run` only copies
// the latest processed action out of a `LatestCell` into the command buffer.
// On `exit` the stop flag is raised and the thread hands the environment back
// through its join handle. A panic on the policy thread raises the fault flag
// while unwinding. Telemetry rows are queued to a writer thread; the control
// thread does no file I/O.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::{Local, Utc};
use parking_lot::Mutex;

use crate::config::{Chord, FixedCommandConfig};
use crate::rl::command::FixedCommand;
use crate::rl::env::RlEnv;
use crate::rl::inference::TensorMap;
use crate::scheduler::{DeadlineSchedule, Pace};
use crate::sync::LatestCell;
use crate::telemetry::{Row, TelemetryWriter};

use super::{ControlContext, Mode, State};

/// Foot force above which a foot counts as in contact.
const CONTACT_THRESHOLD: f32 = 10.0;

/// Inference outputs copied into telemetry when present.
const LOGGED_OUTPUTS: [(&str, &str); 2] = [("weights", "weight"), ("latent", "latent")];

/// Periodic CSV rows while the policy runs.
pub struct PolicyTelemetry {
    writer: TelemetryWriter,
    period: Duration,
    started: Option<Instant>,
    last_row: Option<Instant>,
}

impl PolicyTelemetry {
    pub fn new(writer: TelemetryWriter, period_s: f64) -> Self {
        Self {
            writer,
            period: Duration::from_secs_f64(period_s.max(0.0)),
            started: None,
            last_row: None,
        }
    }

    fn due(&self, now: Instant) -> bool {
        self.last_row
            .map_or(true, |last| now.saturating_duration_since(last) >= self.period)
    }
}

/// Channels shared with the running policy thread.
struct Worker {
    handle: JoinHandle<RlEnv>,
    stop: Arc<AtomicBool>,
}

pub struct PolicyState {
    mode: Mode,
    name: String,
    env: Option<RlEnv>,
    worker: Option<Worker>,
    fault: Arc<AtomicBool>,
    actions: Option<Arc<LatestCell<Vec<f32>>>>,
    inference: Option<Arc<LatestCell<TensorMap>>>,
    joint_ids_map: Vec<usize>,
    stiffness: Vec<f32>,
    damping: Vec<f32>,
    fixed_command: Option<(Arc<Mutex<FixedCommand>>, Chord)>,
    telemetry: Option<PolicyTelemetry>,
}

impl PolicyState {
    /// A state without an environment; `enter` only warns.
    pub fn inert(mode: Mode, name: &str) -> Self {
        Self {
            mode,
            name: name.to_string(),
            env: None,
            worker: None,
            fault: Arc::new(AtomicBool::new(false)),
            actions: None,
            inference: None,
            joint_ids_map: Vec::new(),
            stiffness: Vec::new(),
            damping: Vec::new(),
            fixed_command: None,
            telemetry: None,
        }
    }

    pub fn new(mode: Mode, name: &str, env: RlEnv) -> Self {
        let data = env.robot_data();
        let mut state = Self::inert(mode, name);
        state.joint_ids_map = data.joint_ids_map.clone();
        state.stiffness = data.joint_stiffness.clone();
        state.damping = data.joint_damping.clone();
        state.actions = Some(env.action_cell());
        state.inference = Some(env.inference_cell());
        state.env = Some(env);
        state
    }

    /// Allow the fixed velocity command to be toggled with `cfg.chord`.
    pub fn with_fixed_command(mut self, cfg: &FixedCommandConfig) -> Self {
        if !cfg.enabled {
            return self;
        }
        if let Some(env) = &self.env {
            let shared = Arc::clone(&env.ctx().fixed_command);
            *shared.lock() = FixedCommand::from_config(cfg);
            log::info!(
                "[{}] fixed command enabled: lin_vel_x={:.2}, lin_vel_y={:.2}, ang_vel_z={:.2}, duration={:.1}s",
                self.name,
                cfg.lin_vel_x,
                cfg.lin_vel_y,
                cfg.ang_vel_z,
                cfg.duration
            );
            self.fixed_command = Some((shared, cfg.chord));
        }
        self
    }

    pub fn with_telemetry(mut self, telemetry: PolicyTelemetry) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    pub fn is_inert(&self) -> bool {
        self.env.is_none() && self.worker.is_none()
    }

    pub fn is_running(&self) -> bool {
        self.worker.is_some()
    }

    /// Shared fault flag, raised when a policy step fails.
    pub fn fault_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.fault)
    }

    /// Most recent processed action, if any.
    pub fn latest_action(&self) -> Option<Arc<Vec<f32>>> {
        self.actions.as_ref().and_then(|c| c.latest())
    }

    pub fn fixed_command_active(&self) -> bool {
        self.fixed_command
            .as_ref()
            .map_or(false, |(cmd, _)| cmd.lock().is_active())
    }

    fn spawn(&mut self, env: RlEnv) -> Option<Worker> {
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop);
        let fault = Arc::clone(&self.fault);
        let label = self.name.clone();
        let spawned = thread::Builder::new()
            .name(format!("policy-{}", self.name))
            .spawn(move || policy_loop(env, &label, &thread_stop, &fault));
        match spawned {
            Ok(handle) => Some(Worker { handle, stop }),
            Err(e) => {
                log::error!("[{}] failed to spawn policy thread: {e}; state is now inert", self.name);
                self.fault.store(true, Ordering::Release);
                None
            }
        }
    }

    fn stop_worker(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };
        worker.stop.store(true, Ordering::Release);
        match worker.handle.join() {
            Ok(env) => self.env = Some(env),
            Err(_) => {
                log::error!("[{}] policy thread panicked; state is now inert", self.name);
                self.fault.store(true, Ordering::Release);
            }
        }
    }

    fn update_fixed_command(&mut self, ctx: &ControlContext) {
        let Some((cmd, chord)) = &self.fixed_command else {
            return;
        };
        let now = Instant::now();
        let mut cmd = cmd.lock();
        if ctx.gamepad.chord(chord.held, chord.trigger) {
            if cmd.toggle(now) {
                let [x, y, yaw] = cmd.values();
                log::info!(
                    "[{}] fixed command ACTIVATED: lin_vel_x={x:.2}, lin_vel_y={y:.2}, ang_vel_z={yaw:.2}",
                    self.name
                );
            } else {
                log::info!("[{}] fixed command DEACTIVATED, returning to joystick control", self.name);
            }
        }
        if cmd.expire(now) {
            log::info!("[{}] fixed command COMPLETED, returning to joystick control", self.name);
        }
    }

    fn write_telemetry(&mut self, ctx: &ControlContext, action: &[f32]) {
        let Some(t) = self.telemetry.as_mut() else {
            return;
        };
        // Rows start with the first inference so the header carries its outputs.
        let Some(outputs) = self.inference.as_ref().and_then(|c| c.latest()) else {
            return;
        };
        let now = Instant::now();
        if !t.due(now) {
            return;
        }
        let started = *t.started.get_or_insert(now);
        t.last_row = Some(now);

        let mut row = Row::with_capacity(20);
        row.scalar("time", now.duration_since(started).as_secs_f64());
        let wall = Utc::now();
        row.text("unix_time", format!("{:.2}", wall.timestamp_millis() as f64 / 1000.0));
        let local = wall.with_timezone(&Local);
        row.text(
            "wall_time",
            format!("{}.{:02}", local.format("%H:%M:%S"), local.timestamp_subsec_millis() / 10),
        );
        row.vector("q_des", action);

        let motors = &ctx.state.motors;
        row.vector("q", motors.iter().map(|m| m.q).collect::<Vec<_>>());
        row.vector("dq", motors.iter().map(|m| m.dq).collect::<Vec<_>>());
        row.vector("tau", motors.iter().map(|m| m.tau_est).collect::<Vec<_>>());
        row.vector("temp", motors.iter().map(|m| m.temperature).collect::<Vec<_>>());

        let imu = &ctx.state.imu;
        row.vector("imu_rpy", imu.rpy);
        row.vector("imu_acc", imu.accelerometer);
        row.vector("ang_vel", imu.gyroscope);
        row.vector("foot_force", ctx.state.foot_force);
        let contacts = ctx
            .state
            .foot_force
            .map(|f| if f > CONTACT_THRESHOLD { 1.0_f32 } else { 0.0 });
        row.vector("foot_contact", contacts);

        for (output, column) in LOGGED_OUTPUTS {
            if let Some(v) = outputs.get(output) {
                row.vector(column, v.as_slice());
            }
        }

        let js = &ctx.state.joystick;
        row.scalar("cmd_ns_0", js.ly as f64);
        row.scalar("cmd_ns_1", -js.lx as f64);
        row.scalar("cmd_ns_2", -js.rx as f64);

        if !t.writer.send(row) {
            log::warn!("[{}] telemetry writer has stopped; logging disabled", self.name);
            self.telemetry = None;
        }
    }
}

impl State for PolicyState {
    fn mode(&self) -> Mode {
        self.mode
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn enter(&mut self, ctx: &mut ControlContext) {
        let Some(mut env) = self.env.take() else {
            log::warn!("[{}] no policy environment; skipping initialization", self.name);
            return;
        };

        for (i, &motor) in self.joint_ids_map.iter().enumerate() {
            if let Some(m) = ctx.cmd.motors.get_mut(motor) {
                m.kp = self.stiffness[i];
                m.kd = self.damping[i];
                m.dq = 0.0;
                m.tau = 0.0;
            }
        }
        ctx.refresh();
        // Targets from the previous episode must not reach the new gains.
        env.reset_actions();
        self.fault.store(false, Ordering::Release);
        if let Some((cmd, _)) = &self.fixed_command {
            cmd.lock().deactivate();
        }
        if let Some(t) = self.telemetry.as_mut() {
            t.started = None;
            t.last_row = None;
        }

        self.worker = self.spawn(env);
        if self.worker.is_some() {
            log::info!("[{}] policy thread started", self.name);
        }
    }

    fn run(&mut self, ctx: &mut ControlContext) {
        self.update_fixed_command(ctx);

        let Some(action) = self.latest_action() else {
            return;
        };
        for (i, &motor) in self.joint_ids_map.iter().enumerate() {
            if let (Some(m), Some(&q)) = (ctx.cmd.motors.get_mut(motor), action.get(i)) {
                m.q = q;
            }
        }
        self.write_telemetry(ctx, &action);
    }

    fn exit(&mut self, _ctx: &mut ControlContext) {
        if self.worker.is_some() {
            self.stop_worker();
            log::info!("[{}] policy thread stopped", self.name);
        }
        if let Some(actions) = &self.actions {
            actions.clear();
        }
        if let Some(inference) = &self.inference {
            inference.clear();
        }
        if let Some((cmd, _)) = &self.fixed_command {
            cmd.lock().deactivate();
        }
    }

    fn faulted(&self) -> bool {
        self.fault.load(Ordering::Acquire)
    }
}

impl Drop for PolicyState {
    fn drop(&mut self) {
        self.stop_worker();
    }
}

/// Raises the fault flag if the policy thread unwinds.
struct FaultOnPanic<'a> {
    name: &'a str,
    fault: &'a AtomicBool,
}

impl Drop for FaultOnPanic<'_> {
    fn drop(&mut self) {
        if thread::panicking() {
            log::error!("[{}] policy thread panicked", self.name);
            self.fault.store(true, Ordering::Release);
        }
    }
}

/// Body of the policy thread. Returns the environment to the state on exit.
fn policy_loop(mut env: RlEnv, name: &str, stop: &AtomicBool, fault: &AtomicBool) -> RlEnv {
    let _guard = FaultOnPanic { name, fault };
    let mut schedule = DeadlineSchedule::from_secs_f64(Instant::now(), env.step_dt());
    if let Err(e) = env.reset() {
        log::error!("[{name}] policy reset failed: {e}");
        fault.store(true, Ordering::Release);
        return env;
    }

    while !stop.load(Ordering::Acquire) {
        if let Err(e) = env.step() {
            log::error!("[{name}] policy step {} failed: {e}", env.episode_length());
            fault.store(true, Ordering::Release);
            break;
        }
        if let Pace::Late(by) = schedule.wait() {
            if schedule.should_report_overrun() {
                log::warn!(
                    "[{name}] policy step overran its deadline by {:?} ({} overruns)",
                    by,
                    schedule.overruns()
                );
            }
        }
    }
    log::debug!("[{name}] policy thread exiting after {} steps", env.episode_length());
    env
}
