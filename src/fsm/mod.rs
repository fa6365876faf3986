// src/fsm/mod.rs
//
// Mode state machine driving the robot at the control rate.
//
// Each tick the active state runs its `pre_run`, `run` and `post_run` hooks,
// then transition rules are evaluated: engine-wide safety rules first, then
// the active state's own rules, both in registration order. The first rule
// whose predicate holds and whose target is a different, known mode wins.

pub mod policy_state;
pub mod states;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use thiserror::Error;

use crate::config::{Chord, SafetyConfig};
use crate::robot::{Gamepad, LowCmd, LowState, RobotChannel};
use crate::scheduler::{DeadlineSchedule, Pace};

pub use policy_state::{PolicyState, PolicyTelemetry};
pub use states::{FixStandState, PassiveState};

/// Operating mode id. `Mode::NONE` means "no transition".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Mode(pub u32);

impl Mode {
    pub const NONE: Mode = Mode(0);

    pub fn is_none(self) -> bool {
        self == Mode::NONE
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum FsmError {
    #[error("mode {mode} is already registered as '{existing}'")]
    DuplicateMode { mode: Mode, existing: String },
    #[error("state name '{0}' is already registered")]
    DuplicateName(String),
    #[error("mode {0} is reserved")]
    ReservedMode(Mode),
    #[error("mode {0} is not registered")]
    UnknownMode(Mode),
}

/// Bijective mode id / name table.
#[derive(Debug, Clone, Default)]
pub struct ModeRegistry {
    by_mode: BTreeMap<Mode, String>,
    by_name: HashMap<String, Mode>,
}

impl ModeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, mode: Mode, name: &str) -> Result<(), FsmError> {
        if mode.is_none() {
            return Err(FsmError::ReservedMode(mode));
        }
        if let Some(existing) = self.by_mode.get(&mode) {
            return Err(FsmError::DuplicateMode {
                mode,
                existing: existing.clone(),
            });
        }
        if self.by_name.contains_key(name) {
            return Err(FsmError::DuplicateName(name.to_string()));
        }
        self.by_mode.insert(mode, name.to_string());
        self.by_name.insert(name.to_string(), mode);
        Ok(())
    }

    pub fn name(&self, mode: Mode) -> Option<&str> {
        self.by_mode.get(&mode).map(String::as_str)
    }

    pub fn mode(&self, name: &str) -> Option<Mode> {
        self.by_name.get(name).copied()
    }

    pub fn contains(&self, mode: Mode) -> bool {
        self.by_mode.contains_key(&mode)
    }

    pub fn len(&self) -> usize {
        self.by_mode.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_mode.is_empty()
    }
}

/// Shared per-tick IO: the latest sensor message, joystick edges and the
/// outgoing command buffer.
pub struct ControlContext {
    channel: Arc<dyn RobotChannel>,
    pub state: LowState,
    pub gamepad: Gamepad,
    pub cmd: LowCmd,
    pub timeout: bool,
    pub control_dt: f64,
    pub tick: u64,
}

impl ControlContext {
    pub fn new(channel: Arc<dyn RobotChannel>, control_dt: f64) -> Self {
        let n = channel.num_motors();
        let state = channel.latest_state();
        Self {
            channel,
            state,
            gamepad: Gamepad::default(),
            cmd: LowCmd::new(n),
            timeout: false,
            control_dt,
            tick: 0,
        }
    }

    pub fn channel(&self) -> &Arc<dyn RobotChannel> {
        &self.channel
    }

    pub fn num_motors(&self) -> usize {
        self.cmd.motors.len()
    }

    /// Pull the latest sensor message and fold its key mask into the gamepad.
    pub fn refresh(&mut self) {
        self.state = self.channel.latest_state();
        self.gamepad.update(self.state.joystick.keys);
        self.timeout = self.channel.is_timeout();
    }

    pub fn publish(&self) {
        self.channel.publish(&self.cmd);
    }

    /// Seconds since the engine started, by tick count.
    pub fn time(&self) -> f64 {
        self.tick as f64 * self.control_dt
    }
}

/// Read-only view handed to transition predicates.
#[derive(Debug, Clone, Copy)]
pub struct TickSnapshot<'a> {
    pub mode: Mode,
    pub tick: u64,
    pub state: &'a LowState,
    pub gamepad: &'a Gamepad,
    pub timeout: bool,
    /// The active state reported a fault.
    pub faulted: bool,
}

impl TickSnapshot<'_> {
    pub fn chord(&self, chord: &Chord) -> bool {
        self.gamepad.chord(chord.held, chord.trigger)
    }

    pub fn tilt(&self) -> f64 {
        self.state.imu.tilt()
    }
}

pub type Predicate = Box<dyn Fn(&TickSnapshot<'_>) -> bool + Send>;

pub struct TransitionRule {
    pub target: Mode,
    pub label: String,
    predicate: Predicate,
}

impl fmt::Debug for TransitionRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransitionRule")
            .field("target", &self.target)
            .field("label", &self.label)
            .finish()
    }
}

impl TransitionRule {
    pub fn new<F>(label: &str, target: Mode, predicate: F) -> Self
    where
        F: Fn(&TickSnapshot<'_>) -> bool + Send + 'static,
    {
        Self {
            target,
            label: label.to_string(),
            predicate: Box::new(predicate),
        }
    }

    /// Fires when `chord` is performed.
    pub fn on_chord(label: &str, target: Mode, chord: Chord) -> Self {
        Self::new(label, target, move |s| s.chord(&chord))
    }

    pub fn holds(&self, snapshot: &TickSnapshot<'_>) -> bool {
        (self.predicate)(snapshot)
    }
}

/// Rules applied in every mode: stop chord, link timeout, state fault and
/// excessive body tilt all fall back to `passive`.
pub fn safety_rules(passive: Mode, cfg: &SafetyConfig) -> Vec<TransitionRule> {
    let limit = cfg.orientation_limit;
    vec![
        TransitionRule::on_chord("stop chord", passive, cfg.stop_chord),
        TransitionRule::new("sensor timeout", passive, |s| s.timeout),
        TransitionRule::new("state fault", passive, |s| s.faulted),
        TransitionRule::new("bad orientation", passive, move |s| s.tilt() > limit),
    ]
}

/// One controller mode.
///
/// The default `pre_run` refreshes the context from the robot and the default
/// `post_run` publishes the command buffer.
pub trait State: Send {
    fn mode(&self) -> Mode;

    fn name(&self) -> &str;

    fn enter(&mut self, _ctx: &mut ControlContext) {}

    fn pre_run(&mut self, ctx: &mut ControlContext) {
        ctx.refresh();
    }

    fn run(&mut self, _ctx: &mut ControlContext) {}

    fn post_run(&mut self, ctx: &mut ControlContext) {
        ctx.publish();
    }

    fn exit(&mut self, _ctx: &mut ControlContext) {}

    /// A background failure that should force the safe mode.
    fn faulted(&self) -> bool {
        false
    }
}

/// A mode switch performed by `tick`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: Mode,
    pub to: Mode,
}

struct Slot {
    state: Box<dyn State>,
    rules: Vec<TransitionRule>,
}

pub struct StateMachine {
    registry: ModeRegistry,
    slots: Vec<Slot>,
    safety_rules: Vec<TransitionRule>,
    active: usize,
    ctx: ControlContext,
    warned_unknown: HashSet<Mode>,
}

impl StateMachine {
    /// The initial state becomes active and is entered immediately.
    pub fn new(initial: Box<dyn State>, ctx: ControlContext) -> Result<Self, FsmError> {
        let mut registry = ModeRegistry::new();
        registry.insert(initial.mode(), initial.name())?;
        let mut machine = Self {
            registry,
            slots: vec![Slot {
                state: initial,
                rules: Vec::new(),
            }],
            safety_rules: Vec::new(),
            active: 0,
            ctx,
            warned_unknown: HashSet::new(),
        };
        let Self { slots, ctx, .. } = &mut machine;
        let first = &mut slots[0].state;
        first.enter(ctx);
        log::info!("[fsm] start in {} ({})", first.name(), first.mode());
        Ok(machine)
    }

    /// Add a state. On error the machine is left unchanged.
    pub fn register_state(&mut self, state: Box<dyn State>) -> Result<(), FsmError> {
        self.registry.insert(state.mode(), state.name())?;
        log::debug!("[fsm] registered {} ({})", state.name(), state.mode());
        self.slots.push(Slot {
            state,
            rules: Vec::new(),
        });
        Ok(())
    }

    pub fn add_transition(&mut self, from: Mode, rule: TransitionRule) -> Result<(), FsmError> {
        let slot = self
            .slots
            .iter_mut()
            .find(|s| s.state.mode() == from)
            .ok_or(FsmError::UnknownMode(from))?;
        slot.rules.push(rule);
        Ok(())
    }

    /// Rule checked in every mode ahead of the state's own rules.
    pub fn add_safety_rule(&mut self, rule: TransitionRule) {
        self.safety_rules.push(rule);
    }

    pub fn active_mode(&self) -> Mode {
        self.slots[self.active].state.mode()
    }

    pub fn active_name(&self) -> &str {
        self.slots[self.active].state.name()
    }

    pub fn mode_name(&self, mode: Mode) -> Option<&str> {
        self.registry.name(mode)
    }

    pub fn registry(&self) -> &ModeRegistry {
        &self.registry
    }

    pub fn state_count(&self) -> usize {
        self.slots.len()
    }

    pub fn ctx(&self) -> &ControlContext {
        &self.ctx
    }

    pub fn ctx_mut(&mut self) -> &mut ControlContext {
        &mut self.ctx
    }

    /// One control period.
    pub fn tick(&mut self) -> Option<Transition> {
        let from = self.active_mode();
        {
            let Self { slots, ctx, active, .. } = self;
            let state = &mut slots[*active].state;
            state.pre_run(ctx);
            state.run(ctx);
            state.post_run(ctx);
        }

        let target = self.select_target();
        self.ctx.tick += 1;

        let to = target?;
        let idx = self.slots.iter().position(|s| s.state.mode() == to)?;
        let Self { slots, ctx, active, .. } = self;
        slots[*active].state.exit(ctx);
        log::info!(
            "[fsm] change state from {} to {}",
            slots[*active].state.name(),
            slots[idx].state.name()
        );
        *active = idx;
        slots[idx].state.enter(ctx);
        Some(Transition { from, to })
    }

    fn select_target(&mut self) -> Option<Mode> {
        let slot = &self.slots[self.active];
        let snapshot = TickSnapshot {
            mode: slot.state.mode(),
            tick: self.ctx.tick,
            state: &self.ctx.state,
            gamepad: &self.ctx.gamepad,
            timeout: self.ctx.timeout,
            faulted: slot.state.faulted(),
        };
        let fired = self
            .safety_rules
            .iter()
            .chain(slot.rules.iter())
            .find(|r| r.holds(&snapshot))?;

        let target = fired.target;
        if target.is_none() || target == snapshot.mode {
            return None;
        }
        if !self.registry.contains(target) {
            if self.warned_unknown.insert(target) {
                log::warn!(
                    "[fsm] rule '{}' targets unregistered mode {}; ignoring",
                    fired.label,
                    target
                );
            }
            return None;
        }
        log::debug!("[fsm] rule '{}' fired", fired.label);
        Some(target)
    }

    /// Run `ticks` periods back to back, without pacing.
    pub fn run_for(&mut self, ticks: u64) -> Vec<Transition> {
        (0..ticks).filter_map(|_| self.tick()).collect()
    }

    /// Exit the active state (joins any background work).
    pub fn shutdown(&mut self) {
        let Self { slots, ctx, active, .. } = self;
        slots[*active].state.exit(ctx);
        log::info!("[fsm] shut down in {}", slots[*active].state.name());
    }
}

/// Drives a `StateMachine` at `control_dt` on an absolute-deadline schedule.
pub struct ControlLoop {
    machine: StateMachine,
    period_s: f64,
    stop: Arc<AtomicBool>,
}

impl ControlLoop {
    pub fn new(machine: StateMachine, control_dt: f64) -> Self {
        Self {
            machine,
            period_s: control_dt,
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Setting the returned flag ends `run` after the current tick.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    pub fn machine(&self) -> &StateMachine {
        &self.machine
    }

    /// Tick until stopped or `max_ticks` is reached. `before_tick` sees the
    /// machine before every period.
    pub fn run<F>(&mut self, max_ticks: Option<u64>, mut before_tick: F) -> u64
    where
        F: FnMut(u64, &StateMachine),
    {
        let mut schedule = DeadlineSchedule::from_secs_f64(Instant::now(), self.period_s);
        let mut ticks = 0u64;
        while !self.stop.load(Ordering::Acquire) && max_ticks.map_or(true, |m| ticks < m) {
            before_tick(ticks, &self.machine);
            self.machine.tick();
            ticks += 1;
            if let Pace::Late(by) = schedule.wait() {
                if schedule.should_report_overrun() {
                    log::warn!(
                        "[fsm] control tick overran by {:?} ({} overruns)",
                        by,
                        schedule.overruns()
                    );
                }
            }
        }
        ticks
    }

    pub fn into_machine(self) -> StateMachine {
        self.machine
    }
}
