use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use gaitctl::config::{FixedCommandConfig, ObservationTermConfig, SafetyConfig};
use gaitctl::fsm::{
    safety_rules, ControlContext, Mode, PassiveState, PolicyState, PolicyTelemetry, State, StateMachine,
    TransitionRule,
};
use gaitctl::rl::inference::{InferenceBackend, InferenceError, LinearBackend, TensorMap};
use gaitctl::rl::{EnvContext, JointPositionAction, ObservationRegistry, RlEnv, TermParams};
use gaitctl::telemetry::{DataLogger, TelemetryWriter};
use gaitctl::robot::{Articulation, Button, RobotChannel, RobotData, SimRobot};

const STEP_DT: f64 = 0.002;

fn term(name: &str) -> Vec<(String, ObservationTermConfig)> {
    vec![(
        name.to_string(),
        ObservationTermConfig {
            history_length: 1,
            ..ObservationTermConfig::default()
        },
    )]
}

fn terms() -> Vec<(String, ObservationTermConfig)> {
    term("joint_pos")
}

/// Two policy joints mapped onto motors 3 and 1 of a 4-motor robot.
fn env_with(sim: &Arc<SimRobot>, backend: Box<dyn InferenceBackend>) -> RlEnv {
    env_with_terms(sim, backend, &ObservationRegistry::with_builtin_terms(), &terms())
}

fn env_with_terms(
    sim: &Arc<SimRobot>,
    backend: Box<dyn InferenceBackend>,
    registry: &ObservationRegistry,
    terms: &[(String, ObservationTermConfig)],
) -> RlEnv {
    let data = RobotData::new(vec![3, 1], vec![0.0, 0.0], vec![25.0, 30.0], vec![0.6, 0.7]);
    let action = JointPositionAction::new(vec![1.0, 1.0], vec![0.0, 0.0], None).unwrap();
    let channel: Arc<dyn RobotChannel> = sim.clone();
    let ctx = EnvContext::new(Articulation::new(channel, data), Box::new(action), STEP_DT);
    RlEnv::new(ctx, terms, registry, backend).unwrap()
}

fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    cond()
}

/// Succeeds `ok_steps` times, then fails.
struct FlakyBackend {
    ok_steps: usize,
    calls: Arc<AtomicUsize>,
}

impl InferenceBackend for FlakyBackend {
    fn forward(&mut self, _inputs: &TensorMap) -> Result<TensorMap, InferenceError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if n >= self.ok_steps {
            return Err(InferenceError::NonFinite("actions".to_string()));
        }
        let mut out = TensorMap::new();
        out.insert("actions".to_string(), vec![0.5, -0.5]);
        Ok(out)
    }
}

/// Returns `[k, k]` on the k-th call.
struct CountingBackend {
    calls: u32,
}

impl InferenceBackend for CountingBackend {
    fn forward(&mut self, _inputs: &TensorMap) -> Result<TensorMap, InferenceError> {
        self.calls += 1;
        let mut out = TensorMap::new();
        out.insert("actions".to_string(), vec![self.calls as f32; 2]);
        Ok(out)
    }
}

/// Byte sink that records which threads wrote to it.
#[derive(Clone, Default)]
struct RecordingSink {
    bytes: Arc<Mutex<Vec<u8>>>,
    writers: Arc<Mutex<Vec<ThreadId>>>,
}

impl Write for RecordingSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.writers.lock().push(thread::current().id());
        self.bytes.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[test]
fn enter_sets_gains_and_run_writes_mapped_targets() {
    let sim = Arc::new(SimRobot::new(4, 0.001, 0));
    let backend = LinearBackend::constant(2, &[("actions", vec![0.4, -0.2])]);
    let mut state = PolicyState::new(Mode(3), "walk", env_with(&sim, Box::new(backend)));
    let mut ctx = ControlContext::new(sim.clone(), 0.001);

    state.enter(&mut ctx);
    assert!(state.is_running());
    assert_eq!(ctx.cmd.motors[3].kp, 25.0);
    assert_eq!(ctx.cmd.motors[1].kd, 0.7);
    assert_eq!(ctx.cmd.motors[0].kp, 0.0, "unmapped motor untouched");

    assert!(wait_until(Duration::from_secs(2), || {
        state
            .latest_action()
            .map_or(false, |a| a[..] == [0.4, -0.2])
    }));
    state.run(&mut ctx);
    assert_eq!(ctx.cmd.motors[3].q, 0.4);
    assert_eq!(ctx.cmd.motors[1].q, -0.2);

    state.exit(&mut ctx);
    assert!(!state.is_running());
    assert!(!state.faulted());

    // The environment came back and can be started again.
    state.enter(&mut ctx);
    assert!(state.is_running());
    state.exit(&mut ctx);
}

#[test]
fn inert_state_enter_is_noop() {
    let sim = Arc::new(SimRobot::new(4, 0.001, 0));
    let mut ctx = ControlContext::new(sim.clone(), 0.001);
    let before = ctx.cmd.clone();
    let mut state = PolicyState::inert(Mode(4), "missing");
    state.enter(&mut ctx);
    state.run(&mut ctx);
    state.exit(&mut ctx);
    assert!(state.is_inert());
    assert!(!state.is_running());
    assert_eq!(ctx.cmd, before);
}

#[test]
fn step_failure_faults_and_forces_passive() {
    let sim = Arc::new(SimRobot::new(4, 0.001, 0));
    let calls = Arc::new(AtomicUsize::new(0));
    let backend = FlakyBackend {
        ok_steps: 3,
        calls: Arc::clone(&calls),
    };
    let policy = PolicyState::new(Mode(3), "flaky", env_with(&sim, Box::new(backend)));
    let fault = policy.fault_flag();

    let ctx = ControlContext::new(sim.clone(), 0.001);
    let passive = PassiveState::new(Mode(1), &Default::default());
    let mut machine = StateMachine::new(Box::new(passive), ctx).unwrap();
    machine.register_state(Box::new(policy)).unwrap();
    machine
        .add_transition(Mode(1), TransitionRule::new("start", Mode(3), |s| s.tick == 0))
        .unwrap();
    for rule in safety_rules(Mode(1), &SafetyConfig::default()) {
        machine.add_safety_rule(rule);
    }

    machine.tick();
    assert_eq!(machine.active_mode(), Mode(3));
    assert!(wait_until(Duration::from_secs(2), || fault.load(Ordering::SeqCst)));

    machine.tick();
    assert_eq!(machine.active_mode(), Mode(1));
    assert_eq!(calls.load(Ordering::SeqCst), 4, "thread stops at the first failure");
}

#[test]
fn fixed_command_toggles_on_chord() {
    let sim = Arc::new(SimRobot::new(4, 0.001, 0));
    let backend = LinearBackend::constant(2, &[("actions", vec![0.0, 0.0])]);
    let cfg = FixedCommandConfig {
        enabled: true,
        lin_vel_x: 0.8,
        duration: 0.0,
        ..FixedCommandConfig::default()
    };
    let mut state = PolicyState::new(Mode(3), "walk", env_with(&sim, Box::new(backend))).with_fixed_command(&cfg);
    let mut ctx = ControlContext::new(sim.clone(), 0.001);
    state.enter(&mut ctx);

    let tick = |keys: &[Button], state: &mut PolicyState, ctx: &mut ControlContext| {
        sim.press(keys);
        state.pre_run(ctx);
        state.run(ctx);
    };
    tick(&[Button::L2], &mut state, &mut ctx);
    assert!(!state.fixed_command_active());
    tick(&[Button::L2, Button::Y], &mut state, &mut ctx);
    assert!(state.fixed_command_active());
    tick(&[Button::L2, Button::Y], &mut state, &mut ctx);
    assert!(state.fixed_command_active(), "held Y is not a new press");
    tick(&[Button::L2], &mut state, &mut ctx);
    tick(&[Button::L2, Button::Y], &mut state, &mut ctx);
    assert!(!state.fixed_command_active());

    state.exit(&mut ctx);
}

#[test]
fn telemetry_is_written_off_the_control_thread() {
    let sim = Arc::new(SimRobot::new(4, 0.001, 0));
    let backend = LinearBackend::constant(2, &[("actions", vec![0.4, -0.2])]);
    let sink = RecordingSink::default();
    let writer = TelemetryWriter::spawn("walk", DataLogger::from_writer(sink.clone())).unwrap();
    let mut state = PolicyState::new(Mode(3), "walk", env_with(&sim, Box::new(backend)))
        .with_telemetry(PolicyTelemetry::new(writer, 0.0));
    let mut ctx = ControlContext::new(sim.clone(), 0.001);

    state.enter(&mut ctx);
    assert!(wait_until(Duration::from_secs(2), || {
        state
            .latest_action()
            .map_or(false, |a| a[..] == [0.4, -0.2])
    }));
    for _ in 0..5 {
        state.run(&mut ctx);
    }
    state.exit(&mut ctx);
    drop(state);

    let control = thread::current().id();
    let writers = sink.writers.lock();
    assert!(!writers.is_empty());
    assert!(writers.iter().all(|&id| id != control), "run wrote to disk");
    let text = String::from_utf8(sink.bytes.lock().clone()).unwrap();
    assert!(text.starts_with("time,unix_time,wall_time,q_des_0,q_des_1"), "{text}");
    assert!(text.lines().count() >= 2);
}

#[test]
fn panicking_term_faults_and_forces_passive() {
    let sim = Arc::new(SimRobot::new(4, 0.001, 0));
    let mut registry = ObservationRegistry::new();
    registry.register("fragile", |ctx: &EnvContext, _: &TermParams| {
        if ctx.episode_length == 3 {
            panic!("term evaluation failed");
        }
        vec![0.0; 2]
    });
    let backend = LinearBackend::constant(2, &[("actions", vec![0.0, 0.0])]);
    let env = env_with_terms(&sim, Box::new(backend), &registry, &term("fragile"));
    let policy = PolicyState::new(Mode(3), "fragile", env);
    let fault = policy.fault_flag();

    let ctx = ControlContext::new(sim.clone(), 0.001);
    let passive = PassiveState::new(Mode(1), &Default::default());
    let mut machine = StateMachine::new(Box::new(passive), ctx).unwrap();
    machine.register_state(Box::new(policy)).unwrap();
    machine
        .add_transition(Mode(1), TransitionRule::new("start", Mode(3), |s| s.tick == 0))
        .unwrap();
    for rule in safety_rules(Mode(1), &SafetyConfig::default()) {
        machine.add_safety_rule(rule);
    }

    machine.tick();
    assert_eq!(machine.active_mode(), Mode(3));
    assert!(wait_until(Duration::from_secs(2), || fault.load(Ordering::SeqCst)));

    machine.tick();
    assert_eq!(machine.active_mode(), Mode(1));
}

#[test]
fn reentry_starts_from_rest_targets() {
    let sim = Arc::new(SimRobot::new(4, 0.001, 0));
    let armed = Arc::new(AtomicBool::new(false));
    let mut registry = ObservationRegistry::with_builtin_terms();
    let stall = Arc::clone(&armed);
    registry.register("stall", move |_: &EnvContext, _: &TermParams| {
        if stall.swap(false, Ordering::SeqCst) {
            thread::sleep(Duration::from_millis(300));
        }
        vec![0.0; 2]
    });
    let backend = LinearBackend::constant(2, &[("actions", vec![0.4, -0.2])]);
    let env = env_with_terms(&sim, Box::new(backend), &registry, &term("stall"));
    let mut state = PolicyState::new(Mode(3), "walk", env);
    let mut ctx = ControlContext::new(sim.clone(), 0.001);

    state.enter(&mut ctx);
    assert!(wait_until(Duration::from_secs(2), || {
        state
            .latest_action()
            .map_or(false, |a| a[..] == [0.4, -0.2])
    }));
    state.run(&mut ctx);
    assert_eq!(ctx.cmd.motors[3].q, 0.4);
    state.exit(&mut ctx);
    assert!(state.latest_action().is_none());

    // The first step of the new episode is held back; run must not replay
    // the last episode's targets meanwhile.
    armed.store(true, Ordering::SeqCst);
    state.enter(&mut ctx);
    state.run(&mut ctx);
    assert_eq!(ctx.cmd.motors[3].q, 0.0);
    assert_eq!(ctx.cmd.motors[1].q, 0.0);
    assert_eq!(state.latest_action().as_deref().map(Vec::as_slice), Some(&[0.0, 0.0][..]));
    state.exit(&mut ctx);
}

#[test]
fn run_copies_whole_actions_while_the_env_steps() {
    let sim = Arc::new(SimRobot::new(4, 0.001, 0));
    let mut state = PolicyState::new(Mode(3), "count", env_with(&sim, Box::new(CountingBackend { calls: 0 })));
    let mut ctx = ControlContext::new(sim.clone(), 0.001);

    state.enter(&mut ctx);
    let deadline = Instant::now() + Duration::from_millis(150);
    let mut last = 0.0_f32;
    while Instant::now() < deadline {
        state.run(&mut ctx);
        let (a, b) = (ctx.cmd.motors[3].q, ctx.cmd.motors[1].q);
        assert_eq!(a, b, "targets from two different steps");
        assert!(a >= last, "targets went backwards: {a} after {last}");
        last = a;
        thread::sleep(Duration::from_micros(200));
    }
    state.exit(&mut ctx);
    assert!(last >= 5.0, "env stepped only {last} times");
}
