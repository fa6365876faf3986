use std::sync::Arc;

use parking_lot::Mutex;

use gaitctl::config::{Chord, SafetyConfig};
use gaitctl::fsm::{safety_rules, ControlContext, FsmError, Mode, State, StateMachine, Transition, TransitionRule};
use gaitctl::robot::{Button, SimRobot};

type Journal = Arc<Mutex<Vec<String>>>;

struct Recorder {
    mode: Mode,
    name: &'static str,
    journal: Journal,
}

impl State for Recorder {
    fn mode(&self) -> Mode {
        self.mode
    }

    fn name(&self) -> &str {
        self.name
    }

    fn enter(&mut self, _ctx: &mut ControlContext) {
        self.journal.lock().push(format!("enter {}", self.name));
    }

    fn run(&mut self, _ctx: &mut ControlContext) {
        self.journal.lock().push(format!("run {}", self.name));
    }

    fn exit(&mut self, _ctx: &mut ControlContext) {
        self.journal.lock().push(format!("exit {}", self.name));
    }
}

fn recorder(mode: u32, name: &'static str, journal: &Journal) -> Box<dyn State> {
    Box::new(Recorder {
        mode: Mode(mode),
        name,
        journal: Arc::clone(journal),
    })
}

fn setup() -> (Arc<SimRobot>, Journal, StateMachine) {
    let sim = Arc::new(SimRobot::new(12, 0.001, 0));
    let journal: Journal = Arc::new(Mutex::new(Vec::new()));
    let ctx = ControlContext::new(sim.clone(), 0.001);
    let machine = StateMachine::new(recorder(1, "Passive", &journal), ctx).unwrap();
    (sim, journal, machine)
}

#[test]
fn passive_to_stand_on_chord_enters_once() {
    let (sim, journal, mut machine) = setup();
    machine.register_state(recorder(2, "FixStand", &journal)).unwrap();
    machine
        .add_transition(
            Mode(1),
            TransitionRule::on_chord("stand", Mode(2), Chord::new(Button::L2, Button::A)),
        )
        .unwrap();

    machine.tick();
    sim.press(&[Button::L2]);
    machine.tick();
    sim.press(&[Button::L2, Button::A]);
    let transition = machine.tick();
    assert_eq!(transition, Some(Transition { from: Mode(1), to: Mode(2) }));
    // Holding the buttons does not re-trigger.
    machine.tick();
    machine.tick();

    assert_eq!(machine.active_mode(), Mode(2));
    let log = journal.lock();
    assert_eq!(log.iter().filter(|l| *l == "exit Passive").count(), 1);
    assert_eq!(log.iter().filter(|l| *l == "enter FixStand").count(), 1);
    let exit_at = log.iter().position(|l| l == "exit Passive").unwrap();
    let enter_at = log.iter().position(|l| l == "enter FixStand").unwrap();
    assert_eq!(enter_at, exit_at + 1, "exit then enter, nothing between");
}

#[test]
fn duplicate_mode_leaves_engine_unchanged() {
    let (_sim, journal, mut machine) = setup();
    machine.register_state(recorder(2, "FixStand", &journal)).unwrap();

    let err = machine.register_state(recorder(2, "Impostor", &journal)).unwrap_err();
    assert_eq!(
        err,
        FsmError::DuplicateMode {
            mode: Mode(2),
            existing: "FixStand".to_string()
        }
    );
    assert_eq!(machine.state_count(), 2);
    assert_eq!(machine.mode_name(Mode(2)), Some("FixStand"));
    assert_eq!(machine.active_mode(), Mode(1));

    assert!(matches!(
        machine.register_state(recorder(3, "FixStand", &journal)),
        Err(FsmError::DuplicateName(_))
    ));
    assert_eq!(machine.state_count(), 2);
}

#[test]
fn transitions_need_a_registered_source() {
    let (_sim, _journal, mut machine) = setup();
    assert_eq!(
        machine
            .add_transition(Mode(9), TransitionRule::new("x", Mode(1), |_| true))
            .unwrap_err(),
        FsmError::UnknownMode(Mode(9))
    );
}

#[test]
fn tilt_beyond_limit_forces_passive() {
    let (sim, journal, mut machine) = setup();
    machine.register_state(recorder(2, "FixStand", &journal)).unwrap();
    machine
        .add_transition(Mode(1), TransitionRule::new("always", Mode(2), |s| s.tick == 0))
        .unwrap();
    for rule in safety_rules(Mode(1), &SafetyConfig::default()) {
        machine.add_safety_rule(rule);
    }
    machine.tick();
    assert_eq!(machine.active_mode(), Mode(2));

    // Rolled 90 degrees: below the 2 rad limit.
    let h = std::f32::consts::FRAC_1_SQRT_2;
    sim.set_orientation([h, h, 0.0, 0.0]);
    machine.tick();
    assert_eq!(machine.active_mode(), Mode(2));

    // Upside down.
    sim.set_orientation([0.0, 1.0, 0.0, 0.0]);
    machine.tick();
    assert_eq!(machine.active_mode(), Mode(1));
}

#[test]
fn run_hooks_follow_the_active_state() {
    let (_sim, journal, mut machine) = setup();
    machine.register_state(recorder(2, "FixStand", &journal)).unwrap();
    machine
        .add_transition(Mode(1), TransitionRule::new("go", Mode(2), |_| true))
        .unwrap();
    let transitions = machine.run_for(3);
    assert_eq!(transitions.len(), 1);

    let log = journal.lock();
    let runs: Vec<_> = log.iter().filter(|l| l.starts_with("run")).cloned().collect();
    assert_eq!(runs, vec!["run Passive", "run FixStand", "run FixStand"]);
}
