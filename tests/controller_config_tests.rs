use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use gaitctl::config::{ControllerConfig, DeployConfig};
use gaitctl::controller::{build_state_machine, fix_stand_mode, passive_mode, BuildError};
use gaitctl::fsm::Mode;
use gaitctl::rl::{FixedCommand, ObservationRegistry, RlEnv};
use gaitctl::robot::{Button, RobotChannel, SimRobot};

const NUM_MOTORS: usize = 12;

/// Policy over 12 joints: obs = joint_pos_rel(12) + velocity_commands(3) +
/// motion_command(24) = 39; constant action of 0.1 per joint.
fn write_policy_dir(dir: &Path, with_logging_dir: bool) {
    fs::create_dir_all(dir.join("params")).unwrap();
    fs::create_dir_all(dir.join("exported")).unwrap();
    if with_logging_dir {
        fs::create_dir_all(dir.join("logs")).unwrap();
    }

    let ids: Vec<String> = (0..NUM_MOTORS).map(|i| i.to_string()).collect();
    let deploy = format!(
        r#"
step_dt: 0.005
joint_ids_map: [{ids}]
default_joint_pos: [{zeros}]
stiffness: [{kp}]
damping: [{kd}]
actions:
  JointPositionAction:
    scale: 0.5
    clip: [-1.0, 1.0]
observations:
  joint_pos_rel: {{}}
  velocity_commands:
    scale: [2.0, 2.0, 0.25]
  motion_command: {{}}
commands:
  base_velocity:
    ranges:
      lin_vel_x: [-1.0, 1.0]
      lin_vel_y: [-0.5, 0.5]
      ang_vel_z: [-1.0, 1.0]
motion:
  file: motion.csv
  fps: 50
"#,
        ids = ids.join(", "),
        zeros = vec!["0.0"; NUM_MOTORS].join(", "),
        kp = vec!["20.0"; NUM_MOTORS].join(", "),
        kd = vec!["0.5"; NUM_MOTORS].join(", "),
    );
    fs::write(dir.join("params/deploy.yaml"), deploy).unwrap();

    let width = NUM_MOTORS + 3 + 2 * NUM_MOTORS;
    let policy = serde_json::json!({
        "input_width": width,
        "outputs": {
            "actions": {
                "weights": vec![vec![0.0_f32; width]; NUM_MOTORS],
                "bias": vec![0.2_f32; NUM_MOTORS],
            },
            "latent": {
                "weights": vec![vec![0.0_f32; width]; 2],
                "bias": [1.0, 2.0],
            }
        }
    });
    fs::write(dir.join("exported/policy.json"), policy.to_string()).unwrap();

    let mut csv = String::new();
    for frame in 0..5 {
        let joints: Vec<String> = (0..NUM_MOTORS).map(|j| format!("{}", 0.01 * (frame * j) as f64)).collect();
        csv.push_str(&format!("{}.0,0.0,0.3,0.0,0.0,0.0,1.0,{}\n", frame, joints.join(",")));
    }
    fs::write(dir.join("motion.csv"), csv).unwrap();
}

fn controller_yaml(second_dir: &str) -> String {
    format!(
        r#"
control_dt: 0.001
policies:
  - name: Walk
    mode: 3
    chord: {{ held: up, trigger: start }}
    policy_dir: walk
    logging: true
    logging_dt: 0.001
  - name: Spare
    mode: 4
    chord: {{ held: down, trigger: start }}
    policy_dir: {second_dir}
"#
    )
}

fn chord(sim: &SimRobot, machine: &mut gaitctl::StateMachine, held: Button, trigger: Button) {
    sim.press(&[held]);
    machine.tick();
    sim.press(&[held, trigger]);
    machine.tick();
    sim.release_all();
    machine.tick();
}

#[test]
fn deploy_file_drives_environment_width() {
    let dir = tempfile::tempdir().unwrap();
    write_policy_dir(dir.path(), false);
    let deploy = DeployConfig::from_policy_dir(dir.path()).unwrap();
    assert_eq!(deploy.num_joints(), NUM_MOTORS);
    assert!(deploy.motion.is_some());

    let sim: Arc<dyn RobotChannel> = Arc::new(SimRobot::new(NUM_MOTORS, 0.001, 0));
    let env = RlEnv::from_policy_dir(
        dir.path(),
        sim,
        &ObservationRegistry::with_builtin_terms(),
        Arc::new(parking_lot::Mutex::new(FixedCommand::new([0.0; 3], 0.0))),
    )
    .unwrap();
    assert_eq!(env.observation_width(), NUM_MOTORS + 3 + 2 * NUM_MOTORS);
    let motion = env.ctx().motion.as_ref().unwrap();
    assert_eq!(motion.num_frames(), 5);
    assert!((motion.duration() - 0.1).abs() < 1e-12);
}

#[test]
fn full_mode_sequence_with_inert_policy() {
    let dir = tempfile::tempdir().unwrap();
    write_policy_dir(&dir.path().join("walk"), false);
    let cfg_path = dir.path().join("controller.yaml");
    fs::write(&cfg_path, controller_yaml("null")).unwrap();
    let cfg = ControllerConfig::from_yaml_file(&cfg_path).unwrap();

    let sim = Arc::new(SimRobot::new(NUM_MOTORS, 0.001, 3));
    let mut machine = build_state_machine(&cfg, sim.clone()).unwrap();
    assert_eq!(machine.state_count(), 4);
    assert_eq!(machine.active_mode(), passive_mode());

    // Policy chords do nothing from Passive.
    chord(&sim, &mut machine, Button::Up, Button::Start);
    assert_eq!(machine.active_mode(), passive_mode());

    chord(&sim, &mut machine, Button::L2, Button::A);
    assert_eq!(machine.active_mode(), fix_stand_mode());

    // The inert policy is not selectable.
    chord(&sim, &mut machine, Button::Down, Button::Start);
    assert_eq!(machine.active_mode(), fix_stand_mode());

    chord(&sim, &mut machine, Button::Up, Button::Start);
    assert_eq!(machine.active_mode(), Mode(3));
    assert_eq!(machine.active_name(), "Walk");

    // Let the policy thread publish, then check the joint targets.
    thread::sleep(Duration::from_millis(50));
    machine.tick();
    let cmd = sim.last_command().unwrap();
    assert!(cmd.motors.iter().all(|m| (m.q - 0.1).abs() < 1e-6), "0.2 * 0.5 + 0");
    assert!(cmd.motors.iter().all(|m| m.kp == 20.0));

    chord(&sim, &mut machine, Button::L2, Button::B);
    assert_eq!(machine.active_mode(), passive_mode());
    machine.shutdown();
    // Joins the telemetry writer.
    drop(machine);

    let logs: Vec<_> = fs::read_dir(dir.path().join("walk/logs"))
        .unwrap()
        .map(|e| e.unwrap().path())
        .collect();
    assert_eq!(logs.len(), 1);
    let text = fs::read_to_string(&logs[0]).unwrap();
    let header = text.lines().next().unwrap();
    assert!(header.starts_with("time,unix_time,wall_time,q_des_0"));
    assert!(header.contains("latent_1"));
    assert!(text.lines().count() >= 2);
}

#[test]
fn duplicate_policy_mode_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    write_policy_dir(&dir.path().join("walk"), true);
    let yaml = controller_yaml("walk").replace("mode: 4", "mode: 3");
    let cfg_path = dir.path().join("controller.yaml");
    fs::write(&cfg_path, yaml).unwrap();
    let cfg = ControllerConfig::from_yaml_file(&cfg_path).unwrap();

    let sim = Arc::new(SimRobot::new(NUM_MOTORS, 0.001, 0));
    assert!(matches!(
        build_state_machine(&cfg, sim),
        Err(BuildError::Fsm(gaitctl::FsmError::DuplicateMode { .. }))
    ));
}

#[test]
fn width_mismatch_and_motor_count_are_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let walk = dir.path().join("walk");
    write_policy_dir(&walk, false);
    let deploy = fs::read_to_string(walk.join("params/deploy.yaml")).unwrap();
    fs::write(
        walk.join("params/deploy.yaml"),
        deploy.replace("  motion_command: {}\n", ""),
    )
    .unwrap();
    let cfg_path = dir.path().join("controller.yaml");
    fs::write(&cfg_path, controller_yaml("null")).unwrap();
    let cfg = ControllerConfig::from_yaml_file(&cfg_path).unwrap();

    let sim = Arc::new(SimRobot::new(NUM_MOTORS, 0.001, 0));
    let err = build_state_machine(&cfg, sim).err().unwrap();
    assert!(err.to_string().contains("Walk"), "{err}");
    assert!(matches!(err, BuildError::Policy { .. }));

    let small = Arc::new(SimRobot::new(4, 0.001, 0));
    assert!(matches!(
        build_state_machine(&cfg, small),
        Err(BuildError::MotorCount { config: 12, channel: 4 })
    ));
}
