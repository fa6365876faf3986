// src/robot.rs
//
// Low-level robot interface: the command/state messages exchanged with the
// hardware channel, joystick edge tracking, the articulation view used by
// the RL environments, and a loopback simulator for running without hardware.

use std::sync::Arc;

use nalgebra::{Quaternion, UnitQuaternion, Vector3};
use parking_lot::Mutex;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

/// Motor count of the reference quadruped.
pub const DEFAULT_NUM_MOTORS: usize = 12;

/// Per-motor target sent to the hardware. Tracking is done by motor firmware.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MotorCmd {
    pub q: f32,
    pub dq: f32,
    pub kp: f32,
    pub kd: f32,
    pub tau: f32,
}

/// Outgoing low-level command buffer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LowCmd {
    pub motors: Vec<MotorCmd>,
}

impl LowCmd {
    pub fn new(num_motors: usize) -> Self {
        Self {
            motors: vec![MotorCmd::default(); num_motors],
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MotorState {
    pub q: f32,
    pub dq: f32,
    pub tau_est: f32,
    pub temperature: f32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ImuState {
    /// Orientation as `[w, x, y, z]`.
    pub quaternion: [f32; 4],
    pub rpy: [f32; 3],
    pub gyroscope: [f32; 3],
    pub accelerometer: [f32; 3],
}

impl Default for ImuState {
    fn default() -> Self {
        Self {
            quaternion: [1.0, 0.0, 0.0, 0.0],
            rpy: [0.0; 3],
            gyroscope: [0.0; 3],
            accelerometer: [0.0, 0.0, 9.81],
        }
    }
}

impl ImuState {
    /// Body orientation in the world frame. A degenerate quaternion maps to identity.
    pub fn orientation(&self) -> UnitQuaternion<f64> {
        let [w, x, y, z] = self.quaternion.map(f64::from);
        let q = Quaternion::new(w, x, y, z);
        if q.norm() < 1e-9 {
            UnitQuaternion::identity()
        } else {
            UnitQuaternion::from_quaternion(q)
        }
    }

    /// Gravity direction expressed in the body frame.
    pub fn projected_gravity(&self) -> Vector3<f64> {
        self.orientation()
            .inverse_transform_vector(&Vector3::new(0.0, 0.0, -1.0))
    }

    /// Angle between the body z-axis and the world up-axis, in radians.
    pub fn tilt(&self) -> f64 {
        (-self.projected_gravity().z).clamp(-1.0, 1.0).acos()
    }
}

/// Joystick buttons, by bit position in the raw key mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum Button {
    R1 = 0,
    L1 = 1,
    Start = 2,
    Select = 3,
    R2 = 4,
    #[serde(alias = "lt")]
    L2 = 5,
    F1 = 6,
    F2 = 7,
    A = 8,
    B = 9,
    X = 10,
    Y = 11,
    Up = 12,
    Right = 13,
    Down = 14,
    Left = 15,
}

impl Button {
    pub fn mask(self) -> u16 {
        1 << (self as u8)
    }
}

/// Raw joystick payload carried inside the low-level state.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct JoystickRaw {
    pub keys: u16,
    pub lx: f32,
    pub ly: f32,
    pub rx: f32,
    pub ry: f32,
}

/// Low-level sensor state delivered by the hardware channel.
#[derive(Debug, Clone, PartialEq)]
pub struct LowState {
    pub motors: Vec<MotorState>,
    pub imu: ImuState,
    pub foot_force: [f32; 4],
    pub joystick: JoystickRaw,
    /// Monotonic message counter from the channel.
    pub tick: u64,
}

impl LowState {
    pub fn new(num_motors: usize) -> Self {
        Self {
            motors: vec![MotorState::default(); num_motors],
            imu: ImuState::default(),
            foot_force: [0.0; 4],
            joystick: JoystickRaw::default(),
            tick: 0,
        }
    }
}

/// Button state with press edges, derived from successive raw key masks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Gamepad {
    keys: u16,
    rising: u16,
}

impl Gamepad {
    /// Fold in a new key mask; edges are relative to the previous update.
    pub fn update(&mut self, keys: u16) {
        self.rising = keys & !self.keys;
        self.keys = keys;
    }

    pub fn pressed(&self, button: Button) -> bool {
        self.keys & button.mask() != 0
    }

    /// True only on the update where the button went down.
    pub fn on_pressed(&self, button: Button) -> bool {
        self.rising & button.mask() != 0
    }

    /// `held` is down and `trigger` was pressed on this update.
    pub fn chord(&self, held: Button, trigger: Button) -> bool {
        self.pressed(held) && self.on_pressed(trigger)
    }
}

/// Hardware channel consumed by the controller.
///
/// Implementations synchronise internally; the control thread and the policy
/// threads both read from the same channel.
pub trait RobotChannel: Send + Sync {
    fn num_motors(&self) -> usize;

    /// Most recent complete sensor message.
    fn latest_state(&self) -> LowState;

    /// Flush a command to the motors.
    fn publish(&self, cmd: &LowCmd);

    /// Sensor stream has gone stale or the link is down.
    fn is_timeout(&self) -> bool;
}

/// Articulation data in policy joint order.
#[derive(Debug, Clone, PartialEq)]
pub struct RobotData {
    /// `joint_ids_map[i]` is the motor index of policy joint `i`.
    pub joint_ids_map: Vec<usize>,
    pub default_joint_pos: Vec<f32>,
    pub joint_stiffness: Vec<f32>,
    pub joint_damping: Vec<f32>,
    pub joint_pos: Vec<f32>,
    pub joint_vel: Vec<f32>,
    pub root_quat_w: UnitQuaternion<f64>,
    pub root_ang_vel_b: [f32; 3],
    pub projected_gravity_b: [f32; 3],
    pub joystick: JoystickRaw,
}

impl RobotData {
    pub fn new(
        joint_ids_map: Vec<usize>,
        default_joint_pos: Vec<f32>,
        joint_stiffness: Vec<f32>,
        joint_damping: Vec<f32>,
    ) -> Self {
        let n = joint_ids_map.len();
        Self {
            joint_ids_map,
            default_joint_pos,
            joint_stiffness,
            joint_damping,
            joint_pos: vec![0.0; n],
            joint_vel: vec![0.0; n],
            root_quat_w: UnitQuaternion::identity(),
            root_ang_vel_b: [0.0; 3],
            projected_gravity_b: [0.0, 0.0, -1.0],
            joystick: JoystickRaw::default(),
        }
    }

    pub fn num_joints(&self) -> usize {
        self.joint_ids_map.len()
    }

    /// Copy a sensor message into policy joint order.
    pub fn apply(&mut self, state: &LowState) {
        for (i, &motor) in self.joint_ids_map.iter().enumerate() {
            if let Some(m) = state.motors.get(motor) {
                self.joint_pos[i] = m.q;
                self.joint_vel[i] = m.dq;
            }
        }
        self.root_quat_w = state.imu.orientation();
        self.root_ang_vel_b = state.imu.gyroscope;
        let g = state.imu.projected_gravity();
        self.projected_gravity_b = [g.x as f32, g.y as f32, g.z as f32];
        self.joystick = state.joystick;
    }
}

/// Robot data plus the channel it is refreshed from.
pub struct Articulation {
    channel: Arc<dyn RobotChannel>,
    pub data: RobotData,
}

impl Articulation {
    pub fn new(channel: Arc<dyn RobotChannel>, data: RobotData) -> Self {
        Self { channel, data }
    }

    /// Pull the latest sensor message into `data`.
    pub fn update(&mut self) {
        let state = self.channel.latest_state();
        self.data.apply(&state);
    }

    pub fn channel(&self) -> &Arc<dyn RobotChannel> {
        &self.channel
    }
}

struct SimInner {
    state: LowState,
    last_cmd: Option<LowCmd>,
    publishes: u64,
    connected: bool,
    rng: ChaCha8Rng,
}

/// Loopback channel: commanded positions are tracked with a first-order lag.
///
/// Deterministic for a given seed. Joystick keys and body orientation can be
/// scripted from tests or from the `--sim` harness.
pub struct SimRobot {
    inner: Mutex<SimInner>,
    dt: f32,
    response: f32,
    gyro_noise: f32,
}

impl SimRobot {
    pub fn new(num_motors: usize, dt: f64, seed: u64) -> Self {
        Self {
            inner: Mutex::new(SimInner {
                state: LowState::new(num_motors),
                last_cmd: None,
                publishes: 0,
                connected: true,
                rng: ChaCha8Rng::seed_from_u64(seed),
            }),
            dt: dt.max(1e-6) as f32,
            response: 0.2,
            gyro_noise: 0.0,
        }
    }

    pub fn with_gyro_noise(mut self, amplitude: f32) -> Self {
        self.gyro_noise = amplitude.max(0.0);
        self
    }

    pub fn set_keys(&self, keys: u16) {
        self.inner.lock().state.joystick.keys = keys;
    }

    pub fn press(&self, buttons: &[Button]) {
        let keys = buttons.iter().fold(0u16, |acc, b| acc | b.mask());
        self.set_keys(keys);
    }

    pub fn release_all(&self) {
        self.set_keys(0);
    }

    pub fn set_sticks(&self, lx: f32, ly: f32, rx: f32, ry: f32) {
        let mut inner = self.inner.lock();
        let js = &mut inner.state.joystick;
        js.lx = lx;
        js.ly = ly;
        js.rx = rx;
        js.ry = ry;
    }

    /// Orientation as `[w, x, y, z]`.
    pub fn set_orientation(&self, quaternion: [f32; 4]) {
        self.inner.lock().state.imu.quaternion = quaternion;
    }

    pub fn set_joint_positions(&self, q: &[f32]) {
        let mut inner = self.inner.lock();
        for (m, &v) in inner.state.motors.iter_mut().zip(q) {
            m.q = v;
            m.dq = 0.0;
        }
    }

    pub fn set_connected(&self, connected: bool) {
        self.inner.lock().connected = connected;
    }

    pub fn last_command(&self) -> Option<LowCmd> {
        self.inner.lock().last_cmd.clone()
    }

    pub fn publish_count(&self) -> u64 {
        self.inner.lock().publishes
    }
}

impl RobotChannel for SimRobot {
    fn num_motors(&self) -> usize {
        self.inner.lock().state.motors.len()
    }

    fn latest_state(&self) -> LowState {
        self.inner.lock().state.clone()
    }

    fn publish(&self, cmd: &LowCmd) {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        for (m, c) in inner.state.motors.iter_mut().zip(&cmd.motors) {
            let prev = m.q;
            if c.kp > 0.0 {
                m.q += (c.q - m.q) * self.response;
            }
            m.dq = (m.q - prev) / self.dt;
            m.tau_est = c.kp * (c.q - m.q) - c.kd * m.dq + c.tau;
        }
        if self.gyro_noise > 0.0 {
            let a = self.gyro_noise;
            for g in inner.state.imu.gyroscope.iter_mut() {
                *g = inner.rng.gen_range(-a..=a);
            }
        }
        inner.state.tick += 1;
        inner.last_cmd = Some(cmd.clone());
        inner.publishes += 1;
    }

    fn is_timeout(&self) -> bool {
        !self.inner.lock().connected
    }
}
