// src/rl/motion.rs
//
// Time-indexed reference motion.
//
// A recorded trajectory is a fixed-rate sequence of frames
// {root position, root orientation, joint positions}. Joint velocities are
// derived by forward differences. `update(t)` selects the bracketing frame
// pair and a blend weight; the accessors interpolate between them (linear for
// vectors, shortest-arc slerp for the orientation).

use std::io::Read;
use std::path::Path;

use nalgebra::{DVector, Quaternion, UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Root position (3) + quaternion (4) precede the joint columns.
const ROOT_COLUMNS: usize = 7;

/// Blend weights are quantised to this many steps per frame.
const BLEND_QUANTUM: f64 = 1e5;

#[derive(Debug, Error)]
pub enum MotionError {
    #[error("motion csv error: {0}")]
    Csv(#[from] csv::Error),
    #[error("row {row}: invalid value '{value}'")]
    InvalidValue { row: usize, value: String },
    #[error("row {row}: expected {expected} columns, found {found}")]
    RaggedRow {
        row: usize,
        expected: usize,
        found: usize,
    },
    #[error("row {row}: {found} columns is too few (root pose needs 7 plus joints)")]
    TooFewColumns { row: usize, found: usize },
    #[error("row {row}: root quaternion has zero norm")]
    DegenerateQuaternion { row: usize },
    #[error("motion contains no frames")]
    Empty,
    #[error("fps must be positive and finite, got {0}")]
    InvalidFps(f64),
    #[error("frame {frame}: expected {expected} joints, found {found}")]
    JointCountMismatch {
        frame: usize,
        expected: usize,
        found: usize,
    },
}

/// Column order of the orientation in the motion file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuatOrder {
    /// `x, y, z, w` (scalar last).
    #[default]
    Xyzw,
    /// `w, x, y, z` (scalar first).
    Wxyz,
}

/// One recorded sample.
#[derive(Debug, Clone, PartialEq)]
pub struct MotionFrame {
    pub root_position: Vector3<f64>,
    pub root_quaternion: UnitQuaternion<f64>,
    pub joint_positions: Vec<f64>,
}

/// Yaw-only part of an orientation (roll and pitch discarded).
pub fn yaw_quaternion(q: &UnitQuaternion<f64>) -> UnitQuaternion<f64> {
    // coords are stored [i, j, k, w]
    let c = q.quaternion().coords;
    let (x, y, z, w) = (c[0], c[1], c[2], c[3]);
    let yaw = (2.0 * (w * z + x * y)).atan2(1.0 - 2.0 * (y * y + z * z));
    UnitQuaternion::from_axis_angle(&Vector3::z_axis(), yaw)
}

fn quantize_blend(x: f64) -> f64 {
    (x * BLEND_QUANTUM).round() / BLEND_QUANTUM
}

#[derive(Debug, Clone)]
pub struct MotionLoader {
    dt: f64,
    duration: f64,
    root_positions: Vec<Vector3<f64>>,
    root_quaternions: Vec<UnitQuaternion<f64>>,
    joint_positions: Vec<DVector<f64>>,
    joint_velocities: Vec<DVector<f64>>,
    index_0: usize,
    index_1: usize,
    blend: f64,
    world_to_init: UnitQuaternion<f64>,
}

impl MotionLoader {
    /// Load a headerless CSV motion file.
    pub fn load<P: AsRef<Path>>(path: P, fps: f64, order: QuatOrder) -> Result<Self, MotionError> {
        let reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .trim(csv::Trim::All)
            .from_path(path.as_ref())?;
        Self::from_csv(reader, fps, order)
    }

    /// Parse CSV motion data from any reader.
    pub fn from_reader<R: Read>(rdr: R, fps: f64, order: QuatOrder) -> Result<Self, MotionError> {
        let reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .trim(csv::Trim::All)
            .from_reader(rdr);
        Self::from_csv(reader, fps, order)
    }

    fn from_csv<R: Read>(
        mut reader: csv::Reader<R>,
        fps: f64,
        order: QuatOrder,
    ) -> Result<Self, MotionError> {
        let mut frames = Vec::new();
        let mut width = None;

        for (row, record) in reader.records().enumerate() {
            let record = record?;
            if record.iter().all(|cell| cell.is_empty()) {
                continue;
            }
            let mut values = Vec::with_capacity(record.len());
            for cell in record.iter() {
                let v: f64 = cell.parse().map_err(|_| MotionError::InvalidValue {
                    row,
                    value: cell.to_string(),
                })?;
                values.push(v);
            }
            if values.len() <= ROOT_COLUMNS {
                return Err(MotionError::TooFewColumns {
                    row,
                    found: values.len(),
                });
            }
            match width {
                None => width = Some(values.len()),
                Some(expected) if expected != values.len() => {
                    return Err(MotionError::RaggedRow {
                        row,
                        expected,
                        found: values.len(),
                    });
                }
                Some(_) => {}
            }

            let (qx, qy, qz, qw) = match order {
                QuatOrder::Xyzw => (values[3], values[4], values[5], values[6]),
                QuatOrder::Wxyz => (values[4], values[5], values[6], values[3]),
            };
            let quat = Quaternion::new(qw, qx, qy, qz);
            if quat.norm() < 1e-9 {
                return Err(MotionError::DegenerateQuaternion { row });
            }
            frames.push(MotionFrame {
                root_position: Vector3::new(values[0], values[1], values[2]),
                root_quaternion: UnitQuaternion::from_quaternion(quat),
                joint_positions: values[ROOT_COLUMNS..].to_vec(),
            });
        }

        Self::from_frames(frames, fps)
    }

    /// Build from in-memory frames sampled at `fps`.
    pub fn from_frames(frames: Vec<MotionFrame>, fps: f64) -> Result<Self, MotionError> {
        if !(fps.is_finite() && fps > 0.0) {
            return Err(MotionError::InvalidFps(fps));
        }
        if frames.is_empty() {
            return Err(MotionError::Empty);
        }
        let dt = 1.0 / fps;
        let num_joints = frames[0].joint_positions.len();

        let mut root_positions = Vec::with_capacity(frames.len());
        let mut root_quaternions = Vec::with_capacity(frames.len());
        let mut joint_positions = Vec::with_capacity(frames.len());
        for (i, frame) in frames.into_iter().enumerate() {
            if frame.joint_positions.len() != num_joints {
                return Err(MotionError::JointCountMismatch {
                    frame: i,
                    expected: num_joints,
                    found: frame.joint_positions.len(),
                });
            }
            root_positions.push(frame.root_position);
            root_quaternions.push(frame.root_quaternion);
            joint_positions.push(DVector::from_vec(frame.joint_positions));
        }
        let joint_velocities = finite_difference(&joint_positions, dt);

        let mut loader = Self {
            dt,
            duration: joint_positions.len() as f64 * dt,
            root_positions,
            root_quaternions,
            joint_positions,
            joint_velocities,
            index_0: 0,
            index_1: 0,
            blend: 0.0,
            world_to_init: UnitQuaternion::identity(),
        };
        loader.update(0.0);
        Ok(loader)
    }

    pub fn dt(&self) -> f64 {
        self.dt
    }

    pub fn duration(&self) -> f64 {
        self.duration
    }

    pub fn num_frames(&self) -> usize {
        self.joint_positions.len()
    }

    pub fn num_joints(&self) -> usize {
        self.joint_positions[0].len()
    }

    /// Current `(frame0, frame1)` pair.
    pub fn frame_indices(&self) -> (usize, usize) {
        (self.index_0, self.index_1)
    }

    pub fn blend(&self) -> f64 {
        self.blend
    }

    /// Select the frame pair and blend weight for time `t` (seconds).
    ///
    /// The blend is kept in `[0, 1)`: when rounding lands on the neighbouring
    /// frame the pair is shifted instead, which leaves the interpolated value
    /// unchanged. At the last frame the blend is 0.
    pub fn update(&mut self, t: f64) {
        let last = self.num_frames() - 1;
        let phase = (t / self.duration).clamp(0.0, 1.0);
        let mut i0 = (phase * last as f64).round() as usize;
        let mut blend = quantize_blend((t - i0 as f64 * self.dt) / self.dt);

        while blend < 0.0 && i0 > 0 {
            i0 -= 1;
            blend = quantize_blend((t - i0 as f64 * self.dt) / self.dt);
        }
        while blend >= 1.0 && i0 < last {
            i0 += 1;
            blend = quantize_blend((t - i0 as f64 * self.dt) / self.dt);
        }

        let i1 = (i0 + 1).min(last);
        self.index_0 = i0;
        self.index_1 = i1;
        self.blend = if i0 == i1 { 0.0 } else { blend.clamp(0.0, 1.0) };
    }

    /// Rewind to `t = 0` and align the motion's initial heading with the robot's.
    pub fn reset(&mut self, robot_root_quat_w: &UnitQuaternion<f64>) {
        self.update(0.0);
        let init_to_anchor = yaw_quaternion(&self.root_quaternion());
        let world_to_anchor = yaw_quaternion(robot_root_quat_w);
        self.world_to_init = world_to_anchor * init_to_anchor.inverse();
    }

    /// Rotation taking motion coordinates into the robot's current world frame.
    pub fn world_to_init(&self) -> &UnitQuaternion<f64> {
        &self.world_to_init
    }

    pub fn joint_pos(&self) -> DVector<f64> {
        lerp(
            &self.joint_positions[self.index_0],
            &self.joint_positions[self.index_1],
            self.blend,
        )
    }

    pub fn joint_vel(&self) -> DVector<f64> {
        lerp(
            &self.joint_velocities[self.index_0],
            &self.joint_velocities[self.index_1],
            self.blend,
        )
    }

    pub fn root_position(&self) -> Vector3<f64> {
        self.root_positions[self.index_0] * (1.0 - self.blend)
            + self.root_positions[self.index_1] * self.blend
    }

    pub fn root_quaternion(&self) -> UnitQuaternion<f64> {
        let q0 = self.root_quaternions[self.index_0];
        let q1 = self.root_quaternions[self.index_1];
        q0.try_slerp(&q1, self.blend, f64::EPSILON).unwrap_or(q0)
    }

    /// Root position expressed in the robot's world frame (after `reset`).
    pub fn root_position_w(&self) -> Vector3<f64> {
        self.world_to_init * self.root_position()
    }

    /// Root orientation expressed in the robot's world frame (after `reset`).
    pub fn root_quaternion_w(&self) -> UnitQuaternion<f64> {
        self.world_to_init * self.root_quaternion()
    }
}

fn lerp(a: &DVector<f64>, b: &DVector<f64>, blend: f64) -> DVector<f64> {
    a * (1.0 - blend) + b * blend
}

/// Forward differences; the final frame repeats the last difference.
fn finite_difference(data: &[DVector<f64>], dt: f64) -> Vec<DVector<f64>> {
    if data.len() < 2 {
        return data.iter().map(|d| DVector::zeros(d.len())).collect();
    }
    let mut out: Vec<DVector<f64>> = data.windows(2).map(|w| (&w[1] - &w[0]) / dt).collect();
    let tail = out[out.len() - 1].clone();
    out.push(tail);
    out
}
