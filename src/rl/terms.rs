// src/rl/terms.rs
//
// Built-in observation terms.
//
// Joint terms accept an optional `asset_cfg.joint_ids` (or `joint_ids`) list in
// their params to select a subset of policy joints. Motion terms return an
// empty vector when the environment has no reference motion.

use std::f32::consts::TAU;

use super::env::EnvContext;
use super::observation::{ObservationRegistry, TermParams};

pub fn register_builtin(registry: &mut ObservationRegistry) {
    registry.register("base_ang_vel", base_ang_vel);
    registry.register("projected_gravity", projected_gravity);
    registry.register("joint_pos", joint_pos);
    registry.register("joint_pos_rel", joint_pos_rel);
    registry.register("joint_vel_rel", joint_vel_rel);
    registry.register("last_action", last_action);
    registry.register("velocity_commands", velocity_commands);
    registry.register("gait_phase", gait_phase);
    registry.register("motion_joint_pos", motion_joint_pos);
    registry.register("motion_joint_vel", motion_joint_vel);
    registry.register("motion_command", motion_command);
}

fn joint_ids(params: &TermParams) -> Option<Vec<usize>> {
    let node = params
        .get("asset_cfg")
        .and_then(|a| a.get("joint_ids"))
        .or_else(|| params.get("joint_ids"))?;
    serde_yaml::from_value(node.clone()).ok()
}

fn select(values: &[f32], params: &TermParams) -> Vec<f32> {
    match joint_ids(params) {
        Some(ids) => ids
            .iter()
            .map(|&i| values.get(i).copied().unwrap_or(0.0))
            .collect(),
        None => values.to_vec(),
    }
}

pub fn base_ang_vel(ctx: &EnvContext, _params: &TermParams) -> Vec<f32> {
    ctx.robot.data.root_ang_vel_b.to_vec()
}

pub fn projected_gravity(ctx: &EnvContext, _params: &TermParams) -> Vec<f32> {
    ctx.robot.data.projected_gravity_b.to_vec()
}

pub fn joint_pos(ctx: &EnvContext, params: &TermParams) -> Vec<f32> {
    select(&ctx.robot.data.joint_pos, params)
}

pub fn joint_pos_rel(ctx: &EnvContext, params: &TermParams) -> Vec<f32> {
    let data = &ctx.robot.data;
    let rel: Vec<f32> = data
        .joint_pos
        .iter()
        .zip(&data.default_joint_pos)
        .map(|(q, q0)| q - q0)
        .collect();
    select(&rel, params)
}

pub fn joint_vel_rel(ctx: &EnvContext, params: &TermParams) -> Vec<f32> {
    select(&ctx.robot.data.joint_vel, params)
}

pub fn last_action(ctx: &EnvContext, _params: &TermParams) -> Vec<f32> {
    ctx.action_manager.action().to_vec()
}

/// `[forward, lateral, yaw]` from the sticks, scaled asymmetrically by the
/// configured ranges; the fixed command replaces it while active.
pub fn velocity_commands(ctx: &EnvContext, _params: &TermParams) -> Vec<f32> {
    if let Some(fixed) = ctx.fixed_command.lock().current() {
        return fixed.to_vec();
    }
    let js = &ctx.robot.data.joystick;
    let ranges = &ctx.velocity_ranges;
    let scale = |v: f32, [lo, hi]: [f32; 2]| if v > 0.0 { v * hi } else { v * -lo };
    vec![
        scale(js.ly, ranges.lin_vel_x),
        scale(-js.lx, ranges.lin_vel_y),
        scale(-js.rx, ranges.ang_vel_z),
    ]
}

/// `[sin, cos]` of the gait phase derived from elapsed episode time.
pub fn gait_phase(ctx: &EnvContext, params: &TermParams) -> Vec<f32> {
    let period = params
        .get("period")
        .and_then(serde_yaml::Value::as_f64)
        .filter(|p| *p > 0.0)
        .unwrap_or(1.0);
    let phase = (ctx.elapsed() / period).rem_euclid(1.0) as f32;
    vec![(phase * TAU).sin(), (phase * TAU).cos()]
}

fn motion_in_joint_order(ctx: &EnvContext, values: impl Fn(&super::motion::MotionLoader) -> Vec<f64>) -> Vec<f32> {
    let Some(motion) = ctx.motion.as_ref() else {
        return Vec::new();
    };
    let v = values(motion);
    ctx.robot
        .data
        .joint_ids_map
        .iter()
        .map(|&m| v.get(m).copied().unwrap_or(0.0) as f32)
        .collect()
}

pub fn motion_joint_pos(ctx: &EnvContext, _params: &TermParams) -> Vec<f32> {
    motion_in_joint_order(ctx, |m| m.joint_pos().iter().copied().collect())
}

pub fn motion_joint_vel(ctx: &EnvContext, _params: &TermParams) -> Vec<f32> {
    motion_in_joint_order(ctx, |m| m.joint_vel().iter().copied().collect())
}

/// Reference joint positions followed by reference joint velocities.
pub fn motion_command(ctx: &EnvContext, params: &TermParams) -> Vec<f32> {
    let mut out = motion_joint_pos(ctx, params);
    out.extend(motion_joint_vel(ctx, params));
    out
}
