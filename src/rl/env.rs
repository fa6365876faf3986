// src/rl/env.rs
//
// RL environment orchestrator.
//
// `RlEnv` owns everything one policy needs between two inference calls: the
// articulation view, the action manager, the optional reference motion, the
// observation pipeline and the inference backend. It is driven by the policy
// thread (`reset` once, then `step` at `step_dt`) and exposes its results to
// the control thread only through two `LatestCell`s.

use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;

use crate::config::{ConfigError, DeployConfig, ObservationTermConfig, VelocityRanges, POLICY_FILE};
use crate::rl::action::{ActionError, ActionManager, JointPositionAction};
use crate::rl::command::FixedCommand;
use crate::rl::inference::{InferenceBackend, InferenceError, LinearBackend, TensorMap, ACTIONS_OUTPUT, OBS_INPUT};
use crate::rl::motion::{MotionError, MotionLoader};
use crate::rl::observation::{ObservationError, ObservationManager, ObservationRegistry};
use crate::robot::{Articulation, RobotChannel, RobotData};
use crate::sync::LatestCell;

#[derive(Debug, Error)]
pub enum EnvError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Action(#[from] ActionError),
    #[error(transparent)]
    Motion(#[from] MotionError),
    #[error(transparent)]
    Observation(#[from] ObservationError),
    #[error("inference failed: {0}")]
    Inference(#[from] InferenceError),
    #[error("inference produced no output tensors")]
    MissingAction,
    #[error("observation width {observation} does not match policy input width {backend}")]
    ObservationWidthMismatch { observation: usize, backend: usize },
}

/// Environment state visible to observation terms.
pub struct EnvContext {
    pub robot: Articulation,
    pub action_manager: Box<dyn ActionManager>,
    pub motion: Option<MotionLoader>,
    pub fixed_command: Arc<Mutex<FixedCommand>>,
    pub velocity_ranges: VelocityRanges,
    pub step_dt: f64,
    pub episode_length: u64,
}

impl EnvContext {
    pub fn new(robot: Articulation, action_manager: Box<dyn ActionManager>, step_dt: f64) -> Self {
        Self {
            robot,
            action_manager,
            motion: None,
            fixed_command: Arc::new(Mutex::new(FixedCommand::new([0.0; 3], 0.0))),
            velocity_ranges: VelocityRanges::default(),
            step_dt,
            episode_length: 0,
        }
    }

    pub fn with_motion(mut self, motion: MotionLoader) -> Self {
        self.motion = Some(motion);
        self
    }

    pub fn with_fixed_command(mut self, fixed_command: Arc<Mutex<FixedCommand>>) -> Self {
        self.fixed_command = fixed_command;
        self
    }

    pub fn with_velocity_ranges(mut self, ranges: VelocityRanges) -> Self {
        self.velocity_ranges = ranges;
        self
    }

    /// Episode time in seconds.
    pub fn elapsed(&self) -> f64 {
        self.episode_length as f64 * self.step_dt
    }
}

pub struct RlEnv {
    ctx: EnvContext,
    observations: ObservationManager,
    backend: Box<dyn InferenceBackend>,
    actions: Arc<LatestCell<Vec<f32>>>,
    inference: Arc<LatestCell<TensorMap>>,
}

impl RlEnv {
    /// Build the observation pipeline and check it against the backend.
    pub fn new(
        ctx: EnvContext,
        terms: &[(String, ObservationTermConfig)],
        registry: &ObservationRegistry,
        backend: Box<dyn InferenceBackend>,
    ) -> Result<Self, EnvError> {
        let mut ctx = ctx;
        ctx.robot.update();
        let observations = ObservationManager::new(terms, registry, &ctx)?;
        if let Some(expected) = backend.input_width() {
            if expected != observations.width() {
                return Err(EnvError::ObservationWidthMismatch {
                    observation: observations.width(),
                    backend: expected,
                });
            }
        }
        let actions = Arc::new(LatestCell::new());
        actions.publish(ctx.action_manager.processed_actions().to_vec());
        Ok(Self {
            ctx,
            observations,
            backend,
            actions,
            inference: Arc::new(LatestCell::new()),
        })
    }

    /// Load a policy directory: deploy parameters, weights and optional motion.
    pub fn from_policy_dir(
        policy_dir: &Path,
        channel: Arc<dyn RobotChannel>,
        registry: &ObservationRegistry,
        fixed_command: Arc<Mutex<FixedCommand>>,
    ) -> Result<Self, EnvError> {
        let deploy = DeployConfig::from_policy_dir(policy_dir)?;
        let backend = LinearBackend::from_json_file(policy_dir.join(POLICY_FILE))?;
        let action = JointPositionAction::from_config(&deploy.actions.joint_position, &deploy.default_joint_pos)?;
        let data = RobotData::new(
            deploy.joint_ids_map.clone(),
            deploy.default_joint_pos.clone(),
            deploy.stiffness.clone(),
            deploy.damping.clone(),
        );

        let mut ctx = EnvContext::new(Articulation::new(channel, data), Box::new(action), deploy.step_dt)
            .with_fixed_command(fixed_command)
            .with_velocity_ranges(deploy.commands.base_velocity.ranges.clone());
        if let Some(motion_cfg) = &deploy.motion {
            let path = policy_dir.join(&motion_cfg.file);
            let motion = MotionLoader::load(&path, motion_cfg.fps, motion_cfg.quat_order)?;
            log::info!(
                "[env] motion {} loaded: {} frames, {:.2}s",
                path.display(),
                motion.num_frames(),
                motion.duration()
            );
            ctx = ctx.with_motion(motion);
        }

        let terms = deploy.observation_terms()?;
        Self::new(ctx, &terms, registry, Box::new(backend))
    }

    pub fn reset(&mut self) -> Result<(), EnvError> {
        let ctx = &mut self.ctx;
        ctx.episode_length = 0;
        ctx.robot.update();
        let root = ctx.robot.data.root_quat_w;
        if let Some(motion) = ctx.motion.as_mut() {
            motion.reset(&root);
        }
        self.reset_actions();
        self.observations.reset(&self.ctx)?;
        Ok(())
    }

    /// Clear the action manager and publish its rest targets.
    pub fn reset_actions(&mut self) {
        self.ctx.action_manager.reset();
        self.actions
            .publish(self.ctx.action_manager.processed_actions().to_vec());
    }

    pub fn step(&mut self) -> Result<(), EnvError> {
        let ctx = &mut self.ctx;
        ctx.episode_length += 1;
        ctx.robot.update();
        let t = ctx.elapsed();
        if let Some(motion) = ctx.motion.as_mut() {
            motion.update(t);
        }

        let obs = self.observations.compute(&self.ctx)?;
        let mut inputs = TensorMap::new();
        inputs.insert(OBS_INPUT.to_string(), obs);
        let outputs = self.backend.forward(&inputs)?;

        let raw = outputs
            .get(ACTIONS_OUTPUT)
            .or_else(|| outputs.values().next())
            .ok_or(EnvError::MissingAction)?;
        self.ctx.action_manager.process_action(raw)?;

        self.inference.publish(outputs);
        self.actions
            .publish(self.ctx.action_manager.processed_actions().to_vec());
        Ok(())
    }

    pub fn ctx(&self) -> &EnvContext {
        &self.ctx
    }

    pub fn step_dt(&self) -> f64 {
        self.ctx.step_dt
    }

    pub fn episode_length(&self) -> u64 {
        self.ctx.episode_length
    }

    pub fn observation_width(&self) -> usize {
        self.observations.width()
    }

    pub fn robot_data(&self) -> &RobotData {
        &self.ctx.robot.data
    }

    /// Processed joint targets, republished after every step.
    pub fn action_cell(&self) -> Arc<LatestCell<Vec<f32>>> {
        Arc::clone(&self.actions)
    }

    /// Full output map of the latest inference.
    pub fn inference_cell(&self) -> Arc<LatestCell<TensorMap>> {
        Arc::clone(&self.inference)
    }
}
