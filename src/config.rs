// src/config.rs
//
// Controller and per-policy configuration.
//
// Two YAML documents drive the controller:
// - the controller file (control period, safety limits, Passive/FixStand
//   parameters, the list of policy-backed modes);
// - one `params/deploy.yaml` per policy directory (step period, joint map,
//   PD gains, action scaling, the ordered observation terms, optional
//   reference motion).
//
// A small number of environment variables override controller settings:
//   - GAITCTL_CONTROL_DT  (f64, seconds)
//   - GAITCTL_LOG_DIR     (path; telemetry directory for every policy)
// Any variable that fails to parse is ignored with a warning.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::rl::motion::QuatOrder;
use crate::robot::{Button, DEFAULT_NUM_MOTORS};

/// Mode ids of the built-in states.
pub const PASSIVE_MODE: u32 = 1;
pub const FIX_STAND_MODE: u32 = 2;

/// Relative location of the deploy file inside a policy directory.
pub const DEPLOY_FILE: &str = "params/deploy.yaml";
/// Relative location of the exported policy weights.
pub const POLICY_FILE: &str = "exported/policy.json";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse '{path}': {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("config validation error in '{field}': {message}")]
    Validation { field: String, message: String },
}

impl ConfigError {
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        ConfigError::Validation {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// A two-button gesture: `held` is down while `trigger` is pressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chord {
    pub held: Button,
    pub trigger: Button,
}

impl Chord {
    pub const fn new(held: Button, trigger: Button) -> Self {
        Self { held, trigger }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetyConfig {
    /// Body tilt (radians) beyond which every mode drops to Passive.
    #[serde(default = "default_orientation_limit")]
    pub orientation_limit: f64,
    /// Emergency stop gesture.
    #[serde(default = "default_stop_chord")]
    pub stop_chord: Chord,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            orientation_limit: default_orientation_limit(),
            stop_chord: default_stop_chord(),
        }
    }
}

fn default_orientation_limit() -> f64 {
    2.0
}

fn default_stop_chord() -> Chord {
    Chord::new(Button::L2, Button::B)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PassiveConfig {
    /// Damping applied to every motor while passive.
    #[serde(default = "default_passive_kd")]
    pub kd: f32,
}

impl Default for PassiveConfig {
    fn default() -> Self {
        Self {
            kd: default_passive_kd(),
        }
    }
}

fn default_passive_kd() -> f32 {
    3.0
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixStandConfig {
    /// Target joint positions, in motor order.
    #[serde(default = "default_stand_pose")]
    pub target: Vec<f32>,
    #[serde(default = "default_stand_kp")]
    pub kp: f32,
    #[serde(default = "default_stand_kd")]
    pub kd: f32,
    /// Seconds to interpolate from the entry pose to `target`.
    #[serde(default = "default_stand_duration")]
    pub duration: f64,
    #[serde(default = "default_stand_chord")]
    pub chord: Chord,
}

impl Default for FixStandConfig {
    fn default() -> Self {
        Self {
            target: default_stand_pose(),
            kp: default_stand_kp(),
            kd: default_stand_kd(),
            duration: default_stand_duration(),
            chord: default_stand_chord(),
        }
    }
}

fn default_stand_pose() -> Vec<f32> {
    [0.0, 0.67, -1.3].repeat(4)
}

fn default_stand_kp() -> f32 {
    60.0
}

fn default_stand_kd() -> f32 {
    5.0
}

fn default_stand_duration() -> f64 {
    3.0
}

fn default_stand_chord() -> Chord {
    Chord::new(Button::L2, Button::A)
}

/// Constant velocity command that can replace the joystick command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixedCommandConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub lin_vel_x: f32,
    #[serde(default)]
    pub lin_vel_y: f32,
    #[serde(default)]
    pub ang_vel_z: f32,
    /// Seconds; 0 means until toggled off.
    #[serde(default)]
    pub duration: f32,
    #[serde(default = "default_fixed_command_chord")]
    pub chord: Chord,
}

impl Default for FixedCommandConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            lin_vel_x: 0.0,
            lin_vel_y: 0.0,
            ang_vel_z: 0.0,
            duration: 0.0,
            chord: default_fixed_command_chord(),
        }
    }
}

fn default_fixed_command_chord() -> Chord {
    Chord::new(Button::L2, Button::Y)
}

/// One policy-backed mode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyStateConfig {
    pub name: String,
    pub mode: u32,
    /// Gesture selecting this mode from FixStand or another policy.
    pub chord: Chord,
    /// `None` leaves the mode inert.
    #[serde(default)]
    pub policy_dir: Option<PathBuf>,
    #[serde(default)]
    pub logging: bool,
    #[serde(default = "default_logging_dt")]
    pub logging_dt: f64,
    #[serde(default)]
    pub fixed_command: FixedCommandConfig,
}

fn default_logging_dt() -> f64 {
    0.02
}

fn default_control_dt() -> f64 {
    0.001
}

fn default_num_motors() -> usize {
    DEFAULT_NUM_MOTORS
}

/// Top-level controller configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    #[serde(default = "default_control_dt")]
    pub control_dt: f64,
    #[serde(default = "default_num_motors")]
    pub num_motors: usize,
    #[serde(default)]
    pub safety: SafetyConfig,
    #[serde(default)]
    pub passive: PassiveConfig,
    #[serde(default)]
    pub fix_stand: FixStandConfig,
    #[serde(default)]
    pub policies: Vec<PolicyStateConfig>,
    /// Telemetry directory override; defaults to `<policy_dir>/logs`.
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
    /// Directory relative paths are resolved against.
    #[serde(skip)]
    pub base_dir: PathBuf,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            control_dt: default_control_dt(),
            num_motors: default_num_motors(),
            safety: SafetyConfig::default(),
            passive: PassiveConfig::default(),
            fix_stand: FixStandConfig::default(),
            policies: Vec::new(),
            log_dir: None,
            base_dir: PathBuf::from("."),
        }
    }
}

impl ControllerConfig {
    /// Load, apply environment overrides, and validate.
    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = read_file(path)?;
        let mut cfg = Self::parse(&contents, path)?;
        cfg.base_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        cfg.apply_env_overrides();
        cfg.validate()?;
        Ok(cfg)
    }

    /// Parse and validate without touching the environment.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let cfg = Self::parse(yaml, Path::new("<inline>"))?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn parse(yaml: &str, path: &Path) -> Result<Self, ConfigError> {
        serde_yaml::from_str(yaml).map_err(|e| ConfigError::Parse {
            path: path.display().to_string(),
            source: e,
        })
    }

    pub fn apply_env_overrides(&mut self) {
        if let Ok(raw) = env::var("GAITCTL_CONTROL_DT") {
            match raw.parse::<f64>() {
                Ok(v) if v > 0.0 => {
                    self.control_dt = v;
                    log::info!("[config] GAITCTL_CONTROL_DT = {v} (overrode file)");
                }
                _ => log::warn!(
                    "[config] could not parse GAITCTL_CONTROL_DT = {:?} as positive f64; using {}",
                    raw,
                    self.control_dt
                ),
            }
        }
        if let Ok(raw) = env::var("GAITCTL_LOG_DIR") {
            if raw.trim().is_empty() {
                log::warn!("[config] GAITCTL_LOG_DIR is empty; ignoring");
            } else {
                log::info!("[config] GAITCTL_LOG_DIR = {raw} (overrode file)");
                self.log_dir = Some(PathBuf::from(raw));
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.control_dt.is_finite() && self.control_dt > 0.0) {
            return Err(ConfigError::validation("control_dt", "must be > 0"));
        }
        if self.num_motors == 0 {
            return Err(ConfigError::validation("num_motors", "must be >= 1"));
        }
        if !(self.safety.orientation_limit > 0.0) {
            return Err(ConfigError::validation(
                "safety.orientation_limit",
                "must be > 0",
            ));
        }
        if self.fix_stand.target.len() != self.num_motors {
            return Err(ConfigError::validation(
                "fix_stand.target",
                format!(
                    "has {} entries but num_motors is {}",
                    self.fix_stand.target.len(),
                    self.num_motors
                ),
            ));
        }
        if !(self.fix_stand.duration > 0.0) {
            return Err(ConfigError::validation("fix_stand.duration", "must be > 0"));
        }
        for (i, p) in self.policies.iter().enumerate() {
            if p.name.trim().is_empty() {
                return Err(ConfigError::validation(
                    format!("policies[{i}].name"),
                    "cannot be empty",
                ));
            }
            if p.logging && !(p.logging_dt > 0.0) {
                return Err(ConfigError::validation(
                    format!("policies[{i}].logging_dt"),
                    "must be > 0 when logging is enabled",
                ));
            }
            if p.fixed_command.duration < 0.0 {
                return Err(ConfigError::validation(
                    format!("policies[{i}].fixed_command.duration"),
                    "must be >= 0",
                ));
            }
        }
        Ok(())
    }

    /// Resolve a path from the config file against `base_dir`.
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_dir.join(path)
        }
    }
}

/// Hex SHA-256 of a config document, printed in the startup line.
pub fn config_digest(contents: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(contents.as_bytes());
    format!("{:x}", hasher.finalize())
}

pub fn read_file(path: &Path) -> Result<String, ConfigError> {
    fs::read_to_string(path).map_err(|e| ConfigError::Io {
        path: path.display().to_string(),
        source: e,
    })
}

/// Scale applied to an observation term or an action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ScaleSpec {
    Uniform(f32),
    PerElement(Vec<f32>),
}

impl ScaleSpec {
    /// Expand to `width` factors; per-element scales must match exactly.
    pub fn expand(&self, width: usize) -> Option<Vec<f32>> {
        match self {
            ScaleSpec::Uniform(s) => Some(vec![*s; width]),
            ScaleSpec::PerElement(v) if v.len() == width => Some(v.clone()),
            ScaleSpec::PerElement(_) => None,
        }
    }
}

impl Default for ScaleSpec {
    fn default() -> Self {
        ScaleSpec::Uniform(1.0)
    }
}

fn default_history_length() -> usize {
    1
}

/// Configuration of one observation term.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservationTermConfig {
    #[serde(default = "default_history_length")]
    pub history_length: usize,
    #[serde(default)]
    pub scale: Option<ScaleSpec>,
    #[serde(default)]
    pub clip: Option<[f32; 2]>,
    /// Term-specific parameters, passed through to the term function.
    #[serde(default)]
    pub params: serde_yaml::Value,
}

impl Default for ObservationTermConfig {
    fn default() -> Self {
        Self {
            history_length: default_history_length(),
            scale: None,
            clip: None,
            params: serde_yaml::Value::Null,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JointPositionActionConfig {
    #[serde(default)]
    pub scale: ScaleSpec,
    /// Defaults to the default joint pose.
    #[serde(default)]
    pub offset: Option<Vec<f32>>,
    /// Bounds applied to the raw action before scaling.
    #[serde(default)]
    pub clip: Option<[f32; 2]>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ActionsConfig {
    #[serde(rename = "JointPositionAction", default)]
    pub joint_position: JointPositionActionConfig,
}

/// `[min, max]` per velocity-command axis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VelocityRanges {
    pub lin_vel_x: [f32; 2],
    pub lin_vel_y: [f32; 2],
    pub ang_vel_z: [f32; 2],
}

impl Default for VelocityRanges {
    fn default() -> Self {
        Self {
            lin_vel_x: [-1.0, 1.0],
            lin_vel_y: [-0.5, 0.5],
            ang_vel_z: [-1.0, 1.0],
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BaseVelocityConfig {
    #[serde(default)]
    pub ranges: VelocityRanges,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommandsConfig {
    #[serde(default)]
    pub base_velocity: BaseVelocityConfig,
}

fn default_motion_fps() -> f64 {
    50.0
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MotionConfig {
    /// CSV file, relative to the policy directory.
    pub file: PathBuf,
    #[serde(default = "default_motion_fps")]
    pub fps: f64,
    #[serde(default)]
    pub quat_order: QuatOrder,
}

/// Per-policy deployment parameters (`params/deploy.yaml`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployConfig {
    pub step_dt: f64,
    pub joint_ids_map: Vec<usize>,
    pub default_joint_pos: Vec<f32>,
    pub stiffness: Vec<f32>,
    pub damping: Vec<f32>,
    #[serde(default)]
    pub actions: ActionsConfig,
    /// Observation terms in evaluation order.
    #[serde(default)]
    pub observations: serde_yaml::Mapping,
    #[serde(default)]
    pub commands: CommandsConfig,
    #[serde(default)]
    pub motion: Option<MotionConfig>,
}

impl DeployConfig {
    /// Load `<policy_dir>/params/deploy.yaml`.
    pub fn from_policy_dir(policy_dir: &Path) -> Result<Self, ConfigError> {
        let path = policy_dir.join(DEPLOY_FILE);
        let contents = read_file(&path)?;
        let cfg: DeployConfig = serde_yaml::from_str(&contents).map_err(|e| ConfigError::Parse {
            path: path.display().to_string(),
            source: e,
        })?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let cfg: DeployConfig = serde_yaml::from_str(yaml).map_err(|e| ConfigError::Parse {
            path: "<inline>".to_string(),
            source: e,
        })?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn num_joints(&self) -> usize {
        self.joint_ids_map.len()
    }

    /// Observation terms in file order.
    pub fn observation_terms(&self) -> Result<Vec<(String, ObservationTermConfig)>, ConfigError> {
        let mut terms = Vec::with_capacity(self.observations.len());
        for (key, value) in &self.observations {
            let name = key
                .as_str()
                .ok_or_else(|| ConfigError::validation("observations", "term names must be strings"))?
                .to_string();
            let term: ObservationTermConfig = if value.is_null() {
                ObservationTermConfig::default()
            } else {
                serde_yaml::from_value(value.clone()).map_err(|e| {
                    ConfigError::validation(format!("observations.{name}"), e.to_string())
                })?
            };
            terms.push((name, term));
        }
        Ok(terms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.step_dt.is_finite() && self.step_dt > 0.0) {
            return Err(ConfigError::validation("step_dt", "must be > 0"));
        }
        let n = self.num_joints();
        if n == 0 {
            return Err(ConfigError::validation("joint_ids_map", "cannot be empty"));
        }
        for (field, len) in [
            ("default_joint_pos", self.default_joint_pos.len()),
            ("stiffness", self.stiffness.len()),
            ("damping", self.damping.len()),
        ] {
            if len != n {
                return Err(ConfigError::validation(
                    field,
                    format!("has {len} entries but joint_ids_map has {n}"),
                ));
            }
        }
        if let Some(offset) = &self.actions.joint_position.offset {
            if offset.len() != n {
                return Err(ConfigError::validation(
                    "actions.JointPositionAction.offset",
                    format!("has {} entries but joint_ids_map has {n}", offset.len()),
                ));
            }
        }
        if self.actions.joint_position.scale.expand(n).is_none() {
            return Err(ConfigError::validation(
                "actions.JointPositionAction.scale",
                format!("per-joint scale must have {n} entries"),
            ));
        }
        check_clip("actions.JointPositionAction.clip", self.actions.joint_position.clip)?;

        for (name, term) in self.observation_terms()? {
            if term.history_length == 0 {
                return Err(ConfigError::validation(
                    format!("observations.{name}.history_length"),
                    "must be >= 1",
                ));
            }
            check_clip(&format!("observations.{name}.clip"), term.clip)?;
        }

        if let Some(motion) = &self.motion {
            if !(motion.fps.is_finite() && motion.fps > 0.0) {
                return Err(ConfigError::validation("motion.fps", "must be > 0"));
            }
        }
        Ok(())
    }
}

fn check_clip(field: &str, clip: Option<[f32; 2]>) -> Result<(), ConfigError> {
    if let Some([lo, hi]) = clip {
        if !(lo <= hi) {
            return Err(ConfigError::validation(
                field,
                format!("min {lo} is greater than max {hi}"),
            ));
        }
    }
    Ok(())
}
