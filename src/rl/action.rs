// src/rl/action.rs
//
// Action managers turn the raw policy output into joint targets.

use thiserror::Error;

use crate::config::JointPositionActionConfig;

#[derive(Debug, Error, PartialEq)]
pub enum ActionError {
    #[error("action has {found} elements, expected {expected}")]
    DimensionMismatch { expected: usize, found: usize },
    #[error("invalid action configuration: {0}")]
    InvalidConfig(String),
}

/// Converts raw policy actions into processed joint targets (policy joint order).
pub trait ActionManager: Send {
    fn action_dim(&self) -> usize;

    /// Clear the last action; processed targets return to their rest value.
    fn reset(&mut self);

    fn process_action(&mut self, raw: &[f32]) -> Result<(), ActionError>;

    /// Joint targets derived from the last action.
    fn processed_actions(&self) -> &[f32];

    /// Last raw action as received from the policy.
    fn action(&self) -> &[f32];
}

/// `processed = clip(raw) * scale + offset`.
#[derive(Debug, Clone)]
pub struct JointPositionAction {
    scale: Vec<f32>,
    offset: Vec<f32>,
    clip: Option<[f32; 2]>,
    raw: Vec<f32>,
    processed: Vec<f32>,
}

impl JointPositionAction {
    pub fn new(scale: Vec<f32>, offset: Vec<f32>, clip: Option<[f32; 2]>) -> Result<Self, ActionError> {
        if scale.len() != offset.len() {
            return Err(ActionError::InvalidConfig(format!(
                "scale has {} entries, offset has {}",
                scale.len(),
                offset.len()
            )));
        }
        if let Some([lo, hi]) = clip {
            if !(lo <= hi) {
                return Err(ActionError::InvalidConfig(format!("clip min {lo} > max {hi}")));
            }
        }
        let n = offset.len();
        Ok(Self {
            scale,
            processed: offset.clone(),
            offset,
            clip,
            raw: vec![0.0; n],
        })
    }

    /// Build from deploy config; the offset falls back to the default pose.
    pub fn from_config(cfg: &JointPositionActionConfig, default_joint_pos: &[f32]) -> Result<Self, ActionError> {
        let n = default_joint_pos.len();
        let scale = cfg
            .scale
            .expand(n)
            .ok_or_else(|| ActionError::InvalidConfig(format!("scale must have {n} entries")))?;
        let offset = cfg
            .offset
            .clone()
            .unwrap_or_else(|| default_joint_pos.to_vec());
        Self::new(scale, offset, cfg.clip)
    }
}

impl ActionManager for JointPositionAction {
    fn action_dim(&self) -> usize {
        self.offset.len()
    }

    fn reset(&mut self) {
        self.raw.iter_mut().for_each(|a| *a = 0.0);
        self.processed.copy_from_slice(&self.offset);
    }

    fn process_action(&mut self, raw: &[f32]) -> Result<(), ActionError> {
        if raw.len() != self.action_dim() {
            return Err(ActionError::DimensionMismatch {
                expected: self.action_dim(),
                found: raw.len(),
            });
        }
        self.raw.copy_from_slice(raw);
        for (i, &a) in raw.iter().enumerate() {
            let a = match self.clip {
                Some([lo, hi]) => a.clamp(lo, hi),
                None => a,
            };
            self.processed[i] = a * self.scale[i] + self.offset[i];
        }
        Ok(())
    }

    fn processed_actions(&self) -> &[f32] {
        &self.processed
    }

    fn action(&self) -> &[f32] {
        &self.raw
    }
}
