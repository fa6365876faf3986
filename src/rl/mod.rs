// src/rl/mod.rs
//
// Policy execution environment.
//
// - env:          RlEnv orchestrator (reset/step) and the term-visible EnvContext
// - observation:  term registry, history buffers, clip/scale pipeline
// - terms:        built-in observation terms
// - action:       ActionManager seam and joint-position actions
// - inference:    InferenceBackend seam and the affine JSON backend
// - motion:       reference-motion interpolation
// - command:      fixed velocity command override

pub mod action;
pub mod command;
pub mod env;
pub mod inference;
pub mod motion;
pub mod observation;
pub mod terms;

pub use action::{ActionError, ActionManager, JointPositionAction};
pub use command::FixedCommand;
pub use env::{EnvContext, EnvError, RlEnv};
pub use inference::{InferenceBackend, InferenceError, LinearBackend, TensorMap};
pub use motion::{MotionError, MotionLoader, QuatOrder};
pub use observation::{ObservationError, ObservationManager, ObservationRegistry, TermParams};
