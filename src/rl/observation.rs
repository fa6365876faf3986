// src/rl/observation.rs
//
// Observation term pipeline.
//
// Terms are looked up by name in an explicit registry built during startup
// composition. Each configured term keeps a FIFO of its last `history_length`
// raw samples; `compute` emits every buffered sample oldest-first, clipped and
// then scaled, and concatenates across terms in configuration order.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::config::ObservationTermConfig;
use crate::rl::env::EnvContext;

/// Term-specific parameters from the deploy file (`observations.<name>.params`).
pub type TermParams = serde_yaml::Value;

/// Pure function of the environment producing one raw sample.
pub type TermFn = Arc<dyn Fn(&EnvContext, &TermParams) -> Vec<f32> + Send + Sync>;

#[derive(Debug, Error, PartialEq)]
pub enum ObservationError {
    #[error("observation term '{0}' is not registered")]
    UnregisteredTerm(String),
    #[error("observation term '{term}': scale has {found} entries, term width is {expected}")]
    ScaleLength {
        term: String,
        expected: usize,
        found: usize,
    },
    #[error("observation term '{term}': clip min {min} is greater than max {max}")]
    InvalidClip { term: String, min: f32, max: f32 },
    #[error("observation term '{0}': history_length must be >= 1")]
    ZeroHistory(String),
    #[error("observation term '{term}' changed width from {expected} to {found}")]
    WidthChanged {
        term: String,
        expected: usize,
        found: usize,
    },
}

/// Name → term function table.
#[derive(Clone, Default)]
pub struct ObservationRegistry {
    terms: BTreeMap<String, TermFn>,
}

impl fmt::Debug for ObservationRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObservationRegistry")
            .field("terms", &self.terms.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ObservationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-populated with the terms in [`crate::rl::terms`].
    pub fn with_builtin_terms() -> Self {
        let mut registry = Self::new();
        crate::rl::terms::register_builtin(&mut registry);
        registry
    }

    /// Add or replace a term. Returns true if a term of that name was replaced.
    pub fn register<F>(&mut self, name: &str, func: F) -> bool
    where
        F: Fn(&EnvContext, &TermParams) -> Vec<f32> + Send + Sync + 'static,
    {
        self.terms.insert(name.to_string(), Arc::new(func)).is_some()
    }

    pub fn get(&self, name: &str) -> Option<&TermFn> {
        self.terms.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.terms.contains_key(name)
    }
}

/// One configured term with its history buffer.
pub struct ObservationTerm {
    name: String,
    func: TermFn,
    params: TermParams,
    clip: Option<[f32; 2]>,
    scale: Option<Vec<f32>>,
    history_length: usize,
    width: usize,
    history: VecDeque<Vec<f32>>,
}

impl fmt::Debug for ObservationTerm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObservationTerm")
            .field("name", &self.name)
            .field("width", &self.width)
            .field("history_length", &self.history_length)
            .field("clip", &self.clip)
            .field("scale", &self.scale)
            .finish()
    }
}

impl ObservationTerm {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn history_length(&self) -> usize {
        self.history_length
    }

    fn sample(&self, ctx: &EnvContext) -> Result<Vec<f32>, ObservationError> {
        let v = (self.func)(ctx, &self.params);
        if v.len() != self.width {
            return Err(ObservationError::WidthChanged {
                term: self.name.clone(),
                expected: self.width,
                found: v.len(),
            });
        }
        Ok(v)
    }

    fn fill(&mut self, sample: Vec<f32>) {
        self.history.clear();
        for _ in 1..self.history_length {
            self.history.push_back(sample.clone());
        }
        self.history.push_back(sample);
    }

    fn push(&mut self, sample: Vec<f32>) {
        self.history.push_back(sample);
        while self.history.len() > self.history_length {
            self.history.pop_front();
        }
    }

    fn extend_processed(&self, out: &mut Vec<f32>) {
        for sample in &self.history {
            for (i, &x) in sample.iter().enumerate() {
                let x = match self.clip {
                    Some([lo, hi]) => x.clamp(lo, hi),
                    None => x,
                };
                let x = match &self.scale {
                    Some(s) => x * s[i],
                    None => x,
                };
                out.push(x);
            }
        }
    }
}

/// Ordered set of terms producing the flat observation vector.
#[derive(Debug)]
pub struct ObservationManager {
    terms: Vec<ObservationTerm>,
    width: usize,
}

impl ObservationManager {
    /// Resolve every configured term and learn its width from one evaluation.
    pub fn new(
        terms_cfg: &[(String, ObservationTermConfig)],
        registry: &ObservationRegistry,
        ctx: &EnvContext,
    ) -> Result<Self, ObservationError> {
        let mut terms = Vec::with_capacity(terms_cfg.len());
        for (name, cfg) in terms_cfg {
            let func = registry
                .get(name)
                .cloned()
                .ok_or_else(|| ObservationError::UnregisteredTerm(name.clone()))?;
            if cfg.history_length == 0 {
                return Err(ObservationError::ZeroHistory(name.clone()));
            }
            if let Some([lo, hi]) = cfg.clip {
                if !(lo <= hi) {
                    return Err(ObservationError::InvalidClip {
                        term: name.clone(),
                        min: lo,
                        max: hi,
                    });
                }
            }

            let first = func(ctx, &cfg.params);
            let width = first.len();
            let scale = match &cfg.scale {
                Some(spec) => Some(spec.expand(width).ok_or_else(|| ObservationError::ScaleLength {
                    term: name.clone(),
                    expected: width,
                    found: match spec {
                        crate::config::ScaleSpec::PerElement(v) => v.len(),
                        crate::config::ScaleSpec::Uniform(_) => 1,
                    },
                })?),
                None => None,
            };

            let mut term = ObservationTerm {
                name: name.clone(),
                func,
                params: cfg.params.clone(),
                clip: cfg.clip,
                scale,
                history_length: cfg.history_length,
                width,
                history: VecDeque::with_capacity(cfg.history_length + 1),
            };
            term.fill(first);
            log::debug!(
                "[obs] term '{}' width={} history={}",
                term.name,
                term.width,
                term.history_length
            );
            terms.push(term);
        }
        let width = terms.iter().map(|t| t.width * t.history_length).sum();
        Ok(Self { terms, width })
    }

    /// Total output width: sum of `history_length * width` over terms.
    pub fn width(&self) -> usize {
        self.width
    }

    pub fn terms(&self) -> &[ObservationTerm] {
        &self.terms
    }

    /// Prefill every history with copies of a fresh sample.
    pub fn reset(&mut self, ctx: &EnvContext) -> Result<(), ObservationError> {
        for term in &mut self.terms {
            let sample = term.sample(ctx)?;
            term.fill(sample);
        }
        Ok(())
    }

    pub fn compute(&mut self, ctx: &EnvContext) -> Result<Vec<f32>, ObservationError> {
        let mut out = Vec::with_capacity(self.width);
        for term in &mut self.terms {
            let sample = term.sample(ctx)?;
            term.push(sample);
            term.extend_processed(&mut out);
        }
        Ok(out)
    }
}
