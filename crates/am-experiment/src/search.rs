//! Search space definitions and candidate generators.

use rand::seq::SliceRandom;
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};

use am_types::{config_error, AmResult};

/// A single parameter dimension in the search space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterDef {
    /// Hyperparameter name (e.g. "learning_rate").
    pub name: String,
    /// The kind of search range.
    pub kind: ParameterKind,
}

/// Describes how a parameter is sampled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ParameterKind {
    /// Continuous uniform range [low, high].
    FloatRange { low: f64, high: f64 },
    /// Integer range [low, high] inclusive.
    IntRange { low: i64, high: i64 },
    /// Log-uniform range (sampled in log-space then exponentiated).
    LogUniform { low: f64, high: f64 },
    /// Categorical choices.
    Choice { values: Vec<serde_json::Value> },
}

/// A concrete parameter value produced by a search strategy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParameterValue {
    // Int before Float so integral JSON numbers round-trip as Int.
    Int(i64),
    Float(f64),
    Json(serde_json::Value),
}

impl ParameterValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float(v) => Some(*v),
            Self::Int(v) => Some(*v as f64),
            Self::Json(v) => v.as_f64(),
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            Self::Json(v) => v.as_i64(),
            Self::Float(_) => None,
        }
    }
}

impl std::fmt::Display for ParameterValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Float(v) => write!(f, "{v}"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Json(v) => write!(f, "{v}"),
        }
    }
}

/// Hyperparameter assignment for one trial.
pub type Parameters = HashMap<String, ParameterValue>;

/// The full search space: an ordered list of parameter definitions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchSpace {
    pub parameters: Vec<ParameterDef>,
}

impl SearchSpace {
    pub fn new() -> Self {
        Self {
            parameters: Vec::new(),
        }
    }

    pub fn add_float(mut self, name: impl Into<String>, low: f64, high: f64) -> Self {
        self.parameters.push(ParameterDef {
            name: name.into(),
            kind: ParameterKind::FloatRange { low, high },
        });
        self
    }

    pub fn add_int(mut self, name: impl Into<String>, low: i64, high: i64) -> Self {
        self.parameters.push(ParameterDef {
            name: name.into(),
            kind: ParameterKind::IntRange { low, high },
        });
        self
    }

    pub fn add_log_uniform(mut self, name: impl Into<String>, low: f64, high: f64) -> Self {
        self.parameters.push(ParameterDef {
            name: name.into(),
            kind: ParameterKind::LogUniform { low, high },
        });
        self
    }

    pub fn add_choice(mut self, name: impl Into<String>, values: Vec<serde_json::Value>) -> Self {
        self.parameters.push(ParameterDef {
            name: name.into(),
            kind: ParameterKind::Choice { values },
        });
        self
    }

    /// Total number of grid points (returns `None` if any parameter is
    /// continuous without a natural grid, or the count overflows).
    pub fn grid_size(&self) -> Option<usize> {
        self.grid_points(None)
    }

    /// Grid points with `float_steps` points per continuous dimension.
    /// `None` when the count does not fit in `usize`.
    fn grid_points(&self, float_steps: Option<usize>) -> Option<usize> {
        let mut total: usize = 1;
        for param in &self.parameters {
            let dim_size = match &param.kind {
                ParameterKind::IntRange { low, high } => {
                    let width = high.checked_sub(*low)?.checked_add(1)?;
                    usize::try_from(width).ok()?
                }
                ParameterKind::Choice { values } => values.len(),
                ParameterKind::FloatRange { .. } | ParameterKind::LogUniform { .. } => {
                    float_steps?.max(2)
                }
            };
            total = total.checked_mul(dim_size)?;
        }
        Some(total)
    }

    /// Reject ranges that cannot be sampled.
    pub fn validate(&self) -> AmResult<()> {
        for param in &self.parameters {
            let ok = match &param.kind {
                ParameterKind::FloatRange { low, high } => {
                    low <= high && (high - low).is_finite()
                }
                ParameterKind::IntRange { low, high } => low <= high,
                ParameterKind::LogUniform { low, high } => {
                    *low > 0.0 && high.is_finite() && low <= high
                }
                ParameterKind::Choice { values } => !values.is_empty(),
            };
            if !ok {
                return Err(config_error!(
                    "parameter {} has an invalid range: {:?}",
                    param.name,
                    param.kind
                ));
            }
        }
        Ok(())
    }
}

impl Default for SearchSpace {
    fn default() -> Self {
        Self::new()
    }
}

/// The hyperparameter space of one trainer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainerSpace {
    /// Trainer name understood by the [`crate::Trainer`] implementation.
    pub trainer: String,
    pub space: SearchSpace,
}

impl TrainerSpace {
    pub fn new(trainer: impl Into<String>, space: SearchSpace) -> Self {
        Self {
            trainer: trainer.into(),
            space,
        }
    }
}

fn validate_spaces(spaces: &[TrainerSpace]) -> AmResult<()> {
    if spaces.is_empty() {
        return Err(config_error!("search needs at least one trainer space"));
    }
    for space in spaces {
        space.space.validate()?;
    }
    Ok(())
}

/// One configuration proposed by a generator: which trainer, with which
/// hyperparameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialCandidate {
    pub trainer: String,
    pub parameters: Parameters,
}

impl TrialCandidate {
    pub fn new(trainer: impl Into<String>, parameters: Parameters) -> Self {
        Self {
            trainer: trainer.into(),
            parameters,
        }
    }
}

// ---------------------------------------------------------------------------
// Candidate generators
// ---------------------------------------------------------------------------

/// Produces the configurations an experiment tries.
pub trait CandidateGenerator: Send {
    /// The next configuration, or `None` once the search space is exhausted.
    fn next_candidate(&mut self) -> Option<TrialCandidate>;

    /// Report a finished trial so adaptive generators can learn. `score` is
    /// sign-normalized: higher is always better.
    fn report(&mut self, _candidate: &TrialCandidate, _score: f64) {}

    /// Human-readable generator name.
    fn name(&self) -> &str;
}

// ---- Fixed list ----

/// Replays a fixed list of candidates in order.
#[derive(Debug, Clone, Default)]
pub struct CandidateList {
    queue: VecDeque<TrialCandidate>,
}

impl CandidateList {
    pub fn new(candidates: impl IntoIterator<Item = TrialCandidate>) -> Self {
        Self {
            queue: candidates.into_iter().collect(),
        }
    }

    pub fn remaining(&self) -> usize {
        self.queue.len()
    }
}

impl CandidateGenerator for CandidateList {
    fn next_candidate(&mut self) -> Option<TrialCandidate> {
        self.queue.pop_front()
    }

    fn name(&self) -> &str {
        "list"
    }
}

// ---- Grid search ----

/// Largest grid [`GridSearch`] will materialize.
pub const MAX_GRID_POINTS: usize = 1_000_000;

/// Exhaustive grid search over every trainer's discrete combinations.
#[derive(Debug, Clone)]
pub struct GridSearch {
    cursor: usize,
    combos: Vec<TrialCandidate>,
}

impl GridSearch {
    /// `float_steps` is the number of points per continuous dimension.
    ///
    /// Grids larger than [`MAX_GRID_POINTS`] in total are rejected.
    pub fn new(spaces: Vec<TrainerSpace>, float_steps: usize) -> AmResult<Self> {
        validate_spaces(&spaces)?;
        let total = spaces.iter().try_fold(0usize, |total, trainer| {
            trainer
                .space
                .grid_points(Some(float_steps))
                .and_then(|points| total.checked_add(points))
        });
        match total {
            Some(total) if total <= MAX_GRID_POINTS => {}
            _ => {
                return Err(config_error!(
                    "grid has more than {} points",
                    MAX_GRID_POINTS
                ))
            }
        }
        let combos = spaces
            .iter()
            .flat_map(|trainer| {
                Self::build_grid(&trainer.space, float_steps)
                    .into_iter()
                    .map(move |parameters| TrialCandidate::new(trainer.trainer.clone(), parameters))
            })
            .collect();
        Ok(Self { cursor: 0, combos })
    }

    pub fn len(&self) -> usize {
        self.combos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.combos.is_empty()
    }

    fn build_grid(space: &SearchSpace, float_steps: usize) -> Vec<Parameters> {
        let mut axes: Vec<Vec<(&str, ParameterValue)>> = Vec::new();

        for param in &space.parameters {
            let values: Vec<ParameterValue> = match &param.kind {
                ParameterKind::FloatRange { low, high } => {
                    let steps = float_steps.max(2);
                    (0..steps)
                        .map(|i| {
                            let t = i as f64 / (steps - 1) as f64;
                            ParameterValue::Float(low + t * (high - low))
                        })
                        .collect()
                }
                ParameterKind::IntRange { low, high } => {
                    (*low..=*high).map(ParameterValue::Int).collect()
                }
                ParameterKind::LogUniform { low, high } => {
                    let steps = float_steps.max(2);
                    let log_low = low.ln();
                    let log_high = high.ln();
                    (0..steps)
                        .map(|i| {
                            let t = i as f64 / (steps - 1) as f64;
                            ParameterValue::Float((log_low + t * (log_high - log_low)).exp())
                        })
                        .collect()
                }
                ParameterKind::Choice { values } => values
                    .iter()
                    .map(|v| ParameterValue::Json(v.clone()))
                    .collect(),
            };
            axes.push(
                values
                    .into_iter()
                    .map(|v| (param.name.as_str(), v))
                    .collect(),
            );
        }

        // Cartesian product
        let mut result: Vec<Parameters> = vec![HashMap::new()];
        for axis in &axes {
            let mut next = Vec::with_capacity(result.len() * axis.len());
            for existing in &result {
                for (name, value) in axis {
                    let mut combo = existing.clone();
                    combo.insert(name.to_string(), value.clone());
                    next.push(combo);
                }
            }
            result = next;
        }

        result
    }
}

impl CandidateGenerator for GridSearch {
    fn next_candidate(&mut self) -> Option<TrialCandidate> {
        let candidate = self.combos.get(self.cursor).cloned();
        if candidate.is_some() {
            self.cursor += 1;
        }
        candidate
    }

    fn name(&self) -> &str {
        "grid"
    }
}

// ---- Random search ----

fn sample_space(space: &SearchSpace, rng: &mut ChaCha8Rng) -> Parameters {
    let mut params = HashMap::new();

    for param in &space.parameters {
        let value = match &param.kind {
            ParameterKind::FloatRange { low, high } => {
                ParameterValue::Float(rng.gen_range(*low..=*high))
            }
            ParameterKind::IntRange { low, high } => {
                ParameterValue::Int(rng.gen_range(*low..=*high))
            }
            ParameterKind::LogUniform { low, high } => {
                let log_low = low.ln();
                let log_high = high.ln();
                let log_val: f64 = rng.gen_range(log_low..=log_high);
                ParameterValue::Float(log_val.exp())
            }
            ParameterKind::Choice { values } => match values.choose(rng) {
                Some(value) => ParameterValue::Json(value.clone()),
                None => continue,
            },
        };
        params.insert(param.name.clone(), value);
    }

    params
}

fn sample_candidate(spaces: &[TrainerSpace], rng: &mut ChaCha8Rng) -> Option<TrialCandidate> {
    let trainer = spaces.choose(rng)?;
    let parameters = sample_space(&trainer.space, rng);
    Some(TrialCandidate::new(trainer.trainer.clone(), parameters))
}

/// Independent random sampling: a uniformly chosen trainer, then each of
/// its parameters. Never exhausts.
#[derive(Debug, Clone)]
pub struct RandomSearch {
    spaces: Vec<TrainerSpace>,
    rng: ChaCha8Rng,
}

impl RandomSearch {
    pub fn new(spaces: Vec<TrainerSpace>, rng: ChaCha8Rng) -> AmResult<Self> {
        validate_spaces(&spaces)?;
        Ok(Self { spaces, rng })
    }
}

impl CandidateGenerator for RandomSearch {
    fn next_candidate(&mut self) -> Option<TrialCandidate> {
        sample_candidate(&self.spaces, &mut self.rng)
    }

    fn name(&self) -> &str {
        "random"
    }
}

// ---- Perturbation search ----

/// Explore/exploit search.
///
/// With probability `exploration_weight` (and always before the first
/// report) a fresh random candidate is drawn; otherwise the best reported
/// candidate is perturbed within its trainer's space.
#[derive(Debug, Clone)]
pub struct PerturbSearch {
    spaces: Vec<TrainerSpace>,
    rng: ChaCha8Rng,
    best: Option<(TrialCandidate, f64)>,
    exploration_weight: f64,
}

impl PerturbSearch {
    pub fn new(
        spaces: Vec<TrainerSpace>,
        exploration_weight: f64,
        rng: ChaCha8Rng,
    ) -> AmResult<Self> {
        validate_spaces(&spaces)?;
        if !(0.0..=1.0).contains(&exploration_weight) {
            return Err(config_error!(
                "exploration weight must be within [0, 1], got {exploration_weight}"
            ));
        }
        Ok(Self {
            spaces,
            rng,
            best: None,
            exploration_weight,
        })
    }

    /// Best candidate reported so far and its normalized score.
    pub fn best(&self) -> Option<&(TrialCandidate, f64)> {
        self.best.as_ref()
    }

    fn explore(&mut self) -> Option<TrialCandidate> {
        sample_candidate(&self.spaces, &mut self.rng)
    }

    /// Perturb the best-known point.
    fn exploit(&mut self, base: &TrialCandidate) -> Option<TrialCandidate> {
        let space = match self.spaces.iter().find(|s| s.trainer == base.trainer) {
            Some(space) => space.space.clone(),
            None => return self.explore(),
        };

        let rng = &mut self.rng;
        let mut perturbed = HashMap::new();

        for param in &space.parameters {
            let base_val = base.parameters.get(&param.name);
            let value = match (&param.kind, base_val) {
                (ParameterKind::FloatRange { low, high }, Some(ParameterValue::Float(v))) => {
                    let range = high - low;
                    let noise = rng.gen_range(-0.1..0.1) * range;
                    ParameterValue::Float((v + noise).clamp(*low, *high))
                }
                (ParameterKind::IntRange { low, high }, Some(ParameterValue::Int(v))) => {
                    let delta: i64 = rng.gen_range(-2..=2);
                    ParameterValue::Int((v + delta).clamp(*low, *high))
                }
                (ParameterKind::LogUniform { low, high }, Some(ParameterValue::Float(v))) => {
                    let log_v = v.ln();
                    let log_range = high.ln() - low.ln();
                    let noise = rng.gen_range(-0.1..0.1) * log_range;
                    ParameterValue::Float((log_v + noise).exp().clamp(*low, *high))
                }
                _ => {
                    // Fall back to random for choices or missing base
                    let single = SearchSpace {
                        parameters: vec![param.clone()],
                    };
                    match sample_space(&single, rng).remove(&param.name) {
                        Some(value) => value,
                        None => continue,
                    }
                }
            };
            perturbed.insert(param.name.clone(), value);
        }

        Some(TrialCandidate::new(base.trainer.clone(), perturbed))
    }
}

impl CandidateGenerator for PerturbSearch {
    fn next_candidate(&mut self) -> Option<TrialCandidate> {
        let explore = self.rng.gen::<f64>() < self.exploration_weight;
        match self.best.clone() {
            Some((base, _)) if !explore => self.exploit(&base),
            _ => self.explore(),
        }
    }

    fn report(&mut self, candidate: &TrialCandidate, score: f64) {
        if !score.is_finite() {
            return;
        }
        let improves = match &self.best {
            None => true,
            Some((_, best)) => score > *best,
        };
        if improves {
            self.best = Some((candidate.clone(), score));
        }
    }

    fn name(&self) -> &str {
        "perturb"
    }
}
