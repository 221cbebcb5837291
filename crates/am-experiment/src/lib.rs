//! # am-experiment
//!
//! Trial search orchestration for AutoML experiments.
//!
//! Provides search space definitions, candidate generators (list, grid,
//! random, perturbation), trial value objects, best-trial selection, and the
//! [`Experiment`] loop that trains and scores candidates under a time budget,
//! a trial cap and cooperative cancellation.

mod config;
mod context;
mod experiment;
mod search;
mod selector;
mod trial;

pub use config::{
    CancellationPolicy, ColumnInformation, ExperimentConfig, ExperimentState, ExperimentStatus,
    StopReason,
};
pub use context::{
    CancellationToken, ChannelProgressSink, ExecutionContext, NoopProgress, ProgressSink,
    TrialProgress,
};
pub use experiment::{Experiment, ExperimentResult, ExperimentSummary, Model, ModelSink, Trainer};
pub use search::{
    CandidateGenerator, CandidateList, GridSearch, ParameterDef, ParameterKind, ParameterValue,
    Parameters, PerturbSearch, RandomSearch, SearchSpace, TrainerSpace, TrialCandidate,
    MAX_GRID_POINTS,
};
pub use selector::BestTrialSelector;
pub use trial::{ExperimentId, TrialBudget, TrialResult, TrialSettings, TrialStatus, TrialSummary};
