//! Experiment configuration and run status.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use uuid::Uuid;

use am_types::{config_error, AmResult};

use crate::trial::{ExperimentId, TrialBudget, TrialResult};

/// Which input columns the experiment relies on.
///
/// The label column is owned by the metric evaluator; setting it here only
/// asserts which column the evaluator must read.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ColumnInformation {
    #[serde(default)]
    pub label_column: Option<String>,
    /// Feature columns that must be present; empty means "whatever the
    /// trainer uses".
    #[serde(default)]
    pub feature_columns: Vec<String>,
}

impl ColumnInformation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_label(mut self, label_column: impl Into<String>) -> Self {
        self.label_column = Some(label_column.into());
        self
    }

    pub fn with_features<I, S>(mut self, features: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.feature_columns = features.into_iter().map(Into::into).collect();
        self
    }

    /// Resolve the label column against the one the evaluator reads.
    pub fn resolve_label<'a>(&self, evaluator_label: &'a str) -> AmResult<&'a str> {
        match self.label_column.as_deref() {
            Some(configured) if configured != evaluator_label => Err(config_error!(
                "label column '{}' does not match the metric's label column '{}'",
                configured,
                evaluator_label
            )),
            _ => Ok(evaluator_label),
        }
    }
}

/// What happens to trials still running when cancellation is requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CancellationPolicy {
    /// Let in-flight trials finish; keep those that reached scoring before
    /// the cancellation, discard the rest.
    #[default]
    DiscardUnscored,
    /// Discard every trial that had not been recorded when the cancellation
    /// was observed.
    DiscardInFlight,
}

/// Top-level configuration for an experiment run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentConfig {
    #[serde(default = "Uuid::new_v4")]
    pub id: ExperimentId,

    #[serde(default)]
    pub name: String,

    /// Maximum number of trials to dispatch. `None` = until exhausted.
    #[serde(default)]
    pub max_trials: Option<usize>,

    /// Wall-clock budget for the whole search.
    ///
    /// Checked between dispatches only; a running trial is never preempted,
    /// so the run can overrun the budget by up to one trial's duration.
    #[serde(default)]
    pub time_budget: Option<Duration>,

    /// How many trials may run concurrently.
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,

    #[serde(default)]
    pub cancellation_policy: CancellationPolicy,

    /// Resource hints forwarded with every trial.
    #[serde(default)]
    pub trial_budget: TrialBudget,

    #[serde(default)]
    pub columns: ColumnInformation,
}

fn default_parallelism() -> usize {
    1
}

impl ExperimentConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            max_trials: None,
            time_budget: None,
            parallelism: default_parallelism(),
            cancellation_policy: CancellationPolicy::default(),
            trial_budget: TrialBudget::default(),
            columns: ColumnInformation::default(),
        }
    }

    pub fn with_max_trials(mut self, n: usize) -> Self {
        self.max_trials = Some(n);
        self
    }

    pub fn with_time_budget(mut self, budget: Duration) -> Self {
        self.time_budget = Some(budget);
        self
    }

    pub fn with_parallelism(mut self, n: usize) -> Self {
        self.parallelism = n;
        self
    }

    pub fn with_cancellation_policy(mut self, policy: CancellationPolicy) -> Self {
        self.cancellation_policy = policy;
        self
    }

    pub fn with_trial_budget(mut self, budget: TrialBudget) -> Self {
        self.trial_budget = budget;
        self
    }

    pub fn with_columns(mut self, columns: ColumnInformation) -> Self {
        self.columns = columns;
        self
    }

    pub fn from_json_str(json: &str) -> AmResult<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> AmResult<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    pub fn validate(&self) -> AmResult<()> {
        if self.parallelism == 0 {
            return Err(config_error!("parallelism must be at least 1"));
        }
        if self.max_trials == Some(0) {
            return Err(config_error!("max_trials must be positive when set"));
        }
        if self.time_budget == Some(Duration::ZERO) {
            return Err(config_error!("time_budget must be positive when set"));
        }
        if self
            .columns
            .label_column
            .as_deref()
            .is_some_and(|label| label.trim().is_empty())
        {
            return Err(config_error!("label column name is empty"));
        }
        Ok(())
    }
}

/// Lifecycle state for an experiment run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExperimentState {
    Idle,
    Running,
    Completed,
    Cancelled,
    Failed,
}

impl ExperimentState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Failed)
    }
}

/// Why the search loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopReason {
    Exhausted,
    MaxTrials,
    TimeBudget,
    Cancelled,
}

/// Aggregate status of an experiment run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentStatus {
    pub id: ExperimentId,
    pub state: ExperimentState,
    pub trials_succeeded: usize,
    pub trials_failed: usize,
    pub trials_discarded: usize,
    pub best_trial_id: Option<usize>,
    pub best_metric: Option<f64>,
    pub stop_reason: Option<StopReason>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl ExperimentStatus {
    pub fn new(id: ExperimentId) -> Self {
        Self {
            id,
            state: ExperimentState::Idle,
            trials_succeeded: 0,
            trials_failed: 0,
            trials_discarded: 0,
            best_trial_id: None,
            best_metric: None,
            stop_reason: None,
            started_at: None,
            finished_at: None,
            error: None,
        }
    }

    pub fn mark_running(&mut self) {
        self.state = ExperimentState::Running;
        self.started_at = Some(Utc::now());
    }

    /// Terminal transition from the loop's stop reason.
    pub fn mark_stopped(&mut self, reason: StopReason) {
        self.state = match reason {
            StopReason::Cancelled => ExperimentState::Cancelled,
            _ => ExperimentState::Completed,
        };
        self.stop_reason = Some(reason);
        self.finished_at = Some(Utc::now());
    }

    pub fn mark_failed(&mut self, error: String) {
        self.state = ExperimentState::Failed;
        self.finished_at = Some(Utc::now());
        self.error = Some(error);
    }

    pub fn record_trial<M>(&mut self, result: &TrialResult<M>, is_best: bool) {
        if result.is_success() {
            self.trials_succeeded += 1;
        } else {
            self.trials_failed += 1;
        }
        if is_best {
            self.best_trial_id = Some(result.trial_id());
            self.best_metric = result.metric;
        }
    }

    pub fn trials_completed(&self) -> usize {
        self.trials_succeeded + self.trials_failed
    }
}
