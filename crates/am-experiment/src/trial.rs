//! Trial settings and results.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use am_types::TrialError;

use crate::search::{ParameterValue, Parameters, TrialCandidate};

/// Unique experiment run identifier.
pub type ExperimentId = Uuid;

/// Resource hints a trainer should honour for a single trial.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrialBudget {
    /// Wall-clock limit for training.
    pub time_limit: Option<Duration>,
    /// Cap on training iterations / epochs.
    pub max_iterations: Option<usize>,
}

/// The fixed configuration of one trial. Built by the experiment when the
/// trial is dispatched and never modified afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialSettings {
    pub trial_id: usize,
    pub experiment_id: ExperimentId,
    pub candidate: TrialCandidate,
    pub budget: TrialBudget,
    pub created_at: DateTime<Utc>,
}

impl TrialSettings {
    pub fn new(
        experiment_id: ExperimentId,
        trial_id: usize,
        candidate: TrialCandidate,
        budget: TrialBudget,
    ) -> Self {
        Self {
            trial_id,
            experiment_id,
            candidate,
            budget,
            created_at: Utc::now(),
        }
    }

    pub fn trainer(&self) -> &str {
        &self.candidate.trainer
    }

    pub fn parameters(&self) -> &Parameters {
        &self.candidate.parameters
    }

    pub fn parameter(&self, name: &str) -> Option<&ParameterValue> {
        self.candidate.parameters.get(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrialStatus {
    Succeeded,
    Failed,
}

/// Outcome of a single trial.
///
/// A failed trial has no metric and no model; its metric is never read as
/// zero. The model handle is shared so the best tracker and the result list
/// can both refer to it.
pub struct TrialResult<M> {
    pub settings: TrialSettings,
    pub model: Option<Arc<M>>,
    pub metric: Option<f64>,
    /// Elapsed training + scoring time in milliseconds.
    pub duration_ms: f64,
    pub status: TrialStatus,
    pub error: Option<TrialError>,
    pub finished_at: DateTime<Utc>,
}

impl<M> TrialResult<M> {
    /// A scored trial. A non-finite metric turns it into a failure.
    pub fn scored(settings: TrialSettings, model: M, metric: f64, duration_ms: f64) -> Self {
        if !metric.is_finite() {
            return Self::failed(settings, TrialError::NonFiniteMetric(metric), duration_ms);
        }
        Self {
            settings,
            model: Some(Arc::new(model)),
            metric: Some(metric),
            duration_ms: duration_ms.max(0.0),
            status: TrialStatus::Succeeded,
            error: None,
            finished_at: Utc::now(),
        }
    }

    pub fn failed(settings: TrialSettings, error: TrialError, duration_ms: f64) -> Self {
        Self {
            settings,
            model: None,
            metric: None,
            duration_ms: duration_ms.max(0.0),
            status: TrialStatus::Failed,
            error: Some(error),
            finished_at: Utc::now(),
        }
    }

    pub fn trial_id(&self) -> usize {
        self.settings.trial_id
    }

    pub fn is_success(&self) -> bool {
        self.status == TrialStatus::Succeeded
    }

    /// Metric value, only for successful trials with a finite metric.
    pub fn finite_metric(&self) -> Option<f64> {
        self.metric.filter(|m| m.is_finite())
    }

    pub fn summary(&self) -> TrialSummary {
        TrialSummary {
            trial_id: self.settings.trial_id,
            trainer: self.settings.candidate.trainer.clone(),
            parameters: self.settings.candidate.parameters.clone(),
            status: self.status,
            metric: self.metric,
            duration_ms: self.duration_ms,
            error: self.error.as_ref().map(|e| e.to_string()),
        }
    }
}

impl<M> Clone for TrialResult<M> {
    fn clone(&self) -> Self {
        Self {
            settings: self.settings.clone(),
            model: self.model.clone(),
            metric: self.metric,
            duration_ms: self.duration_ms,
            status: self.status,
            error: self.error.clone(),
            finished_at: self.finished_at,
        }
    }
}

impl<M> fmt::Debug for TrialResult<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrialResult")
            .field("settings", &self.settings)
            .field("has_model", &self.model.is_some())
            .field("metric", &self.metric)
            .field("duration_ms", &self.duration_ms)
            .field("status", &self.status)
            .field("error", &self.error)
            .finish()
    }
}

/// Serializable view of a trial, without the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialSummary {
    pub trial_id: usize,
    pub trainer: String,
    pub parameters: Parameters,
    pub status: TrialStatus,
    pub metric: Option<f64>,
    pub duration_ms: f64,
    pub error: Option<String>,
}
