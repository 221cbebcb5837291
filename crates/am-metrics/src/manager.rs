//! The metric manager: a configured metric plus the columns it reads.

use serde::Serialize;
use tracing::debug;

use am_types::{Column, DataError, Dataset, MetricError};

use crate::kind::{MetricKind, ObjectiveDirection, TaskKind};

/// Default label column name.
pub const DEFAULT_LABEL_COLUMN: &str = "Label";
/// Default column for predicted labels.
pub const DEFAULT_PREDICTED_LABEL_COLUMN: &str = "PredictedLabel";
/// Default column for raw scores / per-class score vectors.
pub const DEFAULT_SCORE_COLUMN: &str = "Score";

const DEFAULT_TOP_K: usize = 3;

/// Anything that can score a trial's predictions.
///
/// The experiment loop only talks to this trait, so it never needs to know
/// which concrete metric is configured.
pub trait MetricEvaluator: Send + Sync {
    fn metric_name(&self) -> &str;

    fn is_maximize(&self) -> bool;

    fn direction(&self) -> ObjectiveDirection {
        if self.is_maximize() {
            ObjectiveDirection::Maximize
        } else {
            ObjectiveDirection::Minimize
        }
    }

    /// Ground-truth column that must exist in the data handed to the
    /// experiment.
    fn label_column(&self) -> &str;

    /// Compute the metric over a scored dataset.
    fn evaluate(&self, scored: &dyn Dataset) -> Result<f64, MetricError>;
}

/// Borrowed evaluation inputs handed to the per-metric functions.
pub(crate) struct EvalInput<'a> {
    pub dataset: &'a dyn Dataset,
    pub label: &'a str,
    pub predicted: &'a str,
    pub top_k: usize,
}

impl<'a> EvalInput<'a> {
    /// Resolve the label and predicted columns; both must be present,
    /// non-empty and of equal length.
    pub fn columns(&self) -> Result<(&'a Column, &'a Column), MetricError> {
        let label = self.dataset.require(self.label)?;
        let predicted = self.dataset.require(self.predicted)?;
        if label.is_empty() {
            return Err(DataError::Empty.into());
        }
        if predicted.len() != label.len() {
            return Err(DataError::LengthMismatch {
                column: self.predicted.to_string(),
                expected: label.len(),
                actual: predicted.len(),
            }
            .into());
        }
        Ok((label, predicted))
    }
}

/// A metric choice bound to the predicted and label columns it reads.
///
/// Polarity is never stored; it is always read from the metric table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetricManager {
    metric: MetricKind,
    predicted_column: String,
    label_column: String,
    top_k: usize,
}

impl MetricManager {
    /// Create a manager for `task`.
    ///
    /// Fails with [`MetricError::UnsupportedMetric`] when `metric` belongs to
    /// a different task family.
    pub fn new(
        task: TaskKind,
        metric: MetricKind,
        predicted_column: impl Into<String>,
        label_column: impl Into<String>,
    ) -> Result<Self, MetricError> {
        if metric.task() != task {
            return Err(MetricError::UnsupportedMetric {
                metric: metric.name().to_string(),
                task: task.to_string(),
            });
        }
        Ok(Self {
            metric,
            predicted_column: predicted_column.into(),
            label_column: label_column.into(),
            top_k: DEFAULT_TOP_K,
        })
    }

    /// Manager with the conventional column names for `metric`.
    pub fn for_metric(metric: MetricKind) -> Self {
        let predicted = match metric.task() {
            TaskKind::BinaryClassification if !metric.uses_scores() => {
                DEFAULT_PREDICTED_LABEL_COLUMN
            }
            _ => DEFAULT_SCORE_COLUMN,
        };
        Self {
            metric,
            predicted_column: predicted.to_string(),
            label_column: DEFAULT_LABEL_COLUMN.to_string(),
            top_k: DEFAULT_TOP_K,
        }
    }

    pub fn binary(
        metric: MetricKind,
        predicted_column: impl Into<String>,
        label_column: impl Into<String>,
    ) -> Result<Self, MetricError> {
        Self::new(
            TaskKind::BinaryClassification,
            metric,
            predicted_column,
            label_column,
        )
    }

    pub fn multiclass(
        metric: MetricKind,
        predicted_column: impl Into<String>,
        label_column: impl Into<String>,
    ) -> Result<Self, MetricError> {
        Self::new(
            TaskKind::MulticlassClassification,
            metric,
            predicted_column,
            label_column,
        )
    }

    pub fn regression(
        metric: MetricKind,
        predicted_column: impl Into<String>,
        label_column: impl Into<String>,
    ) -> Result<Self, MetricError> {
        Self::new(TaskKind::Regression, metric, predicted_column, label_column)
    }

    /// Set k for [`MetricKind::TopKAccuracy`] (at least 1).
    pub fn with_top_k(mut self, k: usize) -> Self {
        self.top_k = k.max(1);
        self
    }

    pub fn metric(&self) -> MetricKind {
        self.metric
    }

    pub fn task(&self) -> TaskKind {
        self.metric.task()
    }

    pub fn predicted_column(&self) -> &str {
        &self.predicted_column
    }

    pub fn top_k(&self) -> usize {
        self.top_k
    }
}

impl MetricEvaluator for MetricManager {
    fn metric_name(&self) -> &str {
        self.metric.name()
    }

    fn is_maximize(&self) -> bool {
        self.metric.is_maximize()
    }

    fn label_column(&self) -> &str {
        &self.label_column
    }

    fn evaluate(&self, scored: &dyn Dataset) -> Result<f64, MetricError> {
        let input = EvalInput {
            dataset: scored,
            label: &self.label_column,
            predicted: &self.predicted_column,
            top_k: self.top_k,
        };
        let value = (self.metric.descriptor().evaluate)(&input)?;
        debug!(
            "Evaluated {} over {} rows: {}",
            self.metric,
            scored.row_count(),
            value
        );
        Ok(value)
    }
}
