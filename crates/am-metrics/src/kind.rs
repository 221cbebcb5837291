//! Metric kinds, task families and the polarity table.
//!
//! Every [`MetricKind`] has exactly one row in [`METRIC_TABLE`], which maps it
//! to its task family, optimization direction, display name and evaluation
//! function. Nothing else in the crate branches on the metric kind.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use am_types::MetricError;

use crate::manager::EvalInput;
use crate::{binary, multiclass, regression};

/// The machine-learning task a metric belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskKind {
    BinaryClassification,
    MulticlassClassification,
    Regression,
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::BinaryClassification => "BinaryClassification",
            Self::MulticlassClassification => "MulticlassClassification",
            Self::Regression => "Regression",
        };
        f.write_str(name)
    }
}

/// Whether we are maximizing or minimizing the objective.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ObjectiveDirection {
    Maximize,
    Minimize,
}

impl ObjectiveDirection {
    pub fn is_maximize(self) -> bool {
        matches!(self, Self::Maximize)
    }

    /// Map a raw metric onto a higher-is-better scale.
    pub fn normalize(self, metric: f64) -> f64 {
        match self {
            Self::Maximize => metric,
            Self::Minimize => -metric,
        }
    }

    /// Strict improvement test; equal values never improve.
    pub fn improves(self, candidate: f64, incumbent: f64) -> bool {
        match self {
            Self::Maximize => candidate > incumbent,
            Self::Minimize => candidate < incumbent,
        }
    }
}

/// All supported evaluation metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MetricKind {
    Accuracy,
    AreaUnderPrecisionRecallCurve,
    AreaUnderRocCurve,
    PositivePrecision,
    NegativePrecision,
    PositiveRecall,
    NegativeRecall,
    F1Score,
    MacroAccuracy,
    MicroAccuracy,
    LogLoss,
    LogLossReduction,
    TopKAccuracy,
    RSquared,
    RootMeanSquaredError,
    MeanSquaredError,
    MeanAbsoluteError,
}

pub(crate) type EvaluateFn = fn(&EvalInput<'_>) -> Result<f64, MetricError>;

/// One row of the metric table.
pub struct MetricDescriptor {
    pub kind: MetricKind,
    pub task: TaskKind,
    pub direction: ObjectiveDirection,
    pub name: &'static str,
    pub(crate) evaluate: EvaluateFn,
}

impl fmt::Debug for MetricDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetricDescriptor")
            .field("kind", &self.kind)
            .field("task", &self.task)
            .field("direction", &self.direction)
            .field("name", &self.name)
            .finish()
    }
}

const fn row(
    kind: MetricKind,
    task: TaskKind,
    direction: ObjectiveDirection,
    name: &'static str,
    evaluate: EvaluateFn,
) -> MetricDescriptor {
    MetricDescriptor {
        kind,
        task,
        direction,
        name,
        evaluate,
    }
}

use MetricKind as M;
use ObjectiveDirection::{Maximize, Minimize};
use TaskKind::{BinaryClassification as Binary, MulticlassClassification as Multi, Regression};

/// Indexed by `MetricKind as usize`; order must follow the enum declaration.
pub static METRIC_TABLE: [MetricDescriptor; 17] = [
    row(M::Accuracy, Binary, Maximize, "Accuracy", binary::accuracy),
    row(
        M::AreaUnderPrecisionRecallCurve,
        Binary,
        Maximize,
        "AreaUnderPrecisionRecallCurve",
        binary::area_under_pr_curve,
    ),
    row(
        M::AreaUnderRocCurve,
        Binary,
        Maximize,
        "AreaUnderRocCurve",
        binary::area_under_roc_curve,
    ),
    row(M::PositivePrecision, Binary, Maximize, "PositivePrecision", binary::positive_precision),
    row(M::NegativePrecision, Binary, Maximize, "NegativePrecision", binary::negative_precision),
    row(M::PositiveRecall, Binary, Maximize, "PositiveRecall", binary::positive_recall),
    row(M::NegativeRecall, Binary, Maximize, "NegativeRecall", binary::negative_recall),
    row(M::F1Score, Binary, Maximize, "F1Score", binary::f1_score),
    row(M::MacroAccuracy, Multi, Maximize, "MacroAccuracy", multiclass::macro_accuracy),
    row(M::MicroAccuracy, Multi, Maximize, "MicroAccuracy", multiclass::micro_accuracy),
    row(M::LogLoss, Multi, Minimize, "LogLoss", multiclass::log_loss),
    row(
        M::LogLossReduction,
        Multi,
        Minimize,
        "LogLossReduction",
        multiclass::log_loss_reduction,
    ),
    row(M::TopKAccuracy, Multi, Maximize, "TopKAccuracy", multiclass::top_k_accuracy),
    row(M::RSquared, Regression, Maximize, "RSquared", regression::r_squared),
    row(
        M::RootMeanSquaredError,
        Regression,
        Minimize,
        "RootMeanSquaredError",
        regression::root_mean_squared_error,
    ),
    row(
        M::MeanSquaredError,
        Regression,
        Minimize,
        "MeanSquaredError",
        regression::mean_squared_error,
    ),
    row(
        M::MeanAbsoluteError,
        Regression,
        Minimize,
        "MeanAbsoluteError",
        regression::mean_absolute_error,
    ),
];

impl MetricKind {
    pub const ALL: [MetricKind; 17] = [
        M::Accuracy,
        M::AreaUnderPrecisionRecallCurve,
        M::AreaUnderRocCurve,
        M::PositivePrecision,
        M::NegativePrecision,
        M::PositiveRecall,
        M::NegativeRecall,
        M::F1Score,
        M::MacroAccuracy,
        M::MicroAccuracy,
        M::LogLoss,
        M::LogLossReduction,
        M::TopKAccuracy,
        M::RSquared,
        M::RootMeanSquaredError,
        M::MeanSquaredError,
        M::MeanAbsoluteError,
    ];

    pub fn descriptor(self) -> &'static MetricDescriptor {
        &METRIC_TABLE[self as usize]
    }

    pub fn task(self) -> TaskKind {
        self.descriptor().task
    }

    pub fn direction(self) -> ObjectiveDirection {
        self.descriptor().direction
    }

    pub fn is_maximize(self) -> bool {
        self.direction().is_maximize()
    }

    pub fn name(self) -> &'static str {
        self.descriptor().name
    }

    /// Metrics available for `task`, in table order.
    pub fn for_task(task: TaskKind) -> impl Iterator<Item = MetricKind> {
        Self::ALL.into_iter().filter(move |kind| kind.task() == task)
    }

    /// Whether the metric ranks by a continuous score rather than a
    /// predicted label.
    pub fn uses_scores(self) -> bool {
        matches!(
            self,
            M::AreaUnderPrecisionRecallCurve
                | M::AreaUnderRocCurve
                | M::LogLoss
                | M::LogLossReduction
                | M::TopKAccuracy
        ) || self.task() == Regression
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for MetricKind {
    type Err = MetricError;

    /// Accepts the table names (case-insensitive) and the common short forms.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let needle = s.trim().to_ascii_lowercase();
        let alias = match needle.as_str() {
            "auc" | "auc-roc" | "auc_roc" | "roc_auc" => Some(M::AreaUnderRocCurve),
            "auc-pr" | "auc_pr" | "average_precision" => Some(M::AreaUnderPrecisionRecallCurve),
            "f1" => Some(M::F1Score),
            "r2" | "r-squared" => Some(M::RSquared),
            "rmse" => Some(M::RootMeanSquaredError),
            "mse" => Some(M::MeanSquaredError),
            "mae" => Some(M::MeanAbsoluteError),
            "topk" | "top-k" => Some(M::TopKAccuracy),
            _ => None,
        };

        alias
            .or_else(|| {
                Self::ALL
                    .into_iter()
                    .find(|kind| kind.name().eq_ignore_ascii_case(&needle))
            })
            .ok_or_else(|| MetricError::UnknownMetric(s.to_string()))
    }
}
