//! Metric selection and evaluation for AutoML trials.
//!
//! Provides:
//! - [`MetricKind`] with a single lookup table for task family, polarity and
//!   evaluation function
//! - [`MetricManager`], a metric bound to its predicted/label columns
//! - the [`MetricEvaluator`] trait the experiment loop scores through

mod binary;
pub mod kind;
pub mod manager;
mod multiclass;
mod regression;

pub use kind::{MetricDescriptor, MetricKind, ObjectiveDirection, TaskKind, METRIC_TABLE};
pub use manager::{
    MetricEvaluator, MetricManager, DEFAULT_LABEL_COLUMN, DEFAULT_PREDICTED_LABEL_COLUMN,
    DEFAULT_SCORE_COLUMN,
};
