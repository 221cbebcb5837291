//! Regression metrics over numeric label and score columns.

use am_types::MetricError;

use crate::manager::EvalInput;

fn residuals(input: &EvalInput<'_>) -> Result<(Vec<f64>, Vec<f64>), MetricError> {
    let (label, predicted) = input.columns()?;
    let labels = label.to_f64(input.label)?;
    let scores = predicted.to_f64(input.predicted)?;
    Ok((labels, scores))
}

pub(crate) fn mean_squared_error(input: &EvalInput<'_>) -> Result<f64, MetricError> {
    let (labels, scores) = residuals(input)?;
    let sum: f64 = labels
        .iter()
        .zip(&scores)
        .map(|(y, p)| (y - p).powi(2))
        .sum();
    Ok(sum / labels.len() as f64)
}

pub(crate) fn root_mean_squared_error(input: &EvalInput<'_>) -> Result<f64, MetricError> {
    Ok(mean_squared_error(input)?.sqrt())
}

pub(crate) fn mean_absolute_error(input: &EvalInput<'_>) -> Result<f64, MetricError> {
    let (labels, scores) = residuals(input)?;
    let sum: f64 = labels.iter().zip(&scores).map(|(y, p)| (y - p).abs()).sum();
    Ok(sum / labels.len() as f64)
}

/// Coefficient of determination. Constant labels yield a non-finite value.
pub(crate) fn r_squared(input: &EvalInput<'_>) -> Result<f64, MetricError> {
    let (labels, scores) = residuals(input)?;
    let mean = labels.iter().sum::<f64>() / labels.len() as f64;
    let total: f64 = labels.iter().map(|y| (y - mean).powi(2)).sum();
    let residual: f64 = labels
        .iter()
        .zip(&scores)
        .map(|(y, p)| (y - p).powi(2))
        .sum();
    Ok(1.0 - residual / total)
}
