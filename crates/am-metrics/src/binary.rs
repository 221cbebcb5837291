//! Binary classification metrics.
//!
//! Labels are `Bool` (or numeric 0/1). Threshold metrics read a predicted
//! label column: `Bool`, or `Float` scores where a score above zero predicts
//! the positive class. AUC metrics read the same column as a score.

use std::cmp::Ordering;

use am_types::{Column, DataError, MetricError};

use crate::manager::EvalInput;

/// Confusion-matrix counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Confusion {
    tp: usize,
    fp: usize,
    tn: usize,
    fn_: usize,
}

impl Confusion {
    fn from_input(input: &EvalInput<'_>) -> Result<Self, MetricError> {
        let (label, predicted) = input.columns()?;
        let labels = bool_labels(label, input.label)?;
        let predictions = predicted_labels(predicted, input.predicted)?;

        let mut counts = Self::default();
        for (actual, guess) in labels.iter().zip(&predictions) {
            match (actual, guess) {
                (true, true) => counts.tp += 1,
                (false, true) => counts.fp += 1,
                (false, false) => counts.tn += 1,
                (true, false) => counts.fn_ += 1,
            }
        }
        Ok(counts)
    }

    fn total(&self) -> usize {
        self.tp + self.fp + self.tn + self.fn_
    }
}

fn ratio(numerator: usize, denominator: usize) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}

fn bool_labels(column: &Column, name: &str) -> Result<Vec<bool>, MetricError> {
    let labels = match column {
        Column::Bool(values) => values.clone(),
        Column::Int(_) | Column::Float(_) => column
            .to_f64(name)?
            .into_iter()
            .map(|v| {
                if v == 0.0 {
                    Ok(false)
                } else if v == 1.0 {
                    Ok(true)
                } else {
                    Err(DataError::invalid(
                        name,
                        format!("binary label must be 0 or 1, found {v}"),
                    ))
                }
            })
            .collect::<Result<Vec<_>, _>>()?,
        other => {
            return Err(DataError::invalid(
                name,
                format!("binary label must be bool or 0/1, found {}", other.type_name()),
            )
            .into())
        }
    };
    Ok(labels)
}

fn predicted_labels(column: &Column, name: &str) -> Result<Vec<bool>, MetricError> {
    match column {
        Column::Bool(values) => Ok(values.clone()),
        Column::Float(_) | Column::Int(_) => {
            Ok(column.to_f64(name)?.into_iter().map(|s| s > 0.0).collect())
        }
        other => Err(DataError::invalid(
            name,
            format!("expected predicted labels or scores, found {}", other.type_name()),
        )
        .into()),
    }
}

fn scores(column: &Column, name: &str) -> Result<Vec<f64>, MetricError> {
    match column {
        Column::Bool(values) => Ok(values.iter().map(|b| if *b { 1.0 } else { 0.0 }).collect()),
        Column::Float(_) | Column::Int(_) => {
            let values = column.to_f64(name)?;
            if values.iter().any(|v| v.is_nan()) {
                return Err(DataError::invalid(name, "score is NaN").into());
            }
            Ok(values)
        }
        other => Err(DataError::invalid(
            name,
            format!("expected a score column, found {}", other.type_name()),
        )
        .into()),
    }
}

/// Labels paired with scores, requiring both classes to be present.
fn scored_pairs(input: &EvalInput<'_>) -> Result<(Vec<(f64, bool)>, usize, usize), MetricError> {
    let (label, predicted) = input.columns()?;
    let labels = bool_labels(label, input.label)?;
    let scores = scores(predicted, input.predicted)?;

    let positives = labels.iter().filter(|l| **l).count();
    let negatives = labels.len() - positives;
    if positives == 0 || negatives == 0 {
        return Err(DataError::invalid(
            input.label,
            "area under curve needs both positive and negative labels",
        )
        .into());
    }

    let pairs = scores.into_iter().zip(labels).collect();
    Ok((pairs, positives, negatives))
}

pub(crate) fn accuracy(input: &EvalInput<'_>) -> Result<f64, MetricError> {
    let c = Confusion::from_input(input)?;
    Ok(ratio(c.tp + c.tn, c.total()))
}

pub(crate) fn positive_precision(input: &EvalInput<'_>) -> Result<f64, MetricError> {
    let c = Confusion::from_input(input)?;
    Ok(ratio(c.tp, c.tp + c.fp))
}

pub(crate) fn negative_precision(input: &EvalInput<'_>) -> Result<f64, MetricError> {
    let c = Confusion::from_input(input)?;
    Ok(ratio(c.tn, c.tn + c.fn_))
}

pub(crate) fn positive_recall(input: &EvalInput<'_>) -> Result<f64, MetricError> {
    let c = Confusion::from_input(input)?;
    Ok(ratio(c.tp, c.tp + c.fn_))
}

pub(crate) fn negative_recall(input: &EvalInput<'_>) -> Result<f64, MetricError> {
    let c = Confusion::from_input(input)?;
    Ok(ratio(c.tn, c.tn + c.fp))
}

pub(crate) fn f1_score(input: &EvalInput<'_>) -> Result<f64, MetricError> {
    let c = Confusion::from_input(input)?;
    let precision = ratio(c.tp, c.tp + c.fp);
    let recall = ratio(c.tp, c.tp + c.fn_);
    if precision + recall == 0.0 {
        return Ok(0.0);
    }
    Ok(2.0 * precision * recall / (precision + recall))
}

/// Mann-Whitney formulation; tied scores share their average rank.
pub(crate) fn area_under_roc_curve(input: &EvalInput<'_>) -> Result<f64, MetricError> {
    let (mut pairs, positives, negatives) = scored_pairs(input)?;
    pairs.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(Ordering::Equal));

    let mut positive_rank_sum = 0.0;
    let mut start = 0;
    while start < pairs.len() {
        let mut end = start;
        while end + 1 < pairs.len() && pairs[end + 1].0 == pairs[start].0 {
            end += 1;
        }
        // ranks are 1-based
        let average_rank = (start + end) as f64 / 2.0 + 1.0;
        let tied_positives = pairs[start..=end].iter().filter(|(_, l)| *l).count();
        positive_rank_sum += average_rank * tied_positives as f64;
        start = end + 1;
    }

    let p = positives as f64;
    let n = negatives as f64;
    Ok((positive_rank_sum - p * (p + 1.0) / 2.0) / (p * n))
}

/// Average precision over descending score thresholds.
pub(crate) fn area_under_pr_curve(input: &EvalInput<'_>) -> Result<f64, MetricError> {
    let (mut pairs, positives, _) = scored_pairs(input)?;
    pairs.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(Ordering::Equal));

    let mut tp = 0usize;
    let mut seen = 0usize;
    let mut area = 0.0;
    let mut start = 0;
    while start < pairs.len() {
        let mut end = start;
        while end + 1 < pairs.len() && pairs[end + 1].0 == pairs[start].0 {
            end += 1;
        }
        let group_positives = pairs[start..=end].iter().filter(|(_, l)| *l).count();
        tp += group_positives;
        seen += end - start + 1;
        if group_positives > 0 {
            let precision = tp as f64 / seen as f64;
            area += precision * group_positives as f64 / positives as f64;
        }
        start = end + 1;
    }
    Ok(area)
}
