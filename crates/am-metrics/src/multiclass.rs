//! Multiclass classification metrics.
//!
//! Labels are `Int` class indices or `Text` class names. Predictions are a
//! `Vector` of per-class scores (argmax is the predicted class), or a column
//! of the same type as the labels. Log-loss and top-k need score vectors with
//! `Int` labels.

use std::collections::BTreeMap;

use am_types::{Column, DataError, MetricError};

use crate::manager::EvalInput;

const PROBABILITY_EPSILON: f64 = 1e-15;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
enum ClassKey<'a> {
    Index(i64),
    Name(&'a str),
}

fn argmax(scores: &[f64]) -> Option<usize> {
    scores
        .iter()
        .enumerate()
        .filter(|(_, s)| !s.is_nan())
        .fold(None, |best: Option<(usize, f64)>, (i, s)| match best {
            Some((_, top)) if top >= *s => best,
            _ => Some((i, *s)),
        })
        .map(|(i, _)| i)
}

/// (actual, predicted) class pairs for accuracy-style metrics.
fn class_pairs<'a>(
    input: &EvalInput<'a>,
) -> Result<Vec<(ClassKey<'a>, ClassKey<'a>)>, MetricError> {
    let (label, predicted) = input.columns()?;

    let actual: Vec<ClassKey<'a>> = match label {
        Column::Int(values) => values.iter().map(|v| ClassKey::Index(*v)).collect(),
        Column::Text(values) => values.iter().map(|v| ClassKey::Name(v.as_str())).collect(),
        other => {
            return Err(DataError::invalid(
                input.label,
                format!("multiclass label must be int or text, found {}", other.type_name()),
            )
            .into())
        }
    };

    let guessed: Vec<ClassKey<'a>> = match (label, predicted) {
        (Column::Int(_), Column::Vector(rows)) => rows
            .iter()
            .map(|scores| {
                argmax(scores)
                    .map(|i| ClassKey::Index(i as i64))
                    .ok_or_else(|| DataError::invalid(input.predicted, "empty score vector"))
            })
            .collect::<Result<_, _>>()?,
        (Column::Int(_), Column::Int(values)) => {
            values.iter().map(|v| ClassKey::Index(*v)).collect()
        }
        (Column::Text(_), Column::Text(values)) => {
            values.iter().map(|v| ClassKey::Name(v.as_str())).collect()
        }
        (_, other) => {
            return Err(DataError::invalid(
                input.predicted,
                format!(
                    "predicted {} column does not match {} labels",
                    other.type_name(),
                    label.type_name()
                ),
            )
            .into())
        }
    };

    Ok(actual.into_iter().zip(guessed).collect())
}

/// (label index, score vector) rows for probability-based metrics.
fn indexed_scores<'a>(input: &EvalInput<'a>) -> Result<Vec<(usize, &'a [f64])>, MetricError> {
    let (label, predicted) = input.columns()?;
    let (Column::Int(labels), Column::Vector(rows)) = (label, predicted) else {
        return Err(DataError::invalid(
            input.predicted,
            format!(
                "expected int labels and per-class score vectors, found {} and {}",
                label.type_name(),
                predicted.type_name()
            ),
        )
        .into());
    };

    if rows.iter().flatten().any(|score| score.is_nan()) {
        return Err(DataError::invalid(input.predicted, "score is NaN").into());
    }

    labels
        .iter()
        .zip(rows)
        .map(|(label, scores)| {
            usize::try_from(*label)
                .ok()
                .filter(|index| *index < scores.len())
                .map(|index| (index, scores.as_slice()))
                .ok_or_else(|| {
                    MetricError::from(DataError::invalid(
                        input.label,
                        format!("label {label} outside score vector of {}", scores.len()),
                    ))
                })
        })
        .collect()
}

pub(crate) fn micro_accuracy(input: &EvalInput<'_>) -> Result<f64, MetricError> {
    let pairs = class_pairs(input)?;
    let correct = pairs.iter().filter(|(a, p)| a == p).count();
    Ok(correct as f64 / pairs.len() as f64)
}

/// Mean per-class recall over the classes present in the labels.
pub(crate) fn macro_accuracy(input: &EvalInput<'_>) -> Result<f64, MetricError> {
    let pairs = class_pairs(input)?;
    let mut per_class: BTreeMap<&ClassKey<'_>, (usize, usize)> = BTreeMap::new();
    for (actual, predicted) in &pairs {
        let entry = per_class.entry(actual).or_default();
        entry.1 += 1;
        if actual == predicted {
            entry.0 += 1;
        }
    }

    let sum: f64 = per_class
        .values()
        .map(|(correct, total)| *correct as f64 / *total as f64)
        .sum();
    Ok(sum / per_class.len() as f64)
}

pub(crate) fn log_loss(input: &EvalInput<'_>) -> Result<f64, MetricError> {
    let rows = indexed_scores(input)?;
    let total: f64 = rows
        .iter()
        .map(|(label, scores)| -scores[*label].clamp(PROBABILITY_EPSILON, 1.0).ln())
        .sum();
    Ok(total / rows.len() as f64)
}

/// Relative improvement of log-loss over predicting the label priors.
pub(crate) fn log_loss_reduction(input: &EvalInput<'_>) -> Result<f64, MetricError> {
    let rows = indexed_scores(input)?;
    let n = rows.len() as f64;

    let mut counts: BTreeMap<usize, usize> = BTreeMap::new();
    for (label, _) in &rows {
        *counts.entry(*label).or_default() += 1;
    }
    let prior_loss: f64 = counts
        .values()
        .map(|count| {
            let p = *count as f64 / n;
            -p * p.ln()
        })
        .sum();

    let loss = log_loss(input)?;
    Ok((prior_loss - loss) / prior_loss)
}

/// Fraction of rows whose label ranks within the top k scores.
pub(crate) fn top_k_accuracy(input: &EvalInput<'_>) -> Result<f64, MetricError> {
    let rows = indexed_scores(input)?;
    let hits = rows
        .iter()
        .filter(|(label, scores)| {
            let own = scores[*label];
            let better = scores.iter().filter(|s| **s > own).count();
            better < input.top_k
        })
        .count();
    Ok(hits as f64 / rows.len() as f64)
}
