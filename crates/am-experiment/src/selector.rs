//! Running best-trial tracking.

use am_metrics::ObjectiveDirection;

use crate::trial::TrialResult;

/// Keeps the best trial seen so far under a fixed objective direction.
///
/// Only successful trials with a finite metric are eligible. Ties keep the
/// incumbent, so the earliest trial reaching a value wins.
pub struct BestTrialSelector<M> {
    direction: ObjectiveDirection,
    best: Option<TrialResult<M>>,
}

impl<M> BestTrialSelector<M> {
    pub fn new(direction: ObjectiveDirection) -> Self {
        Self {
            direction,
            best: None,
        }
    }

    pub fn direction(&self) -> ObjectiveDirection {
        self.direction
    }

    /// Offer a finished trial. Returns `true` if it became the new best.
    pub fn update(&mut self, candidate: &TrialResult<M>) -> bool {
        let Some(metric) = candidate.finite_metric() else {
            return false;
        };
        if !candidate.is_success() {
            return false;
        }

        let improves = match self.best.as_ref().and_then(|b| b.finite_metric()) {
            None => true,
            Some(incumbent) => self.direction.improves(metric, incumbent),
        };
        if improves {
            self.best = Some(candidate.clone());
        }
        improves
    }

    pub fn has_best(&self) -> bool {
        self.best.is_some()
    }

    pub fn best(&self) -> Option<&TrialResult<M>> {
        self.best.as_ref()
    }

    pub fn into_best(self) -> Option<TrialResult<M>> {
        self.best
    }
}
