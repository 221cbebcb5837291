//! The trial loop.
//!
//! An [`Experiment`] pulls candidates from a [`CandidateGenerator`], trains
//! each one with a [`Trainer`], scores the resulting model through a
//! [`MetricEvaluator`] and keeps the best trial. Up to `parallelism` trials
//! run at once on a dedicated rayon pool; everything the slots share sits
//! behind `parking_lot` locks.

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use am_metrics::{MetricEvaluator, ObjectiveDirection};
use am_types::{config_error, internal_error, AmResult, DataTable, Dataset, TrialError};

use crate::config::{
    CancellationPolicy, ExperimentConfig, ExperimentState, ExperimentStatus, StopReason,
};
use crate::context::{CancellationToken, ExecutionContext, TrialProgress};
use crate::search::CandidateGenerator;
use crate::selector::BestTrialSelector;
use crate::trial::{ExperimentId, TrialResult, TrialSettings, TrialSummary};

/// A trained artifact that can score data.
pub trait Model: Send + Sync {
    /// Produce the scored table: the input columns plus whatever prediction
    /// columns the evaluator reads.
    fn transform(&self, data: &dyn Dataset) -> anyhow::Result<DataTable>;
}

/// Fits one model per trial.
///
/// Called concurrently from several trial slots when parallelism > 1.
pub trait Trainer: Send + Sync {
    type Artifact: Model;

    fn train(
        &self,
        settings: &TrialSettings,
        training: &dyn Dataset,
    ) -> anyhow::Result<Self::Artifact>;
}

/// Stores the artifact of a finished trial.
pub trait ModelSink<M> {
    fn persist(&self, trial: &TrialResult<M>) -> anyhow::Result<()>;
}

/// One AutoML search run.
pub struct Experiment<T: Trainer> {
    config: ExperimentConfig,
    trainer: T,
    evaluator: Arc<dyn MetricEvaluator>,
    context: ExecutionContext,
    generator: Option<Box<dyn CandidateGenerator>>,
    status: Arc<RwLock<ExperimentStatus>>,
}

impl<T: Trainer> Experiment<T> {
    pub fn new(
        config: ExperimentConfig,
        trainer: T,
        evaluator: Arc<dyn MetricEvaluator>,
        context: ExecutionContext,
    ) -> Self {
        let status = ExperimentStatus::new(config.id);
        Self {
            config,
            trainer,
            evaluator,
            context,
            generator: None,
            status: Arc::new(RwLock::new(status)),
        }
    }

    pub fn with_generator(mut self, generator: impl CandidateGenerator + 'static) -> Self {
        self.generator = Some(Box::new(generator));
        self
    }

    pub fn id(&self) -> ExperimentId {
        self.config.id
    }

    pub fn config(&self) -> &ExperimentConfig {
        &self.config
    }

    pub fn state(&self) -> ExperimentState {
        self.status.read().state
    }

    /// Snapshot of the current status.
    pub fn status(&self) -> ExperimentStatus {
        self.status.read().clone()
    }

    /// Shared status handle, readable from other threads while `execute`
    /// runs.
    pub fn status_handle(&self) -> Arc<RwLock<ExperimentStatus>> {
        Arc::clone(&self.status)
    }

    /// Token that stops the run when cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.context.cancellation().clone()
    }

    /// Run the search to completion, cancellation or failure.
    ///
    /// When `validation` is `None` trials are scored on the training data.
    /// Configuration problems are reported before any trial starts and leave
    /// the experiment `Idle`.
    pub fn execute(
        &mut self,
        training: &dyn Dataset,
        validation: Option<&dyn Dataset>,
    ) -> AmResult<ExperimentResult<T::Artifact>> {
        let state = self.state();
        if state != ExperimentState::Idle {
            return Err(config_error!(
                "experiment {} cannot start from state {:?}",
                self.config.id,
                state
            ));
        }

        self.config.validate()?;
        self.check_columns("training", training)?;
        if let Some(validation) = validation {
            self.check_columns("validation", validation)?;
        }

        self.status.write().mark_running();

        let Some(generator) = self.generator.take() else {
            let err = config_error!("experiment {} has no candidate generator", self.config.id);
            self.status.write().mark_failed(err.to_string());
            return Err(err);
        };

        let scoring = match validation {
            Some(validation) => validation,
            None => {
                warn!(
                    "No validation data for experiment {}, scoring on training data",
                    self.config.id
                );
                training
            }
        };

        info!(
            "Starting experiment {} ({}): metric {}, generator {}, parallelism {}",
            self.config.id,
            self.config.name,
            self.evaluator.metric_name(),
            generator.name(),
            self.config.parallelism
        );

        let direction = self.evaluator.direction();
        let search = SearchLoop {
            experiment_id: self.config.id,
            config: &self.config,
            trainer: &self.trainer,
            evaluator: self.evaluator.as_ref(),
            context: &self.context,
            training,
            scoring,
            direction,
            started: Instant::now(),
            dispatch: Mutex::new(Dispatch {
                generator,
                dispatched: 0,
                stop: None,
                results: Vec::new(),
            }),
            selector: Mutex::new(BestTrialSelector::new(direction)),
            status: &self.status,
        };

        if let Err(err) = search.run(self.config.parallelism) {
            self.status.write().mark_failed(err.to_string());
            return Err(err);
        }

        let elapsed = search.started.elapsed();
        let Dispatch {
            mut results, stop, ..
        } = search.dispatch.into_inner();
        let best = search.selector.into_inner().into_best();
        results.sort_by_key(|r| r.trial_id());

        let stop_reason = stop.unwrap_or(StopReason::Exhausted);
        let state = {
            let mut status = self.status.write();
            status.mark_stopped(stop_reason);
            status.state
        };

        match &best {
            Some(best) => info!(
                "Experiment {} finished ({:?}) after {} trials in {:?}; best trial {} {} = {:?}",
                self.config.id,
                stop_reason,
                results.len(),
                elapsed,
                best.trial_id(),
                self.evaluator.metric_name(),
                best.metric
            ),
            None => warn!(
                "Experiment {} finished ({:?}) after {} trials with no successful trial",
                self.config.id,
                stop_reason,
                results.len()
            ),
        }

        Ok(ExperimentResult {
            experiment_id: self.config.id,
            state,
            stop_reason,
            metric: self.evaluator.metric_name().to_string(),
            direction,
            trials: results,
            best,
            elapsed,
        })
    }

    fn check_columns(&self, role: &str, data: &dyn Dataset) -> AmResult<()> {
        if data.row_count() == 0 {
            return Err(config_error!("{} data has no rows", role));
        }
        let label = self
            .config
            .columns
            .resolve_label(self.evaluator.label_column())?;
        let features = self.config.columns.feature_columns.iter().map(String::as_str);
        for column in std::iter::once(label).chain(features) {
            if !data.has_column(column) {
                return Err(config_error!(
                    "{} data is missing required column '{}'",
                    role,
                    column
                ));
            }
        }
        Ok(())
    }
}

impl<T: Trainer> fmt::Debug for Experiment<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Experiment")
            .field("config", &self.config)
            .field("metric", &self.evaluator.metric_name())
            .field("state", &self.state())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Search loop
// ---------------------------------------------------------------------------

struct Dispatch<M> {
    generator: Box<dyn CandidateGenerator>,
    dispatched: usize,
    stop: Option<StopReason>,
    results: Vec<TrialResult<M>>,
}

/// State shared by all trial slots for the duration of one `execute` call.
struct SearchLoop<'a, T: Trainer> {
    experiment_id: ExperimentId,
    config: &'a ExperimentConfig,
    trainer: &'a T,
    evaluator: &'a dyn MetricEvaluator,
    context: &'a ExecutionContext,
    training: &'a dyn Dataset,
    scoring: &'a dyn Dataset,
    direction: ObjectiveDirection,
    started: Instant,
    dispatch: Mutex<Dispatch<T::Artifact>>,
    selector: Mutex<BestTrialSelector<T::Artifact>>,
    status: &'a RwLock<ExperimentStatus>,
}

impl<'a, T: Trainer> SearchLoop<'a, T> {
    fn run(&self, parallelism: usize) -> AmResult<()> {
        if parallelism <= 1 {
            self.worker();
            return Ok(());
        }

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(parallelism)
            .thread_name(|i| format!("am-trial-{i}"))
            .build()
            .map_err(|e| internal_error!("failed to start trial pool: {}", e))?;

        let search = self;
        pool.scope(|scope| {
            for _ in 0..parallelism {
                scope.spawn(move |_| search.worker());
            }
        });
        Ok(())
    }

    fn worker(&self) {
        while let Some(settings) = self.next_dispatch() {
            self.run_trial(settings);
        }
    }

    /// Stop checks run in a fixed order: cancellation, time budget, trial
    /// cap, then the generator itself.
    fn next_dispatch(&self) -> Option<TrialSettings> {
        let mut dispatch = self.dispatch.lock();
        if dispatch.stop.is_some() {
            return None;
        }

        let reason = if self.context.cancellation().is_cancelled() {
            Some(StopReason::Cancelled)
        } else if self
            .config
            .time_budget
            .is_some_and(|budget| self.started.elapsed() >= budget)
        {
            Some(StopReason::TimeBudget)
        } else if self
            .config
            .max_trials
            .is_some_and(|max| dispatch.dispatched >= max)
        {
            Some(StopReason::MaxTrials)
        } else {
            None
        };
        if let Some(reason) = reason {
            info!("Experiment {} stopping: {:?}", self.experiment_id, reason);
            dispatch.stop = Some(reason);
            return None;
        }

        let Some(candidate) = dispatch.generator.next_candidate() else {
            debug!("Generator {} exhausted", dispatch.generator.name());
            dispatch.stop = Some(StopReason::Exhausted);
            return None;
        };

        let trial_id = dispatch.dispatched;
        dispatch.dispatched += 1;
        Some(TrialSettings::new(
            self.experiment_id,
            trial_id,
            candidate,
            self.config.trial_budget.clone(),
        ))
    }

    fn run_trial(&self, settings: TrialSettings) {
        let trial_id = settings.trial_id;
        debug!("Dispatching trial {} ({})", trial_id, settings.trainer());

        let started = Instant::now();
        let trained = self.trainer.train(&settings, self.training);

        if self.context.cancellation().is_cancelled() {
            self.discard(trial_id, "cancelled before scoring");
            return;
        }

        let result = match trained {
            Ok(model) => match self.score(&model) {
                Ok(metric) => TrialResult::scored(settings, model, metric, elapsed_ms(started)),
                Err(err) => TrialResult::failed(settings, err, elapsed_ms(started)),
            },
            Err(err) => TrialResult::failed(
                settings,
                TrialError::Training(format!("{err:#}")),
                elapsed_ms(started),
            ),
        };
        self.record(result);
    }

    fn score(&self, model: &T::Artifact) -> Result<f64, TrialError> {
        let scored = model
            .transform(self.scoring)
            .map_err(|e| TrialError::Transform(format!("{e:#}")))?;
        Ok(self.evaluator.evaluate(&scored)?)
    }

    fn record(&self, result: TrialResult<T::Artifact>) {
        if self.config.cancellation_policy == CancellationPolicy::DiscardInFlight
            && self.context.cancellation().is_cancelled()
        {
            self.discard(result.trial_id(), "cancelled in flight");
            return;
        }

        let is_best = {
            let mut selector = self.selector.lock();
            let is_best = selector.update(&result);
            self.status.write().record_trial(&result, is_best);
            is_best
        };

        match (&result.error, result.metric) {
            (Some(err), _) => warn!("Trial {} failed: {}", result.trial_id(), err),
            (None, Some(metric)) if is_best => info!(
                "Trial {} is the new best: {} = {}",
                result.trial_id(),
                self.evaluator.metric_name(),
                metric
            ),
            (None, metric) => debug!(
                "Trial {} finished: {} = {:?}",
                result.trial_id(),
                self.evaluator.metric_name(),
                metric
            ),
        }

        let progress = TrialProgress {
            experiment_id: self.experiment_id,
            trial_id: result.trial_id(),
            trainer: result.settings.trainer().to_string(),
            status: result.status,
            metric: result.metric,
            duration_ms: result.duration_ms,
            is_best,
            error: result.error.as_ref().map(|e| e.to_string()),
        };

        {
            let mut dispatch = self.dispatch.lock();
            if let Some(metric) = result.finite_metric() {
                dispatch
                    .generator
                    .report(&result.settings.candidate, self.direction.normalize(metric));
            }
            dispatch.results.push(result);
        }

        self.context.progress().trial_completed(&progress);
    }

    fn discard(&self, trial_id: usize, why: &str) {
        debug!("Discarding trial {}: {}", trial_id, why);
        self.status.write().trials_discarded += 1;
    }
}

fn elapsed_ms(started: Instant) -> f64 {
    started.elapsed().as_secs_f64() * 1000.0
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// Everything a finished run produced.
pub struct ExperimentResult<M> {
    pub experiment_id: ExperimentId,
    pub state: ExperimentState,
    pub stop_reason: StopReason,
    pub metric: String,
    pub direction: ObjectiveDirection,
    /// Recorded trials ordered by trial id.
    pub trials: Vec<TrialResult<M>>,
    pub best: Option<TrialResult<M>>,
    pub elapsed: Duration,
}

impl<M> ExperimentResult<M> {
    /// Whether any trial produced a usable metric. Check this before reading
    /// [`ExperimentResult::best`].
    pub fn has_best(&self) -> bool {
        self.best.is_some()
    }

    pub fn best(&self) -> Option<&TrialResult<M>> {
        self.best.as_ref()
    }

    pub fn into_best(self) -> Option<TrialResult<M>> {
        self.best
    }

    pub fn successful_trials(&self) -> impl Iterator<Item = &TrialResult<M>> {
        self.trials.iter().filter(|t| t.is_success())
    }

    pub fn failed_count(&self) -> usize {
        self.trials.iter().filter(|t| !t.is_success()).count()
    }

    pub fn persist_best(&self, sink: &dyn ModelSink<M>) -> AmResult<()> {
        let best = self
            .best
            .as_ref()
            .ok_or_else(|| config_error!("experiment {} has no best trial", self.experiment_id))?;
        sink.persist(best)
            .map_err(|e| internal_error!("failed to persist trial {}: {:#}", best.trial_id(), e))?;
        info!("Persisted best trial {}", best.trial_id());
        Ok(())
    }

    pub fn summary(&self) -> ExperimentSummary {
        ExperimentSummary {
            experiment_id: self.experiment_id,
            state: self.state,
            stop_reason: self.stop_reason,
            metric: self.metric.clone(),
            maximize: self.direction.is_maximize(),
            elapsed_ms: self.elapsed.as_secs_f64() * 1000.0,
            trials: self.trials.iter().map(TrialResult::summary).collect(),
            best: self.best.as_ref().map(TrialResult::summary),
        }
    }
}

impl<M> fmt::Debug for ExperimentResult<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExperimentResult")
            .field("experiment_id", &self.experiment_id)
            .field("state", &self.state)
            .field("stop_reason", &self.stop_reason)
            .field("metric", &self.metric)
            .field("trials", &self.trials.len())
            .field("best", &self.best.as_ref().map(|b| (b.trial_id(), b.metric)))
            .field("elapsed", &self.elapsed)
            .finish()
    }
}

/// Serializable report of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentSummary {
    pub experiment_id: ExperimentId,
    pub state: ExperimentState,
    pub stop_reason: StopReason,
    pub metric: String,
    pub maximize: bool,
    pub elapsed_ms: f64,
    pub trials: Vec<TrialSummary>,
    pub best: Option<TrialSummary>,
}

impl ExperimentSummary {
    pub fn to_json(&self) -> AmResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ColumnInformation;
    use crate::search::{
        CandidateList, GridSearch, ParameterValue, SearchSpace, TrainerSpace, TrialCandidate,
    };
    use am_metrics::{MetricKind, MetricManager};
    use am_types::{AmError, Column, DataError, MetricError};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(tracing::Level::DEBUG)
            .try_init();
    }

    fn table() -> DataTable {
        DataTable::new()
            .with_column("Label", Column::Float(vec![1.0, 2.0, 3.0]))
            .unwrap()
            .with_column("Feature", Column::Float(vec![0.1, 0.2, 0.3]))
            .unwrap()
    }

    fn candidate(value: f64) -> TrialCandidate {
        let mut params = HashMap::new();
        params.insert("value".to_string(), ParameterValue::Float(value));
        TrialCandidate::new("stub", params)
    }

    fn list(values: &[f64]) -> CandidateList {
        CandidateList::new(values.iter().copied().map(candidate))
    }

    /// Predicts the trial's `value` parameter for every row.
    struct ConstModel {
        value: f64,
    }

    impl Model for ConstModel {
        fn transform(&self, data: &dyn Dataset) -> anyhow::Result<DataTable> {
            let mut input = DataTable::new();
            for name in data.column_names() {
                input.insert(name, data.require(name)?.clone())?;
            }
            let scores = Column::Float(vec![self.value; data.row_count()]);
            Ok(input.scored("Score", scores)?)
        }
    }

    #[derive(Default)]
    struct StubTrainer {
        calls: Arc<AtomicUsize>,
        delay: Duration,
        fail_on: Option<f64>,
        cancel_on_trial: Option<(usize, CancellationToken)>,
    }

    impl Trainer for StubTrainer {
        type Artifact = ConstModel;

        fn train(
            &self,
            settings: &TrialSettings,
            _training: &dyn Dataset,
        ) -> anyhow::Result<ConstModel> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                std::thread::sleep(self.delay);
            }
            if let Some((trial, token)) = &self.cancel_on_trial {
                if settings.trial_id == *trial {
                    token.cancel();
                }
            }
            let value = settings
                .parameter("value")
                .and_then(ParameterValue::as_f64)
                .ok_or_else(|| anyhow::anyhow!("missing value parameter"))?;
            if self.fail_on == Some(value) {
                anyhow::bail!("diverged at {value}");
            }
            Ok(ConstModel { value })
        }
    }

    /// Reads the first predicted score back as the metric.
    struct ScoreEcho {
        direction: ObjectiveDirection,
    }

    impl MetricEvaluator for ScoreEcho {
        fn metric_name(&self) -> &str {
            "Echo"
        }

        fn is_maximize(&self) -> bool {
            self.direction.is_maximize()
        }

        fn label_column(&self) -> &str {
            "Label"
        }

        fn evaluate(&self, scored: &dyn Dataset) -> Result<f64, MetricError> {
            first_score(scored)
        }
    }

    fn first_score(scored: &dyn Dataset) -> Result<f64, MetricError> {
        let scores = scored.require("Score")?.to_f64("Score")?;
        scores.first().copied().ok_or(MetricError::Data(DataError::Empty))
    }

    fn echo(direction: ObjectiveDirection) -> Arc<dyn MetricEvaluator> {
        Arc::new(ScoreEcho { direction })
    }

    /// Echo metric that cancels the run while scoring one particular value.
    struct CancelWhileScoring {
        at: f64,
        token: CancellationToken,
    }

    impl MetricEvaluator for CancelWhileScoring {
        fn metric_name(&self) -> &str {
            "Echo"
        }

        fn is_maximize(&self) -> bool {
            true
        }

        fn label_column(&self) -> &str {
            "Label"
        }

        fn evaluate(&self, scored: &dyn Dataset) -> Result<f64, MetricError> {
            let score = first_score(scored)?;
            if score == self.at {
                self.token.cancel();
            }
            Ok(score)
        }
    }

    /// Unbounded generator counting upwards.
    struct Endless {
        next: f64,
    }

    impl CandidateGenerator for Endless {
        fn next_candidate(&mut self) -> Option<TrialCandidate> {
            self.next += 1.0;
            Some(candidate(self.next))
        }

        fn name(&self) -> &str {
            "endless"
        }
    }

    /// Records every reported score.
    struct Recording {
        inner: CandidateList,
        reported: Arc<Mutex<Vec<f64>>>,
    }

    impl CandidateGenerator for Recording {
        fn next_candidate(&mut self) -> Option<TrialCandidate> {
            self.inner.next_candidate()
        }

        fn report(&mut self, _candidate: &TrialCandidate, score: f64) {
            self.reported.lock().push(score);
        }

        fn name(&self) -> &str {
            "recording"
        }
    }

    fn experiment(
        config: ExperimentConfig,
        trainer: StubTrainer,
        direction: ObjectiveDirection,
        context: ExecutionContext,
    ) -> Experiment<StubTrainer> {
        Experiment::new(config, trainer, echo(direction), context)
    }

    #[test]
    fn runs_every_candidate_once() {
        init_tracing();
        let data = table();
        let mut exp = experiment(
            ExperimentConfig::new("exact"),
            StubTrainer::default(),
            ObjectiveDirection::Maximize,
            ExecutionContext::new(),
        )
        .with_generator(list(&[0.2, 0.7, 0.4, 0.1]));

        let result = exp.execute(&data, Some(&data)).unwrap();
        assert_eq!(result.trials.len(), 4);
        assert_eq!(exp.trainer.calls.load(Ordering::SeqCst), 4);
        assert_eq!(result.state, ExperimentState::Completed);
        assert_eq!(result.stop_reason, StopReason::Exhausted);
        assert_eq!(exp.state(), ExperimentState::Completed);
        let ids: Vec<usize> = result.trials.iter().map(|t| t.trial_id()).collect();
        assert_eq!(ids, vec![0, 1, 2, 3]);
        assert_eq!(result.best().unwrap().metric, Some(0.7));
    }

    #[test]
    fn polarity_decides_best() {
        let data = table();
        for (direction, expected) in [
            (ObjectiveDirection::Maximize, 0.9),
            (ObjectiveDirection::Minimize, 0.3),
        ] {
            let mut exp = experiment(
                ExperimentConfig::new("polarity"),
                StubTrainer::default(),
                direction,
                ExecutionContext::new(),
            )
            .with_generator(list(&[0.5, 0.9, 0.3]));
            let result = exp.execute(&data, None).unwrap();
            assert_eq!(result.best().unwrap().metric, Some(expected));
        }
    }

    #[test]
    fn generator_sees_normalized_scores() {
        let data = table();
        let reported = Arc::new(Mutex::new(Vec::new()));
        let mut exp = experiment(
            ExperimentConfig::new("report"),
            StubTrainer::default(),
            ObjectiveDirection::Minimize,
            ExecutionContext::new(),
        )
        .with_generator(Recording {
            inner: list(&[0.3, 0.5]),
            reported: Arc::clone(&reported),
        });
        exp.execute(&data, None).unwrap();
        assert_eq!(*reported.lock(), vec![-0.3, -0.5]);
    }

    #[test]
    fn max_trials_caps_unbounded_generator() {
        let data = table();
        let mut exp = experiment(
            ExperimentConfig::new("capped").with_max_trials(3),
            StubTrainer::default(),
            ObjectiveDirection::Maximize,
            ExecutionContext::new(),
        )
        .with_generator(Endless { next: 0.0 });

        let result = exp.execute(&data, None).unwrap();
        assert_eq!(result.trials.len(), 3);
        assert_eq!(result.stop_reason, StopReason::MaxTrials);
        assert_eq!(result.best().unwrap().metric, Some(3.0));
    }

    #[test]
    fn time_budget_bounds_run() {
        init_tracing();
        let data = table();
        let budget = Duration::from_millis(60);
        let delay = Duration::from_millis(5);
        let trainer = StubTrainer {
            delay,
            ..Default::default()
        };
        let mut exp = experiment(
            ExperimentConfig::new("timed").with_time_budget(budget),
            trainer,
            ObjectiveDirection::Maximize,
            ExecutionContext::new(),
        )
        .with_generator(Endless { next: 0.0 });

        let result = exp.execute(&data, None).unwrap();
        assert_eq!(result.stop_reason, StopReason::TimeBudget);
        assert_eq!(result.state, ExperimentState::Completed);
        assert!(!result.trials.is_empty());
        // One trial may start just before the budget runs out.
        assert!(result.elapsed < budget + delay + Duration::from_millis(50));
    }

    #[test]
    fn cancel_after_two_of_five() {
        let data = table();
        let token = CancellationToken::new();
        let sink_token = token.clone();
        let context = ExecutionContext::new()
            .with_cancellation(token)
            .with_progress(move |p: &TrialProgress| {
                if p.trial_id == 1 {
                    sink_token.cancel();
                }
            });
        let mut exp = experiment(
            ExperimentConfig::new("cancel"),
            StubTrainer::default(),
            ObjectiveDirection::Maximize,
            context,
        )
        .with_generator(list(&[0.1, 0.2, 0.3, 0.4, 0.5]));

        let result = exp.execute(&data, None).unwrap();
        assert_eq!(result.trials.len(), 2);
        assert_eq!(result.state, ExperimentState::Cancelled);
        assert_eq!(result.stop_reason, StopReason::Cancelled);
        assert_eq!(exp.trainer.calls.load(Ordering::SeqCst), 2);
        assert!(exp.cancellation_token().is_cancelled());
    }

    #[test]
    fn cancellation_during_training_discards_trial() {
        let data = table();
        let token = CancellationToken::new();
        let trainer = StubTrainer {
            cancel_on_trial: Some((2, token.clone())),
            ..Default::default()
        };
        let mut exp = experiment(
            ExperimentConfig::new("discard"),
            trainer,
            ObjectiveDirection::Maximize,
            ExecutionContext::new().with_cancellation(token),
        )
        .with_generator(list(&[0.1, 0.2, 0.3, 0.4]));

        let result = exp.execute(&data, None).unwrap();
        assert_eq!(result.trials.len(), 2);
        assert_eq!(result.state, ExperimentState::Cancelled);
        assert_eq!(exp.status().trials_discarded, 1);
        assert_eq!(exp.status().trials_completed(), 2);
    }

    #[test]
    fn failed_trials_do_not_stop_the_loop() {
        let data = table();
        let trainer = StubTrainer {
            fail_on: Some(0.9),
            ..Default::default()
        };
        let mut exp = experiment(
            ExperimentConfig::new("failures"),
            trainer,
            ObjectiveDirection::Maximize,
            ExecutionContext::new(),
        )
        .with_generator(list(&[0.5, 0.9, f64::NAN, 0.3]));

        let result = exp.execute(&data, None).unwrap();
        assert_eq!(result.trials.len(), 4);
        assert_eq!(result.failed_count(), 2);
        assert_eq!(result.successful_trials().count(), 2);
        assert!(matches!(result.trials[1].error, Some(TrialError::Training(_))));
        assert!(matches!(result.trials[2].error, Some(TrialError::NonFiniteMetric(_))));
        assert_eq!(result.best().unwrap().metric, Some(0.5));
    }

    #[test]
    fn all_failures_leave_no_best() {
        let data = table();
        let trainer = StubTrainer {
            fail_on: Some(1.0),
            ..Default::default()
        };
        let mut exp = experiment(
            ExperimentConfig::new("no-best"),
            trainer,
            ObjectiveDirection::Minimize,
            ExecutionContext::new(),
        )
        .with_generator(list(&[1.0, 1.0]));

        let result = exp.execute(&data, None).unwrap();
        assert!(!result.has_best());
        assert_eq!(result.failed_count(), 2);
        assert_eq!(result.state, ExperimentState::Completed);
        assert!(matches!(
            result.persist_best(&RecordingSink::default()),
            Err(AmError::Configuration(_))
        ));
    }

    #[test]
    fn parallel_grid_runs_every_point() {
        init_tracing();
        let data = table();
        let grid = GridSearch::new(
            vec![TrainerSpace::new(
                "stub",
                SearchSpace::new().add_float("value", 0.0, 1.0),
            )],
            8,
        )
        .unwrap();
        let trainer = StubTrainer {
            delay: Duration::from_millis(2),
            ..Default::default()
        };
        let mut exp = experiment(
            ExperimentConfig::new("parallel").with_parallelism(4),
            trainer,
            ObjectiveDirection::Maximize,
            ExecutionContext::new(),
        )
        .with_generator(grid);

        let result = exp.execute(&data, None).unwrap();
        assert_eq!(result.trials.len(), 8);
        let ids: Vec<usize> = result.trials.iter().map(|t| t.trial_id()).collect();
        assert_eq!(ids, (0..8).collect::<Vec<_>>());
        assert_eq!(result.best().unwrap().metric, Some(1.0));
        assert_eq!(exp.status().best_metric, Some(1.0));
    }

    #[test]
    fn progress_reports_every_trial() {
        let data = table();
        let (sink, rx) = crate::context::ChannelProgressSink::bounded(16);
        let mut exp = experiment(
            ExperimentConfig::new("progress"),
            StubTrainer::default(),
            ObjectiveDirection::Maximize,
            ExecutionContext::new().with_progress(sink),
        )
        .with_generator(list(&[0.2, 0.8, 0.5]));
        exp.execute(&data, None).unwrap();

        let events: Vec<TrialProgress> = rx.try_iter().collect();
        assert_eq!(events.len(), 3);
        let best_flags: Vec<bool> = events.iter().map(|p| p.is_best).collect();
        assert_eq!(best_flags, vec![true, true, false]);
    }

    #[test]
    fn missing_generator_fails_run() {
        let data = table();
        let mut exp = experiment(
            ExperimentConfig::new("empty"),
            StubTrainer::default(),
            ObjectiveDirection::Maximize,
            ExecutionContext::new(),
        );
        assert!(matches!(
            exp.execute(&data, None),
            Err(AmError::Configuration(_))
        ));
        assert_eq!(exp.state(), ExperimentState::Failed);
        assert!(exp.status().error.is_some());
    }

    #[test]
    fn cancellation_while_scoring_follows_policy() {
        let data = table();
        for (policy, kept, discarded) in [
            (CancellationPolicy::DiscardInFlight, 1, 1),
            (CancellationPolicy::DiscardUnscored, 2, 0),
        ] {
            let token = CancellationToken::new();
            let evaluator = Arc::new(CancelWhileScoring {
                at: 0.2,
                token: token.clone(),
            });
            let mut exp = Experiment::new(
                ExperimentConfig::new("scoring-cancel").with_cancellation_policy(policy),
                StubTrainer::default(),
                evaluator,
                ExecutionContext::new().with_cancellation(token),
            )
            .with_generator(list(&[0.1, 0.2, 0.3, 0.4]));

            let result = exp.execute(&data, None).unwrap();
            assert_eq!(result.trials.len(), kept, "{policy:?}");
            assert_eq!(exp.status().trials_discarded, discarded, "{policy:?}");
            assert_eq!(result.state, ExperimentState::Cancelled);
            assert_eq!(exp.trainer.calls.load(Ordering::SeqCst), 2);
        }
    }

    #[test]
    fn parallel_cancellation_stops_every_slot() {
        init_tracing();
        let data = table();
        let parallelism = 4;
        let token = CancellationToken::new();
        let trainer = StubTrainer {
            delay: Duration::from_millis(3),
            ..Default::default()
        };
        let calls = Arc::clone(&trainer.calls);
        let calls_at_cancel: Arc<Mutex<Option<usize>>> = Arc::new(Mutex::new(None));

        let sink_token = token.clone();
        let sink_calls = Arc::clone(&calls_at_cancel);
        let context = ExecutionContext::new()
            .with_cancellation(token)
            .with_progress(move |p: &TrialProgress| {
                let mut at_cancel = sink_calls.lock();
                if p.trial_id >= 8 && at_cancel.is_none() {
                    *at_cancel = Some(calls.load(Ordering::SeqCst));
                    sink_token.cancel();
                }
            });
        let mut exp = experiment(
            ExperimentConfig::new("parallel-cancel").with_parallelism(parallelism),
            trainer,
            ObjectiveDirection::Maximize,
            context,
        )
        .with_generator(Endless { next: 0.0 });

        let result = exp.execute(&data, None).unwrap();
        assert_eq!(result.state, ExperimentState::Cancelled);
        assert_eq!(result.stop_reason, StopReason::Cancelled);

        // Only trials already dispatched when the token flipped may still
        // have entered training afterwards.
        let at_cancel = (*calls_at_cancel.lock()).unwrap();
        let total = exp.trainer.calls.load(Ordering::SeqCst);
        assert!(total < at_cancel + parallelism, "{total} calls, {at_cancel} at cancel");
        assert!(result.trials.len() <= total);
    }

    #[test]
    fn label_column_comes_from_metric() {
        let data = DataTable::new()
            .with_column("Target", Column::Float(vec![1.0, 2.0, 3.0]))
            .unwrap();
        let manager = MetricManager::regression(MetricKind::MeanAbsoluteError, "Score", "Target")
            .unwrap();
        let mut exp = Experiment::new(
            ExperimentConfig::new("target"),
            StubTrainer::default(),
            Arc::new(manager),
            ExecutionContext::new(),
        )
        .with_generator(list(&[2.0]));

        let result = exp.execute(&data, None).unwrap();
        let mae = result.best().unwrap().metric.unwrap();
        assert!((mae - 2.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn conflicting_label_column_rejected() {
        let data = table();
        let mut exp = experiment(
            ExperimentConfig::new("conflict")
                .with_columns(ColumnInformation::new().with_label("Target")),
            StubTrainer::default(),
            ObjectiveDirection::Maximize,
            ExecutionContext::new(),
        )
        .with_generator(list(&[0.1]));
        let err = exp.execute(&data, None).unwrap_err();
        assert!(matches!(err, AmError::Configuration(_)));
        assert!(err.to_string().contains("Target"));
        assert_eq!(exp.state(), ExperimentState::Idle);
    }

    #[test]
    fn missing_column_rejected_before_running() {
        let data = table();
        let mut exp = experiment(
            ExperimentConfig::new("columns")
                .with_columns(ColumnInformation::new().with_features(["Feature", "Age"])),
            StubTrainer::default(),
            ObjectiveDirection::Maximize,
            ExecutionContext::new(),
        )
        .with_generator(list(&[0.1]));
        let err = exp.execute(&data, None).unwrap_err();
        assert!(err.to_string().contains("'Age'"));
        assert_eq!(exp.state(), ExperimentState::Idle);
        assert_eq!(exp.trainer.calls.load(Ordering::SeqCst), 0);

        let validation = DataTable::new()
            .with_column("Other", Column::Float(vec![1.0]))
            .unwrap();
        let mut exp = experiment(
            ExperimentConfig::new("validation-columns"),
            StubTrainer::default(),
            ObjectiveDirection::Maximize,
            ExecutionContext::new(),
        )
        .with_generator(list(&[0.1]));
        assert!(matches!(
            exp.execute(&data, Some(&validation)),
            Err(AmError::Configuration(_))
        ));
    }

    #[test]
    fn experiment_runs_once() {
        let data = table();
        let mut exp = experiment(
            ExperimentConfig::new("once"),
            StubTrainer::default(),
            ObjectiveDirection::Maximize,
            ExecutionContext::new(),
        )
        .with_generator(list(&[0.1]));
        exp.execute(&data, None).unwrap();
        assert!(exp.execute(&data, None).is_err());
    }

    #[derive(Default)]
    struct RecordingSink {
        persisted: Mutex<Vec<usize>>,
    }

    impl ModelSink<ConstModel> for RecordingSink {
        fn persist(&self, trial: &TrialResult<ConstModel>) -> anyhow::Result<()> {
            anyhow::ensure!(trial.model.is_some(), "trial has no model");
            self.persisted.lock().push(trial.trial_id());
            Ok(())
        }
    }

    #[test]
    fn rmse_end_to_end() {
        init_tracing();
        let data = table();
        let manager = MetricManager::regression(MetricKind::RootMeanSquaredError, "Score", "Label")
            .unwrap();
        let mut exp = Experiment::new(
            ExperimentConfig::new("taxi-fare").with_max_trials(10),
            StubTrainer::default(),
            Arc::new(manager),
            ExecutionContext::new().with_seed(42),
        )
        .with_generator(list(&[0.0, 2.0, 5.0]));

        let result = exp.execute(&data, Some(&data)).unwrap();
        let best = result.best().unwrap();
        assert_eq!(best.trial_id(), 1);
        assert!((best.metric.unwrap() - (2.0f64 / 3.0).sqrt()).abs() < 1e-12);
        assert!(!result.direction.is_maximize());

        let sink = RecordingSink::default();
        result.persist_best(&sink).unwrap();
        assert_eq!(*sink.persisted.lock(), vec![1]);

        let summary = result.summary();
        assert_eq!(summary.metric, "RootMeanSquaredError");
        assert_eq!(summary.trials.len(), 3);
        assert!(!summary.maximize);
        let json: serde_json::Value = serde_json::from_str(&summary.to_json().unwrap()).unwrap();
        assert_eq!(json["best"]["trial_id"], 1);
        assert_eq!(json["stop_reason"], "Exhausted");
        assert_eq!(json["trials"].as_array().unwrap().len(), 3);
    }
}
