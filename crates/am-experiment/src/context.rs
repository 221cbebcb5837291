//! Execution context passed explicitly into an experiment: random seed,
//! cancellation token and progress sink.

use crossbeam_channel::{Receiver, Sender, TrySendError};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

use crate::trial::{ExperimentId, TrialStatus};

/// Cooperative cancellation flag shared between the caller and every trial
/// slot.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Notification emitted once per recorded trial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialProgress {
    pub experiment_id: ExperimentId,
    pub trial_id: usize,
    pub trainer: String,
    pub status: TrialStatus,
    pub metric: Option<f64>,
    pub duration_ms: f64,
    /// Whether this trial became the new best.
    pub is_best: bool,
    pub error: Option<String>,
}

/// Receives trial notifications.
///
/// Called from the search loop, so implementations must return quickly.
pub trait ProgressSink: Send + Sync {
    fn trial_completed(&self, progress: &TrialProgress);
}

impl<F> ProgressSink for F
where
    F: Fn(&TrialProgress) + Send + Sync,
{
    fn trial_completed(&self, progress: &TrialProgress) {
        self(progress)
    }
}

/// Discards all notifications.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopProgress;

impl ProgressSink for NoopProgress {
    fn trial_completed(&self, _progress: &TrialProgress) {}
}

/// Forwards notifications over a bounded channel without ever blocking; when
/// the queue is full the notification is dropped.
#[derive(Debug, Clone)]
pub struct ChannelProgressSink {
    tx: Sender<TrialProgress>,
}

impl ChannelProgressSink {
    pub fn new(tx: Sender<TrialProgress>) -> Self {
        Self { tx }
    }

    /// Create a sink together with the receiving end of a queue holding at
    /// most `capacity` notifications.
    pub fn bounded(capacity: usize) -> (Self, Receiver<TrialProgress>) {
        let (tx, rx) = crossbeam_channel::bounded(capacity);
        (Self { tx }, rx)
    }
}

impl ProgressSink for ChannelProgressSink {
    fn trial_completed(&self, progress: &TrialProgress) {
        match self.tx.try_send(progress.clone()) {
            Ok(()) => {}
            Err(TrySendError::Full(dropped)) => {
                debug!("Progress queue full, dropping trial {}", dropped.trial_id);
            }
            Err(TrySendError::Disconnected(_)) => {}
        }
    }
}

/// Everything an experiment needs from its caller besides data and
/// collaborators.
#[derive(Clone)]
pub struct ExecutionContext {
    seed: Option<u64>,
    cancellation: CancellationToken,
    progress: Arc<dyn ProgressSink>,
}

impl ExecutionContext {
    pub fn new() -> Self {
        Self {
            seed: None,
            cancellation: CancellationToken::new(),
            progress: Arc::new(NoopProgress),
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    pub fn with_progress(mut self, sink: impl ProgressSink + 'static) -> Self {
        self.progress = Arc::new(sink);
        self
    }

    pub fn seed(&self) -> Option<u64> {
        self.seed
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub fn progress(&self) -> &dyn ProgressSink {
        self.progress.as_ref()
    }

    /// A generator seeded from the context seed, or from entropy when none
    /// is set.
    pub fn rng(&self) -> ChaCha8Rng {
        match self.seed {
            Some(seed) => ChaCha8Rng::seed_from_u64(seed),
            None => ChaCha8Rng::from_entropy(),
        }
    }
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("seed", &self.seed)
            .field("cancelled", &self.cancellation.is_cancelled())
            .finish()
    }
}
