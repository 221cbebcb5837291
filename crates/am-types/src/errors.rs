use thiserror::Error;

/// Main error type for the AutoML experiment core
#[derive(Error, Debug)]
pub enum AmError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Metric error: {0}")]
    Metric(#[from] MetricError),

    #[error("Data error: {0}")]
    Data(#[from] DataError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Dataset access errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DataError {
    #[error("Column not found: {column}")]
    MissingColumn { column: String },

    #[error("Invalid data in column {column}: {message}")]
    InvalidData { column: String, message: String },

    #[error("Column {column} has {actual} rows, expected {expected}")]
    LengthMismatch {
        column: String,
        expected: usize,
        actual: usize,
    },

    #[error("Dataset has no rows")]
    Empty,
}

impl DataError {
    pub fn invalid(column: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidData {
            column: column.into(),
            message: message.into(),
        }
    }
}

/// Metric configuration and evaluation errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MetricError {
    #[error("Metric {metric} is not supported for {task}")]
    UnsupportedMetric { metric: String, task: String },

    #[error("Unknown metric name: {0}")]
    UnknownMetric(String),

    #[error(transparent)]
    Data(#[from] DataError),
}

/// Per-trial failures. These are recorded on the trial, never propagated
/// out of the search loop.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TrialError {
    #[error("Training failed: {0}")]
    Training(String),

    #[error("Model transform failed: {0}")]
    Transform(String),

    #[error("Scoring failed: {0}")]
    Scoring(#[from] MetricError),

    #[error("Metric value is not finite: {0}")]
    NonFiniteMetric(f64),
}

/// Result type alias for experiment operations
pub type AmResult<T> = Result<T, AmError>;

/// Macro for creating configuration errors
#[macro_export]
macro_rules! config_error {
    ($($arg:tt)*) => {
        $crate::AmError::Configuration(format!($($arg)*))
    };
}

/// Macro for creating internal errors
#[macro_export]
macro_rules! internal_error {
    ($($arg:tt)*) => {
        $crate::AmError::Internal(format!($($arg)*))
    };
}
