use thiserror::Error;

/// Main error type for hypersweep
#[derive(Error, Debug)]
pub enum HsError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Study error: {0}")]
    Study(#[from] StudyError),

    #[error("Trial error: {0}")]
    Trial(#[from] TrialError),

    #[error("Data error: {0}")]
    Data(#[from] DataError),

    #[error("Launch error: {0}")]
    Launch(#[from] LaunchError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl HsError {
    /// True when the error asks the optimizer to prune the running trial.
    pub fn is_pruned(&self) -> bool {
        matches!(self, HsError::Trial(TrialError::Pruned { .. }))
    }

    /// True for out-of-memory style failures raised by a training routine.
    pub fn is_resource_exhausted(&self) -> bool {
        matches!(self, HsError::Trial(TrialError::ResourceExhausted { .. }))
    }
}

/// Configuration errors. Always fatal.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("{kind} file {path} does not exist")]
    MissingFile { kind: String, path: String },

    #[error("Optimizer direction {value} not recognized. Choose from maximize or minimize")]
    InvalidDirection { value: String },

    #[error("Type {kind} is not valid. Select from {supported:?}")]
    UnsupportedDistribution {
        kind: String,
        supported: &'static [&'static str],
    },

    #[error("Sampler {kind} is not valid. Select from {supported:?}")]
    UnsupportedSampler {
        kind: String,
        supported: &'static [&'static str],
    },

    #[error("Pruner {kind} is not valid. Select from {supported:?}")]
    UnsupportedPruner {
        kind: String,
        supported: &'static [&'static str],
    },

    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },

    #[error("Failed to parse {path}: {message}")]
    Parse { path: String, message: String },

    #[error("{0}")]
    Invalid(String),
}

/// Study lifecycle and storage errors
#[derive(Error, Debug)]
pub enum StudyError {
    #[error("Study store {path} already exists; set reload to reuse it")]
    AlreadyExists { path: String },

    #[error("Study {name} already exists in the store")]
    DuplicatedStudy { name: String },

    #[error("Study not found: {name}")]
    NotFound { name: String },

    #[error("Trial not found: {trial_id}")]
    TrialNotFound { trial_id: i64 },

    #[error("Storage operation failed: {message}")]
    Storage { message: String },

    #[error("Optimizer engine error: {message}")]
    Engine { message: String },
}

/// Per-trial outcomes that are not a plain value
#[derive(Error, Debug)]
pub enum TrialError {
    #[error("Trial was pruned at step {step:?}")]
    Pruned { step: Option<u64> },

    #[error("Resource exhausted during training: {message}")]
    ResourceExhausted { message: String },

    #[error("Training failed: {message}")]
    Failed { message: String },

    #[error("You must return the metric {metric} to the hyperparameter optimizer")]
    MissingMetric { metric: String },

    #[error("Parameter {name} was suggested twice with different distributions")]
    DistributionMismatch { name: String },
}

/// Data utility errors
#[derive(Error, Debug)]
pub enum DataError {
    #[error("Length mismatch: expected {expected}, got {actual}")]
    LengthMismatch { expected: usize, actual: usize },

    #[error("Column not found: {column}")]
    ColumnNotFound { column: String },

    #[error("Invalid split fraction: {value}")]
    InvalidFraction { value: f64 },

    #[error("Arrow error: {message}")]
    Arrow { message: String },

    #[error("GPU query failed: {message}")]
    GpuQuery { message: String },

    #[error("Shape mismatch: expected {expected}, got {actual}")]
    ShapeMismatch { expected: String, actual: String },

    #[error("Tensor operation failed: {message}")]
    Tensor { message: String },
}

/// Batch-scheduler submission errors
#[derive(Error, Debug)]
pub enum LaunchError {
    #[error("Submission command `{command}` failed: {message}")]
    SubmissionFailed { command: String, message: String },

    #[error("No job id in scheduler output: {output:?}")]
    MissingJobId { output: String },
}

/// Result type alias for hypersweep operations
pub type HsResult<T> = Result<T, HsError>;

/// Helper trait for converting string errors
pub trait IntoHsError {
    fn into_hs_error(self) -> HsError;
}

impl IntoHsError for String {
    fn into_hs_error(self) -> HsError {
        HsError::Internal(self)
    }
}

impl IntoHsError for &str {
    fn into_hs_error(self) -> HsError {
        HsError::Internal(self.to_string())
    }
}

/// Macro for creating internal errors
#[macro_export]
macro_rules! internal_error {
    ($($arg:tt)*) => {
        $crate::HsError::Internal(format!($($arg)*))
    };
}

/// Macro for creating configuration errors
#[macro_export]
macro_rules! config_error {
    ($($arg:tt)*) => {
        $crate::HsError::Config($crate::ConfigError::Invalid(format!($($arg)*)))
    };
}
