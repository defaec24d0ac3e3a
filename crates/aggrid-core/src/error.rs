//! Error type for aggregation contract checks and backend capability probes.

/// Errors raised before any accumulation starts.
///
/// Contract violations (bad channel descriptors, missing weights) are caller
/// bugs; `BackendUnavailable` is recovered inside the engine.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum AggError {
    #[error("unsupported aggregation operation '{0}'")]
    UnsupportedOperation(String),

    #[error("channel '{id}': {reason}")]
    InvalidChannel { id: String, reason: String },

    #[error("duplicate channel id '{0}'")]
    DuplicateChannel(String),

    #[error("channel '{channel}': missing weight column '{column}'")]
    MissingWeights { channel: String, column: String },

    #[error("channel '{channel}': column '{column}' has {got} values, expected {expected}")]
    WeightLengthMismatch { channel: String, column: String, got: usize, expected: usize },

    #[error("invalid cell size [{0}, {1}]")]
    InvalidCellSize(f64, f64),

    #[error("invalid grid: {0}")]
    InvalidGrid(String),

    #[error("parallel backend unavailable: {0}")]
    BackendUnavailable(String),
}

impl AggError {
    pub fn invalid_channel<T: ToString>(id: &str, reason: T) -> Self {
        AggError::InvalidChannel { id: id.to_string(), reason: reason.to_string() }
    }

    pub fn invalid_grid<T: ToString>(msg: T) -> Self {
        AggError::InvalidGrid(msg.to_string())
    }

    pub fn backend<T: ToString>(msg: T) -> Self {
        AggError::BackendUnavailable(msg.to_string())
    }
}

pub type AggResult<T> = Result<T, AggError>;
