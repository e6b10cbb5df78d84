use thiserror::Error;

/// Errors raised by the noise schedule, the timestep plan and the samplers.
#[derive(Debug, Error)]
pub enum SamplerError {
    /// Invalid schedule bounds or step counts. Raised at construction time.
    #[error("invalid sampler configuration: {0}")]
    Configuration(String),
    /// A caller-supplied argument was rejected before any state was touched.
    #[error("invalid argument: {0}")]
    Validation(String),
    /// The schedule produced a value the update rule cannot take a root of or divide by.
    #[error("numeric anomaly at timestep {timestep}: {reason}")]
    NumericAnomaly { timestep: usize, reason: String },
    #[error(transparent)]
    Tensor(#[from] tch::TchError),
}

pub type Result<T> = std::result::Result<T, SamplerError>;

impl SamplerError {
    pub(crate) fn anomaly(timestep: usize, reason: impl Into<String>) -> Self {
        SamplerError::NumericAnomaly { timestep, reason: reason.into() }
    }
}
