use crate::sink::SinkError;
use thiserror::Error;

/// Why a build step did not complete.
#[derive(Debug, Error)]
pub enum StepError {
    #[error("{step} could not be started: {source}")]
    Spawn {
        step: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{step} exited with {status}")]
    Failed {
        step: String,
        status: String,
        /// Last lines of combined output, for the error message.
        output: String,
    },

    #[error("timed out")]
    TimedOut,

    #[error("cancelled")]
    Cancelled,

    #[error("log storage failed: {0}")]
    Storage(#[from] SinkError),

    #[error("workspace error: {0}")]
    Workspace(#[source] std::io::Error),
}

impl StepError {
    /// True for timeout and cancellation, which are not step failures as such.
    pub fn is_interrupt(&self) -> bool {
        matches!(self, StepError::TimedOut | StepError::Cancelled)
    }
}

impl From<StepError> for minici_core::Error {
    fn from(err: StepError) -> Self {
        match err {
            StepError::TimedOut => minici_core::Error::Timeout("build deadline exceeded".into()),
            StepError::Cancelled => minici_core::Error::Cancelled,
            StepError::Storage(e) => minici_core::Error::Storage(e.to_string()),
            StepError::Failed {
                ref output,
                ..
            } if !output.is_empty() => {
                minici_core::Error::ExecutionFailed(format!("{}\n{}", err, output))
            }
            other => minici_core::Error::ExecutionFailed(other.to_string()),
        }
    }
}
