use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Failures surfaced by a training run.
///
/// The supervisor restarts a run only when [`Error::is_retryable`] holds;
/// everything else terminates the process with a distinct status.
#[derive(Debug, Error)]
pub enum Error {
    #[error("process group initialization failed: {0}")]
    Initialization(String),

    #[error("collective transport error: {0}")]
    Transport(String),

    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    /// The stored checkpoint can never be used as-is: bad digest, unknown
    /// version, undecodable payload, or a layout the model does not match.
    #[error("invalid checkpoint: {0}")]
    InvalidCheckpoint(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("replica layout mismatch on rank {rank}: {detail}")]
    ReplicaMismatch { rank: usize, detail: String },

    #[error("loss scale diverged across ranks: {0}")]
    ScaleDivergence(String),

    #[error(transparent)]
    Candle(#[from] candle_core::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Initialization(_)
            | Error::Transport(_)
            | Error::Checkpoint(_)
            | Error::Candle(_)
            | Error::Io(_) => true,
            Error::Config(_)
            | Error::InvalidCheckpoint(_)
            | Error::ReplicaMismatch { .. }
            | Error::ScaleDivergence(_)
            | Error::Json(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_failures_are_retryable() {
        assert!(Error::Initialization("peer unreachable".into()).is_retryable());
        assert!(Error::Transport("timed out".into()).is_retryable());
        assert!(Error::Io(std::io::Error::other("disk")).is_retryable());
    }

    #[test]
    fn configuration_failures_are_fatal() {
        assert!(!Error::Config("batch size must be positive".into()).is_retryable());
        assert!(!Error::ReplicaMismatch { rank: 1, detail: "shape".into() }.is_retryable());
        assert!(!Error::ScaleDivergence("65536 vs 32768".into()).is_retryable());
        assert!(!Error::InvalidCheckpoint("digest mismatch".into()).is_retryable());
        assert!(Error::Checkpoint("directory missing".into()).is_retryable());
    }
}
