use std::io;

/// Failures reading, writing or validating a persisted fuzzing session.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The stored session does not fit the running configuration.
    #[error("Session mismatch on {what}: expected {expected}, found {found}")]
    Mismatch {
        what: &'static str,
        expected: u64,
        found: u64,
    },

    #[error("Unsupported session version {0}")]
    Version(u32),

    #[error("Session I/O failed: {0}")]
    Io(#[from] io::Error),

    #[error("Session encoding failed: {0}")]
    Encode(String),

    #[error("Session decoding failed: {0}")]
    Decode(String),
}

/// Failures of the optimizer handoff.
#[derive(Debug, thiserror::Error)]
pub enum OptimizerError {
    /// The optimizer thread has exited; no further candidates will come.
    #[error("Optimizer stopped")]
    Stopped,

    /// The engine side of the handoff is gone.
    #[error("Optimizer handoff disconnected")]
    Disconnected,

    /// The engine was used outside its state machine.
    #[error("Fitness engine is {0}")]
    InvalidState(&'static str),

    /// The optimization algorithm itself failed.
    #[error("Optimizer failed: {0}")]
    Algorithm(String),

    #[error(transparent)]
    Session(#[from] SessionError),
}
