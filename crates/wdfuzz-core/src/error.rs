use std::io;

use wdfuzz_explore::{OptimizerError, SessionError};
use wdfuzz_model::ModelError;
use wdfuzz_shm::TransportError;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Config parse error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Config read failed: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid config: {}", .0.join("; "))]
    Invalid(Vec<String>),
}

/// Startup failures. Anything returned from [`crate::FuzzingEngine::start`]
/// happened before a channel thread was spawned.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Model error: {0}")]
    Model(#[from] ModelError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Optimizer error: {0}")]
    Optimizer(#[from] OptimizerError),

    #[error("Thread spawn failed: {0}")]
    Spawn(#[from] io::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("Target process not running")]
    NotRunning,

    #[error("Supervisor failed to {op}: {reason}")]
    Failed { op: &'static str, reason: String },
}
