//! Fuzzing decisions: field mutation, timed duplication and the adaptive
//! fitness engine that tunes per-state mutation probabilities.

pub mod config;
pub mod duplication;
pub mod error;
pub mod fitness;
pub mod limits;
pub mod mutation;
pub mod probability;
pub mod rng;

pub use config::FuzzingConfig;
pub use duplication::{
    Duplicate, DuplicateSink, DuplicateTicket, DuplicationScheduler, DuplicationSettings,
};
pub use error::{OptimizerError, SessionError};
pub use fitness::{
    Evaluator, FitnessEngine, FitnessState, FuzzingSession, Optimizer, ParticleSwarm, Problem,
};
pub use limits::{ResourceChecker, StopConditions, StopReason};
pub use mutation::{MutationEngine, MutationReport, MutationSettings};
pub use probability::{ProbabilityTable, StateProbabilities};
pub use rng::{channel_rng, seeded_rng, RngStream};
