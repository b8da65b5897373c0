//! Campaign stop conditions.
//!
//! Caps on campaign iterations and wall time. The fitness engine checks
//! them after every iteration and reports the first one hit.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::config::FuzzingConfig;

/// Limits for one fuzzing session. `None` disables a limit.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StopConditions {
    /// Maximum campaign iterations.
    pub max_iterations: Option<u64>,
    /// Maximum wall-clock time since the session started.
    pub max_wall_time: Option<Duration>,
}

impl StopConditions {
    pub fn from_config(config: &FuzzingConfig) -> Self {
        Self {
            max_iterations: (config.max_iterations > 0).then_some(config.max_iterations),
            max_wall_time: (config.max_time_minutes > 0)
                .then(|| Duration::from_secs(config.max_time_minutes * 60)),
        }
    }
}

/// Reason a fuzzing session was stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopReason {
    /// Iteration limit reached.
    MaxIterations,
    /// Wall-clock time limit exceeded.
    WallTime,
}

/// Check progress against limits.
#[derive(Debug, Clone)]
pub struct ResourceChecker {
    limits: StopConditions,
    start_time: Instant,
}

impl ResourceChecker {
    pub fn new(limits: StopConditions) -> Self {
        Self {
            limits,
            start_time: Instant::now(),
        }
    }

    /// Returns None if all ok, or the reason for stopping.
    pub fn check(&self, iterations: u64) -> Option<StopReason> {
        if self.wall_time_exceeded() {
            return Some(StopReason::WallTime);
        }
        match self.limits.max_iterations {
            Some(max) if iterations >= max => Some(StopReason::MaxIterations),
            _ => None,
        }
    }

    pub fn wall_time_exceeded(&self) -> bool {
        self.limits
            .max_wall_time
            .is_some_and(|max| self.start_time.elapsed() >= max)
    }

    pub fn elapsed_secs(&self) -> f64 {
        self.start_time.elapsed().as_secs_f64()
    }

    pub fn limits(&self) -> &StopConditions {
        &self.limits
    }
}
