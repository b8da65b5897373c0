//! Fuzzing configuration.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use wdfuzz_model::ExcludeRuleConfig;

/// Mutation, duplication and optimizer settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FuzzingConfig {
    /// Exclusion rules evaluated on every packet.
    pub excludes: Vec<ExcludeRuleConfig>,
    pub enable_mutation: bool,
    pub enable_duplication: bool,
    pub enable_optimization: bool,
    /// Packet-level mutation probability when no optimizer value applies.
    pub default_mutation_probability: f64,
    /// Field-level mutation probability when no optimizer value applies.
    pub default_mutation_field_probability: f64,
    pub default_duplication_probability: f64,
    /// Fields altered per packet before the walk stops. 0 means no cap.
    pub max_fields_mutation: u32,
    /// Leading top-level layers (frame metadata) never mutated.
    pub mutation_skip_layers: u32,
    /// Upper bound of the random duplicate delay.
    pub max_duplication_time_ms: u64,
    /// Duplicates scheduled but not yet delivered.
    pub max_pending_duplicates: usize,
    pub random_seed: u64,
    /// Persist the optimizer session after every iteration.
    pub save_session: bool,
    /// Resume from `session_path` on startup when it matches.
    pub restore_session: bool,
    pub session_path: PathBuf,
    pub population_size: u32,
    /// Generations per optimizer evolve call.
    pub generations: u32,
    /// Stop after this many campaign iterations. 0 disables.
    pub max_iterations: u64,
    /// Stop after this many minutes. 0 disables.
    pub max_time_minutes: u64,
    /// RX summary substring that ends a campaign iteration.
    pub iteration_trigger: Option<String>,
    /// TX summary substring that arms the next iteration boundary.
    pub iteration_rearm: Option<String>,
}

impl Default for FuzzingConfig {
    fn default() -> Self {
        Self {
            excludes: Vec::new(),
            enable_mutation: true,
            enable_duplication: false,
            enable_optimization: false,
            default_mutation_probability: 0.2,
            default_mutation_field_probability: 0.1,
            default_duplication_probability: 0.05,
            max_fields_mutation: 2,
            mutation_skip_layers: 1,
            max_duplication_time_ms: 6000,
            max_pending_duplicates: 30,
            random_seed: 123_456_789,
            save_session: false,
            restore_session: false,
            session_path: PathBuf::from("session.cbor.gz"),
            population_size: 5,
            generations: 200,
            max_iterations: 0,
            max_time_minutes: 0,
            iteration_trigger: None,
            iteration_rearm: None,
        }
    }
}

impl FuzzingConfig {
    /// Human-readable problems with the configured values, empty when valid.
    pub fn problems(&self) -> Vec<String> {
        let mut out = Vec::new();
        for (name, p) in [
            ("default_mutation_probability", self.default_mutation_probability),
            (
                "default_mutation_field_probability",
                self.default_mutation_field_probability,
            ),
            (
                "default_duplication_probability",
                self.default_duplication_probability,
            ),
        ] {
            if !(0.0..=1.0).contains(&p) {
                out.push(format!("{name} must be within [0, 1], got {p}"));
            }
        }
        if self.enable_duplication && self.max_duplication_time_ms == 0 {
            out.push("max_duplication_time_ms must be at least 1".to_string());
        }
        if self.enable_optimization && self.population_size == 0 {
            out.push("population_size must be at least 1".to_string());
        }
        if self.enable_optimization && self.generations == 0 {
            out.push("generations must be at least 1".to_string());
        }
        out
    }
}
