//! Probabilistic field mutation of intercepted packets.
//!
//! A packet is first gated as a whole. Past the gate the dissected tree is
//! walked depth-first, skipping the leading frame-metadata layers; every leaf
//! field with on-wire bytes draws its own chance of being overwritten with
//! random bytes. When the optimizer drives the probabilities, each layer
//! crossed draws a gate that arms or disarms the fields beneath it.

use std::ops::ControlFlow;
use std::sync::Arc;

use rand::Rng;
use tracing::trace;
use wdfuzz_model::{ExcludeMask, NodeKind, PacketTree, ProbabilityBlock, TreeNode};

use crate::config::FuzzingConfig;
use crate::probability::{ProbabilityTable, StateProbabilities};

#[derive(Debug, Clone, PartialEq)]
pub struct MutationSettings {
    pub enable_mutation: bool,
    pub default_packet_probability: f64,
    pub default_field_probability: f64,
    /// 0 means no cap.
    pub max_fields: u32,
    pub skip_layers: u32,
}

impl From<&FuzzingConfig> for MutationSettings {
    fn from(config: &FuzzingConfig) -> Self {
        Self {
            enable_mutation: config.enable_mutation,
            default_packet_probability: config.default_mutation_probability,
            default_field_probability: config.default_mutation_field_probability,
            max_fields: config.max_fields_mutation,
            skip_layers: config.mutation_skip_layers,
        }
    }
}

/// What happened to one packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MutationReport {
    /// At least one field was overwritten.
    pub fuzzed: bool,
    pub fields_mutated: u32,
}

#[derive(Debug, Clone)]
pub struct MutationEngine {
    settings: MutationSettings,
    probabilities: Arc<ProbabilityTable>,
}

impl MutationEngine {
    pub fn new(settings: MutationSettings, probabilities: Arc<ProbabilityTable>) -> Self {
        Self {
            settings,
            probabilities,
        }
    }

    pub fn settings(&self) -> &MutationSettings {
        &self.settings
    }

    /// Decide and apply mutations for one packet.
    ///
    /// `tree` must describe `packet` as it is now; field offsets index it
    /// directly. `state_block` is the current state's block in the
    /// probability vector, if there is a current state.
    pub fn packet_fuzzing<R: Rng>(
        &self,
        rng: &mut R,
        tree: &PacketTree,
        packet: &mut [u8],
        state_block: Option<ProbabilityBlock>,
        exclude: ExcludeMask,
    ) -> MutationReport {
        if !self.settings.enable_mutation || exclude.forbids(ExcludeMask::MUTATION) {
            return MutationReport::default();
        }

        let individual = self.probabilities.snapshot();
        let state = if self.probabilities.is_optimizing() {
            StateProbabilities::resolve(&individual, state_block)
        } else {
            None
        };

        let p_packet = state.map_or(self.settings.default_packet_probability, |s| s.packet());
        if rng.gen::<f64>() >= p_packet {
            return MutationReport::default();
        }

        let mut walk = FieldWalk {
            rng,
            packet,
            state,
            field_probability: state
                .and_then(|s| s.field())
                .unwrap_or(self.settings.default_field_probability),
            layer_fallback: self.settings.default_packet_probability,
            max_fields: self.settings.max_fields,
            mutated: 0,
            layer_index: 0,
            armed: true,
        };

        let mut skipped = 0;
        for node in &tree.nodes {
            if node.kind == NodeKind::Layer && skipped < self.settings.skip_layers {
                skipped += 1;
                continue;
            }
            if walk.visit(node).is_break() {
                break;
            }
        }

        trace!(fields = walk.mutated, "packet mutated");
        MutationReport {
            fuzzed: walk.mutated > 0,
            fields_mutated: walk.mutated,
        }
    }
}

struct FieldWalk<'a, R> {
    rng: &'a mut R,
    packet: &'a mut [u8],
    state: Option<StateProbabilities<'a>>,
    field_probability: f64,
    layer_fallback: f64,
    max_fields: u32,
    mutated: u32,
    layer_index: usize,
    armed: bool,
}

impl<R: Rng> FieldWalk<'_, R> {
    fn visit(&mut self, node: &TreeNode) -> ControlFlow<()> {
        match node.kind {
            NodeKind::Layer => {
                let outer = self.armed;
                if let Some(state) = self.state {
                    let p = state.layer(self.layer_index).unwrap_or(self.layer_fallback);
                    self.armed = self.rng.gen::<f64>() < p;
                }
                self.layer_index += 1;
                let flow = self.children(node);
                self.armed = outer;
                flow
            }
            NodeKind::Group => self.children(node),
            NodeKind::Field => {
                if self.armed && node.length > 0 && self.rng.gen::<f64>() < self.field_probability {
                    self.overwrite(node);
                    if self.max_fields > 0 && self.mutated >= self.max_fields {
                        return ControlFlow::Break(());
                    }
                }
                self.children(node)
            }
        }
    }

    fn children(&mut self, node: &TreeNode) -> ControlFlow<()> {
        for child in &node.children {
            self.visit(child)?;
        }
        ControlFlow::Continue(())
    }

    fn overwrite(&mut self, node: &TreeNode) {
        let Some(end) = node.offset.checked_add(node.length) else {
            return;
        };
        if let Some(bytes) = self.packet.get_mut(node.offset..end) {
            self.rng.fill(bytes);
            self.mutated += 1;
        }
    }
}
