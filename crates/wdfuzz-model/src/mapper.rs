//! State mapper: classifies dissected packets into named protocol states
//! and tracks the walk through the learned state graph.
//!
//! Rules are tried in declaration order and the first whose filter matches
//! names the state as `"{direction} / {layer_name} / {value}"`, optionally
//! followed by `" / {summary}"`. [`StateMapper::transition`] is the only
//! place the graph is mutated; callers serialise access with a single lock.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::dissect::{Direction, Dissector, DissectorFactory, FieldValue, PacketTree};
use crate::error::ModelError;
use crate::graph::{GraphSnapshot, OffsetPolicy, ProbabilityBlock, State, StateGraph, StateId};
use crate::rules::{compile_mapping_rules, MappingRule, MappingRuleConfig};

/// State mapper configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StateMapperConfig {
    /// Ordered mapping rules.
    pub mapping: Vec<MappingRuleConfig>,
    /// Leading layers of every packet excluded from a state's probability block.
    pub packet_layer_offset: u32,
    /// Extra probability slots reserved per state (packet + field gates).
    pub layer_count_padding: u32,
    /// Consecutive malformed / same-state RX packets before a loop is reported. 0 disables.
    pub loop_detection_threshold: u32,
    /// State to return to at the start of each campaign iteration.
    pub initial_state: Option<String>,
    /// Learned graph loaded at startup and written back on shutdown.
    pub model_path: Option<PathBuf>,
}

impl Default for StateMapperConfig {
    fn default() -> Self {
        let policy = OffsetPolicy::default();
        Self {
            mapping: Vec::new(),
            packet_layer_offset: policy.packet_layer_offset,
            layer_count_padding: policy.layer_count_padding,
            loop_detection_threshold: 0,
            initial_state: None,
            model_path: None,
        }
    }
}

/// Why a loop was reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoopReason {
    /// The target keeps receiving packets the dissector flags as malformed.
    Malformed,
    /// The target keeps receiving packets that map to the state it is already in.
    SameState,
}

/// A packet's classification, computed without touching the graph.
#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub name: String,
    pub rule_index: u32,
    pub field_name: String,
    pub value: FieldValue,
    pub direction: Direction,
    pub layer_count: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionOutcome {
    /// No current state yet; the destination becomes current without an edge.
    Entered { state: StateId, created: bool },
    /// Moved along an edge. `new_edge` is set the first time the pair is linked.
    Moved {
        from: StateId,
        to: StateId,
        created: bool,
        new_edge: bool,
    },
    /// The destination is the current state.
    Stayed { state: StateId },
    /// No edge leads from the current state to `to` and new edges are not
    /// being learned. The current state is unchanged.
    NoEdge { from: StateId, to: StateId },
}

impl TransitionOutcome {
    pub fn state(&self) -> StateId {
        match *self {
            TransitionOutcome::Entered { state, .. } => state,
            TransitionOutcome::Moved { to, .. } => to,
            TransitionOutcome::Stayed { state } => state,
            TransitionOutcome::NoEdge { from, .. } => from,
        }
    }

    /// Whether the mapper is now in the destination state.
    pub fn reached(&self) -> bool {
        !matches!(self, TransitionOutcome::NoEdge { .. })
    }
}

/// Everything the mapper concluded about one packet.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MapOutcome {
    pub classification: Option<Classification>,
    pub transition: Option<TransitionOutcome>,
    pub loop_detected: Option<LoopReason>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MapperStats {
    pub states: usize,
    pub unique_transitions: u64,
    pub known_transitions: u64,
}

#[derive(Debug)]
pub struct StateMapper {
    rules: Vec<MappingRule>,
    graph: StateGraph,
    current: Option<StateId>,
    previous: Option<StateId>,
    initial_state: Option<String>,
    unique_transitions: u64,
    known_transitions: u64,
    loop_threshold: u32,
    malformed_count: u32,
    same_state_count: u32,
}

impl StateMapper {
    /// Compile the mapping rules. A rule that fails to compile aborts startup.
    pub fn new(
        factory: &dyn DissectorFactory,
        config: &StateMapperConfig,
    ) -> Result<Self, ModelError> {
        let rules = compile_mapping_rules(factory, &config.mapping)?;
        info!(rules = rules.len(), "state mapper loaded");
        Ok(Self::from_rules(rules, config))
    }

    pub fn from_rules(rules: Vec<MappingRule>, config: &StateMapperConfig) -> Self {
        Self {
            rules,
            graph: StateGraph::new(OffsetPolicy {
                packet_layer_offset: config.packet_layer_offset,
                layer_count_padding: config.layer_count_padding,
            }),
            current: None,
            previous: None,
            initial_state: config.initial_state.clone(),
            unique_transitions: 0,
            known_transitions: 0,
            loop_threshold: config.loop_detection_threshold,
            malformed_count: 0,
            same_state_count: 0,
        }
    }

    pub fn rules(&self) -> &[MappingRule] {
        &self.rules
    }

    pub fn graph(&self) -> &StateGraph {
        &self.graph
    }

    /// Register every rule's filter and fields with a per-thread dissector.
    pub fn prepare(&self, dissector: &mut dyn Dissector) {
        let filters: Vec<_> = self.rules.iter().map(|r| r.filter).collect();
        let fields: Vec<_> = self
            .rules
            .iter()
            .flat_map(|r| r.field_selectors.iter().copied())
            .collect();
        dissector.declare_interest(&filters, &fields);
    }

    /// Name the state this packet belongs to, if any rule matches.
    pub fn classify(&self, dissector: &dyn Dissector, tree: &PacketTree) -> Option<Classification> {
        let rule = self
            .rules
            .iter()
            .find(|r| dissector.read_filter(tree, r.filter))?;

        let (field_name, value) = rule
            .field_selectors
            .iter()
            .zip(&rule.field_names)
            .find_map(|(handle, name)| {
                dissector
                    .read_field(tree, *handle)
                    .map(|v| (name.clone(), v))
            })?;

        let mut name = format!("{} / {} / {}", tree.direction, rule.layer_name, value);
        if rule.append_summary {
            name.push_str(" / ");
            name.push_str(&dissector.summary(tree));
        }

        Some(Classification {
            name,
            rule_index: rule.index,
            field_name,
            value,
            direction: tree.direction,
            layer_count: tree.layer_count().min(u8::MAX as usize) as u8,
        })
    }

    /// Move to the state named by `dst`.
    ///
    /// Unknown states and missing edges are created when `create_if_missing`
    /// is set. Otherwise an unknown state is [`ModelError::UnknownState`] and
    /// a missing edge is [`TransitionOutcome::NoEdge`]; neither changes anything.
    pub fn transition(
        &mut self,
        dst: &Classification,
        create_if_missing: bool,
    ) -> Result<TransitionOutcome, ModelError> {
        let (to, created) = match self.graph.lookup(&dst.name) {
            Some(id) => (id, false),
            None if create_if_missing => {
                let id = self.graph.add_state(
                    &dst.name,
                    dst.direction,
                    dst.layer_count,
                    Some(dst.rule_index),
                );
                debug!(state = %dst.name, id, "new state");
                (id, true)
            }
            None => return Err(ModelError::UnknownState(dst.name.clone())),
        };
        Ok(self.move_to(to, created, create_if_missing))
    }

    /// Move to an existing state by name along a known edge. Never creates
    /// states or edges.
    pub fn transition_by_name(&mut self, name: &str) -> Result<TransitionOutcome, ModelError> {
        let to = self
            .graph
            .lookup(name)
            .ok_or_else(|| ModelError::UnknownState(name.to_string()))?;
        Ok(self.move_to(to, false, false))
    }

    fn move_to(&mut self, to: StateId, created: bool, link_new: bool) -> TransitionOutcome {
        let Some(from) = self.current else {
            self.current = Some(to);
            return TransitionOutcome::Entered { state: to, created };
        };

        let known_edge = self.graph.transition(from, to).is_some();
        if from != to && !known_edge && !link_new {
            return TransitionOutcome::NoEdge { from, to };
        }

        let mut new_edge = false;
        if known_edge || link_new {
            new_edge = self.graph.link(from, to, "");
            if new_edge {
                self.unique_transitions += 1;
            }
        }

        self.previous = Some(from);
        self.current = Some(to);

        if from == to {
            TransitionOutcome::Stayed { state: to }
        } else {
            self.known_transitions += 1;
            TransitionOutcome::Moved {
                from,
                to,
                created,
                new_edge,
            }
        }
    }

    fn detect_loop(&mut self, tree: &PacketTree, transition: Option<&TransitionOutcome>) -> Option<LoopReason> {
        if self.loop_threshold == 0 || tree.direction != Direction::Rx {
            return None;
        }

        if tree.malformed {
            self.malformed_count += 1;
            if self.malformed_count >= self.loop_threshold {
                self.malformed_count = 0;
                return Some(LoopReason::Malformed);
            }
        } else {
            self.malformed_count = 0;
        }

        match transition {
            Some(TransitionOutcome::Stayed { .. }) => {
                self.same_state_count += 1;
                if self.same_state_count >= self.loop_threshold {
                    self.same_state_count = 0;
                    return Some(LoopReason::SameState);
                }
            }
            Some(TransitionOutcome::NoEdge { .. }) | None => {}
            Some(_) => self.same_state_count = 0,
        }
        None
    }

    /// Classify, transition and run loop detection for one packet.
    ///
    /// An unknown state with `create_if_missing` off leaves the model untouched.
    pub fn map_packet(
        &mut self,
        dissector: &dyn Dissector,
        tree: &PacketTree,
        create_if_missing: bool,
    ) -> MapOutcome {
        let classification = self.classify(dissector, tree);
        let transition = match &classification {
            Some(c) => match self.transition(c, create_if_missing) {
                Ok(t) => Some(t),
                Err(e) => {
                    debug!(error = %e, "no state transition");
                    None
                }
            },
            None => None,
        };
        let loop_detected = self.detect_loop(tree, transition.as_ref());
        MapOutcome {
            classification,
            transition,
            loop_detected,
        }
    }

    pub fn current_state(&self) -> Option<&State> {
        self.current.and_then(|id| self.graph.state(id))
    }

    pub fn current_state_name(&self) -> Option<&str> {
        self.current_state().map(|s| s.name.as_str())
    }

    pub fn previous_state_name(&self) -> Option<&str> {
        self.previous
            .and_then(|id| self.graph.state(id))
            .map(|s| s.name.as_str())
    }

    /// Offset of the current state's block in the probability vector.
    pub fn current_offset(&self) -> Option<u32> {
        self.current_state().map(|s| s.global_layer_offset)
    }

    pub fn current_block(&self) -> Option<ProbabilityBlock> {
        self.current.and_then(|id| self.graph.block(id))
    }

    /// Names of the states reachable in one step from the current state.
    pub fn next_state_names(&self) -> Vec<String> {
        let Some(current) = self.current else {
            return Vec::new();
        };
        self.graph
            .successors(current)
            .filter_map(|id| self.graph.state(id))
            .map(|s| s.name.clone())
            .collect()
    }

    pub fn unique_transitions(&self) -> u64 {
        self.unique_transitions
    }

    pub fn known_transitions(&self) -> u64 {
        self.known_transitions
    }

    pub fn stats(&self) -> MapperStats {
        MapperStats {
            states: self.graph.state_count(),
            unique_transitions: self.unique_transitions,
            known_transitions: self.known_transitions,
        }
    }

    /// Clear per-iteration counters. The learned graph is kept.
    pub fn reset_stats(&mut self) {
        self.known_transitions = 0;
    }

    /// Return to the configured initial state, or to no state at all.
    pub fn go_to_initial_state(&mut self) {
        self.reset_stats();
        self.previous = None;
        self.current = self
            .initial_state
            .as_deref()
            .and_then(|name| self.graph.lookup(name));
        self.malformed_count = 0;
        self.same_state_count = 0;
    }

    /// Forget the learned graph entirely.
    pub fn reset_model(&mut self) {
        self.graph.clear();
        self.current = None;
        self.previous = None;
        self.unique_transitions = 0;
        self.known_transitions = 0;
        self.malformed_count = 0;
        self.same_state_count = 0;
    }

    pub fn to_dot(&self) -> String {
        self.graph.to_dot(self.current)
    }

    pub fn snapshot(&self) -> GraphSnapshot {
        self.graph.snapshot()
    }

    /// Write the graph as pretty JSON.
    pub fn export_json(&self, path: &Path) -> Result<(), ModelError> {
        let json = serde_json::to_string_pretty(&self.snapshot())?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Replace the learned graph with `snapshot`. Counters restart from the
    /// restored graph and there is no current state.
    pub fn restore(&mut self, snapshot: &GraphSnapshot) {
        self.graph = StateGraph::from_snapshot(self.graph.policy(), snapshot);
        self.current = None;
        self.previous = None;
        self.unique_transitions = self.graph.transition_count() as u64;
        self.known_transitions = 0;
        self.malformed_count = 0;
        self.same_state_count = 0;
    }

    /// Load a graph written by [`StateMapper::export_json`].
    pub fn import_json(&mut self, path: &Path) -> Result<(), ModelError> {
        let snapshot: GraphSnapshot = serde_json::from_str(&std::fs::read_to_string(path)?)?;
        info!(
            states = snapshot.states.len(),
            transitions = snapshot.transitions.len(),
            path = %path.display(),
            "state model loaded"
        );
        self.restore(&snapshot);
        Ok(())
    }
}
