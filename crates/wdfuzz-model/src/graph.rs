//! The learned protocol state graph.
//!
//! States are keyed by their derived name and numbered in creation order.
//! Transitions are stored as an adjacency map `src -> {dst -> Transition}`
//! with an inverse `dst -> {src}` relation for predecessor queries.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt::Write as _;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::dissect::Direction;

pub type StateId = u32;

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct State {
    pub ordinal: StateId,
    pub name: String,
    pub direction: Direction,
    pub layer_count: u8,
    /// Index of this state's block in the flat mutation-probability vector.
    pub global_layer_offset: u32,
    pub mapping_rule_index: Option<u32>,
    pub created_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transition {
    pub src: StateId,
    pub dst: StateId,
    pub trigger: String,
    pub created_ms: u64,
    /// Times this edge has been traversed.
    pub hits: u64,
}

/// How much of the probability vector each new state reserves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OffsetPolicy {
    /// Layers of every packet that never carry state (frame metadata).
    pub packet_layer_offset: u32,
    /// Extra slots per state for the packet and field probabilities.
    pub layer_count_padding: u32,
}

impl OffsetPolicy {
    /// Slots reserved by a state first seen with `layer_count` layers.
    pub fn block_len(&self, layer_count: u8) -> u32 {
        (layer_count as u32).saturating_sub(self.packet_layer_offset) + self.layer_count_padding
    }
}

/// A state's own slots in the flat mutation-probability vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbabilityBlock {
    pub offset: u32,
    pub len: u32,
}

impl Default for OffsetPolicy {
    fn default() -> Self {
        Self {
            packet_layer_offset: 1,
            layer_count_padding: 2,
        }
    }
}

/// Serializable view of the whole graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphSnapshot {
    pub states: Vec<State>,
    pub transitions: Vec<Transition>,
    pub total_layers: u32,
}

#[derive(Debug, Clone, Default)]
pub struct StateGraph {
    states: Vec<State>,
    by_name: HashMap<String, StateId>,
    outgoing: BTreeMap<StateId, BTreeMap<StateId, Transition>>,
    incoming: BTreeMap<StateId, BTreeSet<StateId>>,
    policy: OffsetPolicy,
    layer_cumulative_count: u32,
}

impl StateGraph {
    pub fn new(policy: OffsetPolicy) -> Self {
        Self {
            policy,
            ..Self::default()
        }
    }

    /// Rebuild a graph from a snapshot, keeping every stored offset.
    pub fn from_snapshot(policy: OffsetPolicy, snapshot: &GraphSnapshot) -> Self {
        let mut graph = Self::new(policy);
        for (i, state) in snapshot.states.iter().enumerate() {
            let mut state = state.clone();
            state.ordinal = i as StateId;
            graph.by_name.insert(state.name.clone(), state.ordinal);
            graph.states.push(state);
        }
        for t in &snapshot.transitions {
            if graph.state(t.src).is_none() || graph.state(t.dst).is_none() {
                continue;
            }
            graph
                .outgoing
                .entry(t.src)
                .or_default()
                .insert(t.dst, t.clone());
            graph.incoming.entry(t.dst).or_default().insert(t.src);
        }
        graph.layer_cumulative_count = snapshot.total_layers;
        graph
    }

    pub fn lookup(&self, name: &str) -> Option<StateId> {
        self.by_name.get(name).copied()
    }

    pub fn policy(&self) -> OffsetPolicy {
        self.policy
    }

    pub fn state(&self, id: StateId) -> Option<&State> {
        self.states.get(id as usize)
    }

    pub fn states(&self) -> &[State] {
        &self.states
    }

    pub fn state_count(&self) -> usize {
        self.states.len()
    }

    /// Length the probability vector needs to cover every state.
    pub fn total_layers(&self) -> u32 {
        self.layer_cumulative_count
    }

    /// Return the state named `name`, creating it if absent.
    ///
    /// A new state's offset is the running total of the blocks reserved by
    /// previously created states.
    pub fn add_state(
        &mut self,
        name: &str,
        direction: Direction,
        layer_count: u8,
        mapping_rule_index: Option<u32>,
    ) -> StateId {
        if let Some(id) = self.lookup(name) {
            return id;
        }
        let id = self.states.len() as StateId;
        self.states.push(State {
            ordinal: id,
            name: name.to_string(),
            direction,
            layer_count,
            global_layer_offset: self.layer_cumulative_count,
            mapping_rule_index,
            created_ms: now_ms(),
        });
        self.by_name.insert(name.to_string(), id);
        self.layer_cumulative_count += self.policy.block_len(layer_count);
        id
    }

    pub fn block(&self, id: StateId) -> Option<ProbabilityBlock> {
        self.state(id).map(|s| ProbabilityBlock {
            offset: s.global_layer_offset,
            len: self.policy.block_len(s.layer_count),
        })
    }

    pub fn transition(&self, src: StateId, dst: StateId) -> Option<&Transition> {
        self.outgoing.get(&src).and_then(|t| t.get(&dst))
    }

    /// Link `src -> dst`. Returns true if the pair was not linked before.
    pub fn link(&mut self, src: StateId, dst: StateId, trigger: &str) -> bool {
        let table = self.outgoing.entry(src).or_default();
        if let Some(existing) = table.get_mut(&dst) {
            existing.hits += 1;
            return false;
        }
        table.insert(
            dst,
            Transition {
                src,
                dst,
                trigger: trigger.to_string(),
                created_ms: now_ms(),
                hits: 1,
            },
        );
        self.incoming.entry(dst).or_default().insert(src);
        true
    }

    pub fn successors(&self, id: StateId) -> impl Iterator<Item = StateId> + '_ {
        self.outgoing.get(&id).into_iter().flat_map(|t| t.keys().copied())
    }

    pub fn predecessors(&self, id: StateId) -> impl Iterator<Item = StateId> + '_ {
        self.incoming.get(&id).into_iter().flat_map(|s| s.iter().copied())
    }

    pub fn transition_count(&self) -> usize {
        self.outgoing.values().map(BTreeMap::len).sum()
    }

    /// Drop every state and transition.
    pub fn clear(&mut self) {
        let policy = self.policy;
        *self = Self::new(policy);
    }

    /// Graphviz rendering, nodes labelled with state names.
    pub fn to_dot(&self, highlight: Option<StateId>) -> String {
        let mut out = String::from("digraph PROTOCOL_STATE_MACHINE {\n");
        for s in &self.states {
            let label = s.name.replace('"', "\\\"");
            if Some(s.ordinal) == highlight {
                let _ = writeln!(out, "  n{} [label=\"{}\", color=blue];", s.ordinal, label);
            } else {
                let _ = writeln!(out, "  n{} [label=\"{}\"];", s.ordinal, label);
            }
        }
        for table in self.outgoing.values() {
            for t in table.values() {
                let _ = writeln!(out, "  n{} -> n{} [label=\"{}\"];", t.src, t.dst, t.hits);
            }
        }
        out.push_str("}\n");
        out
    }

    pub fn snapshot(&self) -> GraphSnapshot {
        GraphSnapshot {
            states: self.states.clone(),
            transitions: self
                .outgoing
                .values()
                .flat_map(|t| t.values().cloned())
                .collect(),
            total_layers: self.layer_cumulative_count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offsets_accumulate_with_padding() {
        let mut g = StateGraph::new(OffsetPolicy::default());
        let a = g.add_state("RX / RRC / a", Direction::Rx, 4, Some(0));
        let b = g.add_state("RX / RRC / b", Direction::Rx, 3, Some(0));
        assert_eq!(g.state(a).unwrap().global_layer_offset, 0);
        // (4 - 1) + 2
        assert_eq!(g.state(b).unwrap().global_layer_offset, 5);
        // (3 - 1) + 2
        assert_eq!(g.total_layers(), 9);
        assert_eq!(g.block(a), Some(ProbabilityBlock { offset: 0, len: 5 }));
        assert_eq!(g.block(b), Some(ProbabilityBlock { offset: 5, len: 4 }));
        assert_eq!(g.block(7), None);
    }

    #[test]
    fn test_offset_policy_is_configurable() {
        let mut g = StateGraph::new(OffsetPolicy {
            packet_layer_offset: 0,
            layer_count_padding: 0,
        });
        g.add_state("a", Direction::Tx, 2, None);
        let b = g.add_state("b", Direction::Tx, 2, None);
        assert_eq!(g.state(b).unwrap().global_layer_offset, 2);
    }

    #[test]
    fn test_add_state_is_idempotent_by_name() {
        let mut g = StateGraph::new(OffsetPolicy::default());
        let a = g.add_state("s", Direction::Rx, 2, None);
        let again = g.add_state("s", Direction::Rx, 5, None);
        assert_eq!(a, again);
        assert_eq!(g.state_count(), 1);
        assert_eq!(g.total_layers(), 3);
    }

    #[test]
    fn test_link_once_per_pair() {
        let mut g = StateGraph::new(OffsetPolicy::default());
        let a = g.add_state("a", Direction::Rx, 1, None);
        let b = g.add_state("b", Direction::Rx, 1, None);
        assert!(g.link(a, b, ""));
        assert!(!g.link(a, b, ""));
        assert!(g.link(b, a, ""));
        assert_eq!(g.transition_count(), 2);
        assert_eq!(g.transition(a, b).unwrap().hits, 2);
        assert_eq!(g.successors(a).collect::<Vec<_>>(), vec![b]);
        assert_eq!(g.predecessors(a).collect::<Vec<_>>(), vec![b]);
    }

    #[test]
    fn test_dot_export_lists_nodes_and_edges() {
        let mut g = StateGraph::new(OffsetPolicy::default());
        let a = g.add_state("RX / RRC / setup", Direction::Rx, 1, None);
        let b = g.add_state("RX / RRC / release", Direction::Rx, 1, None);
        g.link(a, b, "");
        let dot = g.to_dot(Some(b));
        assert!(dot.starts_with("digraph"));
        assert!(dot.contains("n0 [label=\"RX / RRC / setup\"]"));
        assert!(dot.contains("color=blue"));
        assert!(dot.contains("n0 -> n1"));
    }

    #[test]
    fn test_from_snapshot_keeps_offsets() {
        let mut g = StateGraph::new(OffsetPolicy::default());
        let a = g.add_state("a", Direction::Tx, 4, None);
        let b = g.add_state("b", Direction::Rx, 2, None);
        g.link(a, b, "");
        let restored = StateGraph::from_snapshot(OffsetPolicy::default(), &g.snapshot());
        assert_eq!(restored.lookup("b"), Some(b));
        assert_eq!(restored.state(b).unwrap().global_layer_offset, 5);
        assert_eq!(restored.total_layers(), g.total_layers());
        assert_eq!(restored.predecessors(b).collect::<Vec<_>>(), vec![a]);

        // New states continue after the restored block.
        let mut restored = restored;
        let c = restored.add_state("c", Direction::Rx, 1, None);
        assert_eq!(restored.state(c).unwrap().global_layer_offset, 8);
    }

    #[test]
    fn test_snapshot_serializes() {
        let mut g = StateGraph::new(OffsetPolicy::default());
        let a = g.add_state("a", Direction::Tx, 3, Some(1));
        let b = g.add_state("b", Direction::Rx, 3, Some(1));
        g.link(a, b, "go");
        let json = serde_json::to_string(&g.snapshot()).unwrap();
        let back: GraphSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(back.states.len(), 2);
        assert_eq!(back.transitions[0].trigger, "go");
        assert_eq!(back.total_layers, 8);
    }
}
