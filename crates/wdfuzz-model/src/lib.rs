//! Protocol state model: dissection capability, state mapping and exclusion rules.

pub mod dissect;
pub mod error;
pub mod exclude;
pub mod graph;
pub mod mapper;
pub mod rules;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use dissect::{
    Direction, Dissector, DissectorFactory, FieldHandle, FieldValue, FilterHandle, NodeKind,
    PacketTree, TreeNode,
};
pub use error::ModelError;
pub use exclude::{ExcludeMask, ExcludeRule, ExclusionEngine};
pub use graph::{
    GraphSnapshot, OffsetPolicy, ProbabilityBlock, State, StateGraph, StateId, Transition,
};
pub use mapper::{
    Classification, LoopReason, MapOutcome, MapperStats, StateMapper, StateMapperConfig,
    TransitionOutcome,
};
pub use rules::{ExcludeRuleConfig, FieldSelector, MappingRule, MappingRuleConfig};
