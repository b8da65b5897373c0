//! Per-packet exclusion of fuzzing actions.
//!
//! Every rule whose filter matches contributes its mask; the result is the
//! OR of all of them. Evaluation never mutates anything.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::dissect::{Dissector, DissectorFactory, FilterHandle, PacketTree};
use crate::error::ModelError;
use crate::rules::ExcludeRuleConfig;

bitflags! {
    /// Actions forbidden for a packet.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct ExcludeMask: u8 {
        const ALL = 1 << 0;
        const MUTATION = 1 << 1;
        const DUPLICATION = 1 << 2;
        const VALIDATION = 1 << 3;
        const MAPPING = 1 << 4;
        const RETRY = 1 << 5;
    }
}

impl ExcludeMask {
    /// Parse `apply_to` letters. Unknown letters exclude everything.
    pub fn from_letters(letters: &str) -> Self {
        let mut mask = ExcludeMask::empty();
        for c in letters.chars().filter(|c| !c.is_whitespace() && *c != ',') {
            mask |= match c.to_ascii_uppercase() {
                'A' => ExcludeMask::all(),
                'M' => ExcludeMask::MUTATION,
                'D' => ExcludeMask::DUPLICATION,
                'V' => ExcludeMask::VALIDATION,
                'S' => ExcludeMask::MAPPING,
                'R' => ExcludeMask::RETRY,
                _ => ExcludeMask::all(),
            };
        }
        if mask.is_empty() {
            ExcludeMask::all()
        } else {
            mask
        }
    }

    /// True when `action` is excluded, directly or through `ALL`.
    pub fn forbids(self, action: ExcludeMask) -> bool {
        self.contains(ExcludeMask::ALL) || self.intersects(action)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExcludeRule {
    pub description: String,
    pub filter_expr: String,
    pub filter: FilterHandle,
    pub flag_mask: ExcludeMask,
}

/// The compiled rule set.
#[derive(Debug, Clone, Default)]
pub struct ExclusionEngine {
    rules: Vec<ExcludeRule>,
}

impl ExclusionEngine {
    /// Compile every rule. A filter that fails to compile aborts the load.
    pub fn new(
        factory: &dyn DissectorFactory,
        configs: &[ExcludeRuleConfig],
    ) -> Result<Self, ModelError> {
        let rules = configs
            .iter()
            .map(|c| {
                Ok(ExcludeRule {
                    description: c.description.clone(),
                    filter_expr: c.filter.clone(),
                    filter: factory.compile_filter(&c.filter)?,
                    flag_mask: ExcludeMask::from_letters(&c.apply_to),
                })
            })
            .collect::<Result<Vec<_>, ModelError>>()?;
        Ok(Self { rules })
    }

    pub fn from_rules(rules: Vec<ExcludeRule>) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &[ExcludeRule] {
        &self.rules
    }

    /// Register all rule filters with a per-thread dissector.
    pub fn prepare(&self, dissector: &mut dyn Dissector) {
        let filters: Vec<FilterHandle> = self.rules.iter().map(|r| r.filter).collect();
        dissector.declare_interest(&filters, &[]);
    }

    pub fn evaluate(&self, dissector: &dyn Dissector, tree: &PacketTree) -> ExcludeMask {
        self.rules
            .iter()
            .filter(|r| dissector.read_filter(tree, r.filter))
            .fold(ExcludeMask::empty(), |acc, r| acc | r.flag_mask)
    }
}
