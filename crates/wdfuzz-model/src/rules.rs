//! Mapping and exclusion rules: configuration form and compiled form.

use serde::{Deserialize, Serialize};

use crate::dissect::{DissectorFactory, FieldHandle, FilterHandle};
use crate::error::ModelError;

/// One or several fields whose value names the state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldSelector {
    One(String),
    Many(Vec<String>),
}

impl FieldSelector {
    pub fn names(&self) -> Vec<&str> {
        match self {
            FieldSelector::One(name) => vec![name.as_str()],
            FieldSelector::Many(names) => names.iter().map(String::as_str).collect(),
        }
    }
}

/// A state-mapping rule as written in the configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappingRuleConfig {
    /// Label used in the state name, e.g. `RRC`.
    pub layer_name: String,
    /// Display filter selecting packets this rule applies to.
    pub filter: String,
    /// Field(s) whose value becomes the last part of the state name. The first present wins.
    pub state_name_field: FieldSelector,
    /// Append the packet summary to the state name.
    #[serde(default)]
    pub append_summary: bool,
}

/// An exclusion rule as written in the configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExcludeRuleConfig {
    #[serde(default)]
    pub description: String,
    pub filter: String,
    /// Letters selecting the forbidden actions (`A`, `M`, `D`, `V`, `S`, `R`).
    #[serde(default = "default_apply_to")]
    pub apply_to: String,
}

fn default_apply_to() -> String {
    "A".to_string()
}

/// A mapping rule with its filter and fields compiled. Immutable after load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappingRule {
    pub index: u32,
    pub layer_name: String,
    pub filter_expr: String,
    pub filter: FilterHandle,
    pub field_names: Vec<String>,
    pub field_selectors: Vec<FieldHandle>,
    pub append_summary: bool,
}

impl MappingRule {
    pub fn compile(
        factory: &dyn DissectorFactory,
        index: u32,
        config: &MappingRuleConfig,
    ) -> Result<Self, ModelError> {
        let filter = factory.compile_filter(&config.filter)?;
        let field_names: Vec<String> = config
            .state_name_field
            .names()
            .into_iter()
            .map(str::to_string)
            .collect();
        let field_selectors = field_names
            .iter()
            .map(|name| factory.resolve_field(name))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            index,
            layer_name: config.layer_name.clone(),
            filter_expr: config.filter.clone(),
            filter,
            field_names,
            field_selectors,
            append_summary: config.append_summary,
        })
    }
}

/// Compile every mapping rule in declaration order. Any failure aborts the load.
pub fn compile_mapping_rules(
    factory: &dyn DissectorFactory,
    configs: &[MappingRuleConfig],
) -> Result<Vec<MappingRule>, ModelError> {
    configs
        .iter()
        .enumerate()
        .map(|(i, c)| MappingRule::compile(factory, i as u32, c))
        .collect()
}
