//! Runtime limits and defaults of an execution context.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::event::MAX_ACTIVE_EVENTS;
use crate::types::MAX_ACTIVE_STATES;

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct ExecutionConfig {
    /// Transitions that may be applied within a single tick.
    #[cfg_attr(feature = "serde", serde(default = "default_max_transition_iterations"))]
    pub max_transition_iterations: usize,

    /// Capacity of the event queue owned by the context.
    #[cfg_attr(feature = "serde", serde(default = "default_max_events"))]
    pub max_events: usize,

    /// Seed used when `start` is not given one.
    #[cfg_attr(feature = "serde", serde(default = "default_seed"))]
    pub default_seed: u64,

    /// How many follow-transition hops a single selection may take.
    #[cfg_attr(feature = "serde", serde(default = "default_max_follow_depth"))]
    pub max_follow_depth: usize,
}

fn default_max_transition_iterations() -> usize {
    5
}
fn default_max_events() -> usize {
    MAX_ACTIVE_EVENTS
}
fn default_seed() -> u64 {
    0x5EED_0000_0000_0001
}
fn default_max_follow_depth() -> usize {
    MAX_ACTIVE_STATES
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_transition_iterations: default_max_transition_iterations(),
            max_events: default_max_events(),
            default_seed: default_seed(),
            max_follow_depth: default_max_follow_depth(),
        }
    }
}

#[cfg(feature = "serde")]
impl ExecutionConfig {
    pub fn from_yaml_str(source: &str) -> anyhow::Result<Self> {
        use anyhow::Context;

        serde_yaml::from_str(source).context("Failed to parse execution config")
    }

    /// Loads a YAML config file; a missing file yields the defaults.
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        use anyhow::Context;

        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;
        Self::from_yaml_str(&contents)
    }
}
