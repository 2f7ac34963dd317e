use thiserror::Error;

use crate::types::StateHandle;

/// Failures reported by the builder and recorded by an execution context.
///
/// Task outcomes are not errors; they travel as [`ai_core::RunStatus`]. `EnterStateFailed` and
/// `TaskRuntimeFailed` are recorded for inspection when such an outcome ends up failing the tree.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StateTreeError {
    #[error("state tree is not ready to run: {0}")]
    ConfigurationInvalid(String),

    #[error("external data `{name}` is unavailable")]
    ExternalDataUnavailable { name: String },

    #[error("failed to select state {target}")]
    SelectionFailed { target: String },

    #[error("task `{task}` failed while entering state `{state}`")]
    EnterStateFailed { state: String, task: String },

    #[error("task `{task}` failed while ticking state `{state}`")]
    TaskRuntimeFailed { state: String, task: String },

    #[error("recursion limit exceeded while selecting `{state}`")]
    RecursionExceeded { state: String },

    #[error("loop detected when trying to select `{state}`")]
    LoopDetected { state: String },
}

impl StateTreeError {
    pub(crate) fn config(message: impl Into<String>) -> Self {
        StateTreeError::ConfigurationInvalid(message.into())
    }

    pub(crate) fn selection(target: StateHandle, name: &str) -> Self {
        StateTreeError::SelectionFailed {
            target: format!("`{name}` ({target})"),
        }
    }
}

pub type Result<T, E = StateTreeError> = std::result::Result<T, E>;
