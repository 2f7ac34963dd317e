#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Result of running a tree, a state or a single task.
///
/// `Stopped` is only produced when the owner terminates execution explicitly, `Unset` marks a value
/// that has not been produced yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum RunStatus {
    Running,
    Succeeded,
    Failed,
    Stopped,
    #[default]
    Unset,
}

impl RunStatus {
    pub fn is_running(self) -> bool {
        self == RunStatus::Running
    }

    /// `Succeeded`, `Failed` or `Stopped`.
    pub fn is_completed(self) -> bool {
        matches!(
            self,
            RunStatus::Succeeded | RunStatus::Failed | RunStatus::Stopped
        )
    }

    /// Maps `Unset`/`Running` to `Stopped`, used when a caller asks to stop without a final status.
    pub fn as_completion(self) -> RunStatus {
        match self {
            RunStatus::Running | RunStatus::Unset => RunStatus::Stopped,
            other => other,
        }
    }
}
