//! Handles, enums and small fixed-capacity containers shared by the compiled tree and the runtime.

use std::fmt;

use ai_core::RunStatus;

/// Deepest root-to-leaf path a single frame can hold.
pub const MAX_ACTIVE_STATES: usize = 8;
/// Most frames (root tree plus linked trees) that can be active at once.
pub const MAX_EXECUTION_FRAMES: usize = 8;
/// Deepest parenthesis nesting of condition and consideration expressions.
pub const MAX_EXPRESSION_INDENT: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StateHandle(pub u16);

impl StateHandle {
    pub const ROOT: StateHandle = StateHandle(0);

    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for StateHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeIndex(pub u16);

impl NodeIndex {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Half-open range of compiled array indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IndexRange {
    pub begin: u16,
    pub end: u16,
}

impl IndexRange {
    pub const EMPTY: IndexRange = IndexRange { begin: 0, end: 0 };

    pub fn new(begin: u16, end: u16) -> Self {
        Self { begin, end }
    }

    pub fn len(self) -> usize {
        self.end.saturating_sub(self.begin) as usize
    }

    pub fn is_empty(self) -> bool {
        self.len() == 0
    }

    pub fn contains(self, index: u16) -> bool {
        index >= self.begin && index < self.end
    }

    pub fn nodes(self) -> impl DoubleEndedIterator<Item = NodeIndex> + ExactSizeIterator {
        (self.begin..self.end).map(NodeIndex)
    }

    pub fn indices(self) -> std::ops::Range<usize> {
        (self.begin as usize)..(self.end as usize)
    }
}

/// Where a node, parameter block or event lives at runtime.
///
/// Handles are resolved against an execution frame; indices are relative to the frame's bases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DataHandle {
    #[default]
    None,
    /// Object supplied by the owner of the execution context.
    Context(u16),
    /// Object supplied by the external data provider for the frame's tree.
    External(u16),
    /// Parameter block of the frame (root parameters or a linked asset's parameters).
    GlobalParameters,
    /// Evaluator or global task instance of the frame.
    GlobalInstance(u16),
    /// Task instance of an active state; `index` is relative to the state's block.
    ActiveInstance { state: StateHandle, index: u16 },
    /// Parameter block of a state.
    StateParameters(StateHandle),
    /// Scratch instance of a condition, consideration or property function.
    Shared(u16),
    /// Event that triggered the transition being evaluated.
    TransitionEvent,
    /// Event captured when the state was selected.
    StateEvent(StateHandle),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SelectionBehavior {
    /// The state cannot be selected.
    None,
    TryEnterState,
    #[default]
    TrySelectChildrenInOrder,
    TrySelectChildrenAtRandom,
    TrySelectChildrenWithHighestUtility,
    TrySelectChildrenAtRandomWeightedByUtility,
    TryFollowTransitions,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransitionTrigger {
    OnStateCompleted,
    OnStateSucceeded,
    OnStateFailed,
    OnTick,
    OnEvent,
}

impl TransitionTrigger {
    pub fn is_completion(self) -> bool {
        matches!(
            self,
            TransitionTrigger::OnStateCompleted
                | TransitionTrigger::OnStateSucceeded
                | TransitionTrigger::OnStateFailed
        )
    }

    /// Whether a completion trigger reacts to a state finishing with `status`.
    pub fn fires_on(self, status: RunStatus) -> bool {
        match self {
            TransitionTrigger::OnStateCompleted => status.is_completed(),
            TransitionTrigger::OnStateSucceeded => status == RunStatus::Succeeded,
            TransitionTrigger::OnStateFailed => status == RunStatus::Failed,
            TransitionTrigger::OnTick | TransitionTrigger::OnEvent => false,
        }
    }
}

/// Transition priority, higher wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum TransitionPriority {
    /// No transition requested.
    #[default]
    None,
    Low,
    Normal,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TransitionTarget {
    /// Masks lower priority transitions without changing state.
    #[default]
    NotSet,
    State(StateHandle),
    Succeeded,
    Failed,
    Stopped,
}

impl TransitionTarget {
    pub fn state(self) -> Option<StateHandle> {
        match self {
            TransitionTarget::State(handle) => Some(handle),
            _ => None,
        }
    }

    /// Run status of a completion pseudo-state.
    pub fn completion_status(self) -> Option<RunStatus> {
        match self {
            TransitionTarget::Succeeded => Some(RunStatus::Succeeded),
            TransitionTarget::Failed => Some(RunStatus::Failed),
            TransitionTarget::Stopped => Some(RunStatus::Stopped),
            TransitionTarget::NotSet | TransitionTarget::State(_) => None,
        }
    }

    pub fn from_completion(status: RunStatus) -> TransitionTarget {
        match status {
            RunStatus::Succeeded => TransitionTarget::Succeeded,
            RunStatus::Failed => TransitionTarget::Failed,
            _ => TransitionTarget::Stopped,
        }
    }

    pub fn is_set(self) -> bool {
        self != TransitionTarget::NotSet
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SelectionFallback {
    #[default]
    None,
    /// Try the later siblings of the target under the same parent.
    NextSelectableSibling,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ChangeType {
    /// The state was not active before the transition.
    #[default]
    Changed,
    /// The state stays active across the transition.
    Sustained,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Operand {
    #[default]
    Copy,
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConditionEvaluationMode {
    #[default]
    Evaluated,
    ForcedTrue,
    ForcedFalse,
}

/// The phase an execution context is in, used to defer stop requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum UpdatePhase {
    #[default]
    Unset,
    StartTree,
    StopTree,
    TickStateTree,
    TriggerTransitions,
    EnterStates,
    ExitStates,
    StateCompleted,
}

/// Fixed-capacity root-to-leaf path of active states within one frame.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ActiveStates {
    states: [Option<StateHandle>; MAX_ACTIVE_STATES],
    len: u8,
}

impl ActiveStates {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() == MAX_ACTIVE_STATES
    }

    /// Returns false when the path is full.
    pub fn push(&mut self, state: StateHandle) -> bool {
        if self.is_full() {
            return false;
        }
        self.states[self.len()] = Some(state);
        self.len += 1;
        true
    }

    pub fn pop(&mut self) -> Option<StateHandle> {
        if self.is_empty() {
            return None;
        }
        self.len -= 1;
        self.states[self.len()].take()
    }

    pub fn truncate(&mut self, len: usize) {
        while self.len() > len {
            self.pop();
        }
    }

    pub fn clear(&mut self) {
        self.truncate(0);
    }

    pub fn get(&self, index: usize) -> Option<StateHandle> {
        if index < self.len() {
            self.states[index]
        } else {
            None
        }
    }

    pub fn last(&self) -> Option<StateHandle> {
        self.len().checked_sub(1).and_then(|index| self.get(index))
    }

    pub fn contains(&self, state: StateHandle) -> bool {
        self.iter().any(|s| s == state)
    }

    pub fn index_of(&self, state: StateHandle) -> Option<usize> {
        self.iter().position(|s| s == state)
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = StateHandle> + '_ {
        self.states[..self.len()].iter().flatten().copied()
    }
}

impl fmt::Debug for ActiveStates {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}

impl FromIterator<StateHandle> for ActiveStates {
    fn from_iter<I: IntoIterator<Item = StateHandle>>(iter: I) -> Self {
        let mut states = ActiveStates::new();
        for state in iter {
            if !states.push(state) {
                break;
            }
        }
        states
    }
}
