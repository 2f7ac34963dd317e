use std::fmt;
use std::sync::Arc;

use crate::event::SharedEvent;
use crate::tree::{StateTree, TreeId};
use crate::types::{ActiveStates, StateHandle, MAX_ACTIVE_STATES};

/// Identity of a frame: the tree it runs and the state it starts from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameId {
    pub tree: TreeId,
    pub root_state: StateHandle,
}

/// Where a frame reads a parameter block from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamSource {
    /// Parameters owned by the execution context.
    Context,
    /// The parent frame's global parameters.
    Inherit,
    /// Parameter block of the linking state in the parent frame.
    ParentState(StateHandle),
}

/// One instantiation of a compiled tree within the active execution.
#[derive(Clone)]
pub struct ExecutionFrame {
    pub(crate) tree: Arc<StateTree>,
    pub(crate) root_state: StateHandle,
    pub(crate) active_states: ActiveStates,
    pub(crate) state_events: [Option<SharedEvent>; MAX_ACTIVE_STATES],
    pub(crate) is_global_frame: bool,
    pub(crate) global_parameters: ParamSource,
    pub(crate) state_parameters: Option<ParamSource>,
    pub(crate) global_instance_base: Option<usize>,
    pub(crate) active_instance_base: Option<usize>,
    pub(crate) external_data_base: Option<usize>,
    /// Active states whose instance data is already allocated.
    pub(crate) num_instantiated_states: usize,
}

impl ExecutionFrame {
    pub(crate) fn new(tree: Arc<StateTree>, root_state: StateHandle, is_global_frame: bool) -> Self {
        Self {
            tree,
            root_state,
            active_states: ActiveStates::new(),
            state_events: Default::default(),
            is_global_frame,
            global_parameters: ParamSource::Context,
            state_parameters: None,
            global_instance_base: None,
            active_instance_base: None,
            external_data_base: None,
            num_instantiated_states: 0,
        }
    }

    pub fn id(&self) -> FrameId {
        FrameId {
            tree: self.tree.id(),
            root_state: self.root_state,
        }
    }

    pub fn is_same_frame(&self, other: &ExecutionFrame) -> bool {
        self.id() == other.id()
    }

    pub fn tree(&self) -> &Arc<StateTree> {
        &self.tree
    }

    pub fn root_state(&self) -> StateHandle {
        self.root_state
    }

    pub fn active_states(&self) -> &ActiveStates {
        &self.active_states
    }

    pub fn is_global_frame(&self) -> bool {
        self.is_global_frame
    }

    /// Event captured when the state at `depth` was selected.
    pub fn state_event(&self, depth: usize) -> Option<&SharedEvent> {
        self.state_events.get(depth).and_then(Option::as_ref)
    }

    pub(crate) fn push_state(&mut self, state: StateHandle) -> bool {
        self.active_states.push(state)
    }

    /// Drops the deepest state and its captured event.
    pub(crate) fn pop_state(&mut self) {
        let len = self.active_states.len();
        if len > 0 {
            self.state_events[len - 1] = None;
        }
        self.active_states.pop();
        self.num_instantiated_states = self.num_instantiated_states.min(self.active_states.len());
    }

    pub(crate) fn truncate_states(&mut self, len: usize) {
        while self.active_states.len() > len {
            self.pop_state();
        }
    }

    /// Offset of the state at `depth` inside the frame's active instance block.
    pub(crate) fn state_slot_offset(&self, depth: usize) -> usize {
        self.active_states
            .iter()
            .take(depth)
            .filter_map(|state| self.tree.state(state))
            .map(|state| state.instance_data_num as usize)
            .sum()
    }
}

impl fmt::Debug for ExecutionFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionFrame")
            .field("tree", &self.tree.name())
            .field("root_state", &self.root_state)
            .field("active_states", &self.active_states)
            .field("is_global_frame", &self.is_global_frame)
            .finish()
    }
}

/// Frames produced by a successful selection, not yet entered.
#[derive(Debug, Clone, Default)]
pub struct SelectionResult {
    pub(crate) frames: Vec<ExecutionFrame>,
}

impl SelectionResult {
    pub fn frames(&self) -> &[ExecutionFrame] {
        &self.frames
    }
}
