//! Compiled, immutable state tree definition.

use std::any::TypeId;
use std::borrow::Cow;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use ai_core::{DeterministicRng, PropertyBag, SplitMix64, Tag};

use crate::bindings::{BatchIndex, PropertyBindings};
use crate::error::{Result, StateTreeError};
use crate::event::EventDesc;
use crate::expression::ExpressionTerm;
use crate::node::{Condition, Consideration, Evaluator, PropertyFunction, Task};
use crate::types::{
    ConditionEvaluationMode, DataHandle, IndexRange, NodeIndex, SelectionBehavior,
    SelectionFallback, StateHandle, TransitionPriority, TransitionTarget, TransitionTrigger,
    MAX_ACTIVE_STATES, MAX_EXPRESSION_INDENT,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TreeId(u64);

impl TreeId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        TreeId(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

#[derive(Clone)]
pub enum StateKind {
    State,
    /// Only groups children; owns no tasks.
    Group,
    /// Root of a subtree that can be linked to; always top level.
    Subtree,
    /// Runs the subtree rooted at `target` of the same tree in a new frame.
    Linked { target: StateHandle },
    /// Runs another compiled tree in a new global frame.
    LinkedAsset { tree: Arc<StateTree> },
}

impl fmt::Debug for StateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StateKind::State => f.write_str("State"),
            StateKind::Group => f.write_str("Group"),
            StateKind::Subtree => f.write_str("Subtree"),
            StateKind::Linked { target } => write!(f, "Linked({target})"),
            StateKind::LinkedAsset { tree } => write!(f, "LinkedAsset({})", tree.name()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CompactState {
    pub name: Cow<'static, str>,
    pub tag: Option<Tag>,
    pub parent: Option<StateHandle>,
    pub(crate) children: IndexRange,
    pub depth: u8,
    pub kind: StateKind,
    pub selection_behavior: SelectionBehavior,
    pub enabled: bool,
    pub tasks: IndexRange,
    pub enter_conditions: IndexRange,
    pub considerations: IndexRange,
    pub transitions: IndexRange,
    pub weight: f32,
    pub parameters: Option<PropertyBag>,
    pub parameter_bindings: Option<BatchIndex>,
    pub required_event: Option<EventDesc>,
    pub consume_event_on_select: bool,
    pub check_prerequisites_when_activating_child_directly: bool,
    /// Instance slots of the state: the parameter block (if any) followed by one slot per task.
    pub instance_data_num: u16,
}

impl CompactState {
    pub fn has_parameters(&self) -> bool {
        self.parameters.is_some()
    }

    pub fn is_linked(&self) -> bool {
        matches!(
            self.kind,
            StateKind::Linked { .. } | StateKind::LinkedAsset { .. }
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransitionDelay {
    pub duration: f32,
    pub random_variance: f32,
}

impl TransitionDelay {
    pub fn new(duration: f32) -> Self {
        Self {
            duration,
            random_variance: 0.0,
        }
    }

    pub fn with_variance(mut self, random_variance: f32) -> Self {
        self.random_variance = random_variance;
        self
    }

    pub fn sample(&self, rng: &mut SplitMix64) -> f32 {
        let jitter = rng.next_f32_in(-self.random_variance, self.random_variance);
        (self.duration + jitter).max(0.0)
    }
}

#[derive(Debug, Clone)]
pub struct CompactTransition {
    pub trigger: TransitionTrigger,
    pub required_event: Option<EventDesc>,
    pub target: TransitionTarget,
    pub fallback: SelectionFallback,
    pub priority: TransitionPriority,
    pub conditions: IndexRange,
    pub delay: Option<TransitionDelay>,
    pub consume_event_on_select: bool,
    pub enabled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskConfig {
    pub should_call_tick: bool,
    /// Tick only while events are queued.
    pub tick_only_on_events: bool,
    pub copy_bound_properties_on_tick: bool,
    pub copy_bound_properties_on_exit: bool,
    /// Makes the task a transition handler; see [`Task::trigger_transitions`].
    pub should_affect_transitions: bool,
    pub transition_priority: TransitionPriority,
    /// Receive enter/exit even when the state is reselected while active.
    pub should_state_change_on_reselect: bool,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            should_call_tick: true,
            tick_only_on_events: false,
            copy_bound_properties_on_tick: true,
            copy_bound_properties_on_exit: true,
            should_affect_transitions: false,
            transition_priority: TransitionPriority::Normal,
            should_state_change_on_reselect: true,
        }
    }
}

pub enum NodeKind {
    Task {
        task: Box<dyn Task>,
        config: TaskConfig,
    },
    Evaluator(Box<dyn Evaluator>),
    Condition {
        condition: Box<dyn Condition>,
        term: ExpressionTerm,
        mode: ConditionEvaluationMode,
    },
    Consideration {
        consideration: Box<dyn Consideration>,
        term: ExpressionTerm,
    },
    PropertyFunction(Box<dyn PropertyFunction>),
}

impl NodeKind {
    pub fn label(&self) -> &'static str {
        match self {
            NodeKind::Task { .. } => "task",
            NodeKind::Evaluator(_) => "evaluator",
            NodeKind::Condition { .. } => "condition",
            NodeKind::Consideration { .. } => "consideration",
            NodeKind::PropertyFunction(_) => "property function",
        }
    }
}

pub struct Node {
    pub name: Cow<'static, str>,
    pub kind: NodeKind,
    pub instance: DataHandle,
    pub template: PropertyBag,
    pub bindings: Option<BatchIndex>,
    pub enabled: bool,
}

impl Node {
    pub fn task(&self) -> Option<(&dyn Task, &TaskConfig)> {
        match &self.kind {
            NodeKind::Task { task, config } => Some((task.as_ref(), config)),
            _ => None,
        }
    }

    pub fn evaluator(&self) -> Option<&dyn Evaluator> {
        match &self.kind {
            NodeKind::Evaluator(evaluator) => Some(evaluator.as_ref()),
            _ => None,
        }
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("name", &self.name)
            .field("kind", &self.kind.label())
            .field("instance", &self.instance)
            .field("bindings", &self.bindings)
            .field("enabled", &self.enabled)
            .finish()
    }
}

/// Declares an object the tree expects to read through a [`DataHandle::Context`] or
/// [`DataHandle::External`] handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataDesc {
    pub name: Cow<'static, str>,
    pub type_id: TypeId,
    pub type_name: &'static str,
    pub required: bool,
}

impl DataDesc {
    pub fn of<T: 'static>(name: impl Into<Cow<'static, str>>) -> Self {
        Self {
            name: name.into(),
            type_id: TypeId::of::<T>(),
            type_name: std::any::type_name::<T>(),
            required: true,
        }
    }

    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }
}

/// Flattened tree definition consumed by [`crate::ExecutionContext`].
///
/// Built by [`crate::StateTreeBuilder`]; never mutated afterwards.
pub struct StateTree {
    pub(crate) id: TreeId,
    pub(crate) name: Cow<'static, str>,
    pub(crate) states: Vec<CompactState>,
    pub(crate) child_states: Vec<StateHandle>,
    pub(crate) transitions: Vec<CompactTransition>,
    pub(crate) nodes: Vec<Node>,
    pub(crate) evaluators: IndexRange,
    pub(crate) global_tasks: IndexRange,
    pub(crate) bindings: PropertyBindings,
    pub(crate) parameters: PropertyBag,
    pub(crate) context_data: Vec<DataDesc>,
    pub(crate) external_data: Vec<DataDesc>,
    /// Node owning each `GlobalInstance` slot.
    pub(crate) global_instances: Vec<NodeIndex>,
    /// Node owning each `Shared` slot.
    pub(crate) shared_instances: Vec<NodeIndex>,
}

impl fmt::Debug for StateTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateTree")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("states", &self.states.len())
            .field("nodes", &self.nodes.len())
            .field("transitions", &self.transitions.len())
            .finish()
    }
}

impl StateTree {
    pub fn id(&self) -> TreeId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn states(&self) -> &[CompactState] {
        &self.states
    }

    pub fn state(&self, handle: StateHandle) -> Option<&CompactState> {
        self.states.get(handle.index())
    }

    pub fn state_name(&self, handle: StateHandle) -> &str {
        self.state(handle).map_or("<invalid>", |state| &state.name)
    }

    pub fn find_state(&self, name: &str) -> Option<StateHandle> {
        self.states
            .iter()
            .position(|state| state.name == name)
            .map(|index| StateHandle(index as u16))
    }

    pub fn children(&self, handle: StateHandle) -> &[StateHandle] {
        match self.state(handle) {
            Some(state) => &self.child_states[state.children.indices()],
            None => &[],
        }
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn node(&self, index: NodeIndex) -> Option<&Node> {
        self.nodes.get(index.index())
    }

    pub fn transitions(&self) -> &[CompactTransition] {
        &self.transitions
    }

    pub fn evaluators(&self) -> IndexRange {
        self.evaluators
    }

    pub fn global_tasks(&self) -> IndexRange {
        self.global_tasks
    }

    pub fn bindings(&self) -> &PropertyBindings {
        &self.bindings
    }

    /// Default global parameters; also the schema `start` checks parameters against.
    pub fn default_parameters(&self) -> &PropertyBag {
        &self.parameters
    }

    pub fn context_data(&self) -> &[DataDesc] {
        &self.context_data
    }

    pub fn external_data(&self) -> &[DataDesc] {
        &self.external_data
    }

    pub(crate) fn has_global_transition_tasks(&self) -> bool {
        self.global_tasks.nodes().any(|index| {
            self.nodes[index.index()]
                .task()
                .is_some_and(|(_, config)| config.should_affect_transitions)
        })
    }

    /// Template of the `index`-th instance slot of `state`.
    pub(crate) fn state_slot_template(&self, state: StateHandle, index: u16) -> Option<&PropertyBag> {
        let compact = self.state(state)?;
        let task_offset = u16::from(compact.has_parameters());
        if index < task_offset {
            return compact.parameters.as_ref();
        }
        let node = compact.tasks.begin + (index - task_offset);
        compact
            .tasks
            .contains(node)
            .then(|| &self.nodes[node as usize].template)
    }

    /// Checks the invariants the runtime relies on ("ready to run").
    pub fn validate(&self) -> Result<()> {
        if self.states.is_empty() {
            return Err(StateTreeError::config(format!("tree `{}` has no states", self.name)));
        }
        let state_count = self.states.len();
        let node_count = self.nodes.len() as u16;
        let transition_count = self.transitions.len() as u16;

        for (index, state) in self.states.iter().enumerate() {
            let handle = StateHandle(index as u16);

            // Parent chain must reach a root without revisiting a state.
            let mut depth = 0usize;
            let mut cursor = state.parent;
            while let Some(parent) = cursor {
                depth += 1;
                if parent.index() >= state_count || depth > MAX_ACTIVE_STATES || parent == handle {
                    return Err(StateTreeError::config(format!(
                        "state `{}` has an invalid or cyclic parent chain",
                        state.name
                    )));
                }
                cursor = self.states[parent.index()].parent;
            }
            if depth != state.depth as usize {
                return Err(StateTreeError::config(format!(
                    "state `{}` depth {} does not match its parent chain",
                    state.name, state.depth
                )));
            }

            if state.children.end as usize > self.child_states.len() {
                return Err(StateTreeError::config(format!(
                    "state `{}` children out of range",
                    state.name
                )));
            }
            for child in self.children(handle) {
                if self.state(*child).and_then(|c| c.parent) != Some(handle) {
                    return Err(StateTreeError::config(format!(
                        "state `{}` lists a child that does not point back to it",
                        state.name
                    )));
                }
            }

            for range in [state.tasks, state.enter_conditions, state.considerations] {
                if range.end > node_count {
                    return Err(StateTreeError::config(format!(
                        "state `{}` node range out of bounds",
                        state.name
                    )));
                }
            }
            if state.transitions.end > transition_count {
                return Err(StateTreeError::config(format!(
                    "state `{}` transition range out of bounds",
                    state.name
                )));
            }
            let expected_slots = u16::from(state.has_parameters()) + state.tasks.len() as u16;
            if state.instance_data_num != expected_slots {
                return Err(StateTreeError::config(format!(
                    "state `{}` instance layout mismatch",
                    state.name
                )));
            }

            match &state.kind {
                StateKind::Linked { target } => {
                    let linked = self.state(*target).ok_or_else(|| {
                        StateTreeError::config(format!(
                            "linked state `{}` points to a missing state",
                            state.name
                        ))
                    })?;
                    if linked.parent.is_some() {
                        return Err(StateTreeError::config(format!(
                            "linked state `{}` must point to a top level subtree",
                            state.name
                        )));
                    }
                }
                StateKind::LinkedAsset { tree } => {
                    if tree.id == self.id {
                        return Err(StateTreeError::config(format!(
                            "linked asset state `{}` links its own tree",
                            state.name
                        )));
                    }
                }
                StateKind::State | StateKind::Group | StateKind::Subtree => {}
            }
        }

        for transition in &self.transitions {
            if let Some(target) = transition.target.state() {
                if target.index() >= state_count {
                    return Err(StateTreeError::config("transition targets a missing state"));
                }
            }
            if transition.trigger == TransitionTrigger::OnEvent
                && !transition.required_event.as_ref().is_some_and(EventDesc::is_valid)
            {
                return Err(StateTreeError::config("event transition without a required event"));
            }
            if transition.conditions.end > node_count {
                return Err(StateTreeError::config("transition condition range out of bounds"));
            }
        }

        for state in &self.states {
            self.check_expression(state.enter_conditions)?;
            self.check_expression(state.considerations)?;
        }
        for transition in &self.transitions {
            self.check_expression(transition.conditions)?;
        }
        for node in &self.nodes {
            if let Some(batch) = node.bindings {
                self.bindings.check_batch(batch)?;
            }
        }
        for state in &self.states {
            if let Some(batch) = state.parameter_bindings {
                self.bindings.check_batch(batch)?;
            }
        }

        Ok(())
    }

    fn check_expression(&self, range: IndexRange) -> Result<()> {
        let mut indent = 0i32;
        for index in range.indices() {
            let node = &self.nodes[index];
            let term = match &node.kind {
                NodeKind::Condition { term, .. } | NodeKind::Consideration { term, .. } => term,
                _ => {
                    return Err(StateTreeError::config(format!(
                        "`{}` is not a condition or consideration",
                        node.name
                    )))
                }
            };
            indent += i32::from(term.delta_indent);
            if indent < 0 || indent >= MAX_EXPRESSION_INDENT as i32 {
                return Err(StateTreeError::config(format!(
                    "expression at `{}` nests deeper than {}",
                    node.name, MAX_EXPRESSION_INDENT
                )));
            }
        }
        if indent != 0 {
            return Err(StateTreeError::config("expression leaves parentheses open"));
        }
        Ok(())
    }
}
