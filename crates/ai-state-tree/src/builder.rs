//! Programmatic construction of a compiled [`StateTree`].
//!
//! States, nodes and bindings are declared by name; [`StateTreeBuilder::build`] lays them out
//! into the flat arrays the runtime consumes and validates the result.

use std::borrow::Cow;
use std::sync::Arc;

use ai_core::{PropertyBag, Tag};
use tracing::debug;

use crate::bindings::{BatchIndex, PropertyBindings, PropertyCopy};
use crate::error::{Result, StateTreeError};
use crate::event::EventDesc;
use crate::expression::ExpressionTerm;
use crate::node::{Condition, Consideration, Evaluator, PropertyFunction, Task};
use crate::tree::{
    CompactState, CompactTransition, DataDesc, Node, NodeKind, StateKind, StateTree, TaskConfig,
    TransitionDelay, TreeId,
};
use crate::types::{
    ConditionEvaluationMode, DataHandle, IndexRange, NodeIndex, SelectionBehavior,
    SelectionFallback, StateHandle, TransitionPriority, TransitionTarget, TransitionTrigger,
};

type Name = Cow<'static, str>;

/// Where a bound value is read from. Named fields are resolved against the source's template.
pub enum BindingSource {
    GlobalParameter(Name),
    StateParameter { state: Name, field: Name },
    Evaluator { node: Name, field: Name },
    GlobalTask { node: Name, field: Name },
    Task { state: Name, node: Name, field: Name },
    Context { index: u16, field: u16 },
    External { index: u16, field: u16 },
    /// Payload field of the event that triggered the current transition.
    TransitionEvent(u16),
    /// Payload field of the event captured when `state` was selected.
    StateEvent { state: Name, field: u16 },
    /// Output of a property function, computed right before the copy.
    Function(Box<FunctionSpec>),
}

impl BindingSource {
    pub fn global(field: impl Into<Name>) -> Self {
        BindingSource::GlobalParameter(field.into())
    }

    pub fn state_parameter(state: impl Into<Name>, field: impl Into<Name>) -> Self {
        BindingSource::StateParameter {
            state: state.into(),
            field: field.into(),
        }
    }

    pub fn evaluator(node: impl Into<Name>, field: impl Into<Name>) -> Self {
        BindingSource::Evaluator {
            node: node.into(),
            field: field.into(),
        }
    }

    pub fn global_task(node: impl Into<Name>, field: impl Into<Name>) -> Self {
        BindingSource::GlobalTask {
            node: node.into(),
            field: field.into(),
        }
    }

    pub fn task(state: impl Into<Name>, node: impl Into<Name>, field: impl Into<Name>) -> Self {
        BindingSource::Task {
            state: state.into(),
            node: node.into(),
            field: field.into(),
        }
    }

    pub fn function(function: FunctionSpec) -> Self {
        BindingSource::Function(Box::new(function))
    }
}

pub struct Binding {
    target: Name,
    source: BindingSource,
}

/// A property function and the bindings feeding its inputs.
pub struct FunctionSpec {
    name: Name,
    function: Box<dyn PropertyFunction>,
    template: PropertyBag,
    output: Name,
    inputs: Vec<Binding>,
}

impl FunctionSpec {
    pub fn new(
        name: impl Into<Name>,
        function: impl PropertyFunction,
        output: impl Into<Name>,
    ) -> Self {
        let template = function.instance_template();
        Self {
            name: name.into(),
            function: Box::new(function),
            template,
            output: output.into(),
            inputs: Vec::new(),
        }
    }

    pub fn bind(mut self, input: impl Into<Name>, source: BindingSource) -> Self {
        self.inputs.push(Binding {
            target: input.into(),
            source,
        });
        self
    }
}

pub struct NodeSpec {
    name: Name,
    kind: NodeKind,
    template: PropertyBag,
    bindings: Vec<Binding>,
    enabled: bool,
}

impl NodeSpec {
    fn with_kind(name: impl Into<Name>, kind: NodeKind, template: PropertyBag) -> Self {
        Self {
            name: name.into(),
            kind,
            template,
            bindings: Vec::new(),
            enabled: true,
        }
    }

    pub fn task(name: impl Into<Name>, task: impl Task) -> Self {
        let template = task.instance_template();
        let kind = NodeKind::Task {
            task: Box::new(task),
            config: TaskConfig::default(),
        };
        Self::with_kind(name, kind, template)
    }

    pub fn evaluator(name: impl Into<Name>, evaluator: impl Evaluator) -> Self {
        let template = evaluator.instance_template();
        Self::with_kind(name, NodeKind::Evaluator(Box::new(evaluator)), template)
    }

    pub fn condition(name: impl Into<Name>, condition: impl Condition) -> Self {
        let template = condition.instance_template();
        let kind = NodeKind::Condition {
            condition: Box::new(condition),
            term: ExpressionTerm::and(),
            mode: ConditionEvaluationMode::Evaluated,
        };
        Self::with_kind(name, kind, template)
    }

    pub fn consideration(name: impl Into<Name>, consideration: impl Consideration) -> Self {
        let template = consideration.instance_template();
        let kind = NodeKind::Consideration {
            consideration: Box::new(consideration),
            term: ExpressionTerm::and(),
        };
        Self::with_kind(name, kind, template)
    }

    /// Only meaningful for tasks.
    pub fn with_config(mut self, task_config: TaskConfig) -> Self {
        if let NodeKind::Task { config, .. } = &mut self.kind {
            *config = task_config;
        }
        self
    }

    /// Operand and parenthesis change of a condition or consideration.
    pub fn with_term(mut self, expression_term: ExpressionTerm) -> Self {
        match &mut self.kind {
            NodeKind::Condition { term, .. } | NodeKind::Consideration { term, .. } => {
                *term = expression_term
            }
            _ => {}
        }
        self
    }

    pub fn with_mode(mut self, evaluation_mode: ConditionEvaluationMode) -> Self {
        if let NodeKind::Condition { mode, .. } = &mut self.kind {
            *mode = evaluation_mode;
        }
        self
    }

    pub fn bind(mut self, field: impl Into<Name>, source: BindingSource) -> Self {
        self.bindings.push(Binding {
            target: field.into(),
            source,
        });
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetSpec {
    NotSet,
    State(Name),
    Succeeded,
    Failed,
}

impl From<&'static str> for TargetSpec {
    fn from(name: &'static str) -> Self {
        TargetSpec::State(Cow::Borrowed(name))
    }
}

impl From<String> for TargetSpec {
    fn from(name: String) -> Self {
        TargetSpec::State(Cow::Owned(name))
    }
}

pub struct TransitionSpec {
    trigger: TransitionTrigger,
    required_event: Option<EventDesc>,
    target: TargetSpec,
    fallback: SelectionFallback,
    priority: TransitionPriority,
    conditions: Vec<NodeSpec>,
    delay: Option<TransitionDelay>,
    consume_event_on_select: bool,
    enabled: bool,
}

impl TransitionSpec {
    fn new(trigger: TransitionTrigger, target: impl Into<TargetSpec>) -> Self {
        Self {
            trigger,
            required_event: None,
            target: target.into(),
            fallback: SelectionFallback::None,
            priority: TransitionPriority::Normal,
            conditions: Vec::new(),
            delay: None,
            consume_event_on_select: true,
            enabled: true,
        }
    }

    pub fn on_completed(target: impl Into<TargetSpec>) -> Self {
        Self::new(TransitionTrigger::OnStateCompleted, target)
    }

    pub fn on_succeeded(target: impl Into<TargetSpec>) -> Self {
        Self::new(TransitionTrigger::OnStateSucceeded, target)
    }

    pub fn on_failed(target: impl Into<TargetSpec>) -> Self {
        Self::new(TransitionTrigger::OnStateFailed, target)
    }

    pub fn on_tick(target: impl Into<TargetSpec>) -> Self {
        Self::new(TransitionTrigger::OnTick, target)
    }

    pub fn on_event(event: EventDesc, target: impl Into<TargetSpec>) -> Self {
        let mut spec = Self::new(TransitionTrigger::OnEvent, target);
        spec.required_event = Some(event);
        spec
    }

    pub fn priority(mut self, priority: TransitionPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn fallback(mut self, fallback: SelectionFallback) -> Self {
        self.fallback = fallback;
        self
    }

    pub fn condition(mut self, condition: NodeSpec) -> Self {
        self.conditions.push(condition);
        self
    }

    pub fn delay(mut self, delay: TransitionDelay) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Whether the triggering event is consumed when the transition is taken. Defaults to true.
    pub fn consume_event(mut self, consume: bool) -> Self {
        self.consume_event_on_select = consume;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

enum KindSpec {
    State,
    Group,
    Subtree,
    Linked(Name),
    LinkedAsset(Arc<StateTree>),
}

pub struct StateSpec {
    name: Name,
    kind: KindSpec,
    tag: Option<Tag>,
    selection: SelectionBehavior,
    tasks: Vec<NodeSpec>,
    enter_conditions: Vec<NodeSpec>,
    considerations: Vec<NodeSpec>,
    transitions: Vec<TransitionSpec>,
    weight: f32,
    parameters: Option<PropertyBag>,
    parameter_bindings: Vec<Binding>,
    required_event: Option<EventDesc>,
    consume_event_on_select: bool,
    check_prerequisites_when_activating_child_directly: bool,
    enabled: bool,
}

impl StateSpec {
    fn with_kind(name: impl Into<Name>, kind: KindSpec) -> Self {
        Self {
            name: name.into(),
            kind,
            tag: None,
            selection: SelectionBehavior::default(),
            tasks: Vec::new(),
            enter_conditions: Vec::new(),
            considerations: Vec::new(),
            transitions: Vec::new(),
            weight: 1.0,
            parameters: None,
            parameter_bindings: Vec::new(),
            required_event: None,
            consume_event_on_select: true,
            check_prerequisites_when_activating_child_directly: true,
            enabled: true,
        }
    }

    pub fn new(name: impl Into<Name>) -> Self {
        Self::with_kind(name, KindSpec::State)
    }

    pub fn group(name: impl Into<Name>) -> Self {
        Self::with_kind(name, KindSpec::Group)
    }

    /// Top level state other states can link to.
    pub fn subtree(name: impl Into<Name>) -> Self {
        Self::with_kind(name, KindSpec::Subtree)
    }

    pub fn linked(name: impl Into<Name>, subtree: impl Into<Name>) -> Self {
        Self::with_kind(name, KindSpec::Linked(subtree.into()))
    }

    pub fn linked_asset(name: impl Into<Name>, tree: Arc<StateTree>) -> Self {
        Self::with_kind(name, KindSpec::LinkedAsset(tree))
    }

    pub fn with_tag(mut self, tag: impl Into<Tag>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    pub fn selection(mut self, behavior: SelectionBehavior) -> Self {
        self.selection = behavior;
        self
    }

    pub fn task(mut self, task: NodeSpec) -> Self {
        self.tasks.push(task);
        self
    }

    pub fn enter_condition(mut self, condition: NodeSpec) -> Self {
        self.enter_conditions.push(condition);
        self
    }

    pub fn consideration(mut self, consideration: NodeSpec) -> Self {
        self.considerations.push(consideration);
        self
    }

    pub fn transition(mut self, transition: TransitionSpec) -> Self {
        self.transitions.push(transition);
        self
    }

    pub fn weight(mut self, weight: f32) -> Self {
        self.weight = weight;
        self
    }

    pub fn parameters(mut self, parameters: PropertyBag) -> Self {
        self.parameters = Some(parameters);
        self
    }

    pub fn bind_parameter(mut self, field: impl Into<Name>, source: BindingSource) -> Self {
        self.parameter_bindings.push(Binding {
            target: field.into(),
            source,
        });
        self
    }

    pub fn required_event(mut self, event: EventDesc) -> Self {
        self.required_event = Some(event);
        self
    }

    pub fn consume_event_on_select(mut self, consume: bool) -> Self {
        self.consume_event_on_select = consume;
        self
    }

    pub fn check_prerequisites_when_activating_child_directly(mut self, check: bool) -> Self {
        self.check_prerequisites_when_activating_child_directly = check;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

/// Collects states, nodes and bindings and lays them out into a [`StateTree`].
///
/// The first top level state becomes the root.
pub struct StateTreeBuilder {
    name: Name,
    parameters: PropertyBag,
    context_data: Vec<DataDesc>,
    external_data: Vec<DataDesc>,
    evaluators: Vec<NodeSpec>,
    global_tasks: Vec<NodeSpec>,
    states: Vec<(Option<Name>, StateSpec)>,
}

impl StateTreeBuilder {
    pub fn new(name: impl Into<Name>) -> Self {
        Self {
            name: name.into(),
            parameters: PropertyBag::new(),
            context_data: Vec::new(),
            external_data: Vec::new(),
            evaluators: Vec::new(),
            global_tasks: Vec::new(),
            states: Vec::new(),
        }
    }

    /// Default global parameters; `start` checks parameters against their schema.
    pub fn parameters(mut self, parameters: PropertyBag) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn context_data(mut self, desc: DataDesc) -> Self {
        self.context_data.push(desc);
        self
    }

    pub fn external_data(mut self, desc: DataDesc) -> Self {
        self.external_data.push(desc);
        self
    }

    pub fn evaluator(mut self, evaluator: NodeSpec) -> Self {
        self.evaluators.push(evaluator);
        self
    }

    pub fn global_task(mut self, task: NodeSpec) -> Self {
        self.global_tasks.push(task);
        self
    }

    /// Adds a top level state.
    pub fn state(mut self, state: StateSpec) -> Self {
        self.states.push((None, state));
        self
    }

    /// Adds `state` as the last child of the state named `parent`.
    pub fn child(mut self, parent: impl Into<Name>, state: StateSpec) -> Self {
        self.states.push((Some(parent.into()), state));
        self
    }

    pub fn build(self) -> Result<Arc<StateTree>> {
        let StateTreeBuilder {
            name,
            parameters,
            context_data,
            external_data,
            evaluators,
            global_tasks,
            states,
        } = self;

        let order = preorder(&states)?;
        let mut specs: Vec<Option<(Option<Name>, StateSpec)>> = states.into_iter().map(Some).collect();
        let mut ordered = Vec::with_capacity(order.len());
        for (index, depth) in order {
            if let Some((parent, spec)) = specs[index].take() {
                ordered.push((parent, spec, depth));
            }
        }

        let mut compiler = Compiler {
            name: name.clone(),
            parameters,
            context_len: context_data.len(),
            external_len: external_data.len(),
            state_names: ordered.iter().map(|(_, spec, _)| spec.name.clone()).collect(),
            state_params: Vec::new(),
            state_tasks: Vec::new(),
            evaluators: Vec::new(),
            global_tasks: Vec::new(),
            nodes: Vec::new(),
            pending: Vec::new(),
            global_instances: Vec::new(),
            shared_instances: Vec::new(),
            bindings: PropertyBindings::new(),
        };

        // Parameter blocks, with linked states defaulting to what they link to.
        for (_, spec, _) in &ordered {
            let params = match (&spec.parameters, &spec.kind) {
                (Some(params), _) => Some(params.clone()),
                (None, KindSpec::Linked(target)) => {
                    let target = compiler.state(target)?;
                    ordered[target.index()].1.parameters.clone()
                }
                (None, KindSpec::LinkedAsset(tree)) => Some(tree.default_parameters().clone()),
                (None, _) => None,
            };
            compiler.state_params.push(params);
        }

        for spec in evaluators {
            let instance = DataHandle::GlobalInstance(compiler.global_instances.len() as u16);
            let index = compiler.push_node(spec, instance, None);
            compiler.global_instances.push(index);
            let name = compiler.nodes[index.index()].0.name.clone();
            compiler.evaluators.push((name, index));
        }
        let evaluator_range = IndexRange::new(0, compiler.nodes.len() as u16);
        for spec in global_tasks {
            let instance = DataHandle::GlobalInstance(compiler.global_instances.len() as u16);
            let index = compiler.push_node(spec, instance, None);
            compiler.global_instances.push(index);
            let name = compiler.nodes[index.index()].0.name.clone();
            compiler.global_tasks.push((name, index));
        }
        let global_task_range =
            IndexRange::new(evaluator_range.end, compiler.nodes.len() as u16);

        let mut compact_states = Vec::with_capacity(ordered.len());
        let mut child_states = Vec::new();
        let mut compact_transitions = Vec::new();
        let mut parameter_bindings = Vec::new();

        for (index, (parent, spec, depth)) in ordered.into_iter().enumerate() {
            let handle = StateHandle(index as u16);
            let parent = match parent {
                Some(parent) => Some(compiler.state(&parent)?),
                None => None,
            };
            let kind = match spec.kind {
                KindSpec::State => StateKind::State,
                KindSpec::Group => {
                    if !spec.tasks.is_empty() {
                        return Err(StateTreeError::config(format!(
                            "group `{}` cannot own tasks",
                            spec.name
                        )));
                    }
                    StateKind::Group
                }
                KindSpec::Subtree => {
                    if parent.is_some() {
                        return Err(StateTreeError::config(format!(
                            "subtree `{}` must be a top level state",
                            spec.name
                        )));
                    }
                    StateKind::Subtree
                }
                KindSpec::Linked(target) => StateKind::Linked {
                    target: compiler.state(&target)?,
                },
                KindSpec::LinkedAsset(tree) => StateKind::LinkedAsset { tree },
            };

            let has_params = compiler.state_params[index].is_some();
            let task_offset = u16::from(has_params);

            let tasks_begin = compiler.nodes.len() as u16;
            let mut tasks = Vec::with_capacity(spec.tasks.len());
            for (k, task) in spec.tasks.into_iter().enumerate() {
                let instance = DataHandle::ActiveInstance {
                    state: handle,
                    index: task_offset + k as u16,
                };
                let node = compiler.push_node(task, instance, Some(handle));
                tasks.push((compiler.nodes[node.index()].0.name.clone(), node));
            }
            let task_range = IndexRange::new(tasks_begin, compiler.nodes.len() as u16);
            compiler.state_tasks.push(tasks);

            let enter_conditions = compiler.push_shared(spec.enter_conditions, Some(handle));
            let considerations = compiler.push_shared(spec.considerations, Some(handle));

            let transitions_begin = compact_transitions.len() as u16;
            for transition in spec.transitions {
                let conditions = compiler.push_shared(transition.conditions, Some(handle));
                let target = match transition.target {
                    TargetSpec::NotSet => TransitionTarget::NotSet,
                    TargetSpec::State(name) => TransitionTarget::State(compiler.state(&name)?),
                    TargetSpec::Succeeded => TransitionTarget::Succeeded,
                    TargetSpec::Failed => TransitionTarget::Failed,
                };
                compact_transitions.push(CompactTransition {
                    trigger: transition.trigger,
                    required_event: transition.required_event,
                    target,
                    fallback: transition.fallback,
                    priority: transition.priority,
                    conditions,
                    delay: transition.delay,
                    consume_event_on_select: transition.consume_event_on_select,
                    enabled: transition.enabled,
                });
            }
            let transitions =
                IndexRange::new(transitions_begin, compact_transitions.len() as u16);

            parameter_bindings.push((handle, spec.parameter_bindings));

            compact_states.push(CompactState {
                name: spec.name,
                tag: spec.tag,
                parent,
                children: IndexRange::EMPTY,
                depth,
                kind,
                selection_behavior: spec.selection,
                enabled: spec.enabled,
                tasks: task_range,
                enter_conditions,
                considerations,
                transitions,
                weight: spec.weight,
                parameters: compiler.state_params[index].clone(),
                parameter_bindings: None,
                required_event: spec.required_event,
                consume_event_on_select: spec.consume_event_on_select,
                check_prerequisites_when_activating_child_directly: spec
                    .check_prerequisites_when_activating_child_directly,
                instance_data_num: task_offset + task_range.len() as u16,
            });
        }

        // Children are contiguous per parent in the flat child array.
        for index in 0..compact_states.len() {
            let handle = StateHandle(index as u16);
            let begin = child_states.len() as u16;
            child_states.extend(
                compact_states
                    .iter()
                    .enumerate()
                    .filter(|(_, state)| state.parent == Some(handle))
                    .map(|(child, _)| StateHandle(child as u16)),
            );
            compact_states[index].children = IndexRange::new(begin, child_states.len() as u16);
        }

        // Names are resolvable only once every node is laid out.
        for (node, owner) in std::mem::take(&mut compiler.pending) {
            let (bindings, target, node_name) = {
                let node_ref = &mut compiler.nodes[node.index()];
                (
                    std::mem::take(&mut node_ref.1),
                    node_ref.0.template.clone(),
                    node_ref.0.name.clone(),
                )
            };
            compiler.nodes[node.index()].0.bindings =
                compiler.compile_batch(bindings, &target, &node_name, owner)?;
        }
        for (handle, bindings) in parameter_bindings {
            if bindings.is_empty() {
                continue;
            }
            let Some(target) = compiler.state_params[handle.index()].clone() else {
                return Err(StateTreeError::config(format!(
                    "state `{}` binds parameters but has none",
                    compiler.state_names[handle.index()]
                )));
            };
            let state_name = compiler.state_names[handle.index()].clone();
            compact_states[handle.index()].parameter_bindings =
                compiler.compile_batch(bindings, &target, &state_name, Some(handle))?;
        }

        let tree = StateTree {
            id: TreeId::next(),
            name,
            states: compact_states,
            child_states,
            transitions: compact_transitions,
            nodes: compiler.nodes.into_iter().map(|(node, _)| node).collect(),
            evaluators: evaluator_range,
            global_tasks: global_task_range,
            bindings: compiler.bindings,
            parameters: compiler.parameters,
            context_data,
            external_data,
            global_instances: compiler.global_instances,
            shared_instances: compiler.shared_instances,
        };
        tree.validate()?;
        debug!(
            tree = %compiler.name,
            states = tree.states.len(),
            nodes = tree.nodes.len(),
            "built state tree"
        );
        Ok(Arc::new(tree))
    }
}

/// Orders states depth first from the top level states, returning `(declaration index, depth)`.
fn preorder(states: &[(Option<Name>, StateSpec)]) -> Result<Vec<(usize, u8)>> {
    for (index, (_, spec)) in states.iter().enumerate() {
        if states[..index].iter().any(|(_, other)| other.name == spec.name) {
            return Err(StateTreeError::config(format!(
                "duplicate state name `{}`",
                spec.name
            )));
        }
    }
    for (parent, spec) in states {
        if let Some(parent) = parent {
            if !states.iter().any(|(_, other)| other.name == *parent) {
                return Err(StateTreeError::config(format!(
                    "state `{}` has unknown parent `{parent}`",
                    spec.name
                )));
            }
        }
    }
    if states.first().is_some_and(|(parent, _)| parent.is_some()) || states.is_empty() {
        return Err(StateTreeError::config("the first state must be a top level state"));
    }

    let mut order = Vec::with_capacity(states.len());
    let mut stack: Vec<(usize, u8)> = states
        .iter()
        .enumerate()
        .filter(|(_, (parent, _))| parent.is_none())
        .map(|(index, _)| (index, 0))
        .rev()
        .collect();
    while let Some((index, depth)) = stack.pop() {
        order.push((index, depth));
        let name = &states[index].1.name;
        let children = states
            .iter()
            .enumerate()
            .filter(|(_, (parent, _))| parent.as_ref() == Some(name))
            .map(|(child, _)| (child, depth.saturating_add(1)));
        let before = stack.len();
        stack.extend(children);
        stack[before..].reverse();
    }
    if order.len() != states.len() {
        return Err(StateTreeError::config("state parents form a cycle"));
    }
    Ok(order)
}

struct Compiler {
    name: Name,
    parameters: PropertyBag,
    context_len: usize,
    external_len: usize,
    state_names: Vec<Name>,
    state_params: Vec<Option<PropertyBag>>,
    state_tasks: Vec<Vec<(Name, NodeIndex)>>,
    evaluators: Vec<(Name, NodeIndex)>,
    global_tasks: Vec<(Name, NodeIndex)>,
    /// Nodes and their bindings, compiled once all names are known.
    nodes: Vec<(Node, Vec<Binding>)>,
    pending: Vec<(NodeIndex, Option<StateHandle>)>,
    global_instances: Vec<NodeIndex>,
    shared_instances: Vec<NodeIndex>,
    bindings: PropertyBindings,
}

impl Compiler {
    fn state(&self, name: &str) -> Result<StateHandle> {
        self.state_names
            .iter()
            .position(|state| state == name)
            .map(|index| StateHandle(index as u16))
            .ok_or_else(|| StateTreeError::config(format!("unknown state `{name}`")))
    }

    fn push_node(
        &mut self,
        spec: NodeSpec,
        instance: DataHandle,
        owner: Option<StateHandle>,
    ) -> NodeIndex {
        let index = NodeIndex(self.nodes.len() as u16);
        let node = Node {
            name: spec.name,
            kind: spec.kind,
            instance,
            template: spec.template,
            bindings: None,
            enabled: spec.enabled,
        };
        if !spec.bindings.is_empty() {
            self.pending.push((index, owner));
        }
        self.nodes.push((node, spec.bindings));
        index
    }

    /// Lays out conditions or considerations on shared scratch instances.
    fn push_shared(&mut self, specs: Vec<NodeSpec>, owner: Option<StateHandle>) -> IndexRange {
        let begin = self.nodes.len() as u16;
        for spec in specs {
            let instance = DataHandle::Shared(self.shared_instances.len() as u16);
            let index = self.push_node(spec, instance, owner);
            self.shared_instances.push(index);
        }
        IndexRange::new(begin, self.nodes.len() as u16)
    }

    fn compile_batch(
        &mut self,
        bindings: Vec<Binding>,
        target: &PropertyBag,
        owner_name: &str,
        owner: Option<StateHandle>,
    ) -> Result<Option<BatchIndex>> {
        let mut copies = Vec::with_capacity(bindings.len());
        let mut functions = Vec::new();
        self.compile_copies(bindings, target, owner_name, owner, &mut copies, &mut functions)?;
        if copies.is_empty() && functions.is_empty() {
            return Ok(None);
        }
        Ok(Some(self.bindings.push_batch(copies, functions)))
    }

    /// Resolves `bindings` into copies targeting `target`; property functions they read from are
    /// appended to `functions` after the functions feeding them.
    fn compile_copies(
        &mut self,
        bindings: Vec<Binding>,
        target: &PropertyBag,
        owner_name: &str,
        owner: Option<StateHandle>,
        copies: &mut Vec<PropertyCopy>,
        functions: &mut Vec<NodeIndex>,
    ) -> Result<()> {
        for binding in bindings {
            let target_field = target.index_of(&binding.target).ok_or_else(|| {
                StateTreeError::config(format!(
                    "`{owner_name}` has no field `{}` to bind",
                    binding.target
                ))
            })?;
            let (source, source_field) = match binding.source {
                BindingSource::Function(function) => {
                    self.compile_function(*function, owner, functions)?
                }
                other => self.resolve_source(other)?,
            };
            copies.push(PropertyCopy {
                source,
                source_field,
                target_field,
            });
        }
        Ok(())
    }

    fn compile_function(
        &mut self,
        function: FunctionSpec,
        owner: Option<StateHandle>,
        functions: &mut Vec<NodeIndex>,
    ) -> Result<(DataHandle, u16)> {
        let FunctionSpec {
            name,
            function,
            template,
            output,
            inputs,
        } = function;
        let output_field = template.index_of(&output).ok_or_else(|| {
            StateTreeError::config(format!("property function `{name}` has no output `{output}`"))
        })?;

        let mut input_copies = Vec::with_capacity(inputs.len());
        self.compile_copies(inputs, &template, &name, owner, &mut input_copies, functions)?;
        let batch = (!input_copies.is_empty())
            .then(|| self.bindings.push_batch(input_copies, std::iter::empty()));

        let instance = DataHandle::Shared(self.shared_instances.len() as u16);
        let index = NodeIndex(self.nodes.len() as u16);
        self.nodes.push((
            Node {
                name,
                kind: NodeKind::PropertyFunction(function),
                instance,
                template,
                bindings: batch,
                enabled: true,
            },
            Vec::new(),
        ));
        self.shared_instances.push(index);
        functions.push(index);
        Ok((instance, output_field))
    }

    fn resolve_source(&self, source: BindingSource) -> Result<(DataHandle, u16)> {
        let field_of = |bag: &PropertyBag, field: &str, what: &str| {
            bag.index_of(field)
                .ok_or_else(|| StateTreeError::config(format!("{what} has no field `{field}`")))
        };
        match source {
            BindingSource::GlobalParameter(field) => Ok((
                DataHandle::GlobalParameters,
                field_of(&self.parameters, &field, "global parameters")?,
            )),
            BindingSource::StateParameter { state, field } => {
                let handle = self.state(&state)?;
                let params = self.state_params[handle.index()].as_ref().ok_or_else(|| {
                    StateTreeError::config(format!("state `{state}` has no parameters"))
                })?;
                let what = format!("parameters of `{state}`");
                Ok((DataHandle::StateParameters(handle), field_of(params, &field, &what)?))
            }
            BindingSource::Evaluator { node, field } => {
                self.global_source(&self.evaluators, &node, &field, "evaluator")
            }
            BindingSource::GlobalTask { node, field } => {
                self.global_source(&self.global_tasks, &node, &field, "global task")
            }
            BindingSource::Task { state, node, field } => {
                let handle = self.state(&state)?;
                let tasks = self.state_tasks.get(handle.index()).ok_or_else(|| {
                    StateTreeError::config(format!("state `{state}` has no tasks"))
                })?;
                let (position, index) = tasks
                    .iter()
                    .enumerate()
                    .find(|(_, (name, _))| *name == node)
                    .map(|(position, (_, index))| (position, *index))
                    .ok_or_else(|| {
                        StateTreeError::config(format!("state `{state}` has no task `{node}`"))
                    })?;
                let offset = u16::from(self.state_params[handle.index()].is_some());
                let template = &self.nodes[index.index()].0.template;
                Ok((
                    DataHandle::ActiveInstance {
                        state: handle,
                        index: offset + position as u16,
                    },
                    field_of(template, &field, &format!("task `{node}`"))?,
                ))
            }
            BindingSource::Context { index, field } => {
                if index as usize >= self.context_len {
                    return Err(StateTreeError::config(format!(
                        "context data {index} is not declared"
                    )));
                }
                Ok((DataHandle::Context(index), field))
            }
            BindingSource::External { index, field } => {
                if index as usize >= self.external_len {
                    return Err(StateTreeError::config(format!(
                        "external data {index} is not declared"
                    )));
                }
                Ok((DataHandle::External(index), field))
            }
            BindingSource::TransitionEvent(field) => Ok((DataHandle::TransitionEvent, field)),
            BindingSource::StateEvent { state, field } => {
                Ok((DataHandle::StateEvent(self.state(&state)?), field))
            }
            BindingSource::Function(function) => Err(StateTreeError::config(format!(
                "property function `{}` used outside a binding",
                function.name
            ))),
        }
    }

    fn global_source(
        &self,
        nodes: &[(Name, NodeIndex)],
        name: &str,
        field: &str,
        what: &str,
    ) -> Result<(DataHandle, u16)> {
        let index = nodes
            .iter()
            .find(|(node, _)| node == name)
            .map(|(_, index)| *index)
            .ok_or_else(|| StateTreeError::config(format!("unknown {what} `{name}`")))?;
        let node = &self.nodes[index.index()].0;
        let field = node
            .template
            .index_of(field)
            .ok_or_else(|| StateTreeError::config(format!("{what} `{name}` has no field `{field}`")))?;
        Ok((node.instance, field))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::NodeContext;

    struct Noop;

    impl Task for Noop {}

    struct Counter;

    impl Task for Counter {
        fn instance_template(&self) -> PropertyBag {
            PropertyBag::new().with("count", 0)
        }
    }

    #[test]
    fn lays_out_states_depth_first() {
        let tree = StateTreeBuilder::new("layout")
            .state(StateSpec::new("Root"))
            .child("Root", StateSpec::new("A"))
            .child("Root", StateSpec::new("B"))
            .child("A", StateSpec::new("A1"))
            .build()
            .expect("valid tree");

        let names: Vec<&str> = tree.states().iter().map(|s| s.name.as_ref()).collect();
        assert_eq!(names, ["Root", "A", "A1", "B"]);
        let root_children: Vec<&str> = tree
            .children(StateHandle::ROOT)
            .iter()
            .map(|child| tree.state_name(*child))
            .collect();
        assert_eq!(root_children, ["A", "B"]);
        assert_eq!(tree.state(StateHandle(2)).map(|s| s.depth), Some(2));
    }

    #[test]
    fn task_slots_follow_the_parameter_block() {
        let tree = StateTreeBuilder::new("slots")
            .state(
                StateSpec::new("Root")
                    .parameters(PropertyBag::new().with("speed", 1.0f32))
                    .task(NodeSpec::task("noop", Noop))
                    .task(NodeSpec::task("counter", Counter)),
            )
            .build()
            .expect("valid tree");

        let root = tree.state(StateHandle::ROOT).expect("root");
        assert_eq!(root.instance_data_num, 3);
        let counter = tree.node(NodeIndex(root.tasks.begin + 1)).expect("counter");
        assert_eq!(
            counter.instance,
            DataHandle::ActiveInstance {
                state: StateHandle::ROOT,
                index: 2
            }
        );
    }

    #[test]
    fn group_with_tasks_is_rejected() {
        let err = StateTreeBuilder::new("bad")
            .state(StateSpec::group("Root").task(NodeSpec::task("noop", Noop)))
            .build()
            .unwrap_err();
        assert!(matches!(err, StateTreeError::ConfigurationInvalid(_)));
    }

    #[test]
    fn unknown_transition_target_is_rejected() {
        let err = StateTreeBuilder::new("bad")
            .state(StateSpec::new("Root").transition(TransitionSpec::on_completed("Nowhere")))
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("Nowhere"));
    }

    #[test]
    fn binding_to_missing_field_is_rejected() {
        let err = StateTreeBuilder::new("bad")
            .parameters(PropertyBag::new().with("speed", 1.0f32))
            .state(
                StateSpec::new("Root")
                    .task(NodeSpec::task("counter", Counter).bind("missing", BindingSource::global("speed"))),
            )
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("missing"));
    }

    #[test]
    fn linked_state_takes_the_subtree_parameters() {
        let tree = StateTreeBuilder::new("linked")
            .state(StateSpec::new("Root"))
            .child("Root", StateSpec::linked("UseSub", "Sub"))
            .state(StateSpec::subtree("Sub").parameters(PropertyBag::new().with("range", 3)))
            .build()
            .expect("valid tree");

        let linking = tree.find_state("UseSub").and_then(|h| tree.state(h)).expect("state");
        assert_eq!(
            linking.parameters.as_ref().and_then(|p| p.int("range")),
            Some(3)
        );
    }

    struct Double;

    impl PropertyFunction for Double {
        fn instance_template(&self) -> PropertyBag {
            PropertyBag::new().with("input", 0).with("output", 0)
        }

        fn execute(&self, ctx: &mut NodeContext<'_>) {
            let input = ctx.data().int("input").unwrap_or_default();
            ctx.data_mut().set_by_name("output", input * 2);
        }
    }

    #[test]
    fn property_functions_are_appended_and_listed_in_the_batch() {
        let tree = StateTreeBuilder::new("functions")
            .parameters(PropertyBag::new().with("base", 2))
            .state(StateSpec::new("Root").task(NodeSpec::task("counter", Counter).bind(
                "count",
                BindingSource::function(
                    FunctionSpec::new("double", Double, "output")
                        .bind("input", BindingSource::global("base")),
                ),
            )))
            .build()
            .expect("valid tree");

        let counter = &tree.nodes()[0];
        let batch = counter.bindings.expect("bound");
        let functions = tree.bindings().functions(batch);
        assert_eq!(functions.len(), 1);
        assert_eq!(tree.nodes()[functions[0].index()].kind.label(), "property function");
    }
}
