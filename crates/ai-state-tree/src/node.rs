//! Behaviour traits implemented by tasks, evaluators, conditions, considerations and property
//! functions, and the [`NodeContext`] they run against.

use std::any::Any;
use std::sync::Arc;

use ai_core::{PropertyBag, RunStatus, SplitMix64, Value};

use crate::event::{Event, EventQueue, SharedEvent};
use crate::frame::FrameId;
use crate::storage::InstanceData;
use crate::types::{
    ActiveStates, ChangeType, SelectionFallback, StateHandle, TransitionPriority, TransitionTarget,
};

/// An object supplied by the owner of a context (context data) or by the external data provider.
///
/// `property` exposes fields to copy batches by index.
pub trait ContextObject: Any + Send + Sync {
    fn as_any(&self) -> &dyn Any;

    fn property(&self, _field: u16) -> Option<Value> {
        None
    }
}

/// What a task sees of the transition that enters or exits its state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransitionInfo {
    pub change_type: ChangeType,
    pub source_state: Option<StateHandle>,
    pub target: TransitionTarget,
    pub priority: TransitionPriority,
    /// Status of the tree's last tick when the transition was applied.
    pub current_run_status: RunStatus,
}

/// A transition queued by a node or the context owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransitionRequest {
    pub source: FrameId,
    pub target: TransitionTarget,
    pub priority: TransitionPriority,
    pub fallback: SelectionFallback,
}

pub trait Task: Send + Sync + 'static {
    /// Initial contents of the task's instance data.
    fn instance_template(&self) -> PropertyBag {
        PropertyBag::new()
    }

    fn enter_state(&self, _ctx: &mut NodeContext<'_>, _transition: &TransitionInfo) -> RunStatus {
        RunStatus::Running
    }

    fn exit_state(&self, _ctx: &mut NodeContext<'_>, _transition: &TransitionInfo) {}

    fn tick(&self, _ctx: &mut NodeContext<'_>, _delta_time: f32) -> RunStatus {
        RunStatus::Running
    }

    /// Called leaf to root once the active states finish with `status`.
    fn state_completed(
        &self,
        _ctx: &mut NodeContext<'_>,
        _status: RunStatus,
        _completed: &ActiveStates,
    ) {
    }

    /// Only called for tasks whose config sets `should_affect_transitions`.
    fn trigger_transitions(&self, _ctx: &mut NodeContext<'_>) {}
}

pub trait Evaluator: Send + Sync + 'static {
    fn instance_template(&self) -> PropertyBag {
        PropertyBag::new()
    }

    fn tree_start(&self, _ctx: &mut NodeContext<'_>) {}

    fn tree_stop(&self, _ctx: &mut NodeContext<'_>) {}

    fn tick(&self, _ctx: &mut NodeContext<'_>, _delta_time: f32) {}
}

pub trait Condition: Send + Sync + 'static {
    fn instance_template(&self) -> PropertyBag {
        PropertyBag::new()
    }

    fn test_condition(&self, ctx: &NodeContext<'_>) -> bool;
}

pub trait Consideration: Send + Sync + 'static {
    fn instance_template(&self) -> PropertyBag {
        PropertyBag::new()
    }

    /// Raw score, clamped to `[0, 1]` by the runtime.
    fn score(&self, ctx: &NodeContext<'_>) -> f32;
}

/// Computes values into its own instance data before a copy batch reads them.
pub trait PropertyFunction: Send + Sync + 'static {
    fn instance_template(&self) -> PropertyBag;

    fn execute(&self, ctx: &mut NodeContext<'_>);
}

pub struct NodeContext<'a> {
    pub(crate) name: &'a str,
    pub(crate) instance: &'a mut InstanceData,
    pub(crate) events: &'a mut EventQueue,
    pub(crate) requests: &'a mut Vec<TransitionRequest>,
    pub(crate) requested_stop: &'a mut Option<RunStatus>,
    pub(crate) rng: &'a mut SplitMix64,
    pub(crate) context_data: &'a [Option<Arc<dyn ContextObject>>],
    pub(crate) external_data: &'a [Option<Arc<dyn ContextObject>>],
    pub(crate) frame: FrameId,
    pub(crate) state: Option<StateHandle>,
    pub(crate) transition_event: Option<&'a SharedEvent>,
    pub(crate) delta_time: f32,
}

impl<'a> NodeContext<'a> {
    pub fn name(&self) -> &str {
        self.name
    }

    pub fn data(&self) -> &PropertyBag {
        &self.instance.bag
    }

    pub fn data_mut(&mut self) -> &mut PropertyBag {
        &mut self.instance.bag
    }

    pub fn object<T: Any + Send>(&self) -> Option<&T> {
        self.instance.object()
    }

    pub fn object_mut<T: Any + Send>(&mut self) -> Option<&mut T> {
        self.instance.object_mut()
    }

    pub fn set_object<T: Any + Send>(&mut self, object: T) {
        self.instance.set_object(object);
    }

    pub fn take_object<T: Any + Send>(&mut self) -> Option<T> {
        self.instance.take_object()
    }

    /// Instance object and event queue together, for tasks that drive nested execution.
    pub fn object_and_events_mut<T: Any + Send>(&mut self) -> Option<(&mut T, &mut EventQueue)> {
        let object = self.instance.object_mut::<T>()?;
        Some((object, &mut *self.events))
    }

    pub fn events(&self) -> &EventQueue {
        self.events
    }

    pub fn events_mut(&mut self) -> &mut EventQueue {
        self.events
    }

    pub fn send_event(&mut self, event: Event) -> bool {
        self.events.send(event)
    }

    pub fn consume_event(&mut self, event: &SharedEvent) -> bool {
        self.events.consume(event)
    }

    /// Queues a transition from the node's frame. Requests made from `trigger_transitions` are
    /// resolved right away, others at the next transition resolution.
    pub fn request_transition(&mut self, target: TransitionTarget, priority: TransitionPriority) {
        self.request_transition_with(target, priority, SelectionFallback::None);
    }

    pub fn request_transition_with(
        &mut self,
        target: TransitionTarget,
        priority: TransitionPriority,
        fallback: SelectionFallback,
    ) {
        self.requests.push(TransitionRequest {
            source: self.frame,
            target,
            priority,
            fallback,
        });
    }

    /// Stops the whole tree once the current update finishes.
    pub fn stop_tree(&mut self, status: RunStatus) {
        *self.requested_stop = Some(status.as_completion());
    }

    pub fn rng(&mut self) -> &mut SplitMix64 {
        self.rng
    }

    pub fn context_data<T: 'static>(&self, index: u16) -> Option<&T> {
        let object = self.context_data.get(index as usize)?.as_deref()?;
        object.as_any().downcast_ref::<T>()
    }

    /// External data declared by the node's tree, in declaration order.
    pub fn external_data<T: 'static>(&self, index: u16) -> Option<&T> {
        let object = self.external_data.get(index as usize)?.as_deref()?;
        object.as_any().downcast_ref::<T>()
    }

    pub fn transition_event(&self) -> Option<&Event> {
        self.transition_event.map(|event| event.as_ref())
    }

    pub fn delta_time(&self) -> f32 {
        self.delta_time
    }

    pub fn frame(&self) -> FrameId {
        self.frame
    }

    /// The state owning the node, `None` for global nodes.
    pub fn state(&self) -> Option<StateHandle> {
        self.state
    }
}
