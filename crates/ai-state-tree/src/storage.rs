//! Instance data arena owned by an execution context.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use ai_core::{PropertyBag, RunStatus, SplitMix64};

use crate::event::{EventQueue, SharedEvent};
use crate::frame::{ExecutionFrame, FrameId};
use crate::node::TransitionRequest;
use crate::tree::{StateTree, TreeId};
use crate::types::{DataHandle, NodeIndex, StateHandle, UpdatePhase};

/// Runtime data of one node or parameter block.
#[derive(Default)]
pub struct InstanceData {
    pub bag: PropertyBag,
    object: Option<Box<dyn Any + Send>>,
}

impl InstanceData {
    pub fn from_template(template: &PropertyBag) -> Self {
        Self {
            bag: template.clone(),
            object: None,
        }
    }

    pub fn object<T: Any + Send>(&self) -> Option<&T> {
        self.object.as_ref()?.downcast_ref::<T>()
    }

    pub fn object_mut<T: Any + Send>(&mut self) -> Option<&mut T> {
        self.object.as_mut()?.downcast_mut::<T>()
    }

    pub fn set_object<T: Any + Send>(&mut self, object: T) {
        self.object = Some(Box::new(object));
    }

    pub fn take_object<T: Any + Send>(&mut self) -> Option<T> {
        let object = self.object.take()?;
        match object.downcast::<T>() {
            Ok(object) => Some(*object),
            Err(other) => {
                self.object = Some(other);
                None
            }
        }
    }

    pub fn has_object(&self) -> bool {
        self.object.is_some()
    }
}

impl fmt::Debug for InstanceData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstanceData")
            .field("bag", &self.bag)
            .field("has_object", &self.object.is_some())
            .finish()
    }
}

/// Speculative instance created during selection, before its frame/state is committed.
pub(crate) struct TemporaryInstance {
    pub frame: FrameId,
    pub handle: DataHandle,
    /// Node that was started on this instance and must be stopped if it is discarded.
    pub owner: Option<(Arc<StateTree>, NodeIndex)>,
    pub data: InstanceData,
}

#[derive(Debug, Clone)]
pub(crate) struct DelayedTransition {
    pub tree: TreeId,
    pub transition: u16,
    pub duration: f32,
    pub elapsed: f32,
    pub event: Option<SharedEvent>,
    pub event_hash: u64,
}

impl DelayedTransition {
    pub fn is_expired(&self) -> bool {
        self.elapsed >= self.duration
    }
}

pub(crate) struct SharedInstances {
    pub tree: TreeId,
    pub data: Vec<InstanceData>,
}

#[derive(Debug, Clone)]
pub(crate) struct ExecutionState {
    pub active_frames: Vec<ExecutionFrame>,
    pub tree_run_status: RunStatus,
    pub last_tick_status: RunStatus,
    pub requested_stop: Option<RunStatus>,
    pub phase: UpdatePhase,
    pub completed_frame: Option<usize>,
    pub completed_state: Option<StateHandle>,
    /// First frame of a subtree whose completion was handed to its linking state.
    pub bubbled_frame: Option<usize>,
    pub enter_failed_frame: Option<usize>,
    pub enter_failed_task: Option<NodeIndex>,
    pub delayed_transitions: Vec<DelayedTransition>,
    pub rng: SplitMix64,
    pub state_change_count: u32,
}

impl Default for ExecutionState {
    fn default() -> Self {
        Self {
            active_frames: Vec::new(),
            tree_run_status: RunStatus::Unset,
            last_tick_status: RunStatus::Unset,
            requested_stop: None,
            phase: UpdatePhase::Unset,
            completed_frame: None,
            completed_state: None,
            bubbled_frame: None,
            enter_failed_frame: None,
            enter_failed_task: None,
            delayed_transitions: Vec::new(),
            rng: SplitMix64::default(),
            state_change_count: 0,
        }
    }
}

/// Everything an execution context mutates: execution state, the instance arena, temporaries,
/// shared scratch instances, events and queued transition requests.
pub struct InstanceStorage {
    pub(crate) exec: ExecutionState,
    pub(crate) instances: Vec<InstanceData>,
    pub(crate) temporaries: Vec<TemporaryInstance>,
    pub(crate) shared: Vec<SharedInstances>,
    pub(crate) events: EventQueue,
    pub(crate) owns_event_queue: bool,
    pub(crate) requests: Vec<TransitionRequest>,
    pub(crate) parameters: PropertyBag,
}

impl InstanceStorage {
    pub fn new(max_events: usize) -> Self {
        Self {
            exec: ExecutionState::default(),
            instances: Vec::new(),
            temporaries: Vec::new(),
            shared: Vec::new(),
            events: EventQueue::with_capacity(max_events),
            owns_event_queue: true,
            requests: Vec::new(),
            parameters: PropertyBag::new(),
        }
    }

    /// Number of live arena slots.
    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    pub fn instance(&self, index: usize) -> Option<&InstanceData> {
        self.instances.get(index)
    }

    pub fn events(&self) -> &EventQueue {
        &self.events
    }

    pub fn events_mut(&mut self) -> &mut EventQueue {
        &mut self.events
    }

    /// Drops all runtime data; queued events and parameters survive.
    pub(crate) fn reset(&mut self) {
        self.exec = ExecutionState::default();
        self.instances.clear();
        self.temporaries.clear();
        self.requests.clear();
    }

    /// Truncates the arena to the retained prefix.
    pub(crate) fn shrink_to(&mut self, len: usize) {
        self.instances.truncate(len);
    }

    pub(crate) fn append(&mut self, data: impl IntoIterator<Item = InstanceData>) {
        self.instances.extend(data);
    }

    pub(crate) fn find_temporary(&self, frame: FrameId, handle: DataHandle) -> Option<usize> {
        self.temporaries
            .iter()
            .position(|temp| temp.frame == frame && temp.handle == handle)
    }

    pub(crate) fn add_temporary(
        &mut self,
        frame: FrameId,
        handle: DataHandle,
        owner: Option<(Arc<StateTree>, NodeIndex)>,
        template: &PropertyBag,
    ) -> usize {
        if let Some(index) = self.find_temporary(frame, handle) {
            return index;
        }
        self.temporaries.push(TemporaryInstance {
            frame,
            handle,
            owner,
            data: InstanceData::from_template(template),
        });
        self.temporaries.len() - 1
    }

    /// Index of the tree's shared scratch instances, created on first use.
    pub(crate) fn ensure_shared(&mut self, tree: &StateTree) -> usize {
        if let Some(index) = self.shared.iter().position(|s| s.tree == tree.id()) {
            return index;
        }
        let data = tree
            .shared_instances
            .iter()
            .map(|node| InstanceData::from_template(&tree.nodes[node.index()].template))
            .collect();
        self.shared.push(SharedInstances {
            tree: tree.id(),
            data,
        });
        self.shared.len() - 1
    }
}

impl fmt::Debug for InstanceStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstanceStorage")
            .field("instances", &self.instances.len())
            .field("temporaries", &self.temporaries.len())
            .field("events", &self.events.len())
            .field("run_status", &self.exec.tree_run_status)
            .finish()
    }
}
