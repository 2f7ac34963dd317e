//! Resolution of [`DataHandle`]s against a frame slice, property copies and node scopes.

use ai_core::{PropertyBag, Value};

use crate::bindings::{BatchIndex, CopyMode};
use crate::context::ExecutionContext;
use crate::event::{Event, SharedEvent};
use crate::frame::{ExecutionFrame, ParamSource};
use crate::node::{ContextObject, NodeContext};
use crate::storage::InstanceData;
use crate::tree::Node;
use crate::types::{DataHandle, StateHandle};

/// Where a resolved handle lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DataSlot {
    Instance(usize),
    Temporary(usize),
    Shared { tree: usize, index: usize },
    ContextParameters,
    Context(usize),
    External(usize),
    TransitionEvent,
    StateEvent { frame: usize, depth: usize },
}

/// Read-only view of a resolved handle.
#[derive(Clone, Copy)]
pub enum DataView<'a> {
    Bag(&'a PropertyBag),
    Event(&'a Event),
    Object(&'a dyn ContextObject),
}

impl<'a> DataView<'a> {
    pub fn bag(self) -> Option<&'a PropertyBag> {
        match self {
            DataView::Bag(bag) => Some(bag),
            DataView::Event(event) => event.payload.as_ref().map(|payload| &payload.data),
            DataView::Object(_) => None,
        }
    }

    pub fn event(self) -> Option<&'a Event> {
        match self {
            DataView::Event(event) => Some(event),
            _ => None,
        }
    }

    pub fn object<T: 'static>(self) -> Option<&'a T> {
        match self {
            DataView::Object(object) => object.as_any().downcast_ref::<T>(),
            _ => None,
        }
    }

    /// Field `field`; object fields come from [`ContextObject::property`].
    pub fn field(self, field: u16) -> Option<Value> {
        match self {
            DataView::Object(object) => object.property(field),
            other => other.bag()?.get(field).cloned(),
        }
    }
}

impl std::fmt::Debug for DataView<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DataView::Bag(bag) => f.debug_tuple("Bag").field(bag).finish(),
            DataView::Event(event) => f.debug_tuple("Event").field(&event.tag).finish(),
            DataView::Object(_) => f.write_str("Object"),
        }
    }
}

impl ExecutionContext {
    /// Resolves `handle` for the frame at `frame_index` of `frames`.
    ///
    /// Instance handles past the frame's instantiated states fall back to temporaries.
    pub(crate) fn resolve(
        &self,
        frames: &[ExecutionFrame],
        frame_index: usize,
        handle: DataHandle,
    ) -> Option<DataSlot> {
        let frame = frames.get(frame_index)?;
        match handle {
            DataHandle::None => None,
            DataHandle::Context(index) => Some(DataSlot::Context(index as usize)),
            DataHandle::External(index) => frame
                .external_data_base
                .map(|base| DataSlot::External(base + index as usize)),
            DataHandle::GlobalParameters => match frame.global_parameters {
                ParamSource::Context => Some(DataSlot::ContextParameters),
                ParamSource::Inherit => {
                    self.resolve(frames, frame_index.checked_sub(1)?, DataHandle::GlobalParameters)
                }
                ParamSource::ParentState(state) => self.resolve(
                    frames,
                    frame_index.checked_sub(1)?,
                    DataHandle::StateParameters(state),
                ),
            },
            DataHandle::GlobalInstance(index) => match frame.global_instance_base {
                Some(base) => Some(DataSlot::Instance(base + index as usize)),
                None => self
                    .storage
                    .find_temporary(frame.id(), handle)
                    .map(DataSlot::Temporary),
            },
            DataHandle::ActiveInstance { state, index } => {
                self.resolve_state_slot(frame, state, index as usize, handle)
            }
            DataHandle::StateParameters(state) => {
                if state == frame.root_state {
                    if let Some(ParamSource::ParentState(parent)) = frame.state_parameters {
                        return self.resolve(
                            frames,
                            frame_index.checked_sub(1)?,
                            DataHandle::StateParameters(parent),
                        );
                    }
                }
                self.resolve_state_slot(frame, state, 0, handle)
            }
            DataHandle::Shared(index) => self
                .storage
                .shared
                .iter()
                .position(|shared| shared.tree == frame.tree.id())
                .map(|tree| DataSlot::Shared {
                    tree,
                    index: index as usize,
                }),
            DataHandle::TransitionEvent => Some(DataSlot::TransitionEvent),
            DataHandle::StateEvent(state) => frame
                .active_states
                .index_of(state)
                .map(|depth| DataSlot::StateEvent {
                    frame: frame_index,
                    depth,
                }),
        }
    }

    fn resolve_state_slot(
        &self,
        frame: &ExecutionFrame,
        state: StateHandle,
        index: usize,
        handle: DataHandle,
    ) -> Option<DataSlot> {
        if let (Some(depth), Some(base)) =
            (frame.active_states.index_of(state), frame.active_instance_base)
        {
            if depth < frame.num_instantiated_states {
                return Some(DataSlot::Instance(
                    base + frame.state_slot_offset(depth) + index,
                ));
            }
        }
        self.storage
            .find_temporary(frame.id(), handle)
            .map(DataSlot::Temporary)
    }

    pub(crate) fn view<'s>(
        &'s self,
        frames: &'s [ExecutionFrame],
        slot: DataSlot,
        event: Option<&'s SharedEvent>,
    ) -> Option<DataView<'s>> {
        let storage = &self.storage;
        let view = match slot {
            DataSlot::Instance(index) => DataView::Bag(&storage.instances.get(index)?.bag),
            DataSlot::Temporary(index) => DataView::Bag(&storage.temporaries.get(index)?.data.bag),
            DataSlot::Shared { tree, index } => {
                DataView::Bag(&storage.shared.get(tree)?.data.get(index)?.bag)
            }
            DataSlot::ContextParameters => DataView::Bag(&storage.parameters),
            DataSlot::Context(index) => DataView::Object(self.context_data.get(index)?.as_deref()?),
            DataSlot::External(index) => {
                DataView::Object(self.external_views.get(index)?.as_deref()?)
            }
            DataSlot::TransitionEvent => DataView::Event(event?),
            DataSlot::StateEvent { frame, depth } => {
                DataView::Event(frames.get(frame)?.state_event(depth)?)
            }
        };
        Some(view)
    }

    pub(crate) fn read_value(
        &self,
        frames: &[ExecutionFrame],
        frame_index: usize,
        handle: DataHandle,
        field: u16,
        event: Option<&SharedEvent>,
    ) -> Option<Value> {
        let slot = self.resolve(frames, frame_index, handle)?;
        self.view(frames, slot, event)?.field(field)
    }

    pub(crate) fn instance_mut(&mut self, slot: DataSlot) -> Option<&mut InstanceData> {
        match slot {
            DataSlot::Instance(index) => self.storage.instances.get_mut(index),
            DataSlot::Temporary(index) => self
                .storage
                .temporaries
                .get_mut(index)
                .map(|temp| &mut temp.data),
            DataSlot::Shared { tree, index } => self.storage.shared.get_mut(tree)?.data.get_mut(index),
            _ => None,
        }
    }

    /// View of `handle` in the active frame at `frame_index`, for inspection between ticks.
    pub fn data_view(&self, frame_index: usize, handle: DataHandle) -> Option<DataView<'_>> {
        let frames = &self.storage.exec.active_frames;
        let slot = self.resolve(frames, frame_index, handle)?;
        self.view(frames, slot, None)
    }

    /// Runs the batch's property functions, then copies the batch into `target`.
    pub(crate) fn copy_into(
        &mut self,
        frames: &[ExecutionFrame],
        frame_index: usize,
        batch: BatchIndex,
        mode: CopyMode,
        target: DataHandle,
        event: Option<&SharedEvent>,
    ) -> bool {
        let tree = std::sync::Arc::clone(&frames[frame_index].tree);
        self.storage.ensure_shared(&tree);

        for function in tree.bindings.functions(batch) {
            let node = &tree.nodes[function.index()];
            if let Some(function_batch) = node.bindings {
                let gathered = tree.bindings.gather(function_batch, mode, |handle, field| {
                    self.read_value(frames, frame_index, handle, field, event)
                });
                if let Some(slot) = self.resolve(frames, frame_index, node.instance) {
                    if let Some(instance) = self.instance_mut(slot) {
                        gathered.apply(&mut instance.bag);
                    }
                }
            }
            if let crate::tree::NodeKind::PropertyFunction(property_function) = &node.kind {
                self.with_node(frames, frame_index, node, None, event, 0.0, |ctx| {
                    property_function.execute(ctx)
                });
            }
        }

        let gathered = tree.bindings.gather(batch, mode, |handle, field| {
            self.read_value(frames, frame_index, handle, field, event)
        });
        if mode == CopyMode::Validated && !gathered.is_complete() {
            return false;
        }
        let Some(slot) = self.resolve(frames, frame_index, target) else {
            return false;
        };
        match self.instance_mut(slot) {
            Some(instance) => gathered.apply(&mut instance.bag),
            None => false,
        }
    }

    /// Copies a node's bound properties into its instance data.
    pub(crate) fn copy_node_bindings(
        &mut self,
        frames: &[ExecutionFrame],
        frame_index: usize,
        node: &Node,
        mode: CopyMode,
        event: Option<&SharedEvent>,
    ) -> bool {
        match node.bindings {
            Some(batch) => self.copy_into(frames, frame_index, batch, mode, node.instance, event),
            None => true,
        }
    }

    /// Runs `f` with a [`NodeContext`] over the node's instance data.
    ///
    /// A node whose instance cannot be resolved runs against empty scratch data.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn with_node<R>(
        &mut self,
        frames: &[ExecutionFrame],
        frame_index: usize,
        node: &Node,
        state: Option<StateHandle>,
        event: Option<&SharedEvent>,
        delta_time: f32,
        f: impl FnOnce(&mut NodeContext<'_>) -> R,
    ) -> R {
        let frame = &frames[frame_index];
        let slot = self.resolve(frames, frame_index, node.instance);

        let external_data: &[Option<std::sync::Arc<dyn ContextObject>>] =
            match frame.external_data_base {
                Some(base) => {
                    let len = frame.tree.external_data.len();
                    self.external_views.get(base..base + len).unwrap_or(&[])
                }
                None => &[],
            };

        let mut scratch = InstanceData::default();
        let storage = &mut self.storage;
        let instance = match slot {
            Some(DataSlot::Instance(index)) => storage.instances.get_mut(index),
            Some(DataSlot::Temporary(index)) => storage
                .temporaries
                .get_mut(index)
                .map(|temp| &mut temp.data),
            Some(DataSlot::Shared { tree, index }) => storage
                .shared
                .get_mut(tree)
                .and_then(|shared| shared.data.get_mut(index)),
            _ => None,
        }
        .unwrap_or(&mut scratch);

        let mut ctx = NodeContext {
            name: &node.name,
            instance,
            events: &mut storage.events,
            requests: &mut storage.requests,
            requested_stop: &mut storage.exec.requested_stop,
            rng: &mut storage.exec.rng,
            context_data: &self.context_data,
            external_data,
            frame: frame.id(),
            state,
            transition_event: event,
            delta_time,
        };
        f(&mut ctx)
    }
}
