//! Transition requests and the per-tick search for the transition to apply.

use std::sync::Arc;

use ai_core::RunStatus;
use tracing::{debug, trace, warn};

use crate::bindings::CopyMode;
use crate::context::ExecutionContext;
use crate::event::SharedEvent;
use crate::frame::{ExecutionFrame, FrameId};
use crate::node::{TransitionInfo, TransitionRequest};
use crate::storage::DelayedTransition;
use crate::types::{
    ChangeType, NodeIndex, SelectionFallback, StateHandle, TransitionPriority, TransitionTarget,
    TransitionTrigger, UpdatePhase,
};

/// The transition chosen by [`ExecutionContext::trigger_transitions`], with the frames to enter.
#[derive(Debug, Clone, Default)]
pub(crate) struct TransitionResult {
    pub next_frames: Vec<ExecutionFrame>,
    pub source: Option<FrameId>,
    pub source_state: Option<StateHandle>,
    pub target: TransitionTarget,
    pub priority: TransitionPriority,
    pub current_run_status: RunStatus,
}

impl TransitionResult {
    pub fn info(&self, change_type: ChangeType) -> TransitionInfo {
        TransitionInfo {
            change_type,
            source_state: self.source_state,
            target: self.target,
            priority: self.priority,
            current_run_status: self.current_run_status,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Handler {
    Task {
        frame: usize,
        state: Option<StateHandle>,
        node: NodeIndex,
        priority: TransitionPriority,
    },
    State {
        frame: usize,
        state: StateHandle,
    },
}

impl Handler {
    fn priority(self) -> TransitionPriority {
        match self {
            Handler::Task { priority, .. } => priority,
            Handler::State { .. } => TransitionPriority::Normal,
        }
    }
}

/// Frame with the identity of `frame` and no active states.
fn stub_frame(frame: &ExecutionFrame) -> ExecutionFrame {
    let mut stub = frame.clone();
    stub.truncate_states(0);
    stub
}

impl ExecutionContext {
    /// Records `target` as the next transition unless one of equal or higher priority is set.
    ///
    /// State targets are selected right away; the transition is only recorded when selection
    /// succeeds.
    pub(crate) fn request_transition_internal(
        &mut self,
        frames: &[ExecutionFrame],
        frame_index: usize,
        target: TransitionTarget,
        priority: TransitionPriority,
        event: Option<&SharedEvent>,
        fallback: SelectionFallback,
    ) -> bool {
        if self.next_transition.priority >= priority {
            return false;
        }
        let frame = &frames[frame_index];

        let state = match target {
            TransitionTarget::NotSet
            | TransitionTarget::Succeeded
            | TransitionTarget::Failed
            | TransitionTarget::Stopped => {
                self.setup_next_transition(frame, target, priority, vec![stub_frame(frame)]);
                trace!(tree = frame.tree.name(), ?target, ?priority, "transition requested");
                return true;
            }
            TransitionTarget::State(state) => state,
        };

        match self.select_state(frame, state, event, fallback) {
            Ok(selection) => {
                for next in &selection.frames {
                    for (depth, handle) in next.active_states.iter().enumerate() {
                        let consume = next
                            .tree
                            .state(handle)
                            .is_some_and(|state| state.consume_event_on_select);
                        if let (true, Some(event)) = (consume, next.state_event(depth)) {
                            self.storage.events.consume(event);
                        }
                    }
                }
                debug!(
                    tree = frame.tree.name(),
                    target = frame.tree.state_name(state),
                    ?priority,
                    "transition selected"
                );
                self.setup_next_transition(frame, target, priority, selection.frames);
                true
            }
            Err(err) => {
                trace!(tree = frame.tree.name(), error = %err, "transition target not selectable");
                self.record_error(err);
                false
            }
        }
    }

    fn setup_next_transition(
        &mut self,
        frame: &ExecutionFrame,
        target: TransitionTarget,
        priority: TransitionPriority,
        next_frames: Vec<ExecutionFrame>,
    ) {
        self.next_transition = TransitionResult {
            next_frames,
            source: Some(frame.id()),
            source_state: None,
            target,
            priority,
            current_run_status: self.storage.exec.last_tick_status,
        };
    }

    fn apply_request(&mut self, frames: &[ExecutionFrame], request: TransitionRequest) -> bool {
        let Some(frame_index) = frames.iter().position(|frame| frame.id() == request.source) else {
            warn!(target = ?request.target, "transition request from an inactive frame, ignored");
            return false;
        };
        self.request_transition_internal(
            frames,
            frame_index,
            request.target,
            request.priority,
            None,
            request.fallback,
        )
    }

    /// Looks for the highest priority transition of the active states.
    ///
    /// Returns true when `next_transition` holds a state or completion target to apply.
    pub(crate) fn trigger_transitions(&mut self) -> bool {
        let outer_phase =
            std::mem::replace(&mut self.storage.exec.phase, UpdatePhase::TriggerTransitions);
        let triggered = self.trigger_transitions_inner();
        if !triggered {
            self.discard_temporaries();
        }
        self.storage.exec.phase = outer_phase;
        triggered
    }

    fn trigger_transitions_inner(&mut self) -> bool {
        self.next_transition = TransitionResult::default();
        let frames = self.storage.exec.active_frames.clone();
        if frames.is_empty() {
            return false;
        }

        for request in std::mem::take(&mut self.storage.requests) {
            self.apply_request(&frames, request);
        }

        // A completed subtree only reports through its linking state's completion transitions.
        let bubbled = self.storage.exec.bubbled_frame.take();
        let mut handlers = Vec::new();
        for (frame_index, frame) in frames.iter().enumerate().rev() {
            if bubbled.is_some_and(|first| frame_index >= first) {
                continue;
            }
            let tree = &frame.tree;
            for handle in frame.active_states.iter().rev() {
                let Some(state) = tree.state(handle) else {
                    continue;
                };
                if !state.enabled {
                    continue;
                }
                for node in state.tasks.nodes().rev() {
                    if let Some((_, config)) = tree.nodes[node.index()].task() {
                        if config.should_affect_transitions {
                            handlers.push(Handler::Task {
                                frame: frame_index,
                                state: Some(handle),
                                node,
                                priority: config.transition_priority,
                            });
                        }
                    }
                }
                if !state.transitions.is_empty() {
                    handlers.push(Handler::State {
                        frame: frame_index,
                        state: handle,
                    });
                }
            }
            if frame.is_global_frame && tree.has_global_transition_tasks() {
                for node in tree.global_tasks.nodes().rev() {
                    if let Some((_, config)) = tree.nodes[node.index()].task() {
                        if config.should_affect_transitions {
                            handlers.push(Handler::Task {
                                frame: frame_index,
                                state: None,
                                node,
                                priority: config.transition_priority,
                            });
                        }
                    }
                }
            }
        }
        handlers.sort_by(|a, b| b.priority().cmp(&a.priority()));

        for handler in handlers {
            match handler {
                Handler::Task {
                    frame,
                    state,
                    node,
                    ..
                } => self.run_transition_task(&frames, frame, state, node),
                Handler::State { frame, state } => self.trigger_state_transitions(&frames, frame, state),
            }
        }

        if self.storage.owns_event_queue {
            self.storage.events.clear();
        }

        let mut process_subtree_completion = true;
        if self.next_transition.priority == TransitionPriority::None
            && self.storage.exec.last_tick_status != RunStatus::Running
        {
            self.trigger_completion_transitions(&frames);

            if self.next_transition.priority == TransitionPriority::None {
                let root = StateHandle::ROOT;
                if !self.request_transition_internal(
                    &frames,
                    0,
                    TransitionTarget::State(frames[0].root_state),
                    TransitionPriority::Normal,
                    None,
                    SelectionFallback::None,
                ) {
                    debug!(tree = frames[0].tree.name(), state = %root, "could not reselect root, failing tree");
                    self.setup_next_transition(
                        &frames[0],
                        TransitionTarget::Failed,
                        TransitionPriority::Critical,
                        vec![stub_frame(&frames[0])],
                    );
                    process_subtree_completion = false;
                }
            }
        }

        if let (Some(status), true) = (
            self.next_transition.target.completion_status(),
            process_subtree_completion,
        ) {
            let source = self.next_transition.source;
            let source_index = frames.iter().position(|frame| Some(frame.id()) == source);
            if let Some(source_index) = source_index.filter(|index| *index > 0) {
                let parent_index = source_index - 1;
                if let Some(linked_state) = frames[parent_index].active_states.last() {
                    debug!(
                        tree = frames[parent_index].tree.name(),
                        state = frames[parent_index].tree.state_name(linked_state),
                        ?status,
                        "linked subtree completed"
                    );
                    let exec = &mut self.storage.exec;
                    exec.completed_frame = Some(parent_index);
                    exec.completed_state = Some(linked_state);
                    exec.bubbled_frame = Some(source_index);
                    exec.last_tick_status = status;
                    self.next_transition = TransitionResult::default();
                    return false;
                }
            }
        }

        self.next_transition.target.is_set()
    }

    fn run_transition_task(
        &mut self,
        frames: &[ExecutionFrame],
        frame_index: usize,
        state: Option<StateHandle>,
        node_index: NodeIndex,
    ) {
        let tree = Arc::clone(&frames[frame_index].tree);
        let node = &tree.nodes[node_index.index()];
        let Some((task, config)) = node.task() else {
            return;
        };
        if !node.enabled {
            return;
        }
        if config.copy_bound_properties_on_tick {
            self.copy_node_bindings(frames, frame_index, node, CopyMode::Unchecked, None);
        }

        let queued = std::mem::take(&mut self.storage.requests);
        self.with_node(frames, frame_index, node, state, None, 0.0, |ctx| {
            task.trigger_transitions(ctx)
        });
        let requested = std::mem::replace(&mut self.storage.requests, queued);
        for request in requested {
            if self.apply_request(frames, request) {
                self.next_transition.source_state = state;
            }
        }
    }

    fn trigger_state_transitions(
        &mut self,
        frames: &[ExecutionFrame],
        frame_index: usize,
        handle: StateHandle,
    ) {
        let tree = Arc::clone(&frames[frame_index].tree);
        let Some(state) = tree.state(handle) else {
            return;
        };

        for transition_index in state.transitions.indices() {
            let transition = &tree.transitions[transition_index];
            if !transition.enabled
                || transition.priority <= self.next_transition.priority
                || transition.trigger.is_completion()
            {
                continue;
            }

            if transition.delay.is_some() {
                let expired = self.take_expired_delays(&tree, transition_index as u16);
                let mut fired = false;
                for delayed in expired {
                    trace!(state = %state.name, "delayed transition expired");
                    if self.request_transition_internal(
                        frames,
                        frame_index,
                        transition.target,
                        transition.priority,
                        delayed.event.as_ref(),
                        transition.fallback,
                    ) {
                        if let (Some(event), true) = (&delayed.event, transition.consume_event_on_select) {
                            self.storage.events.consume(event);
                        }
                        self.next_transition.source_state = Some(handle);
                        fired = true;
                        break;
                    }
                }
                if fired {
                    continue;
                }
            }

            let candidates: Vec<Option<SharedEvent>> = match transition.trigger {
                TransitionTrigger::OnEvent => match &transition.required_event {
                    Some(desc) => self.storage.events.matching(desc).cloned().map(Some).collect(),
                    None => Vec::new(),
                },
                TransitionTrigger::OnTick => vec![None],
                _ => Vec::new(),
            };

            for event in candidates {
                if !self.test_all_conditions(frames, frame_index, transition.conditions, event.as_ref()) {
                    continue;
                }

                if let Some(delay) = &transition.delay {
                    let event_hash = event.as_ref().map_or(0, |event| event.fingerprint());
                    let tree_id = tree.id();
                    let pending = self.storage.exec.delayed_transitions.iter().any(|delayed| {
                        delayed.tree == tree_id
                            && delayed.transition as usize == transition_index
                            && delayed.event_hash == event_hash
                    });
                    if pending {
                        continue;
                    }
                    let duration = delay.sample(&mut self.storage.exec.rng);
                    if duration > 0.0 {
                        debug!(state = %state.name, duration, "delaying transition");
                        self.storage.exec.delayed_transitions.push(DelayedTransition {
                            tree: tree_id,
                            transition: transition_index as u16,
                            duration,
                            elapsed: 0.0,
                            event: event.clone(),
                            event_hash,
                        });
                        continue;
                    }
                }

                if self.request_transition_internal(
                    frames,
                    frame_index,
                    transition.target,
                    transition.priority,
                    event.as_ref(),
                    transition.fallback,
                ) {
                    if let (Some(event), true) = (&event, transition.consume_event_on_select) {
                        self.storage.events.consume(event);
                    }
                    self.next_transition.source_state = Some(handle);
                    break;
                }
            }
        }
    }

    fn take_expired_delays(
        &mut self,
        tree: &crate::tree::StateTree,
        transition: u16,
    ) -> Vec<DelayedTransition> {
        let delays = &mut self.storage.exec.delayed_transitions;
        let mut expired = Vec::new();
        let mut index = 0;
        while index < delays.len() {
            let delayed = &delays[index];
            if delayed.tree == tree.id() && delayed.transition == transition && delayed.is_expired() {
                expired.push(delays.swap_remove(index));
            } else {
                index += 1;
            }
        }
        expired
    }

    /// Walks from the completed state towards the root looking for a completion transition.
    fn trigger_completion_transitions(&mut self, frames: &[ExecutionFrame]) {
        let status = match self.storage.exec.last_tick_status {
            RunStatus::Succeeded => RunStatus::Succeeded,
            _ => RunStatus::Failed,
        };
        let start_frame = self
            .storage
            .exec
            .completed_frame
            .filter(|index| *index < frames.len())
            .unwrap_or(frames.len() - 1);
        let completed_state = self.storage.exec.completed_state;

        for frame_index in (0..=start_frame).rev() {
            let frame = &frames[frame_index];
            let tree = Arc::clone(&frame.tree);
            let state_count = if frame_index == start_frame {
                match completed_state {
                    Some(completed) => match frame.active_states.index_of(completed) {
                        Some(depth) => depth + 1,
                        None => {
                            warn!(state = %completed, "completed state is not active");
                            0
                        }
                    },
                    None => frame.active_states.len(),
                }
            } else {
                frame.active_states.len()
            };

            for depth in (0..state_count).rev() {
                let Some(handle) = frame.active_states.get(depth) else {
                    continue;
                };
                let Some(state) = tree.state(handle) else {
                    continue;
                };
                for transition_index in state.transitions.indices() {
                    let transition = &tree.transitions[transition_index];
                    if !transition.enabled || !transition.trigger.fires_on(status) {
                        continue;
                    }
                    if !self.test_all_conditions(frames, frame_index, transition.conditions, None) {
                        continue;
                    }
                    if self.request_transition_internal(
                        frames,
                        frame_index,
                        transition.target,
                        TransitionPriority::Normal,
                        None,
                        transition.fallback,
                    ) {
                        self.next_transition.source_state = Some(handle);
                        break;
                    }
                }
                if self.next_transition.priority != TransitionPriority::None {
                    return;
                }
            }
        }
    }
}
