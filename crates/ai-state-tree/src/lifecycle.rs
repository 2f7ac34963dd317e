//! Instance data layout and the enter, exit, tick and completion passes over the active frames.

use std::sync::Arc;

use ai_core::{PropertyBag, RunStatus};
use tracing::{debug, trace};

use crate::bindings::CopyMode;
use crate::context::ExecutionContext;
use crate::error::StateTreeError;
use crate::event::SharedEvent;
use crate::expression::ExpressionFolder;
use crate::frame::{ExecutionFrame, FrameId};
use crate::node::TransitionInfo;
use crate::storage::InstanceData;
use crate::transitions::TransitionResult;
use crate::tree::{NodeKind, StateTree};
use crate::types::{
    ChangeType, ConditionEvaluationMode, DataHandle, IndexRange, NodeIndex, StateHandle,
    TransitionPriority, TransitionTarget, UpdatePhase,
};

impl ExecutionContext {
    /// Lays out the instance arena for `next`, keeping the prefix shared with `current`.
    ///
    /// Slots outside the common prefix claim a matching temporary instance when one exists,
    /// otherwise they are created from their template.
    pub(crate) fn update_instance_data(
        &mut self,
        current: &[ExecutionFrame],
        next: &mut [ExecutionFrame],
    ) {
        let mut pending: Vec<InstanceData> = Vec::new();
        let mut total = 0usize;
        let mut common = 0usize;
        let mut are_common = true;
        let mut global_base = 0usize;

        for (frame_index, frame) in next.iter_mut().enumerate() {
            let tree = Arc::clone(&frame.tree);
            let id = frame.id();
            let current_frame = current
                .get(frame_index)
                .filter(|current| current.is_same_frame(frame));
            if current_frame.is_none() {
                are_common = false;
            }

            if frame.is_global_frame {
                global_base = total;
                for (slot, node) in tree.global_instances.iter().enumerate() {
                    if are_common {
                        total += 1;
                        common = total;
                        continue;
                    }
                    let handle = DataHandle::GlobalInstance(slot as u16);
                    let template = &tree.nodes[node.index()].template;
                    pending.push(self.claim_instance(id, handle, Some(template)));
                    total += 1;
                }
            }
            frame.global_instance_base = Some(global_base);
            frame.active_instance_base = Some(total);

            let states = frame.active_states;
            for (depth, state) in states.iter().enumerate() {
                let Some(compact) = tree.state(state) else {
                    continue;
                };
                let state_common = are_common
                    && current_frame.is_some_and(|current| {
                        current.active_states.get(depth) == Some(state)
                            && depth < current.num_instantiated_states
                    });
                if !state_common {
                    are_common = false;
                }
                for index in 0..compact.instance_data_num {
                    if state_common {
                        total += 1;
                        common = total;
                        continue;
                    }
                    let handle = if index == 0 && compact.has_parameters() {
                        DataHandle::StateParameters(state)
                    } else {
                        DataHandle::ActiveInstance { state, index }
                    };
                    let template = tree.state_slot_template(state, index);
                    pending.push(self.claim_instance(id, handle, template));
                    total += 1;
                }
            }
            frame.num_instantiated_states = states.len();
        }

        trace!(common, total, "update instance data");
        self.storage.shrink_to(common);
        self.storage.append(pending);
        self.discard_temporaries();
    }

    fn claim_instance(
        &mut self,
        frame: FrameId,
        handle: DataHandle,
        template: Option<&PropertyBag>,
    ) -> InstanceData {
        match self.storage.find_temporary(frame, handle) {
            Some(index) => self.storage.temporaries.swap_remove(index).data,
            None => template.map(InstanceData::from_template).unwrap_or_default(),
        }
    }

    /// Drops all temporary instances, stopping the nodes that were started on them.
    pub(crate) fn discard_temporaries(&mut self) {
        let info = TransitionInfo {
            change_type: ChangeType::Changed,
            source_state: None,
            target: TransitionTarget::Stopped,
            priority: TransitionPriority::Normal,
            current_run_status: RunStatus::Stopped,
        };
        for index in (0..self.storage.temporaries.len()).rev() {
            let Some((tree, node_index)) = self.storage.temporaries[index].owner.take() else {
                continue;
            };
            let root_state = self.storage.temporaries[index].frame.root_state;
            let frames = [self.detached_frame(&tree, root_state)];
            let node = &tree.nodes[node_index.index()];
            trace!(node = %node.name, "stop discarded temporary node");
            match &node.kind {
                NodeKind::Task { task, .. } => {
                    self.with_node(&frames, 0, node, None, None, 0.0, |ctx| {
                        task.exit_state(ctx, &info)
                    });
                }
                NodeKind::Evaluator(evaluator) => {
                    self.with_node(&frames, 0, node, None, None, 0.0, |ctx| {
                        evaluator.tree_stop(ctx)
                    });
                }
                _ => {}
            }
        }
        self.storage.temporaries.clear();
    }

    /// Global frame that resolves every instance through temporaries.
    fn detached_frame(&self, tree: &Arc<StateTree>, root_state: StateHandle) -> ExecutionFrame {
        let mut frame = ExecutionFrame::new(Arc::clone(tree), root_state, true);
        frame.external_data_base = self
            .external_bases
            .iter()
            .find(|(id, _)| *id == tree.id())
            .map(|(_, base)| *base);
        frame
    }

    /// Enters the states of `transition.next_frames` that are new or on the target branch.
    ///
    /// Returns `Running` while every entered task runs, otherwise the first non-running status.
    pub(crate) fn enter_state(&mut self, transition: &mut TransitionResult) -> RunStatus {
        if transition.next_frames.is_empty() {
            return RunStatus::Failed;
        }
        let previous = self.storage.exec.active_frames.clone();
        self.update_instance_data(&previous, &mut transition.next_frames);

        let exec = &mut self.storage.exec;
        exec.state_change_count = exec.state_change_count.wrapping_add(1);
        exec.completed_frame = None;
        exec.completed_state = None;
        exec.bubbled_frame = None;
        exec.enter_failed_frame = None;
        exec.enter_failed_task = None;
        let outer_phase = std::mem::replace(&mut exec.phase, UpdatePhase::EnterStates);

        let target_state = transition.target.state();
        let source_tree = transition.source.map(|source| source.tree);
        let mut frames: Vec<ExecutionFrame> = Vec::with_capacity(transition.next_frames.len());
        let mut result = RunStatus::Running;
        let mut still_common = true;
        let mut on_target_branch = false;

        'frames: for (frame_index, next_frame) in transition.next_frames.iter().enumerate() {
            let tree = Arc::clone(&next_frame.tree);
            let previous_frame = previous
                .get(frame_index)
                .filter(|previous| previous.is_same_frame(next_frame));
            if previous_frame.is_none() {
                still_common = false;
            }

            let mut frame = next_frame.clone();
            frame.active_states.clear();
            frame.state_events = Default::default();
            frame.num_instantiated_states = 0;
            frames.push(frame);

            for (depth, handle) in next_frame.active_states.iter().enumerate() {
                let was_active = still_common
                    && previous_frame
                        .is_some_and(|previous| previous.active_states.get(depth) == Some(handle));
                if !was_active {
                    still_common = false;
                }
                let mut event = next_frame.state_event(depth).cloned();
                if was_active && event.is_none() {
                    event = previous_frame.and_then(|previous| previous.state_event(depth).cloned());
                }

                let frame = &mut frames[frame_index];
                frame.push_state(handle);
                frame.state_events[depth] = event.clone();
                frame.num_instantiated_states = depth + 1;

                if source_tree == Some(tree.id()) && target_state == Some(handle) {
                    on_target_branch = true;
                }

                let Some(state) = tree.state(handle) else {
                    continue;
                };
                if state.is_linked() {
                    if let Some(batch) = state.parameter_bindings {
                        self.copy_into(
                            &frames,
                            frame_index,
                            batch,
                            CopyMode::Unchecked,
                            DataHandle::StateParameters(handle),
                            event.as_ref(),
                        );
                    }
                }

                if was_active && !on_target_branch {
                    continue;
                }
                let change_type = if was_active {
                    ChangeType::Sustained
                } else {
                    ChangeType::Changed
                };
                debug!(tree = tree.name(), state = %state.name, ?change_type, "enter state");
                let info = transition.info(change_type);

                for node_index in state.tasks.nodes() {
                    let node = &tree.nodes[node_index.index()];
                    let Some((task, config)) = node.task() else {
                        continue;
                    };
                    self.copy_node_bindings(&frames, frame_index, node, CopyMode::Unchecked, event.as_ref());
                    if !node.enabled {
                        trace!(task = %node.name, "skip disabled task");
                        continue;
                    }
                    if change_type == ChangeType::Sustained && !config.should_state_change_on_reselect {
                        continue;
                    }

                    let status = self.with_node(
                        &frames,
                        frame_index,
                        node,
                        Some(handle),
                        event.as_ref(),
                        0.0,
                        |ctx| task.enter_state(ctx, &info),
                    );
                    if status == RunStatus::Running {
                        continue;
                    }

                    let exec = &mut self.storage.exec;
                    if exec.completed_state.is_none() {
                        exec.completed_frame = Some(frame_index);
                        exec.completed_state = Some(handle);
                    }
                    result = status;
                    if status == RunStatus::Failed {
                        exec.enter_failed_frame = Some(frame_index);
                        exec.enter_failed_task = Some(node_index);
                        self.record_error(StateTreeError::EnterStateFailed {
                            state: state.name.to_string(),
                            task: node.name.to_string(),
                        });
                        break 'frames;
                    }
                }
            }
        }

        self.storage.exec.active_frames = frames;
        self.storage.exec.phase = outer_phase;
        result
    }

    /// Whether the task at `node` got its `enter_state` call in the current activation.
    fn task_entered(&self, frame_index: usize, is_last_state: bool, node: NodeIndex) -> bool {
        let exec = &self.storage.exec;
        match (exec.enter_failed_frame, exec.enter_failed_task) {
            (Some(failed_frame), Some(failed_task)) => {
                !(frame_index == failed_frame && is_last_state && node > failed_task)
            }
            _ => true,
        }
    }

    /// Exits the active states that `transition` leaves or reselects, leaf to root.
    pub(crate) fn exit_state(&mut self, transition: &TransitionResult) {
        let frames = self.storage.exec.active_frames.clone();
        if frames.is_empty() {
            return;
        }
        let outer_phase = std::mem::replace(&mut self.storage.exec.phase, UpdatePhase::ExitStates);

        let target_state = transition.target.state();
        let mut on_target_branch = false;
        let mut stop_globals = vec![false; frames.len()];
        let mut calls: Vec<Vec<(ChangeType, bool)>> = Vec::with_capacity(frames.len());

        for (frame_index, frame) in frames.iter().enumerate() {
            let tree = Arc::clone(&frame.tree);
            let next_frame = transition
                .next_frames
                .get(frame_index)
                .filter(|next| next.is_same_frame(frame));

            stop_globals[frame_index] = next_frame.is_none() && frame.is_global_frame;
            if stop_globals[frame_index] {
                for node_index in tree.evaluators.nodes() {
                    let node = &tree.nodes[node_index.index()];
                    self.copy_node_bindings(&frames, frame_index, node, CopyMode::Unchecked, None);
                }
                for node_index in tree.global_tasks.nodes() {
                    let node = &tree.nodes[node_index.index()];
                    if node.task().is_some_and(|(_, config)| config.copy_bound_properties_on_exit) {
                        self.copy_node_bindings(&frames, frame_index, node, CopyMode::Unchecked, None);
                    }
                }
            }

            let mut frame_calls = Vec::with_capacity(frame.active_states.len());
            for (depth, handle) in frame.active_states.iter().enumerate() {
                let Some(state) = tree.state(handle) else {
                    frame_calls.push((ChangeType::Changed, false));
                    continue;
                };
                let event = frame.state_event(depth);
                if state.is_linked() {
                    if let Some(batch) = state.parameter_bindings {
                        self.copy_into(
                            &frames,
                            frame_index,
                            batch,
                            CopyMode::Unchecked,
                            DataHandle::StateParameters(handle),
                            event,
                        );
                    }
                }

                let remains_active = next_frame
                    .is_some_and(|next| next.active_states.get(depth) == Some(handle));
                let is_target = transition.source == Some(frame.id()) && target_state == Some(handle);
                on_target_branch |= is_target;
                let change_type = if remains_active {
                    ChangeType::Sustained
                } else {
                    ChangeType::Changed
                };
                frame_calls.push((change_type, !remains_active || on_target_branch));

                for node_index in state.tasks.nodes() {
                    let node = &tree.nodes[node_index.index()];
                    if node.task().is_some_and(|(_, config)| config.copy_bound_properties_on_exit) {
                        self.copy_node_bindings(&frames, frame_index, node, CopyMode::Unchecked, event);
                    }
                }
            }
            calls.push(frame_calls);
        }

        for frame_index in (0..frames.len()).rev() {
            let frame = &frames[frame_index];
            let tree = Arc::clone(&frame.tree);
            let state_count = frame.active_states.len();

            for depth in (0..state_count).rev() {
                let Some(handle) = frame.active_states.get(depth) else {
                    continue;
                };
                let (change_type, should_call) = calls[frame_index][depth];
                if !should_call {
                    continue;
                }
                let Some(state) = tree.state(handle) else {
                    continue;
                };
                debug!(tree = tree.name(), state = %state.name, ?change_type, "exit state");

                let transitions = state.transitions;
                self.storage.exec.delayed_transitions.retain(|delayed| {
                    !(delayed.tree == tree.id() && transitions.contains(delayed.transition))
                });

                let info = transition.info(change_type);
                let event = frame.state_event(depth);
                for node_index in state.tasks.nodes().rev() {
                    if !self.task_entered(frame_index, depth + 1 == state_count, node_index) {
                        continue;
                    }
                    let node = &tree.nodes[node_index.index()];
                    let Some((task, config)) = node.task() else {
                        continue;
                    };
                    if !node.enabled {
                        continue;
                    }
                    if change_type == ChangeType::Sustained && !config.should_state_change_on_reselect {
                        continue;
                    }
                    self.with_node(&frames, frame_index, node, Some(handle), event, 0.0, |ctx| {
                        task.exit_state(ctx, &info)
                    });
                }
            }

            if stop_globals[frame_index] {
                let info = transition.info(ChangeType::Changed);
                self.call_stop_on_evaluators_and_global_tasks(&frames, frame_index, &info, None);
            }
        }

        self.storage.exec.phase = outer_phase;
    }

    /// Notifies entered tasks, leaf to root, that the active states completed.
    pub(crate) fn state_completed(&mut self) {
        let frames = self.storage.exec.active_frames.clone();
        let status = self.storage.exec.last_tick_status;
        let outer_phase = std::mem::replace(&mut self.storage.exec.phase, UpdatePhase::StateCompleted);

        for frame_index in (0..frames.len()).rev() {
            let frame = &frames[frame_index];
            let tree = Arc::clone(&frame.tree);
            let state_count = frame.active_states.len();
            for depth in (0..state_count).rev() {
                let Some(handle) = frame.active_states.get(depth) else {
                    continue;
                };
                let Some(state) = tree.state(handle) else {
                    continue;
                };
                let event = frame.state_event(depth);
                for node_index in state.tasks.nodes().rev() {
                    if !self.task_entered(frame_index, depth + 1 == state_count, node_index) {
                        continue;
                    }
                    let node = &tree.nodes[node_index.index()];
                    let Some((task, _)) = node.task() else {
                        continue;
                    };
                    if !node.enabled {
                        continue;
                    }
                    self.with_node(&frames, frame_index, node, Some(handle), event, 0.0, |ctx| {
                        task.state_completed(ctx, status, &frame.active_states)
                    });
                }
            }
        }

        self.storage.exec.phase = outer_phase;
    }

    /// Ticks the tasks of all active states, root to leaf.
    pub(crate) fn tick_tasks(&mut self, delta_time: f32) -> RunStatus {
        let frames = self.storage.exec.active_frames.clone();
        if frames.is_empty() {
            return RunStatus::Failed;
        }
        self.storage.exec.completed_frame = None;
        self.storage.exec.completed_state = None;
        self.storage.exec.bubbled_frame = None;

        let has_events = !self.storage.events.is_empty();
        let mut result = RunStatus::Running;
        let mut should_tick = true;
        let mut task_count = 0usize;

        for (frame_index, frame) in frames.iter().enumerate() {
            let tree = Arc::clone(&frame.tree);
            for (depth, handle) in frame.active_states.iter().enumerate() {
                let Some(state) = tree.state(handle) else {
                    continue;
                };
                let event = frame.state_event(depth);
                if state.is_linked() {
                    if let Some(batch) = state.parameter_bindings {
                        self.copy_into(
                            &frames,
                            frame_index,
                            batch,
                            CopyMode::Unchecked,
                            DataHandle::StateParameters(handle),
                            event,
                        );
                    }
                }

                for node_index in state.tasks.nodes() {
                    let node = &tree.nodes[node_index.index()];
                    let Some((task, config)) = node.task() else {
                        continue;
                    };
                    task_count += 1;
                    if !node.enabled {
                        continue;
                    }
                    let wants_tick =
                        config.should_call_tick || (has_events && config.tick_only_on_events);
                    if wants_tick && config.copy_bound_properties_on_tick {
                        self.copy_node_bindings(&frames, frame_index, node, CopyMode::Unchecked, event);
                    }
                    if !should_tick || !wants_tick {
                        continue;
                    }

                    let status = self.with_node(
                        &frames,
                        frame_index,
                        node,
                        Some(handle),
                        event,
                        delta_time,
                        |ctx| task.tick(ctx, delta_time),
                    );
                    if status == RunStatus::Running {
                        continue;
                    }

                    let exec = &mut self.storage.exec;
                    if exec.completed_state.is_none() {
                        exec.completed_frame = Some(frame_index);
                        exec.completed_state = Some(handle);
                    }
                    result = status;
                    if status == RunStatus::Failed {
                        should_tick = false;
                        self.record_error(StateTreeError::TaskRuntimeFailed {
                            state: state.name.to_string(),
                            task: node.name.to_string(),
                        });
                    }
                }
            }
        }

        if task_count == 0 {
            let exec = &mut self.storage.exec;
            exec.completed_frame = Some(0);
            exec.completed_state = frames[0].active_states.last();
            return RunStatus::Succeeded;
        }
        result
    }

    /// Starts the evaluators and global tasks of every global frame.
    ///
    /// On a non-running global task returns its status and the last task that was entered.
    pub(crate) fn start_evaluators_and_global_tasks(&mut self) -> (RunStatus, Option<NodeIndex>) {
        let frames = self.storage.exec.active_frames.clone();
        let info = TransitionInfo {
            change_type: ChangeType::Changed,
            source_state: None,
            target: TransitionTarget::State(StateHandle::ROOT),
            priority: TransitionPriority::Normal,
            current_run_status: RunStatus::Running,
        };

        for (frame_index, frame) in frames.iter().enumerate() {
            if !frame.is_global_frame {
                continue;
            }
            let tree = Arc::clone(&frame.tree);
            for node_index in tree.evaluators.nodes() {
                let node = &tree.nodes[node_index.index()];
                let Some(evaluator) = node.evaluator() else {
                    continue;
                };
                self.copy_node_bindings(&frames, frame_index, node, CopyMode::Unchecked, None);
                if !node.enabled {
                    continue;
                }
                self.with_node(&frames, frame_index, node, None, None, 0.0, |ctx| {
                    evaluator.tree_start(ctx)
                });
            }
            for node_index in tree.global_tasks.nodes() {
                let node = &tree.nodes[node_index.index()];
                let Some((task, _)) = node.task() else {
                    continue;
                };
                self.copy_node_bindings(&frames, frame_index, node, CopyMode::Unchecked, None);
                if !node.enabled {
                    continue;
                }
                let status = self.with_node(&frames, frame_index, node, None, None, 0.0, |ctx| {
                    task.enter_state(ctx, &info)
                });
                if status != RunStatus::Running {
                    debug!(task = %node.name, ?status, "global task did not start running");
                    return (status, Some(node_index));
                }
            }
        }
        (RunStatus::Running, None)
    }

    /// Ticks evaluators, and global tasks when `tick_global_tasks` is set.
    pub(crate) fn tick_evaluators_and_global_tasks(
        &mut self,
        delta_time: f32,
        tick_global_tasks: bool,
    ) -> RunStatus {
        let frames = self.storage.exec.active_frames.clone();
        let has_events = !self.storage.events.is_empty();
        let mut result = RunStatus::Running;

        for (frame_index, frame) in frames.iter().enumerate() {
            if !frame.is_global_frame {
                continue;
            }
            let tree = Arc::clone(&frame.tree);
            for node_index in tree.evaluators.nodes() {
                let node = &tree.nodes[node_index.index()];
                let Some(evaluator) = node.evaluator() else {
                    continue;
                };
                self.copy_node_bindings(&frames, frame_index, node, CopyMode::Unchecked, None);
                if !node.enabled {
                    continue;
                }
                self.with_node(&frames, frame_index, node, None, None, delta_time, |ctx| {
                    evaluator.tick(ctx, delta_time)
                });
            }

            if !tick_global_tasks {
                continue;
            }
            for node_index in tree.global_tasks.nodes() {
                let node = &tree.nodes[node_index.index()];
                let Some((task, config)) = node.task() else {
                    continue;
                };
                if !node.enabled {
                    continue;
                }
                let wants_tick = config.should_call_tick || (has_events && config.tick_only_on_events);
                if wants_tick && config.copy_bound_properties_on_tick {
                    self.copy_node_bindings(&frames, frame_index, node, CopyMode::Unchecked, None);
                }
                if !wants_tick {
                    continue;
                }
                let status = self.with_node(&frames, frame_index, node, None, None, delta_time, |ctx| {
                    task.tick(ctx, delta_time)
                });
                if status != RunStatus::Running {
                    result = status;
                    if status == RunStatus::Failed {
                        return result;
                    }
                }
            }
        }
        result
    }

    /// Stops evaluators and global tasks of every active global frame, leaf frame first.
    ///
    /// `last_initialized` limits which global tasks of the root frame get `exit_state`.
    pub(crate) fn stop_evaluators_and_global_tasks(
        &mut self,
        completion: RunStatus,
        last_initialized: Option<NodeIndex>,
    ) {
        let frames = self.storage.exec.active_frames.clone();
        for (frame_index, frame) in frames.iter().enumerate() {
            if !frame.is_global_frame {
                continue;
            }
            let tree = Arc::clone(&frame.tree);
            for node_index in tree.evaluators.nodes() {
                let node = &tree.nodes[node_index.index()];
                self.copy_node_bindings(&frames, frame_index, node, CopyMode::Unchecked, None);
            }
            for node_index in tree.global_tasks.nodes() {
                let node = &tree.nodes[node_index.index()];
                if node.task().is_some_and(|(_, config)| config.copy_bound_properties_on_exit) {
                    self.copy_node_bindings(&frames, frame_index, node, CopyMode::Unchecked, None);
                }
            }
        }

        let info = TransitionInfo {
            change_type: ChangeType::Changed,
            source_state: None,
            target: TransitionTarget::from_completion(completion),
            priority: TransitionPriority::Normal,
            current_run_status: completion,
        };
        for frame_index in (0..frames.len()).rev() {
            if !frames[frame_index].is_global_frame {
                continue;
            }
            let last = if frame_index == 0 { last_initialized } else { None };
            self.call_stop_on_evaluators_and_global_tasks(&frames, frame_index, &info, last);
        }
    }

    /// Exits global tasks (up to `last_initialized` when given) and stops evaluators, in reverse.
    pub(crate) fn call_stop_on_evaluators_and_global_tasks(
        &mut self,
        frames: &[ExecutionFrame],
        frame_index: usize,
        info: &TransitionInfo,
        last_initialized: Option<NodeIndex>,
    ) {
        let tree = Arc::clone(&frames[frame_index].tree);
        debug!(tree = tree.name(), "stop evaluators and global tasks");
        for node_index in tree.global_tasks.nodes().rev() {
            if last_initialized.is_some_and(|last| node_index > last) {
                continue;
            }
            let node = &tree.nodes[node_index.index()];
            let Some((task, _)) = node.task() else {
                continue;
            };
            if !node.enabled {
                continue;
            }
            self.with_node(frames, frame_index, node, None, None, 0.0, |ctx| {
                task.exit_state(ctx, info)
            });
        }
        for node_index in tree.evaluators.nodes().rev() {
            let node = &tree.nodes[node_index.index()];
            let Some(evaluator) = node.evaluator() else {
                continue;
            };
            if !node.enabled {
                continue;
            }
            self.with_node(frames, frame_index, node, None, None, 0.0, |ctx| {
                evaluator.tree_stop(ctx)
            });
        }
    }

    /// Starts the globals of a frame that is only being selected, on temporary instances.
    ///
    /// Nodes whose instance already exists (the frame is active) are not started again.
    pub(crate) fn start_temporary_evaluators_and_global_tasks(
        &mut self,
        frames: &[ExecutionFrame],
        frame_index: usize,
    ) -> RunStatus {
        let frame = &frames[frame_index];
        let tree = Arc::clone(&frame.tree);
        let id = frame.id();
        let info = TransitionInfo {
            change_type: ChangeType::Changed,
            source_state: None,
            target: TransitionTarget::State(frame.root_state),
            priority: TransitionPriority::Normal,
            current_run_status: RunStatus::Running,
        };

        for node_index in tree.evaluators.nodes().chain(tree.global_tasks.nodes()) {
            let node = &tree.nodes[node_index.index()];
            let created = self.resolve(frames, frame_index, node.instance).is_none();
            if created {
                self.storage.add_temporary(
                    id,
                    node.instance,
                    Some((Arc::clone(&tree), node_index)),
                    &node.template,
                );
            }
            self.copy_node_bindings(frames, frame_index, node, CopyMode::Unchecked, None);
            if !created || !node.enabled {
                continue;
            }
            let status = match &node.kind {
                NodeKind::Evaluator(evaluator) => {
                    self.with_node(frames, frame_index, node, None, None, 0.0, |ctx| {
                        evaluator.tree_start(ctx)
                    });
                    RunStatus::Running
                }
                NodeKind::Task { task, .. } => {
                    self.with_node(frames, frame_index, node, None, None, 0.0, |ctx| {
                        task.enter_state(ctx, &info)
                    })
                }
                _ => RunStatus::Running,
            };
            if status != RunStatus::Running {
                debug!(task = %node.name, ?status, "temporary global task did not start running");
                return status;
            }
        }
        RunStatus::Running
    }

    /// Stops the nodes started by [`Self::start_temporary_evaluators_and_global_tasks`].
    pub(crate) fn stop_temporary_evaluators_and_global_tasks(
        &mut self,
        frames: &[ExecutionFrame],
        frame_index: usize,
    ) {
        let id = frames[frame_index].id();
        let info = TransitionInfo {
            change_type: ChangeType::Changed,
            source_state: None,
            target: TransitionTarget::Stopped,
            priority: TransitionPriority::Normal,
            current_run_status: RunStatus::Stopped,
        };
        for index in (0..self.storage.temporaries.len()).rev() {
            if self.storage.temporaries[index].frame != id {
                continue;
            }
            let Some((tree, node_index)) = self.storage.temporaries[index].owner.take() else {
                continue;
            };
            let node = &tree.nodes[node_index.index()];
            match &node.kind {
                NodeKind::Task { task, .. } => {
                    self.with_node(frames, frame_index, node, None, None, 0.0, |ctx| {
                        task.exit_state(ctx, &info)
                    });
                }
                NodeKind::Evaluator(evaluator) => {
                    self.with_node(frames, frame_index, node, None, None, 0.0, |ctx| {
                        evaluator.tree_stop(ctx)
                    });
                }
                _ => {}
            }
        }
    }

    /// Folds the condition expression in `range`; an empty expression passes.
    pub(crate) fn test_all_conditions(
        &mut self,
        frames: &[ExecutionFrame],
        frame_index: usize,
        range: IndexRange,
        event: Option<&SharedEvent>,
    ) -> bool {
        if range.is_empty() {
            return true;
        }
        let tree = Arc::clone(&frames[frame_index].tree);
        self.storage.ensure_shared(&tree);

        let mut folder = ExpressionFolder::new(false);
        for node_index in range.nodes() {
            let node = &tree.nodes[node_index.index()];
            let NodeKind::Condition {
                condition,
                term,
                mode,
            } = &node.kind
            else {
                continue;
            };
            let value = if !node.enabled {
                true
            } else {
                match mode {
                    ConditionEvaluationMode::ForcedTrue => true,
                    ConditionEvaluationMode::ForcedFalse => false,
                    ConditionEvaluationMode::Evaluated => {
                        if !self.copy_node_bindings(frames, frame_index, node, CopyMode::Validated, event) {
                            trace!(condition = %node.name, "condition inputs unavailable");
                            return false;
                        }
                        self.with_node(frames, frame_index, node, None, event, 0.0, |ctx| {
                            condition.test_condition(ctx)
                        })
                    }
                }
            };
            folder.push(*term, value);
        }
        folder.value()
    }

    /// Folds the consideration expression in `range`, scaled by `weight`.
    pub(crate) fn evaluate_utility(
        &mut self,
        frames: &[ExecutionFrame],
        frame_index: usize,
        range: IndexRange,
        weight: f32,
        event: Option<&SharedEvent>,
    ) -> f32 {
        if range.is_empty() {
            return 0.0;
        }
        let tree = Arc::clone(&frames[frame_index].tree);
        self.storage.ensure_shared(&tree);

        let mut folder = ExpressionFolder::new(0.0f32);
        for node_index in range.nodes() {
            let node = &tree.nodes[node_index.index()];
            let NodeKind::Consideration {
                consideration,
                term,
            } = &node.kind
            else {
                continue;
            };
            if !self.copy_node_bindings(frames, frame_index, node, CopyMode::Validated, event) {
                return 0.0;
            }
            let score = self.with_node(frames, frame_index, node, None, event, 0.0, |ctx| {
                consideration.score(ctx)
            });
            folder.push(*term, score.clamp(0.0, 1.0));
        }
        weight * folder.value()
    }
}
