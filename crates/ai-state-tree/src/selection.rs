//! State selection: resolves a target state into the frames and states that would become active.
//!
//! Selection never touches live instance data. Parameter blocks and global nodes of states and
//! frames that are not active yet live in temporaries until the selection is entered or dropped.

use std::sync::Arc;

use ai_core::{DeterministicRng, RunStatus};
use tracing::{debug, trace, warn};

use crate::bindings::CopyMode;
use crate::context::ExecutionContext;
use crate::error::StateTreeError;
use crate::event::SharedEvent;
use crate::frame::{ExecutionFrame, ParamSource, SelectionResult};
use crate::tree::{StateKind, StateTree};
use crate::types::{
    DataHandle, SelectionBehavior, SelectionFallback, StateHandle, TransitionTrigger,
    MAX_ACTIVE_STATES, MAX_EXECUTION_FRAMES,
};

/// Bookkeeping of one top-level selection.
struct SelectionPass {
    /// Active frames when the selection started.
    active: Vec<ExecutionFrame>,
    loop_state: Option<String>,
    recursion_state: Option<String>,
    follow_depth: usize,
}

impl SelectionPass {
    fn new(active: Vec<ExecutionFrame>) -> Self {
        Self {
            active,
            loop_state: None,
            recursion_state: None,
            follow_depth: 0,
        }
    }

    fn into_error(self, target: StateHandle, name: &str) -> StateTreeError {
        if let Some(state) = self.recursion_state {
            StateTreeError::RecursionExceeded { state }
        } else if let Some(state) = self.loop_state {
            StateTreeError::LoopDetected { state }
        } else {
            StateTreeError::selection(target, name)
        }
    }
}

/// Root-to-`target` path through the parent links of `tree`.
fn path_to(tree: &StateTree, target: StateHandle) -> Option<Vec<StateHandle>> {
    let mut path = Vec::new();
    let mut cursor = Some(target);
    while let Some(handle) = cursor {
        if path.len() >= MAX_ACTIVE_STATES {
            return None;
        }
        path.push(handle);
        cursor = tree.state(handle)?.parent;
    }
    path.reverse();
    Some(path)
}

impl ExecutionContext {
    /// Selects `target` relative to `current_frame`.
    ///
    /// States shared with the active path above the target are kept; the target and everything
    /// below it are selected afresh.
    pub(crate) fn select_state(
        &mut self,
        current_frame: &ExecutionFrame,
        target: StateHandle,
        event: Option<&SharedEvent>,
        fallback: SelectionFallback,
    ) -> Result<SelectionResult, StateTreeError> {
        let tree = Arc::clone(&current_frame.tree);
        let name = tree.state_name(target).to_owned();
        let active = self.storage.exec.active_frames.clone();
        if active.is_empty() || tree.state(target).is_none() {
            return Err(StateTreeError::selection(target, &name));
        }
        let path = path_to(&tree, target).ok_or_else(|| StateTreeError::RecursionExceeded {
            state: name.clone(),
        })?;

        let exact = active
            .iter()
            .rposition(|frame| frame.tree.id() == tree.id() && frame.root_state == path[0]);
        let (frame_index, rerooted) = match exact {
            Some(index) => (index, false),
            None => {
                let index = active
                    .iter()
                    .rposition(|frame| frame.id() == current_frame.id())
                    .or_else(|| active.iter().rposition(|frame| frame.tree.id() == tree.id()))
                    .ok_or_else(|| StateTreeError::selection(target, &name))?;
                (index, true)
            }
        };

        let mut result: Vec<ExecutionFrame> = active[..=frame_index].to_vec();
        let first_new = if rerooted {
            0
        } else {
            let current = &active[frame_index].active_states;
            let limit = path.len().min(current.len()).saturating_sub(1);
            (0..limit)
                .find(|&depth| current.get(depth) != Some(path[depth]))
                .unwrap_or(limit)
        };
        result[frame_index].truncate_states(first_new);
        trace!(tree = tree.name(), target = %name, first_new, "select state");

        let mut pass = SelectionPass::new(active);
        if self.select_path(
            &mut result,
            frame_index,
            Some(frame_index),
            &path[first_new..],
            event,
            fallback,
            &mut pass,
        ) {
            Ok(SelectionResult { frames: result })
        } else {
            Err(pass.into_error(target, &name))
        }
    }

    /// Selects `path`, then its later siblings when the fallback allows it.
    #[allow(clippy::too_many_arguments)]
    fn select_path(
        &mut self,
        result: &mut Vec<ExecutionFrame>,
        frame_index: usize,
        current_in_active: Option<usize>,
        path: &[StateHandle],
        event: Option<&SharedEvent>,
        fallback: SelectionFallback,
        pass: &mut SelectionPass,
    ) -> bool {
        if self.select_state_internal(result, frame_index, current_in_active, path, event, pass) {
            return true;
        }
        if fallback != SelectionFallback::NextSelectableSibling {
            return false;
        }
        let Some((&target, prefix)) = path.split_last() else {
            return false;
        };
        let tree = Arc::clone(&result[frame_index].tree);
        let Some(parent) = tree.state(target).and_then(|state| state.parent) else {
            return false;
        };
        let siblings = tree.children(parent);
        let Some(position) = siblings.iter().position(|sibling| *sibling == target) else {
            return false;
        };
        for &sibling in &siblings[position + 1..] {
            let mut sibling_path = prefix.to_vec();
            sibling_path.push(sibling);
            if self.select_state_internal(result, frame_index, current_in_active, &sibling_path, event, pass) {
                debug!(state = tree.state_name(sibling), "selected next sibling");
                return true;
            }
        }
        false
    }

    /// Pushes `path[0]` onto `result[frame_index]` and keeps selecting below it.
    ///
    /// On failure `result` is left as it was on entry.
    fn select_state_internal(
        &mut self,
        result: &mut Vec<ExecutionFrame>,
        frame_index: usize,
        current_in_active: Option<usize>,
        path: &[StateHandle],
        event: Option<&SharedEvent>,
        pass: &mut SelectionPass,
    ) -> bool {
        let Some(&handle) = path.first() else {
            return false;
        };
        let tree = Arc::clone(&result[frame_index].tree);
        let Some(state) = tree.state(handle) else {
            return false;
        };
        if !state.enabled || state.selection_behavior == SelectionBehavior::None {
            trace!(state = %state.name, "state not selectable");
            return false;
        }

        let is_destination = path.len() < 2;
        let check_prerequisites =
            is_destination || state.check_prerequisites_when_activating_child_directly;

        let candidates: Vec<Option<SharedEvent>> = match &state.required_event {
            Some(desc) if desc.is_valid() => {
                let mut candidates: Vec<Option<SharedEvent>> = match event {
                    Some(event) if is_destination => {
                        if desc.matches(event) {
                            vec![Some(Arc::clone(event))]
                        } else {
                            Vec::new()
                        }
                    }
                    _ => self.storage.events.matching(desc).cloned().map(Some).collect(),
                };
                if candidates.is_empty() && !check_prerequisites {
                    candidates.push(None);
                }
                if candidates.is_empty() {
                    trace!(state = %state.name, "required event not present");
                    return false;
                }
                candidates
            }
            _ => vec![None],
        };

        let depth = result[frame_index].active_states.len();
        let saved_instantiated = result[frame_index].num_instantiated_states;
        if !result[frame_index].push_state(handle) {
            warn!(state = %state.name, "reached the maximum number of active states");
            pass.recursion_state = Some(state.name.to_string());
            return false;
        }
        let was_active = current_in_active
            .and_then(|index| pass.active.get(index))
            .is_some_and(|active| active.active_states.get(depth) == Some(handle));
        if was_active && saved_instantiated == depth {
            result[frame_index].num_instantiated_states = depth + 1;
        }

        if let Some(template) = &state.parameters {
            let params = DataHandle::StateParameters(handle);
            if self.resolve(result.as_slice(), frame_index, params).is_none() {
                let id = result[frame_index].id();
                self.storage.add_temporary(id, params, None, template);
            }
            if let Some(batch) = state.parameter_bindings {
                if !self.copy_into(result.as_slice(), frame_index, batch, CopyMode::Validated, params, event) {
                    trace!(state = %state.name, "state parameters not fully bound yet");
                }
            }
        }

        let mut selected = false;
        for candidate in candidates {
            result[frame_index].state_events[depth] = candidate.clone();
            let candidate_event = candidate.as_ref().or(event);

            if check_prerequisites
                && !self.test_all_conditions(
                    result.as_slice(),
                    frame_index,
                    state.enter_conditions,
                    candidate_event,
                )
            {
                trace!(state = %state.name, "enter conditions failed");
                continue;
            }

            if !is_destination {
                if self.select_state_internal(result, frame_index, current_in_active, &path[1..], event, pass) {
                    selected = true;
                    break;
                }
                continue;
            }

            let ok = match &state.kind {
                StateKind::Linked { target } => {
                    self.select_linked(result, frame_index, handle, *target, pass)
                }
                StateKind::LinkedAsset { tree: linked } => {
                    let linked = self
                        .linked_override(state.tag.as_ref())
                        .unwrap_or_else(|| Arc::clone(linked));
                    self.select_linked_asset(result, frame_index, handle, linked, pass)
                }
                StateKind::State | StateKind::Group | StateKind::Subtree => self
                    .select_by_behavior(
                        result,
                        frame_index,
                        current_in_active,
                        handle,
                        candidate.as_ref(),
                        pass,
                    ),
            };
            if ok {
                selected = true;
                break;
            }
        }

        if !selected {
            let frame = &mut result[frame_index];
            frame.truncate_states(depth);
            frame.num_instantiated_states = saved_instantiated.min(depth);
        }
        selected
    }

    fn select_by_behavior(
        &mut self,
        result: &mut Vec<ExecutionFrame>,
        frame_index: usize,
        current_in_active: Option<usize>,
        handle: StateHandle,
        state_event: Option<&SharedEvent>,
        pass: &mut SelectionPass,
    ) -> bool {
        let tree = Arc::clone(&result[frame_index].tree);
        let Some(state) = tree.state(handle) else {
            return false;
        };
        let children = tree.children(handle);

        match state.selection_behavior {
            SelectionBehavior::None => false,
            SelectionBehavior::TryEnterState => true,
            SelectionBehavior::TryFollowTransitions => {
                self.select_by_following(result, frame_index, current_in_active, handle, state_event, pass)
            }
            _ if children.is_empty() => true,
            SelectionBehavior::TrySelectChildrenInOrder => {
                for &child in children {
                    if self.select_state_internal(result, frame_index, current_in_active, &[child], None, pass) {
                        return true;
                    }
                }
                false
            }
            SelectionBehavior::TrySelectChildrenAtRandom => {
                let mut pool = children.to_vec();
                while !pool.is_empty() {
                    let pick = self.storage.exec.rng.next_index(pool.len());
                    if self.select_state_internal(result, frame_index, current_in_active, &[pool[pick]], None, pass) {
                        return true;
                    }
                    pool.swap_remove(pick);
                }
                false
            }
            SelectionBehavior::TrySelectChildrenWithHighestUtility => {
                let (mut pool, mut scores) = self.score_children(result, frame_index, children);
                while !pool.is_empty() {
                    let mut best = 0;
                    for index in 1..scores.len() {
                        if scores[index] > scores[best] {
                            best = index;
                        }
                    }
                    if self.select_state_internal(result, frame_index, current_in_active, &[pool[best]], None, pass) {
                        return true;
                    }
                    pool.swap_remove(best);
                    scores.swap_remove(best);
                }
                false
            }
            SelectionBehavior::TrySelectChildrenAtRandomWeightedByUtility => {
                let (mut pool, mut scores) = self.score_children(result, frame_index, children);
                let mut total: f32 = scores.iter().filter(|score| **score > 0.0).sum();
                while total > 0.0 && !pool.is_empty() {
                    let roll = self.storage.exec.rng.next_f32_unit() * total;
                    let mut accumulated = 0.0;
                    let mut pick = None;
                    for (index, score) in scores.iter().enumerate() {
                        if *score <= 0.0 {
                            continue;
                        }
                        accumulated += score;
                        pick = Some(index);
                        if roll < accumulated {
                            break;
                        }
                    }
                    let Some(pick) = pick else {
                        break;
                    };
                    if self.select_state_internal(result, frame_index, current_in_active, &[pool[pick]], None, pass) {
                        return true;
                    }
                    total -= scores[pick];
                    pool.swap_remove(pick);
                    scores.swap_remove(pick);
                }
                false
            }
        }
    }

    fn score_children(
        &mut self,
        result: &[ExecutionFrame],
        frame_index: usize,
        children: &[StateHandle],
    ) -> (Vec<StateHandle>, Vec<f32>) {
        let tree = Arc::clone(&result[frame_index].tree);
        let mut pool = Vec::with_capacity(children.len());
        let mut scores = Vec::with_capacity(children.len());
        for &child in children {
            let Some(state) = tree.state(child) else {
                continue;
            };
            let score = self.evaluate_utility(result, frame_index, state.considerations, state.weight, None);
            trace!(state = %state.name, score, "utility");
            pool.push(child);
            scores.push(score);
        }
        (pool, scores)
    }

    /// Follows the first passing transition of `handle`, highest priority first.
    fn select_by_following(
        &mut self,
        result: &mut Vec<ExecutionFrame>,
        frame_index: usize,
        current_in_active: Option<usize>,
        handle: StateHandle,
        state_event: Option<&SharedEvent>,
        pass: &mut SelectionPass,
    ) -> bool {
        let tree = Arc::clone(&result[frame_index].tree);
        let Some(state) = tree.state(handle) else {
            return false;
        };
        pass.follow_depth += 1;
        if pass.follow_depth > self.config.max_follow_depth {
            warn!(state = %state.name, "follow transitions nest too deep");
            pass.loop_state = Some(state.name.to_string());
            pass.follow_depth -= 1;
            return false;
        }

        let mut order: Vec<usize> = state.transitions.indices().collect();
        order.sort_by(|a, b| tree.transitions[*b].priority.cmp(&tree.transitions[*a].priority));

        let mut selected = false;
        'transitions: for transition_index in order {
            let transition = &tree.transitions[transition_index];
            if !transition.enabled || transition.trigger.is_completion() || transition.delay.is_some() {
                continue;
            }
            let Some(target) = transition.target.state() else {
                continue;
            };
            if result[frame_index].active_states.contains(target) {
                warn!(state = %state.name, target = tree.state_name(target), "follow transition loops back");
                pass.loop_state = Some(tree.state_name(target).to_owned());
                continue;
            }
            let Some(path) = path_to(&tree, target) else {
                continue;
            };
            if path[0] != result[frame_index].root_state {
                trace!(target = tree.state_name(target), "follow target outside of the frame");
                continue;
            }

            let candidates: Vec<Option<SharedEvent>> = match transition.trigger {
                TransitionTrigger::OnEvent => {
                    let Some(desc) = &transition.required_event else {
                        continue;
                    };
                    match state_event.filter(|event| desc.matches(event)) {
                        Some(event) => vec![Some(Arc::clone(event))],
                        None => self.storage.events.matching(desc).cloned().map(Some).collect(),
                    }
                }
                _ => vec![None],
            };

            for candidate in candidates {
                if !self.test_all_conditions(
                    result.as_slice(),
                    frame_index,
                    transition.conditions,
                    candidate.as_ref(),
                ) {
                    continue;
                }
                let states = result[frame_index].active_states;
                let common = (0..states.len().min(path.len()))
                    .find(|&depth| states.get(depth) != Some(path[depth]))
                    .unwrap_or(states.len().min(path.len()));

                let saved = result[frame_index].clone();
                let saved_len = result.len();
                result[frame_index].truncate_states(common);
                if self.select_path(
                    result,
                    frame_index,
                    current_in_active,
                    &path[common..],
                    candidate.as_ref(),
                    transition.fallback,
                    pass,
                ) {
                    debug!(state = %state.name, target = tree.state_name(target), "followed transition");
                    selected = true;
                    break 'transitions;
                }
                result.truncate(saved_len);
                result[frame_index] = saved;
            }
        }

        pass.follow_depth -= 1;
        selected
    }

    /// Selects the subtree rooted at `target` in a new frame of the same tree.
    fn select_linked(
        &mut self,
        result: &mut Vec<ExecutionFrame>,
        frame_index: usize,
        linking: StateHandle,
        target: StateHandle,
        pass: &mut SelectionPass,
    ) -> bool {
        let parent = &result[frame_index];
        let tree = Arc::clone(&parent.tree);
        if result.len() >= MAX_EXECUTION_FRAMES {
            warn!(state = tree.state_name(linking), "reached the maximum number of frames");
            pass.recursion_state = Some(tree.state_name(linking).to_owned());
            return false;
        }

        let mut frame = ExecutionFrame::new(Arc::clone(&tree), target, false);
        if result.iter().any(|existing| existing.is_same_frame(&frame)) {
            warn!(state = tree.state_name(linking), "linked subtree is already selected");
            pass.recursion_state = Some(tree.state_name(linking).to_owned());
            return false;
        }
        frame.external_data_base = parent.external_data_base;
        frame.global_instance_base = parent.global_instance_base;
        frame.global_parameters = ParamSource::Inherit;
        frame.state_parameters = Some(ParamSource::ParentState(linking));

        let new_index = result.len();
        let existing = pass
            .active
            .get(new_index)
            .filter(|active| active.is_same_frame(&frame))
            .map(|active| (active.global_instance_base, active.active_instance_base));
        if let Some((global_base, active_base)) = existing {
            frame.global_instance_base = global_base;
            frame.active_instance_base = active_base;
        }

        result.push(frame);
        let current_in_active = existing.map(|_| new_index);
        if self.select_state_internal(result, new_index, current_in_active, &[target], None, pass) {
            return true;
        }
        result.truncate(new_index);
        false
    }

    /// Selects the root of `linked` in a new global frame.
    ///
    /// Evaluators and global tasks of a frame that is not active yet are started on temporaries
    /// so selection can read them.
    fn select_linked_asset(
        &mut self,
        result: &mut Vec<ExecutionFrame>,
        frame_index: usize,
        linking: StateHandle,
        linked: Arc<StateTree>,
        pass: &mut SelectionPass,
    ) -> bool {
        let linking_name = result[frame_index].tree.state_name(linking).to_owned();
        if result.len() >= MAX_EXECUTION_FRAMES {
            warn!(state = %linking_name, "reached the maximum number of frames");
            pass.recursion_state = Some(linking_name);
            return false;
        }

        let mut frame = ExecutionFrame::new(Arc::clone(&linked), StateHandle::ROOT, true);
        if result.iter().any(|existing| existing.is_same_frame(&frame)) {
            warn!(state = %linking_name, tree = linked.name(), "linked tree is already selected");
            pass.recursion_state = Some(linking_name);
            return false;
        }
        frame.global_parameters = ParamSource::ParentState(linking);
        frame.state_parameters = None;

        let new_index = result.len();
        let existing = pass
            .active
            .get(new_index)
            .filter(|active| active.is_same_frame(&frame))
            .map(|active| {
                (
                    active.global_instance_base,
                    active.active_instance_base,
                    active.external_data_base,
                )
            });
        match existing {
            Some((global_base, active_base, external_base)) => {
                frame.global_instance_base = global_base;
                frame.active_instance_base = active_base;
                frame.external_data_base = external_base;
            }
            None => {
                let Some(base) = self.collect_external_data(&linked) else {
                    return false;
                };
                frame.external_data_base = Some(base);
            }
        }

        result.push(frame);
        let started = existing.is_none();
        if started {
            let status = self.start_temporary_evaluators_and_global_tasks(result.as_slice(), new_index);
            if status != RunStatus::Running {
                debug!(tree = linked.name(), ?status, "linked tree globals did not start");
                self.stop_temporary_evaluators_and_global_tasks(result.as_slice(), new_index);
                result.truncate(new_index);
                return false;
            }
        }

        let current_in_active = existing.map(|_| new_index);
        if self.select_state_internal(result, new_index, current_in_active, &[StateHandle::ROOT], None, pass) {
            return true;
        }
        if started {
            self.stop_temporary_evaluators_and_global_tasks(result.as_slice(), new_index);
        }
        result.truncate(new_index);
        false
    }
}
