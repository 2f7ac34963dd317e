//! The execution context: owns the instance data of one running tree and drives
//! Start/Tick/Stop.

use std::any::Any;
use std::sync::Arc;

use ai_core::{PropertyBag, RunStatus, Tag};
use tracing::{debug, error, trace, warn};

use crate::config::ExecutionConfig;
use crate::error::StateTreeError;
use crate::event::{Event, EventQueue};
use crate::frame::{ExecutionFrame, FrameId, ParamSource};
use crate::node::{ContextObject, TransitionRequest};
use crate::storage::InstanceStorage;
use crate::transitions::TransitionResult;
use crate::tree::{DataDesc, StateTree, TreeId};
use crate::types::{
    SelectionFallback, StateHandle, TransitionPriority, TransitionTarget, UpdatePhase,
};

/// Supplies the external data a tree declares, once per distinct tree among the active frames.
///
/// Returning `None` (or a missing required entry) fails the operation that asked for it.
pub trait ExternalDataProvider: Send {
    fn collect(
        &mut self,
        tree: &StateTree,
        descs: &[DataDesc],
    ) -> Option<Vec<Option<Arc<dyn ContextObject>>>>;
}

impl<F> ExternalDataProvider for F
where
    F: FnMut(&StateTree, &[DataDesc]) -> Option<Vec<Option<Arc<dyn ContextObject>>>> + Send,
{
    fn collect(
        &mut self,
        tree: &StateTree,
        descs: &[DataDesc],
    ) -> Option<Vec<Option<Arc<dyn ContextObject>>>> {
        self(tree, descs)
    }
}

pub struct ExecutionContext {
    pub(crate) tree: Arc<StateTree>,
    pub(crate) storage: InstanceStorage,
    pub(crate) config: ExecutionConfig,
    pub(crate) context_data: Vec<Option<Arc<dyn ContextObject>>>,
    pub(crate) external_provider: Option<Box<dyn ExternalDataProvider>>,
    pub(crate) external_views: Vec<Option<Arc<dyn ContextObject>>>,
    pub(crate) external_bases: Vec<(TreeId, usize)>,
    pub(crate) linked_overrides: Vec<(Tag, Arc<StateTree>)>,
    pub(crate) next_transition: TransitionResult,
    pub(crate) last_error: Option<StateTreeError>,
}

impl ExecutionContext {
    pub fn new(tree: Arc<StateTree>) -> Self {
        Self::with_config(tree, ExecutionConfig::default())
    }

    pub fn with_config(tree: Arc<StateTree>, config: ExecutionConfig) -> Self {
        let mut storage = InstanceStorage::new(config.max_events);
        storage.parameters = tree.default_parameters().clone();
        let context_data = vec![None; tree.context_data().len()];
        Self {
            tree,
            storage,
            config,
            context_data,
            external_provider: None,
            external_views: Vec::new(),
            external_bases: Vec::new(),
            linked_overrides: Vec::new(),
            next_transition: TransitionResult::default(),
            last_error: None,
        }
    }

    pub fn with_external_data(mut self, provider: impl ExternalDataProvider + 'static) -> Self {
        self.external_provider = Some(Box::new(provider));
        self
    }

    pub fn tree(&self) -> &Arc<StateTree> {
        &self.tree
    }

    pub fn config(&self) -> &ExecutionConfig {
        &self.config
    }

    /// Sets the context object declared under `name`.
    pub fn set_context_data(
        &mut self,
        name: &str,
        object: Arc<dyn ContextObject>,
    ) -> Result<(), StateTreeError> {
        let index = self
            .tree
            .context_data()
            .iter()
            .position(|desc| desc.name == name)
            .ok_or_else(|| StateTreeError::config(format!("unknown context data `{name}`")))?;
        let desc = &self.tree.context_data()[index];
        if object.as_any().type_id() != desc.type_id {
            return Err(StateTreeError::config(format!(
                "context data `{name}` expects {}",
                desc.type_name
            )));
        }
        self.context_data[index] = Some(object);
        Ok(())
    }

    /// Runs `tree` instead of the linked asset of states tagged `tag`.
    pub fn set_linked_tree_override(&mut self, tag: Tag, tree: Arc<StateTree>) {
        self.linked_overrides.retain(|(existing, _)| *existing != tag);
        self.linked_overrides.push((tag, tree));
    }

    pub(crate) fn linked_override(&self, tag: Option<&Tag>) -> Option<Arc<StateTree>> {
        let tag = tag?;
        self.linked_overrides
            .iter()
            .find(|(existing, _)| existing == tag)
            .map(|(_, tree)| Arc::clone(tree))
    }

    /// Replaces the global parameters; they must match the tree's parameter schema.
    pub fn set_parameters(&mut self, parameters: &PropertyBag) -> Result<(), StateTreeError> {
        if !parameters.matches_schema(self.tree.default_parameters()) {
            return Err(StateTreeError::config(format!(
                "parameters do not match the schema of `{}`",
                self.tree.name()
            )));
        }
        self.storage.parameters = parameters.clone();
        Ok(())
    }

    pub fn parameters(&self) -> &PropertyBag {
        &self.storage.parameters
    }

    /// Tree validated and every required context object present with the declared type.
    pub fn is_valid(&self) -> bool {
        self.check_valid().is_ok()
    }

    fn check_valid(&self) -> Result<(), StateTreeError> {
        self.tree.validate()?;
        for (desc, object) in self.tree.context_data().iter().zip(&self.context_data) {
            match object {
                Some(object) if object.as_any().type_id() != desc.type_id => {
                    return Err(StateTreeError::config(format!(
                        "context data `{}` has the wrong type",
                        desc.name
                    )));
                }
                None if desc.required => {
                    return Err(StateTreeError::config(format!(
                        "missing context data `{}`",
                        desc.name
                    )));
                }
                _ => {}
            }
        }
        Ok(())
    }

    pub fn run_status(&self) -> RunStatus {
        self.storage.exec.tree_run_status
    }

    pub fn last_tick_status(&self) -> RunStatus {
        self.storage.exec.last_tick_status
    }

    pub fn state_change_count(&self) -> u32 {
        self.storage.exec.state_change_count
    }

    pub fn active_frames(&self) -> &[ExecutionFrame] {
        &self.storage.exec.active_frames
    }

    /// Names of all active states, root frame first.
    pub fn active_state_names(&self) -> Vec<String> {
        self.storage
            .exec
            .active_frames
            .iter()
            .flat_map(|frame| {
                frame
                    .active_states
                    .iter()
                    .map(|state| frame.tree.state_name(state).to_owned())
            })
            .collect()
    }

    pub fn last_error(&self) -> Option<&StateTreeError> {
        self.last_error.as_ref()
    }

    pub fn storage(&self) -> &InstanceStorage {
        &self.storage
    }

    pub fn events(&self) -> &EventQueue {
        &self.storage.events
    }

    pub fn send_event(&mut self, event: Event) -> bool {
        self.storage.events.send(event)
    }

    /// Runs `f` against `events` instead of the context's own queue, then hands it back.
    ///
    /// The context does not clear an adopted queue.
    pub fn with_event_queue<R>(
        &mut self,
        events: &mut EventQueue,
        f: impl FnOnce(&mut Self) -> R,
    ) -> R {
        std::mem::swap(&mut self.storage.events, events);
        let owned = std::mem::replace(&mut self.storage.owns_event_queue, false);
        let result = f(self);
        self.storage.owns_event_queue = owned;
        std::mem::swap(&mut self.storage.events, events);
        result
    }

    /// Number of pending delayed transitions.
    pub fn delayed_transition_count(&self) -> usize {
        self.storage.exec.delayed_transitions.len()
    }

    /// Queues a transition resolved at the next `tick`, relative to the root frame.
    pub fn request_transition(&mut self, target: StateHandle, priority: TransitionPriority) {
        self.request_transition_with(
            TransitionTarget::State(target),
            priority,
            SelectionFallback::None,
        );
    }

    pub fn request_transition_with(
        &mut self,
        target: TransitionTarget,
        priority: TransitionPriority,
        fallback: SelectionFallback,
    ) {
        let source = self
            .storage
            .exec
            .active_frames
            .first()
            .map(ExecutionFrame::id)
            .unwrap_or(FrameId {
                tree: self.tree.id(),
                root_state: StateHandle::ROOT,
            });
        self.storage.requests.push(TransitionRequest {
            source,
            target,
            priority,
            fallback,
        });
    }

    pub(crate) fn record_error(&mut self, err: StateTreeError) {
        debug!(tree = self.tree.name(), error = %err, "state tree error");
        self.last_error = Some(err);
    }

    /// Starts the tree from its root. `seed` drives random selection and delay jitter.
    pub fn start(&mut self, parameters: Option<&PropertyBag>, seed: Option<u64>) -> RunStatus {
        if let Err(err) = self.check_valid() {
            error!(tree = self.tree.name(), error = %err, "cannot start state tree");
            self.record_error(err);
            return RunStatus::Failed;
        }
        if self.storage.exec.phase != UpdatePhase::Unset {
            warn!(tree = self.tree.name(), "start called while updating, ignored");
            return RunStatus::Failed;
        }
        if self.storage.exec.tree_run_status == RunStatus::Running {
            self.stop(RunStatus::Stopped);
        }

        self.storage.reset();
        self.last_error = None;
        match parameters {
            Some(parameters) => {
                if let Err(err) = self.set_parameters(parameters) {
                    warn!(tree = self.tree.name(), error = %err, "using default parameters");
                    self.storage.parameters = self.tree.default_parameters().clone();
                }
            }
            None => self.storage.parameters = self.tree.default_parameters().clone(),
        }

        let mut root = ExecutionFrame::new(Arc::clone(&self.tree), StateHandle::ROOT, true);
        root.global_parameters = ParamSource::Context;
        let mut frames = vec![root];
        self.update_instance_data(&[], &mut frames);
        self.storage.exec.active_frames = frames;
        self.storage
            .exec
            .rng
            .reseed(seed.unwrap_or(self.config.default_seed));

        if !self.collect_active_external_data() {
            self.storage.reset();
            return RunStatus::Failed;
        }

        self.storage.exec.phase = UpdatePhase::StartTree;
        debug!(tree = self.tree.name(), "start state tree");

        let (global_status, last_initialized) = self.start_evaluators_and_global_tasks();
        if global_status == RunStatus::Running {
            self.tick_evaluators_and_global_tasks(0.0, false);

            self.storage.exec.tree_run_status = RunStatus::Running;
            self.storage.exec.last_tick_status = RunStatus::Unset;

            let root_frame = self.storage.exec.active_frames[0].clone();
            match self.select_state(&root_frame, StateHandle::ROOT, None, SelectionFallback::None) {
                Ok(selection) => {
                    let mut transition = TransitionResult {
                        next_frames: selection.frames,
                        source: Some(root_frame.id()),
                        source_state: None,
                        target: TransitionTarget::State(StateHandle::ROOT),
                        priority: TransitionPriority::Normal,
                        current_run_status: RunStatus::Unset,
                    };
                    let status = self.enter_state(&mut transition);
                    self.storage.exec.last_tick_status = status;
                    if status != RunStatus::Running {
                        self.state_completed();
                    }
                }
                Err(err) => {
                    error!(tree = self.tree.name(), error = %err, "failed to select initial state");
                    self.record_error(err);
                }
            }

            if self.storage.exec.last_tick_status == RunStatus::Unset {
                self.storage.exec.tree_run_status = RunStatus::Failed;
                self.stop_evaluators_and_global_tasks(RunStatus::Failed, None);
                self.storage.exec.active_frames.clear();
            }
        } else {
            self.stop_evaluators_and_global_tasks(global_status, last_initialized);
            self.storage.exec.active_frames.clear();
            self.storage.exec.tree_run_status = global_status;
        }

        self.finish_phase()
    }

    /// Stops the tree, exiting all active states. `Running`/`Unset` become `Stopped`.
    ///
    /// While an update is in progress the stop is deferred until it completes.
    pub fn stop(&mut self, completion: RunStatus) -> RunStatus {
        let completion = completion.as_completion();
        if self.storage.exec.phase != UpdatePhase::Unset {
            self.storage.exec.requested_stop = Some(completion);
            return RunStatus::Running;
        }
        if !self.collect_active_external_data() {
            return RunStatus::Failed;
        }

        let mut result = self.storage.exec.tree_run_status;
        if result == RunStatus::Running {
            self.storage.exec.phase = UpdatePhase::StopTree;
            debug!(tree = self.tree.name(), status = ?completion, "stop state tree");
            let transition = TransitionResult {
                next_frames: Vec::new(),
                source: self.storage.exec.active_frames.first().map(ExecutionFrame::id),
                source_state: None,
                target: TransitionTarget::from_completion(completion),
                priority: TransitionPriority::Critical,
                current_run_status: completion,
            };
            self.exit_state(&transition);
            self.discard_temporaries();
            result = completion;
        }

        self.storage.reset();
        if self.storage.owns_event_queue {
            self.storage.events.clear();
        }
        self.storage.exec.tree_run_status = result;
        self.storage.exec.last_tick_status = result;
        result
    }

    /// Updates tasks and resolves transitions.
    pub fn tick(&mut self, delta_time: f32) -> RunStatus {
        let status = self.tick_prelude();
        if status != RunStatus::Running {
            return status;
        }
        self.tick_update_tasks_internal(delta_time);
        self.tick_trigger_transitions_internal();
        self.finish_phase()
    }

    /// Only the update half of [`ExecutionContext::tick`].
    pub fn tick_update_tasks(&mut self, delta_time: f32) -> RunStatus {
        let status = self.tick_prelude();
        if status != RunStatus::Running {
            return status;
        }
        self.tick_update_tasks_internal(delta_time);
        self.finish_phase()
    }

    /// Only the transition half of [`ExecutionContext::tick`].
    pub fn tick_trigger_transitions(&mut self) -> RunStatus {
        let status = self.tick_prelude();
        if status != RunStatus::Running {
            return status;
        }
        self.tick_trigger_transitions_internal();
        self.finish_phase()
    }

    fn tick_prelude(&mut self) -> RunStatus {
        if let Err(err) = self.check_valid() {
            self.record_error(err);
            return RunStatus::Failed;
        }
        if self.storage.exec.phase != UpdatePhase::Unset {
            warn!(tree = self.tree.name(), "tick called while updating, ignored");
            return RunStatus::Failed;
        }
        if self.storage.exec.tree_run_status != RunStatus::Running {
            return self.storage.exec.tree_run_status;
        }
        if !self.collect_active_external_data() {
            return RunStatus::Failed;
        }
        self.storage.exec.phase = UpdatePhase::TickStateTree;
        RunStatus::Running
    }

    fn tick_update_tasks_internal(&mut self, delta_time: f32) {
        for delayed in &mut self.storage.exec.delayed_transitions {
            delayed.elapsed += delta_time;
        }

        let global_status = self.tick_evaluators_and_global_tasks(delta_time, true);
        if global_status == RunStatus::Running {
            if self.storage.exec.last_tick_status == RunStatus::Running {
                let status = self.tick_tasks(delta_time);
                self.storage.exec.last_tick_status = status;
                if status != RunStatus::Running {
                    self.state_completed();
                }
            }
        } else {
            self.storage.exec.requested_stop = Some(global_status.as_completion());
        }
    }

    fn tick_trigger_transitions_internal(&mut self) {
        if self.storage.exec.requested_stop.is_some() {
            return;
        }
        for iteration in 0..self.config.max_transition_iterations {
            if self.trigger_transitions() {
                let mut transition = std::mem::take(&mut self.next_transition);
                trace!(iteration, target = ?transition.target, "apply transition");
                self.exit_state(&transition);

                if let Some(status) = transition.target.completion_status() {
                    debug!(tree = self.tree.name(), ?status, "state tree completed");
                    self.storage.exec.tree_run_status = status;
                    self.storage.exec.last_tick_status = status;
                    // Frames the transition left were stopped by exit_state.
                    let kept = self
                        .storage
                        .exec
                        .active_frames
                        .iter()
                        .zip(&transition.next_frames)
                        .take_while(|(active, next)| active.is_same_frame(next))
                        .count();
                    self.storage.exec.active_frames.truncate(kept);
                    self.stop_evaluators_and_global_tasks(status, None);
                    self.storage.exec.active_frames.clear();
                    self.discard_temporaries();
                    break;
                }

                let status = self.enter_state(&mut transition);
                self.storage.exec.last_tick_status = status;
                if status != RunStatus::Running {
                    self.state_completed();
                }
            }
            if self.storage.exec.last_tick_status == RunStatus::Running {
                break;
            }
        }
    }

    /// Leaves the current phase and applies a stop requested during it.
    fn finish_phase(&mut self) -> RunStatus {
        self.storage.exec.phase = UpdatePhase::Unset;
        let mut status = self.storage.exec.tree_run_status;
        if let Some(requested) = self.storage.exec.requested_stop.take() {
            status = self.stop(requested);
        }
        status
    }

    /// Collects external data for every tree among the active frames.
    pub(crate) fn collect_active_external_data(&mut self) -> bool {
        self.external_views.clear();
        self.external_bases.clear();

        let mut trees: Vec<Arc<StateTree>> = vec![Arc::clone(&self.tree)];
        for frame in &self.storage.exec.active_frames {
            if !trees.iter().any(|tree| tree.id() == frame.tree.id()) {
                trees.push(Arc::clone(&frame.tree));
            }
        }
        for tree in &trees {
            if self.collect_external_data(tree).is_none() {
                return false;
            }
        }

        let bases = self.external_bases.clone();
        for frame in &mut self.storage.exec.active_frames {
            frame.external_data_base = bases
                .iter()
                .find(|(id, _)| *id == frame.tree.id())
                .map(|(_, base)| *base);
        }
        true
    }

    /// Collects external data for `tree` if not collected yet, returning its base index.
    pub(crate) fn collect_external_data(&mut self, tree: &Arc<StateTree>) -> Option<usize> {
        if let Some((_, base)) = self.external_bases.iter().find(|(id, _)| *id == tree.id()) {
            return Some(*base);
        }
        let base = self.external_views.len();
        let descs = tree.external_data();
        if descs.is_empty() {
            self.external_bases.push((tree.id(), base));
            return Some(base);
        }

        let views = self
            .external_provider
            .as_mut()
            .and_then(|provider| provider.collect(tree, descs));
        let Some(views) = views else {
            error!(tree = tree.name(), "external data provider returned nothing");
            self.record_error(StateTreeError::ExternalDataUnavailable {
                name: descs[0].name.to_string(),
            });
            return None;
        };

        for (index, desc) in descs.iter().enumerate() {
            let view = views.get(index).and_then(Option::as_ref);
            let usable = match view {
                Some(view) => view.as_any().type_id() == desc.type_id,
                None => !desc.required,
            };
            if !usable {
                error!(tree = tree.name(), data = %desc.name, "external data missing or mistyped");
                self.record_error(StateTreeError::ExternalDataUnavailable {
                    name: desc.name.to_string(),
                });
                return None;
            }
        }

        self.external_views
            .extend(views.into_iter().take(descs.len()));
        self.external_views.resize(base + descs.len(), None);
        self.external_bases.push((tree.id(), base));
        Some(base)
    }
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("tree", &self.tree.name())
            .field("storage", &self.storage)
            .field("active_states", &self.active_state_names())
            .finish()
    }
}

/// Helper for [`ContextObject`] implementations.
pub fn as_any<T: Any>(object: &T) -> &dyn Any {
    object
}
