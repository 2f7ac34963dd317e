//! Task that runs another state tree alongside the state owning it.

use std::sync::Arc;

use ai_core::{DeterministicRng, PropertyBag, RunStatus};
use tracing::debug;

use crate::builder::NodeSpec;
use crate::config::ExecutionConfig;
use crate::context::ExecutionContext;
use crate::node::{NodeContext, Task, TransitionInfo};
use crate::tree::{StateTree, TaskConfig};
use crate::types::TransitionPriority;

/// Starts `tree` in a nested context when its state is entered and ticks it with the owner.
///
/// The nested tree reads and consumes events from the outer queue. Its transitions are
/// triggered at `priority` relative to the outer tree's transition handlers; the instance data
/// of the task is the nested tree's parameter block.
pub struct RunParallelTreeTask {
    tree: Arc<StateTree>,
    config: ExecutionConfig,
    priority: TransitionPriority,
}

struct ParallelRun {
    context: ExecutionContext,
}

impl RunParallelTreeTask {
    pub fn new(tree: Arc<StateTree>) -> Self {
        Self {
            tree,
            config: ExecutionConfig::default(),
            priority: TransitionPriority::Normal,
        }
    }

    pub fn with_priority(mut self, priority: TransitionPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_config(mut self, config: ExecutionConfig) -> Self {
        self.config = config;
        self
    }

    /// Wraps the task in a node that takes part in transition handling.
    pub fn into_node(self, name: &'static str) -> NodeSpec {
        let config = TaskConfig {
            should_affect_transitions: true,
            transition_priority: self.priority,
            ..TaskConfig::default()
        };
        NodeSpec::task(name, self).with_config(config)
    }

    fn stop_nested(ctx: &mut NodeContext<'_>) {
        if let Some(mut run) = ctx.take_object::<ParallelRun>() {
            let status = run
                .context
                .with_event_queue(ctx.events_mut(), |nested| nested.stop(RunStatus::Stopped));
            debug!(task = ctx.name(), ?status, "stopped parallel tree");
        }
    }
}

impl Task for RunParallelTreeTask {
    fn instance_template(&self) -> PropertyBag {
        self.tree.default_parameters().clone()
    }

    fn enter_state(&self, ctx: &mut NodeContext<'_>, _transition: &TransitionInfo) -> RunStatus {
        Self::stop_nested(ctx);

        let parameters = ctx.data().clone();
        let seed = ctx.rng().next_u64();
        let mut context = ExecutionContext::with_config(Arc::clone(&self.tree), self.config.clone());
        let status = context.with_event_queue(ctx.events_mut(), |nested| {
            nested.start(Some(&parameters), Some(seed))
        });
        debug!(task = ctx.name(), tree = self.tree.name(), ?status, "started parallel tree");
        ctx.set_object(ParallelRun { context });
        status
    }

    fn exit_state(&self, ctx: &mut NodeContext<'_>, _transition: &TransitionInfo) {
        Self::stop_nested(ctx);
    }

    fn tick(&self, ctx: &mut NodeContext<'_>, delta_time: f32) -> RunStatus {
        let Some((run, events)) = ctx.object_and_events_mut::<ParallelRun>() else {
            return RunStatus::Failed;
        };
        run.context
            .with_event_queue(events, |nested| nested.tick_update_tasks(delta_time))
    }

    fn trigger_transitions(&self, ctx: &mut NodeContext<'_>) {
        if let Some((run, events)) = ctx.object_and_events_mut::<ParallelRun>() {
            run.context
                .with_event_queue(events, |nested| nested.tick_trigger_transitions());
        }
    }
}

impl std::fmt::Debug for RunParallelTreeTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunParallelTreeTask")
            .field("tree", &self.tree.name())
            .field("priority", &self.priority)
            .finish()
    }
}
