#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use ai_core::{PropertyBag, RunStatus};
use ai_state_tree::{
    ActiveStates, Evaluator, NodeContext, NodeSpec, Task, TaskConfig, TransitionInfo,
    TransitionPriority,
};

#[derive(Debug, Clone, Default)]
pub struct Log(Arc<Mutex<Vec<String>>>);

impl Log {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, entry: impl Into<String>) {
        self.0.lock().expect("log lock").push(entry.into());
    }

    /// Returns and clears everything recorded so far.
    pub fn take(&self) -> Vec<String> {
        std::mem::take(&mut *self.0.lock().expect("log lock"))
    }
}

#[derive(Debug, Clone, Copy)]
enum Outcome {
    Forever,
    SucceedAfter(i64),
    FailAfter(i64),
    FailOnEnter,
}

/// Task logging `<node> enter|tick|exit|completed` and counting its ticks in `ticks`.
pub struct Record {
    log: Log,
    outcome: Outcome,
}

impl Record {
    pub fn new(log: &Log) -> Self {
        Self {
            log: log.clone(),
            outcome: Outcome::Forever,
        }
    }

    pub fn succeeds_after(mut self, ticks: i64) -> Self {
        self.outcome = Outcome::SucceedAfter(ticks);
        self
    }

    pub fn fails_after(mut self, ticks: i64) -> Self {
        self.outcome = Outcome::FailAfter(ticks);
        self
    }

    pub fn fails_on_enter(mut self) -> Self {
        self.outcome = Outcome::FailOnEnter;
        self
    }

    pub fn node(self, name: &'static str) -> NodeSpec {
        NodeSpec::task(name, self)
    }
}

impl Task for Record {
    fn instance_template(&self) -> PropertyBag {
        PropertyBag::new().with("ticks", 0i64)
    }

    fn enter_state(&self, ctx: &mut NodeContext<'_>, _transition: &TransitionInfo) -> RunStatus {
        self.log.push(format!("{} enter", ctx.name()));
        match self.outcome {
            Outcome::FailOnEnter => RunStatus::Failed,
            _ => RunStatus::Running,
        }
    }

    fn exit_state(&self, ctx: &mut NodeContext<'_>, _transition: &TransitionInfo) {
        self.log.push(format!("{} exit", ctx.name()));
    }

    fn tick(&self, ctx: &mut NodeContext<'_>, _delta_time: f32) -> RunStatus {
        self.log.push(format!("{} tick", ctx.name()));
        let ticks = ctx.data().int("ticks").unwrap_or(0) + 1;
        ctx.data_mut().set_by_name("ticks", ticks);
        match self.outcome {
            Outcome::SucceedAfter(limit) if ticks >= limit => RunStatus::Succeeded,
            Outcome::FailAfter(limit) if ticks >= limit => RunStatus::Failed,
            _ => RunStatus::Running,
        }
    }

    fn state_completed(
        &self,
        ctx: &mut NodeContext<'_>,
        _status: RunStatus,
        _completed: &ActiveStates,
    ) {
        self.log.push(format!("{} completed", ctx.name()));
    }
}

/// Evaluator logging `<node> start|tick|stop`.
pub struct RecordEvaluator {
    log: Log,
}

impl RecordEvaluator {
    pub fn node(log: &Log, name: &'static str) -> NodeSpec {
        NodeSpec::evaluator(name, Self { log: log.clone() })
    }
}

impl Evaluator for RecordEvaluator {
    fn tree_start(&self, ctx: &mut NodeContext<'_>) {
        self.log.push(format!("{} start", ctx.name()));
    }

    fn tree_stop(&self, ctx: &mut NodeContext<'_>) {
        self.log.push(format!("{} stop", ctx.name()));
    }

    fn tick(&self, ctx: &mut NodeContext<'_>, _delta_time: f32) {
        self.log.push(format!("{} tick", ctx.name()));
    }
}

/// Global task that logs how many events are still queued when it handles transitions.
pub struct EventProbe {
    log: Log,
}

impl EventProbe {
    pub fn node(log: &Log, name: &'static str, priority: TransitionPriority) -> NodeSpec {
        let config = TaskConfig {
            should_affect_transitions: true,
            transition_priority: priority,
            ..TaskConfig::default()
        };
        NodeSpec::task(name, Self { log: log.clone() }).with_config(config)
    }
}

impl Task for EventProbe {
    fn trigger_transitions(&self, ctx: &mut NodeContext<'_>) {
        self.log
            .push(format!("{} saw {}", ctx.name(), ctx.events().len()));
    }
}

pub fn entries(items: &[&str]) -> Vec<String> {
    items.iter().map(|item| item.to_string()).collect()
}
