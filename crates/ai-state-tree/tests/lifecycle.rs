mod common;

use std::sync::Arc;

use ai_core::RunStatus;
use ai_state_tree::{
    DataHandle, ExecutionContext, NodeContext, StateHandle, StateSpec, StateTree,
    StateTreeBuilder, StateTreeError, Task, TransitionSpec,
};
use common::{entries, Log, Record};

fn sequence(log: &Log) -> Arc<StateTree> {
    StateTreeBuilder::new("sequence")
        .state(StateSpec::new("Root").task(Record::new(log).node("r")))
        .child(
            "Root",
            StateSpec::new("A")
                .task(Record::new(log).succeeds_after(1).node("a"))
                .transition(TransitionSpec::on_succeeded("B")),
        )
        .child("Root", StateSpec::new("B").task(Record::new(log).node("b")))
        .build()
        .expect("valid tree")
}

#[test]
fn start_enters_the_first_selectable_leaf() {
    let log = Log::new();
    let mut ctx = ExecutionContext::new(sequence(&log));

    assert_eq!(ctx.start(None, None), RunStatus::Running);
    assert_eq!(log.take(), entries(&["r enter", "a enter"]));
    assert_eq!(ctx.active_state_names(), vec!["Root", "A"]);
    assert_eq!(ctx.state_change_count(), 1);
}

#[test]
fn completed_task_takes_the_succeeded_transition() {
    let log = Log::new();
    let mut ctx = ExecutionContext::new(sequence(&log));
    ctx.start(None, None);
    log.take();

    assert_eq!(ctx.tick(0.1), RunStatus::Running);
    assert_eq!(
        log.take(),
        entries(&[
            "r tick",
            "a tick",
            "a completed",
            "r completed",
            "a exit",
            "b enter",
        ])
    );
    assert_eq!(ctx.active_state_names(), vec!["Root", "B"]);
    assert_eq!(ctx.state_change_count(), 2);

    assert_eq!(ctx.tick(0.1), RunStatus::Running);
    assert_eq!(log.take(), entries(&["r tick", "b tick"]));
}

#[test]
fn stop_exits_leaf_to_root() {
    let log = Log::new();
    let mut ctx = ExecutionContext::new(sequence(&log));
    ctx.start(None, None);
    log.take();

    assert_eq!(ctx.stop(RunStatus::Running), RunStatus::Stopped);
    assert_eq!(log.take(), entries(&["a exit", "r exit"]));
    assert_eq!(ctx.run_status(), RunStatus::Stopped);
    assert!(ctx.active_frames().is_empty());

    // Ticking a stopped tree does nothing.
    assert_eq!(ctx.tick(0.1), RunStatus::Stopped);
    assert!(log.take().is_empty());
}

#[test]
fn restart_stops_the_running_tree_first() {
    let log = Log::new();
    let mut ctx = ExecutionContext::new(sequence(&log));
    ctx.start(None, None);
    log.take();

    assert_eq!(ctx.start(None, None), RunStatus::Running);
    assert_eq!(
        log.take(),
        entries(&["a exit", "r exit", "r enter", "a enter"])
    );
}

#[test]
fn sustained_states_keep_their_instance_data() {
    let log = Log::new();
    let mut ctx = ExecutionContext::new(sequence(&log));
    ctx.start(None, None);
    for _ in 0..3 {
        ctx.tick(0.1);
    }

    let root_task = DataHandle::ActiveInstance {
        state: StateHandle::ROOT,
        index: 0,
    };
    let ticks = ctx
        .data_view(0, root_task)
        .and_then(|view| view.bag())
        .and_then(|bag| bag.int("ticks"));
    assert_eq!(ticks, Some(3));

    let b = ctx.tree().find_state("B").expect("B exists");
    let ticks = ctx
        .data_view(0, DataHandle::ActiveInstance { state: b, index: 0 })
        .and_then(|view| view.bag())
        .and_then(|bag| bag.int("ticks"));
    assert_eq!(ticks, Some(2));
}

#[test]
fn enter_failure_stops_entering_and_completes_entered_tasks() {
    let log = Log::new();
    let tree = StateTreeBuilder::new("enter-failure")
        .state(StateSpec::new("Root").task(Record::new(&log).node("r")))
        .child(
            "Root",
            StateSpec::new("A")
                .task(Record::new(&log).fails_on_enter().node("a1"))
                .task(Record::new(&log).node("a2")),
        )
        .build()
        .expect("valid tree");
    let mut ctx = ExecutionContext::new(tree);

    assert_eq!(ctx.start(None, None), RunStatus::Running);
    assert_eq!(ctx.last_tick_status(), RunStatus::Failed);
    assert_eq!(
        log.take(),
        entries(&["r enter", "a1 enter", "a1 completed", "r completed"])
    );
    assert_eq!(
        ctx.last_error(),
        Some(&StateTreeError::EnterStateFailed {
            state: "A".into(),
            task: "a1".into(),
        })
    );
}

#[test]
fn transition_to_succeeded_completes_the_tree() {
    let log = Log::new();
    let tree = StateTreeBuilder::new("finish")
        .state(StateSpec::new("Root"))
        .child(
            "Root",
            StateSpec::new("Work")
                .task(Record::new(&log).succeeds_after(2).node("work"))
                .transition(TransitionSpec::on_succeeded(ai_state_tree::TargetSpec::Succeeded)),
        )
        .build()
        .expect("valid tree");
    let mut ctx = ExecutionContext::new(tree);
    ctx.start(None, None);

    assert_eq!(ctx.tick(0.1), RunStatus::Running);
    assert_eq!(ctx.tick(0.1), RunStatus::Succeeded);
    assert_eq!(ctx.run_status(), RunStatus::Succeeded);
    assert!(ctx.active_frames().is_empty());
    assert!(log.take().ends_with(&entries(&["work completed", "work exit"])));
}

#[test]
fn tree_without_tasks_succeeds_on_first_tick() {
    let tree = StateTreeBuilder::new("empty")
        .state(StateSpec::new("Root").transition(TransitionSpec::on_succeeded(
            ai_state_tree::TargetSpec::Succeeded,
        )))
        .build()
        .expect("valid tree");
    let mut ctx = ExecutionContext::new(tree);

    assert_eq!(ctx.start(None, None), RunStatus::Running);
    assert_eq!(ctx.tick(0.1), RunStatus::Succeeded);
}

struct Stopper;

impl Task for Stopper {
    fn tick(&self, ctx: &mut NodeContext<'_>, _delta_time: f32) -> RunStatus {
        ctx.stop_tree(RunStatus::Succeeded);
        RunStatus::Running
    }
}

#[test]
fn stop_requested_by_a_task_applies_after_the_tick() {
    let log = Log::new();
    let tree = StateTreeBuilder::new("stopper")
        .state(StateSpec::new("Root").task(Record::new(&log).node("r")))
        .child(
            "Root",
            StateSpec::new("A")
                .task(ai_state_tree::NodeSpec::task("stopper", Stopper))
                .transition(TransitionSpec::on_tick("B")),
        )
        .child("Root", StateSpec::new("B").task(Record::new(&log).node("b")))
        .build()
        .expect("valid tree");
    let mut ctx = ExecutionContext::new(tree);
    ctx.start(None, None);
    log.take();

    assert_eq!(ctx.tick(0.1), RunStatus::Succeeded);
    // Transitions are skipped once a stop is pending.
    assert_eq!(log.take(), entries(&["r tick", "r exit"]));
    assert_eq!(ctx.run_status(), RunStatus::Succeeded);
}

#[test]
fn ticking_without_transitions_only_ticks() {
    let log = Log::new();
    let tree = StateTreeBuilder::new("idle")
        .state(StateSpec::new("Root").task(Record::new(&log).node("r")))
        .child("Root", StateSpec::new("A").task(Record::new(&log).node("a")))
        .build()
        .expect("valid tree");
    let mut ctx = ExecutionContext::new(tree);
    ctx.start(None, None);
    log.take();

    for _ in 0..3 {
        assert_eq!(ctx.tick(0.1), RunStatus::Running);
        assert_eq!(log.take(), entries(&["r tick", "a tick"]));
    }
    assert_eq!(ctx.active_state_names(), vec!["Root", "A"]);
    assert_eq!(ctx.state_change_count(), 1);
}

#[test]
fn transition_below_a_shared_ancestor_leaves_it_untouched() {
    let log = Log::new();
    let tree = StateTreeBuilder::new("prefix")
        .state(StateSpec::new("Root").task(Record::new(&log).node("r")))
        .child("Root", StateSpec::new("Mid").task(Record::new(&log).node("m")))
        .child(
            "Mid",
            StateSpec::new("X")
                .task(Record::new(&log).node("x"))
                .transition(TransitionSpec::on_tick("Y")),
        )
        .child("Mid", StateSpec::new("Y").task(Record::new(&log).node("y")))
        .build()
        .expect("valid tree");
    let mut ctx = ExecutionContext::new(tree);
    ctx.start(None, None);
    assert_eq!(log.take(), entries(&["r enter", "m enter", "x enter"]));

    ctx.tick(0.1);
    assert_eq!(
        log.take(),
        entries(&["r tick", "m tick", "x tick", "x exit", "y enter"])
    );
    assert_eq!(ctx.active_state_names(), vec!["Root", "Mid", "Y"]);
}

#[test]
fn two_state_sequence_runs_to_success() {
    let log = Log::new();
    let tree = StateTreeBuilder::new("two-states")
        .state(StateSpec::new("Root"))
        .child(
            "Root",
            StateSpec::new("State1")
                .task(Record::new(&log).succeeds_after(1).node("task1"))
                .transition(TransitionSpec::on_completed("State2")),
        )
        .child(
            "Root",
            StateSpec::new("State2")
                .task(Record::new(&log).succeeds_after(1).node("task2"))
                .transition(TransitionSpec::on_completed(ai_state_tree::TargetSpec::Succeeded)),
        )
        .build()
        .expect("valid tree");
    let mut ctx = ExecutionContext::new(tree);

    assert_eq!(ctx.start(None, None), RunStatus::Running);
    assert_eq!(log.take(), entries(&["task1 enter"]));

    assert_eq!(ctx.tick(0.1), RunStatus::Running);
    assert_eq!(
        log.take(),
        entries(&["task1 tick", "task1 completed", "task1 exit", "task2 enter"])
    );

    assert_eq!(ctx.tick(0.1), RunStatus::Succeeded);
    assert_eq!(
        log.take(),
        entries(&["task2 tick", "task2 completed", "task2 exit"])
    );
}
