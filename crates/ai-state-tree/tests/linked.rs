mod common;

use std::sync::Arc;

use ai_core::{PropertyBag, RunStatus, Tag};
use ai_state_tree::{
    ExecutionContext, StateSpec, StateTree, StateTreeBuilder, StateTreeError, TargetSpec,
    TransitionPriority, TransitionSpec,
};
use common::{entries, Log, Record, RecordEvaluator};

#[test]
fn linked_subtree_runs_in_its_own_frame() {
    let log = Log::new();
    let tree = StateTreeBuilder::new("linked")
        .state(StateSpec::new("Root"))
        .child(
            "Root",
            StateSpec::linked("UseSub", "Sub").transition(TransitionSpec::on_succeeded("After")),
        )
        .child("Root", StateSpec::new("After").task(Record::new(&log).node("after")))
        .state(StateSpec::subtree("Sub"))
        .child(
            "Sub",
            StateSpec::new("Work")
                .task(Record::new(&log).succeeds_after(1).node("work"))
                .transition(TransitionSpec::on_succeeded(TargetSpec::Succeeded)),
        )
        .build()
        .expect("valid tree");
    let mut ctx = ExecutionContext::new(tree);

    assert_eq!(ctx.start(None, None), RunStatus::Running);
    assert_eq!(ctx.active_frames().len(), 2);
    assert_eq!(ctx.active_state_names(), vec!["Root", "UseSub", "Sub", "Work"]);
    assert_eq!(log.take(), entries(&["work enter"]));

    // The subtree finishing completes the linking state, whose transition moves on.
    assert_eq!(ctx.tick(0.1), RunStatus::Running);
    assert_eq!(ctx.active_state_names(), vec!["Root", "After"]);
    assert_eq!(ctx.active_frames().len(), 1);
    assert_eq!(
        log.take(),
        entries(&["work tick", "work completed", "work exit", "after enter"])
    );
}

fn inner(log: &Log, name: &'static str, task: &'static str) -> Arc<StateTree> {
    StateTreeBuilder::new(name)
        .evaluator(RecordEvaluator::node(log, "inner-eval"))
        .state(StateSpec::new("InnerRoot").task(Record::new(log).node(task)))
        .build()
        .expect("valid inner tree")
}

fn outer(log: &Log, linked: Arc<StateTree>) -> Arc<StateTree> {
    StateTreeBuilder::new("outer")
        .state(StateSpec::new("Root"))
        .child(
            "Root",
            StateSpec::linked_asset("Run", linked).with_tag("slot.inner"),
        )
        .child("Root", StateSpec::new("Idle").task(Record::new(log).node("idle")))
        .build()
        .expect("valid outer tree")
}

#[test]
fn linked_asset_starts_and_stops_its_evaluators() {
    let log = Log::new();
    let tree = outer(&log, inner(&log, "inner", "i"));
    let mut ctx = ExecutionContext::new(Arc::clone(&tree));

    assert_eq!(ctx.start(None, None), RunStatus::Running);
    assert_eq!(ctx.active_state_names(), vec!["Root", "Run", "InnerRoot"]);
    assert_eq!(log.take(), entries(&["inner-eval start", "i enter"]));

    ctx.tick(0.1);
    assert_eq!(log.take(), entries(&["inner-eval tick", "i tick"]));

    let idle = tree.find_state("Idle").expect("idle exists");
    ctx.request_transition(idle, TransitionPriority::Normal);
    ctx.tick(0.1);
    assert_eq!(
        log.take(),
        entries(&[
            "inner-eval tick",
            "i tick",
            "i exit",
            "inner-eval stop",
            "idle enter",
        ])
    );
    assert_eq!(ctx.active_frames().len(), 1);
}

#[test]
fn linked_tree_override_replaces_the_asset() {
    let log = Log::new();
    let tree = outer(&log, inner(&log, "inner", "i"));
    let mut ctx = ExecutionContext::new(tree);
    ctx.set_linked_tree_override(Tag::new("slot.inner"), inner(&log, "replacement", "r"));

    assert_eq!(ctx.start(None, None), RunStatus::Running);
    assert_eq!(log.take(), entries(&["inner-eval start", "r enter"]));
    assert_eq!(ctx.active_frames()[1].tree().name(), "replacement");
}

#[test]
fn linked_asset_receives_the_linking_state_parameters() {
    let inner = StateTreeBuilder::new("speedy")
        .parameters(PropertyBag::new().with("speed", 1.0f32))
        .state(StateSpec::new("InnerRoot"))
        .build()
        .expect("valid inner tree");
    let tree = StateTreeBuilder::new("outer")
        .state(StateSpec::new("Root"))
        .child(
            "Root",
            StateSpec::linked_asset("Run", inner)
                .parameters(PropertyBag::new().with("speed", 4.5f32)),
        )
        .build()
        .expect("valid outer tree");
    let mut ctx = ExecutionContext::new(Arc::clone(&tree));
    ctx.start(None, None);

    let run = tree.find_state("Run").expect("run exists");
    let speed = ctx
        .data_view(1, ai_state_tree::DataHandle::GlobalParameters)
        .and_then(|view| view.bag())
        .and_then(|bag| bag.float("speed"));
    assert_eq!(speed, Some(4.5));
    let own = ctx
        .data_view(0, ai_state_tree::DataHandle::StateParameters(run))
        .and_then(|view| view.bag())
        .and_then(|bag| bag.float("speed"));
    assert_eq!(own, Some(4.5));
}

#[test]
fn subtree_linking_itself_fails_with_recursion_exceeded() {
    let tree = StateTreeBuilder::new("recursive")
        .state(StateSpec::new("Root"))
        .child("Root", StateSpec::linked("UseSub", "Sub"))
        .state(StateSpec::subtree("Sub"))
        .child("Sub", StateSpec::linked("Again", "Sub"))
        .build()
        .expect("valid tree");
    let mut ctx = ExecutionContext::new(tree);

    assert_eq!(ctx.start(None, None), RunStatus::Failed);
    assert!(matches!(
        ctx.last_error(),
        Some(StateTreeError::RecursionExceeded { .. })
    ));
    assert!(ctx.active_frames().is_empty());
}

#[test]
fn linked_asset_completion_completes_the_linking_state() {
    let log = Log::new();
    let inner = StateTreeBuilder::new("errand")
        .state(
            StateSpec::new("InnerRoot")
                .task(Record::new(&log).succeeds_after(1).node("errand"))
                .transition(TransitionSpec::on_succeeded(TargetSpec::Succeeded)),
        )
        .build()
        .expect("valid inner tree");
    let tree = StateTreeBuilder::new("outer")
        .state(StateSpec::new("Root"))
        .child(
            "Root",
            StateSpec::linked_asset("Run", inner).transition(TransitionSpec::on_succeeded("Idle")),
        )
        .child("Root", StateSpec::new("Idle").task(Record::new(&log).node("idle")))
        .build()
        .expect("valid outer tree");
    let mut ctx = ExecutionContext::new(tree);
    ctx.start(None, None);
    log.take();

    assert_eq!(ctx.tick(0.1), RunStatus::Running);
    assert_eq!(ctx.active_state_names(), vec!["Root", "Idle"]);
    assert_eq!(ctx.active_frames().len(), 1);
    assert!(log.take().ends_with(&entries(&["errand exit", "idle enter"])));
}

#[test]
fn subtree_failing_on_tick_takes_the_linking_state_failure_transition() {
    let log = Log::new();
    let tree = StateTreeBuilder::new("give-up")
        .state(StateSpec::new("Root"))
        .child(
            "Root",
            StateSpec::linked("UseSub", "Sub").transition(TransitionSpec::on_failed("Recover")),
        )
        .child("Root", StateSpec::new("Recover").task(Record::new(&log).node("recover")))
        .state(StateSpec::subtree("Sub"))
        .child(
            "Sub",
            StateSpec::new("W")
                .task(Record::new(&log).node("w"))
                .transition(TransitionSpec::on_tick(TargetSpec::Failed)),
        )
        .build()
        .expect("valid tree");
    let mut ctx = ExecutionContext::new(tree);
    ctx.start(None, None);
    log.take();

    assert_eq!(ctx.tick(0.1), RunStatus::Running);
    assert_eq!(ctx.active_state_names(), vec!["Root", "Recover"]);
    assert_eq!(log.take(), entries(&["w tick", "w exit", "recover enter"]));

    ctx.tick(0.1);
    assert_eq!(log.take(), entries(&["recover tick"]));
}
