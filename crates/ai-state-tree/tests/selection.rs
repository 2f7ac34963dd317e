mod common;

use std::sync::Arc;

use ai_core::RunStatus;
use ai_state_tree::{
    ConstantBool, ConstantConsideration, Event, EventDesc, ExecutionContext, ExpressionTerm,
    NodeSpec, Operand, SelectionBehavior, SelectionFallback, StateSpec, StateTree,
    StateTreeBuilder, StateTreeError, TransitionPriority, TransitionSpec,
};
use common::{Log, Record};

fn never() -> NodeSpec {
    NodeSpec::condition("never", ConstantBool(false))
}

#[test]
fn failed_enter_condition_falls_back_to_next_sibling() {
    let log = Log::new();
    let tree = StateTreeBuilder::new("fallback")
        .state(StateSpec::new("Root"))
        .child(
            "Root",
            StateSpec::new("A")
                .task(Record::new(&log).succeeds_after(1).node("a"))
                .transition(
                    TransitionSpec::on_succeeded("B")
                        .fallback(SelectionFallback::NextSelectableSibling),
                ),
        )
        .child(
            "Root",
            StateSpec::new("B")
                .enter_condition(never())
                .task(Record::new(&log).node("b")),
        )
        .child("Root", StateSpec::new("C").task(Record::new(&log).node("c")))
        .build()
        .expect("valid tree");
    let mut ctx = ExecutionContext::new(tree);
    ctx.start(None, None);

    assert_eq!(ctx.tick(0.1), RunStatus::Running);
    assert_eq!(ctx.active_state_names(), vec!["Root", "C"]);
    assert!(!log.take().contains(&"b enter".to_string()));
}

#[test]
fn without_fallback_a_blocked_target_is_not_selected() {
    let log = Log::new();
    let tree = StateTreeBuilder::new("no-fallback")
        .state(StateSpec::new("Root"))
        .child(
            "Root",
            StateSpec::new("A")
                .task(Record::new(&log).node("a"))
                .transition(TransitionSpec::on_tick("B")),
        )
        .child("Root", StateSpec::new("B").enter_condition(never()))
        .child("Root", StateSpec::new("C"))
        .build()
        .expect("valid tree");
    let mut ctx = ExecutionContext::new(tree);
    ctx.start(None, None);

    assert_eq!(ctx.tick(0.1), RunStatus::Running);
    assert_eq!(ctx.active_state_names(), vec!["Root", "A"]);
}

#[test]
fn disabled_and_unselectable_states_are_skipped() {
    let tree = StateTreeBuilder::new("skip")
        .state(StateSpec::new("Root"))
        .child("Root", StateSpec::new("Off").disabled())
        .child(
            "Root",
            StateSpec::new("Inert").selection(SelectionBehavior::None),
        )
        .child("Root", StateSpec::new("On"))
        .build()
        .expect("valid tree");
    let mut ctx = ExecutionContext::new(tree);

    assert_eq!(ctx.start(None, None), RunStatus::Running);
    assert_eq!(ctx.active_state_names(), vec!["Root", "On"]);
}

fn scored(name: &'static str, score: f32) -> StateSpec {
    StateSpec::new(name).consideration(NodeSpec::consideration(
        "score",
        ConstantConsideration(score),
    ))
}

#[test]
fn highest_utility_child_is_selected() {
    let tree = StateTreeBuilder::new("utility")
        .state(
            StateSpec::new("Root").selection(SelectionBehavior::TrySelectChildrenWithHighestUtility),
        )
        .child("Root", scored("Low", 0.2))
        .child("Root", scored("High", 0.9))
        .child("Root", scored("Mid", 0.5))
        .build()
        .expect("valid tree");
    let mut ctx = ExecutionContext::new(tree);
    ctx.start(None, None);

    assert_eq!(ctx.active_state_names(), vec!["Root", "High"]);
}

#[test]
fn state_weight_scales_utility() {
    let tree = StateTreeBuilder::new("weighted-utility")
        .state(
            StateSpec::new("Root").selection(SelectionBehavior::TrySelectChildrenWithHighestUtility),
        )
        .child("Root", scored("Low", 0.2).weight(5.0))
        .child("Root", scored("High", 0.9))
        .build()
        .expect("valid tree");
    let mut ctx = ExecutionContext::new(tree);
    ctx.start(None, None);

    assert_eq!(ctx.active_state_names(), vec!["Root", "Low"]);
}

#[test]
fn weighted_random_never_picks_a_zero_score() {
    let tree = StateTreeBuilder::new("weighted-random")
        .state(
            StateSpec::new("Root")
                .selection(SelectionBehavior::TrySelectChildrenAtRandomWeightedByUtility),
        )
        .child("Root", scored("Zero", 0.0))
        .child("Root", scored("One", 1.0))
        .build()
        .expect("valid tree");

    for seed in 0..32 {
        let mut ctx = ExecutionContext::new(Arc::clone(&tree));
        ctx.start(None, Some(seed));
        assert_eq!(ctx.active_state_names(), vec!["Root", "One"], "seed {seed}");
    }
}

fn random_tree() -> Arc<StateTree> {
    let mut builder = StateTreeBuilder::new("random")
        .state(StateSpec::new("Root").selection(SelectionBehavior::TrySelectChildrenAtRandom));
    for name in ["A", "B", "C", "D"] {
        builder = builder.child("Root", StateSpec::new(name));
    }
    builder.build().expect("valid tree")
}

#[test]
fn random_selection_is_reproducible_for_a_seed() {
    let tree = random_tree();
    for seed in [1, 7, 42, 1234] {
        let mut first = ExecutionContext::new(Arc::clone(&tree));
        let mut second = ExecutionContext::new(Arc::clone(&tree));
        first.start(None, Some(seed));
        second.start(None, Some(seed));
        assert_eq!(first.active_state_names(), second.active_state_names());
        assert_eq!(first.active_state_names().len(), 2);
    }
}

#[test]
fn required_event_gates_selection_and_is_recorded_on_the_frame() {
    let log = Log::new();
    let tree = StateTreeBuilder::new("alarm")
        .state(StateSpec::new("Root"))
        .child(
            "Root",
            StateSpec::new("Alert")
                .required_event(EventDesc::tag("alarm"))
                .task(Record::new(&log).node("alert")),
        )
        .child("Root", StateSpec::new("Idle").task(Record::new(&log).node("idle")))
        .build()
        .expect("valid tree");
    let mut ctx = ExecutionContext::new(Arc::clone(&tree));
    ctx.start(None, None);
    assert_eq!(ctx.active_state_names(), vec!["Root", "Idle"]);

    ctx.send_event(Event::new("alarm"));
    let root = tree.find_state("Root").expect("root exists");
    ctx.request_transition(root, TransitionPriority::Normal);
    assert_eq!(ctx.tick(0.1), RunStatus::Running);

    assert_eq!(ctx.active_state_names(), vec!["Root", "Alert"]);
    let event = ctx.active_frames()[0].state_event(1).expect("state event");
    assert_eq!(event.tag.as_str(), "alarm");
    assert_eq!(
        log.take(),
        common::entries(&["idle enter", "idle tick", "idle exit", "alert enter"])
    );
}

#[test]
fn follow_transitions_take_the_highest_priority_passing_transition() {
    let tree = StateTreeBuilder::new("follow")
        .state(StateSpec::new("Root"))
        .child(
            "Root",
            StateSpec::new("Hub")
                .selection(SelectionBehavior::TryFollowTransitions)
                .transition(TransitionSpec::on_tick("Left"))
                .transition(TransitionSpec::on_tick("Right").priority(TransitionPriority::High))
                .transition(
                    TransitionSpec::on_tick("Blocked")
                        .priority(TransitionPriority::Critical)
                        .condition(never()),
                ),
        )
        .child("Root", StateSpec::new("Left"))
        .child("Root", StateSpec::new("Right"))
        .child("Root", StateSpec::new("Blocked"))
        .build()
        .expect("valid tree");
    let mut ctx = ExecutionContext::new(tree);

    assert_eq!(ctx.start(None, None), RunStatus::Running);
    assert_eq!(ctx.active_state_names(), vec!["Root", "Right"]);
}

#[test]
fn follow_transition_cycle_fails_with_loop_detected() {
    let tree = StateTreeBuilder::new("ping-pong")
        .state(StateSpec::new("Root"))
        .child(
            "Root",
            StateSpec::new("Ping")
                .selection(SelectionBehavior::TryFollowTransitions)
                .transition(TransitionSpec::on_tick("Pong")),
        )
        .child(
            "Root",
            StateSpec::new("Pong")
                .selection(SelectionBehavior::TryFollowTransitions)
                .transition(TransitionSpec::on_tick("Ping")),
        )
        .build()
        .expect("valid tree");
    let mut ctx = ExecutionContext::new(tree);

    assert_eq!(ctx.start(None, None), RunStatus::Failed);
    assert!(matches!(
        ctx.last_error(),
        Some(StateTreeError::LoopDetected { .. })
    ));
}

#[test]
fn enter_conditions_fold_with_brackets() {
    // (A && B) || C
    let guarded = |a: bool, b: bool, c: bool| {
        StateSpec::new("Guarded")
            .enter_condition(
                NodeSpec::condition("a", ConstantBool(a))
                    .with_term(ExpressionTerm::new(Operand::Copy, 1)),
            )
            .enter_condition(
                NodeSpec::condition("b", ConstantBool(b))
                    .with_term(ExpressionTerm::new(Operand::And, -1)),
            )
            .enter_condition(NodeSpec::condition("c", ConstantBool(c)).with_term(ExpressionTerm::or()))
    };

    for bits in 0..8u8 {
        let (a, b, c) = (bits & 1 != 0, bits & 2 != 0, bits & 4 != 0);
        let tree = StateTreeBuilder::new("brackets")
            .state(StateSpec::new("Root"))
            .child("Root", guarded(a, b, c))
            .child("Root", StateSpec::new("Otherwise"))
            .build()
            .expect("valid tree");
        let mut ctx = ExecutionContext::new(tree);
        ctx.start(None, None);

        let expected = if (a && b) || c { "Guarded" } else { "Otherwise" };
        assert_eq!(ctx.active_state_names()[1], expected, "a={a} b={b} c={c}");
    }
}
