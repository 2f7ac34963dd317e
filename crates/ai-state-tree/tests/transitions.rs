mod common;

use ai_core::{PropertyBag, RunStatus, SplitMix64};
use ai_state_tree::{
    BindingSource, CompareInt, Comparison, Event, EventDesc, EventPayload, ExecutionContext,
    NodeSpec, StateSpec, StateTreeBuilder, TransitionDelay, TransitionPriority, TransitionSpec,
};
use common::{entries, EventProbe, Log, Record};

#[test]
fn higher_priority_transition_wins() {
    let tree = StateTreeBuilder::new("priority")
        .state(
            StateSpec::new("Root")
                .transition(TransitionSpec::on_tick("D").priority(TransitionPriority::Medium)),
        )
        .child(
            "Root",
            StateSpec::new("A")
                .transition(TransitionSpec::on_tick("B"))
                .transition(TransitionSpec::on_tick("C").priority(TransitionPriority::High)),
        )
        .child("Root", StateSpec::new("B"))
        .child("Root", StateSpec::new("C"))
        .child("Root", StateSpec::new("D"))
        .build()
        .expect("valid tree");
    let mut ctx = ExecutionContext::new(tree);
    ctx.start(None, None);

    assert_eq!(ctx.tick(0.1), RunStatus::Running);
    assert_eq!(ctx.active_state_names(), vec!["Root", "C"]);
}

#[test]
fn event_transition_fires_once_per_event() {
    let log = Log::new();
    let tree = StateTreeBuilder::new("events")
        .state(StateSpec::new("Root"))
        .child(
            "Root",
            StateSpec::new("A")
                .task(Record::new(&log).node("a"))
                .transition(TransitionSpec::on_event(EventDesc::tag("go"), "B")),
        )
        .child("Root", StateSpec::new("B").task(Record::new(&log).node("b")))
        .build()
        .expect("valid tree");
    let mut ctx = ExecutionContext::new(tree);
    ctx.start(None, None);

    ctx.send_event(Event::new("other"));
    ctx.tick(0.1);
    assert_eq!(ctx.active_state_names(), vec!["Root", "A"]);
    // Events live for one tick.
    assert!(ctx.events().is_empty());

    ctx.send_event(Event::new("go"));
    ctx.tick(0.1);
    assert_eq!(ctx.active_state_names(), vec!["Root", "B"]);
    assert_eq!(
        log.take(),
        entries(&["a enter", "a tick", "a tick", "a exit", "b enter"])
    );
}

#[test]
fn event_payload_is_bound_into_transition_conditions() {
    let tree = StateTreeBuilder::new("payload")
        .state(StateSpec::new("Root"))
        .child(
            "Root",
            StateSpec::new("Wait").transition(
                TransitionSpec::on_event(EventDesc::tag("damage"), "Flee").condition(
                    NodeSpec::condition(
                        "heavy",
                        CompareInt::new(Comparison::Greater).with_operands(0, 3),
                    )
                    .bind("left", BindingSource::TransitionEvent(0)),
                ),
            ),
        )
        .child("Root", StateSpec::new("Flee"))
        .build()
        .expect("valid tree");
    let mut ctx = ExecutionContext::new(tree);
    ctx.start(None, None);

    let damage = |amount: i64| {
        Event::new("damage").with_payload(EventPayload::new(
            "Damage",
            PropertyBag::new().with("amount", amount),
        ))
    };

    ctx.send_event(damage(1));
    ctx.tick(0.1);
    assert_eq!(ctx.active_state_names(), vec!["Root", "Wait"]);

    ctx.send_event(damage(5));
    ctx.tick(0.1);
    assert_eq!(ctx.active_state_names(), vec!["Root", "Flee"]);
}

fn probed(log: &Log, consume: bool) -> ExecutionContext {
    let tree = StateTreeBuilder::new("consume")
        .global_task(EventProbe::node(log, "probe", TransitionPriority::Low))
        .state(StateSpec::new("Root"))
        .child(
            "Root",
            StateSpec::new("A").transition(
                TransitionSpec::on_event(EventDesc::tag("ping"), "B").consume_event(consume),
            ),
        )
        .child("Root", StateSpec::new("B"))
        .build()
        .expect("valid tree");
    let mut ctx = ExecutionContext::new(tree);
    ctx.start(None, None);
    ctx
}

#[test]
fn taken_event_transition_consumes_the_event() {
    let log = Log::new();
    let mut ctx = probed(&log, true);
    ctx.send_event(Event::new("ping"));
    ctx.tick(0.1);

    assert_eq!(ctx.active_state_names(), vec!["Root", "B"]);
    assert_eq!(log.take(), entries(&["probe saw 0"]));
}

#[test]
fn non_consuming_transition_leaves_the_event_for_lower_priorities() {
    let log = Log::new();
    let mut ctx = probed(&log, false);
    ctx.send_event(Event::new("ping"));
    ctx.tick(0.1);

    assert_eq!(ctx.active_state_names(), vec!["Root", "B"]);
    assert_eq!(log.take(), entries(&["probe saw 1"]));
}

fn delayed(delay: TransitionDelay) -> ExecutionContext {
    let log = Log::new();
    let tree = StateTreeBuilder::new("delay")
        .state(StateSpec::new("Root"))
        .child(
            "Root",
            StateSpec::new("A")
                .task(Record::new(&log).node("a"))
                .transition(TransitionSpec::on_tick("B").delay(delay)),
        )
        .child("Root", StateSpec::new("B").task(Record::new(&log).node("b")))
        .build()
        .expect("valid tree");
    let mut ctx = ExecutionContext::new(tree);
    ctx.start(None, None);
    ctx
}

#[test]
fn delayed_transition_fires_after_its_duration() {
    let mut ctx = delayed(TransitionDelay::new(1.0));

    ctx.tick(0.5);
    assert_eq!(ctx.delayed_transition_count(), 1);
    assert_eq!(ctx.active_state_names(), vec!["Root", "A"]);

    // Still pending; not registered twice.
    ctx.tick(0.5);
    assert_eq!(ctx.delayed_transition_count(), 1);
    assert_eq!(ctx.active_state_names(), vec!["Root", "A"]);

    ctx.tick(0.5);
    assert_eq!(ctx.active_state_names(), vec!["Root", "B"]);
    assert_eq!(ctx.delayed_transition_count(), 0);
}

#[test]
fn delayed_event_transition_registers_once_and_fires_later() {
    let log = Log::new();
    let tree = StateTreeBuilder::new("delayed-event")
        .state(StateSpec::new("Root"))
        .child(
            "Root",
            StateSpec::new("A")
                .task(Record::new(&log).node("a"))
                .transition(
                    TransitionSpec::on_event(EventDesc::tag("go"), "B")
                        .delay(TransitionDelay::new(1.0)),
                ),
        )
        .child("Root", StateSpec::new("B").task(Record::new(&log).node("b")))
        .build()
        .expect("valid tree");
    let mut ctx = ExecutionContext::new(tree);
    ctx.start(None, None);

    ctx.send_event(Event::new("go"));
    ctx.tick(0.5);
    assert_eq!(ctx.delayed_transition_count(), 1);

    // The same event again while pending does not add a second record.
    ctx.send_event(Event::new("go"));
    ctx.tick(0.5);
    assert_eq!(ctx.delayed_transition_count(), 1);
    assert_eq!(ctx.active_state_names(), vec!["Root", "A"]);

    ctx.tick(0.5);
    assert_eq!(ctx.active_state_names(), vec!["Root", "B"]);
    assert_eq!(ctx.delayed_transition_count(), 0);
}

#[test]
fn delay_fires_on_the_tick_its_elapsed_time_reaches_the_duration() {
    let mut ctx = delayed(TransitionDelay::new(0.3));

    // Registered on the first tick, then 0.1 elapses per tick.
    for _ in 0..3 {
        ctx.tick(0.1);
        assert_eq!(ctx.active_state_names(), vec!["Root", "A"]);
    }
    ctx.tick(0.1);
    assert_eq!(ctx.active_state_names(), vec!["Root", "B"]);
}

#[test]
fn delay_jitter_stays_within_the_variance() {
    let delay = TransitionDelay::new(1.0).with_variance(0.25);
    let mut rng = SplitMix64::new(9);
    let samples: Vec<f32> = (0..64).map(|_| delay.sample(&mut rng)).collect();

    assert!(samples.iter().all(|d| (0.75..=1.25).contains(d)));
    assert!(samples.windows(2).any(|pair| pair[0] != pair[1]));

    let mut again = SplitMix64::new(9);
    assert_eq!(delay.sample(&mut again), samples[0]);

    let clamped = TransitionDelay::new(0.1).with_variance(1.0);
    assert!((0..64).all(|_| clamped.sample(&mut rng) >= 0.0));
}

#[test]
fn jittered_delay_fires_within_its_window() {
    let mut ctx = delayed(TransitionDelay::new(1.0).with_variance(0.5));

    let mut ticks = 0;
    while ctx.active_state_names() != vec!["Root", "B"] {
        ctx.tick(0.1);
        ticks += 1;
        assert!(ticks <= 20, "delay never fired");
    }
    // One tick registers, then between 0.5 and 1.5 seconds elapse.
    assert!((6..=17).contains(&ticks), "fired after {ticks} ticks");
}

#[test]
fn zero_delay_fires_immediately() {
    let mut ctx = delayed(TransitionDelay::new(0.0));

    ctx.tick(0.1);
    assert_eq!(ctx.active_state_names(), vec!["Root", "B"]);
    assert_eq!(ctx.delayed_transition_count(), 0);
}

#[test]
fn failed_leaf_without_transitions_reselects_the_root() {
    let log = Log::new();
    let tree = StateTreeBuilder::new("retry")
        .state(StateSpec::new("Root"))
        .child(
            "Root",
            StateSpec::new("A").task(Record::new(&log).fails_after(1).node("a")),
        )
        .build()
        .expect("valid tree");
    let mut ctx = ExecutionContext::new(tree);
    ctx.start(None, None);
    log.take();

    assert_eq!(ctx.tick(0.1), RunStatus::Running);
    assert_eq!(
        log.take(),
        entries(&["a tick", "a completed", "a exit", "a enter"])
    );
    assert_eq!(ctx.active_state_names(), vec!["Root", "A"]);
}
