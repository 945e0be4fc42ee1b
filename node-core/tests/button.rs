mod support;

use embassy_futures::join::join;
use embassy_futures::select::{Either, Either3, select, select3};
use embassy_futures::{block_on, yield_now};
use node_core::button::{ButtonOutcome, ButtonState, InterruptFlag, ShutdownLatch};
use node_core::connectivity::{Association, AssociationHook, PollVerdict};
use node_core::cycle::PassOutcome;
use node_core::events::EventKind;
use node_core::power::{InterruptCause, PowerRail, prepare_power};

use support::{
    Action, Bench, BenchEvents, MockPower, button, config, connectivity, cycle, is_event,
    online_bench,
};

#[test]
fn quiet_flag_does_not_touch_the_pmu() {
    let bench = Bench::new();
    let config = config();
    let (flag, latch) = (InterruptFlag::new(), ShutdownLatch::new());
    let mut handler = button(&bench, &config, &flag, &latch);

    assert_eq!(block_on(handler.service_once()), ButtonOutcome::Quiet);
    assert!(bench.timeline().is_empty());
}

#[test]
fn short_presses_never_shut_down_and_rearm_the_source() {
    let bench = Bench::new();
    let config = config();
    let (flag, latch) = (InterruptFlag::new(), ShutdownLatch::new());
    let mut handler = button(&bench, &config, &flag, &latch);

    for _ in 0..5 {
        bench.press(InterruptCause::ShortPress, &flag);
        assert_eq!(
            block_on(handler.service_once()),
            ButtonOutcome::Handled(InterruptCause::ShortPress)
        );
        assert_eq!(handler.state(), ButtonState::Idle);
        assert!(!flag.is_raised(), "flag must be consumed by the handler");
        assert_eq!(
            bench.with(|state| state.pending_cause),
            InterruptCause::None,
            "source must be acknowledged after every press"
        );
    }

    assert_eq!(bench.count(|a| *a == Action::Shutdown), 0);
    assert_eq!(bench.count_events(EventKind::ShortPress), 5);
    assert_eq!(bench.count(|a| *a == Action::ClearInterrupt), 5);
    assert!(!latch.is_engaged());

    // Source still fires after the short presses.
    bench.press(InterruptCause::LongPress, &flag);
    assert_eq!(
        block_on(handler.service_once()),
        ButtonOutcome::ShutdownIssued
    );
}

#[test]
fn classification_is_always_followed_by_clear() {
    let bench = Bench::new();
    let config = config();
    let (flag, latch) = (InterruptFlag::new(), ShutdownLatch::new());
    let mut handler = button(&bench, &config, &flag, &latch);

    for cause in [
        InterruptCause::None,
        InterruptCause::ShortPress,
        InterruptCause::LongPress,
    ] {
        bench.press(cause, &flag);
        block_on(handler.service_once());
    }

    let timeline = bench.timeline();
    let pmu: Vec<&Action> = timeline
        .iter()
        .filter(|a| matches!(a, Action::Classify(_) | Action::ClearInterrupt))
        .collect();
    assert_eq!(pmu.len(), 6);
    for pair in pmu.chunks(2) {
        assert!(matches!(pair[0], Action::Classify(_)));
        assert_eq!(*pair[1], Action::ClearInterrupt);
    }
    assert_eq!(bench.count_events(EventKind::SpuriousInterrupt), 1);
}

#[test]
fn long_press_waits_grace_then_shuts_down_once() {
    let bench = Bench::new();
    let config = config();
    let (flag, latch) = (InterruptFlag::new(), ShutdownLatch::new());
    let mut handler = button(&bench, &config, &flag, &latch);

    bench.press(InterruptCause::LongPress, &flag);
    assert_eq!(
        block_on(handler.service_once()),
        ButtonOutcome::ShutdownIssued
    );
    assert_eq!(handler.state(), ButtonState::ShuttingDown);
    assert!(latch.is_engaged());
    assert_eq!(
        bench.with(|state| state.clock_ns),
        100_000_000,
        "shutdown must wait one grace period after logging"
    );

    // Terminal: further edges are ignored.
    bench.press(InterruptCause::LongPress, &flag);
    assert_eq!(
        block_on(handler.service_once()),
        ButtonOutcome::ShutdownIssued
    );
    assert_eq!(bench.count(|a| *a == Action::Shutdown), 1);

    let long = bench.position(is_event(EventKind::LongPress)).unwrap();
    let shutdown = bench.position(|a| *a == Action::Shutdown).unwrap();
    assert!(long < shutdown);
}

#[test]
fn long_press_preempts_a_cycle_about_to_publish() {
    let bench = online_bench();
    let config = config();
    let (flag, latch) = (InterruptFlag::new(), ShutdownLatch::new());
    let mut cycle = cycle(&bench, &config, &latch);
    let mut handler = button(&bench, &config, &flag, &latch);

    bench.press(InterruptCause::LongPress, &flag);
    let (cycle_outcome, ()) = block_on(join(cycle.run(), handler.run()));

    assert_eq!(cycle_outcome, PassOutcome::ShuttingDown);
    let timeline = bench.timeline();
    let classified = timeline
        .iter()
        .position(|a| *a == Action::Classify(InterruptCause::LongPress))
        .unwrap();
    for action in &timeline[classified..] {
        assert!(
            !matches!(
                action,
                Action::SensorRead
                    | Action::BatteryRead
                    | Action::PublishAttempt { .. }
                    | Action::DeepSleep(_)
            ),
            "cycle work observed after long press: {action:?}"
        );
    }
    assert_eq!(timeline.last(), Some(&Action::Shutdown));
    assert_eq!(bench.retained(), 1);
}

#[test]
fn long_press_during_session_backoff_shuts_down_independently() {
    let bench = Bench::new();
    bench.with(|state| {
        state.associated = true;
        state.session_rejections = u32::MAX;
    });
    let config = config();
    let (flag, latch) = (InterruptFlag::new(), ShutdownLatch::new());
    let mut cycle = cycle(&bench, &config, &latch);
    let mut handler = button(&bench, &config, &flag, &latch);

    let operator = async {
        while bench.count_events(EventKind::SessionRejected) < 2 {
            yield_now().await;
        }
        bench.press(InterruptCause::LongPress, &flag);
        core::future::pending::<()>().await;
    };

    let winner = block_on(select3(cycle.run(), handler.run(), operator));

    assert!(
        matches!(winner, Either3::Second(())),
        "button task must finish while the cycle is still retrying"
    );
    assert_eq!(bench.count(|a| *a == Action::Shutdown), 1);
    assert_eq!(
        bench.count(|a| matches!(a, Action::SensorRead | Action::PublishAttempt { .. })),
        0
    );
    let rejected = bench.position(is_event(EventKind::SessionRejected)).unwrap();
    let long = bench.position(is_event(EventKind::LongPress)).unwrap();
    assert!(rejected < long);
}

#[test]
fn setup_association_services_long_press_inline() {
    let bench = Bench::new();
    bench.with(|state| state.association_latency_ns = None);
    let config = config();
    let (flag, latch) = (InterruptFlag::new(), ShutdownLatch::new());
    let mut manager = connectivity(&bench, &config);
    let mut handler = button(&bench, &config, &flag, &latch);
    let mut events = BenchEvents(bench.clone());

    let association = block_on(async {
        let associate = manager.ensure_associated(&config.wifi, &mut handler, &mut events);
        let operator = async {
            while bench.count_events(EventKind::AssociationPoll) < 3 {
                yield_now().await;
            }
            bench.press(InterruptCause::LongPress, &flag);
            core::future::pending::<()>().await;
        };
        match select(associate, operator).await {
            Either::First(association) => association,
            Either::Second(()) => unreachable!(),
        }
    });

    assert_eq!(association, Association::Aborted);
    assert_eq!(bench.count(|a| *a == Action::Shutdown), 1);
    assert!(bench.count_events(EventKind::AssociationPoll) >= 3);
}

#[test]
fn short_press_during_setup_keeps_polling() {
    let bench = Bench::new();
    bench.with(|state| state.association_latency_ns = Some(1_500_000_000));
    let config = config();
    let (flag, latch) = (InterruptFlag::new(), ShutdownLatch::new());
    let mut handler = button(&bench, &config, &flag, &latch);

    bench.press(InterruptCause::ShortPress, &flag);
    assert_eq!(
        block_on(handler.on_poll()),
        PollVerdict::Continue
    );

    let mut manager = connectivity(&bench, &config);
    let mut events = BenchEvents(bench.clone());
    let association = block_on(manager.ensure_associated(&config.wifi, &mut handler, &mut events));
    assert!(matches!(association, Association::Associated { polls: 3, .. }));
    assert_eq!(bench.count(|a| *a == Action::Shutdown), 0);
}

#[test]
fn boot_power_preparation_disables_unused_rails_and_arms_long_press() {
    let bench = Bench::new();
    let mut power = MockPower(bench.clone());

    prepare_power(&mut power);

    assert_eq!(
        bench.timeline(),
        vec![
            Action::Rail(PowerRail::Lora, false),
            Action::Rail(PowerRail::Gps, false),
            Action::ClearInterrupt,
            Action::LongPressArmed,
        ]
    );
}
