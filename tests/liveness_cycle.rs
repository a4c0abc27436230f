//! Liveness: a monitor stuck in a hot state across a program-state cycle
//! (or at deadlock) is a bug.

mod common;

use machina::machine::{DeclBuilder, MachineLogic};
use machina::{Event, EventKind, Failure, TestConfig, TestEngine};

const STARTED: EventKind = EventKind::new("Started");
const DONE: EventKind = EventKind::new("Done");
const TICK: EventKind = EventKind::new("Tick");

/// Hot while a started request is unserved.
#[derive(Default)]
struct Progress;

impl MachineLogic for Progress {
    const NAME: &'static str = "Progress";

    fn configure(decl: &mut DeclBuilder<Self>) {
        decl.state("Idle").start().on_goto(STARTED, "Pending");
        decl.state("Pending").hot().on_goto(DONE, "Served");
        decl.state("Served").cold().on_goto(STARTED, "Pending");
    }
}

/// Loops forever sending itself ticks; never produces `Done`.
#[derive(Default)]
struct Spinner;

impl MachineLogic for Spinner {
    const NAME: &'static str = "Spinner";

    fn configure(decl: &mut DeclBuilder<Self>) {
        decl.state("Loop")
            .start()
            .on_entry(|_m, cx, _ev| {
                let me = cx.self_id().clone();
                cx.send(&me, Event::new(TICK))
            })
            .on(TICK, |_m, cx, _ev| {
                let me = cx.self_id().clone();
                cx.send(&me, Event::new(TICK))
            });
    }
}

#[test]
fn hot_cycle_is_a_liveness_bug() {
    common::init_logging();
    let mut engine = TestEngine::new(
        TestConfig::new(17)
            .max_steps(200)
            .liveness_checking(true)
            .cycle_detection(true),
    )
    .unwrap();

    let report = engine.run(|rt| {
        rt.register_monitor::<Progress>()?;
        rt.invoke_monitor::<Progress>(&Event::new(STARTED))?;
        rt.create_machine::<Spinner>(None)?;
        Ok(())
    });

    let bug = report.first_bug().expect("hot cycle should be detected");
    match &bug.failure {
        Failure::Liveness { monitor, .. } => assert_eq!(*monitor, "Progress"),
        other => panic!("expected a liveness violation, got {other}"),
    }
}

#[test]
fn discharged_obligation_is_not_a_bug() {
    common::init_logging();
    let mut engine = TestEngine::new(
        TestConfig::new(17)
            .max_steps(200)
            .liveness_checking(true)
            .cycle_detection(true),
    )
    .unwrap();

    // The monitor goes hot and immediately cold again; the spinner's cycle
    // is then benign (the step bound ends the iteration, not a bug).
    let report = engine.run(|rt| {
        rt.register_monitor::<Progress>()?;
        rt.invoke_monitor::<Progress>(&Event::new(STARTED))?;
        rt.invoke_monitor::<Progress>(&Event::new(DONE))?;
        rt.create_machine::<Spinner>(None)?;
        Ok(())
    });

    assert!(!report.found_bug(), "{report}");
    assert_eq!(report.max_steps_hits, 1, "spinner runs to the step bound");
}

#[test]
fn deadlock_with_hot_monitor_is_a_liveness_bug() {
    common::init_logging();

    // A machine that blocks in receive forever.
    #[derive(Default)]
    struct Stuck;

    impl MachineLogic for Stuck {
        const NAME: &'static str = "Stuck";

        fn configure(decl: &mut DeclBuilder<Self>) {
            decl.state("Waiting").start().on_entry(|_m, cx, _ev| {
                let _never = cx.receive(&[DONE])?;
                Ok(())
            });
        }
    }

    let mut engine =
        TestEngine::new(TestConfig::new(23).max_steps(500).liveness_checking(true)).unwrap();
    let report = engine.run(|rt| {
        rt.register_monitor::<Progress>()?;
        rt.invoke_monitor::<Progress>(&Event::new(STARTED))?;
        rt.create_machine::<Stuck>(None)?;
        Ok(())
    });

    let bug = report.first_bug().expect("deadlock with hot monitor");
    assert!(
        matches!(bug.failure, Failure::Liveness { monitor, .. } if monitor == "Progress"),
        "got {}",
        bug.failure
    );
}

#[test]
fn deadlock_without_hot_monitor_completes_normally() {
    common::init_logging();

    #[derive(Default)]
    struct Stuck;

    impl MachineLogic for Stuck {
        const NAME: &'static str = "Stuck";

        fn configure(decl: &mut DeclBuilder<Self>) {
            decl.state("Waiting").start().on_entry(|_m, cx, _ev| {
                let _never = cx.receive(&[DONE])?;
                Ok(())
            });
        }
    }

    let mut engine =
        TestEngine::new(TestConfig::new(29).max_steps(500).liveness_checking(true)).unwrap();
    let report = engine.run(|rt| {
        rt.create_machine::<Stuck>(None)?;
        Ok(())
    });

    assert!(!report.found_bug(), "{report}");
    assert_eq!(report.max_steps_hits, 0, "quiescent completion, not a bound hit");
}
