//! Deferred events stay queued until a state stops deferring them, and
//! order within non-deferred kinds is preserved.
//!
//! Machine in state `A` defers `X` and handles `Y`; inbox `[X, Y]` yields
//! `Y` first, then after the transition to `B` (which handles `X`) the
//! deferred `X` is dequeued. No events are dropped.

mod common;

use machina::machine::{DeclBuilder, MachineLogic};
use machina::{Event, EventKind, Failure, TestConfig, TestEngine};
use std::sync::{Arc, Mutex};

const X: EventKind = EventKind::new("X");
const Y: EventKind = EventKind::new("Y");
const SETUP: EventKind = EventKind::new("Setup");

type Log = Arc<Mutex<Vec<&'static str>>>;

#[derive(Default)]
struct Deferrer {
    log: Option<Log>,
}

impl Deferrer {
    fn record(&self, entry: &'static str) {
        if let Some(log) = &self.log {
            log.lock().unwrap().push(entry);
        }
    }
}

impl MachineLogic for Deferrer {
    const NAME: &'static str = "Deferrer";

    fn configure(decl: &mut DeclBuilder<Self>) {
        decl.state("A")
            .start()
            .defer(X)
            .on_entry(|m, _cx, ev| {
                m.log = ev.payload::<Log>().cloned();
                Ok(())
            })
            .on_goto_with(Y, "B", |m, _cx, _ev| {
                m.record("Y");
                Ok(())
            });
        decl.state("B").on(X, |m, cx, _ev| {
            m.record("X");
            cx.halt()
        });
    }
}

#[test]
fn deferred_event_waits_for_state_change() {
    common::init_logging();
    let log: Log = Arc::new(Mutex::new(Vec::new()));
    let log_for_entry = log.clone();

    let mut engine = TestEngine::new(TestConfig::new(21)).unwrap();
    let report = engine.run(move |rt| {
        let machine =
            rt.create_machine::<Deferrer>(Some(Event::with_payload(SETUP, log_for_entry.clone())))?;
        // Enqueued in this order; X is deferred in state A.
        rt.send_event(&machine, Event::new(X))?;
        rt.send_event(&machine, Event::new(Y))?;
        Ok(())
    });

    assert!(!report.found_bug(), "{report}");
    assert_eq!(
        log.lock().unwrap().as_slice(),
        ["Y", "X"],
        "Y handled first, deferred X after the transition"
    );
}

#[test]
fn deferral_holds_across_many_schedules() {
    common::init_logging();
    let log: Log = Arc::new(Mutex::new(Vec::new()));
    let log_for_entry = log.clone();

    let mut engine = TestEngine::new(TestConfig::new(33).iterations(20)).unwrap();
    let report = engine.run(move |rt| {
        let machine =
            rt.create_machine::<Deferrer>(Some(Event::with_payload(SETUP, log_for_entry.clone())))?;
        rt.send_event(&machine, Event::new(X))?;
        rt.send_event(&machine, Event::new(Y))?;
        Ok(())
    });

    assert!(!report.found_bug(), "{report}");
    let log = log.lock().unwrap();
    assert_eq!(log.len(), 40, "no events dropped in any schedule");
    for pair in log.chunks(2) {
        assert_eq!(pair, ["Y", "X"], "order holds in every schedule");
    }
}

#[test]
fn ignored_events_are_dropped_silently() {
    common::init_logging();

    #[derive(Default)]
    struct Ignorer;

    impl MachineLogic for Ignorer {
        const NAME: &'static str = "Ignorer";

        fn configure(decl: &mut DeclBuilder<Self>) {
            decl.state("S")
                .start()
                .ignore(X)
                .on(Y, |_m, cx, _ev| cx.halt());
        }
    }

    let mut engine = TestEngine::new(TestConfig::new(2).iterations(5)).unwrap();
    let report = engine.run(|rt| {
        let machine = rt.create_machine::<Ignorer>(None)?;
        rt.send_event(&machine, Event::new(X))?;
        rt.send_event(&machine, Event::new(Y))?;
        Ok(())
    });
    // X is dropped at dequeue without a handler and without a bug.
    assert!(!report.found_bug(), "{report}");
}

#[test]
fn unhandled_event_is_a_bug() {
    common::init_logging();

    #[derive(Default)]
    struct Narrow;

    impl MachineLogic for Narrow {
        const NAME: &'static str = "Narrow";

        fn configure(decl: &mut DeclBuilder<Self>) {
            decl.state("S").start().on(Y, |_m, _cx, _ev| Ok(()));
        }
    }

    let mut engine = TestEngine::new(TestConfig::new(4)).unwrap();
    let report = engine.run(|rt| {
        let machine = rt.create_machine::<Narrow>(None)?;
        rt.send_event(&machine, Event::new(X))?;
        Ok(())
    });

    let bug = report.first_bug().expect("unhandled event is a bug");
    assert!(
        matches!(bug.failure, Failure::UnhandledEvent { kind, .. } if kind == X),
        "got {}",
        bug.failure
    );
}
