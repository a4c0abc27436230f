//! Blocking receive: a machine suspended in `receive` resumes when a
//! matching event is enqueued, consuming it directly.

mod common;

use machina::machine::{DeclBuilder, MachineLogic};
use machina::{Event, EventKind, Failure, MachineId, TestConfig, TestEngine};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

const R: EventKind = EventKind::new("R");
const NOISE: EventKind = EventKind::new("Noise");
const SETUP: EventKind = EventKind::new("Setup");

#[derive(Default)]
struct Receiver {
    observed: Option<Arc<AtomicU32>>,
}

impl MachineLogic for Receiver {
    const NAME: &'static str = "Receiver";

    fn configure(decl: &mut DeclBuilder<Self>) {
        decl.state("Waiting").start().on_entry(|m, cx, ev| {
            m.observed = ev.payload::<Arc<AtomicU32>>().cloned();
            let received = cx.receive(&[R])?;
            cx.assert(received.kind() == R, "receive returned the wrong kind")?;
            if let Some(observed) = &m.observed {
                observed.fetch_add(1, Ordering::SeqCst);
            }
            cx.halt()
        });
    }
}

#[derive(Default)]
struct Sender;

impl MachineLogic for Sender {
    const NAME: &'static str = "Sender";

    fn configure(decl: &mut DeclBuilder<Self>) {
        decl.state("Go").start().on_entry(|_m, cx, ev| {
            let target = ev
                .payload::<MachineId>()
                .cloned()
                .ok_or_else(|| Failure::assertion("sender needs a target"))?;
            cx.send(&target, Event::new(R))?;
            cx.halt()
        });
    }
}

#[test]
fn receive_unblocks_on_matching_send() {
    common::init_logging();
    let observed = Arc::new(AtomicU32::new(0));
    let observed_entry = observed.clone();

    let mut engine = TestEngine::new(TestConfig::new(31).iterations(15)).unwrap();
    let report = engine.run(move |rt| {
        let receiver = rt
            .create_machine::<Receiver>(Some(Event::with_payload(SETUP, observed_entry.clone())))?;
        rt.create_machine::<Sender>(Some(Event::with_payload(SETUP, receiver)))?;
        Ok(())
    });

    assert!(!report.found_bug(), "{report}");
    assert_eq!(
        observed.load(Ordering::SeqCst),
        15,
        "the receive consumed R in every schedule"
    );
}

#[test]
fn receive_takes_matching_event_already_queued() {
    common::init_logging();
    let observed = Arc::new(AtomicU32::new(0));
    let observed_entry = observed.clone();

    // The harness sends R before the receiver's entry runs in some
    // schedules; begin_receive must then find it in the queue.
    let mut engine = TestEngine::new(TestConfig::new(37).iterations(15)).unwrap();
    let report = engine.run(move |rt| {
        let receiver = rt
            .create_machine::<Receiver>(Some(Event::with_payload(SETUP, observed_entry.clone())))?;
        rt.send_event(&receiver, Event::new(R))?;
        Ok(())
    });

    assert!(!report.found_bug(), "{report}");
    assert_eq!(observed.load(Ordering::SeqCst), 15);
}

#[test]
fn non_matching_sends_do_not_unblock_receive() {
    common::init_logging();

    #[derive(Default)]
    struct PickyReceiver;

    impl MachineLogic for PickyReceiver {
        const NAME: &'static str = "PickyReceiver";

        fn configure(decl: &mut DeclBuilder<Self>) {
            decl.state("Waiting").start().on_entry(|_m, cx, _ev| {
                let received = cx.receive(&[R])?;
                cx.assert(received.kind() == R, "wrong kind delivered")?;
                cx.halt()
            });
        }
    }

    let mut engine = TestEngine::new(TestConfig::new(41).iterations(10)).unwrap();
    let report = engine.run(|rt| {
        let receiver = rt.create_machine::<PickyReceiver>(None)?;
        rt.send_event(&receiver, Event::new(NOISE))?;
        rt.send_event(&receiver, Event::new(R))?;
        Ok(())
    });

    // The noise event stays queued past the halt (it is not must-handle),
    // and the receive consumes only R.
    assert!(!report.found_bug(), "{report}");
}
