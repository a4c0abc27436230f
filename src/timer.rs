//! Timers as machines.
//!
//! A timer is an ordinary machine that sends
//! [`EventKind::TIMER_ELAPSED`] to its client and halts. Production uses a
//! wall-clock timer whose elapse is routed through the client's inbox like
//! any other send; user code never runs on the timer's thread. Under the
//! controlled backend the timer is replaced by a nondeterministic stub
//! that may elapse at any scheduling point, exposing timing interleavings
//! to the strategy.

use crate::error::{Failure, Result};
use crate::event::{Event, EventKind};
use crate::machine::{ActionCx, DeclBuilder, MachineLogic};
use crate::runtime::MachineSpawn;
use crate::types::{MachineId, MachineKind};
use std::time::Duration;

/// Kind of the arming event a timer machine is created with.
pub const START_TIMER: EventKind = EventKind::new("start_timer");

/// Payload of the arming event.
#[derive(Debug, Clone)]
pub struct TimerRequest {
    /// Machine to notify on elapse.
    pub client: MachineId,
    /// Requested delay (ignored by the controlled stub).
    pub delay: Duration,
}

/// Starts a timer for the calling machine.
///
/// Returns the timer machine's id. The client receives one
/// [`EventKind::TIMER_ELAPSED`] event; under the controlled backend its
/// timing is a scheduling choice.
pub fn start_timer(cx: &mut ActionCx<'_>, delay: Duration) -> Result<MachineId> {
    let request = TimerRequest {
        client: cx.self_id().clone(),
        delay,
    };
    let init = Event::with_payload(START_TIMER, request);
    let spawn = if cx.runtime().is_controlled() {
        MachineSpawn::of::<TimerStub>(
            MachineKind::TimerStub,
            None,
            Some(init),
            cx.operation_group_id(),
        )
    } else {
        MachineSpawn::of::<WallClockTimer>(
            MachineKind::Regular,
            None,
            Some(init),
            cx.operation_group_id(),
        )
    };
    cx.runtime().spawn_machine(spawn)
}

fn request_from(event: &Event) -> Result<TimerRequest> {
    event
        .payload::<TimerRequest>()
        .cloned()
        .ok_or_else(|| Failure::assertion("timer armed without a TimerRequest payload"))
}

/// Production timer: sleeps on its own handler thread, then sends the
/// elapse through the client's inbox.
#[derive(Default)]
pub struct WallClockTimer;

impl MachineLogic for WallClockTimer {
    const NAME: &'static str = "Timer";

    fn configure(decl: &mut DeclBuilder<Self>) {
        decl.state("Armed").start().on_entry(|_m, cx, ev| {
            let request = request_from(ev)?;
            std::thread::sleep(request.delay);
            cx.send(&request.client, Event::new(EventKind::TIMER_ELAPSED))?;
            cx.halt()
        });
    }
}

/// Controlled-mode timer stub: elapses when the strategy says so.
///
/// The default handler keeps the stub schedulable at every point; each
/// time it runs, a nondeterministic boolean decides whether the timer
/// fires now.
#[derive(Default)]
pub struct TimerStub {
    request: Option<TimerRequest>,
}

impl MachineLogic for TimerStub {
    const NAME: &'static str = "TimerStub";

    fn configure(decl: &mut DeclBuilder<Self>) {
        decl.state("Armed")
            .start()
            .on_entry(|m, _cx, ev| {
                m.request = Some(request_from(ev)?);
                Ok(())
            })
            .on(EventKind::DEFAULT, |m, cx, _ev| {
                if cx.random_bool(2)? {
                    let request = m
                        .request
                        .clone()
                        .ok_or_else(|| Failure::assertion("timer stub fired before arming"))?;
                    cx.send(&request.client, Event::new(EventKind::TIMER_ELAPSED))?;
                    cx.halt()?;
                }
                Ok(())
            });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::decl::MachineDecl;
    use crate::types::StateName;

    #[test]
    fn timer_declarations_build() {
        let timer = MachineDecl::<WallClockTimer>::build().unwrap();
        assert_eq!(timer.start_state(), StateName::new("Armed"));

        let stub = MachineDecl::<TimerStub>::build().unwrap();
        let armed = stub.state(StateName::new("Armed")).unwrap();
        assert!(armed.handles(EventKind::DEFAULT));
    }

    #[test]
    fn request_payload_round_trip() {
        let request = TimerRequest {
            client: MachineId::new_for_test(3, "Client"),
            delay: Duration::from_millis(5),
        };
        let event = Event::with_payload(START_TIMER, request);
        let back = request_from(&event).unwrap();
        assert_eq!(back.client.value(), 3);
        assert_eq!(back.delay, Duration::from_millis(5));
    }

    #[test]
    fn missing_payload_is_an_error() {
        let event = Event::new(START_TIMER);
        assert!(request_from(&event).is_err());
    }
}
