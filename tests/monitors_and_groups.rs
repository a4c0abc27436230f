//! Monitors observing sends, registration idempotence, and operation-group
//! propagation across causally related sends.

mod common;

use machina::machine::{DeclBuilder, MachineLogic};
use machina::{
    Event, EventKind, Failure, MachineId, OperationGroupId, SendOptions, TestConfig, TestEngine,
};

const ORDER: EventKind = EventKind::new("Order");
const SHIPPED: EventKind = EventKind::new("Shipped");
const SETUP: EventKind = EventKind::new("Setup");

/// Safety monitor: every order must ship before the next order.
#[derive(Default)]
struct OrderMonitor;

impl MachineLogic for OrderMonitor {
    const NAME: &'static str = "OrderMonitor";

    fn configure(decl: &mut DeclBuilder<Self>) {
        decl.observes(&[ORDER, SHIPPED]);
        decl.state("Quiet")
            .start()
            .on_goto(ORDER, "Open")
            .on(SHIPPED, |_m, cx, _ev| {
                cx.assert(false, "shipment without an order")
            });
        decl.state("Open")
            .on_goto(SHIPPED, "Quiet")
            .on(ORDER, |_m, cx, _ev| {
                cx.assert(false, "second order before shipment")
            });
    }
}

#[derive(Default)]
struct Warehouse;

impl MachineLogic for Warehouse {
    const NAME: &'static str = "Warehouse";

    fn configure(decl: &mut DeclBuilder<Self>) {
        decl.state("Stocked").start().on(ORDER, |_m, cx, ev| {
            let buyer = ev
                .origin()
                .map(|origin| origin.sender.clone())
                .ok_or_else(|| Failure::assertion("order without origin"))?;
            cx.send(&buyer, Event::new(SHIPPED))
        });
    }
}

#[derive(Default)]
struct Buyer {
    expected_group: Option<OperationGroupId>,
}

impl MachineLogic for Buyer {
    const NAME: &'static str = "Buyer";

    fn configure(decl: &mut DeclBuilder<Self>) {
        decl.state("Shopping")
            .start()
            .on_entry(|m, cx, ev| {
                let (warehouse, group) = ev
                    .payload::<(MachineId, OperationGroupId)>()
                    .cloned()
                    .ok_or_else(|| Failure::assertion("buyer without setup"))?;
                m.expected_group = Some(group);
                cx.send_with(
                    &warehouse,
                    Event::new(ORDER),
                    SendOptions::new().with_group(group),
                )
            })
            .on(SHIPPED, |m, cx, ev| {
                // The group chosen at the original send rode through the
                // warehouse and back on the causally related reply.
                let expected = m
                    .expected_group
                    .ok_or_else(|| Failure::assertion("no expected group"))?;
                cx.assert(
                    ev.operation_group_id() == expected,
                    "operation group was not propagated",
                )?;
                cx.assert(
                    cx.operation_group_id() == expected,
                    "dequeue did not adopt the event's group",
                )?;
                cx.halt()
            });
    }
}

#[test]
fn operation_group_rides_causally_related_sends() {
    common::init_logging();
    let mut engine = TestEngine::new(TestConfig::new(51).iterations(10)).unwrap();
    let report = engine.run(|rt| {
        let group = rt.new_operation_group();
        let warehouse = rt.create_machine::<Warehouse>(None)?;
        rt.create_machine::<Buyer>(Some(Event::with_payload(SETUP, (warehouse, group))))?;
        Ok(())
    });
    assert!(!report.found_bug(), "{report}");
}

#[test]
fn observing_monitor_sees_forwarded_sends() {
    common::init_logging();
    let mut engine = TestEngine::new(TestConfig::new(53).iterations(10)).unwrap();
    let report = engine.run(|rt| {
        rt.register_monitor::<OrderMonitor>()?;
        let warehouse = rt.create_machine::<Warehouse>(None)?;
        rt.create_machine::<Buyer>(Some(Event::with_payload(
            SETUP,
            (warehouse, OperationGroupId::from_raw(9)),
        )))?;
        Ok(())
    });
    // One order, one shipment: the monitor's protocol is satisfied.
    assert!(!report.found_bug(), "{report}");
}

#[test]
fn monitor_catches_protocol_violation() {
    common::init_logging();

    /// Sends two orders without awaiting shipment.
    #[derive(Default)]
    struct Impatient;

    impl MachineLogic for Impatient {
        const NAME: &'static str = "Impatient";

        fn configure(decl: &mut DeclBuilder<Self>) {
            decl.state("Go").start().on_entry(|_m, cx, ev| {
                let warehouse = ev
                    .payload::<MachineId>()
                    .cloned()
                    .ok_or_else(|| Failure::assertion("no warehouse"))?;
                cx.send(&warehouse, Event::new(ORDER))?;
                cx.send(&warehouse, Event::new(ORDER))?;
                cx.halt()
            });
        }
    }

    // The violating schedule keeps the impatient buyer running across both
    // sends; explore enough schedules to hit it.
    let mut engine = TestEngine::new(TestConfig::new(55).iterations(40)).unwrap();
    let report = engine.run(|rt| {
        rt.register_monitor::<OrderMonitor>()?;
        let warehouse = rt.create_machine::<Warehouse>(None)?;
        rt.create_machine::<Impatient>(Some(Event::with_payload(SETUP, warehouse)))?;
        Ok(())
    });

    let bug = report.first_bug().expect("double order is caught");
    assert!(
        matches!(&bug.failure, Failure::Assertion { message, .. }
            if message.contains("second order")),
        "got {}",
        bug.failure
    );
}

#[test]
fn monitor_registration_is_idempotent() {
    common::init_logging();
    let mut engine = TestEngine::new(TestConfig::new(57)).unwrap();
    let report = engine.run(|rt| {
        rt.register_monitor::<OrderMonitor>()?;
        rt.register_monitor::<OrderMonitor>()?;
        rt.invoke_monitor::<OrderMonitor>(&Event::new(ORDER))?;
        Ok(())
    });
    assert!(!report.found_bug(), "{report}");
}
