//! End-to-end scenario 6 (spec §8): three timers installed out of deadline
//! order must fire in deadline order, each exactly once, never early.

use machine::test_support::{TestAlarm, TestClock};
use nucleus::timer::TimerEngine;

use std::sync::{Arc, Mutex};

#[test]
fn three_timers_installed_out_of_order_fire_in_deadline_order() {
    let clock = TestClock::new(0);
    let alarm = TestAlarm::new();
    let engine = TimerEngine::new(&alarm, &clock);

    let order = Arc::new(Mutex::new(Vec::new()));
    for (label, deadline) in [("T+100", 100u64), ("T+50", 50u64), ("T+150", 150u64)] {
        let order = order.clone();
        engine.install(
            deadline,
            Box::new(move |r| {
                assert!(r.is_ok());
                order.lock().unwrap().push(label);
            }),
        );
    }

    // The earliest deadline seen so far is armed on the hardware alarm.
    assert_eq!(alarm.armed_deadline(), Some(50));

    // Before any deadline has passed, nothing may fire.
    clock.set(10);
    engine.progress();
    assert!(order.lock().unwrap().is_empty());

    clock.set(60);
    engine.progress();
    assert_eq!(*order.lock().unwrap(), vec!["T+50"]);
    assert_eq!(alarm.armed_deadline(), Some(100));

    clock.set(200);
    engine.progress();
    assert_eq!(*order.lock().unwrap(), vec!["T+50", "T+100", "T+150"]);
    assert_eq!(alarm.armed_deadline(), None);
}
