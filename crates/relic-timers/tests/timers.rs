use relic_timers::{TimerQueue, TimerSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DeviceTimer {
    PitChannel0,
    RtcPeriodic,
    FloppyMotor,
}

#[test]
fn queue_pops_in_deadline_order_with_fifo_ties() {
    let mut queue = TimerQueue::new();
    queue.schedule_at(200, DeviceTimer::RtcPeriodic);
    queue.schedule_at(100, DeviceTimer::PitChannel0);
    queue.schedule_at(200, DeviceTimer::FloppyMotor);

    assert_eq!(queue.next_deadline_ns(), Some(100));
    assert_eq!(queue.pop_due(99), None);

    let mut order = Vec::new();
    while let Some(ev) = queue.pop_due(200) {
        order.push((ev.deadline_ns, ev.payload));
    }
    assert_eq!(
        order,
        vec![
            (100, DeviceTimer::PitChannel0),
            (200, DeviceTimer::RtcPeriodic),
            (200, DeviceTimer::FloppyMotor),
        ]
    );
    assert!(queue.is_empty());
}

#[test]
fn disabled_timer_never_fires_even_with_queued_expiration() {
    let mut timers = TimerSet::new();
    let h = timers.add(DeviceTimer::PitChannel0);
    timers.set_delay(h, 0, 100);
    assert_eq!(timers.next_deadline_ns(), Some(100));

    // The expiration is already queued; disabling must still suppress it.
    timers.disable(h);
    let mut fired = 0;
    timers.advance(1_000, |_, _, _, _| fired += 1);
    assert_eq!(fired, 0);
    assert_eq!(timers.next_deadline_ns(), None);
}

#[test]
fn periodic_timer_rearms_from_deadline_not_now() {
    let mut timers = TimerSet::new();
    let h = timers.add(DeviceTimer::RtcPeriodic);
    timers.set_period(h, Some(100));
    timers.set_delay(h, 0, 100);

    // Pump far past several deadlines at once; the timer must fire once per
    // period with no drift, not once per advance call.
    let mut deadlines = Vec::new();
    timers.advance(350, |_, _, deadline, _| deadlines.push(deadline));
    assert_eq!(deadlines, vec![100, 200, 300]);
    assert_eq!(timers.next_deadline_ns(), Some(400));
}

#[test]
fn one_shot_expires_disabled_but_keeps_handle() {
    let mut timers = TimerSet::new();
    let h = timers.add(DeviceTimer::FloppyMotor);
    timers.set_delay(h, 0, 50);

    let mut fired = Vec::new();
    timers.advance(60, |_, handle, _, payload| fired.push((handle, payload)));
    assert_eq!(fired, vec![(h, DeviceTimer::FloppyMotor)]);
    assert!(!timers.is_enabled(h));

    // The handle survives expiration and can be re-armed.
    timers.set_delay(h, 60, 40);
    assert_eq!(timers.next_deadline_ns(), Some(100));
}

#[test]
fn callback_may_rearm_and_disable_other_timers() {
    let mut timers = TimerSet::new();
    let a = timers.add(DeviceTimer::PitChannel0);
    let b = timers.add(DeviceTimer::RtcPeriodic);
    timers.set_delay(a, 0, 10);
    timers.set_delay(b, 0, 20);

    let mut log = Vec::new();
    timers.advance(30, |set, handle, deadline, payload| {
        log.push((deadline, payload));
        if handle == a {
            // Cancel B and schedule A again inside the drain window.
            set.disable(b);
            set.set_delay(a, deadline, 15);
        }
    });

    // B was disabled before its 20ns expiration; A's re-arm at 25ns fired.
    assert_eq!(
        log,
        vec![(10, DeviceTimer::PitChannel0), (25, DeviceTimer::PitChannel0)]
    );
}

#[test]
fn callback_disabling_fired_periodic_timer_stops_it() {
    let mut timers = TimerSet::new();
    let h = timers.add(DeviceTimer::RtcPeriodic);
    timers.set_period(h, Some(10));
    timers.set_delay(h, 0, 10);

    let mut fired = 0;
    timers.advance(100, |set, handle, _, _| {
        fired += 1;
        set.disable(handle);
    });
    assert_eq!(fired, 1);
    assert_eq!(timers.next_deadline_ns(), None);
}
