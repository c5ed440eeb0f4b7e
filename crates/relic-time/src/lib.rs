//! Guest-virtual timebase.
//!
//! All timed deadlines in the emulator are expressed in guest nanoseconds, a
//! monotonically non-decreasing `u64`. The [`TimeSource`] couples that guest
//! clock to a host clock with pause/resume and a speed ratio, and can compute
//! how long the host must sleep for the guest to reach a deadline (used by the
//! run loop when virtual time leads wall time).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Source of host wall-clock nanoseconds.
pub trait HostClock: Send + Sync {
    fn now_ns(&self) -> u64;
}

/// Host clock backed by `std::time::Instant`.
pub struct StdHostClock {
    origin: std::time::Instant,
}

impl StdHostClock {
    pub fn new() -> Self {
        Self {
            origin: std::time::Instant::now(),
        }
    }
}

impl Default for StdHostClock {
    fn default() -> Self {
        Self::new()
    }
}

impl HostClock for StdHostClock {
    fn now_ns(&self) -> u64 {
        self.origin.elapsed().as_nanos() as u64
    }
}

/// Deterministic host clock for tests.
#[derive(Default)]
pub struct FakeHostClock {
    ns: AtomicU64,
}

impl FakeHostClock {
    pub fn new(start_ns: u64) -> Self {
        Self {
            ns: AtomicU64::new(start_ns),
        }
    }

    pub fn set_ns(&self, ns: u64) {
        self.ns.store(ns, Ordering::SeqCst);
    }

    pub fn advance_ns(&self, delta: u64) {
        self.ns.fetch_add(delta, Ordering::SeqCst);
    }
}

impl HostClock for FakeHostClock {
    fn now_ns(&self) -> u64 {
        self.ns.load(Ordering::SeqCst)
    }
}

/// Guest-time speed as a rational multiplier of host time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Speed {
    num: u64,
    den: u64,
}

impl Speed {
    pub const NORMAL: Speed = Speed { num: 1, den: 1 };

    pub fn from_ratio(num: u64, den: u64) -> Self {
        assert!(den != 0, "speed denominator must be non-zero");
        Speed { num, den }
    }

    fn scale(&self, host_delta_ns: u64) -> u64 {
        ((host_delta_ns as u128 * self.num as u128) / self.den as u128) as u64
    }

    fn unscale(&self, guest_delta_ns: u64) -> Option<u64> {
        if self.num == 0 {
            return None;
        }
        Some(((guest_delta_ns as u128 * self.den as u128).div_ceil(self.num as u128)) as u64)
    }
}

struct TimeSourceState {
    // Guest ns accumulated up to `anchor_host_ns`.
    guest_base_ns: u64,
    anchor_host_ns: u64,
    speed: Speed,
    paused: bool,
}

/// Couples the guest-virtual clock to a host clock.
///
/// Guest time advances as `speed * host` while running and stands still while
/// paused. Speed and pause changes re-anchor the accumulator so guest time
/// never goes backwards.
pub struct TimeSource {
    host: Arc<dyn HostClock>,
    state: Mutex<TimeSourceState>,
}

impl TimeSource {
    pub fn new(host: Arc<dyn HostClock>) -> Self {
        let anchor = host.now_ns();
        Self {
            host,
            state: Mutex::new(TimeSourceState {
                guest_base_ns: 0,
                anchor_host_ns: anchor,
                speed: Speed::NORMAL,
                paused: false,
            }),
        }
    }

    pub fn now_ns(&self) -> u64 {
        let state = self.state.lock().unwrap();
        self.now_ns_locked(&state)
    }

    fn now_ns_locked(&self, state: &TimeSourceState) -> u64 {
        if state.paused {
            return state.guest_base_ns;
        }
        let host_now = self.host.now_ns();
        let delta = host_now.saturating_sub(state.anchor_host_ns);
        state.guest_base_ns + state.speed.scale(delta)
    }

    fn reanchor(&self, state: &mut TimeSourceState) {
        state.guest_base_ns = self.now_ns_locked(state);
        state.anchor_host_ns = self.host.now_ns();
    }

    pub fn pause(&self) {
        let mut state = self.state.lock().unwrap();
        if !state.paused {
            self.reanchor(&mut state);
            state.paused = true;
        }
    }

    pub fn resume(&self) {
        let mut state = self.state.lock().unwrap();
        if state.paused {
            state.anchor_host_ns = self.host.now_ns();
            state.paused = false;
        }
    }

    pub fn is_paused(&self) -> bool {
        self.state.lock().unwrap().paused
    }

    pub fn set_speed(&self, speed: Speed) {
        let mut state = self.state.lock().unwrap();
        self.reanchor(&mut state);
        state.speed = speed;
    }

    /// Host sleep needed for guest time to reach `deadline_ns`.
    ///
    /// `None` when the deadline has already passed, or can never be reached
    /// (paused / zero speed).
    pub fn host_duration_until_guest_ns(&self, deadline_ns: u64) -> Option<Duration> {
        let state = self.state.lock().unwrap();
        let now = self.now_ns_locked(&state);
        if deadline_ns <= now {
            return None;
        }
        if state.paused {
            return None;
        }
        let host_ns = state.speed.unscale(deadline_ns - now)?;
        Some(Duration::from_nanos(host_ns))
    }
}

/// Shared manually-advanced guest clock handle for device models.
#[derive(Clone, Default)]
pub struct ManualClock {
    ns: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn now_ns(&self) -> u64 {
        self.ns.load(Ordering::Relaxed)
    }

    pub fn advance_ns(&self, delta: u64) {
        self.ns.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn set_ns(&self, ns: u64) {
        self.ns.store(ns, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_handles_share_state() {
        let a = ManualClock::new();
        let b = a.clone();
        a.advance_ns(40);
        b.advance_ns(2);
        assert_eq!(a.now_ns(), 42);
    }

    #[test]
    fn speed_zero_never_reaches_deadline() {
        let host = Arc::new(FakeHostClock::new(0));
        let time = TimeSource::new(host.clone());
        time.set_speed(Speed::from_ratio(0, 1));
        host.advance_ns(1_000);
        assert_eq!(time.now_ns(), 0);
        assert_eq!(time.host_duration_until_guest_ns(1), None);
    }
}
