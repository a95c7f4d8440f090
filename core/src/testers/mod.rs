//! # Protection Test Drivers
//!
//! Four orchestrators that stimulate a device under test through the SV
//! publishers and measure its response on the process trip flag: amplitude/
//! frequency ramping, distance (impedance-plane) testing, inverse-time
//! overcurrent testing and differential (restraint/operate plane) testing.
//!
//! Each driver runs synchronously on the caller's thread, owns a stop handle
//! pollable from other threads, reports per-point outcomes in its result
//! vector rather than aborting, and clears the trip flag immediately before
//! every monitored window. Between points every driver waits one second so
//! the relay can reset.

pub mod differential;
pub mod distance;
pub mod impedance;
pub mod overcurrent;
pub mod ramp;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Reads the trip flag; injected so drivers are testable against a fake
/// relay as well as the process-wide flag.
pub type TripFlagGetter = Box<dyn Fn() -> bool + Send>;

/// Pause between test points, letting the relay reset.
pub(crate) const INTER_POINT_WAIT: Duration = Duration::from_secs(1);

/// Poll interval while monitoring for a trip edge.
pub(crate) const MONITOR_POLL: Duration = Duration::from_millis(1);

/// Poll interval of interruptible waits.
pub(crate) const WAIT_POLL: Duration = Duration::from_millis(10);

/// Cloneable atomic flag; used internally for the drivers' running state.
#[derive(Clone, Default)]
pub(crate) struct Flag(Arc<AtomicBool>);

impl Flag {
    pub(crate) fn set(&self, value: bool) {
        self.0.store(value, Ordering::Release);
    }

    pub(crate) fn get(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Cloneable stop request shared between a running driver and its
/// controller.
#[derive(Clone, Default)]
pub struct StopHandle {
    flag: Arc<AtomicBool>,
}

impl StopHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_stop(&self) {
        self.flag.store(true, Ordering::Release);
    }

    pub fn is_stop_requested(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    pub(crate) fn reset(&self) {
        self.flag.store(false, Ordering::Release);
    }
}

/// Sleeps for `duration` in small slices, returning false if a stop was
/// requested meanwhile.
pub(crate) fn wait_with_stop_check(stop: &StopHandle, duration: Duration) -> bool {
    let end = Instant::now() + duration;
    while Instant::now() < end {
        if stop.is_stop_requested() {
            return false;
        }
        std::thread::sleep(WAIT_POLL);
    }
    true
}

/// Watches for a 0 -> 1 trip transition for at most `max_duration`.
///
/// # Returns
///
/// * `Some(latency)`: The flag rose; latency measured from entry.
/// * `None`: Timeout or stop request.
pub(crate) fn monitor_trip(
    getter: &TripFlagGetter,
    stop: &StopHandle,
    max_duration: Duration,
) -> Option<Duration> {
    let start = Instant::now();
    let initial = getter();

    while start.elapsed() < max_duration {
        if stop.is_stop_requested() {
            return None;
        }
        if !initial && getter() {
            return Some(start.elapsed());
        }
        std::thread::sleep(MONITOR_POLL);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_monitor_trip_measures_latency() {
        let armed = Arc::new(AtomicBool::new(false));
        let armed_reader = Arc::clone(&armed);
        let getter: TripFlagGetter = Box::new(move || armed_reader.load(Ordering::Acquire));

        let setter = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            armed.store(true, Ordering::Release);
        });

        let latency = monitor_trip(&getter, &StopHandle::new(), Duration::from_secs(1))
            .expect("trip must be observed");
        assert!(latency >= Duration::from_millis(45), "latency {:?}", latency);
        assert!(latency < Duration::from_millis(150), "latency {:?}", latency);
        setter.join().unwrap();
    }

    #[test]
    fn test_monitor_trip_times_out() {
        let getter: TripFlagGetter = Box::new(|| false);
        let t0 = Instant::now();
        assert!(monitor_trip(&getter, &StopHandle::new(), Duration::from_millis(80)).is_none());
        assert!(t0.elapsed() >= Duration::from_millis(80));
    }

    #[test]
    fn test_stop_interrupts_wait() {
        let stop = StopHandle::new();
        let stopper = stop.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            stopper.request_stop();
        });
        let t0 = Instant::now();
        assert!(!wait_with_stop_check(&stop, Duration::from_secs(5)));
        assert!(t0.elapsed() < Duration::from_millis(500));
    }
}
