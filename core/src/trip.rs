//! # Process-Wide Trip Signal
//!
//! One atomic boolean shared by the whole process: the GOOSE sniffer raises
//! it when a trip rule matches, the sequence engine and the test drivers
//! poll it and clear it when they consume the edge. There is no queue; only
//! the most recent edge matters.
//!
//! Stores use release ordering and loads acquire ordering, so everything the
//! sniffer wrote before raising the flag is visible to the thread that
//! observes it. Tests must clear the flag during setup and teardown.

use std::sync::atomic::{AtomicBool, Ordering};

static TRIP_FLAG: AtomicBool = AtomicBool::new(false);

/// Serializes tests that exercise the process-wide flag; the flag is global,
/// so concurrent tests would otherwise race each other's edges.
#[cfg(test)]
pub(crate) static TEST_GUARD: std::sync::Mutex<()> = std::sync::Mutex::new(());

#[cfg(test)]
pub(crate) fn test_guard() -> std::sync::MutexGuard<'static, ()> {
    TEST_GUARD.lock().unwrap_or_else(|e| e.into_inner())
}

/// Raises the trip flag.
pub fn set_trip_flag() {
    TRIP_FLAG.store(true, Ordering::Release);
}

/// Clears the trip flag.
pub fn clear_trip_flag() {
    TRIP_FLAG.store(false, Ordering::Release);
}

/// Reads the trip flag.
pub fn is_trip_flag_set() -> bool {
    TRIP_FLAG.load(Ordering::Acquire)
}
