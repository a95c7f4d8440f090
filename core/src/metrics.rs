//! # Process Counters
//!
//! Monotonic counters for the hot paths: frames sent and received, send
//! failures, and frames dropped for parse errors. Writers are the publisher
//! tick loop and the sniffer thread; readers snapshot for status output.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

static SENT_FRAMES: AtomicU64 = AtomicU64::new(0);
static RECEIVED_FRAMES: AtomicU64 = AtomicU64::new(0);
static SEND_ERRORS: AtomicU64 = AtomicU64::new(0);
static PARSE_ERRORS: AtomicU64 = AtomicU64::new(0);

pub fn record_sent_frame() {
    SENT_FRAMES.fetch_add(1, Ordering::Relaxed);
}

pub fn record_received_frame() {
    RECEIVED_FRAMES.fetch_add(1, Ordering::Relaxed);
}

pub fn record_send_error() {
    SEND_ERRORS.fetch_add(1, Ordering::Relaxed);
}

pub fn record_parse_error() {
    PARSE_ERRORS.fetch_add(1, Ordering::Relaxed);
}

/// Point-in-time copy of the process counters.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub sent_frames: u64,
    pub received_frames: u64,
    pub send_errors: u64,
    pub parse_errors: u64,
}

pub fn snapshot() -> MetricsSnapshot {
    MetricsSnapshot {
        sent_frames: SENT_FRAMES.load(Ordering::Relaxed),
        received_frames: RECEIVED_FRAMES.load(Ordering::Relaxed),
        send_errors: SEND_ERRORS.load(Ordering::Relaxed),
        parse_errors: PARSE_ERRORS.load(Ordering::Relaxed),
    }
}

/// Zeroes every counter. Test setup only.
pub fn reset() {
    SENT_FRAMES.store(0, Ordering::Relaxed);
    RECEIVED_FRAMES.store(0, Ordering::Relaxed);
    SEND_ERRORS.store(0, Ordering::Relaxed);
    PARSE_ERRORS.store(0, Ordering::Relaxed);
}
