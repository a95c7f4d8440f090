//! # Sequence Engine
//!
//! Executes an ordered list of states against a set of active streams. Each
//! state applies its per-stream phasor overrides through a callback supplied
//! at construction (the engine never holds a registry reference) and then
//! waits for its transition: either the state duration elapsing or, for
//! `goose_trip` states, the process trip flag being raised by the sniffer.
//! A `goose_trip` state that never sees the flag proceeds at its duration
//! with a logged warning rather than failing the run.
//!
//! One sequence runs at a time; `start` rejects while running or paused.
//! The wait loop polls every 50 ms, pause busy-blocks in a 100 ms loop with
//! a stop check, and stop is observed within one poll interval.

use crate::broadcaster::{topics, Event, EventBroadcaster};
use crate::registry::StreamPhasors;
use crate::trip;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(50);
const PAUSE_INTERVAL: Duration = Duration::from_millis(100);

/// Engine status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SequenceStatus {
    Idle,
    Running,
    Paused,
    Completed,
    Stopped,
    Error,
}

impl SequenceStatus {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => SequenceStatus::Running,
            2 => SequenceStatus::Paused,
            3 => SequenceStatus::Completed,
            4 => SequenceStatus::Stopped,
            5 => SequenceStatus::Error,
            _ => SequenceStatus::Idle,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            SequenceStatus::Idle => 0,
            SequenceStatus::Running => 1,
            SequenceStatus::Paused => 2,
            SequenceStatus::Completed => 3,
            SequenceStatus::Stopped => 4,
            SequenceStatus::Error => 5,
        }
    }
}

/// How a state hands over to its successor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionKind {
    /// Advance when the state duration elapses.
    Time,
    /// Advance on the trip flag; the duration is the timeout.
    GooseTrip,
}

/// One state of a sequence.
///
/// # Fields
///
/// * `name`: Display name used in progress reports.
/// * `duration_sec`: State duration (or trip timeout) in seconds.
/// * `transition`: Transition kind.
/// * `phasors`: Stream id to phasor-override map applied on entry. A stream
///   in the active list with no entry here keeps its current phasors.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SequenceState {
    pub name: String,
    pub duration_sec: f64,
    pub transition: TransitionKind,
    #[serde(default)]
    pub phasors: BTreeMap<String, StreamPhasors>,
}

/// An ordered list of states plus the streams they drive.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Sequence {
    pub states: Vec<SequenceState>,
    pub active_streams: Vec<String>,
}

/// Sequence engine errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SequenceError {
    AlreadyRunning { message: String },
    NotRunning { message: String },
    Invalid { message: String },
}

impl fmt::Display for SequenceError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SequenceError::AlreadyRunning { message } => {
                write!(f, "Sequence already running: {}", message)
            }
            SequenceError::NotRunning { message } => {
                write!(f, "Sequence not running: {}", message)
            }
            SequenceError::Invalid { message } => write!(f, "Invalid sequence: {}", message),
        }
    }
}

impl std::error::Error for SequenceError {}

/// Invoked on every state entry and terminal transition:
/// `(current_state, total_states, state_name, total_elapsed_sec, message)`.
pub type ProgressCallback = Box<dyn Fn(usize, usize, &str, f64, &str) + Send + Sync>;

/// Invoked once per `(state, stream)` application.
pub type PhasorUpdateCallback = Box<dyn Fn(&str, &StreamPhasors) + Send + Sync>;

struct SequenceShared {
    status: AtomicU8,
    current_state: AtomicI64,
    stop_requested: AtomicBool,
    pause_requested: AtomicBool,
    sequence_start: Mutex<Option<Instant>>,
    state_start: Mutex<Option<Instant>>,
    last_error: Mutex<String>,
    progress_cb: Mutex<Option<Arc<ProgressCallback>>>,
    phasor_cb: Mutex<Option<Arc<PhasorUpdateCallback>>>,
    broadcaster: Mutex<Weak<EventBroadcaster>>,
}

impl SequenceShared {
    fn status(&self) -> SequenceStatus {
        SequenceStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    fn set_status(&self, status: SequenceStatus) {
        self.status.store(status.as_u8(), Ordering::Release);
    }

    fn total_elapsed(&self) -> f64 {
        self.sequence_start
            .lock()
            .unwrap()
            .map(|t| t.elapsed().as_secs_f64())
            .unwrap_or(0.0)
    }

    fn report_progress(&self, seq: &Sequence, message: &str) {
        let index = self.current_state.load(Ordering::Acquire);
        let current = if index >= 0 { index as usize } else { 0 };
        let state_name = seq
            .states
            .get(current)
            .map(|s| s.name.as_str())
            .unwrap_or("");
        let elapsed = self.total_elapsed();

        if let Some(cb) = self.progress_cb.lock().unwrap().clone() {
            cb(current, seq.states.len(), state_name, elapsed, message);
        }
        if let Some(bus) = self.broadcaster.lock().unwrap().upgrade() {
            bus.broadcast(
                topics::SEQUENCE_PROGRESS,
                Event::SequenceProgress {
                    current_state: current,
                    total_states: seq.states.len(),
                    state_name: state_name.to_string(),
                    elapsed_sec: elapsed,
                    message: message.to_string(),
                },
            );
        }
    }
}

/// Multi-state scheduler; owns a background thread while running.
pub struct SequenceEngine {
    shared: Arc<SequenceShared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Default for SequenceEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl SequenceEngine {
    pub fn new() -> Self {
        SequenceEngine {
            shared: Arc::new(SequenceShared {
                status: AtomicU8::new(SequenceStatus::Idle.as_u8()),
                current_state: AtomicI64::new(-1),
                stop_requested: AtomicBool::new(false),
                pause_requested: AtomicBool::new(false),
                sequence_start: Mutex::new(None),
                state_start: Mutex::new(None),
                last_error: Mutex::new(String::new()),
                progress_cb: Mutex::new(None),
                phasor_cb: Mutex::new(None),
                broadcaster: Mutex::new(Weak::new()),
            }),
            thread: Mutex::new(None),
        }
    }

    pub fn set_progress_callback(&self, callback: ProgressCallback) {
        *self.shared.progress_cb.lock().unwrap() = Some(Arc::new(callback));
    }

    pub fn set_phasor_update_callback(&self, callback: PhasorUpdateCallback) {
        *self.shared.phasor_cb.lock().unwrap() = Some(Arc::new(callback));
    }

    pub fn set_broadcaster(&self, broadcaster: &Arc<EventBroadcaster>) {
        *self.shared.broadcaster.lock().unwrap() = Arc::downgrade(broadcaster);
    }

    /// Starts executing `seq` on a background thread.
    ///
    /// # Returns
    ///
    /// * `Err(SequenceError::AlreadyRunning)`: While running or paused.
    /// * `Err(SequenceError::Invalid)`: Empty state list or stream list.
    pub fn start(&self, seq: Sequence) -> Result<(), SequenceError> {
        let status = self.shared.status();
        if status == SequenceStatus::Running || status == SequenceStatus::Paused {
            let message = "sequence already running or paused".to_string();
            *self.shared.last_error.lock().unwrap() = message.clone();
            return Err(SequenceError::AlreadyRunning { message });
        }
        if seq.states.is_empty() {
            return Err(SequenceError::Invalid {
                message: "sequence has no states".to_string(),
            });
        }
        if seq.active_streams.is_empty() {
            return Err(SequenceError::Invalid {
                message: "sequence has no active streams".to_string(),
            });
        }

        // A previous run's thread has terminated once status left
        // Running/Paused; reap it before starting over.
        if let Some(handle) = self.thread.lock().unwrap().take() {
            let _ = handle.join();
        }

        self.shared.current_state.store(-1, Ordering::Release);
        self.shared.stop_requested.store(false, Ordering::Release);
        self.shared.pause_requested.store(false, Ordering::Release);
        self.shared.last_error.lock().unwrap().clear();
        trip::clear_trip_flag();

        self.shared.set_status(SequenceStatus::Running);
        let shared = Arc::clone(&self.shared);
        let states = seq.states.len();
        let handle = std::thread::Builder::new()
            .name("vts-sequence".to_string())
            .spawn(move || sequence_thread(shared, seq))
            .map_err(|e| {
                self.shared.set_status(SequenceStatus::Error);
                SequenceError::Invalid {
                    message: format!("failed to spawn sequence thread: {}", e),
                }
            })?;
        *self.thread.lock().unwrap() = Some(handle);

        log::info!("sequence started with {} states", states);
        Ok(())
    }

    /// Stops the running (or paused) sequence and joins the thread.
    pub fn stop(&self) -> Result<(), SequenceError> {
        let status = self.shared.status();
        if status != SequenceStatus::Running && status != SequenceStatus::Paused {
            return Err(SequenceError::NotRunning {
                message: format!("status is {:?}", status),
            });
        }
        self.shared.stop_requested.store(true, Ordering::Release);
        if let Some(handle) = self.thread.lock().unwrap().take() {
            let _ = handle.join();
        }
        self.shared.set_status(SequenceStatus::Stopped);
        self.shared.current_state.store(-1, Ordering::Release);
        log::info!("sequence stopped");
        Ok(())
    }

    pub fn pause(&self) -> Result<(), SequenceError> {
        if self.shared.status() != SequenceStatus::Running {
            return Err(SequenceError::NotRunning {
                message: "pause requires a running sequence".to_string(),
            });
        }
        self.shared.pause_requested.store(true, Ordering::Release);
        self.shared.set_status(SequenceStatus::Paused);
        log::info!("sequence paused");
        Ok(())
    }

    pub fn resume(&self) -> Result<(), SequenceError> {
        if self.shared.status() != SequenceStatus::Paused {
            return Err(SequenceError::NotRunning {
                message: "resume requires a paused sequence".to_string(),
            });
        }
        self.shared.pause_requested.store(false, Ordering::Release);
        self.shared.set_status(SequenceStatus::Running);
        log::info!("sequence resumed");
        Ok(())
    }

    pub fn status(&self) -> SequenceStatus {
        self.shared.status()
    }

    /// Index of the executing state, or `None` between runs.
    pub fn current_state_index(&self) -> Option<usize> {
        let index = self.shared.current_state.load(Ordering::Acquire);
        (index >= 0).then_some(index as usize)
    }

    pub fn state_elapsed(&self) -> f64 {
        self.shared
            .state_start
            .lock()
            .unwrap()
            .map(|t| t.elapsed().as_secs_f64())
            .unwrap_or(0.0)
    }

    pub fn total_elapsed(&self) -> f64 {
        self.shared.total_elapsed()
    }

    pub fn last_error(&self) -> String {
        self.shared.last_error.lock().unwrap().clone()
    }

    /// Blocks until the current run reaches a terminal status. Test support.
    pub fn join(&self) {
        if let Some(handle) = self.thread.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for SequenceEngine {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

fn sequence_thread(shared: Arc<SequenceShared>, seq: Sequence) {
    *shared.sequence_start.lock().unwrap() = Some(Instant::now());

    for (index, state) in seq.states.iter().enumerate() {
        if shared.stop_requested.load(Ordering::Acquire) {
            shared.report_progress(&seq, "Sequence stopped by user");
            shared.set_status(SequenceStatus::Stopped);
            return;
        }
        if !wait_while_paused(&shared) {
            shared.report_progress(&seq, "Sequence stopped while paused");
            shared.set_status(SequenceStatus::Stopped);
            return;
        }

        shared.current_state.store(index as i64, Ordering::Release);
        *shared.state_start.lock().unwrap() = Some(Instant::now());

        shared.report_progress(
            &seq,
            &format!(
                "Entering state {}/{}: {}",
                index + 1,
                seq.states.len(),
                state.name
            ),
        );
        log::info!(
            "sequence state {}/{}: {} ({:.2}s)",
            index + 1,
            seq.states.len(),
            state.name,
            state.duration_sec
        );

        apply_state(&shared, &seq, state);

        if !wait_for_transition(&shared, state) {
            shared.report_progress(&seq, "Sequence stopped during state execution");
            shared.set_status(SequenceStatus::Stopped);
            return;
        }
    }

    shared.current_state.store(-1, Ordering::Release);
    shared.set_status(SequenceStatus::Completed);
    shared.report_progress(&seq, "Sequence completed successfully");
    log::info!(
        "sequence completed (total time {:.2}s)",
        shared.total_elapsed()
    );
}

fn apply_state(shared: &SequenceShared, seq: &Sequence, state: &SequenceState) {
    let Some(cb) = shared.phasor_cb.lock().unwrap().clone() else {
        log::warn!("no phasor update callback set");
        return;
    };

    for stream_id in &seq.active_streams {
        match state.phasors.get(stream_id) {
            Some(update) => {
                cb(stream_id, update);
                log::debug!(
                    "applied phasors to stream '{}' (freq {:.2} Hz, {} channels)",
                    stream_id,
                    update.freq,
                    update.channels.len()
                );
            }
            None => log::warn!(
                "state '{}' has no phasor config for stream '{}'",
                state.name,
                stream_id
            ),
        }
    }
}

/// Blocks while paused. Returns false when stop was requested.
fn wait_while_paused(shared: &SequenceShared) -> bool {
    while shared.pause_requested.load(Ordering::Acquire) {
        std::thread::sleep(PAUSE_INTERVAL);
        if shared.stop_requested.load(Ordering::Acquire) {
            return false;
        }
    }
    true
}

/// Waits out one state. Returns false when stop was requested.
fn wait_for_transition(shared: &SequenceShared, state: &SequenceState) -> bool {
    let state_start = Instant::now();
    let duration = Duration::from_secs_f64(state.duration_sec.max(0.0));

    if state.transition == TransitionKind::GooseTrip {
        // The flag may still carry an edge from before this state.
        trip::clear_trip_flag();
    }

    loop {
        if shared.stop_requested.load(Ordering::Acquire) {
            return false;
        }
        if !wait_while_paused(shared) {
            return false;
        }

        if state.transition == TransitionKind::GooseTrip && trip::is_trip_flag_set() {
            log::info!("goose_trip transition: trip flag detected");
            trip::clear_trip_flag();
            return true;
        }

        if state_start.elapsed() >= duration {
            match state.transition {
                TransitionKind::Time => {
                    log::info!("time transition: {:.2}s elapsed", state.duration_sec)
                }
                TransitionKind::GooseTrip => log::warn!(
                    "goose_trip transition: timeout after {:.2}s (no trip detected)",
                    state.duration_sec
                ),
            }
            return true;
        }

        std::thread::sleep(POLL_INTERVAL);
    }
}
