//! # GOOSE/SV Capture Thread
//!
//! A dedicated thread pulls frames off the raw-frame port with a 100 ms
//! blocking timeout and demultiplexes by EtherType:
//!
//! - Sampled Values frames whose destination MAC matches the stream the
//!   analyzer is following are walked for their per-channel sample words,
//!   scaled by the configured LSB factor and pushed into the analyzer rings;
//! - GOOSE frames are matched against the subscription table by source MAC
//!   and gocbRef; on a match the boolean payload lands in the shared
//!   digital-input array, every boolean updates the trip-rule data-point map
//!   as `<gocbRef>/data<N>`, and a triggered rule raises the process trip
//!   flag and publishes a `goose/events` broadcast.
//!
//! Any parse failure drops the frame and bumps the parse-error counter; the
//! thread never dies on bad input. The rule engine is owned exclusively by
//! the capture thread; rules are installed before `start_thread`.

use crate::analyzer::AnalyzerEngine;
use crate::broadcaster::{topics, Event, EventBroadcaster};
use crate::iec61850::common::{MacAddress, ETHERTYPE_GOOSE, ETHERTYPE_SV};
use crate::iec61850::goose::GooseFrame;
use crate::iec61850::sampled_values::{ethertype_of, parse_sv_frame};
use crate::metrics;
use crate::rules::TripRuleEvaluator;
use crate::trip;
use crate::io::SharedPort;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Receive timeout; bounds how long a stop request can go unobserved.
const RECV_TIMEOUT: Duration = Duration::from_millis(100);

/// Default SV scaling: 0.01 units per LSB (61850-9-2 secondary convention).
pub const DEFAULT_SV_LSB: f64 = 0.01;

/// Number of shared digital-input slots.
pub const DIGITAL_INPUT_SLOTS: usize = 16;

/// Sixteen atomic digital inputs written by the sniffer from subscribed
/// GOOSE booleans and read by the test drivers and the playback loop.
pub struct DigitalInputs {
    slots: [AtomicU8; DIGITAL_INPUT_SLOTS],
}

impl Default for DigitalInputs {
    fn default() -> Self {
        Self::new()
    }
}

impl DigitalInputs {
    pub fn new() -> Self {
        DigitalInputs {
            slots: std::array::from_fn(|_| AtomicU8::new(0)),
        }
    }

    pub fn set(&self, slot: usize, value: u8) {
        if let Some(s) = self.slots.get(slot) {
            s.store(value, Ordering::Release);
        }
    }

    pub fn get(&self, slot: usize) -> u8 {
        self.slots
            .get(slot)
            .map(|s| s.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    pub fn clear_all(&self) {
        for slot in &self.slots {
            slot.store(0, Ordering::Release);
        }
    }
}

/// One GOOSE subscription.
///
/// # Fields
///
/// * `gocb_ref`: Control block reference the frame must carry.
/// * `mac_src`: Allowed publisher source MAC, `XX:XX:XX:XX:XX:XX`.
/// * `inputs`: `(digital_slot, goose_index)` pairs mapping frame booleans
///   onto the shared digital-input array.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GooseSubscription {
    pub gocb_ref: String,
    pub mac_src: String,
    #[serde(default)]
    pub inputs: Vec<(usize, usize)>,
}

/// Sniffer state machine errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnifferError {
    AlreadyRunning { message: String },
    NotRunning { message: String },
    ConfigInvalid { message: String },
}

impl fmt::Display for SnifferError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SnifferError::AlreadyRunning { message } => {
                write!(f, "Sniffer already running: {}", message)
            }
            SnifferError::NotRunning { message } => write!(f, "Sniffer not running: {}", message),
            SnifferError::ConfigInvalid { message } => {
                write!(f, "Invalid sniffer config: {}", message)
            }
        }
    }
}

impl std::error::Error for SnifferError {}

struct SnifferShared {
    running: AtomicBool,
    stop_requested: AtomicBool,
    analyzer: Mutex<Weak<AnalyzerEngine>>,
    broadcaster: Mutex<Weak<EventBroadcaster>>,
    last_error: Mutex<String>,
}

/// Owns the capture thread and the shared digital-input array.
pub struct GooseSniffer {
    port: SharedPort,
    shared: Arc<SnifferShared>,
    digital_inputs: Arc<DigitalInputs>,
    sv_lsb: f64,
    thread: Option<JoinHandle<()>>,
}

impl GooseSniffer {
    pub fn new(port: SharedPort) -> Self {
        GooseSniffer {
            port,
            shared: Arc::new(SnifferShared {
                running: AtomicBool::new(false),
                stop_requested: AtomicBool::new(false),
                analyzer: Mutex::new(Weak::new()),
                broadcaster: Mutex::new(Weak::new()),
                last_error: Mutex::new(String::new()),
            }),
            digital_inputs: Arc::new(DigitalInputs::new()),
            sv_lsb: DEFAULT_SV_LSB,
            thread: None,
        }
    }

    /// The shared digital-input array; clone the handle into test drivers.
    pub fn digital_inputs(&self) -> Arc<DigitalInputs> {
        Arc::clone(&self.digital_inputs)
    }

    /// Overrides the SV sample scaling (units per LSB).
    pub fn set_sv_lsb(&mut self, lsb: f64) {
        self.sv_lsb = lsb;
    }

    /// Attaches the analyzer that receives decoded SV samples. The sniffer
    /// keeps a weak reference and degrades gracefully when the analyzer is
    /// dropped.
    pub fn set_analyzer(&self, analyzer: &Arc<AnalyzerEngine>) {
        *self.shared.analyzer.lock().unwrap() = Arc::downgrade(analyzer);
    }

    /// Attaches the broadcaster for `goose/events`.
    pub fn set_broadcaster(&self, broadcaster: &Arc<EventBroadcaster>) {
        *self.shared.broadcaster.lock().unwrap() = Arc::downgrade(broadcaster);
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// The most recent control-surface error message.
    pub fn last_error(&self) -> String {
        self.shared.last_error.lock().unwrap().clone()
    }

    fn fail(&self, error: SnifferError) -> SnifferError {
        *self.shared.last_error.lock().unwrap() = error.to_string();
        error
    }

    /// Launches the capture thread.
    ///
    /// # Parameters
    ///
    /// * `subscriptions`: GOOSE subscription table; MACs are validated here.
    /// * `rule_engine`: The trip-rule engine, moved into the thread. Install
    ///   rules before starting.
    ///
    /// # Returns
    ///
    /// * `Err(SnifferError::AlreadyRunning)`: A capture thread is active.
    /// * `Err(SnifferError::ConfigInvalid)`: A subscription MAC is bad.
    pub fn start_thread(
        &mut self,
        subscriptions: Vec<GooseSubscription>,
        rule_engine: TripRuleEvaluator,
    ) -> Result<(), SnifferError> {
        if self.shared.running.load(Ordering::Acquire) {
            return Err(self.fail(SnifferError::AlreadyRunning {
                message: "capture thread active".to_string(),
            }));
        }

        let mut resolved = Vec::with_capacity(subscriptions.len());
        for sub in subscriptions {
            let mac = match MacAddress::parse(&sub.mac_src) {
                Ok(mac) => mac,
                Err(e) => {
                    return Err(self.fail(SnifferError::ConfigInvalid {
                        message: format!("subscription '{}': {}", sub.gocb_ref, e),
                    }))
                }
            };
            resolved.push(ResolvedSubscription {
                gocb_ref: sub.gocb_ref,
                mac_src: mac,
                inputs: sub.inputs,
            });
        }

        self.shared.stop_requested.store(false, Ordering::Release);
        self.shared.running.store(true, Ordering::Release);

        let shared = Arc::clone(&self.shared);
        let port = self.port.clone();
        let digital_inputs = Arc::clone(&self.digital_inputs);
        let sv_lsb = self.sv_lsb;
        let handle = std::thread::Builder::new()
            .name("vts-sniffer".to_string())
            .spawn(move || {
                capture_loop(shared, port, resolved, rule_engine, digital_inputs, sv_lsb)
            })
            .map_err(|e| SnifferError::ConfigInvalid {
                message: format!("failed to spawn capture thread: {}", e),
            })?;
        self.thread = Some(handle);
        log::info!("sniffer thread started");
        Ok(())
    }

    /// Requests a stop and joins the thread; observed within ~100 ms.
    pub fn stop_thread(&mut self) -> Result<(), SnifferError> {
        if !self.shared.running.load(Ordering::Acquire) {
            return Err(self.fail(SnifferError::NotRunning {
                message: "no capture thread".to_string(),
            }));
        }
        self.shared.stop_requested.store(true, Ordering::Release);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
        self.shared.running.store(false, Ordering::Release);
        log::info!("sniffer thread stopped");
        Ok(())
    }
}

impl Drop for GooseSniffer {
    fn drop(&mut self) {
        let _ = self.stop_thread();
    }
}

struct ResolvedSubscription {
    gocb_ref: String,
    mac_src: MacAddress,
    inputs: Vec<(usize, usize)>,
}

fn capture_loop(
    shared: Arc<SnifferShared>,
    port: SharedPort,
    subscriptions: Vec<ResolvedSubscription>,
    mut rule_engine: TripRuleEvaluator,
    digital_inputs: Arc<DigitalInputs>,
    sv_lsb: f64,
) {
    log::debug!(
        "capture loop on '{}' with {} subscriptions",
        port.interface_name(),
        subscriptions.len()
    );

    while !shared.stop_requested.load(Ordering::Acquire) {
        let frame = match port.recv(RECV_TIMEOUT) {
            Ok(Some(frame)) => frame,
            Ok(None) => continue,
            Err(e) => {
                log::error!("capture recv failed: {}", e);
                continue;
            }
        };

        let (ethertype, _) = match ethertype_of(&frame) {
            Ok(pair) => pair,
            Err(_) => {
                metrics::record_parse_error();
                continue;
            }
        };

        match ethertype {
            ETHERTYPE_SV => handle_sv_frame(&shared, &frame, sv_lsb),
            ETHERTYPE_GOOSE => handle_goose_frame(
                &shared,
                &frame,
                &subscriptions,
                &mut rule_engine,
                &digital_inputs,
            ),
            _ => {}
        }
    }

    shared.running.store(false, Ordering::Release);
}

fn handle_sv_frame(shared: &SnifferShared, frame: &[u8], sv_lsb: f64) {
    // Upgrade the weak analyzer handle for the duration of this frame.
    let Some(analyzer) = shared.analyzer.lock().unwrap().upgrade() else {
        return;
    };
    if !analyzer.is_running() {
        return;
    }
    if frame.len() < 6 {
        metrics::record_parse_error();
        return;
    }

    let mut dst = [0u8; 6];
    dst.copy_from_slice(&frame[0..6]);
    let dst_mac = MacAddress(dst).to_string();
    if dst_mac != analyzer.stream_mac() {
        return;
    }

    let info = match parse_sv_frame(frame) {
        Ok(info) => info,
        Err(e) => {
            metrics::record_parse_error();
            log::debug!("dropped SV frame: {}", e);
            return;
        }
    };

    let now = Instant::now();
    for asdu in &info.asdus {
        for (channel, (raw, _quality)) in asdu.samples.iter().enumerate() {
            analyzer.process_sample(
                &dst_mac,
                &format!("Ch{}", channel),
                *raw as f64 * sv_lsb,
                now,
            );
        }
    }
    metrics::record_received_frame();
}

fn handle_goose_frame(
    shared: &SnifferShared,
    frame: &[u8],
    subscriptions: &[ResolvedSubscription],
    rule_engine: &mut TripRuleEvaluator,
    digital_inputs: &DigitalInputs,
) {
    if frame.len() < 12 {
        metrics::record_parse_error();
        return;
    }
    let mut src = [0u8; 6];
    src.copy_from_slice(&frame[6..12]);
    let src_mac = MacAddress(src);

    let decoded = match GooseFrame::from_hex(frame) {
        Ok(decoded) => decoded,
        Err(e) => {
            metrics::record_parse_error();
            log::debug!("dropped GOOSE frame: {}", e);
            return;
        }
    };

    let Some(subscription) = subscriptions
        .iter()
        .find(|s| s.mac_src == src_mac && s.gocb_ref == decoded.gocb_ref)
    else {
        return;
    };

    let bools = decoded.bool_view();

    for &(slot, goose_index) in &subscription.inputs {
        match bools.get(goose_index) {
            Some(&value) => digital_inputs.set(slot, value),
            None => {
                metrics::record_parse_error();
                log::warn!(
                    "subscription '{}': GOOSE index {} out of range ({} entries)",
                    subscription.gocb_ref,
                    goose_index,
                    bools.len()
                );
                return;
            }
        }
    }

    for (index, &value) in bools.iter().enumerate() {
        rule_engine.update_data_point(
            &format!("{}/data{}", subscription.gocb_ref, index),
            value != 0,
        );
    }
    metrics::record_received_frame();

    let result = rule_engine.evaluate();
    if result.triggered {
        log::info!(
            "trip rule triggered: {} - {}",
            result.rule_name,
            result.message
        );
        trip::set_trip_flag();

        if let Some(bus) = shared.broadcaster.lock().unwrap().upgrade() {
            bus.broadcast(
                topics::GOOSE_EVENTS,
                Event::GooseTrip {
                    rule_name: result.rule_name,
                    expression: result.expression,
                    message: result.message,
                    timestamp_us: result.timestamp_us,
                },
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iec61850::common::VlanTag;
    use crate::iec61850::random::goose_frame_with_bools;
    use crate::io::loopback::LoopbackHub;

    fn goose_bytes(gocb_ref: &str, src: &str, n_true: usize) -> Vec<u8> {
        let dst = MacAddress::parse("01:0C:CD:01:00:00").unwrap();
        let src = MacAddress::parse(src).unwrap();
        goose_frame_with_bools(gocb_ref, 4, n_true)
            .encode(&dst, &src, &VlanTag::new(4, false, 5).unwrap())
            .unwrap()
    }

    #[test]
    fn test_goose_match_sets_digital_inputs_and_trip() {
        let _guard = trip::test_guard();
        trip::clear_trip_flag();

        let hub = "test-sniffer-trip";
        let publisher_port = LoopbackHub::bind(hub);
        let mut sniffer = GooseSniffer::new(LoopbackHub::bind(hub));
        let inputs = sniffer.digital_inputs();

        let mut rules = TripRuleEvaluator::new();
        rules.add_rule("r", "RelayA/data0 == true").unwrap();

        sniffer
            .start_thread(
                vec![GooseSubscription {
                    gocb_ref: "RelayA".to_string(),
                    mac_src: "AA:BB:CC:DD:EE:02".to_string(),
                    inputs: vec![(0, 0), (1, 1)],
                }],
                rules,
            )
            .unwrap();

        publisher_port
            .send(&goose_bytes("RelayA", "AA:BB:CC:DD:EE:02", 1))
            .unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        while !trip::is_trip_flag_set() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(trip::is_trip_flag_set(), "trip flag must be raised");
        assert_eq!(inputs.get(0), 1);
        assert_eq!(inputs.get(1), 0);

        sniffer.stop_thread().unwrap();
        trip::clear_trip_flag();
    }

    #[test]
    fn test_unmatched_source_mac_ignored() {
        let _guard = trip::test_guard();
        trip::clear_trip_flag();

        let hub = "test-sniffer-wrong-mac";
        let publisher_port = LoopbackHub::bind(hub);
        let mut sniffer = GooseSniffer::new(LoopbackHub::bind(hub));

        let mut rules = TripRuleEvaluator::new();
        rules.add_rule("r", "RelayA/data0 == true").unwrap();

        sniffer
            .start_thread(
                vec![GooseSubscription {
                    gocb_ref: "RelayA".to_string(),
                    mac_src: "AA:BB:CC:DD:EE:02".to_string(),
                    inputs: vec![(0, 0)],
                }],
                rules,
            )
            .unwrap();

        // Right gocbRef, wrong source MAC.
        publisher_port
            .send(&goose_bytes("RelayA", "AA:BB:CC:DD:EE:03", 1))
            .unwrap();
        std::thread::sleep(Duration::from_millis(300));
        assert!(!trip::is_trip_flag_set());

        sniffer.stop_thread().unwrap();
    }

    #[test]
    fn test_stop_observed_quickly() {
        let mut sniffer = GooseSniffer::new(LoopbackHub::bind("test-sniffer-stop"));
        sniffer
            .start_thread(Vec::new(), TripRuleEvaluator::new())
            .unwrap();

        let t0 = Instant::now();
        sniffer.stop_thread().unwrap();
        assert!(
            t0.elapsed() < Duration::from_millis(500),
            "stop must be observed within the recv timeout"
        );
        assert!(!sniffer.is_running());
    }

    #[test]
    fn test_double_start_rejected() {
        let mut sniffer = GooseSniffer::new(LoopbackHub::bind("test-sniffer-double"));
        sniffer
            .start_thread(Vec::new(), TripRuleEvaluator::new())
            .unwrap();
        assert!(matches!(
            sniffer.start_thread(Vec::new(), TripRuleEvaluator::new()),
            Err(SnifferError::AlreadyRunning { .. })
        ));
        sniffer.stop_thread().unwrap();
        assert!(matches!(
            sniffer.stop_thread(),
            Err(SnifferError::NotRunning { .. })
        ));
    }

    #[test]
    fn test_garbage_frames_counted_not_fatal() {
        metrics::reset();
        let hub = "test-sniffer-garbage";
        let publisher_port = LoopbackHub::bind(hub);
        let mut sniffer = GooseSniffer::new(LoopbackHub::bind(hub));

        sniffer
            .start_thread(Vec::new(), TripRuleEvaluator::new())
            .unwrap();

        // A GOOSE EtherType with a truncated PDU body.
        let mut bad = goose_bytes("RelayA", "AA:BB:CC:DD:EE:02", 1);
        bad.truncate(30);
        publisher_port.send(&bad).unwrap();

        std::thread::sleep(Duration::from_millis(300));
        assert!(metrics::snapshot().parse_errors >= 1);
        assert!(sniffer.is_running(), "thread survives bad frames");
        sniffer.stop_thread().unwrap();
    }
}
