//! # Distance Relay Tester
//!
//! Walks a list of R-X impedance points. For each point the stream is driven
//! with healthy pre-fault phasors for the configured pre-fault interval,
//! then with the fault solver's phasors for the chosen fault type, while the
//! trip flag is monitored. The trip time is wall-clock from fault
//! application to the 0 -> 1 edge. A point with expected time zero passes on
//! any trip inside the tolerance; a delayed point passes when the measured
//! time lands within the tolerance of the expectation.

use super::{monitor_trip, wait_with_stop_check, Flag, StopHandle, TripFlagGetter, INTER_POINT_WAIT};
use crate::testers::impedance::{
    calculate_fault, prefault_state, FaultImpedance, FaultType, PhasorState, SourceImpedance,
};
use crate::trip;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// One R-X test point.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DistancePoint {
    pub r: f64,
    pub x: f64,
    pub fault_type: FaultType,
    /// Expected trip time in seconds; zero means instantaneous.
    pub expected_time: f64,
    #[serde(default)]
    pub label: String,
}

/// Distance run parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DistanceTestConfig {
    pub points: Vec<DistancePoint>,
    pub source: SourceImpedance,
    /// Healthy-state dwell before each fault, seconds.
    pub prefault_duration: f64,
    /// Monitoring window after fault application, seconds.
    pub fault_duration: f64,
    pub time_tolerance: f64,
    pub stop_on_first_failure: bool,
    pub stream_id: String,
}

/// Outcome of one point.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DistanceResult {
    pub r: f64,
    pub x: f64,
    pub fault_type: FaultType,
    pub tripped: bool,
    pub trip_time: f64,
    pub passed: bool,
    pub error: Option<String>,
}

impl DistanceResult {
    fn for_point(point: &DistancePoint) -> Self {
        DistanceResult {
            r: point.r,
            x: point.x,
            fault_type: point.fault_type,
            tripped: false,
            trip_time: 0.0,
            passed: false,
            error: None,
        }
    }

    fn failure(message: &str) -> Self {
        DistanceResult {
            r: 0.0,
            x: 0.0,
            fault_type: FaultType::ABC,
            tripped: false,
            trip_time: 0.0,
            passed: false,
            error: Some(message.to_string()),
        }
    }
}

/// Progress callback: `(point_index, total_points, point)`.
pub type DistanceProgressCallback<'a> = &'a (dyn Fn(usize, usize, &DistancePoint) + Send + Sync);

/// Distance orchestrator; the phasor setter is injected by the caller
/// (usually `PublisherRegistry::apply_phasor_state`).
pub struct DistanceTester {
    trip_getter: Option<TripFlagGetter>,
    phasor_setter: Option<Box<dyn Fn(&PhasorState) + Send>>,
    stop: StopHandle,
    running: Flag,
}

impl Default for DistanceTester {
    fn default() -> Self {
        Self::new()
    }
}

impl DistanceTester {
    pub fn new() -> Self {
        DistanceTester {
            trip_getter: None,
            phasor_setter: None,
            stop: StopHandle::new(),
            running: Flag::default(),
        }
    }

    /// Installs the trip flag reader polled during each fault window.
    pub fn set_trip_flag_getter(&mut self, getter: TripFlagGetter) {
        self.trip_getter = Some(getter);
    }

    /// Installs the setter that writes a full voltage/current phasor state
    /// onto the stream.
    pub fn set_phasor_setter(&mut self, setter: Box<dyn Fn(&PhasorState) + Send>) {
        self.phasor_setter = Some(setter);
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    pub fn is_running(&self) -> bool {
        self.running.get()
    }

    /// Runs every configured point synchronously.
    pub fn run(
        &mut self,
        config: &DistanceTestConfig,
        progress: Option<DistanceProgressCallback>,
    ) -> Vec<DistanceResult> {
        if self.is_running() {
            return vec![DistanceResult::failure("Test already running")];
        }
        if self.trip_getter.is_none() {
            return vec![DistanceResult::failure("Trip flag getter not configured")];
        }
        if self.phasor_setter.is_none() {
            return vec![DistanceResult::failure("Phasor setter not configured")];
        }
        if config.points.is_empty() {
            return vec![DistanceResult::failure("No test points provided")];
        }

        self.running.set(true);
        self.stop.reset();

        let mut results = Vec::with_capacity(config.points.len());
        for (index, point) in config.points.iter().enumerate() {
            if self.stop.is_stop_requested() {
                results.push(DistanceResult::failure("Test stopped by user"));
                break;
            }

            if let Some(cb) = progress {
                cb(index, config.points.len(), point);
            }

            let result = self.test_point(point, config);
            let failed = !result.passed;
            results.push(result);

            if config.stop_on_first_failure && failed {
                break;
            }
            if index + 1 < config.points.len()
                && !wait_with_stop_check(&self.stop, INTER_POINT_WAIT)
            {
                break;
            }
        }

        self.running.set(false);
        results
    }

    fn test_point(&self, point: &DistancePoint, config: &DistanceTestConfig) -> DistanceResult {
        let mut result = DistanceResult::for_point(point);
        let setter = self.phasor_setter.as_ref().unwrap();
        let getter = self.trip_getter.as_ref().unwrap();

        // Healthy system first.
        setter(&prefault_state(&config.source));
        let prefault = Duration::from_secs_f64(config.prefault_duration.max(0.0));
        if !wait_with_stop_check(&self.stop, prefault) {
            result.error = Some("Test stopped during pre-fault".to_string());
            return result;
        }

        // Fault application opens the monitored window.
        let fault_z = FaultImpedance {
            r: point.r,
            x: point.x,
        };
        let fault_state = calculate_fault(point.fault_type, &fault_z, &config.source);

        trip::clear_trip_flag();
        setter(&fault_state);
        log::info!(
            "distance point {} R={} X={}: fault applied",
            point.fault_type,
            point.r,
            point.x
        );

        let window = Duration::from_secs_f64(config.fault_duration.max(0.0));
        match monitor_trip(getter, &self.stop, window) {
            Some(latency) => {
                result.tripped = true;
                result.trip_time = latency.as_secs_f64();

                if point.expected_time == 0.0 {
                    result.passed = result.trip_time <= config.time_tolerance;
                    if !result.passed {
                        result.error = Some("Trip time too slow for instantaneous zone".into());
                    }
                } else {
                    result.passed =
                        (result.trip_time - point.expected_time).abs() <= config.time_tolerance;
                    if !result.passed {
                        result.error = Some("Trip time outside tolerance".to_string());
                    }
                }
            }
            None => {
                result.error = Some("Relay did not trip within fault duration".to_string());
            }
        }

        // Back to healthy so the relay resets between points.
        setter(&prefault_state(&config.source));
        result
    }
}
