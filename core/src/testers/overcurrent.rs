//! # Inverse-Time Overcurrent Tester
//!
//! Drives test currents at configured multiples of the pickup setting and
//! compares the measured trip time against the IDMT curve:
//!
//! - IEC curves: `t = TMS * k / (M^alpha - 1)` with Standard/Very/Extremely/
//!   Long-Time Inverse constants;
//! - IEEE curves: `t = TMS * (A / (M^p - 1) + B)`;
//! - Definite-Time: `t = TMS`; Instantaneous: `t = 0`.
//!
//! A multiple at or below 1.0 never trips (expected time is infinite).
//! Tolerance is absolute seconds or a percentage of the expected time.

use super::{monitor_trip, wait_with_stop_check, Flag, StopHandle, TripFlagGetter, INTER_POINT_WAIT};
use crate::trip;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

/// IDMT curve families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OcCurve {
    StandardInverse,
    VeryInverse,
    ExtremelyInverse,
    LongTimeInverse,
    IeeeModeratelyInverse,
    IeeeVeryInverse,
    IeeeExtremelyInverse,
    DefiniteTime,
    Instantaneous,
}

impl FromStr for OcCurve {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SI" | "STANDARD_INVERSE" => Ok(OcCurve::StandardInverse),
            "VI" | "VERY_INVERSE" => Ok(OcCurve::VeryInverse),
            "EI" | "EXTREMELY_INVERSE" => Ok(OcCurve::ExtremelyInverse),
            "LTI" | "LONG_TIME_INVERSE" => Ok(OcCurve::LongTimeInverse),
            "MI" | "IEEE_MODERATELY_INVERSE" => Ok(OcCurve::IeeeModeratelyInverse),
            "IEEE_VI" | "IEEE_VERY_INVERSE" => Ok(OcCurve::IeeeVeryInverse),
            "IEEE_EI" | "IEEE_EXTREMELY_INVERSE" => Ok(OcCurve::IeeeExtremelyInverse),
            "DT" | "DEFINITE_TIME" => Ok(OcCurve::DefiniteTime),
            "INST" | "INSTANTANEOUS" => Ok(OcCurve::Instantaneous),
            other => Err(format!("unknown overcurrent curve: {}", other)),
        }
    }
}

/// Expected trip time for a curve at multiple `m = I / Ipickup`.
pub fn calculate_idmt(curve: OcCurve, tms: f64, m: f64) -> f64 {
    if m <= 1.0 {
        return f64::INFINITY;
    }

    match curve {
        // IEC 60255: t = TMS * k / (M^alpha - 1)
        OcCurve::StandardInverse => tms * 0.14 / (m.powf(0.02) - 1.0),
        OcCurve::VeryInverse => tms * 13.5 / (m - 1.0),
        OcCurve::ExtremelyInverse => tms * 80.0 / (m.powf(2.0) - 1.0),
        OcCurve::LongTimeInverse => tms * 120.0 / (m - 1.0),
        // IEEE C37.112: t = TMS * (A / (M^p - 1) + B)
        OcCurve::IeeeModeratelyInverse => tms * (0.0515 / (m.powf(0.02) - 1.0) + 0.114),
        OcCurve::IeeeVeryInverse => tms * (19.61 / (m.powf(2.0) - 1.0) + 0.491),
        OcCurve::IeeeExtremelyInverse => tms * (28.2 / (m.powf(2.0) - 1.0) + 0.1217),
        OcCurve::DefiniteTime => tms,
        OcCurve::Instantaneous => 0.0,
    }
}

/// Relay settings under test.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OcSettings {
    pub pickup_current: f64,
    pub tms: f64,
    pub curve: OcCurve,
}

/// One test point at a current multiple of pickup.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OcPoint {
    pub current_multiple: f64,
    #[serde(default)]
    pub label: String,
}

/// Overcurrent run parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OcTestConfig {
    pub settings: OcSettings,
    pub points: Vec<OcPoint>,
    pub time_tolerance: f64,
    pub tolerance_is_percent: bool,
    /// Per-point monitoring window, seconds.
    pub max_test_duration: f64,
    pub stop_on_first_failure: bool,
    pub stream_id: String,
}

/// Outcome of one point.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OcResult {
    pub current_multiple: f64,
    pub actual_current: f64,
    pub expected_time: f64,
    pub measured_time: f64,
    pub tripped: bool,
    pub passed: bool,
    pub error: Option<String>,
}

/// Progress callback: `(point_index, total_points, point)`.
pub type OcProgressCallback<'a> = &'a (dyn Fn(usize, usize, &OcPoint) + Send + Sync);

/// Overcurrent orchestrator; the current setter is injected by the caller.
pub struct OvercurrentTester {
    trip_getter: Option<TripFlagGetter>,
    current_setter: Option<Box<dyn Fn(f64) + Send>>,
    stop: StopHandle,
    running: Flag,
}

impl Default for OvercurrentTester {
    fn default() -> Self {
        Self::new()
    }
}

impl OvercurrentTester {
    pub fn new() -> Self {
        OvercurrentTester {
            trip_getter: None,
            current_setter: None,
            stop: StopHandle::new(),
            running: Flag::default(),
        }
    }

    /// Installs the trip flag reader polled during each monitored window.
    pub fn set_trip_flag_getter(&mut self, getter: TripFlagGetter) {
        self.trip_getter = Some(getter);
    }

    /// Installs the setter that drives the test current onto the stream's
    /// current channels.
    pub fn set_current_setter(&mut self, setter: Box<dyn Fn(f64) + Send>) {
        self.current_setter = Some(setter);
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
        config: &OcTestConfig,
        progress: Option<OcProgressCallback>,
    ) -> Vec<OcResult> {
        if self.is_running() {
            return vec![OcResult {
                error: Some("Test already running".to_string()),
                ..Default::default()
            }];
        }
        if self.trip_getter.is_none() {
            return vec![OcResult {
                error: Some("Trip flag getter not configured".to_string()),
                ..Default::default()
            }];
        }
        if self.current_setter.is_none() {
            return vec![OcResult {
                error: Some("Current setter not configured".to_string()),
                ..Default::default()
            }];
        }
        if config.points.is_empty() {
            return vec![OcResult {
                error: Some("No test points provided".to_string()),
                ..Default::default()
            }];
        }

        self.running.set(true);
        self.stop.reset();

        let mut results = Vec::with_capacity(config.points.len());
        for (index, point) in config.points.iter().enumerate() {
            if self.stop.is_stop_requested() {
                results.push(OcResult {
                    error: Some("Test stopped by user".to_string()),
                    ..Default::default()
                });
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

    fn test_point(&self, point: &OcPoint, config: &OcTestConfig) -> OcResult {
        let mut result = OcResult {
            current_multiple: point.current_multiple,
            actual_current: config.settings.pickup_current * point.current_multiple,
            expected_time: calculate_idmt(
                config.settings.curve,
                config.settings.tms,
                point.current_multiple,
            ),
            ..Default::default()
        };

        let setter = self.current_setter.as_ref().unwrap();
        let getter = self.trip_getter.as_ref().unwrap();

        trip::clear_trip_flag();
        setter(result.actual_current);

        let window = Duration::from_secs_f64(config.max_test_duration.max(0.0));
        match monitor_trip(getter, &self.stop, window) {
            Some(latency) => {
                result.tripped = true;
                result.measured_time = latency.as_secs_f64();

                if result.expected_time.is_infinite() {
                    result.passed = false;
                    result.error = Some("Relay tripped at or below pickup".to_string());
                } else {
                    let tolerance = if config.tolerance_is_percent {
                        result.expected_time * config.time_tolerance / 100.0
                    } else {
                        config.time_tolerance
                    };
                    result.passed =
                        (result.measured_time - result.expected_time).abs() <= tolerance;
                    if !result.passed {
                        result.error = Some("Trip time outside tolerance".to_string());
                    }
                }
            }
            None => {
                result.tripped = false;
                if result.expected_time.is_infinite() {
                    // Below pickup the relay must stay quiet.
                    result.passed = true;
                } else {
                    result.passed = false;
                    result.error =
                        Some("Relay did not trip within max test duration".to_string());
                }
            }
        }

        result
    }
}
