//! # Ramping Tester
//!
//! Steps one quantity (a phase voltage/current, all three phases, or the
//! stream frequency) from a start to an end value and watches the trip flag
//! for the pickup (0 -> 1) and dropoff (1 -> 0) edges. The reset ratio
//! `dropoff / pickup` is computed only when both edges are seen within a
//! single continuous ramp; separate runs are never fused.

use super::{wait_with_stop_check, Flag, StopHandle, TripFlagGetter};
use crate::trip;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::{Duration, Instant};

/// Quantity being ramped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RampVariable {
    VoltageA,
    VoltageB,
    VoltageC,
    Voltage3Ph,
    CurrentA,
    CurrentB,
    CurrentC,
    Current3Ph,
    Frequency,
}

impl FromStr for RampVariable {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "VOLTAGE_A" | "Va" | "va" => Ok(RampVariable::VoltageA),
            "VOLTAGE_B" | "Vb" | "vb" => Ok(RampVariable::VoltageB),
            "VOLTAGE_C" | "Vc" | "vc" => Ok(RampVariable::VoltageC),
            "VOLTAGE_3PH" | "V3ph" | "v3ph" => Ok(RampVariable::Voltage3Ph),
            "CURRENT_A" | "Ia" | "ia" => Ok(RampVariable::CurrentA),
            "CURRENT_B" | "Ib" | "ib" => Ok(RampVariable::CurrentB),
            "CURRENT_C" | "Ic" | "ic" => Ok(RampVariable::CurrentC),
            "CURRENT_3PH" | "I3ph" | "i3ph" => Ok(RampVariable::Current3Ph),
            "FREQUENCY" | "freq" | "f" => Ok(RampVariable::Frequency),
            other => Err(format!("unknown ramp variable: {}", other)),
        }
    }
}

/// Ramp run parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RampConfig {
    pub variable: RampVariable,
    pub start_value: f64,
    pub end_value: f64,
    pub step_size: f64,
    /// Dwell at each step, in seconds.
    pub step_duration: f64,
    pub monitor_trip: bool,
    pub stream_id: String,
}

/// Ramp outcome.
///
/// # Fields
///
/// * `completed`: The ramp ran to its end value (or to a detected error).
/// * `pickup_value` / `pickup_time`: Value and elapsed seconds at the first
///   0 -> 1 trip edge.
/// * `dropoff_value` / `dropoff_time`: Value and elapsed seconds at the
///   following 1 -> 0 edge.
/// * `reset_ratio`: `dropoff / pickup` when both edges were observed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RampResult {
    pub completed: bool,
    pub pickup_value: f64,
    pub dropoff_value: f64,
    pub reset_ratio: f64,
    pub pickup_time: f64,
    pub dropoff_time: f64,
    pub total_duration: f64,
    pub error: Option<String>,
}

/// Progress callback: `(current_value, percent_done, trip_state)`.
pub type RampProgressCallback<'a> = &'a (dyn Fn(f64, f64, bool) + Send + Sync);

/// Ramp orchestrator. The value setter is injected by the caller (usually a
/// registry channel-role helper).
pub struct RampingTester {
    trip_getter: Option<TripFlagGetter>,
    value_setter: Option<Box<dyn Fn(RampVariable, f64) + Send>>,
    stop: StopHandle,
    running: Flag,
}

impl Default for RampingTester {
    fn default() -> Self {
        Self::new()
    }
}

impl RampingTester {
    pub fn new() -> Self {
        RampingTester {
            trip_getter: None,
            value_setter: None,
            stop: StopHandle::new(),
            running: Flag::default(),
        }
    }

    /// Installs the trip flag reader sampled after every step dwell.
    pub fn set_trip_flag_getter(&mut self, getter: TripFlagGetter) {
        self.trip_getter = Some(getter);
    }

    /// Installs the setter that writes each step value onto the stream
    /// (a registry channel-role helper in the usual wiring).
    pub fn set_value_setter(&mut self, setter: Box<dyn Fn(RampVariable, f64) + Send>) {
        self.value_setter = Some(setter);
    }

    /// Handle for requesting a stop from another thread.
    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    pub fn is_running(&self) -> bool {
        self.running.get()
    }

    /// Runs one ramp synchronously.
    pub fn run(
        &mut self,
        config: &RampConfig,
        progress: Option<RampProgressCallback>,
    ) -> RampResult {
        if self.is_running() {
            return RampResult {
                error: Some("Test already running".to_string()),
                ..Default::default()
            };
        }
        self.running.set(true);
        self.stop.reset();
        let result = self.execute(config, progress);
        self.running.set(false);
        result
    }

    fn execute(
        &mut self,
        config: &RampConfig,
        progress: Option<RampProgressCallback>,
    ) -> RampResult {
        let mut result = RampResult::default();

        let Some(setter) = self.value_setter.as_ref() else {
            result.error = Some("Value setter not configured".to_string());
            return result;
        };
        if config.monitor_trip && self.trip_getter.is_none() {
            result.error = Some("Trip flag getter not configured but monitoring requested".into());
            return result;
        }
        if config.step_size.abs() < 1e-9 {
            result.error = Some("Step size too small".to_string());
            return result;
        }

        let increasing = config.end_value > config.start_value;
        if (increasing && config.step_size < 0.0) || (!increasing && config.step_size > 0.0) {
            result.error = Some("Step size direction doesn't match start/end values".to_string());
            return result;
        }

        let range = (config.end_value - config.start_value).abs();
        let num_steps = (range / config.step_size.abs()).ceil() as i64;
        if num_steps < 1 {
            result.error = Some("Invalid number of steps".to_string());
            return result;
        }

        let test_start = Instant::now();
        let step_duration = Duration::from_secs_f64(config.step_duration.max(0.0));

        // The whole ramp is one monitored window: clear the process flag,
        // then take the relay's current state as the edge baseline.
        let mut prev_trip = false;
        let mut pickup_seen = false;
        let mut dropoff_seen = false;
        if config.monitor_trip {
            trip::clear_trip_flag();
            prev_trip = self.trip_getter.as_ref().unwrap()();
        }

        let mut current_value = config.start_value;
        for step in 0..=num_steps {
            if self.stop.is_stop_requested() {
                result.error = Some("Test stopped by user".to_string());
                return result;
            }

            setter(config.variable, current_value);

            if !wait_with_stop_check(&self.stop, step_duration) {
                result.error = Some("Test stopped by user".to_string());
                return result;
            }

            let mut trip_now = false;
            if config.monitor_trip {
                let getter = self.trip_getter.as_ref().unwrap();
                trip_now = getter();

                if !prev_trip && trip_now && !pickup_seen {
                    pickup_seen = true;
                    result.pickup_value = current_value;
                    result.pickup_time = test_start.elapsed().as_secs_f64();
                    log::info!(
                        "ramp pickup at {:.3} after {:.3}s",
                        result.pickup_value,
                        result.pickup_time
                    );
                }
                if prev_trip && !trip_now && !dropoff_seen {
                    dropoff_seen = true;
                    result.dropoff_value = current_value;
                    result.dropoff_time = test_start.elapsed().as_secs_f64();
                    log::info!(
                        "ramp dropoff at {:.3} after {:.3}s",
                        result.dropoff_value,
                        result.dropoff_time
                    );
                }
                prev_trip = trip_now;
            }

            if let Some(cb) = progress {
                cb(current_value, step as f64 * 100.0 / num_steps as f64, trip_now);
            }

            if step < num_steps {
                current_value += config.step_size;
                if increasing {
                    current_value = current_value.min(config.end_value);
                } else {
                    current_value = current_value.max(config.end_value);
                }
            }
        }

        result.total_duration = test_start.elapsed().as_secs_f64();
        if pickup_seen && dropoff_seen && result.pickup_value.abs() > 1e-9 {
            result.reset_ratio = result.dropoff_value / result.pickup_value;
        }
        result.completed = true;
        result
    }
}
