//! Test drivers against a simulated relay on the process trip flag, wired
//! to a real registry over the loopback hub where phasors matter.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use vts_core::registry::PublisherRegistry;
use vts_core::io::loopback::LoopbackHub;
use vts_core::publisher::PublisherConfig;
use vts_core::testers::differential::{
    side_currents, DifferentialPoint, DifferentialTestConfig, DifferentialTester,
};
use vts_core::testers::distance::{DistancePoint, DistanceTestConfig, DistanceTester};
use vts_core::testers::impedance::{FaultType, SourceImpedance};
use vts_core::testers::overcurrent::{
    calculate_idmt, OcCurve, OcPoint, OcSettings, OcTestConfig, OvercurrentTester,
};
use vts_core::testers::ramp::{RampConfig, RampVariable, RampingTester};
use vts_core::trip;

static TRIP_TESTS: Mutex<()> = Mutex::new(());

fn lock_trip() -> std::sync::MutexGuard<'static, ()> {
    TRIP_TESTS.lock().unwrap_or_else(|e| e.into_inner())
}

fn test_source() -> SourceImpedance {
    SourceImpedance {
        rs1: 1.0,
        xs1: 10.0,
        rs0: 2.0,
        xs0: 30.0,
        v_prefault: 66395.0,
    }
}

/// Raises the trip flag after `delay`.
fn trip_after(delay: Duration) {
    std::thread::spawn(move || {
        std::thread::sleep(delay);
        trip::set_trip_flag();
    });
}

#[test]
fn test_distance_zone1_point_passes() {
    let _guard = lock_trip();
    trip::clear_trip_flag();

    let registry = Arc::new(PublisherRegistry::new(LoopbackHub::bind("testers-distance")));
    let id = registry.create(PublisherConfig::default()).unwrap();
    registry.start(&id).unwrap();

    let mut tester = DistanceTester::new();
    let registry_cb = Arc::clone(&registry);
    let stream = id.clone();
    tester.set_phasor_setter(Box::new(move |state| {
        registry_cb.apply_phasor_state(&stream, state).unwrap();
        // Simulated relay: a zone-1 fault trips 50 ms after current appears.
        if state.current.a.norm() > 1.0 {
            trip_after(Duration::from_millis(50));
        }
    }));
    tester.set_trip_flag_getter(Box::new(trip::is_trip_flag_set));

    let config = DistanceTestConfig {
        points: vec![DistancePoint {
            r: 5.0,
            x: 5.0,
            fault_type: FaultType::ABC,
            expected_time: 0.05,
            label: "Z1".to_string(),
        }],
        source: test_source(),
        prefault_duration: 0.1,
        fault_duration: 0.2,
        time_tolerance: 0.05,
        stop_on_first_failure: false,
        stream_id: id.clone(),
    };

    let results = tester.run(&config, None);
    assert_eq!(results.len(), 1);
    let r = &results[0];
    assert!(r.tripped, "error: {:?}", r.error);
    assert!(r.passed, "trip time {}", r.trip_time);
    assert!(
        r.trip_time >= 0.040 && r.trip_time <= 0.075,
        "trip time {} outside the simulated 50 ms relay",
        r.trip_time
    );

    // Fault phasors actually landed on the stream: current channels carry
    // the solver's magnitudes at some point; after the run the healthy
    // state is restored (zero current).
    let phasors = registry.phasors(&id).unwrap();
    assert!(phasors[3].magnitude < 1e-6, "post-run current is zero");
    assert!(phasors[0].magnitude > 0.0, "post-run voltage is nominal");

    trip::clear_trip_flag();
}

#[test]
fn test_overcurrent_iec_si_curve_point() {
    let _guard = lock_trip();
    trip::clear_trip_flag();

    let registry = Arc::new(PublisherRegistry::new(LoopbackHub::bind("testers-oc")));
    let id = registry.create(PublisherConfig::default()).unwrap();

    let mut tester = OvercurrentTester::new();
    let registry_cb = Arc::clone(&registry);
    let stream = id.clone();
    tester.set_current_setter(Box::new(move |current| {
        registry_cb.set_current_magnitudes(&stream, current).unwrap();
        // Simulated relay close to the SI curve at M = 2 (~1.00 s).
        trip_after(Duration::from_millis(1000));
    }));
    tester.set_trip_flag_getter(Box::new(trip::is_trip_flag_set));

    let config = OcTestConfig {
        settings: OcSettings {
            pickup_current: 100.0,
            tms: 0.1,
            curve: OcCurve::StandardInverse,
        },
        points: vec![OcPoint {
            current_multiple: 2.0,
            label: "M2".to_string(),
        }],
        time_tolerance: 10.0,
        tolerance_is_percent: true,
        max_test_duration: 3.0,
        stop_on_first_failure: false,
        stream_id: id.clone(),
    };

    let results = tester.run(&config, None);
    let r = &results[0];
    assert!((r.expected_time - 1.0).abs() < 0.01, "expected {}", r.expected_time);
    assert!(r.tripped, "error: {:?}", r.error);
    assert!(r.passed, "measured {}", r.measured_time);
    assert_eq!(r.actual_current, 200.0);

    // The injected current reached the stream's current channels.
    let phasors = registry.phasors(&id).unwrap();
    assert_eq!(phasors[3].magnitude, 200.0);
    assert_eq!(phasors[5].magnitude, 200.0);

    trip::clear_trip_flag();
}

#[test]
fn test_differential_side_currents_on_two_streams() {
    let _guard = lock_trip();
    trip::clear_trip_flag();

    let registry = Arc::new(PublisherRegistry::new(LoopbackHub::bind("testers-diff")));
    let id1 = registry.create(PublisherConfig::default()).unwrap();
    let mut config2 = PublisherConfig::default();
    config2.mac_dst = "01:0C:CD:04:00:02".to_string();
    let id2 = registry.create(config2).unwrap();

    let mut tester = DifferentialTester::new();
    let r1 = Arc::clone(&registry);
    let s1 = id1.clone();
    tester.set_side1_current_setter(Box::new(move |i| {
        r1.set_current_magnitudes(&s1, i).unwrap();
        trip_after(Duration::from_millis(30));
    }));
    let r2 = Arc::clone(&registry);
    let s2 = id2.clone();
    tester.set_side2_current_setter(Box::new(move |i| {
        r2.set_current_magnitudes(&s2, i).unwrap();
    }));
    tester.set_trip_flag_getter(Box::new(trip::is_trip_flag_set));

    let config = DifferentialTestConfig {
        points: vec![DifferentialPoint {
            ir: 200.0,
            id: 50.0,
            expected_time: 0.0,
            label: String::new(),
        }],
        time_tolerance: 0.1,
        max_test_duration: 1.0,
        stop_on_first_failure: false,
        stream1_id: id1.clone(),
        stream2_id: id2.clone(),
    };

    let results = tester.run(&config, None);
    let r = &results[0];
    assert!(r.tripped && r.passed, "error: {:?}", r.error);
    assert_eq!((r.is1, r.is2), side_currents(200.0, 50.0));

    assert_eq!(registry.phasors(&id1).unwrap()[3].magnitude, 225.0);
    assert_eq!(registry.phasors(&id2).unwrap()[3].magnitude, -175.0);

    trip::clear_trip_flag();
}

#[test]
fn test_ramp_pickup_against_registry() {
    let _guard = lock_trip();
    trip::clear_trip_flag();

    let registry = Arc::new(PublisherRegistry::new(LoopbackHub::bind("testers-ramp")));
    let id = registry.create(PublisherConfig::default()).unwrap();

    let mut tester = RampingTester::new();
    let registry_cb = Arc::clone(&registry);
    let stream = id.clone();
    tester.set_value_setter(Box::new(move |variable, value| {
        match variable {
            RampVariable::Voltage3Ph => {
                registry_cb.set_voltage_magnitudes(&stream, value).unwrap()
            }
            RampVariable::Frequency => registry_cb.set_frequency(&stream, value).unwrap(),
            _ => {}
        }
        // Simulated relay picks up at 55 V.
        if value >= 55.0 {
            trip::set_trip_flag();
        } else {
            trip::clear_trip_flag();
        }
    }));
    tester.set_trip_flag_getter(Box::new(trip::is_trip_flag_set));

    let config = RampConfig {
        variable: RampVariable::Voltage3Ph,
        start_value: 0.0,
        end_value: 100.0,
        step_size: 5.0,
        step_duration: 0.01,
        monitor_trip: true,
        stream_id: id.clone(),
    };

    let result = tester.run(&config, None);
    assert!(result.completed, "error: {:?}", result.error);
    assert!(
        (50.0..=60.0).contains(&result.pickup_value),
        "pickup {}",
        result.pickup_value
    );
    assert!(
        result.pickup_time >= 0.100 && result.pickup_time <= 0.200,
        "pickup time {}",
        result.pickup_time
    );

    // The ramp really drove the stream.
    let phasors = registry.phasors(&id).unwrap();
    assert_eq!(phasors[0].magnitude, 100.0);

    trip::clear_trip_flag();
}

#[test]
fn test_overcurrent_below_pickup_stays_quiet() {
    let _guard = lock_trip();
    trip::clear_trip_flag();

    let mut tester = OvercurrentTester::new();
    tester.set_current_setter(Box::new(|_| {}));
    tester.set_trip_flag_getter(Box::new(trip::is_trip_flag_set));

    let config = OcTestConfig {
        settings: OcSettings {
            pickup_current: 100.0,
            tms: 0.1,
            curve: OcCurve::StandardInverse,
        },
        points: vec![OcPoint {
            current_multiple: 0.8,
            label: "below-pickup".to_string(),
        }],
        time_tolerance: 0.05,
        tolerance_is_percent: false,
        max_test_duration: 0.2,
        stop_on_first_failure: false,
        stream_id: "s".to_string(),
    };

    let results = tester.run(&config, None);
    assert!(results[0].expected_time.is_infinite());
    assert!(!results[0].tripped);
    assert!(results[0].passed, "no trip below pickup is a pass");

    let t = calculate_idmt(OcCurve::StandardInverse, 0.1, 0.8);
    assert!(t.is_infinite());
}

#[test]
fn test_stop_handle_interrupts_run_from_other_thread() {
    let _guard = lock_trip();
    trip::clear_trip_flag();

    let mut tester = OvercurrentTester::new();
    tester.set_current_setter(Box::new(|_| {}));
    tester.set_trip_flag_getter(Box::new(trip::is_trip_flag_set));
    let stop = tester.stop_handle();

    std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(100));
        stop.request_stop();
    });

    let config = OcTestConfig {
        settings: OcSettings {
            pickup_current: 100.0,
            tms: 0.1,
            curve: OcCurve::StandardInverse,
        },
        points: vec![
            OcPoint {
                current_multiple: 2.0,
                label: String::new(),
            },
            OcPoint {
                current_multiple: 3.0,
                label: String::new(),
            },
        ],
        time_tolerance: 0.05,
        tolerance_is_percent: false,
        max_test_duration: 10.0,
        stop_on_first_failure: false,
        stream_id: "s".to_string(),
    };

    let t0 = Instant::now();
    let results = tester.run(&config, None);
    assert!(t0.elapsed() < Duration::from_secs(2), "stop cut the run short");
    assert!(!results.is_empty());
}
