//! Analyzer output contracts over the broadcaster: waveform snapshots with
//! relative timestamps, harmonic reports, and detachment of weak consumers.

use std::sync::Arc;
use std::time::{Duration, Instant};

use vts_core::analyzer::AnalyzerEngine;
use vts_core::broadcaster::{topics, Event, EventBroadcaster};

const STREAM: &str = "01:0C:CD:04:00:20";

fn feed_sine(engine: &Arc<AnalyzerEngine>, rms: f64, n: u64) {
    let now = Instant::now();
    for k in 0..n {
        let t = k as f64 / 4800.0;
        let v = std::f64::consts::SQRT_2 * rms * (2.0 * std::f64::consts::PI * 60.0 * t).sin();
        engine.process_sample(STREAM, "Ch0", v, now + Duration::from_micros(208 * k));
    }
}

#[test]
fn test_waveform_snapshots_use_relative_seconds() {
    let engine = Arc::new(AnalyzerEngine::new());
    let bus = Arc::new(EventBroadcaster::new());
    let (_sub, waveforms) = bus.subscribe(topics::ANALYZER_WAVEFORMS);
    engine.set_broadcaster(&bus);
    engine.start(STREAM, 4800, 60).unwrap();

    feed_sine(&engine, 10.0, 160);

    let deadline = Instant::now() + Duration::from_secs(2);
    let snapshot = loop {
        match waveforms.recv_timeout(Duration::from_millis(100)) {
            Ok(Event::Waveforms { waveforms }) => break waveforms,
            Ok(_) => {}
            Err(_) => assert!(Instant::now() < deadline, "no waveform within 2s"),
        }
    };

    let wf = snapshot.iter().find(|w| w.channel == "Ch0").unwrap();
    assert_eq!(wf.sample_rate, 4800);
    assert_eq!(wf.samples.len(), wf.timestamps.len());
    assert!(!wf.samples.is_empty());

    // Timestamps are seconds relative to the oldest buffered sample:
    // starting at zero, monotonically nondecreasing, spanning under two
    // cycles of a 60 Hz stream.
    assert_eq!(wf.timestamps[0], 0.0);
    for pair in wf.timestamps.windows(2) {
        assert!(pair[1] >= pair[0]);
    }
    let span = *wf.timestamps.last().unwrap();
    assert!(span <= 2.0 / 60.0 + 1e-3, "span {}", span);

    engine.stop();
}

#[test]
fn test_harmonics_topic_carries_full_report() {
    let engine = Arc::new(AnalyzerEngine::new());
    let bus = Arc::new(EventBroadcaster::new());
    let (_sub, harmonics) = bus.subscribe(topics::ANALYZER_HARMONICS);
    engine.set_broadcaster(&bus);
    engine.start(STREAM, 4800, 60).unwrap();

    feed_sine(&engine, 100.0, 160);

    let deadline = Instant::now() + Duration::from_secs(2);
    let frame = loop {
        match harmonics.recv_timeout(Duration::from_millis(100)) {
            Ok(Event::Harmonics { frame }) => break frame,
            Ok(_) => {}
            Err(_) => assert!(Instant::now() < deadline, "no harmonic report within 2s"),
        }
    };

    let ch = frame.channels.iter().find(|c| c.channel == "Ch0").unwrap();
    // Harmonics 2..=15 for an 80-sample cycle.
    assert_eq!(ch.harmonics.len(), 14);
    assert_eq!(ch.harmonics.first().unwrap().order, 2);
    assert_eq!(ch.harmonics.last().unwrap().order, 15);
    // A pure fundamental carries negligible harmonic content.
    assert!(ch.thd_percent < 1.0, "thd {}", ch.thd_percent);
    assert!((ch.rms - 100.0).abs() < 2.0, "rms {}", ch.rms);

    engine.stop();
}

#[test]
fn test_dropped_broadcaster_degrades_gracefully() {
    let engine = Arc::new(AnalyzerEngine::new());
    {
        let bus = Arc::new(EventBroadcaster::new());
        engine.set_broadcaster(&bus);
        // The bus goes away while the analyzer still runs.
    }
    engine.start(STREAM, 4800, 60).unwrap();
    feed_sine(&engine, 10.0, 160);

    // Two analysis periods with no live broadcaster: nothing to observe,
    // but nothing may panic either, and the cached report still updates.
    std::thread::sleep(Duration::from_millis(300));
    assert!(engine.latest_analysis().is_some());
    engine.stop();
}

#[test]
fn test_serialized_analysis_frame_shape() {
    // The broadcaster carries structured payloads; collaborators serialize
    // them at the transport boundary. Verify the shape they rely on.
    let engine = Arc::new(AnalyzerEngine::new());
    engine.start(STREAM, 4800, 60).unwrap();
    feed_sine(&engine, 100.0, 160);

    let deadline = Instant::now() + Duration::from_secs(2);
    let frame = loop {
        if let Some(frame) = engine.latest_analysis() {
            break frame;
        }
        assert!(Instant::now() < deadline);
        std::thread::sleep(Duration::from_millis(20));
    };

    let json = serde_json::to_value(&frame).unwrap();
    assert_eq!(json["streamMac"], STREAM);
    assert_eq!(json["sampleRate"], 4800);
    assert_eq!(json["samplesPerCycle"], 80);
    let ch0 = &json["channels"][0];
    assert_eq!(ch0["channel"], "Ch0");
    assert!(ch0["fundamental"]["magnitude"].as_f64().unwrap() > 90.0);
    assert!(ch0["thdPercent"].is_number());

    engine.stop();
}
