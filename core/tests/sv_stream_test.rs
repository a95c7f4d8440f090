//! End-to-end Sampled Values path over the loopback hub: registry-driven
//! publishers on one side, a capture port decoding frames on the other.

use std::collections::HashSet;
use std::time::Duration;

use vts_core::iec61850::sampled_values::parse_sv_frame;
use vts_core::io::loopback::LoopbackHub;
use vts_core::publisher::{PublisherConfig, SvPublisher};
use vts_core::registry::PublisherRegistry;
use vts_core::synthesis::Phasor;

fn four_channel_config() -> PublisherConfig {
    PublisherConfig {
        app_id: 0x4000,
        sv_id: "TestSV01".to_string(),
        sample_rate: 4800,
        channel_count: 4,
        ..PublisherConfig::default()
    }
}

fn standard_phasors() -> Vec<Phasor> {
    vec![
        Phasor::new(100.0, 0.0),
        Phasor::new(100.0, -120.0),
        Phasor::new(100.0, 120.0),
        Phasor::new(10.0, 0.0),
    ]
}

#[test]
fn test_full_second_of_ticks_counts_to_sample_rate() {
    let hub = "sv-stream-full-second";
    let capture = LoopbackHub::bind(hub);
    let port = LoopbackHub::bind(hub);

    let mut publisher = SvPublisher::new("s1".into(), four_channel_config(), port).unwrap();
    publisher.set_phasors(standard_phasors());
    publisher.start();

    // The decoded smpCnt series is exactly 0..4799 and every ASDU carries
    // 8 * 4 = 32 bytes of sample data. Drain after every tick so the
    // bounded capture queue never overflows.
    let mut expected = 0u16;
    for _ in 0..4800 {
        publisher.tick();
        while let Some(frame) = capture.recv(Duration::ZERO).unwrap() {
            let info = parse_sv_frame(&frame).expect("captured frame must decode");
            assert_eq!(info.app_id, 0x4000);
            let asdu = &info.asdus[0];
            assert_eq!(asdu.sv_id, "TestSV01");
            assert_eq!(asdu.smp_cnt, expected);
            assert_eq!(asdu.samples.len(), 4);
            expected += 1;
        }
    }
    assert_eq!(expected, 4800, "all 4800 frames observed in order");

    // The counter wrapped back to zero at the sample rate.
    assert_eq!(publisher.sample_counter(), 0);
}

#[test]
fn test_waveform_amplitude_within_headroom() {
    // A 1.0 RMS phasor must produce a clean sine in the wire samples with
    // peak sqrt(2) * scale, nowhere near the clamp.
    let hub = "sv-stream-amplitude";
    let capture = LoopbackHub::bind(hub);
    let port = LoopbackHub::bind(hub);

    let mut config = four_channel_config();
    config.channel_count = 1;
    let mut publisher = SvPublisher::new("s1".into(), config, port).unwrap();
    publisher.set_phasors(vec![Phasor::new(1.0, 0.0)]);
    publisher.start();

    for _ in 0..80 {
        publisher.tick();
    }

    let mut values = Vec::new();
    while let Some(frame) = capture.recv(Duration::from_millis(200)).unwrap() {
        let info = parse_sv_frame(&frame).unwrap();
        values.push(info.asdus[0].samples[0].0);
        if values.len() == 80 {
            break;
        }
    }

    let peak = values.iter().map(|v| v.abs()).max().unwrap();
    let expected_peak = (std::f64::consts::SQRT_2 * vts_core::synthesis::AMPLITUDE_SCALE) as i32;
    assert!(
        (peak - expected_peak).abs() <= 2,
        "peak {} expected {}",
        peak,
        expected_peak
    );
    // One full cycle sums to approximately zero.
    let sum: i64 = values.iter().map(|&v| v as i64).sum();
    assert!(sum.abs() < 200, "cycle sum {}", sum);
}

#[test]
fn test_registry_drives_multiple_streams() {
    let hub = "sv-stream-registry";
    let capture = LoopbackHub::bind(hub);
    let registry = PublisherRegistry::new(LoopbackHub::bind(hub));

    let id_a = registry.create(four_channel_config()).unwrap();
    let mut config_b = four_channel_config();
    config_b.sv_id = "TestSV02".to_string();
    config_b.mac_dst = "01:0C:CD:04:00:02".to_string();
    let id_b = registry.create(config_b).unwrap();

    registry.update_phasors(&id_a, standard_phasors()).unwrap();
    registry.start(&id_a).unwrap();
    registry.start(&id_b).unwrap();

    for _ in 0..5 {
        registry.tick_all();
    }

    let mut seen = HashSet::new();
    while let Some(frame) = capture.recv(Duration::from_millis(300)).unwrap() {
        let info = parse_sv_frame(&frame).unwrap();
        seen.insert(info.asdus[0].sv_id.clone());
        if seen.len() == 2 {
            break;
        }
    }
    assert!(seen.contains("TestSV01") && seen.contains("TestSV02"));

    // Stopping one stream silences it but not the other.
    registry.stop(&id_a).unwrap();
    while capture.recv(Duration::from_millis(100)).unwrap().is_some() {}
    registry.tick_all();
    let mut svs_after_stop = HashSet::new();
    while let Some(frame) = capture.recv(Duration::from_millis(200)).unwrap() {
        svs_after_stop.insert(parse_sv_frame(&frame).unwrap().asdus[0].sv_id.clone());
        if svs_after_stop.contains("TestSV02") {
            break;
        }
    }
    assert!(!svs_after_stop.contains("TestSV01"));
    assert!(svs_after_stop.contains("TestSV02"));

    registry.delete(&id_b).unwrap();
    assert_eq!(registry.list().len(), 1);
}

#[test]
fn test_random_configs_create_distinct_streams() {
    use rand::SeedableRng;
    use vts_core::iec61850::random::random_publisher_config;

    let registry = PublisherRegistry::new(LoopbackHub::bind("sv-stream-random"));
    let mut rng = rand::rngs::StdRng::seed_from_u64(92);

    for _ in 0..5 {
        let config = random_publisher_config(&mut rng);
        let id = registry.create(config).expect("generated config is valid");
        registry.start(&id).unwrap();
    }
    assert_eq!(registry.list().len(), 5);
    registry.tick_all();
    registry.stop_all();
    assert!(registry.list().iter().all(|s| !s.running));
}

#[test]
fn test_phasor_update_changes_next_tick() {
    let hub = "sv-stream-phasor-update";
    let capture = LoopbackHub::bind(hub);
    let registry = PublisherRegistry::new(LoopbackHub::bind(hub));

    let mut config = four_channel_config();
    config.channel_count = 1;
    let id = registry.create(config).unwrap();
    registry.start(&id).unwrap();

    registry.tick_all();
    let silent = capture.recv(Duration::from_millis(200)).unwrap().unwrap();
    assert_eq!(
        parse_sv_frame(&silent).unwrap().asdus[0].samples[0].0,
        0,
        "zero phasors produce zero samples"
    );

    // Update phasors; the angle puts the very next sample at the peak.
    registry
        .update_phasors(&id, vec![Phasor::new(1.0, 90.0)])
        .unwrap();
    registry.tick_all();
    let live = capture.recv(Duration::from_millis(200)).unwrap().unwrap();
    let value = parse_sv_frame(&live).unwrap().asdus[0].samples[0].0;
    assert!(value > 0, "new phasors take effect on the next tick");
}
