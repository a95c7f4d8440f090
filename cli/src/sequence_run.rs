//! # Sequence Runner
//!
//! Loads a JSON description of streams plus a state sequence, creates the
//! streams on the bound interface, and executes the sequence with progress
//! printed to stdout. Stream entries are referenced by name in the state
//! phasor maps; names are resolved to registry ids at load time.

use std::collections::BTreeMap;
use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use vts_core::registry::PublisherRegistry;
use vts_core::io;
use vts_core::publisher::PublisherConfig;
use vts_core::sequence::{Sequence, SequenceEngine, SequenceState, SequenceStatus};
use vts_core::timing::Timer;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StreamEntry {
    name: String,
    #[serde(default)]
    config: PublisherConfig,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SequenceFile {
    streams: Vec<StreamEntry>,
    states: Vec<SequenceState>,
    active_streams: Vec<String>,
}

pub fn run(config_path: &str, interface: &str) -> Result<(), Box<dyn std::error::Error>> {
    let text = fs::read_to_string(config_path)?;
    let file: SequenceFile = serde_json::from_str(&text)?;

    let registry = Arc::new(PublisherRegistry::new(io::bind(interface)?));

    // Create the streams and remember name -> id.
    let mut ids = BTreeMap::new();
    let mut max_rate = 1u32;
    for entry in &file.streams {
        max_rate = max_rate.max(entry.config.sample_rate);
        let id = registry.create(entry.config.clone())?;
        registry.start(&id)?;
        log::info!("stream '{}' -> {}", entry.name, id);
        ids.insert(entry.name.clone(), id);
    }

    let resolve = |name: &str| -> Result<String, String> {
        ids.get(name)
            .cloned()
            .ok_or_else(|| format!("unknown stream name '{}'", name))
    };

    // Rewrite the sequence from stream names to registry ids.
    let mut states = Vec::with_capacity(file.states.len());
    for state in file.states {
        let SequenceState {
            name,
            duration_sec,
            transition,
            phasors,
        } = state;
        let mut mapped = BTreeMap::new();
        for (stream_name, update) in phasors {
            mapped.insert(resolve(&stream_name)?, update);
        }
        states.push(SequenceState {
            name,
            duration_sec,
            transition,
            phasors: mapped,
        });
    }
    let active_streams = file
        .active_streams
        .iter()
        .map(|name| resolve(name))
        .collect::<Result<Vec<_>, _>>()?;

    // Tick loop at the fastest stream period.
    let tick_stop = Arc::new(AtomicBool::new(false));
    let tick_handle = {
        let registry = Arc::clone(&registry);
        let stop = Arc::clone(&tick_stop);
        let period = Duration::from_nanos(1_000_000_000 / max_rate as u64);
        std::thread::spawn(move || {
            let mut timer = Timer::start_period(period);
            while !stop.load(Ordering::Acquire) {
                registry.tick_all();
                timer.wait_period(period);
            }
        })
    };

    let engine = SequenceEngine::new();
    let registry_cb = Arc::clone(&registry);
    engine.set_phasor_update_callback(Box::new(move |stream_id, update| {
        if let Err(e) = registry_cb.update_stream_phasors(stream_id, update) {
            log::warn!("phasor update for '{}' failed: {}", stream_id, e);
        }
    }));
    engine.set_progress_callback(Box::new(|current, total, name, elapsed, message| {
        println!("[{:>6.2}s] ({}/{}) {}: {}", elapsed, current + 1, total, name, message);
    }));

    engine.start(Sequence {
        states,
        active_streams,
    })?;

    loop {
        let status = engine.status();
        if status != SequenceStatus::Running && status != SequenceStatus::Paused {
            println!("sequence finished: {:?}", status);
            break;
        }
        std::thread::sleep(Duration::from_millis(100));
    }

    tick_stop.store(true, Ordering::Release);
    let _ = tick_handle.join();
    registry.stop_all();
    Ok(())
}
