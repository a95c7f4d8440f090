//! # Live Stream Analyzer
//!
//! Consumes the SV samples the sniffer captures and turns them into phasor,
//! harmonic and waveform reports. Each channel owns a bounded ring of
//! `(value, monotonic timestamp)` pairs holding two nominal cycles. A
//! dedicated thread runs two cadences:
//!
//! - at 10 Hz, a naive one-cycle DFT per channel: fundamental magnitude and
//!   angle, harmonics 2-15, THD and a zero-crossing frequency estimate;
//! - at 60 Hz, a waveform snapshot per channel with per-sample timestamps
//!   relative to the oldest buffered sample.
//!
//! Both outputs go to the event broadcaster. The O(N^2) DFT is intentional:
//! at one cycle of data per channel and 10 Hz it is far from the bottleneck,
//! and the per-channel pass runs on rayon when several channels are active.

use crate::broadcaster::{topics, Event, EventBroadcaster};
use crate::iec61850::utils::epoch_micros;
use num_complex::Complex64;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

const ANALYSIS_INTERVAL: Duration = Duration::from_millis(100); // 10 Hz
const WAVEFORM_INTERVAL: Duration = Duration::from_millis(16); // ~60 Hz
const IDLE_SLEEP: Duration = Duration::from_millis(5);
const MAX_HARMONIC: usize = 15;

/// Errors reported by the analyzer control surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnalyzerError {
    AlreadyRunning { message: String },
    InvalidConfig { message: String },
}

impl fmt::Display for AnalyzerError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            AnalyzerError::AlreadyRunning { message } => {
                write!(f, "Analyzer already running: {}", message)
            }
            AnalyzerError::InvalidConfig { message } => {
                write!(f, "Invalid analyzer config: {}", message)
            }
        }
    }
}

impl std::error::Error for AnalyzerError {}

/// Fundamental measurement of one channel.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhasorMeasurement {
    pub magnitude: f64,
    pub angle_deg: f64,
    pub frequency: f64,
}

/// One harmonic term of the report.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HarmonicComponent {
    pub order: u32,
    pub magnitude: f64,
    pub angle_deg: f64,
}

/// Full analysis of one channel over the most recent cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelAnalysis {
    pub channel: String,
    pub fundamental: PhasorMeasurement,
    pub harmonics: Vec<HarmonicComponent>,
    pub rms: f64,
    pub thd_percent: f64,
}

/// One 10 Hz analysis pass over every channel with enough data.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisFrame {
    pub stream_mac: String,
    pub sample_rate: u32,
    pub samples_per_cycle: usize,
    pub timestamp_us: u64,
    pub channels: Vec<ChannelAnalysis>,
}

/// One channel's waveform snapshot: samples and per-sample times in seconds
/// relative to the oldest buffered sample.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WaveformData {
    pub channel: String,
    pub sample_rate: u32,
    pub samples: Vec<f64>,
    pub timestamps: Vec<f64>,
}

struct AnalyzerShared {
    stream_mac: Mutex<String>,
    sample_rate: AtomicU32,
    nominal_freq: AtomicU32,
    running: AtomicBool,
    stop_requested: AtomicBool,
    buffers: Mutex<HashMap<String, VecDeque<(f64, Instant)>>>,
    broadcaster: Mutex<Weak<EventBroadcaster>>,
    latest_analysis: Mutex<Option<AnalysisFrame>>,
    last_error: Mutex<String>,
}

impl AnalyzerShared {
    fn samples_per_cycle(&self) -> usize {
        let rate = self.sample_rate.load(Ordering::Relaxed) as usize;
        let freq = self.nominal_freq.load(Ordering::Relaxed).max(1) as usize;
        (rate / freq).max(1)
    }
}

/// Per-stream analyzer engine. Shared as `Arc<AnalyzerEngine>`; the sniffer
/// holds only a `Weak` reference and upgrades per frame.
pub struct AnalyzerEngine {
    shared: Arc<AnalyzerShared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Default for AnalyzerEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl AnalyzerEngine {
    pub fn new() -> Self {
        AnalyzerEngine {
            shared: Arc::new(AnalyzerShared {
                stream_mac: Mutex::new(String::new()),
                sample_rate: AtomicU32::new(4800),
                nominal_freq: AtomicU32::new(60),
                running: AtomicBool::new(false),
                stop_requested: AtomicBool::new(false),
                buffers: Mutex::new(HashMap::new()),
                broadcaster: Mutex::new(Weak::new()),
                latest_analysis: Mutex::new(None),
                last_error: Mutex::new(String::new()),
            }),
            thread: Mutex::new(None),
        }
    }

    /// Attaches the event broadcaster the analysis thread publishes to.
    pub fn set_broadcaster(&self, broadcaster: &Arc<EventBroadcaster>) {
        *self.shared.broadcaster.lock().unwrap() = Arc::downgrade(broadcaster);
    }

    /// Starts analyzing the stream identified by `stream_mac`.
    ///
    /// # Parameters
    ///
    /// * `stream_mac`: Destination MAC of the followed SV stream, in the
    ///   canonical `XX:XX:XX:XX:XX:XX` text form.
    /// * `sample_rate`: Stream sample rate in Hz.
    /// * `nominal_freq`: 50 or 60; sizes the analysis cycle.
    ///
    /// # Returns
    ///
    /// * `Err(AnalyzerError::AlreadyRunning)`: A stream is being analyzed.
    /// * `Err(AnalyzerError::InvalidConfig)`: Empty MAC or non-positive
    ///   rate/frequency.
    pub fn start(
        self: &Arc<Self>,
        stream_mac: &str,
        sample_rate: u32,
        nominal_freq: u32,
    ) -> Result<(), AnalyzerError> {
        if self.shared.running.load(Ordering::Acquire) {
            let message = format!("already analyzing '{}'", self.stream_mac());
            *self.shared.last_error.lock().unwrap() = message.clone();
            return Err(AnalyzerError::AlreadyRunning { message });
        }
        if stream_mac.is_empty() {
            return Err(AnalyzerError::InvalidConfig {
                message: "stream MAC cannot be empty".to_string(),
            });
        }
        if sample_rate == 0 || !(nominal_freq == 50 || nominal_freq == 60) {
            return Err(AnalyzerError::InvalidConfig {
                message: format!(
                    "sample rate {} / nominal frequency {} out of range",
                    sample_rate, nominal_freq
                ),
            });
        }

        *self.shared.stream_mac.lock().unwrap() = stream_mac.to_string();
        self.shared.sample_rate.store(sample_rate, Ordering::Relaxed);
        self.shared.nominal_freq.store(nominal_freq, Ordering::Relaxed);
        self.shared.buffers.lock().unwrap().clear();
        *self.shared.latest_analysis.lock().unwrap() = None;
        self.shared.stop_requested.store(false, Ordering::Release);
        self.shared.running.store(true, Ordering::Release);

        let shared = Arc::clone(&self.shared);
        let handle = std::thread::Builder::new()
            .name("vts-analyzer".to_string())
            .spawn(move || analysis_thread(shared))
            .map_err(|e| AnalyzerError::InvalidConfig {
                message: format!("failed to spawn analysis thread: {}", e),
            })?;
        *self.thread.lock().unwrap() = Some(handle);

        log::info!(
            "analyzer started for stream {} at {} Hz",
            stream_mac,
            sample_rate
        );
        Ok(())
    }

    /// Stops the analysis thread and forgets the followed stream.
    pub fn stop(&self) {
        if !self.shared.running.load(Ordering::Acquire) {
            return;
        }
        self.shared.stop_requested.store(true, Ordering::Release);
        if let Some(handle) = self.thread.lock().unwrap().take() {
            let _ = handle.join();
        }
        self.shared.running.store(false, Ordering::Release);
        log::info!("analyzer stopped for stream {}", self.stream_mac());
        self.shared.stream_mac.lock().unwrap().clear();
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    pub fn stream_mac(&self) -> String {
        self.shared.stream_mac.lock().unwrap().clone()
    }

    pub fn last_error(&self) -> String {
        self.shared.last_error.lock().unwrap().clone()
    }

    /// The most recent 10 Hz analysis pass, for pull-style consumers that
    /// do not subscribe to the broadcaster.
    pub fn latest_analysis(&self) -> Option<AnalysisFrame> {
        self.shared.latest_analysis.lock().unwrap().clone()
    }

    /// Pushes one captured sample into a channel ring. Called by the sniffer
    /// for every decoded SV channel value of the followed stream.
    pub fn process_sample(&self, stream_mac: &str, channel: &str, value: f64, timestamp: Instant) {
        if !self.shared.running.load(Ordering::Acquire) {
            return;
        }
        if *self.shared.stream_mac.lock().unwrap() != stream_mac {
            return;
        }

        let capacity = self.shared.samples_per_cycle() * 2;
        let mut buffers = self.shared.buffers.lock().unwrap();
        let ring = buffers.entry(channel.to_string()).or_insert_with(|| {
            log::debug!("analyzer buffer created for {} (capacity {})", channel, capacity);
            VecDeque::with_capacity(capacity)
        });
        if ring.len() == capacity {
            ring.pop_front();
        }
        ring.push_back((value, timestamp));
    }
}

impl Drop for AnalyzerEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

fn analysis_thread(shared: Arc<AnalyzerShared>) {
    log::debug!("analysis thread started");
    let mut last_analysis = Instant::now();
    let mut last_waveform = Instant::now();

    while !shared.stop_requested.load(Ordering::Acquire) {
        let now = Instant::now();

        if now.duration_since(last_waveform) >= WAVEFORM_INTERVAL {
            publish_waveforms(&shared);
            last_waveform = now;
        }

        if now.duration_since(last_analysis) >= ANALYSIS_INTERVAL {
            publish_analysis(&shared);
            last_analysis = now;
        }

        std::thread::sleep(IDLE_SLEEP);
    }
    log::debug!("analysis thread stopped");
}

fn publish_analysis(shared: &Arc<AnalyzerShared>) {
    let samples_per_cycle = shared.samples_per_cycle();
    let sample_rate = shared.sample_rate.load(Ordering::Relaxed);
    let nominal_freq = shared.nominal_freq.load(Ordering::Relaxed) as f64;

    // Snapshot under the lock, analyze outside it.
    let snapshots: Vec<(String, Vec<f64>)> = {
        let buffers = shared.buffers.lock().unwrap();
        buffers
            .iter()
            .filter(|(_, ring)| ring.len() >= samples_per_cycle)
            .map(|(name, ring)| {
                let values: Vec<f64> = ring
                    .iter()
                    .skip(ring.len() - samples_per_cycle)
                    .map(|(v, _)| *v)
                    .collect();
                (name.clone(), values)
            })
            .collect()
    };
    if snapshots.is_empty() {
        return;
    }

    let mut channels: Vec<ChannelAnalysis> = snapshots
        .par_iter()
        .map(|(name, values)| analyze_channel(name, values, sample_rate, nominal_freq))
        .collect();
    channels.sort_by(|a, b| a.channel.cmp(&b.channel));

    let frame = AnalysisFrame {
        stream_mac: shared.stream_mac.lock().unwrap().clone(),
        sample_rate,
        samples_per_cycle,
        timestamp_us: epoch_micros(),
        channels,
    };

    *shared.latest_analysis.lock().unwrap() = Some(frame.clone());

    if let Some(bus) = shared.broadcaster.lock().unwrap().upgrade() {
        bus.broadcast(topics::ANALYZER_PHASORS, Event::Phasors { frame: frame.clone() });
        bus.broadcast(topics::ANALYZER_HARMONICS, Event::Harmonics { frame });
    }
}

fn publish_waveforms(shared: &Arc<AnalyzerShared>) {
    let sample_rate = shared.sample_rate.load(Ordering::Relaxed);
    let waveforms: Vec<WaveformData> = {
        let buffers = shared.buffers.lock().unwrap();
        buffers
            .iter()
            .filter(|(_, ring)| !ring.is_empty())
            .map(|(name, ring)| {
                let oldest = ring.front().map(|(_, t)| *t).unwrap_or_else(Instant::now);
                let mut samples = Vec::with_capacity(ring.len());
                let mut timestamps = Vec::with_capacity(ring.len());
                for (value, t) in ring.iter() {
                    samples.push(*value);
                    timestamps.push(t.duration_since(oldest).as_secs_f64());
                }
                WaveformData {
                    channel: name.clone(),
                    sample_rate,
                    samples,
                    timestamps,
                }
            })
            .collect()
    };
    if waveforms.is_empty() {
        return;
    }

    if let Some(bus) = shared.broadcaster.lock().unwrap().upgrade() {
        bus.broadcast(topics::ANALYZER_WAVEFORMS, Event::Waveforms { waveforms });
    }
}

/// One-cycle DFT analysis of a channel window.
///
/// Bin k of the DFT of `x[0..N]` is `X_k = sum x_n * e^(-j 2 pi k n / N)`.
/// RMS magnitudes are `|X_k| * 2 / N / sqrt(2)` for k >= 1 and `|X_0| / N`
/// for DC. The fundamental is bin 1; its angle is shifted by +90 degrees so
/// a channel synthesized from a phasor at angle phi reads back as phi (the
/// raw DFT of a sine reports phi - 90).
pub fn analyze_channel(
    channel: &str,
    window: &[f64],
    sample_rate: u32,
    nominal_freq: f64,
) -> ChannelAnalysis {
    let n = window.len();
    let bins = dft_bins(window);

    let rms_of = |k: usize| -> f64 {
        if k == 0 {
            bins[0].norm() / n as f64
        } else {
            bins[k].norm() * 2.0 / n as f64 / std::f64::consts::SQRT_2
        }
    };

    let fundamental_mag = if bins.len() > 1 { rms_of(1) } else { 0.0 };
    let fundamental_angle = if bins.len() > 1 {
        normalize_degrees(bins[1].arg().to_degrees() + 90.0)
    } else {
        0.0
    };

    let mut harmonics = Vec::new();
    let mut harmonic_sq_sum = 0.0;
    for order in 2..=MAX_HARMONIC.min(bins.len().saturating_sub(1)) {
        let magnitude = rms_of(order);
        harmonic_sq_sum += magnitude * magnitude;
        harmonics.push(HarmonicComponent {
            order: order as u32,
            magnitude,
            angle_deg: normalize_degrees(bins[order].arg().to_degrees() + 90.0),
        });
    }

    let thd_percent = if fundamental_mag > 0.0 {
        100.0 * harmonic_sq_sum.sqrt() / fundamental_mag
    } else {
        0.0
    };

    let mut total_sq = 0.0;
    for k in 0..bins.len() {
        let r = rms_of(k);
        total_sq += r * r;
    }

    ChannelAnalysis {
        channel: channel.to_string(),
        fundamental: PhasorMeasurement {
            magnitude: fundamental_mag,
            angle_deg: fundamental_angle,
            frequency: estimate_frequency(window, sample_rate, nominal_freq),
        },
        harmonics,
        rms: total_sq.sqrt(),
        thd_percent,
    }
}

fn dft_bins(window: &[f64]) -> Vec<Complex64> {
    let n = window.len();
    let mut bins = Vec::with_capacity(n / 2 + 1);
    for k in 0..=n / 2 {
        let mut acc = Complex64::new(0.0, 0.0);
        for (i, &x) in window.iter().enumerate() {
            let angle = -2.0 * std::f64::consts::PI * k as f64 * i as f64 / n as f64;
            acc += Complex64::from_polar(x, angle);
        }
        bins.push(acc);
    }
    bins
}

fn normalize_degrees(mut deg: f64) -> f64 {
    while deg > 180.0 {
        deg -= 360.0;
    }
    while deg <= -180.0 {
        deg += 360.0;
    }
    deg
}

/// Zero-crossing frequency estimate over the window; falls back to the
/// nominal frequency with fewer than two crossings.
pub fn estimate_frequency(window: &[f64], sample_rate: u32, nominal_freq: f64) -> f64 {
    if window.len() < 3 {
        return nominal_freq;
    }
    let mut crossings = 0u32;
    for pair in window.windows(2) {
        if (pair[0] < 0.0 && pair[1] >= 0.0) || (pair[0] >= 0.0 && pair[1] < 0.0) {
            crossings += 1;
        }
    }
    if crossings < 2 {
        return nominal_freq;
    }
    let duration = window.len() as f64 / sample_rate as f64;
    (crossings as f64 / 2.0) / duration
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::{PI, SQRT_2};

    fn sine_window(rms: f64, angle_deg: f64, freq: f64, sample_rate: u32, n: usize) -> Vec<f64> {
        (0..n)
            .map(|k| {
                let t = k as f64 / sample_rate as f64;
                SQRT_2 * rms * (2.0 * PI * freq * t + angle_deg.to_radians()).sin()
            })
            .collect()
    }

    #[test]
    fn test_pure_sine_fundamental() {
        // Property from the contract: 100 V RMS at 60 Hz, 4800 Hz sampling.
        let window = sine_window(100.0, 0.0, 60.0, 4800, 80);
        let analysis = analyze_channel("Ch0", &window, 4800, 60.0);

        assert!(
            (analysis.fundamental.magnitude - 100.0).abs() < 1.0,
            "magnitude {}",
            analysis.fundamental.magnitude
        );
        assert!(
            analysis.fundamental.angle_deg.abs() < 1.0,
            "angle {}",
            analysis.fundamental.angle_deg
        );
        assert!(analysis.thd_percent < 1.0, "thd {}", analysis.thd_percent);
        assert!(
            (analysis.fundamental.frequency - 60.0).abs() < 0.5,
            "frequency {}",
            analysis.fundamental.frequency
        );
    }

    #[test]
    fn test_angle_tracks_input_phasor() {
        for angle in [-120.0, -45.0, 30.0, 120.0] {
            let window = sine_window(50.0, angle, 60.0, 4800, 80);
            let analysis = analyze_channel("Ch0", &window, 4800, 60.0);
            assert!(
                (analysis.fundamental.angle_deg - angle).abs() < 1.0,
                "expected {}, got {}",
                angle,
                analysis.fundamental.angle_deg
            );
        }
    }

    #[test]
    fn test_third_harmonic_reported() {
        let mut window = sine_window(100.0, 0.0, 60.0, 4800, 80);
        let third = sine_window(10.0, 0.0, 180.0, 4800, 80);
        for (w, t) in window.iter_mut().zip(third) {
            *w += t;
        }
        let analysis = analyze_channel("Ch0", &window, 4800, 60.0);

        let h3 = analysis
            .harmonics
            .iter()
            .find(|h| h.order == 3)
            .expect("third harmonic present");
        assert!((h3.magnitude - 10.0).abs() < 0.5, "h3 {}", h3.magnitude);
        // THD of a 10% third harmonic is 10%.
        assert!(
            (analysis.thd_percent - 10.0).abs() < 0.5,
            "thd {}",
            analysis.thd_percent
        );
    }

    #[test]
    fn test_dc_only_window_falls_back_to_nominal() {
        let window = vec![5.0; 80];
        let analysis = analyze_channel("Ch0", &window, 4800, 60.0);
        assert_eq!(analysis.fundamental.frequency, 60.0);
        assert!(analysis.fundamental.magnitude < 1e-9);
    }

    #[test]
    fn test_off_nominal_frequency_estimate() {
        // The crossing count quantizes hard on one-cycle windows; over ten
        // cycles a 58 Hz tone lands within a hertz or two.
        let window = sine_window(100.0, 0.0, 58.0, 4800, 800);
        let freq = estimate_frequency(&window, 4800, 60.0);
        assert!((freq - 58.0).abs() < 2.0, "freq {}", freq);
    }

    #[test]
    fn test_ring_capacity_is_two_cycles() {
        let engine = Arc::new(AnalyzerEngine::new());
        engine.start("01:0C:CD:04:00:00", 4800, 60).unwrap();
        let now = Instant::now();
        for k in 0..500 {
            engine.process_sample(
                "01:0C:CD:04:00:00",
                "Ch0",
                k as f64,
                now + Duration::from_micros(208 * k),
            );
        }
        {
            let buffers = engine.shared.buffers.lock().unwrap();
            let ring = buffers.get("Ch0").unwrap();
            assert_eq!(ring.len(), 160, "capacity is 2 x samplesPerCycle");
            // Oldest retained sample is 500 - 160.
            assert_eq!(ring.front().unwrap().0, 340.0);
        }
        engine.stop();
    }

    #[test]
    fn test_latest_analysis_populates_from_ring() {
        let engine = Arc::new(AnalyzerEngine::new());
        engine.start("01:0C:CD:04:00:07", 4800, 60).unwrap();
        assert!(engine.latest_analysis().is_none());

        let now = Instant::now();
        for k in 0..160u64 {
            let t = k as f64 / 4800.0;
            let v = std::f64::consts::SQRT_2
                * 100.0
                * (2.0 * std::f64::consts::PI * 60.0 * t).sin();
            engine.process_sample(
                "01:0C:CD:04:00:07",
                "Ch0",
                v,
                now + Duration::from_micros(208 * k),
            );
        }

        // One 100 ms analysis tick plus slack.
        let deadline = Instant::now() + Duration::from_secs(2);
        let frame = loop {
            if let Some(frame) = engine.latest_analysis() {
                break frame;
            }
            assert!(Instant::now() < deadline, "analysis never ran");
            std::thread::sleep(Duration::from_millis(20));
        };
        assert_eq!(frame.samples_per_cycle, 80);
        let ch0 = frame.channels.iter().find(|c| c.channel == "Ch0").unwrap();
        assert!((ch0.fundamental.magnitude - 100.0).abs() < 1.0);

        engine.stop();
    }

    #[test]
    fn test_samples_for_other_streams_ignored() {
        let engine = Arc::new(AnalyzerEngine::new());
        engine.start("01:0C:CD:04:00:00", 4800, 60).unwrap();
        engine.process_sample("01:0C:CD:04:00:01", "Ch0", 1.0, Instant::now());
        assert!(engine.shared.buffers.lock().unwrap().is_empty());
        engine.stop();
    }

    #[test]
    fn test_start_twice_rejected() {
        let engine = Arc::new(AnalyzerEngine::new());
        engine.start("01:0C:CD:04:00:00", 4800, 60).unwrap();
        let err = engine.start("01:0C:CD:04:00:01", 4800, 60);
        assert!(matches!(err, Err(AnalyzerError::AlreadyRunning { .. })));
        engine.stop();
        assert!(engine.start("01:0C:CD:04:00:01", 4800, 60).is_ok());
        engine.stop();
    }
}
