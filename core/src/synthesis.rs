//! # Phasor-to-Sample Synthesis
//!
//! Converts per-channel phasors (RMS magnitude, angle in degrees) and an
//! optional harmonic set into the signed 16-bit sample stream a publisher
//! embeds into its ASDUs:
//!
//! `v(k) = sqrt(2) * mag * sin(2 * pi * freq * k / rate + angle)`
//!
//! plus one sine term per configured harmonic order. Samples are scaled by a
//! fixed 16-bit headroom factor (~3276.7 LSB per peak unit) and clamped to
//! the i16 range.

use serde::{Deserialize, Serialize};
use std::f64::consts::{PI, SQRT_2};

/// LSB per peak unit: i16 full scale over a +/-10 unit window.
pub const AMPLITUDE_SCALE: f64 = i16::MAX as f64 / 10.0;

/// RMS magnitude and angle (degrees) of one channel.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Phasor {
    pub magnitude: f64,
    #[serde(default)]
    pub angle: f64,
}

impl Phasor {
    pub fn new(magnitude: f64, angle: f64) -> Self {
        Phasor { magnitude, angle }
    }
}

/// One harmonic term: integer order >= 2, RMS magnitude, angle (degrees).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Harmonic {
    pub order: u32,
    pub magnitude: f64,
    #[serde(default)]
    pub angle: f64,
}

fn scale_to_i16(value: f64) -> i16 {
    let scaled = value * AMPLITUDE_SCALE;
    scaled.clamp(i16::MIN as f64, i16::MAX as f64) as i16
}

/// Instantaneous value of a phasor at sample `k` of `sample_rate`.
fn instantaneous(phasor: &Phasor, freq: f64, sample_rate: u32, k: u64) -> f64 {
    let t = k as f64 / sample_rate as f64;
    SQRT_2 * phasor.magnitude * (2.0 * PI * freq * t + phasor.angle.to_radians()).sin()
}

/// Synthesizes one sample for a phasor with its harmonic set.
///
/// # Parameters
///
/// * `phasor`: Fundamental magnitude/angle.
/// * `harmonics`: Harmonic terms superposed on the fundamental.
/// * `freq`: Fundamental frequency in Hz.
/// * `sample_rate`: Samples per second.
/// * `k`: Absolute sample index since the stream started.
pub fn sample_at(phasor: &Phasor, harmonics: &[Harmonic], freq: f64, sample_rate: u32, k: u64) -> i16 {
    let mut value = instantaneous(phasor, freq, sample_rate, k);
    let t = k as f64 / sample_rate as f64;
    for h in harmonics {
        value += SQRT_2
            * h.magnitude
            * (h.order as f64 * 2.0 * PI * freq * t + h.angle.to_radians()).sin();
    }
    scale_to_i16(value)
}

/// Synthesizes `n` consecutive samples starting at `start_sample`.
pub fn synthesize_samples(
    phasor: &Phasor,
    freq: f64,
    sample_rate: u32,
    start_sample: u64,
    n: usize,
) -> Vec<i16> {
    (0..n)
        .map(|i| scale_to_i16(instantaneous(phasor, freq, sample_rate, start_sample + i as u64)))
        .collect()
}

/// Synthesizes `n` consecutive samples with harmonics.
pub fn synthesize_with_harmonics(
    phasor: &Phasor,
    harmonics: &[Harmonic],
    freq: f64,
    sample_rate: u32,
    start_sample: u64,
    n: usize,
) -> Vec<i16> {
    (0..n)
        .map(|i| sample_at(phasor, harmonics, freq, sample_rate, start_sample + i as u64))
        .collect()
}

/// Linearly resamples one channel of recorded data from `source_rate` to
/// `target_rate`.
///
/// Playback buffers arrive at whatever rate the recording used; the
/// publisher consumes one sample per tick at the stream rate, so recordings
/// are rescaled once at load time. Linear interpolation between the two
/// nearest source samples is accurate enough for relay playback, where the
/// recording is already band-limited far below either rate.
///
/// # Parameters
///
/// * `samples`: Source samples at `source_rate`.
/// * `source_rate`: Recording rate in Hz.
/// * `target_rate`: Stream rate in Hz.
///
/// # Returns
///
/// The channel rescaled to `target_rate`; empty input stays empty, and equal
/// rates return the input unchanged.
pub fn resample(samples: &[f64], source_rate: f64, target_rate: f64) -> Vec<f64> {
    if samples.is_empty() || source_rate <= 0.0 || target_rate <= 0.0 {
        return Vec::new();
    }
    if (source_rate - target_rate).abs() < f64::EPSILON {
        return samples.to_vec();
    }

    let duration = samples.len() as f64 / source_rate;
    let out_len = (duration * target_rate).floor() as usize;
    let mut out = Vec::with_capacity(out_len);

    for i in 0..out_len {
        let t = i as f64 / target_rate;
        let position = t * source_rate;
        let left = position.floor() as usize;
        if left + 1 >= samples.len() {
            out.push(samples[samples.len() - 1]);
        } else {
            let frac = position - left as f64;
            out.push(samples[left] * (1.0 - frac) + samples[left + 1] * frac);
        }
    }
    out
}

/// Resamples a whole recording (one `Vec<f64>` per channel) and scales it
/// into the i32 sample words a playback publisher consumes.
pub fn resample_for_playback(
    channels: &[Vec<f64>],
    source_rate: f64,
    target_rate: f64,
    scale: &[f64],
) -> Vec<Vec<i32>> {
    channels
        .iter()
        .enumerate()
        .map(|(index, data)| {
            let factor = scale.get(index).copied().unwrap_or(1.0);
            resample(data, source_rate, target_rate)
                .into_iter()
                .map(|v| (v * factor) as i32)
                .collect()
        })
        .collect()
}
