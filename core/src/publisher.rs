//! # Sampled Values Publisher
//!
//! One publisher owns one SV stream: its validated configuration, the phasor
//! and harmonic set (manual mode) or a playback buffer, the running sample
//! counter and the pre-rendered frame template. A `tick` patches the current
//! `smpCnt` and per-channel sample words into the template at the offsets
//! recorded at encode time and transmits the frame; nothing is re-encoded on
//! the hot path. The template is rebuilt only on a configuration change.
//!
//! Transmit failures are counted and logged, never propagated: one bad send
//! must not stop a stream.

use crate::iec61850::common::{MacAddress, ParseError, UtcTime, VlanTag};
use crate::iec61850::sampled_values::{EncodedSvFrame, SampledValueFrame};
use crate::io::SharedPort;
use crate::metrics;
use crate::sniffer::DigitalInputs;
use crate::synthesis::{sample_at, Harmonic, Phasor};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Sample source of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataSource {
    /// Samples synthesized from the phasor/harmonic set.
    Manual,
    /// Samples read from a prepared per-channel buffer.
    Playback,
}

/// Immutable descriptor of one SV stream.
///
/// Validated by `SvPublisher::new` (and therefore by every registry create
/// or update): MAC fields must parse, VLAN fields must be in range, the
/// sample rate must be positive, the nominal frequency 50 or 60, and the
/// channel count between 1 and 32.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PublisherConfig {
    pub app_id: u16,
    pub sv_id: String,
    pub dat_set: Option<String>,
    pub conf_rev: u32,
    pub smp_synch: u8,
    pub smp_mod: Option<u16>,
    pub mac_dst: String,
    pub mac_src: String,
    pub vlan_id: u16,
    pub vlan_prio: u8,
    pub vlan_dei: bool,
    pub nominal_freq: f64,
    pub sample_rate: u32,
    pub no_asdu: u8,
    pub channel_count: u8,
    pub data_source: DataSource,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        PublisherConfig {
            app_id: 0x4000,
            sv_id: "IED1MU01".to_string(),
            dat_set: None,
            conf_rev: 1,
            smp_synch: 1,
            smp_mod: None,
            mac_dst: "01:0C:CD:04:00:00".to_string(),
            mac_src: "AA:BB:CC:DD:EE:01".to_string(),
            vlan_id: 100,
            vlan_prio: 4,
            vlan_dei: false,
            nominal_freq: 60.0,
            sample_rate: 4800,
            no_asdu: 1,
            channel_count: 8,
            data_source: DataSource::Manual,
        }
    }
}

/// Configuration rejection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigError {
    pub message: String,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Invalid publisher config: {}", self.message)
    }
}

impl std::error::Error for ConfigError {}

impl From<ParseError> for ConfigError {
    fn from(e: ParseError) -> Self {
        ConfigError {
            message: e.to_string(),
        }
    }
}

/// Sample counter with the dual wrap policy: the wire value is
/// `counter mod 65536`, and the counter itself resets to zero upon reaching
/// the configured modulo (the stream sample rate).
#[derive(Debug, Clone, Copy)]
pub struct SampleCounter {
    value: u32,
    rate_modulo: Option<u32>,
}

impl SampleCounter {
    pub fn new(rate_modulo: Option<u32>) -> Self {
        SampleCounter {
            value: 0,
            rate_modulo,
        }
    }

    pub fn reset(&mut self) {
        self.value = 0;
    }

    /// The 16-bit value written to the wire.
    pub fn wire_value(&self) -> u16 {
        (self.value % 65536) as u16
    }

    pub fn value(&self) -> u32 {
        self.value
    }

    pub fn advance(&mut self) {
        self.value = self.value.wrapping_add(1);
        if let Some(modulo) = self.rate_modulo {
            if self.value >= modulo {
                self.value = 0;
            }
        } else if self.value >= 65536 {
            self.value = 0;
        }
    }
}

/// One SV stream with its template frame and runtime state.
pub struct SvPublisher {
    id: String,
    config: PublisherConfig,
    phasors: Vec<Phasor>,
    harmonics: Vec<Harmonic>,
    frequency: f64,
    running: bool,
    counter: SampleCounter,
    template: EncodedSvFrame,
    playback: Vec<Vec<i32>>,
    playback_index: usize,
    playback_loop: bool,
    playback_stop_inputs: Option<Arc<DigitalInputs>>,
    send_errors: u64,
    port: SharedPort,
}

impl SvPublisher {
    /// Validates `config`, renders the frame template and creates the
    /// publisher in the stopped state with zero phasors on every channel.
    pub fn new(id: String, config: PublisherConfig, port: SharedPort) -> Result<Self, ConfigError> {
        let template = build_template(&config)?;
        let channel_count = config.channel_count as usize;
        let frequency = config.nominal_freq;
        let sample_rate = config.sample_rate;
        Ok(SvPublisher {
            id,
            config,
            phasors: vec![Phasor::default(); channel_count],
            harmonics: Vec::new(),
            frequency,
            running: false,
            counter: SampleCounter::new(Some(sample_rate)),
            template,
            playback: Vec::new(),
            playback_index: 0,
            playback_loop: true,
            playback_stop_inputs: None,
            send_errors: 0,
            port,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn config(&self) -> &PublisherConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn send_errors(&self) -> u64 {
        self.send_errors
    }

    pub fn sample_counter(&self) -> u32 {
        self.counter.value()
    }

    pub fn phasors(&self) -> &[Phasor] {
        &self.phasors
    }

    pub fn frequency(&self) -> f64 {
        self.frequency
    }

    /// Starting resets the sample counter to zero.
    pub fn start(&mut self) {
        self.running = true;
        self.counter.reset();
        self.playback_index = 0;
    }

    pub fn stop(&mut self) {
        self.running = false;
    }

    /// Replaces the configuration and rebuilds the template. Counters keep
    /// running; the next tick publishes with the new framing.
    pub fn set_config(&mut self, config: PublisherConfig) -> Result<(), ConfigError> {
        let template = build_template(&config)?;
        self.phasors
            .resize(config.channel_count as usize, Phasor::default());
        self.counter = SampleCounter::new(Some(config.sample_rate));
        self.frequency = config.nominal_freq;
        self.template = template;
        self.config = config;
        Ok(())
    }

    /// Replaces the phasor set; takes effect on the next tick.
    pub fn set_phasors(&mut self, phasors: Vec<Phasor>) {
        self.phasors = phasors;
        self.phasors
            .resize(self.config.channel_count as usize, Phasor::default());
    }

    /// Updates a single channel's phasor, leaving the others alone.
    pub fn set_channel_phasor(&mut self, channel: usize, phasor: Phasor) {
        if let Some(slot) = self.phasors.get_mut(channel) {
            *slot = phasor;
        }
    }

    pub fn set_harmonics(&mut self, harmonics: Vec<Harmonic>) {
        self.harmonics = harmonics;
    }

    pub fn set_frequency(&mut self, frequency: f64) {
        self.frequency = frequency;
    }

    /// Installs a playback buffer: one `Vec<i32>` per channel. In playback
    /// mode each tick consumes the next sample per channel, wrapping at the
    /// end when `looped` is set.
    pub fn set_playback_data(&mut self, data: Vec<Vec<i32>>, looped: bool) {
        self.playback = data;
        self.playback_index = 0;
        self.playback_loop = looped;
    }

    /// Wires the shared digital-input array as a playback kill switch:
    /// slot 0 going nonzero (a relay trip landing through the sniffer)
    /// stops a playback stream on its next tick.
    pub fn set_playback_stop_inputs(&mut self, inputs: Arc<DigitalInputs>) {
        self.playback_stop_inputs = Some(inputs);
    }

    /// True when a non-looped playback stream has consumed its buffer.
    pub fn playback_done(&self) -> bool {
        if self.config.data_source != DataSource::Playback || self.playback_loop {
            return false;
        }
        let len = self.playback.iter().map(|c| c.len()).max().unwrap_or(0);
        self.playback_index >= len
    }

    /// Renders and transmits one frame. Each ASDU carries one consecutive
    /// sample per channel; the counter advances per ASDU.
    pub fn tick(&mut self) {
        if !self.running {
            return;
        }
        if self.config.data_source == DataSource::Playback {
            if let Some(inputs) = &self.playback_stop_inputs {
                if inputs.get(0) != 0 {
                    log::info!("stream {}: playback stopped by digital input 0", self.id);
                    self.running = false;
                    return;
                }
            }
        }

        for asdu in 0..self.config.no_asdu as usize {
            self.template.patch_smp_cnt(asdu, self.counter.wire_value());

            for channel in 0..self.config.channel_count as usize {
                let value = match self.config.data_source {
                    DataSource::Manual => {
                        let phasor = self.phasors.get(channel).copied().unwrap_or_default();
                        sample_at(
                            &phasor,
                            &self.harmonics,
                            self.frequency,
                            self.config.sample_rate,
                            self.counter.value() as u64,
                        ) as i32
                    }
                    DataSource::Playback => self
                        .playback
                        .get(channel)
                        .and_then(|buf| {
                            if buf.is_empty() {
                                None
                            } else if self.playback_loop {
                                Some(buf[self.playback_index % buf.len()])
                            } else {
                                buf.get(self.playback_index).copied()
                            }
                        })
                        .unwrap_or(0),
                };
                self.template.patch_sample(asdu, channel, value, 0);
            }

            self.counter.advance();
            if self.config.data_source == DataSource::Playback {
                self.playback_index += 1;
            }
        }

        match self.port.send(&self.template.bytes) {
            Ok(()) => metrics::record_sent_frame(),
            Err(e) => {
                self.send_errors += 1;
                metrics::record_send_error();
                log::debug!("stream {}: send failed: {}", self.id, e);
            }
        }
    }

}

fn build_template(config: &PublisherConfig) -> Result<EncodedSvFrame, ConfigError> {
    if config.sample_rate == 0 {
        return Err(ConfigError {
            message: "sampleRate must be > 0".to_string(),
        });
    }
    if config.channel_count == 0 || config.channel_count > 32 {
        return Err(ConfigError {
            message: format!("channelCount must be 1-32, got {}", config.channel_count),
        });
    }
    if config.no_asdu == 0 {
        return Err(ConfigError {
            message: "noAsdu must be >= 1".to_string(),
        });
    }
    if config.nominal_freq != 50.0 && config.nominal_freq != 60.0 {
        return Err(ConfigError {
            message: format!("nominalFreq must be 50 or 60, got {}", config.nominal_freq),
        });
    }
    if config.sv_id.is_empty() || config.sv_id.len() > 127 {
        return Err(ConfigError {
            message: format!("svId length {} out of range", config.sv_id.len()),
        });
    }

    let mac_dst = MacAddress::parse(&config.mac_dst)?;
    let mac_src = MacAddress::parse(&config.mac_src)?;
    let vlan = VlanTag::new(config.vlan_prio, config.vlan_dei, config.vlan_id)?;

    let frame = SampledValueFrame {
        app_id: config.app_id,
        no_asdu: config.no_asdu,
        sv_id: config.sv_id.clone(),
        dat_set: config.dat_set.clone(),
        smp_cnt: 0,
        conf_rev: config.conf_rev,
        refr_tm: UtcTime::now(),
        smp_synch: config.smp_synch,
        smp_rate: Some(config.sample_rate.min(u16::MAX as u32) as u16),
        smp_mod: config.smp_mod,
    };

    Ok(frame.encode(&mac_dst, &mac_src, &vlan, config.channel_count)?)
}
