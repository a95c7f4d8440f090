//! # Publisher Registry
//!
//! Keyed collection of SV publishers. One mutex guards the stream map and
//! every stream's phasor/config state; the short periodic tick, the sequence
//! engine's phasor callback and the test drivers' setters all funnel through
//! it with a single non-re-entrant acquisition, so no path can deadlock by
//! re-locking.
//!
//! The channel-role helpers encode the wiring convention the test drivers
//! rely on: voltage phases map to channels 0..2 and current phases to
//! channels 3..5; `*_3ph` variants fan one magnitude across the role's three
//! channels.

use crate::broadcaster::{topics, Event, EventBroadcaster};
use crate::io::SharedPort;
use crate::publisher::{ConfigError, PublisherConfig, SvPublisher};
use crate::synthesis::{Harmonic, Phasor};
use crate::testers::impedance::PhasorState;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, Weak};

/// Errors returned by registry operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    ConfigInvalid { message: String },
    StreamNotFound { message: String },
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            RegistryError::ConfigInvalid { message } => {
                write!(f, "Invalid configuration: {}", message)
            }
            RegistryError::StreamNotFound { message } => {
                write!(f, "Stream not found: {}", message)
            }
        }
    }
}

impl std::error::Error for RegistryError {}

impl From<ConfigError> for RegistryError {
    fn from(e: ConfigError) -> Self {
        RegistryError::ConfigInvalid { message: e.message }
    }
}

/// Phase selector for the channel-role helpers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    A,
    B,
    C,
}

impl Phase {
    pub const ALL: [Phase; 3] = [Phase::A, Phase::B, Phase::C];

    fn index(self) -> usize {
        match self {
            Phase::A => 0,
            Phase::B => 1,
            Phase::C => 2,
        }
    }
}

/// Channel index of a voltage phase.
fn voltage_channel(phase: Phase) -> usize {
    phase.index()
}

/// Channel index of a current phase.
fn current_channel(phase: Phase) -> usize {
    3 + phase.index()
}

/// Summary of one stream for listings and status events.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamStatus {
    pub id: String,
    pub sv_id: String,
    pub running: bool,
    pub sample_rate: u32,
    pub channel_count: u8,
    pub mac_dst: String,
    pub send_errors: u64,
}

/// Per-stream phasor override applied by the sequence engine: a frequency
/// and a channel-key to phasor map. Channel keys are role names (`Va`..`Vc`,
/// `Ia`..`Ic`) or explicit indices (`ch0`, `ch1`, ...).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamPhasors {
    pub freq: f64,
    pub channels: BTreeMap<String, Phasor>,
}

fn channel_index_for_key(key: &str) -> Option<usize> {
    match key {
        "Va" | "va" => Some(0),
        "Vb" | "vb" => Some(1),
        "Vc" | "vc" => Some(2),
        "Ia" | "ia" => Some(3),
        "Ib" | "ib" => Some(4),
        "Ic" | "ic" => Some(5),
        other => other
            .strip_prefix("ch")
            .and_then(|idx| idx.parse::<usize>().ok()),
    }
}

/// Uuid-keyed collection of SV publishers sharing one bound port.
pub struct PublisherRegistry {
    streams: Mutex<HashMap<String, SvPublisher>>,
    port: SharedPort,
    broadcaster: Mutex<Weak<EventBroadcaster>>,
}

impl PublisherRegistry {
    pub fn new(port: SharedPort) -> Self {
        PublisherRegistry {
            streams: Mutex::new(HashMap::new()),
            port,
            broadcaster: Mutex::new(Weak::new()),
        }
    }

    /// Attaches the broadcaster that receives `stream/status` events.
    pub fn set_broadcaster(&self, broadcaster: &Arc<EventBroadcaster>) {
        *self.broadcaster.lock().unwrap() = Arc::downgrade(broadcaster);
    }

    fn emit_status(&self, id: &str, running: bool, message: &str) {
        if let Some(bus) = self.broadcaster.lock().unwrap().upgrade() {
            bus.broadcast(
                topics::STREAM_STATUS,
                Event::StreamStatus {
                    stream_id: id.to_string(),
                    running,
                    message: message.to_string(),
                },
            );
        }
    }

    /// Validates `config` and creates a stopped stream.
    ///
    /// # Returns
    ///
    /// The generated stream id (UUID v4).
    pub fn create(&self, config: PublisherConfig) -> Result<String, RegistryError> {
        let id = uuid::Uuid::new_v4().to_string();
        let publisher = SvPublisher::new(id.clone(), config, self.port.clone())?;
        self.streams.lock().unwrap().insert(id.clone(), publisher);
        log::info!("stream {} created", id);
        self.emit_status(&id, false, "created");
        Ok(id)
    }

    /// Atomically replaces a stream's configuration.
    pub fn update(&self, id: &str, config: PublisherConfig) -> Result<(), RegistryError> {
        let mut streams = self.streams.lock().unwrap();
        let publisher = streams.get_mut(id).ok_or_else(|| not_found(id))?;
        publisher.set_config(config)?;
        Ok(())
    }

    /// Stops and removes a stream.
    pub fn delete(&self, id: &str) -> Result<(), RegistryError> {
        let mut streams = self.streams.lock().unwrap();
        let mut publisher = streams.remove(id).ok_or_else(|| not_found(id))?;
        publisher.stop();
        drop(streams);
        log::info!("stream {} deleted", id);
        self.emit_status(id, false, "deleted");
        Ok(())
    }

    /// Starts a stream; its sample counter resets to zero.
    pub fn start(&self, id: &str) -> Result<(), RegistryError> {
        self.with_stream(id, |p| p.start())?;
        self.emit_status(id, true, "started");
        Ok(())
    }

    /// Stops a stream; configuration and phasors are retained.
    pub fn stop(&self, id: &str) -> Result<(), RegistryError> {
        self.with_stream(id, |p| p.stop())?;
        self.emit_status(id, false, "stopped");
        Ok(())
    }

    pub fn start_all(&self) {
        let mut streams = self.streams.lock().unwrap();
        for publisher in streams.values_mut() {
            publisher.start();
        }
    }

    pub fn stop_all(&self) {
        let mut streams = self.streams.lock().unwrap();
        for publisher in streams.values_mut() {
            publisher.stop();
        }
    }

    /// Ticks every running stream once. Called from the short periodic tick
    /// loop at a cadence matching the fastest stream's sample rate.
    pub fn tick_all(&self) {
        let mut streams = self.streams.lock().unwrap();
        for publisher in streams.values_mut() {
            publisher.tick();
        }
    }

    /// Replaces a stream's full phasor set; takes effect on the next tick.
    pub fn update_phasors(&self, id: &str, phasors: Vec<Phasor>) -> Result<(), RegistryError> {
        self.with_stream(id, |p| p.set_phasors(phasors))
    }

    /// Replaces a stream's harmonic set; takes effect on the next tick.
    pub fn update_harmonics(&self, id: &str, harmonics: Vec<Harmonic>) -> Result<(), RegistryError> {
        self.with_stream(id, |p| p.set_harmonics(harmonics))
    }

    pub fn set_playback_data(
        &self,
        id: &str,
        data: Vec<Vec<i32>>,
        looped: bool,
    ) -> Result<(), RegistryError> {
        self.with_stream(id, |p| p.set_playback_data(data, looped))
    }

    /// Wires the sniffer's digital-input array as a playback kill switch on
    /// one stream.
    pub fn set_playback_stop_inputs(
        &self,
        id: &str,
        inputs: Arc<crate::sniffer::DigitalInputs>,
    ) -> Result<(), RegistryError> {
        self.with_stream(id, |p| p.set_playback_stop_inputs(inputs))
    }

    pub fn set_frequency(&self, id: &str, frequency: f64) -> Result<(), RegistryError> {
        self.with_stream(id, |p| p.set_frequency(frequency))
    }

    /// Applies a sequence-state phasor override: frequency plus any subset
    /// of channels addressed by role name or index.
    pub fn update_stream_phasors(
        &self,
        id: &str,
        update: &StreamPhasors,
    ) -> Result<(), RegistryError> {
        self.with_stream(id, |p| {
            p.set_frequency(update.freq);
            for (key, phasor) in &update.channels {
                match channel_index_for_key(key) {
                    Some(index) => p.set_channel_phasor(index, *phasor),
                    None => log::warn!("stream {}: unknown channel key '{}'", id, key),
                }
            }
        })
    }

    /// Sets one voltage phase magnitude, preserving its angle.
    pub fn set_voltage_magnitude(
        &self,
        id: &str,
        phase: Phase,
        magnitude: f64,
    ) -> Result<(), RegistryError> {
        self.set_channel_magnitude(id, voltage_channel(phase), magnitude)
    }

    /// Sets all three voltage magnitudes, preserving angles.
    pub fn set_voltage_magnitudes(&self, id: &str, magnitude: f64) -> Result<(), RegistryError> {
        for phase in Phase::ALL {
            self.set_channel_magnitude(id, voltage_channel(phase), magnitude)?;
        }
        Ok(())
    }

    pub fn set_current_magnitude(
        &self,
        id: &str,
        phase: Phase,
        magnitude: f64,
    ) -> Result<(), RegistryError> {
        self.set_channel_magnitude(id, current_channel(phase), magnitude)
    }

    pub fn set_current_magnitudes(&self, id: &str, magnitude: f64) -> Result<(), RegistryError> {
        for phase in Phase::ALL {
            self.set_channel_magnitude(id, current_channel(phase), magnitude)?;
        }
        Ok(())
    }

    fn set_channel_magnitude(
        &self,
        id: &str,
        channel: usize,
        magnitude: f64,
    ) -> Result<(), RegistryError> {
        self.with_stream(id, |p| {
            let angle = p.phasors().get(channel).map(|ph| ph.angle).unwrap_or(0.0);
            p.set_channel_phasor(channel, Phasor::new(magnitude, angle));
        })
    }

    /// Writes a fault solver state onto the stream: voltages to channels
    /// 0..2 and currents to channels 3..5, as magnitude/angle pairs.
    pub fn apply_phasor_state(&self, id: &str, state: &PhasorState) -> Result<(), RegistryError> {
        self.with_stream(id, |p| {
            let volts = [state.voltage.a, state.voltage.b, state.voltage.c];
            let amps = [state.current.a, state.current.b, state.current.c];
            for (i, v) in volts.iter().enumerate() {
                p.set_channel_phasor(i, Phasor::new(v.norm(), v.arg().to_degrees()));
            }
            for (i, c) in amps.iter().enumerate() {
                p.set_channel_phasor(3 + i, Phasor::new(c.norm(), c.arg().to_degrees()));
            }
        })
    }

    /// Summaries of every stream, in stable id order.
    pub fn list(&self) -> Vec<StreamStatus> {
        let streams = self.streams.lock().unwrap();
        let mut out: Vec<StreamStatus> = streams.values().map(status_of).collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    pub fn status(&self, id: &str) -> Result<StreamStatus, RegistryError> {
        let streams = self.streams.lock().unwrap();
        streams.get(id).map(status_of).ok_or_else(|| not_found(id))
    }

    /// JSON rendering of every stream summary.
    pub fn list_to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&self.list())
    }

    /// Snapshot of a stream's current phasor set.
    pub fn phasors(&self, id: &str) -> Result<Vec<Phasor>, RegistryError> {
        let streams = self.streams.lock().unwrap();
        streams
            .get(id)
            .map(|p| p.phasors().to_vec())
            .ok_or_else(|| not_found(id))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.streams.lock().unwrap().contains_key(id)
    }

    fn with_stream<R>(
        &self,
        id: &str,
        f: impl FnOnce(&mut SvPublisher) -> R,
    ) -> Result<R, RegistryError> {
        let mut streams = self.streams.lock().unwrap();
        let publisher = streams.get_mut(id).ok_or_else(|| not_found(id))?;
        Ok(f(publisher))
    }
}

fn status_of(p: &SvPublisher) -> StreamStatus {
    StreamStatus {
        id: p.id().to_string(),
        sv_id: p.config().sv_id.clone(),
        running: p.is_running(),
        sample_rate: p.config().sample_rate,
        channel_count: p.config().channel_count,
        mac_dst: p.config().mac_dst.clone(),
        send_errors: p.send_errors(),
    }
}

fn not_found(id: &str) -> RegistryError {
    RegistryError::StreamNotFound {
        message: id.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::loopback::LoopbackHub;

    fn test_registry(hub: &str) -> PublisherRegistry {
        PublisherRegistry::new(LoopbackHub::bind(hub))
    }

    #[test]
    fn test_create_list_delete() {
        let registry = test_registry("test-reg-crud");
        let id = registry.create(PublisherConfig::default()).unwrap();
        assert!(registry.contains(&id));
        assert_eq!(registry.list().len(), 1);
        assert!(!registry.status(&id).unwrap().running);

        registry.delete(&id).unwrap();
        assert!(!registry.contains(&id));
        assert!(matches!(
            registry.delete(&id),
            Err(RegistryError::StreamNotFound { .. })
        ));
    }

    #[test]
    fn test_create_rejects_bad_config() {
        let registry = test_registry("test-reg-bad");
        let config = PublisherConfig {
            vlan_prio: 9,
            ..PublisherConfig::default()
        };
        assert!(matches!(
            registry.create(config),
            Err(RegistryError::ConfigInvalid { .. })
        ));
        assert!(registry.list().is_empty());
    }

    #[test]
    fn test_ids_are_unique() {
        let registry = test_registry("test-reg-ids");
        let a = registry.create(PublisherConfig::default()).unwrap();
        let b = registry.create(PublisherConfig::default()).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_role_helpers_map_channels() {
        let registry = test_registry("test-reg-roles");
        let id = registry.create(PublisherConfig::default()).unwrap();

        registry.set_voltage_magnitudes(&id, 66.4).unwrap();
        registry.set_current_magnitude(&id, Phase::B, 5.0).unwrap();

        registry
            .with_stream(&id, |p| {
                assert_eq!(p.phasors()[0].magnitude, 66.4);
                assert_eq!(p.phasors()[1].magnitude, 66.4);
                assert_eq!(p.phasors()[2].magnitude, 66.4);
                assert_eq!(p.phasors()[3].magnitude, 0.0);
                assert_eq!(p.phasors()[4].magnitude, 5.0);
            })
            .unwrap();
    }

    #[test]
    fn test_magnitude_setter_preserves_angle() {
        let registry = test_registry("test-reg-angle");
        let id = registry.create(PublisherConfig::default()).unwrap();
        registry
            .update_phasors(
                &id,
                vec![
                    Phasor::new(10.0, 0.0),
                    Phasor::new(10.0, -120.0),
                    Phasor::new(10.0, 120.0),
                ],
            )
            .unwrap();

        registry.set_voltage_magnitudes(&id, 50.0).unwrap();
        registry
            .with_stream(&id, |p| {
                assert_eq!(p.phasors()[1].angle, -120.0);
                assert_eq!(p.phasors()[1].magnitude, 50.0);
            })
            .unwrap();
    }

    #[test]
    fn test_sequence_phasor_update_by_role_key() {
        let registry = test_registry("test-reg-seq");
        let id = registry.create(PublisherConfig::default()).unwrap();

        let mut channels = BTreeMap::new();
        channels.insert("Va".to_string(), Phasor::new(66.4, 0.0));
        channels.insert("Ic".to_string(), Phasor::new(2.5, 90.0));
        channels.insert("ch7".to_string(), Phasor::new(1.0, 45.0));

        registry
            .update_stream_phasors(
                &id,
                &StreamPhasors {
                    freq: 50.0,
                    channels,
                },
            )
            .unwrap();

        registry
            .with_stream(&id, |p| {
                assert_eq!(p.frequency(), 50.0);
                assert_eq!(p.phasors()[0].magnitude, 66.4);
                assert_eq!(p.phasors()[5].magnitude, 2.5);
                assert_eq!(p.phasors()[7].angle, 45.0);
            })
            .unwrap();
    }
}
