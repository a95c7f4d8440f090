//! # Mock Protection Relay
//!
//! A simulated overcurrent relay on the raw-frame bus, used by the offline
//! self-test and as a standalone peer for driver demos. It watches the
//! current channels of captured SV frames; when the estimated RMS exceeds
//! the pickup setting it starts an IDMT timer and, on expiry, publishes a
//! GOOSE frame with its first boolean true. Dropping below pickup resets
//! the timer and republishes the released state.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use vts_core::iec61850::common::{MacAddress, UtcTime, VlanTag};
use vts_core::iec61850::goose::{GooseData, GooseFrame};
use vts_core::iec61850::sampled_values::parse_sv_frame;
use vts_core::io::SharedPort;
use vts_core::sniffer::DEFAULT_SV_LSB;
use vts_core::testers::overcurrent::{calculate_idmt, OcCurve};

/// Channel carrying phase A current under the stream channel-role layout.
const CURRENT_CHANNEL: usize = 3;

/// Samples accumulated per pickup evaluation; one nominal cycle at 4800 Hz,
/// so the peak detector always sees a full crest.
const SAMPLES_PER_EVALUATION: u32 = 80;

#[derive(Debug, Clone)]
pub struct MockRelaySettings {
    pub gocb_ref: String,
    pub pickup_current: f64,
    pub tms: f64,
    pub curve: OcCurve,
    pub sv_lsb: f64,
}

impl Default for MockRelaySettings {
    fn default() -> Self {
        MockRelaySettings {
            gocb_ref: "RelayA".to_string(),
            pickup_current: 150.0,
            tms: 0.1,
            curve: OcCurve::StandardInverse,
            sv_lsb: DEFAULT_SV_LSB,
        }
    }
}

struct RelayState {
    tripped: bool,
    pickup_started: Option<Instant>,
    peak: f64,
    samples_seen: u32,
    st_num: i32,
    sq_num: i32,
}

/// Runs the relay loop until `stop` is raised. Blocks the calling thread.
pub fn run_mock_relay(port: SharedPort, settings: MockRelaySettings, stop: Arc<AtomicBool>) {
    let mac_src = port.local_mac();
    let mac_dst = MacAddress::parse("01:0C:CD:01:00:00").expect("static MAC");
    let vlan = VlanTag::new(4, false, 5).expect("static VLAN");

    let mut state = RelayState {
        tripped: false,
        pickup_started: None,
        peak: 0.0,
        samples_seen: 0,
        st_num: 1,
        sq_num: 0,
    };

    log::info!(
        "mock relay '{}' online: pickup {} A, TMS {}, curve {:?}",
        settings.gocb_ref,
        settings.pickup_current,
        settings.tms,
        settings.curve
    );

    while !stop.load(Ordering::Acquire) {
        let frame = match port.recv(Duration::from_millis(100)) {
            Ok(Some(frame)) => frame,
            Ok(None) => continue,
            Err(e) => {
                log::error!("mock relay recv failed: {}", e);
                break;
            }
        };

        let Ok(info) = parse_sv_frame(&frame) else {
            continue;
        };

        for asdu in &info.asdus {
            let Some((raw, _)) = asdu.samples.get(CURRENT_CHANNEL) else {
                continue;
            };
            let value = (*raw as f64 * settings.sv_lsb).abs();
            state.peak = state.peak.max(value);
            state.samples_seen += 1;
        }

        if state.samples_seen < SAMPLES_PER_EVALUATION {
            continue;
        }
        let rms_estimate = state.peak / std::f64::consts::SQRT_2;
        state.peak = 0.0;
        state.samples_seen = 0;

        if rms_estimate > settings.pickup_current {
            let multiple = rms_estimate / settings.pickup_current;
            let delay = calculate_idmt(settings.curve, settings.tms, multiple);
            let started = *state.pickup_started.get_or_insert_with(Instant::now);

            if !state.tripped && started.elapsed().as_secs_f64() >= delay {
                state.tripped = true;
                state.st_num += 1;
                state.sq_num = 0;
                log::info!(
                    "mock relay trip at {:.1} A (M = {:.2}, delay {:.3}s)",
                    rms_estimate,
                    multiple,
                    delay
                );
                publish_state(&port, &settings, &mac_dst, &mac_src, &vlan, &mut state, true);
            }
        } else {
            state.pickup_started = None;
            if state.tripped {
                state.tripped = false;
                state.st_num += 1;
                state.sq_num = 0;
                log::info!("mock relay released at {:.1} A", rms_estimate);
                publish_state(&port, &settings, &mac_dst, &mac_src, &vlan, &mut state, false);
            }
        }
    }

    log::info!("mock relay '{}' offline", settings.gocb_ref);
}

fn publish_state(
    port: &SharedPort,
    settings: &MockRelaySettings,
    mac_dst: &MacAddress,
    mac_src: &MacAddress,
    vlan: &VlanTag,
    state: &mut RelayState,
    tripped: bool,
) {
    let frame = GooseFrame {
        app_id: 0x0001,
        gocb_ref: settings.gocb_ref.clone(),
        time_allowed_to_live: 2000,
        dat_set: format!("{}$Trip", settings.gocb_ref),
        go_id: None,
        t: UtcTime::now(),
        st_num: state.st_num,
        sq_num: state.sq_num,
        simulation: false,
        conf_rev: 1,
        nds_com: false,
        num_dat_set_entries: 1,
        all_data: vec![GooseData::Boolean(tripped)],
    };
    state.sq_num += 1;

    match frame.encode(mac_dst, mac_src, vlan) {
        Ok(bytes) => {
            if let Err(e) = port.send(&bytes) {
                log::warn!("mock relay send failed: {}", e);
            }
        }
        Err(e) => log::error!("mock relay encode failed: {}", e),
    }
}
