//! # Test Frame Generator
//!
//! Random GOOSE frames and SV publisher configurations for tests, benches
//! and the CLI mock relay. The generated frames are structurally valid and
//! exercise both the short- and long-form BER length paths.

use super::common::UtcTime;
use super::goose::{GooseData, GooseFrame};
use crate::publisher::{DataSource, PublisherConfig};
use rand::Rng;

/// Generates a GOOSE frame with `n_bools` boolean entries, the first
/// `n_true` of them set.
///
/// # Parameters
///
/// * `gocb_ref`: Control block reference written into the frame.
/// * `n_bools`: Number of boolean `allData` entries.
/// * `n_true`: How many leading entries are true.
pub fn goose_frame_with_bools(gocb_ref: &str, n_bools: usize, n_true: usize) -> GooseFrame {
    let all_data = (0..n_bools)
        .map(|i| GooseData::Boolean(i < n_true))
        .collect();

    GooseFrame {
        app_id: 0x0001,
        gocb_ref: gocb_ref.to_string(),
        time_allowed_to_live: 2000,
        dat_set: format!("{}$DataSet", gocb_ref),
        go_id: None,
        t: UtcTime::now(),
        st_num: 1,
        sq_num: 0,
        simulation: false,
        conf_rev: 1,
        nds_com: false,
        num_dat_set_entries: n_bools as i32,
        all_data,
    }
}

/// Generates a GOOSE frame with randomized counters and a random boolean
/// payload.
pub fn random_goose_frame<R: Rng>(rng: &mut R, gocb_ref: &str, n_bools: usize) -> GooseFrame {
    let mut frame = goose_frame_with_bools(gocb_ref, n_bools, 0);
    frame.st_num = rng.gen_range(1..1000);
    frame.sq_num = rng.gen_range(0..1000);
    frame.all_data = (0..n_bools)
        .map(|_| GooseData::Boolean(rng.gen_bool(0.5)))
        .collect();
    frame
}

/// Generates a publisher configuration with a randomized APPID and source
/// MAC, suitable for multi-stream tests.
pub fn random_publisher_config<R: Rng>(rng: &mut R) -> PublisherConfig {
    let last = rng.gen_range(0x02..0xFE_u8);
    PublisherConfig {
        app_id: rng.gen_range(0x4000..0x4FFF),
        sv_id: format!("MU{:02X}", last),
        dat_set: None,
        conf_rev: 1,
        smp_synch: 1,
        smp_mod: None,
        mac_dst: format!("01:0C:CD:04:00:{:02X}", last),
        mac_src: format!("AA:BB:CC:DD:EE:{:02X}", last),
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
