//! The DADA header file the packet receiver reads at startup

use std::{fmt::Write as _, fs, path::Path};

use serde::Deserialize;
use tracing::{debug, info};

use crate::error::Result;

/// How the FPGA is packing data onto the network
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ReceiverMode {
    /// Polyphase filterbank output, heaps indexed by timestamp and channel group
    Channelized,
    /// Raw samples, heaps indexed by timestamp only
    Passthrough,
}

impl ReceiverMode {
    pub fn for_input_channels(input_channels: u32) -> Self {
        if input_channels == 1 {
            ReceiverMode::Passthrough
        } else {
            ReceiverMode::Channelized
        }
    }
}

/// Network and buffering settings for the receiver
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ReceiverSettings {
    pub sync_time: String,
    pub sample_clock: f64,
    pub mcast_sources: String,
    pub port: u16,
    pub ibv_interface: String,
    pub ibv_vector: i32,
    pub ibv_max_poll: u32,
    pub heap_nbytes: u64,
    pub packet_size: u64,
    pub buffer_size: u64,
    pub dada_nslots: u32,
    pub nthreads: u32,
    /// Channel-group index list used in channelized mode
    pub channel_groups: String,
}

impl Default for ReceiverSettings {
    fn default() -> Self {
        Self {
            sync_time: "1231235243.0000000".to_owned(),
            sample_clock: 1_750_000_000.0,
            mcast_sources: "225.0.0.100+15".to_owned(),
            port: 7148,
            ibv_interface: "192.168.2.81".to_owned(),
            ibv_vector: -1,
            ibv_max_poll: 10,
            heap_nbytes: 8192,
            packet_size: 9000,
            buffer_size: 128_000_000,
            dada_nslots: 4,
            nthreads: 9,
            channel_groups: "0:16".to_owned(),
        }
    }
}

pub fn render(settings: &ReceiverSettings, key: &str, mode: ReceiverMode) -> String {
    let mut out = String::new();
    // `write!` into a String can't fail
    let mut line = |k: &str, v: &dyn std::fmt::Display| {
        let _ = writeln!(out, "{k:<12} {v}");
    };
    line("HEADER", &"DADA");
    line("HDR_VERSION", &"1.0");
    line("HDR_SIZE", &4096);
    line("DADA_VERSION", &"1.0");
    line("UTC_START", &"unset");
    line("MJD_START", &"unset");
    line("DADA_KEY", &key);
    line("SYNC_TIME", &settings.sync_time);
    line("SAMPLE_CLOCK", &format!("{:.1}", settings.sample_clock));
    line("MCAST_SOURCES", &settings.mcast_sources);
    line("PORT", &settings.port);
    line("IBV_IF", &settings.ibv_interface);
    line("IBV_VECTOR", &settings.ibv_vector);
    line("IBV_MAX_POLL", &settings.ibv_max_poll);
    line("HEAP_NBYTES", &settings.heap_nbytes);
    line("PACKET_SIZE", &settings.packet_size);
    line("BUFFER_SIZE", &settings.buffer_size);
    line("DADA_NSLOTS", &settings.dada_nslots);
    line("NTHREADS", &settings.nthreads);
    match mode {
        ReceiverMode::Channelized => {
            line("NINDICES", &2);
            line("IDX1_ITEM", &0);
            line("IDX1_STEP", &1);
            line("IDX2_ITEM", &2);
            line("IDX2_LIST", &settings.channel_groups);
        }
        ReceiverMode::Passthrough => {
            line("NINDICES", &1);
            line("IDX1_ITEM", &0);
            line("IDX1_STEP", &1);
        }
    }
    out
}

/// Write the receiver header for `input_channels` to `path`
pub fn write(
    path: &Path,
    settings: &ReceiverSettings,
    key: &str,
    input_channels: u32,
) -> Result<ReceiverMode> {
    let mode = ReceiverMode::for_input_channels(input_channels);
    match mode {
        ReceiverMode::Passthrough => info!("Assuming PASSTHROUGH mode on FPGA"),
        ReceiverMode::Channelized => info!("Assuming PFB mode on FPGA"),
    }
    debug!("Writing receiver header file {}", path.display());
    fs::write(path, render(settings, key, mode))?;
    Ok(mode)
}
