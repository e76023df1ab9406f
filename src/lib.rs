//! Swept-frequency RFI measurements: tune a spectrum analyser across a band
//! and record one integrated spectrum per step with a GPU spectrometer fed
//! from a PSRDADA ring buffer.

pub mod args;
pub mod capture;
pub mod channelization;
pub mod config;
pub mod error;
pub mod executor;
pub mod instrument;
pub mod metadata;
pub mod monitoring;
pub mod process;
pub mod receiver_config;
pub mod ring_buffer;
pub mod sweep;
pub mod units;

pub use error::{Error, Result};
