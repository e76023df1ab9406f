//! Per-capture header records and output file naming

use std::{
    fs::File,
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};

use serde_json::{json, Map, Value};
use tracing::debug;

use crate::{config::HeaderField, error::Result};

pub const DATA_EXTENSION: &str = "npy";
pub const HEADER_EXTENSION: &str = "rfi";

/// `<dir>/<tag>_<centre MHz>_<epoch ms>`, shared by a capture's data and header files
#[derive(Clone, Debug, PartialEq)]
pub struct CaptureFiles {
    stem: PathBuf,
}

impl CaptureFiles {
    pub fn new(dir: &Path, tag: &str, centre_frequency_hz: f64, timestamp_ms: i64) -> Self {
        let name = format!("{}_{:.5}_{}", tag, centre_frequency_hz / 1e6, timestamp_ms);
        Self {
            stem: dir.join(name),
        }
    }

    /// File name without directory or extension
    pub fn scan_id(&self) -> String {
        self.stem
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    // Not `with_extension`, the stem already contains a '.'
    fn with_suffix(&self, extension: &str) -> PathBuf {
        let mut path = self.stem.clone().into_os_string();
        path.push(".");
        path.push(extension);
        PathBuf::from(path)
    }

    pub fn data_path(&self) -> PathBuf {
        self.with_suffix(DATA_EXTENSION)
    }

    pub fn header_path(&self) -> PathBuf {
        self.with_suffix(HEADER_EXTENSION)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct CaptureHeader {
    pub centre_frequency_hz: f64,
    pub bandwidth_hz: f64,
    pub analysis_bandwidth_hz: f64,
    pub total_channels: u64,
    pub integration_time_s: f64,
    pub scan_id: String,
    pub timestamp_ms: i64,
    pub tag: String,
}

impl CaptureHeader {
    pub fn to_json(&self, extra: &[HeaderField]) -> Value {
        let mut fields = Map::new();
        fields.insert("Center Frequency in Hz".into(), json!(self.centre_frequency_hz));
        fields.insert(
            "Analysis Center Frequency in Hz".into(),
            json!(self.centre_frequency_hz),
        );
        fields.insert("Bandwidth in Hz".into(), json!(self.bandwidth_hz));
        fields.insert(
            "Analysis Bandwidth in Hz".into(),
            json!(self.analysis_bandwidth_hz),
        );
        fields.insert("Number of Channels".into(), json!(self.total_channels));
        fields.insert("Frequency Spacing".into(), json!("uniform"));
        fields.insert(
            "Integration time in milliseconds".into(),
            json!(self.integration_time_s * 1e3),
        );
        fields.insert("Unique Scan ID".into(), json!(self.scan_id));
        fields.insert("Timestamp".into(), json!(self.timestamp_ms));
        fields.insert("User Friendly Name".into(), json!(self.tag));
        // Operator fields go last and may override ours
        for field in extra {
            fields.insert(field.key.clone(), field.value.clone());
        }
        Value::Object(fields)
    }

    pub fn write(&self, path: &Path, extra: &[HeaderField]) -> Result<()> {
        debug!("Writing capture header {}", path.display());
        let mut writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer(&mut writer, &self.to_json(extra))?;
        writer.flush()?;
        Ok(())
    }
}
