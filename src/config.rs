//! The YAML measurement configuration.
//!
//! ```yaml
//! spectrumAnalyser:
//!   resource: "TCPIP0::192.168.2.50::5025::SOCKET"
//!   scpiCommands: ["*RST", ":TRAC:IQ:STAT ON"]
//! firstStageChanneliser:
//!   numChannels: 16
//! headerInformation:
//!   - key: Antenna
//!     value: LPDA-1
//! measurementParameters:
//!   - userTag: l_band
//!     spectrumAnalyserScpi: [":TRAC:IQ:SRAT 200MHz"]
//!     frequencyRange: { start: 1000, end: 2000, units: MHz }
//!     spectrometerParams:
//!       resolution: 1
//!       resolutionUnits: kHz
//!       integrationTime: 10
//!       integrationTimeUnits: s
//!       outputPath: /data/rfi
//! ```
//!
//! Everything under `capture` (pipeline executables, buffer layout, receiver
//! network settings) and `outputOwner` has working defaults.

use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::Deserialize;
use tracing::{debug, info};

use crate::{
    error::{Error, Result},
    process::Executable,
    receiver_config::ReceiverSettings,
    ring_buffer::BufferLayout,
    units::{Quantity, Unit},
};

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    pub spectrum_analyser: AnalyserConfig,
    pub first_stage_channeliser: FirstStageConfig,
    #[serde(default)]
    pub header_information: Vec<HeaderField>,
    #[serde(default)]
    pub capture: CaptureConfig,
    /// Owner given to each measurement's output directory, `null` to leave it alone
    #[serde(default = "default_owner")]
    pub output_owner: Option<Owner>,
    #[serde(default)]
    pub measurement_parameters: Vec<MeasurementConfig>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyserConfig {
    #[serde(alias = "visaResource")]
    pub resource: String,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Sent once before any measurement
    #[serde(default)]
    pub scpi_commands: Vec<String>,
}

impl AnalyserConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FirstStageConfig {
    pub num_channels: u32,
}

/// Extra operator supplied field copied into every metadata header
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct HeaderField {
    pub key: String,
    pub value: serde_json::Value,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
pub struct Owner {
    pub uid: u32,
    pub gid: u32,
}

fn default_owner() -> Option<Owner> {
    Some(Owner {
        uid: 1000,
        gid: 1000,
    })
}

fn default_timeout_ms() -> u64 {
    5000
}

/// Capture pipeline settings
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CaptureConfig {
    /// Hexadecimal PSRDADA key shared by receiver and spectrometer
    pub dada_key: String,
    pub block_size: u64,
    pub num_blocks: u64,
    pub lock_memory: bool,
    /// Warm-up status reports to ignore, also passed to the spectrometer
    pub skip_count: u32,
    /// Spectrometer output line that says it is attached to the buffer
    pub ready_marker: String,
    pub log_level: String,
    /// `CUDA_VISIBLE_DEVICES` for the spectrometer
    pub gpu_device: Option<String>,
    pub receiver_header_path: PathBuf,
    pub dada_db: Executable,
    pub spectrometer: Executable,
    pub receiver: Executable,
    pub receiver_settings: ReceiverSettings,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            dada_key: "dada".to_owned(),
            block_size: 1_073_741_824,
            num_blocks: 12,
            lock_memory: true,
            skip_count: 4,
            ready_marker: "[info] Ready".to_owned(),
            log_level: "info".to_owned(),
            gpu_device: Some("0".to_owned()),
            receiver_header_path: PathBuf::from("/tmp/mkrecv.cfg"),
            dada_db: Executable::pinned("dada_db", "0-9"),
            spectrometer: Executable::pinned("rsspectrometer", "9"),
            receiver: Executable::pinned("mkrecv_rnt", "0-8"),
            receiver_settings: ReceiverSettings::default(),
        }
    }
}

impl CaptureConfig {
    pub fn buffer_layout(&self) -> BufferLayout {
        BufferLayout {
            key: self.dada_key.clone(),
            block_size: self.block_size,
            num_blocks: self.num_blocks,
            lock: self.lock_memory,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeasurementConfig {
    pub user_tag: String,
    #[serde(default)]
    pub spectrum_analyser_scpi: Vec<String>,
    pub frequency_range: FrequencyRange,
    pub spectrometer_params: SpectrometerParams,
}

#[derive(Clone, Debug, Deserialize)]
pub struct FrequencyRange {
    pub start: f64,
    pub end: f64,
    pub units: String,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpectrometerParams {
    pub resolution: f64,
    pub resolution_units: String,
    pub integration_time: f64,
    pub integration_time_units: String,
    pub output_path: PathBuf,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        info!("Parsing configuration from file: {}", path.display());
        let text = fs::read_to_string(path)?;
        let config = Self::from_yaml(&text)?;
        debug!("Parsed config: {:?}", config);
        Ok(config)
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.first_stage_channeliser.num_channels == 0 {
            return Err(Error::Configuration(
                "firstStageChanneliser.numChannels must be at least 1".to_owned(),
            ));
        }
        if self.capture.skip_count == 0 {
            debug!("Not skipping any receiver warm-up reports");
        }
        Ok(())
    }
}

/// One measurement, checked and with units attached
#[derive(Clone, Debug, PartialEq)]
pub struct MeasurementSpec {
    pub tag: String,
    pub start: Quantity,
    pub end: Quantity,
    pub resolution: Quantity,
    pub integration_time: Quantity,
    pub output_path: PathBuf,
    pub commands: Vec<String>,
}

impl MeasurementSpec {
    pub fn start_hz(&self) -> Result<f64> {
        self.start.to_hz()
    }

    pub fn end_hz(&self) -> Result<f64> {
        self.end.to_hz()
    }
}

impl TryFrom<&MeasurementConfig> for MeasurementSpec {
    type Error = Error;

    fn try_from(config: &MeasurementConfig) -> Result<Self> {
        let invalid = |reason: String| Error::InvalidMeasurement {
            tag: config.user_tag.clone(),
            reason,
        };
        let range_unit: Unit = config.frequency_range.units.parse()?;
        let params = &config.spectrometer_params;
        let spec = Self {
            tag: config.user_tag.clone(),
            start: Quantity::new(config.frequency_range.start, range_unit),
            end: Quantity::new(config.frequency_range.end, range_unit),
            resolution: Quantity::new(params.resolution, params.resolution_units.parse()?),
            integration_time: Quantity::new(
                params.integration_time,
                params.integration_time_units.parse()?,
            ),
            output_path: params.output_path.clone(),
            commands: config.spectrum_analyser_scpi.clone(),
        };

        if !(spec.start_hz()? < spec.end_hz()?) {
            return Err(invalid(format!(
                "frequency range start {} is not below end {}",
                spec.start, spec.end
            )));
        }
        if !(spec.resolution.value > 0.0) {
            return Err(invalid(format!(
                "resolution must be positive, got {}",
                spec.resolution
            )));
        }
        if !(spec.integration_time.value > 0.0) {
            return Err(invalid(format!(
                "integration time must be positive, got {}",
                spec.integration_time
            )));
        }
        Ok(spec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"
spectrumAnalyser:
  visaResource: "TCPIP0::192.168.2.50::5025::SOCKET"
  scpiCommands:
    - "*RST"
firstStageChanneliser:
  numChannels: 16
headerInformation:
  - key: Antenna
    value: LPDA-1
  - key: Gain
    value: 30
measurementParameters:
  - userTag: l_band
    spectrumAnalyserScpi: [":TRAC:IQ:SRAT 200MHz"]
    frequencyRange:
      start: 1000
      end: 2000
      units: MHz
    spectrometerParams:
      resolution: 1
      resolutionUnits: kHz
      integrationTime: 500
      integrationTimeUnits: ms
      outputPath: /data/rfi
"#;

    #[test]
    fn test_parse_config() {
        let config = Config::from_yaml(CONFIG).unwrap();
        assert_eq!(
            config.spectrum_analyser.resource,
            "TCPIP0::192.168.2.50::5025::SOCKET"
        );
        assert_eq!(config.spectrum_analyser.timeout(), Duration::from_secs(5));
        assert_eq!(config.first_stage_channeliser.num_channels, 16);
        assert_eq!(config.header_information[1].value, serde_json::json!(30));
        assert_eq!(config.capture, CaptureConfig::default());
        assert_eq!(config.output_owner, Some(Owner { uid: 1000, gid: 1000 }));

        let spec = MeasurementSpec::try_from(&config.measurement_parameters[0]).unwrap();
        assert_eq!(spec.tag, "l_band");
        assert_eq!(spec.start_hz().unwrap(), 1.0e9);
        assert_eq!(spec.end_hz().unwrap(), 2.0e9);
        assert_eq!(spec.integration_time.to_seconds().unwrap(), 0.5);
        assert_eq!(spec.commands, vec![":TRAC:IQ:SRAT 200MHz"]);
    }

    #[test]
    fn test_capture_overrides() {
        let text = format!(
            "{}capture:\n  dadaKey: beef\n  skipCount: 2\n  receiver:\n    path: /opt/mkrecv\noutputOwner: null\n",
            CONFIG
        );
        let config = Config::from_yaml(&text).unwrap();
        assert_eq!(config.capture.dada_key, "beef");
        assert_eq!(config.capture.skip_count, 2);
        assert_eq!(config.capture.receiver, Executable::new("/opt/mkrecv"));
        assert_eq!(config.capture.num_blocks, 12);
        assert_eq!(config.output_owner, None);
    }

    #[test]
    fn test_reject_zero_channels() {
        let text = CONFIG.replace("numChannels: 16", "numChannels: 0");
        assert!(matches!(
            Config::from_yaml(&text),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn test_measurement_invariants() {
        let config = Config::from_yaml(CONFIG).unwrap();
        let mut m = config.measurement_parameters[0].clone();
        m.frequency_range.end = 500.0;
        assert!(matches!(
            MeasurementSpec::try_from(&m),
            Err(Error::InvalidMeasurement { .. })
        ));

        let mut m = config.measurement_parameters[0].clone();
        m.spectrometer_params.resolution = 0.0;
        assert!(MeasurementSpec::try_from(&m).is_err());

        let mut m = config.measurement_parameters[0].clone();
        m.frequency_range.units = "parsec".to_owned();
        assert!(matches!(
            MeasurementSpec::try_from(&m),
            Err(Error::UnknownUnit(_))
        ));

        let mut m = config.measurement_parameters[0].clone();
        m.frequency_range.units = "s".to_owned();
        assert!(matches!(
            MeasurementSpec::try_from(&m),
            Err(Error::UnitMismatch { .. })
        ));
    }
}
