//! Runs every configured measurement: tune, record, repeat across the band.

use std::{
    fs,
    os::unix::fs::chown,
    path::{Path, PathBuf},
    process,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use chrono::{Local, Utc};
use tracing::{error, info, warn};

use crate::{
    capture::{force_cleanup, CaptureParams, Recorder},
    channelization::{self, ChannelizationResult},
    config::{CaptureConfig, Config, MeasurementConfig, MeasurementSpec, Owner},
    error::Result,
    instrument::{InstrumentClient, Transport},
    metadata::{CaptureFiles, CaptureHeader},
    sweep,
};

/// What happened to one measurement's sweep
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MeasurementOutcome {
    pub output_dir: PathBuf,
    /// Header paths of completed captures, in sweep order
    pub captures: Vec<PathBuf>,
    pub planned_steps: usize,
    /// The analyser refused a frequency and the rest of the sweep was skipped
    pub truncated: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CampaignSummary {
    pub completed: usize,
    pub failed: usize,
    pub captures: usize,
}

pub struct MeasurementExecutor<T, R> {
    config: Config,
    instrument: InstrumentClient<T>,
    recorder: R,
    interrupted: Arc<AtomicBool>,
}

/// Route Ctrl-C, SIGTERM and SIGHUP to `interrupted`. The first signal lets
/// the current capture finish; a second one kills the pipeline, releases the
/// ring buffer and exits.
pub fn install_interrupt_handler(
    interrupted: Arc<AtomicBool>,
    capture: CaptureConfig,
) -> Result<()> {
    ctrlc::set_handler(move || {
        if interrupted.swap(true, Ordering::SeqCst) {
            warn!("Interrupted again, aborting");
            force_cleanup(&capture);
            process::exit(130);
        }
        warn!("Interrupted, stopping after the current capture (interrupt again to abort)");
    })?;
    Ok(())
}

/// Create `output_path/<local time>/` and hand it to the operator account
fn prepare_output_dir(base: &Path, owner: Option<Owner>) -> Result<PathBuf> {
    let dir = base.join(Local::now().format("%Y%m%d-%H%M%S").to_string());
    info!("Output directory: {}", dir.display());
    fs::create_dir_all(&dir).map_err(|e| {
        error!("Cannot create output directory {}", dir.display());
        e
    })?;
    if let Some(owner) = owner {
        chown(&dir, Some(owner.uid), Some(owner.gid)).map_err(|e| {
            error!(
                "Cannot chown output directory to {}:{}",
                owner.uid, owner.gid
            );
            e
        })?;
    }
    Ok(dir)
}

impl<T: Transport, R: Recorder> MeasurementExecutor<T, R> {
    pub fn new(config: Config, instrument: InstrumentClient<T>, recorder: R) -> Self {
        Self {
            config,
            instrument,
            recorder,
            interrupted: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Flag checked between sweep steps; set it to stop after the current capture
    pub fn interrupt_flag(&self) -> Arc<AtomicBool> {
        self.interrupted.clone()
    }

    fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }

    pub fn instrument(&self) -> &InstrumentClient<T> {
        &self.instrument
    }

    pub fn recorder(&self) -> &R {
        &self.recorder
    }

    /// Send the analyser's global setup commands
    pub fn init(&mut self) -> Result<()> {
        info!("Initialising spectrum analyser");
        let commands = self.config.spectrum_analyser.scpi_commands.clone();
        self.instrument.send_commands(&commands)
    }

    /// Run every measurement, logging and skipping the ones that fail
    pub fn run_all_measurements(&mut self) -> CampaignSummary {
        let mut summary = CampaignSummary::default();
        let measurements = self.config.measurement_parameters.clone();
        for measurement in &measurements {
            if self.is_interrupted() {
                warn!("Interrupted, not starting measurement '{}'", measurement.user_tag);
                break;
            }
            match self.run_measurement_config(measurement) {
                Ok(outcome) => {
                    summary.completed += 1;
                    summary.captures += outcome.captures.len();
                }
                Err(e) => {
                    error!(
                        "Measurement failed with error '{}', skipping to next measurement",
                        e
                    );
                    summary.failed += 1;
                }
            }
        }
        summary
    }

    pub fn run_measurement_config(&mut self, config: &MeasurementConfig) -> Result<MeasurementOutcome> {
        let spec = MeasurementSpec::try_from(config)?;
        self.run_measurement(&spec)
    }

    pub fn run_measurement(&mut self, spec: &MeasurementSpec) -> Result<MeasurementOutcome> {
        info!("Running measurement: {}", spec.tag);

        info!("Preparing spectrum analyser");
        self.instrument.send_commands(&spec.commands)?;

        let sampling_rate = self.instrument.sampling_rate()?;
        info!("Sampling rate: {}", sampling_rate);
        let analysis_bandwidth = self.instrument.analysis_bandwidth()?;
        info!("Analysis bandwidth: {}", analysis_bandwidth);
        let reference_level = self.instrument.reference_level()?;
        info!("Reference level: {}", reference_level);

        let output_dir = prepare_output_dir(&spec.output_path, self.config.output_owner)?;

        let first_stage_channels = self.config.first_stage_channeliser.num_channels;
        let plan = channelization::plan(
            sampling_rate,
            first_stage_channels,
            spec.resolution,
            spec.integration_time,
        )
        .map_err(|e| {
            error!("Cannot channelise measurement '{}': {}", spec.tag, e);
            e
        })?;
        log_plan(&plan, spec);

        let frequencies = sweep::centre_frequencies(
            &spec.tag,
            spec.start_hz()?,
            spec.end_hz()?,
            analysis_bandwidth.to_hz()?,
        )?;
        info!("Sweep of {} steps planned", frequencies.len());

        let mut outcome = MeasurementOutcome {
            output_dir: output_dir.clone(),
            planned_steps: frequencies.len(),
            ..Default::default()
        };
        let params = CaptureStep {
            plan,
            sampling_rate_hz: sampling_rate.to_hz()?,
            reference_level_dbm: reference_level.value,
        };

        for frequency in frequencies {
            if self.is_interrupted() {
                warn!("Interrupted, skipping remaining frequencies");
                outcome.truncated = true;
                break;
            }
            info!(
                "Preparing for {} measurement with centre frequency {:.3} MHz",
                spec.integration_time,
                frequency / 1e6
            );
            match self.instrument.set_centre_frequency(frequency) {
                Ok(()) => {}
                Err(e) if e.is_out_of_range() => {
                    error!("Requested frequency outside of valid range");
                    warn!("Skipping remaining frequencies in current range");
                    outcome.truncated = true;
                    break;
                }
                Err(e) => return Err(e),
            }
            let header = self.capture_step(spec, &output_dir, &params)?;
            outcome.captures.push(header);
        }
        info!("Measurement complete");
        Ok(outcome)
    }

    /// Header first, then data, for the frequency the analyser is tuned to now
    fn capture_step(
        &mut self,
        spec: &MeasurementSpec,
        output_dir: &Path,
        step: &CaptureStep,
    ) -> Result<PathBuf> {
        let actual_frequency = self.instrument.centre_frequency()?.to_hz()?;
        info!("Actual centre frequency set: {} Hz", actual_frequency);

        let timestamp_ms = Utc::now().timestamp_millis();
        let files = CaptureFiles::new(output_dir, &spec.tag, actual_frequency, timestamp_ms);
        let analysis_bandwidth = self.instrument.analysis_bandwidth()?.to_hz()?;
        let header = CaptureHeader {
            centre_frequency_hz: actual_frequency,
            bandwidth_hz: step.sampling_rate_hz,
            analysis_bandwidth_hz: analysis_bandwidth,
            total_channels: step.plan.total_channels,
            integration_time_s: step.plan.actual_integration_time,
            scan_id: files.scan_id(),
            timestamp_ms,
            tag: spec.tag.clone(),
        };
        let header_path = files.header_path();
        header.write(&header_path, &self.config.header_information)?;

        info!("Starting recording system");
        let lossy = self.recorder.record(&CaptureParams {
            input_channels: step.plan.first_stage_channels,
            fft_length: step.plan.fft_length,
            accumulate_count: step.plan.accumulate_count,
            output_file: files.data_path(),
            reference_level_dbm: step.reference_level_dbm,
        })?;
        if !lossy.is_empty() {
            warn!(
                "{} status reports showed packet loss during {}",
                lossy.len(),
                files.scan_id()
            );
        }
        info!("Recording done");
        Ok(header_path)
    }
}

/// Per-measurement values every sweep step reuses
struct CaptureStep {
    plan: ChannelizationResult,
    sampling_rate_hz: f64,
    reference_level_dbm: f64,
}

fn log_plan(plan: &ChannelizationResult, spec: &MeasurementSpec) {
    info!("First stage channeliser Nchans: {}", plan.first_stage_channels);
    info!(
        "Desired second stage channeliser frequency resolution: {}",
        spec.resolution
    );
    info!("Second stage channeliser Nchans: {}", plan.fft_length);
    info!(
        "Actual second stage frequency resolution: {} Hz",
        plan.actual_resolution
    );
    info!(
        "Second stage number of spectra to accumulate: {}",
        plan.accumulate_count
    );
    info!("Actual integration time: {} s", plan.actual_integration_time);
    info!("Total number of channels: {}", plan.total_channels);
}
