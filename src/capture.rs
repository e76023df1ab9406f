//! This module contains all the capture logic.
//!
//! One [`CaptureSession`] records one spectrum at one centre frequency:
//!
//! 1. `configure` - replace any stale ring buffer with a fresh one and write
//!    the receiver's header file.
//! 2. `start` - launch the spectrometer and wait until it says it is attached
//!    to the buffer, then launch the receiver. The receiver must never write
//!    into a buffer nobody reads, or those samples are silently lost.
//! 3. `run` - wait for the spectrometer to finish accumulating and exit, then
//!    kill the receiver, which would otherwise run forever.
//! 4. `teardown` - kill whatever is still running and release the buffer.
//!    Runs on every path, including drop, and never fails.

use std::{
    io::BufReader,
    path::PathBuf,
    process::{Command, Stdio},
};

use tracing::{debug, info, warn};

use crate::{
    config::CaptureConfig,
    error::{Error, Result},
    monitoring::{relay_line, LogRelay, LossReport, StreamMonitor},
    process::{run_checked, wait_for_marker, ManagedProcess},
    receiver_config,
    ring_buffer::{self, DadaBuffer},
};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SessionState {
    Idle,
    BufferReady,
    ReceiverConfigWritten,
    ProcessesLaunching,
    SpectrometerReady,
    ReceiverRunning,
    Draining,
    Failed,
    Torndown,
}

/// What to record, derived from the channelization plan
#[derive(Clone, Debug, PartialEq)]
pub struct CaptureParams {
    pub input_channels: u32,
    pub fft_length: u64,
    pub accumulate_count: u64,
    pub output_file: PathBuf,
    pub reference_level_dbm: f64,
}

pub struct CaptureSession {
    config: CaptureConfig,
    state: SessionState,
    params: Option<CaptureParams>,
    buffer: Option<DadaBuffer>,
    spectrometer: Option<ManagedProcess>,
    receiver: Option<ManagedProcess>,
    monitor: Option<StreamMonitor>,
    relay: Option<LogRelay>,
}

impl CaptureSession {
    pub fn new(config: CaptureConfig) -> Self {
        Self {
            config,
            state: SessionState::Idle,
            params: None,
            buffer: None,
            spectrometer: None,
            receiver: None,
            monitor: None,
            relay: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    fn expect_state(&self, expected: SessionState, operation: &'static str) -> Result<()> {
        if self.state != expected {
            return Err(Error::SessionState {
                state: self.state,
                operation,
            });
        }
        Ok(())
    }

    fn fail<T>(&mut self, error: Error) -> Result<T> {
        self.state = SessionState::Failed;
        Err(error)
    }

    pub fn configure(&mut self, params: CaptureParams) -> Result<()> {
        self.expect_state(SessionState::Idle, "configure")?;

        let buffer = match DadaBuffer::allocate(&self.config.dada_db, &self.config.buffer_layout()) {
            Ok(buffer) => buffer,
            Err(e) => return self.fail(e),
        };
        self.buffer = Some(buffer);
        self.state = SessionState::BufferReady;

        if let Err(e) = receiver_config::write(
            &self.config.receiver_header_path,
            &self.config.receiver_settings,
            &self.config.dada_key,
            params.input_channels,
        ) {
            return self.fail(e);
        }
        self.params = Some(params);
        self.state = SessionState::ReceiverConfigWritten;
        Ok(())
    }

    fn spectrometer_command(&self, params: &CaptureParams) -> Command {
        let c = &self.config;
        let mut cmd = c.spectrometer.command([
            "--key".to_owned(),
            c.dada_key.clone(),
            "--input-nchans".to_owned(),
            params.input_channels.to_string(),
            "--fft-length".to_owned(),
            params.fft_length.to_string(),
            "--naccumulate".to_owned(),
            params.accumulate_count.to_string(),
            "--reflevel".to_owned(),
            params.reference_level_dbm.to_string(),
            "--nskip".to_owned(),
            c.skip_count.to_string(),
            "-o".to_owned(),
            params.output_file.to_string_lossy().into_owned(),
            "--log-level".to_owned(),
            c.log_level.clone(),
        ]);
        if let Some(gpu) = &c.gpu_device {
            cmd.env("CUDA_VISIBLE_DEVICES", gpu);
        }
        cmd.stdout(Stdio::piped()).stderr(Stdio::inherit());
        cmd
    }

    fn receiver_command(&self) -> Command {
        let c = &self.config;
        let mut cmd = c.receiver.command([
            "--header".to_owned(),
            c.receiver_header_path.to_string_lossy().into_owned(),
            "--slots-skip".to_owned(),
            c.skip_count.to_string(),
            "--quiet".to_owned(),
        ]);
        cmd.stdout(Stdio::piped()).stderr(Stdio::inherit());
        cmd
    }

    pub fn start(&mut self) -> Result<()> {
        self.expect_state(SessionState::ReceiverConfigWritten, "start")?;
        let params = match self.params.clone() {
            Some(p) => p,
            None => return self.fail(Error::SessionState {
                state: self.state,
                operation: "start without parameters",
            }),
        };
        self.state = SessionState::ProcessesLaunching;

        info!("Starting spectrometer");
        let cmd = self.spectrometer_command(&params);
        let name = self.config.spectrometer.name().to_owned();
        let spectrometer = match ManagedProcess::launch(&name, cmd) {
            Ok(p) => p,
            Err(e) => return self.fail(e),
        };
        let stdout = self.spectrometer.insert(spectrometer).take_stdout();
        let mut reader = match stdout {
            Some(out) => BufReader::new(out),
            None => {
                return self.fail(Error::SpectrometerStartup {
                    status: "no stdout to watch".to_owned(),
                })
            }
        };

        let marker = self.config.ready_marker.clone();
        let ready = match wait_for_marker(&mut reader, &marker, |line| relay_line(&name, line)) {
            Ok(ready) => ready,
            Err(e) => return self.fail(e.into()),
        };
        if !ready {
            let status = match self.spectrometer.as_mut().map(ManagedProcess::wait) {
                Some(Ok(status)) => status.to_string(),
                Some(Err(e)) => e.to_string(),
                None => "unknown".to_owned(),
            };
            return self.fail(Error::SpectrometerStartup { status });
        }
        debug!("Spectrometer attached to buffer {}", self.config.dada_key);
        self.relay = match LogRelay::attach(&name, reader) {
            Ok(relay) => Some(relay),
            Err(e) => return self.fail(e.into()),
        };
        self.state = SessionState::SpectrometerReady;

        info!("Starting receiver");
        let receiver_name = self.config.receiver.name().to_owned();
        let receiver = match ManagedProcess::launch(&receiver_name, self.receiver_command()) {
            Ok(p) => p,
            Err(e) => return self.fail(e),
        };
        let stdout = self.receiver.insert(receiver).take_stdout();
        if let Some(stdout) = stdout {
            match StreamMonitor::attach(stdout, self.config.skip_count) {
                Ok(monitor) => self.monitor = Some(monitor),
                Err(e) => return self.fail(e.into()),
            }
        }
        self.state = SessionState::ReceiverRunning;
        Ok(())
    }

    /// Block until the spectrometer has finished, then stop the receiver.
    /// Returns the lossy status reports seen while recording.
    pub fn run(&mut self) -> Result<Vec<LossReport>> {
        self.expect_state(SessionState::ReceiverRunning, "run")?;
        let status = match self.spectrometer.as_mut().map(ManagedProcess::wait) {
            Some(Ok(status)) => status,
            Some(Err(e)) => return self.fail(e),
            None => {
                return self.fail(Error::SessionState {
                    state: self.state,
                    operation: "run without a spectrometer",
                })
            }
        };
        self.state = SessionState::Draining;

        if let Some(receiver) = self.receiver.as_mut() {
            if let Err(e) = receiver.terminate() {
                return self.fail(e);
            }
        }
        let lossy = self.monitor.as_mut().map(StreamMonitor::stop).unwrap_or_default();
        // The spectrometer has exited, so its stdout is already at EOF
        let tail = self.relay.as_mut().map(LogRelay::join).unwrap_or_default();

        if !status.success() {
            return self.fail(Error::ExternalProcess {
                command: self.config.spectrometer.name().to_owned(),
                status: status.to_string(),
                stdout: tail.join("\n"),
                stderr: String::new(),
            });
        }
        Ok(lossy)
    }

    /// Kill both processes and release the buffer. Idempotent, never fails.
    pub fn teardown(&mut self) {
        if self.state == SessionState::Torndown {
            return;
        }
        debug!("Tearing down capture session from state {:?}", self.state);
        for process in [self.receiver.as_mut(), self.spectrometer.as_mut()]
            .into_iter()
            .flatten()
        {
            if let Err(e) = process.terminate() {
                warn!("Could not terminate {}: {}", process.name(), e);
            }
        }
        if let Some(mut monitor) = self.monitor.take() {
            monitor.stop();
        }
        if let Some(mut relay) = self.relay.take() {
            relay.stop();
        }
        self.receiver = None;
        self.spectrometer = None;
        if let Some(mut buffer) = self.buffer.take() {
            if let Err(e) = buffer.release() {
                warn!("Failed to release DADA buffer {}: {}", buffer.key(), e);
            }
        }
        self.state = SessionState::Torndown;
    }

    /// Configure, start and run, tearing down afterwards whatever happened
    pub fn record(&mut self, params: CaptureParams) -> Result<Vec<LossReport>> {
        let result = self
            .configure(params)
            .and_then(|_| self.start())
            .and_then(|_| self.run());
        if result.is_err() && self.state != SessionState::Failed {
            self.state = SessionState::Failed;
        }
        self.teardown();
        result
    }
}

impl Drop for CaptureSession {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Records one capture per call. The executor only sees this trait, so the
/// sweep logic can be exercised without the real pipeline.
pub trait Recorder {
    fn record(&mut self, params: &CaptureParams) -> Result<Vec<LossReport>>;
}

/// The real capture pipeline: a fresh [`CaptureSession`] per recording
pub struct Pipeline {
    config: CaptureConfig,
}

impl Pipeline {
    pub fn new(config: CaptureConfig) -> Self {
        Self { config }
    }
}

impl Recorder for Pipeline {
    fn record(&mut self, params: &CaptureParams) -> Result<Vec<LossReport>> {
        CaptureSession::new(self.config.clone()).record(params.clone())
    }
}

/// Last-ditch cleanup after an interrupt or an error reaching the top of the
/// stack: destroy the buffer and kill any capture executables still alive.
pub fn force_cleanup(config: &CaptureConfig) {
    info!("Cleaning up shared memory");
    if let Err(e) = ring_buffer::destroy(&config.dada_db, &config.dada_key) {
        debug!("Buffer cleanup: {}", e);
    }
    info!("Cleaning up any hanging capture instances");
    for exe in [&config.receiver, &config.spectrometer] {
        let mut cmd = Command::new("pkill");
        cmd.args(["--signal", "9", "-x", exe.name()]);
        if let Err(e) = run_checked(cmd) {
            debug!("pkill {}: {}", exe.name(), e);
        }
    }
}
