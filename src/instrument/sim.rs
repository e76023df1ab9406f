//! An in-process stand-in for the spectrum analyser.
//!
//! Understands the queries and the tuning command [`InstrumentClient`](super::InstrumentClient)
//! uses, keeps an error queue like the real thing and can be told to drop the
//! connection. Clones share state, so a test can keep a handle after moving
//! one into a client.

use std::{
    io,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use super::{
    transport::Transport, ANALYSIS_BANDWIDTH_QUERY, CENTRE_FREQUENCY_QUERY, ERROR_QUERY,
    OUT_OF_RANGE_CODE, REFERENCE_LEVEL_QUERY, SAMPLING_RATE_QUERY,
};

#[derive(Debug)]
struct State {
    centre_frequency: f64,
    sampling_rate: f64,
    analysis_bandwidth: f64,
    reference_level: f64,
    min_frequency: f64,
    max_frequency: f64,
    /// Added to the tuned frequency when read back
    readback_offset: f64,
    errors: Vec<(i32, String)>,
    commands: Vec<String>,
    tunings: Vec<f64>,
    io_faults: u32,
    reconnects: u32,
}

#[derive(Clone, Debug)]
pub struct SimulatedAnalyser {
    state: Arc<Mutex<State>>,
}

impl Default for SimulatedAnalyser {
    fn default() -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                centre_frequency: 1.0e9,
                sampling_rate: 200.0e6,
                analysis_bandwidth: 160.0e6,
                reference_level: -10.0,
                min_frequency: 2.0,
                max_frequency: 43.5e9,
                readback_offset: 0.0,
                errors: Vec::new(),
                commands: Vec::new(),
                tunings: Vec::new(),
                io_faults: 0,
                reconnects: 0,
            })),
        }
    }
}

impl SimulatedAnalyser {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn with_sampling_rate(self, hz: f64) -> Self {
        self.state().sampling_rate = hz;
        self
    }

    pub fn with_analysis_bandwidth(self, hz: f64) -> Self {
        self.state().analysis_bandwidth = hz;
        self
    }

    pub fn with_frequency_limits(self, min: f64, max: f64) -> Self {
        {
            let mut state = self.state();
            state.min_frequency = min;
            state.max_frequency = max;
        }
        self
    }

    pub fn with_readback_offset(self, hz: f64) -> Self {
        self.state().readback_offset = hz;
        self
    }

    pub fn centre_frequency(&self) -> f64 {
        self.state().centre_frequency
    }

    pub fn sampling_rate(&self) -> f64 {
        self.state().sampling_rate
    }

    pub fn max_frequency(&self) -> f64 {
        self.state().max_frequency
    }

    /// Commands other than tuning, in the order they arrived
    pub fn commands(&self) -> Vec<String> {
        self.state().commands.clone()
    }

    /// Every accepted centre frequency, in order
    pub fn tunings(&self) -> Vec<f64> {
        self.state().tunings.clone()
    }

    pub fn push_error(&self, code: i32, message: &str) {
        self.state().errors.push((code, message.to_owned()));
    }

    /// Fail the next `n` reads or writes as if the link dropped
    pub fn inject_io_faults(&self, n: u32) {
        self.state().io_faults = n;
    }

    pub fn reconnects(&self) -> u32 {
        self.state().reconnects
    }

    fn take_fault(state: &mut State) -> io::Result<()> {
        if state.io_faults > 0 {
            state.io_faults -= 1;
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "simulated link failure",
            ));
        }
        Ok(())
    }
}

impl Transport for SimulatedAnalyser {
    fn write(&mut self, command: &str) -> io::Result<()> {
        let mut state = self.state();
        Self::take_fault(&mut state)?;
        if let Some(arg) = command.strip_prefix(":SENS:FREQ:CENT ") {
            let hz = arg
                .split_whitespace()
                .next()
                .and_then(|v| v.parse::<f64>().ok());
            match hz {
                Some(hz) if hz >= state.min_frequency && hz <= state.max_frequency => {
                    state.centre_frequency = hz;
                    state.tunings.push(hz);
                }
                Some(_) => state
                    .errors
                    .push((OUT_OF_RANGE_CODE, "Data out of range".to_owned())),
                None => state.errors.push((-104, "Data type error".to_owned())),
            }
        } else {
            state.commands.push(command.to_owned());
        }
        Ok(())
    }

    fn query(&mut self, query: &str) -> io::Result<String> {
        let mut state = self.state();
        Self::take_fault(&mut state)?;
        let reply = match query {
            ERROR_QUERY => {
                if state.errors.is_empty() {
                    "0,\"No error\"".to_owned()
                } else {
                    state
                        .errors
                        .drain(..)
                        .map(|(code, msg)| format!("{code},\"{msg}\""))
                        .collect::<Vec<_>>()
                        .join(";")
                }
            }
            SAMPLING_RATE_QUERY => state.sampling_rate.to_string(),
            ANALYSIS_BANDWIDTH_QUERY => state.analysis_bandwidth.to_string(),
            CENTRE_FREQUENCY_QUERY => (state.centre_frequency + state.readback_offset).to_string(),
            REFERENCE_LEVEL_QUERY => state.reference_level.to_string(),
            _ => {
                state.errors.push((-113, "Undefined header".to_owned()));
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("no reply to '{query}'"),
                ));
            }
        };
        Ok(reply)
    }

    fn reconnect(&mut self) -> io::Result<()> {
        self.state().reconnects += 1;
        Ok(())
    }
}
