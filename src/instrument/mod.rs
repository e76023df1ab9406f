//! Spectrum analyser control.
//!
//! [`InstrumentClient`] wraps a [`Transport`] with the handful of SCPI
//! commands a sweep needs and maps the analyser's error queue onto [`Error`].

pub mod sim;
pub mod transport;
#[cfg(feature = "visa")]
pub mod visa;

use tracing::{debug, warn};

pub use self::transport::{open, TcpTransport, Transport};
use crate::{
    error::{Error, Result},
    units::Quantity,
};

pub const ERROR_QUERY: &str = ":SYST:ERR:ALL?";
pub const SAMPLING_RATE_QUERY: &str = ":TRAC:IQ:SRAT?";
pub const ANALYSIS_BANDWIDTH_QUERY: &str = ":TRAC:IQ:BWID?";
pub const CENTRE_FREQUENCY_QUERY: &str = ":SENS:FREQ:CENT?";
pub const REFERENCE_LEVEL_QUERY: &str = "DISP:WIND:SUBW:TRAC:Y:SCAL:RLEV?";

/// "Data out of range"
pub const OUT_OF_RANGE_CODE: i32 = -222;

pub fn centre_frequency_command(hz: f64) -> String {
    format!(":SENS:FREQ:CENT {hz} Hz")
}

/// Interpret the reply to [`ERROR_QUERY`], `<code>,<message>[;<code>,<message>...]`
pub fn parse_error_reply(reply: &str) -> Result<()> {
    let bad_reply = || Error::Reply {
        query: ERROR_QUERY.to_owned(),
        reply: reply.to_owned(),
    };
    let code: i32 = reply
        .split(',')
        .next()
        .ok_or_else(bad_reply)?
        .trim()
        .parse()
        .map_err(|_| bad_reply())?;
    match code {
        0 => Ok(()),
        OUT_OF_RANGE_CODE => Err(Error::FrequencyOutOfRange(reply.to_owned())),
        code => Err(Error::Instrument {
            code,
            message: reply.to_owned(),
        }),
    }
}

/// First token of a numeric reply, e.g. `+1.50000000E+008`
fn parse_number(query: &str, reply: &str) -> Result<f64> {
    reply
        .split_whitespace()
        .next()
        .and_then(|token| token.parse().ok())
        .ok_or_else(|| Error::Reply {
            query: query.to_owned(),
            reply: reply.to_owned(),
        })
}

pub struct InstrumentClient<T> {
    transport: T,
    passive: bool,
}

impl<T: Transport> InstrumentClient<T> {
    /// A `passive` client never sends commands, only queries
    pub fn new(transport: T, passive: bool) -> Self {
        Self { transport, passive }
    }

    pub fn is_passive(&self) -> bool {
        self.passive
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Run an I/O operation, reconnecting and retrying once on failure
    fn with_reconnect<R>(
        &mut self,
        what: &str,
        mut op: impl FnMut(&mut T) -> std::io::Result<R>,
    ) -> Result<R> {
        match op(&mut self.transport) {
            Ok(v) => Ok(v),
            Err(e) => {
                warn!("'{}' failed ({}), reconnecting to spectrum analyser", what, e);
                self.transport.reconnect()?;
                Ok(op(&mut self.transport)?)
            }
        }
    }

    pub fn send_command(&mut self, command: &str) -> Result<()> {
        if self.passive {
            debug!("Passive mode, not sending SCPI command: {}", command);
            return Ok(());
        }
        debug!("Sending SCPI command: {}", command);
        self.with_reconnect(command, |t| t.write(command))
    }

    /// Send every command in order, then check the error queue once
    pub fn send_commands<S: AsRef<str>>(&mut self, commands: &[S]) -> Result<()> {
        for command in commands {
            self.send_command(command.as_ref())?;
        }
        self.check_error()
    }

    pub fn query(&mut self, query: &str) -> Result<String> {
        self.with_reconnect(query, |t| t.query(query))
    }

    pub fn check_error(&mut self) -> Result<()> {
        let reply = self.query(ERROR_QUERY)?;
        parse_error_reply(&reply)
    }

    fn query_number(&mut self, query: &str) -> Result<f64> {
        let reply = self.query(query)?;
        parse_number(query, &reply)
    }

    /// Tune the analyser. `FrequencyOutOfRange` means the analyser refused the value.
    pub fn set_centre_frequency(&mut self, hz: f64) -> Result<()> {
        self.send_command(&centre_frequency_command(hz))?;
        self.check_error()
    }

    pub fn centre_frequency(&mut self) -> Result<Quantity> {
        Ok(Quantity::hz(self.query_number(CENTRE_FREQUENCY_QUERY)?))
    }

    pub fn sampling_rate(&mut self) -> Result<Quantity> {
        Ok(Quantity::hz(self.query_number(SAMPLING_RATE_QUERY)?))
    }

    pub fn analysis_bandwidth(&mut self) -> Result<Quantity> {
        Ok(Quantity::hz(self.query_number(ANALYSIS_BANDWIDTH_QUERY)?))
    }

    pub fn reference_level(&mut self) -> Result<Quantity> {
        Ok(Quantity::dbm(self.query_number(REFERENCE_LEVEL_QUERY)?))
    }
}
