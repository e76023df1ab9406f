//! VISA sessions for analysers not reachable over a raw SCPI socket
//! (VXI-11 `INSTR`, HiSLIP, GPIB, USB). Needs a VISA library at runtime.

use std::{
    ffi::CString,
    io::{self, BufRead, BufReader, Write},
    time::Duration,
};

use tracing::{debug, info};
use visa_rs::prelude::*;

use super::transport::Transport;

fn visa_error(e: impl std::fmt::Display) -> io::Error {
    io::Error::new(io::ErrorKind::Other, format!("VISA: {e}"))
}

struct Session {
    // Closing the resource manager closes every session it opened
    _rm: DefaultRM,
    instrument: Instrument,
}

pub struct VisaTransport {
    resource: String,
    timeout: Duration,
    session: Option<Session>,
}

impl VisaTransport {
    pub fn connect(resource: &str, timeout: Duration) -> io::Result<Self> {
        let mut transport = Self {
            resource: resource.to_owned(),
            timeout,
            session: None,
        };
        transport.open()?;
        Ok(transport)
    }

    fn open(&mut self) -> io::Result<()> {
        self.session = None;
        let rm = DefaultRM::new().map_err(visa_error)?;
        let name = CString::new(self.resource.as_str())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let instrument = rm
            .open(&name.into(), AccessMode::NO_LOCK, self.timeout)
            .map_err(visa_error)?;
        info!("Opened VISA resource {}", self.resource);
        self.session = Some(Session { _rm: rm, instrument });
        Ok(())
    }

    fn instrument(&mut self) -> io::Result<&mut Instrument> {
        self.session
            .as_mut()
            .map(|s| &mut s.instrument)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "VISA session closed"))
    }

    fn send_line(&mut self, line: &str) -> io::Result<()> {
        let result = self
            .instrument()?
            .write_all(format!("{line}\n").as_bytes());
        if result.is_err() {
            self.session = None;
        }
        result
    }
}

impl Transport for VisaTransport {
    fn write(&mut self, command: &str) -> io::Result<()> {
        self.send_line(command)
    }

    fn query(&mut self, query: &str) -> io::Result<String> {
        self.send_line(query)?;
        let mut reply = String::new();
        let read = BufReader::new(&*self.instrument()?).read_line(&mut reply);
        match read {
            Ok(_) => {
                let reply = reply.trim().to_owned();
                debug!("Query '{}' -> '{}'", query, reply);
                Ok(reply)
            }
            Err(e) => {
                self.session = None;
                Err(e)
            }
        }
    }

    fn reconnect(&mut self) -> io::Result<()> {
        self.open()
    }
}
