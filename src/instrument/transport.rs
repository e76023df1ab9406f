//! Line-oriented command channel to the spectrum analyser

use std::{
    io::{self, BufRead, BufReader, Write},
    net::{TcpStream, ToSocketAddrs},
    time::Duration,
};

use tracing::{debug, info};

/// Raw SCPI socket port used when the resource string doesn't name one
pub const DEFAULT_SCPI_PORT: u16 = 5025;

/// The text channel an [`InstrumentClient`](super::InstrumentClient) talks over.
///
/// Commands are fire-and-forget, queries return one reply line.
pub trait Transport {
    fn write(&mut self, command: &str) -> io::Result<()>;
    fn query(&mut self, query: &str) -> io::Result<String>;
    /// Drop whatever connection is held and open a fresh one
    fn reconnect(&mut self) -> io::Result<()>;
}

/// SCPI over a raw TCP socket
pub struct TcpTransport {
    address: String,
    timeout: Duration,
    stream: Option<BufReader<TcpStream>>,
}

/// True for resources [`TcpTransport`] can reach directly: `host[:port]` or
/// VISA style `TCPIP0::host::port::SOCKET`. Everything else needs VISA.
pub fn is_socket_resource(resource: &str) -> bool {
    !resource.contains("::") || resource.to_ascii_uppercase().ends_with("::SOCKET")
}

/// Turn a raw socket resource string into `host:port`.
///
/// Accepts plain `host:port`, a bare host, or `TCPIP0::host::port::SOCKET`.
pub fn socket_address(resource: &str) -> io::Result<String> {
    let invalid = || {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("'{resource}' is not a raw socket resource"),
        )
    };
    if resource.contains("::") {
        let parts: Vec<&str> = resource.split("::").collect();
        if parts.len() != 4
            || !parts[0].to_ascii_uppercase().starts_with("TCPIP")
            || !parts[3].eq_ignore_ascii_case("SOCKET")
        {
            return Err(invalid());
        }
        return Ok(format!("{}:{}", parts[1], parts[2]));
    }
    if resource.is_empty() {
        return Err(invalid());
    }
    if resource.contains(':') {
        Ok(resource.to_owned())
    } else {
        Ok(format!("{resource}:{DEFAULT_SCPI_PORT}"))
    }
}

/// Connect to `resource` with whichever transport its form calls for
pub fn open(resource: &str, timeout: Duration) -> io::Result<Box<dyn Transport>> {
    if is_socket_resource(resource) {
        return Ok(Box::new(TcpTransport::connect(resource, timeout)?));
    }
    #[cfg(feature = "visa")]
    {
        Ok(Box::new(super::visa::VisaTransport::connect(resource, timeout)?))
    }
    #[cfg(not(feature = "visa"))]
    {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            format!("'{resource}' needs VISA support, rebuild with --features visa"),
        ))
    }
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn write(&mut self, command: &str) -> io::Result<()> {
        (**self).write(command)
    }

    fn query(&mut self, query: &str) -> io::Result<String> {
        (**self).query(query)
    }

    fn reconnect(&mut self) -> io::Result<()> {
        (**self).reconnect()
    }
}

impl TcpTransport {
    pub fn connect(resource: &str, timeout: Duration) -> io::Result<Self> {
        let mut transport = Self {
            address: socket_address(resource)?,
            timeout,
            stream: None,
        };
        transport.open()?;
        Ok(transport)
    }

    fn open(&mut self) -> io::Result<()> {
        self.stream = None;
        let addr = self.address.to_socket_addrs()?.next().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("{} did not resolve", self.address),
            )
        })?;
        let stream = TcpStream::connect_timeout(&addr, self.timeout)?;
        stream.set_read_timeout(Some(self.timeout))?;
        stream.set_write_timeout(Some(self.timeout))?;
        stream.set_nodelay(true)?;
        info!("Connected to spectrum analyser at {}", self.address);
        self.stream = Some(BufReader::new(stream));
        Ok(())
    }

    fn stream(&mut self) -> io::Result<&mut BufReader<TcpStream>> {
        self.stream
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "analyser not connected"))
    }

    fn send_line(&mut self, line: &str) -> io::Result<()> {
        let stream = self.stream()?;
        let result = stream
            .get_mut()
            .write_all(format!("{line}\n").as_bytes())
            .and_then(|_| stream.get_mut().flush());
        if result.is_err() {
            self.stream = None;
        }
        result
    }
}

impl Transport for TcpTransport {
    fn write(&mut self, command: &str) -> io::Result<()> {
        self.send_line(command)
    }

    fn query(&mut self, query: &str) -> io::Result<String> {
        self.send_line(query)?;
        let mut reply = String::new();
        let read = self.stream()?.read_line(&mut reply);
        match read {
            Ok(0) => {
                self.stream = None;
                Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "analyser closed the connection",
                ))
            }
            Ok(_) => {
                let reply = reply.trim().to_owned();
                debug!("Query '{}' -> '{}'", query, reply);
                Ok(reply)
            }
            Err(e) => {
                self.stream = None;
                Err(e)
            }
        }
    }

    fn reconnect(&mut self) -> io::Result<()> {
        self.open()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{net::TcpListener, thread};

    #[test]
    fn test_socket_address() {
        assert_eq!(
            socket_address("TCPIP0::192.168.2.50::5025::SOCKET").unwrap(),
            "192.168.2.50:5025"
        );
        assert_eq!(socket_address("10.0.0.2:5025").unwrap(), "10.0.0.2:5025");
        assert_eq!(socket_address("10.0.0.2").unwrap(), "10.0.0.2:5025");
        assert!(socket_address("GPIB0::20::INSTR").is_err());
        // VXI-11 is not a raw socket
        assert!(socket_address("TCPIP::fsw.local::INSTR").is_err());
    }

    #[test]
    fn test_resource_kind() {
        assert!(is_socket_resource("10.0.0.2:5025"));
        assert!(is_socket_resource("fsw.local"));
        assert!(is_socket_resource("TCPIP0::192.168.2.50::5025::socket"));
        assert!(!is_socket_resource("TCPIP0::fsw.local::INSTR"));
        assert!(!is_socket_resource("GPIB0::20::INSTR"));
        assert!(!is_socket_resource("USB0::0x0AAD::0x00B9::101234::INSTR"));
    }

    #[cfg(not(feature = "visa"))]
    #[test]
    fn test_visa_resource_needs_feature() {
        let err = open("GPIB0::20::INSTR", Duration::from_millis(100))
            .err()
            .unwrap();
        assert_eq!(err.kind(), io::ErrorKind::Unsupported);
    }

    #[test]
    fn test_open_selects_socket() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let resource = format!("TCPIP0::127.0.0.1::{}::SOCKET", listener.local_addr().unwrap().port());
        let server = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(stream.try_clone().unwrap());
            let mut line = String::new();
            reader.read_line(&mut line).unwrap();
            assert_eq!(line, "*IDN?\n");
            (&stream).write_all(b"Rohde&Schwarz,FSW-43\n").unwrap();
        });
        let mut transport = open(&resource, Duration::from_secs(5)).unwrap();
        assert_eq!(transport.query("*IDN?").unwrap(), "Rohde&Schwarz,FSW-43");
        server.join().unwrap();
    }

    #[test]
    fn test_query_over_socket() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(stream.try_clone().unwrap());
            let mut writer = stream;
            let mut line = String::new();
            reader.read_line(&mut line).unwrap();
            assert_eq!(line, ":SENS:FREQ:CENT 1000000 Hz\n");
            line.clear();
            reader.read_line(&mut line).unwrap();
            assert_eq!(line, ":SENS:FREQ:CENT?\n");
            writer.write_all(b"1000000\n").unwrap();
        });

        let mut transport =
            TcpTransport::connect(&addr.to_string(), Duration::from_secs(5)).unwrap();
        transport.write(":SENS:FREQ:CENT 1000000 Hz").unwrap();
        assert_eq!(transport.query(":SENS:FREQ:CENT?").unwrap(), "1000000");
        server.join().unwrap();
    }
}
