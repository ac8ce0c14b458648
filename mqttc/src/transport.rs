//! Transport layer abstraction for MQTT connections.
//!
//! The session only needs an ordered, reliable byte stream. [`Transport`]
//! describes that stream; [`TcpTransport`] provides it over plain TCP.
//! Secured streams can be supplied by implementing the trait elsewhere.

use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::thread;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use tracing::{debug, trace};

use crate::error::{Error, Result};

/// Ordered, reliable byte stream used by a session.
///
/// All methods are synchronous. `receive_available` must never block.
pub trait Transport: Send {
    /// Open the stream, giving up after `timeout`.
    fn open(&mut self, host: &str, port: u16, timeout: Duration) -> io::Result<()>;

    /// Send all of `data`, returning the number of bytes written.
    fn send(&mut self, data: &[u8]) -> io::Result<usize>;

    /// Return whatever bytes are pending without blocking.
    ///
    /// An empty buffer means nothing has arrived. A closed peer is reported
    /// as `io::ErrorKind::UnexpectedEof`.
    fn receive_available(&mut self) -> io::Result<Bytes>;

    /// Close the stream. Safe to call more than once.
    fn close(&mut self);
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn open(&mut self, host: &str, port: u16, timeout: Duration) -> io::Result<()> {
        (**self).open(host, port, timeout)
    }

    fn send(&mut self, data: &[u8]) -> io::Result<usize> {
        (**self).send(data)
    }

    fn receive_available(&mut self) -> io::Result<Bytes> {
        (**self).receive_available()
    }

    fn close(&mut self) {
        (**self).close()
    }
}

/// Transport type enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportType {
    /// Plain TCP connection.
    Tcp,
}

impl TransportType {
    /// Parse transport type from URL scheme.
    pub fn from_scheme(scheme: &str) -> Option<Self> {
        match scheme.to_lowercase().as_str() {
            "tcp" | "mqtt" | "" => Some(TransportType::Tcp),
            _ => None,
        }
    }

    /// Get default port for this transport type.
    pub fn default_port(&self) -> u16 {
        match self {
            TransportType::Tcp => 1883,
        }
    }
}

/// Broker address split into its parts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Address {
    pub transport: TransportType,
    pub host: String,
    pub port: u16,
}

/// Parse `[scheme://]host[:port]`.
///
/// `default_port` is used when the address carries no port. IPv6 hosts must
/// be bracketed (`[::1]:1883`).
pub fn parse_address(addr: &str, default_port: Option<u16>) -> Result<Address> {
    let invalid = |reason: &str| Error::InvalidConfig(format!("{}: {:?}", reason, addr));

    let (scheme, rest) = match addr.split_once("://") {
        Some((scheme, rest)) => (scheme, rest),
        None => ("", addr),
    };
    let transport = TransportType::from_scheme(scheme).ok_or_else(|| invalid("unsupported scheme"))?;
    let rest = rest.trim_end_matches('/');

    let (host, port) = if let Some(bracketed) = rest.strip_prefix('[') {
        let (host, tail) = bracketed.split_once(']').ok_or_else(|| invalid("unterminated ipv6 host"))?;
        match tail.strip_prefix(':') {
            Some(port) => (host, Some(port)),
            None if tail.is_empty() => (host, None),
            None => return Err(invalid("unexpected characters after host")),
        }
    } else {
        match rest.rsplit_once(':') {
            Some((host, _)) if host.contains(':') => return Err(invalid("ipv6 host must be bracketed")),
            Some((host, port)) => (host, Some(port)),
            None => (rest, None),
        }
    };

    if host.is_empty() {
        return Err(invalid("missing host"));
    }

    let port = match port {
        Some(p) => p.parse::<u16>().map_err(|_| invalid("invalid port"))?,
        None => default_port.unwrap_or_else(|| transport.default_port()),
    };

    Ok(Address { transport, host: host.to_string(), port })
}

/// Size of a single non-blocking read.
const READ_CHUNK: usize = 4096;

/// Plain TCP transport over a non-blocking `std::net::TcpStream`.
#[derive(Debug)]
pub struct TcpTransport {
    stream: Option<TcpStream>,
    write_timeout: Duration,
}

impl TcpTransport {
    /// Create an unopened transport.
    pub fn new() -> Self {
        Self {
            stream: None,
            write_timeout: Duration::from_secs(10),
        }
    }

    /// Upper bound on how long `send` waits for a full socket buffer to drain.
    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    /// Whether a stream is currently open.
    pub fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    fn stream(&mut self) -> io::Result<&mut TcpStream> {
        self.stream
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "transport not open"))
    }
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for TcpTransport {
    fn open(&mut self, host: &str, port: u16, timeout: Duration) -> io::Result<()> {
        self.close();

        let mut last_err = None;
        for addr in (host, port).to_socket_addrs()? {
            debug!("Opening TCP connection to {}", addr);
            match TcpStream::connect_timeout(&addr, timeout) {
                Ok(stream) => {
                    stream.set_nodelay(true)?;
                    stream.set_nonblocking(true)?;
                    self.stream = Some(stream);
                    return Ok(());
                }
                Err(e) => last_err = Some(e),
            }
        }

        Err(last_err.unwrap_or_else(|| {
            io::Error::new(io::ErrorKind::AddrNotAvailable, format!("no address for {}:{}", host, port))
        }))
    }

    fn send(&mut self, data: &[u8]) -> io::Result<usize> {
        let deadline = Instant::now() + self.write_timeout;
        let stream = self.stream()?;

        let mut written = 0;
        while written < data.len() {
            match stream.write(&data[written..]) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => written += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if Instant::now() >= deadline {
                        return Err(io::Error::new(io::ErrorKind::TimedOut, "send timed out"));
                    }
                    thread::sleep(Duration::from_millis(1));
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }

        trace!("Sent {} bytes", written);
        Ok(written)
    }

    fn receive_available(&mut self) -> io::Result<Bytes> {
        let stream = self.stream()?;
        let mut buf = BytesMut::new();
        let mut chunk = [0u8; READ_CHUNK];

        loop {
            match stream.read(&mut chunk) {
                // Report EOF only once buffered data has been handed out.
                Ok(0) if buf.is_empty() => return Err(io::ErrorKind::UnexpectedEof.into()),
                Ok(0) => break,
                Ok(n) => buf.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }

        Ok(buf.freeze())
    }

    fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            debug!("Closing TCP connection");
            let _ = stream.shutdown(Shutdown::Both);
        }
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn test_transport_type() {
        assert_eq!(TransportType::from_scheme("mqtt"), Some(TransportType::Tcp));
        assert_eq!(TransportType::from_scheme("TCP"), Some(TransportType::Tcp));
        assert_eq!(TransportType::from_scheme(""), Some(TransportType::Tcp));
        assert_eq!(TransportType::from_scheme("mqtts"), None);
        assert_eq!(TransportType::Tcp.default_port(), 1883);
    }

    #[test]
    fn test_parse_address() {
        let addr = parse_address("mqtt://broker.local:1884", None).unwrap();
        assert_eq!(addr.host, "broker.local");
        assert_eq!(addr.port, 1884);

        let addr = parse_address("broker.local", None).unwrap();
        assert_eq!(addr.port, 1883);

        let addr = parse_address("broker.local", Some(2883)).unwrap();
        assert_eq!(addr.port, 2883);

        let addr = parse_address("tcp://[::1]:1885/", None).unwrap();
        assert_eq!(addr.host, "::1");
        assert_eq!(addr.port, 1885);

        assert!(parse_address("", None).is_err());
        assert!(parse_address("mqtts://host", None).is_err());
        assert!(parse_address("host:notaport", None).is_err());
        assert!(parse_address("[::1", None).is_err());
        assert!(parse_address("::1", None).is_err());
        assert!(parse_address("mqtt://fe80::1:1883", None).is_err());
    }

    #[test]
    fn test_tcp_transport_roundtrip() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();
            let mut buf = [0u8; 5];
            sock.read_exact(&mut buf).unwrap();
            sock.write_all(b"world").unwrap();
            buf
        });

        let mut transport = TcpTransport::new();
        assert!(transport.receive_available().is_err());

        transport.open("127.0.0.1", port, Duration::from_secs(2)).unwrap();
        assert_eq!(transport.send(b"hello").unwrap(), 5);
        assert_eq!(&server.join().unwrap(), b"hello");

        let mut received = BytesMut::new();
        let deadline = Instant::now() + Duration::from_secs(2);
        while received.len() < 5 && Instant::now() < deadline {
            match transport.receive_available() {
                Ok(bytes) => received.extend_from_slice(&bytes),
                // server already closed after writing
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) => panic!("receive failed: {}", e),
            }
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(&received[..], b"world");

        transport.close();
        transport.close();
        assert!(!transport.is_open());
        assert!(transport.send(b"x").is_err());
    }

    #[test]
    fn test_tcp_transport_peer_closed() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = thread::spawn(move || drop(listener.accept().unwrap()));

        let mut transport = TcpTransport::new();
        transport.open("127.0.0.1", port, Duration::from_secs(2)).unwrap();
        server.join().unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            match transport.receive_available() {
                Ok(bytes) if bytes.is_empty() && Instant::now() < deadline => {
                    thread::sleep(Duration::from_millis(5));
                }
                Ok(bytes) => panic!("unexpected data or timeout: {:?}", bytes),
                Err(e) => {
                    assert_eq!(e.kind(), io::ErrorKind::UnexpectedEof);
                    break;
                }
            }
        }
    }
}
