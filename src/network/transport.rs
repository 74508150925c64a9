//! Non-blocking socket plumbing
//!
//! The network loop never waits on a single peer: reads take what is
//! available right now, and writes either retry a bounded number of times
//! or, for audio fan-out, take only what the socket accepts at once.

use socket2::{Domain, Protocol, Socket, Type};
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::thread;
use std::time::Duration;

/// Attempts before a would-block write is abandoned
const WRITE_RETRIES: u32 = 10;

/// Pause between would-block write attempts
const WRITE_RETRY_DELAY: Duration = Duration::from_millis(1);

/// One peer connection as seen by the network loop
pub trait Transport: Send {
    /// False once the peer has gone away
    fn is_connected(&mut self) -> bool;

    /// Read whatever is available without blocking
    ///
    /// `Ok(0)` means nothing is available right now.
    fn read_available(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write `data`, returning how many bytes went out
    fn write_bytes(&mut self, data: &[u8]) -> usize;

    /// Write what the peer accepts right now without waiting
    fn write_available(&mut self, data: &[u8]) -> usize;

    /// Shut the connection down
    fn close(&mut self);

    /// Human-readable peer address
    fn peer(&self) -> String;
}

/// Non-blocking TCP stream
pub struct TcpTransport {
    stream: TcpStream,
    peer: String,
    connected: bool,
}

impl TcpTransport {
    pub fn new(stream: TcpStream) -> io::Result<Self> {
        stream.set_nonblocking(true)?;
        stream.set_nodelay(true)?;
        let peer = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        Ok(Self {
            stream,
            peer,
            connected: true,
        })
    }
}

impl Transport for TcpTransport {
    fn is_connected(&mut self) -> bool {
        if !self.connected {
            return false;
        }
        let mut peeked = [0u8; 1];
        match self.stream.peek(&mut peeked) {
            Ok(0) => self.connected = false,
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(_) => self.connected = false,
        }
        self.connected
    }

    fn read_available(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.stream.read(buf) {
            Ok(0) if !buf.is_empty() => {
                self.connected = false;
                Ok(0)
            }
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(0),
            Err(e) => {
                self.connected = false;
                Err(e)
            }
        }
    }

    fn write_bytes(&mut self, mut data: &[u8]) -> usize {
        let total = data.len();
        let mut retries = WRITE_RETRIES;
        while !data.is_empty() && self.connected {
            match self.stream.write(data) {
                Ok(0) => {
                    self.connected = false;
                }
                Ok(n) => {
                    data = &data[n..];
                    retries = WRITE_RETRIES;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if retries == 0 {
                        break;
                    }
                    retries -= 1;
                    thread::sleep(WRITE_RETRY_DELAY);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    tracing::debug!("Write to {} failed: {}", self.peer, e);
                    self.connected = false;
                }
            }
        }
        total - data.len()
    }

    fn write_available(&mut self, mut data: &[u8]) -> usize {
        let total = data.len();
        while !data.is_empty() && self.connected {
            match self.stream.write(data) {
                Ok(0) => self.connected = false,
                Ok(n) => data = &data[n..],
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    tracing::debug!("Write to {} failed: {}", self.peer, e);
                    self.connected = false;
                }
            }
        }
        total - data.len()
    }

    fn close(&mut self) {
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
        self.connected = false;
    }

    fn peer(&self) -> String {
        self.peer.clone()
    }
}

/// Source of newly accepted connections
pub trait Acceptor: Send {
    /// Next pending connection, if any
    fn accept_pending(&mut self) -> Option<Box<dyn Transport>>;
}

/// Non-blocking TCP listener
pub struct TcpAcceptor {
    listener: TcpListener,
}

impl TcpAcceptor {
    /// Bind `addr` with address reuse and a backlog of `backlog`
    pub fn bind(addr: SocketAddr, backlog: usize) -> io::Result<Self> {
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        socket.bind(&addr.into())?;
        socket.listen(backlog.min(i32::MAX as usize) as i32)?;
        socket.set_nonblocking(true)?;
        Ok(Self {
            listener: socket.into(),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }
}

impl Acceptor for TcpAcceptor {
    fn accept_pending(&mut self) -> Option<Box<dyn Transport>> {
        loop {
            match self.listener.accept() {
                Ok((stream, addr)) => match TcpTransport::new(stream) {
                    Ok(transport) => return Some(Box::new(transport)),
                    Err(e) => {
                        tracing::warn!("Failed to configure connection from {}: {}", addr, e);
                    }
                },
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return None,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    tracing::warn!("Accept failed: {}", e);
                    return None;
                }
            }
        }
    }
}

/// Opens outbound connections (used by the Icecast clients)
///
/// Shared with helper threads, so connecting takes `&self`.
pub trait Connector: Send + Sync {
    fn connect(&self, host: &str, port: u16) -> io::Result<Box<dyn Transport>>;
}

/// TCP connector with a connect timeout
pub struct TcpConnector {
    timeout: Duration,
}

impl TcpConnector {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for TcpConnector {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

impl Connector for TcpConnector {
    fn connect(&self, host: &str, port: u16) -> io::Result<Box<dyn Transport>> {
        let mut last_error = io::Error::new(io::ErrorKind::NotFound, format!("no address for {}", host));
        for addr in (host, port).to_socket_addrs()? {
            match TcpStream::connect_timeout(&addr, self.timeout) {
                Ok(stream) => return Ok(Box::new(TcpTransport::new(stream)?)),
                Err(e) => last_error = e,
            }
        }
        Err(last_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn test_tcp_accept_read_write() {
        let mut acceptor = TcpAcceptor::bind("127.0.0.1:0".parse().unwrap(), 4).unwrap();
        let addr = acceptor.local_addr().unwrap();
        assert!(acceptor.accept_pending().is_none());

        let mut client = TcpStream::connect(addr).unwrap();
        let deadline = Instant::now() + Duration::from_secs(2);
        let mut server = loop {
            if let Some(t) = acceptor.accept_pending() {
                break t;
            }
            assert!(Instant::now() < deadline);
            thread::sleep(Duration::from_millis(5));
        };

        let mut buf = [0u8; 16];
        assert_eq!(server.read_available(&mut buf).unwrap(), 0);
        assert!(server.is_connected());

        client.write_all(b"ping").unwrap();
        let mut got = 0;
        while got == 0 && Instant::now() < deadline {
            got = server.read_available(&mut buf).unwrap();
        }
        assert_eq!(&buf[..got], b"ping");

        assert_eq!(server.write_bytes(b"pong"), 4);
        assert_eq!(server.write_available(b"!"), 1);
        let mut reply = [0u8; 5];
        client.read_exact(&mut reply).unwrap();
        assert_eq!(&reply, b"pong!");

        drop(client);
        while server.is_connected() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(!server.is_connected());
    }
}
