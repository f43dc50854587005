//! TCP transport for networked probes.

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

use tracing::{debug, info, instrument};

use super::traits::{ByteTransport, TransportError, TransportKind};

/// Raw TCP stream to the probe's GDB server port.
pub struct TcpTransport {
    stream: Option<TcpStream>,
    peer: SocketAddr,
}

impl TcpTransport {
    /// Connect to `address` (`host:port`). A successful connect is the
    /// liveness check; no handshake is needed on this channel.
    #[instrument(level = "info")]
    pub fn open(address: &str, timeout: Duration) -> Result<Self, TransportError> {
        let open_failed = |message: String| TransportError::OpenFailed {
            target: address.to_string(),
            message,
        };

        let peer = address
            .to_socket_addrs()
            .map_err(|e| open_failed(e.to_string()))?
            .next()
            .ok_or_else(|| open_failed("address did not resolve".into()))?;

        let stream =
            TcpStream::connect_timeout(&peer, timeout).map_err(|e| open_failed(e.to_string()))?;
        stream
            .set_nodelay(true)
            .map_err(|e| open_failed(e.to_string()))?;

        info!(peer = %peer, "TCP connection established");

        Ok(Self {
            stream: Some(stream),
            peer,
        })
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    fn stream(&mut self) -> Result<&mut TcpStream, TransportError> {
        self.stream.as_mut().ok_or(TransportError::Closed)
    }
}

impl ByteTransport for TcpTransport {
    fn send(&mut self, data: &[u8]) -> Result<(), TransportError> {
        let stream = self.stream()?;
        stream
            .write_all(data)
            .map_err(|e| TransportError::WriteFailed(e.to_string()))?;
        stream
            .flush()
            .map_err(|e| TransportError::WriteFailed(e.to_string()))
    }

    fn recv(&mut self, max_len: usize, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        let stream = self.stream()?;
        // A zero read timeout means "block forever" to std, so clamp it.
        stream.set_read_timeout(Some(timeout.max(Duration::from_millis(1))))?;

        let mut buf = vec![0u8; max_len];
        match stream.read(&mut buf) {
            Ok(0) => Err(TransportError::Disconnected),
            Ok(n) => {
                buf.truncate(n);
                Ok(buf)
            }
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::TimedOut =>
            {
                Ok(Vec::new())
            }
            Err(e) => Err(TransportError::ReadFailed(e.to_string())),
        }
    }

    fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(Shutdown::Both);
            debug!(peer = %self.peer, "TCP connection closed");
        }
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Network
    }
}
