//! Byte transport abstraction.
//!
//! Defines the `ByteTransport` trait for the duplex channel to the probe,
//! allowing different implementations (serial, TCP, mock).

use std::fmt;
use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Failed to open {target}: {message}")]
    OpenFailed { target: String, message: String },

    #[error("Failed to configure {target}: {message}")]
    ConfigureFailed { target: String, message: String },

    #[error("Write failed: {0}")]
    WriteFailed(String),

    #[error("Read failed: {0}")]
    ReadFailed(String),

    #[error("Transport closed")]
    Closed,

    #[error("Peer disconnected")]
    Disconnected,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Physical kind of the channel to the probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// Virtual or real serial line (local USB probe).
    Serial,
    /// Raw TCP stream (wireless / networked probe).
    Network,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Serial => write!(f, "serial"),
            TransportKind::Network => write!(f, "network"),
        }
    }
}

/// Abstract duplex byte channel.
///
/// `recv` never blocks for longer than `timeout`; an expired timeout yields
/// an empty buffer rather than an error.
pub trait ByteTransport: Send {
    /// Transmit all of `data`.
    fn send(&mut self, data: &[u8]) -> Result<(), TransportError>;

    /// Receive up to `max_len` bytes, waiting at most `timeout`.
    fn recv(&mut self, max_len: usize, timeout: Duration) -> Result<Vec<u8>, TransportError>;

    /// Check if the channel is still usable.
    fn is_open(&self) -> bool;

    /// Release the underlying handle. Further I/O fails with `Closed`.
    fn close(&mut self);

    fn kind(&self) -> TransportKind;

    /// Drive the DTR line. Only meaningful on serial lines.
    fn set_dtr(&mut self, _level: bool) -> Result<(), TransportError> {
        Ok(())
    }
}

impl ByteTransport for Box<dyn ByteTransport> {
    fn send(&mut self, data: &[u8]) -> Result<(), TransportError> {
        (**self).send(data)
    }

    fn recv(&mut self, max_len: usize, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        (**self).recv(max_len, timeout)
    }

    fn is_open(&self) -> bool {
        (**self).is_open()
    }

    fn close(&mut self) {
        (**self).close()
    }

    fn kind(&self) -> TransportKind {
        (**self).kind()
    }

    fn set_dtr(&mut self, level: bool) -> Result<(), TransportError> {
        (**self).set_dtr(level)
    }
}
