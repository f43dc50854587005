//! serialport-based transport for locally attached probes.

use std::io::{self, Read, Write};
use std::time::Duration;

use serialport::{DataBits, FlowControl, Parity, SerialPort, StopBits};
use tracing::{debug, info, instrument};

use super::traits::{ByteTransport, TransportError, TransportKind};

/// Serial line to the probe's GDB server interface.
pub struct SerialTransport {
    port: Option<Box<dyn SerialPort>>,
    name: String,
}

impl SerialTransport {
    /// Open `name` at `baud_rate` (8N1, no flow control) and assert RTS/DTR.
    ///
    /// The probe is a USB CDC device, so the baud rate only has to be valid,
    /// it does not affect throughput.
    #[instrument(level = "info")]
    pub fn open(name: &str, baud_rate: u32) -> Result<Self, TransportError> {
        let mut port = serialport::new(name, baud_rate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(Duration::from_millis(50))
            .open()
            .map_err(|e| TransportError::OpenFailed {
                target: name.to_string(),
                message: e.to_string(),
            })?;

        let configure = |e: serialport::Error| TransportError::ConfigureFailed {
            target: name.to_string(),
            message: e.to_string(),
        };
        port.write_request_to_send(true).map_err(configure)?;
        port.write_data_terminal_ready(true).map_err(configure)?;

        info!(port = %name, baud = baud_rate, "Serial port opened");

        Ok(Self {
            port: Some(port),
            name: name.to_string(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn port(&mut self) -> Result<&mut Box<dyn SerialPort>, TransportError> {
        self.port.as_mut().ok_or(TransportError::Closed)
    }
}

impl ByteTransport for SerialTransport {
    fn send(&mut self, data: &[u8]) -> Result<(), TransportError> {
        let port = self.port()?;
        port.write_all(data)
            .map_err(|e| TransportError::WriteFailed(e.to_string()))?;
        port.flush()
            .map_err(|e| TransportError::WriteFailed(e.to_string()))?;
        Ok(())
    }

    fn recv(&mut self, max_len: usize, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        let port = self.port()?;
        port.set_timeout(timeout.max(Duration::from_millis(1)))
            .map_err(|e| TransportError::ReadFailed(e.to_string()))?;

        let mut buf = vec![0u8; max_len];
        match port.read(&mut buf) {
            Ok(n) => {
                buf.truncate(n);
                Ok(buf)
            }
            Err(e)
                if e.kind() == io::ErrorKind::TimedOut || e.kind() == io::ErrorKind::WouldBlock =>
            {
                Ok(Vec::new())
            }
            Err(e) => Err(TransportError::ReadFailed(e.to_string())),
        }
    }

    fn is_open(&self) -> bool {
        self.port.is_some()
    }

    fn close(&mut self) {
        if self.port.take().is_some() {
            debug!(port = %self.name, "Serial port closed");
        }
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Serial
    }

    fn set_dtr(&mut self, level: bool) -> Result<(), TransportError> {
        let name = self.name.clone();
        self.port()?
            .write_data_terminal_ready(level)
            .map_err(|e| TransportError::ConfigureFailed {
                target: name,
                message: e.to_string(),
            })
    }
}
