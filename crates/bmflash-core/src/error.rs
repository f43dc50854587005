//! Session errors and the status-code taxonomy reported to observers.

use std::fmt;

use thiserror::Error;

use crate::link::LinkError;
use crate::state::SessionState;
use crate::transport::TransportError;

/// Status codes carried by [`crate::events::ProbeEvent::Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// Serial port or socket could not be opened.
    PortAccess,
    /// Nothing answered on the opened port.
    ProbeNotDetected,
    /// The probe stopped answering mid-conversation.
    NoResponse,
    /// Negotiation after opening the port failed.
    ConnectFailed,
    MonitorFailed,
    AttachFailed,
    /// The negotiated packet size cannot carry the request.
    BufferSize,
    /// The target reported no flash regions.
    NoFlash,
    EraseFailed,
    WriteFailed,
    FlashDoneFailed,
    CrcMismatch,
    NotConnected,
    /// Operation called in the wrong session state.
    InvalidState,
    Io,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorCode::PortAccess => "PORT_ACCESS",
            ErrorCode::ProbeNotDetected => "PROBE_NOT_DETECTED",
            ErrorCode::NoResponse => "NO_RESPONSE",
            ErrorCode::ConnectFailed => "CONNECT_FAILED",
            ErrorCode::MonitorFailed => "MONITOR_FAILED",
            ErrorCode::AttachFailed => "ATTACH_FAILED",
            ErrorCode::BufferSize => "BUFFER_SIZE",
            ErrorCode::NoFlash => "NO_FLASH",
            ErrorCode::EraseFailed => "ERASE_FAILED",
            ErrorCode::WriteFailed => "WRITE_FAILED",
            ErrorCode::FlashDoneFailed => "FLASH_DONE_FAILED",
            ErrorCode::CrcMismatch => "CRC_MISMATCH",
            ErrorCode::NotConnected => "NOT_CONNECTED",
            ErrorCode::InvalidState => "INVALID_STATE",
            ErrorCode::Io => "IO",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("{operation} requires state {required}, session is {actual}")]
    InvalidState {
        operation: &'static str,
        required: SessionState,
        actual: SessionState,
    },

    #[error("Cannot open {target}: {message}")]
    PortAccess { target: String, message: String },

    #[error("No probe detected on {0}")]
    ProbeNotDetected(String),

    #[error("No response to {command}")]
    NoResponse { command: String },

    #[error("Connect failed: {0}")]
    ConnectFailed(String),

    #[error("Monitor command '{command}' failed")]
    MonitorFailed { command: String },

    #[error("Attach failed: {0}")]
    AttachFailed(String),

    #[error("Packet size {packet_size} too small for {purpose}")]
    BufferSize { packet_size: usize, purpose: &'static str },

    #[error("Target has no flash regions")]
    NoFlash,

    #[error("Erase failed at 0x{address:08x} (length 0x{length:x})")]
    EraseFailed { address: u32, length: u32 },

    #[error("Write failed at 0x{address:08x}")]
    WriteFailed { address: u32 },

    #[error("Flash programming did not complete for region 0x{address:08x}")]
    FlashDoneFailed { address: u32 },

    #[error("Read failed at 0x{address:08x}")]
    ReadFailed { address: u32 },

    #[error("Flash is blank, nothing to dump")]
    DumpBlank,

    #[error("Unexpected reply to {command}: {reply}")]
    UnexpectedReply { command: String, reply: String },

    #[error("Link error: {0}")]
    Link(#[from] LinkError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SessionError {
    /// The status code reported for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            SessionError::InvalidState { .. } => ErrorCode::InvalidState,
            SessionError::PortAccess { .. } => ErrorCode::PortAccess,
            SessionError::ProbeNotDetected(_) => ErrorCode::ProbeNotDetected,
            SessionError::NoResponse { .. } => ErrorCode::NoResponse,
            SessionError::ConnectFailed(_) => ErrorCode::ConnectFailed,
            SessionError::MonitorFailed { .. } => ErrorCode::MonitorFailed,
            SessionError::AttachFailed(_) => ErrorCode::AttachFailed,
            SessionError::BufferSize { .. } => ErrorCode::BufferSize,
            SessionError::NoFlash | SessionError::DumpBlank => ErrorCode::NoFlash,
            SessionError::EraseFailed { .. } => ErrorCode::EraseFailed,
            SessionError::WriteFailed { .. } => ErrorCode::WriteFailed,
            SessionError::FlashDoneFailed { .. } => ErrorCode::FlashDoneFailed,
            SessionError::ReadFailed { .. } | SessionError::UnexpectedReply { .. } => ErrorCode::Io,
            SessionError::Link(LinkError::NotConnected) => ErrorCode::NotConnected,
            SessionError::Link(LinkError::NoAck { .. }) => ErrorCode::NoResponse,
            SessionError::Link(LinkError::Transport(_)) => ErrorCode::Io,
            SessionError::Io(_) => ErrorCode::Io,
        }
    }
}

impl From<TransportError> for SessionError {
    fn from(err: TransportError) -> Self {
        SessionError::Link(err.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes() {
        assert_eq!(SessionError::NoFlash.code(), ErrorCode::NoFlash);
        assert_eq!(
            SessionError::Link(LinkError::NotConnected).code(),
            ErrorCode::NotConnected
        );
        assert_eq!(
            SessionError::from(TransportError::Disconnected).code(),
            ErrorCode::NotConnected
        );
        assert_eq!(
            SessionError::from(LinkError::NoAck { attempts: 3 }).code(),
            ErrorCode::NoResponse
        );
    }

    #[test]
    fn test_invalid_state_message() {
        let err = SessionError::InvalidState {
            operation: "attach",
            required: SessionState::Connected,
            actual: SessionState::Disconnected,
        };
        assert_eq!(
            err.to_string(),
            "attach requires state Connected, session is Disconnected"
        );
    }
}
