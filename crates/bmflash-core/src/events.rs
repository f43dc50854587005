//! Event system for UI decoupling.
//!
//! Allows CLI/GUI front-ends to follow connect, attach and flash progress
//! without tight coupling to the core logic.

use std::fmt;

use crate::error::ErrorCode;
use crate::state::SessionState;
use crate::transport::TransportKind;

/// Log level for events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

/// Long-running operations that report progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashOperation {
    Erase,
    Write,
    Verify,
    BlankCheck,
    Dump,
}

impl fmt::Display for FlashOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlashOperation::Erase => write!(f, "Erase"),
            FlashOperation::Write => write!(f, "Write"),
            FlashOperation::Verify => write!(f, "Verify"),
            FlashOperation::BlankCheck => write!(f, "Blank check"),
            FlashOperation::Dump => write!(f, "Dump"),
        }
    }
}

/// Events emitted by a probe session.
#[derive(Debug, Clone)]
pub enum ProbeEvent {
    /// Link to the probe established and negotiated.
    Connected {
        kind: TransportKind,
        packet_size: usize,
    },
    /// Link closed.
    Disconnected,
    /// Session state changed.
    StateChanged {
        from: SessionState,
        to: SessionState,
    },
    /// Target found by the scan.
    TargetDetected {
        family: String,
        architecture: Option<String>,
    },
    /// Progress update for the current flash operation.
    Progress {
        operation: FlashOperation,
        current: u64,
        total: u64,
    },
    /// A line of console output from the probe or target.
    Console { text: String },
    /// User-visible notice.
    Log { level: LogLevel, message: String },
    /// Coded failure. Delivered before the failing call returns.
    Error { code: ErrorCode, message: String },
    /// Raw bytes sent/received.
    Packet {
        direction: PacketDirection,
        length: usize,
        data: Option<Vec<u8>>,
    },
}

/// Packet direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketDirection {
    Tx, // Host -> Probe
    Rx, // Probe -> Host
}

impl fmt::Display for PacketDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PacketDirection::Tx => write!(f, "TX"),
            PacketDirection::Rx => write!(f, "RX"),
        }
    }
}

/// Observer trait for receiving probe events.
///
/// Implement this trait in your UI layer to receive updates.
pub trait ProbeObserver: Send + Sync {
    /// Called when an event occurs.
    fn on_event(&self, event: &ProbeEvent);
}

/// No-op observer that discards all events.
pub struct NullObserver;

impl ProbeObserver for NullObserver {
    fn on_event(&self, _event: &ProbeEvent) {}
}

/// Observer that logs events using tracing.
pub struct TracingObserver;

impl ProbeObserver for TracingObserver {
    fn on_event(&self, event: &ProbeEvent) {
        match event {
            ProbeEvent::Connected { kind, packet_size } => {
                tracing::info!(kind = %kind, packet_size = packet_size, "Probe connected");
            }
            ProbeEvent::Disconnected => {
                tracing::info!("Probe disconnected");
            }
            ProbeEvent::StateChanged { from, to } => {
                tracing::debug!(from = %from, to = %to, "State changed");
            }
            ProbeEvent::TargetDetected {
                family,
                architecture,
            } => {
                tracing::info!(
                    family = %family,
                    arch = architecture.as_deref().unwrap_or("-"),
                    "Target detected"
                );
            }
            ProbeEvent::Progress {
                operation,
                current,
                total,
            } => {
                let pct = if *total > 0 {
                    (*current * 100) / *total
                } else {
                    0
                };
                tracing::debug!(
                    operation = %operation,
                    progress = %format!("{}%", pct),
                    "Progress"
                );
            }
            ProbeEvent::Console { text } => {
                tracing::info!(target: "bmflash::console", "{}", text);
            }
            ProbeEvent::Log { level, message } => match level {
                LogLevel::Trace => tracing::trace!("{}", message),
                LogLevel::Debug => tracing::debug!("{}", message),
                LogLevel::Info => tracing::info!("{}", message),
                LogLevel::Warn => tracing::warn!("{}", message),
                LogLevel::Error => tracing::error!("{}", message),
            },
            ProbeEvent::Error { code, message } => {
                tracing::error!(code = %code, "Error: {}", message);
            }
            ProbeEvent::Packet {
                direction, length, ..
            } => {
                tracing::trace!(dir = %direction, len = length, "Packet");
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Mutex;

    use super::*;

    /// Observer that keeps every event for later assertions.
    #[derive(Default)]
    pub struct RecordingObserver {
        events: Mutex<Vec<ProbeEvent>>,
    }

    impl RecordingObserver {
        pub fn events(&self) -> Vec<ProbeEvent> {
            self.events.lock().unwrap().clone()
        }

        pub fn error_codes(&self) -> Vec<ErrorCode> {
            self.events()
                .into_iter()
                .filter_map(|e| match e {
                    ProbeEvent::Error { code, .. } => Some(code),
                    _ => None,
                })
                .collect()
        }
    }

    impl ProbeObserver for RecordingObserver {
        fn on_event(&self, event: &ProbeEvent) {
            self.events.lock().unwrap().push(event.clone());
        }
    }
}
