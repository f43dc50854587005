//! Session state machine.

use std::fmt;

use crate::error::SessionError;

/// Connection state of a probe session.
///
/// Ordered: an operation that needs `Connected` also works when
/// `Attached`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum SessionState {
    /// No transport open.
    #[default]
    Disconnected,
    /// Link to the probe negotiated, no target attached.
    Connected,
    /// Attached to a target; flash regions known.
    Attached,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Disconnected => write!(f, "Disconnected"),
            SessionState::Connected => write!(f, "Connected"),
            SessionState::Attached => write!(f, "Attached"),
        }
    }
}

impl SessionState {
    /// Fail with `InvalidState` unless this state is at least `required`.
    pub fn require(
        self,
        required: SessionState,
        operation: &'static str,
    ) -> Result<(), SessionError> {
        if self >= required {
            Ok(())
        } else {
            Err(SessionError::InvalidState {
                operation,
                required,
                actual: self,
            })
        }
    }

    pub fn is_connected(&self) -> bool {
        *self >= SessionState::Connected
    }

    pub fn is_attached(&self) -> bool {
        matches!(self, SessionState::Attached)
    }
}
