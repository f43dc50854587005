//! Reply classification.
//!
//! Probe replies are short ASCII strings whose first byte says what they
//! are. This module provides type-safe classification of decoded payloads.

use std::fmt;

use super::constants::CONSOLE_TAG;

/// A decoded reply from the probe.
#[derive(Clone, PartialEq, Eq)]
pub enum Reply {
    /// `OK`
    Ok,
    /// `E<hh>`
    Error(u8),
    /// Console output (already hex-decoded by the link).
    Console(String),
    /// `S<hh>` or `T<hh>...` stop reply, carrying the signal number.
    Stop(u8),
    /// Empty payload: the command is not supported.
    Empty,
    /// Anything else.
    Data(Vec<u8>),
}

impl Reply {
    /// Classify a decoded payload.
    pub fn from_payload(payload: &[u8]) -> Self {
        match payload {
            [] => Reply::Empty,
            b"OK" => Reply::Ok,
            [CONSOLE_TAG, text @ ..] => Reply::Console(String::from_utf8_lossy(text).into_owned()),
            [b'E', a, b] => match parse_hex_pair(*a, *b) {
                Some(code) => Reply::Error(code),
                None => Reply::Data(payload.to_vec()),
            },
            [b'S' | b'T', a, b, ..] => match parse_hex_pair(*a, *b) {
                Some(signal) => Reply::Stop(signal),
                None => Reply::Data(payload.to_vec()),
            },
            _ => Reply::Data(payload.to_vec()),
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Reply::Ok)
    }

    pub fn is_console(&self) -> bool {
        matches!(self, Reply::Console(_))
    }

    /// Payload bytes of a `Data` reply.
    pub fn data(&self) -> Option<&[u8]> {
        match self {
            Reply::Data(bytes) => Some(bytes),
            _ => None,
        }
    }
}

fn parse_hex_pair(a: u8, b: u8) -> Option<u8> {
    let hi = (a as char).to_digit(16)?;
    let lo = (b as char).to_digit(16)?;
    Some((hi << 4 | lo) as u8)
}

impl fmt::Debug for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reply::Ok => write!(f, "OK"),
            Reply::Error(code) => write!(f, "E{:02X}", code),
            Reply::Console(text) => write!(f, "Console({:?})", text),
            Reply::Stop(signal) => write!(f, "Stop({})", signal),
            Reply::Empty => write!(f, "Empty"),
            Reply::Data(bytes) => write!(f, "Data({:?})", String::from_utf8_lossy(bytes)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_status_replies() {
        assert_eq!(Reply::from_payload(b"OK"), Reply::Ok);
        assert_eq!(Reply::from_payload(b"E01"), Reply::Error(1));
        assert_eq!(Reply::from_payload(b""), Reply::Empty);
    }

    #[test]
    fn test_classify_stop_replies() {
        assert_eq!(Reply::from_payload(b"S05"), Reply::Stop(5));
        assert_eq!(Reply::from_payload(b"T0b"), Reply::Stop(11));
        assert_eq!(Reply::from_payload(b"T05thread:01;"), Reply::Stop(5));
    }

    #[test]
    fn test_classify_console_and_data() {
        assert_eq!(
            Reply::from_payload(b"oTarget voltage: 3.3V\n"),
            Reply::Console("Target voltage: 3.3V\n".into())
        );
        assert_eq!(
            Reply::from_payload(b"C1234abcd"),
            Reply::Data(b"C1234abcd".to_vec())
        );
        // Not a valid error code
        assert_eq!(Reply::from_payload(b"Exy"), Reply::Data(b"Exy".to_vec()));
    }
}
