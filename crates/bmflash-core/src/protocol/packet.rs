//! RSP frame encoding and decoding.
//!
//! Everything here is pure: the link layer owns I/O and buffering and uses
//! these functions to build outgoing frames and to carve incoming ones out
//! of its receive cache.
//!
//! Frame format: `$<payload>#<checksum>`, where the checksum is the modulo
//! 256 sum of the payload bytes as they appear on the wire, printed as two
//! lowercase hex digits.

use std::ops::Range;

use super::constants::{
    CONSOLE_TAG, CONSOLE_WIRE_TAG, ESCAPE, ESCAPE_XOR, FRAME_END, FRAME_START, HEX_TAIL_PREFIXES,
};

/// Calculates the RSP checksum for the given data.
pub fn checksum(data: &[u8]) -> u8 {
    data.iter().fold(0, |acc, &x| acc.wrapping_add(x))
}

/// Bytes that may not appear verbatim inside a frame.
pub fn needs_escape(byte: u8) -> bool {
    matches!(byte, FRAME_START | FRAME_END | ESCAPE)
}

/// Escape binary data: every `$`, `#` and `}` becomes `}` followed by the
/// byte XOR 0x20.
pub fn escape(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(escaped_len(data));
    for &b in data {
        if needs_escape(b) {
            out.push(ESCAPE);
            out.push(b ^ ESCAPE_XOR);
        } else {
            out.push(b);
        }
    }
    out
}

/// Length of `data` once escaped.
pub fn escaped_len(data: &[u8]) -> usize {
    data.len() + data.iter().filter(|&&b| needs_escape(b)).count()
}

/// Undo [`escape`]. A dangling escape byte at the end is dropped.
pub fn unescape(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    let mut iter = data.iter();
    while let Some(&b) = iter.next() {
        if b == ESCAPE {
            if let Some(&next) = iter.next() {
                out.push(next ^ ESCAPE_XOR);
            }
        } else {
            out.push(b);
        }
    }
    out
}

/// Length of the verbatim command prefix when the rest of `command` must
/// be hex encoded (`qRcmd,` and `vRun;`).
fn hex_tail_start(command: &[u8]) -> Option<usize> {
    HEX_TAIL_PREFIXES
        .iter()
        .find(|prefix| command.starts_with(prefix))
        .map(|prefix| prefix.len())
}

/// Build the on-wire payload for `command`, without framing.
pub fn encode_payload(command: &[u8]) -> Vec<u8> {
    match hex_tail_start(command) {
        Some(split) => {
            let mut out = command[..split].to_vec();
            out.extend_from_slice(hex::encode(&command[split..]).as_bytes());
            out
        }
        None => escape(command),
    }
}

/// Build a complete frame for `command`.
pub fn encode_frame(command: &[u8]) -> Vec<u8> {
    let payload = encode_payload(command);
    let mut frame = Vec::with_capacity(payload.len() + 4);
    frame.push(FRAME_START);
    frame.extend_from_slice(&payload);
    frame.push(FRAME_END);
    frame.extend_from_slice(format!("{:02x}", checksum(&payload)).as_bytes());
    frame
}

/// Location of a complete frame inside a buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Index of the `$`.
    pub start: usize,
    /// Raw (still escaped) payload bytes.
    pub payload: Range<usize>,
    /// One past the second checksum digit.
    pub end: usize,
    pub checksum_ok: bool,
}

/// Result of scanning a buffer for a frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameScan {
    /// No `$` anywhere; the whole buffer is noise.
    NoStart,
    /// A frame starts at `start` but has not fully arrived.
    Partial { start: usize },
    /// A full frame is available.
    Complete(Frame),
}

/// Find the first frame in `buf`.
///
/// A `$` can never occur inside a payload (it is always escaped), so a
/// second `$` before the terminator means the earlier frame was truncated;
/// scanning restarts at the later one.
pub fn scan_frame(buf: &[u8]) -> FrameScan {
    let Some(mut start) = buf.iter().position(|&b| b == FRAME_START) else {
        return FrameScan::NoStart;
    };

    let hash = match buf[start + 1..].iter().position(|&b| b == FRAME_END) {
        Some(offset) => start + 1 + offset,
        None => {
            if let Some(last) = buf[start + 1..].iter().rposition(|&b| b == FRAME_START) {
                start += 1 + last;
            }
            return FrameScan::Partial { start };
        }
    };

    if let Some(restart) = buf[start + 1..hash].iter().rposition(|&b| b == FRAME_START) {
        start += 1 + restart;
    }

    if buf.len() < hash + 3 {
        return FrameScan::Partial { start };
    }

    let payload = start + 1..hash;
    let checksum_ok =
        parse_hex_byte(&buf[hash + 1..hash + 3]) == Some(checksum(&buf[payload.clone()]));

    FrameScan::Complete(Frame {
        start,
        payload,
        end: hash + 3,
        checksum_ok,
    })
}

fn parse_hex_byte(digits: &[u8]) -> Option<u8> {
    let mut out = [0u8; 1];
    hex::decode_to_slice(digits, &mut out).ok()?;
    Some(out[0])
}

/// True for an `O<hex>` console reply (the `OK` reply is not one).
fn is_console_output(data: &[u8]) -> bool {
    data.len() > 1
        && data[0] == CONSOLE_WIRE_TAG
        && (data.len() - 1) % 2 == 0
        && data[1..].iter().all(|b| b.is_ascii_hexdigit())
}

/// Decode a raw payload: undo escaping, and turn console output into text
/// tagged with a lowercase `o`.
pub fn decode_payload(raw: &[u8]) -> Vec<u8> {
    let data = unescape(raw);
    if is_console_output(&data) {
        if let Ok(text) = hex::decode(&data[1..]) {
            let mut out = Vec::with_capacity(text.len() + 1);
            out.push(CONSOLE_TAG);
            out.extend_from_slice(&text);
            return out;
        }
    }
    data
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn decode_frame(frame: &[u8]) -> Vec<u8> {
        match scan_frame(frame) {
            FrameScan::Complete(f) => {
                assert!(f.checksum_ok);
                decode_payload(&frame[f.payload])
            }
            other => panic!("no frame: {:?}", other),
        }
    }

    #[test]
    fn test_checksum() {
        assert_eq!(checksum(b"OK"), 0x9a);
        assert_eq!(checksum(b""), 0);
        assert_eq!(checksum(&[0xff, 0x02]), 0x01);
    }

    #[test]
    fn test_encode_plain_command() {
        assert_eq!(encode_frame(b"!"), b"$!#21");
        assert_eq!(encode_frame(b"vFlashDone"), b"$vFlashDone#ea");
    }

    #[test]
    fn test_encode_monitor_command_is_hex() {
        // "reset" -> 7265736574
        assert_eq!(encode_payload(b"qRcmd,reset"), b"qRcmd,7265736574");
        assert_eq!(encode_payload(b"vRun;"), b"vRun;");
    }

    #[test]
    fn test_escape_special_bytes() {
        assert_eq!(escape(b"a$b#c}d"), b"a}\x04b}\x03c}]d");
        assert_eq!(escaped_len(b"a$b#c}d"), 10);
        assert_eq!(unescape(b"a}\x04b}\x03c}]d"), b"a$b#c}d");
    }

    #[test]
    fn test_round_trip_with_special_bytes() {
        let payloads: [&[u8]; 4] = [
            b"vFlashWrite:8000000:$#}",
            b"}}}}",
            &[0x00, 0x24, 0x23, 0x7d, 0xff, 0x2a],
            b"",
        ];
        for payload in payloads {
            assert_eq!(decode_frame(&encode_frame(payload)), payload);
        }
    }

    #[test]
    fn test_console_output_is_retagged() {
        // "Hi\n"
        let frame = encode_frame(b"O48690a");
        assert_eq!(decode_frame(&frame), b"oHi\n");
        // "OK" is a status, not console output
        assert_eq!(decode_frame(&encode_frame(b"OK")), b"OK");
    }

    #[test]
    fn test_scan_skips_leading_noise() {
        let buf = b"++garbage$OK#9atail";
        match scan_frame(buf) {
            FrameScan::Complete(f) => {
                assert_eq!(f.start, 9);
                assert_eq!(&buf[f.payload.clone()], b"OK");
                assert_eq!(&buf[f.end..], b"tail");
                assert!(f.checksum_ok);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_scan_partial_and_empty() {
        assert_eq!(scan_frame(b"+++"), FrameScan::NoStart);
        assert_eq!(scan_frame(b"x$O"), FrameScan::Partial { start: 1 });
        // terminator seen but checksum digits missing
        assert_eq!(scan_frame(b"$OK#9"), FrameScan::Partial { start: 0 });
    }

    #[test]
    fn test_scan_restarts_on_truncated_frame() {
        let buf = b"$trunc$OK#9a";
        match scan_frame(buf) {
            FrameScan::Complete(f) => {
                assert_eq!(f.start, 6);
                assert!(f.checksum_ok);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_scan_detects_bad_checksum() {
        match scan_frame(b"$OK#00") {
            FrameScan::Complete(f) => assert!(!f.checksum_ok),
            other => panic!("unexpected {:?}", other),
        }
        match scan_frame(b"$OK#zz") {
            FrameScan::Complete(f) => assert!(!f.checksum_ok),
            other => panic!("unexpected {:?}", other),
        }
    }
}
