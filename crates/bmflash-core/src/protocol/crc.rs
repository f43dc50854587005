//! CRC32 as computed by the `qCRC` packet.
//!
//! GDB uses the MSB-first CRC-32 (polynomial 0x04C11DB7) seeded with
//! 0xFFFFFFFF and without a final XOR, i.e. CRC-32/MPEG-2. This is not the
//! zlib/IEEE variant.

use crc::{CRC_32_MPEG_2, Crc};

const GDB_CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_MPEG_2);

/// CRC of `data` in the form the probe reports for `qCRC:<addr>,<len>`.
pub fn crc32(data: &[u8]) -> u32 {
    GDB_CRC32.checksum(data)
}

/// Parse a `C<hex>` reply.
pub fn parse_crc_reply(payload: &[u8]) -> Option<u32> {
    let digits = payload.strip_prefix(b"C")?;
    let text = std::str::from_utf8(digits).ok()?;
    u32::from_str_radix(text, 16).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_value() {
        assert_eq!(crc32(b"123456789"), 0x0376_E6E7);
    }

    #[test]
    fn test_empty_is_seed() {
        assert_eq!(crc32(&[]), 0xFFFF_FFFF);
    }

    #[test]
    fn test_parse_crc_reply() {
        assert_eq!(parse_crc_reply(b"C376e6e7"), Some(0x0376_E6E7));
        assert_eq!(parse_crc_reply(b"E01"), None);
        assert_eq!(parse_crc_reply(b"Cxyz"), None);
    }
}
