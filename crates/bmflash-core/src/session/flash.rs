//! Flash pipeline: download, verify, erase, blank check and dump.
//!
//! Every operation walks the flash regions in ascending address order.
//! Write, erase and protocol failures abort; verify mismatches and
//! non-blank regions are reported and the walk continues.

use std::path::Path;

use tracing::{debug, info, instrument, warn};

use super::ProbeSession;
use crate::error::{ErrorCode, SessionError};
use crate::events::{FlashOperation, LogLevel, ProbeEvent, ProbeObserver};
use crate::image::FirmwareImage;
use crate::protocol::constants::{
    BLANK_CHECK_BLOCK, FLASH_DONE, MIN_ERASE_LENGTH, WRITE_ALIGN, WRITE_PREFIX_RESERVE,
};
use crate::protocol::crc::{crc32, parse_crc_reply};
use crate::protocol::packet::needs_escape;
use crate::state::{FlashRegion, SessionState};

/// Largest escaped chunk a flash-write packet of `packet_size` can carry.
pub fn chunk_limit(packet_size: usize) -> usize {
    packet_size.saturating_sub(WRITE_PREFIX_RESERVE) / WRITE_ALIGN * WRITE_ALIGN
}

/// How many leading bytes of `data` fit in `limit` bytes once escaped.
pub fn write_chunk_len(data: &[u8], limit: usize) -> usize {
    let mut used = 0;
    let mut len = 0;
    for &byte in data.iter().take(limit) {
        let cost = if needs_escape(byte) { 2 } else { 1 };
        if used + cost > limit {
            break;
        }
        used += cost;
        len += 1;
    }
    len
}

/// Tracks progress of one operation and reports it.
struct Progress {
    operation: FlashOperation,
    current: u64,
    total: u64,
}

impl Progress {
    fn new(operation: FlashOperation, total: u64) -> Self {
        Self {
            operation,
            current: 0,
            total,
        }
    }

    fn event(&self) -> ProbeEvent {
        ProbeEvent::Progress {
            operation: self.operation,
            current: self.current.min(self.total),
            total: self.total,
        }
    }
}

impl<O: ProbeObserver + 'static> ProbeSession<O> {
    /// Erase and program every flash region the image touches.
    #[instrument(skip(self, image), fields(segments = image.segments().len()))]
    pub fn download(&mut self, image: &FirmwareImage) -> Result<(), SessionError> {
        self.reported(|s| s.download_inner(image))
    }

    fn download_inner(&mut self, image: &FirmwareImage) -> Result<(), SessionError> {
        self.state.require(SessionState::Attached, "download")?;
        let regions = self.flash_regions()?;
        let limit = chunk_limit(self.packet_size);
        if limit == 0 {
            return Err(SessionError::BufferSize {
                packet_size: self.packet_size,
                purpose: "flash write",
            });
        }

        // Work out the erase spans up front so progress has a total.
        let plan: Vec<(FlashRegion, u64)> = regions
            .into_iter()
            .filter_map(|region| {
                image
                    .segments()
                    .iter()
                    .filter_map(|seg| seg.clip(region.address as u64, region.end()))
                    .map(|(addr, data)| addr as u64 + data.len() as u64)
                    .max()
                    .map(|high| (region, high - region.address as u64))
            })
            .collect();
        if plan.is_empty() {
            warn!("Image does not touch any flash region");
            return Ok(());
        }

        let total = plan
            .iter()
            .map(|(region, span)| {
                let bytes: u64 = image
                    .segments()
                    .iter()
                    .filter_map(|seg| seg.clip(region.address as u64, region.end()))
                    .map(|(_, data)| data.len() as u64)
                    .sum();
                region.blocks_for(*span) + bytes
            })
            .sum();
        let mut progress = Progress::new(FlashOperation::Write, total);
        let timeout = self.config.flash_timeout();

        for (region, span) in plan {
            let blocks = region.blocks_for(span);
            let length = (blocks * region.block_size as u64).min(region.size as u64) as u32;
            info!(
                address = %format!("0x{:08x}", region.address),
                length = %format!("0x{:x}", length),
                "Erasing"
            );
            let command = format!("vFlashErase:{:x},{:x}", region.address, length);
            if !self.exchange(command.as_bytes(), timeout)?.is_ok() {
                return Err(SessionError::EraseFailed {
                    address: region.address,
                    length,
                });
            }
            for _ in 0..blocks {
                progress.current += 1;
                self.emit(progress.event());
            }

            for segment in image.segments() {
                let Some((address, data)) = segment.clip(region.address as u64, region.end())
                else {
                    continue;
                };
                let mut offset = 0;
                while offset < data.len() {
                    let len = write_chunk_len(&data[offset..], limit);
                    if len == 0 {
                        return Err(SessionError::BufferSize {
                            packet_size: self.packet_size,
                            purpose: "flash write",
                        });
                    }
                    let chunk_address = address + offset as u32;
                    let mut command = format!("vFlashWrite:{:x}:", chunk_address).into_bytes();
                    command.extend_from_slice(&data[offset..offset + len]);
                    debug!(address = %format!("0x{:08x}", chunk_address), len, "Writing chunk");
                    if !self.exchange(&command, timeout)?.is_ok() {
                        return Err(SessionError::WriteFailed {
                            address: chunk_address,
                        });
                    }
                    offset += len;
                    progress.current += len as u64;
                    self.emit(progress.event());
                }
            }

            if !self.exchange(FLASH_DONE.as_bytes(), timeout)?.is_ok() {
                return Err(SessionError::FlashDoneFailed {
                    address: region.address,
                });
            }
        }

        info!(bytes = image.size(), "Download complete");
        Ok(())
    }

    /// Compare the CRC of every image segment in flash with the target's.
    ///
    /// Returns `Ok(false)` if any segment differs; the others are still
    /// checked.
    #[instrument(skip(self, image), fields(segments = image.segments().len()))]
    pub fn verify(&mut self, image: &FirmwareImage) -> Result<bool, SessionError> {
        self.reported(|s| s.verify_inner(image))
    }

    fn verify_inner(&mut self, image: &FirmwareImage) -> Result<bool, SessionError> {
        self.state.require(SessionState::Attached, "verify")?;
        let segments: Vec<_> = image
            .segments()
            .iter()
            .filter(|seg| self.flash.find(seg.address).is_some())
            .collect();
        let mut progress = Progress::new(FlashOperation::Verify, segments.len() as u64);
        let timeout = self.config.flash_timeout();
        let mut all_matched = true;

        for segment in segments {
            let expected = crc32(&segment.data);
            let command = format!("qCRC:{:x},{:x}", segment.address, segment.len());
            let reply = self.exchange(command.as_bytes(), timeout)?;
            let actual = reply.data().and_then(parse_crc_reply);
            if actual != Some(expected) {
                all_matched = false;
                let message = match actual {
                    Some(crc) => format!(
                        "CRC mismatch at 0x{:08x}: image 0x{:08x}, target 0x{:08x}",
                        segment.address, expected, crc
                    ),
                    None => format!(
                        "CRC check failed at 0x{:08x}: {:?}",
                        segment.address, reply
                    ),
                };
                warn!("{}", message);
                self.emit(ProbeEvent::Error {
                    code: ErrorCode::CrcMismatch,
                    message,
                });
            }
            progress.current += 1;
            self.emit(progress.event());
        }

        Ok(all_matched)
    }

    /// Erase up to `size_cap` bytes of every region.
    #[instrument(skip(self))]
    pub fn full_erase(&mut self, size_cap: u32) -> Result<(), SessionError> {
        self.reported(|s| s.full_erase_inner(size_cap))
    }

    fn full_erase_inner(&mut self, size_cap: u32) -> Result<(), SessionError> {
        self.state.require(SessionState::Attached, "full_erase")?;
        let regions = self.flash_regions()?;
        let mut progress = Progress::new(FlashOperation::Erase, regions.len() as u64);
        let timeout = self.config.flash_timeout();

        for region in regions {
            let mut length = region.size.min(size_cap);
            if length == 0 {
                continue;
            }
            loop {
                let command = format!("vFlashErase:{:x},{:x}", region.address, length);
                if self.exchange(command.as_bytes(), timeout)?.is_ok() {
                    break;
                }
                if length <= MIN_ERASE_LENGTH {
                    return Err(SessionError::EraseFailed {
                        address: region.address,
                        length,
                    });
                }
                length = (length / 2).max(MIN_ERASE_LENGTH);
                warn!(length = %format!("0x{:x}", length), "Erase refused, retrying shorter");
            }
            if !self.exchange(FLASH_DONE.as_bytes(), timeout)?.is_ok() {
                return Err(SessionError::FlashDoneFailed {
                    address: region.address,
                });
            }
            progress.current += 1;
            self.emit(progress.event());
        }
        Ok(())
    }

    /// Check that every region reads back as erased.
    ///
    /// Returns `Ok(false)` if any region holds data.
    #[instrument(skip(self))]
    pub fn blank_check(&mut self) -> Result<bool, SessionError> {
        self.reported(|s| s.blank_check_inner())
    }

    fn blank_check_inner(&mut self) -> Result<bool, SessionError> {
        self.state.require(SessionState::Attached, "blank_check")?;
        let regions = self.flash_regions()?;
        let total = regions.iter().map(|r| r.size as u64).sum();
        let mut progress = Progress::new(FlashOperation::BlankCheck, total);
        let timeout = self.config.reply_timeout();
        let block = BLANK_CHECK_BLOCK.min(self.max_read_len()) as u64;
        let mut all_blank = true;

        for region in regions {
            let mut address = region.address as u64;
            while address < region.end() {
                let len = (region.end() - address).min(block);
                let command = format!("m{:x},{:x}", address, len);
                let reply = self.exchange(command.as_bytes(), timeout)?;
                // Inspect the hex text itself: erased flash reads as all `f`.
                let hex = match reply.data() {
                    Some(hex) => hex,
                    None => {
                        return Err(SessionError::ReadFailed {
                            address: address as u32,
                        });
                    }
                };
                progress.current += len;
                self.emit(progress.event());
                if !hex.iter().all(|&c| c == b'F' || c == b'f') {
                    all_blank = false;
                    self.emit(ProbeEvent::Log {
                        level: LogLevel::Warn,
                        message: format!(
                            "Flash region 0x{:08x} is not blank (data near 0x{:08x})",
                            region.address, address
                        ),
                    });
                    progress.current += region.end() - address - len;
                    break;
                }
                address += len;
            }
        }
        Ok(all_blank)
    }

    /// Read the used part of flash into `path`. Returns the bytes written.
    #[instrument(skip(self, path), fields(path = %path.as_ref().display()))]
    pub fn dump<P: AsRef<Path>>(&mut self, path: P) -> Result<usize, SessionError> {
        self.reported(|s| s.dump_inner(path.as_ref()))
    }

    fn dump_inner(&mut self, path: &Path) -> Result<usize, SessionError> {
        self.state.require(SessionState::Attached, "dump")?;
        let regions = self.flash_regions()?;
        let (low, high) = self.flash.total().ok_or(SessionError::NoFlash)?;
        let span = (high as u64 - low as u64).min(self.config.dump_limit as u64);
        let span_end = low as u64 + span;

        let mut buffer = vec![0xFFu8; span as usize];
        let mut progress = Progress::new(FlashOperation::Dump, span);
        for region in regions {
            let start = (region.address as u64).max(low as u64);
            let end = region.end().min(span_end);
            if start >= end {
                continue;
            }
            let data = self.read_memory_raw(start as u32, (end - start) as usize)?;
            let offset = (start - low as u64) as usize;
            buffer[offset..offset + data.len()].copy_from_slice(&data);
            progress.current += end - start;
            self.emit(progress.event());
        }

        let used = buffer.iter().rposition(|&b| b != 0xFF).map_or(0, |pos| pos + 1);
        if used == 0 {
            return Err(SessionError::DumpBlank);
        }
        let length = used.next_multiple_of(4).min(buffer.len());
        std::fs::write(path, &buffer[..length])?;
        info!(bytes = length, "Flash dumped");
        Ok(length)
    }

    /// Snapshot of the flash regions, or `NoFlash`.
    fn flash_regions(&self) -> Result<Vec<FlashRegion>, SessionError> {
        if self.flash.is_empty() {
            return Err(SessionError::NoFlash);
        }
        Ok(self.flash.regions().to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::packet::encode_frame;

    #[test]
    fn test_chunk_limit() {
        assert_eq!(chunk_limit(0x400), 0x3E0);
        assert_eq!(chunk_limit(100), 64);
        assert_eq!(chunk_limit(40), 0);
    }

    #[test]
    fn test_write_chunk_len_shrinks_for_escapes() {
        assert_eq!(write_chunk_len(&[0u8; 100], 64), 64);
        assert_eq!(write_chunk_len(&[b'$'; 100], 64), 32);
        assert_eq!(write_chunk_len(b"ab}", 4), 3);
        assert_eq!(write_chunk_len(b"abc}", 4), 3);
        assert_eq!(write_chunk_len(&[], 64), 0);
    }

    #[test]
    fn test_write_packets_never_exceed_packet_size() {
        let patterns: [&[u8]; 4] = [b"\x00\x01\x02", b"$", b"#}$a", b"}}}}}}}x"];
        for packet_size in [48usize, 64, 100, 0x200, 0x400, 0x1000] {
            let limit = chunk_limit(packet_size);
            for pattern in patterns {
                let data: Vec<u8> = pattern.iter().cycle().take(3000).cloned().collect();
                let mut offset = 0;
                while offset < data.len() {
                    let len = write_chunk_len(&data[offset..], limit);
                    assert!(len > 0);
                    let mut command = format!("vFlashWrite:{:x}:", 0xFFFF_FFF0u32).into_bytes();
                    command.extend_from_slice(&data[offset..offset + len]);
                    assert!(
                        encode_frame(&command).len() <= packet_size,
                        "packet size {} pattern {:?}",
                        packet_size,
                        pattern
                    );
                    offset += len;
                }
            }
        }
    }
}
