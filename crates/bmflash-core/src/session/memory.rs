//! Raw target memory access (`m` / `X`).

use tracing::trace;

use super::ProbeSession;
use super::flash::{chunk_limit, write_chunk_len};
use crate::error::SessionError;
use crate::events::ProbeObserver;
use crate::protocol::Reply;
use crate::protocol::constants::CACHE_MARGIN;
use crate::script::MemoryAccess;
use crate::state::SessionState;

impl<O: ProbeObserver + 'static> ProbeSession<O> {
    /// Read `len` bytes of target memory.
    pub fn read_memory(&mut self, address: u32, len: usize) -> Result<Vec<u8>, SessionError> {
        self.reported(|s| {
            s.state.require(SessionState::Attached, "read_memory")?;
            s.read_memory_raw(address, len)
        })
    }

    /// Write `data` to target memory.
    pub fn write_memory(&mut self, address: u32, data: &[u8]) -> Result<(), SessionError> {
        self.reported(|s| {
            s.state.require(SessionState::Attached, "write_memory")?;
            s.write_memory_raw(address, data)
        })
    }

    /// Largest `m` length whose hex reply fits in one packet.
    pub(super) fn max_read_len(&self) -> usize {
        (self.packet_size.saturating_sub(CACHE_MARGIN) / 2).max(1)
    }

    /// `m` reads split so each hex reply fits in one packet.
    pub(super) fn read_memory_raw(
        &mut self,
        address: u32,
        len: usize,
    ) -> Result<Vec<u8>, SessionError> {
        let max_read = self.max_read_len();
        let timeout = self.config.reply_timeout();
        let mut out = Vec::with_capacity(len);

        while out.len() < len {
            let at = address.wrapping_add(out.len() as u32);
            let count = (len - out.len()).min(max_read);
            let command = format!("m{:x},{:x}", at, count);
            let bytes = match self.exchange(command.as_bytes(), timeout)? {
                Reply::Data(hex_text) => {
                    hex::decode(&hex_text).map_err(|_| SessionError::ReadFailed { address: at })?
                }
                _ => return Err(SessionError::ReadFailed { address: at }),
            };
            if bytes.is_empty() {
                return Err(SessionError::ReadFailed { address: at });
            }
            trace!(address = %format!("0x{:08x}", at), len = bytes.len(), "Read memory");
            out.extend(bytes.into_iter().take(count));
        }
        Ok(out)
    }

    /// `X` writes with binary payloads, split to fit the packet size.
    pub(super) fn write_memory_raw(
        &mut self,
        address: u32,
        data: &[u8],
    ) -> Result<(), SessionError> {
        let limit = chunk_limit(self.packet_size);
        let timeout = self.config.reply_timeout();
        let mut offset = 0;

        while offset < data.len() {
            let len = write_chunk_len(&data[offset..], limit);
            if len == 0 {
                return Err(SessionError::BufferSize {
                    packet_size: self.packet_size,
                    purpose: "memory write",
                });
            }
            let at = address.wrapping_add(offset as u32);
            let mut command = format!("X{:x},{:x}:", at, len).into_bytes();
            command.extend_from_slice(&data[offset..offset + len]);
            if !self.exchange(&command, timeout)?.is_ok() {
                return Err(SessionError::WriteFailed { address: at });
            }
            offset += len;
        }
        Ok(())
    }
}

impl<O: ProbeObserver + 'static> MemoryAccess for ProbeSession<O> {
    fn read_memory(&mut self, address: u32, len: usize) -> Result<Vec<u8>, SessionError> {
        self.state.require(SessionState::Attached, "read_memory")?;
        self.read_memory_raw(address, len)
    }

    fn write_memory(&mut self, address: u32, data: &[u8]) -> Result<(), SessionError> {
        self.state.require(SessionState::Attached, "write_memory")?;
        self.write_memory_raw(address, data)
    }
}
