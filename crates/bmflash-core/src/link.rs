//! RSP link: reliable command/response exchange over a byte transport.
//!
//! The link owns a receive cache that survives between calls, so a reply
//! split across several transport reads (or several replies arriving in
//! one read) is reassembled without loss. Corrupted frames are answered
//! with a nak and never reach the caller.

use std::thread;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::protocol::constants::{ACK, DEFAULT_CACHE_SIZE, FRAME_START, NAK};
use crate::protocol::packet::{self, FrameScan};
use crate::transport::{ByteTransport, TransportError};

#[derive(Error, Debug)]
pub enum LinkError {
    #[error("Not connected")]
    NotConnected,

    #[error("No acknowledgement after {attempts} attempts")]
    NoAck { attempts: u32 },

    #[error("Transport error: {0}")]
    Transport(TransportError),
}

impl From<TransportError> for LinkError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Closed | TransportError::Disconnected => LinkError::NotConnected,
            other => LinkError::Transport(other),
        }
    }
}

/// Timing and retry parameters of the link.
#[derive(Debug, Clone, Copy)]
pub struct LinkTimings {
    /// Sleep between polls of the transport.
    pub poll_interval: Duration,
    /// How long to wait for `+`/`-` after each transmission.
    pub ack_timeout: Duration,
    /// Total transmissions before giving up.
    pub send_attempts: u32,
}

impl Default for LinkTimings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(50),
            ack_timeout: Duration::from_millis(500),
            send_attempts: 3,
        }
    }
}

enum AckWait {
    Ack,
    Nak,
    Timeout,
}

/// RSP codec bound to one transport.
pub struct RspLink<T: ByteTransport = Box<dyn ByteTransport>> {
    transport: T,
    cache: Vec<u8>,
    capacity: usize,
    timings: LinkTimings,
}

impl<T: ByteTransport> RspLink<T> {
    pub fn new(transport: T, timings: LinkTimings) -> Self {
        Self {
            transport,
            cache: Vec::with_capacity(DEFAULT_CACHE_SIZE),
            capacity: DEFAULT_CACHE_SIZE,
            timings,
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn timings(&self) -> LinkTimings {
        self.timings
    }

    /// Current cache capacity; 0 after a release.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes received but not yet consumed.
    pub fn cached(&self) -> &[u8] {
        &self.cache
    }

    pub fn is_open(&self) -> bool {
        self.transport.is_open()
    }

    pub fn close(&mut self) {
        self.cache.clear();
        self.transport.close();
    }

    /// Grow the cache to hold at least `size` bytes. `0` releases it.
    pub fn set_packet_capacity(&mut self, size: usize) {
        if size == 0 {
            self.cache = Vec::new();
            self.capacity = 0;
        } else if size > self.capacity {
            debug!(from = self.capacity, to = size, "Growing receive cache");
            self.capacity = size;
            self.cache.reserve(size.saturating_sub(self.cache.len()));
        }
    }

    /// Drop any unconsumed bytes.
    pub fn reset_cache(&mut self) {
        self.cache.clear();
    }

    /// Read and discard until the line has been quiet for `quiet`, then
    /// reset the cache.
    pub fn drain(&mut self, quiet: Duration) -> Result<(), LinkError> {
        let give_up = Instant::now() + quiet * 20;
        loop {
            self.cache.clear();
            if self.fill(quiet)? == 0 || Instant::now() >= give_up {
                break;
            }
        }
        self.cache.clear();
        Ok(())
    }

    /// Transmit bytes as-is: no framing, no ack.
    pub fn send_raw(&mut self, bytes: &[u8]) -> Result<(), LinkError> {
        self.transport.send(bytes)?;
        Ok(())
    }

    /// Frame `command`, transmit it, and wait for the probe's ack.
    ///
    /// A nak or a missing ack triggers a retransmission, up to
    /// `send_attempts` transmissions in total.
    pub fn send(&mut self, command: &[u8]) -> Result<(), LinkError> {
        let frame = packet::encode_frame(command);
        debug!(
            command = %String::from_utf8_lossy(&command[..command.len().min(48)]),
            len = frame.len(),
            "Sending packet"
        );

        let attempts = self.timings.send_attempts.max(1);
        for attempt in 1..=attempts {
            self.transport.send(&frame)?;
            match self.wait_ack()? {
                AckWait::Ack => return Ok(()),
                AckWait::Nak => warn!(attempt, "Probe rejected packet, retransmitting"),
                AckWait::Timeout => warn!(attempt, "No acknowledgement from probe"),
            }
        }

        Err(LinkError::NoAck { attempts })
    }

    /// Wait for one frame and return its decoded payload, truncated to
    /// `max_len`.
    ///
    /// Returns `Ok(None)` when nothing complete arrived within `timeout`;
    /// a `None` timeout waits indefinitely.
    pub fn receive(
        &mut self,
        max_len: usize,
        timeout: Option<Duration>,
    ) -> Result<Option<Vec<u8>>, LinkError> {
        if self.capacity == 0 {
            self.set_packet_capacity(DEFAULT_CACHE_SIZE);
        }
        let deadline = timeout.map(|t| Instant::now() + t);

        loop {
            match packet::scan_frame(&self.cache) {
                FrameScan::NoStart => self.cache.clear(),
                FrameScan::Partial { start } => {
                    self.cache.drain(..start);
                    if self.cache.len() >= self.capacity {
                        warn!(len = self.cache.len(), "Oversized frame dropped");
                        self.cache.clear();
                    }
                }
                FrameScan::Complete(frame) => {
                    let raw = self.cache[frame.payload.clone()].to_vec();
                    self.cache.drain(..frame.end);
                    if frame.checksum_ok {
                        self.transport.send(&[ACK])?;
                        let mut payload = packet::decode_payload(&raw);
                        payload.truncate(max_len);
                        trace!(payload = %String::from_utf8_lossy(&payload), "Received packet");
                        return Ok(Some(payload));
                    }
                    warn!("Checksum mismatch, requesting retransmission");
                    self.transport.send(&[NAK])?;
                    continue;
                }
            }

            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    return Ok(None);
                }
            }
            self.fill(self.timings.poll_interval)?;
        }
    }

    fn wait_ack(&mut self) -> Result<AckWait, LinkError> {
        let deadline = Instant::now() + self.timings.ack_timeout;
        loop {
            if let Some(ack) = self.take_ack() {
                return Ok(if ack { AckWait::Ack } else { AckWait::Nak });
            }
            if Instant::now() >= deadline {
                return Ok(AckWait::Timeout);
            }
            self.fill(self.timings.poll_interval)?;
        }
    }

    /// Remove the first ack/nak byte that is not part of a frame. Complete
    /// frames ahead of it stay in the cache for `receive`.
    fn take_ack(&mut self) -> Option<bool> {
        let mut i = 0;
        while i < self.cache.len() {
            let byte = self.cache[i];
            match byte {
                ACK | NAK => return Some(self.cache.remove(i) == ACK),
                FRAME_START => match packet::scan_frame(&self.cache[i..]) {
                    FrameScan::Complete(frame) => i += frame.end,
                    _ => return None,
                },
                _ => i += 1,
            }
        }
        None
    }

    /// Read whatever fits into the cache, waiting at most `timeout`.
    fn fill(&mut self, timeout: Duration) -> Result<usize, LinkError> {
        let room = self.capacity.saturating_sub(self.cache.len());
        if room == 0 {
            thread::sleep(timeout);
            return Ok(0);
        }
        let data = self.transport.recv(room, timeout)?;
        self.cache.extend_from_slice(&data);
        Ok(data.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockTransport;
    use pretty_assertions::assert_eq;

    fn fast() -> LinkTimings {
        LinkTimings {
            poll_interval: Duration::from_millis(1),
            ack_timeout: Duration::from_millis(20),
            send_attempts: 3,
        }
    }

    fn link(mock: &MockTransport) -> RspLink<MockTransport> {
        RspLink::new(mock.clone(), fast())
    }

    const SHORT: Option<Duration> = Some(Duration::from_millis(30));

    #[test]
    fn test_send_waits_for_ack() {
        let mock = MockTransport::new();
        mock.queue_bytes(b"+");
        link(&mock).send(b"!").unwrap();
        assert_eq!(mock.get_writes(), vec![b"$!#21".to_vec()]);
    }

    #[test]
    fn test_send_retransmits_on_nak() {
        let mock = MockTransport::new();
        mock.queue_bytes(b"-");
        mock.queue_bytes(b"+");
        link(&mock).send(b"!").unwrap();
        assert_eq!(mock.get_writes().len(), 2);
    }

    #[test]
    fn test_send_gives_up_after_three_attempts() {
        let mock = MockTransport::new();
        let err = link(&mock).send(b"!").unwrap_err();
        assert!(matches!(err, LinkError::NoAck { attempts: 3 }));
        assert_eq!(mock.get_writes().len(), 3);
    }

    #[test]
    fn test_ack_behind_a_frame_keeps_the_frame() {
        let mock = MockTransport::new();
        mock.queue_bytes(b"$OK#9a+");
        let mut link = link(&mock);
        link.send(b"D").unwrap();
        assert_eq!(link.receive(64, SHORT).unwrap(), Some(b"OK".to_vec()));
    }

    #[test]
    fn test_receive_acks_good_frame() {
        let mock = MockTransport::new();
        mock.queue_bytes(b"noise$OK#9a");
        assert_eq!(link(&mock).receive(64, SHORT).unwrap(), Some(b"OK".to_vec()));
        assert_eq!(mock.get_writes(), vec![b"+".to_vec()]);
    }

    #[test]
    fn test_receive_naks_bad_checksum() {
        let mock = MockTransport::new();
        mock.queue_bytes(b"$OK#00");
        assert_eq!(link(&mock).receive(64, SHORT).unwrap(), None);
        assert_eq!(mock.get_writes(), vec![b"-".to_vec()]);
    }

    #[test]
    fn test_receive_accepts_retransmission() {
        let mock = MockTransport::new();
        mock.queue_bytes(b"$OK#00");
        mock.queue_bytes(b"$OK#9a");
        assert_eq!(link(&mock).receive(64, SHORT).unwrap(), Some(b"OK".to_vec()));
        assert_eq!(mock.get_writes(), vec![b"-".to_vec(), b"+".to_vec()]);
    }

    #[test]
    fn test_frame_split_across_reads() {
        let whole = MockTransport::new();
        whole.queue_packet(b"T05thread:01;");
        let split = MockTransport::new();
        let frame = packet::encode_frame(b"T05thread:01;");
        for piece in frame.chunks(3) {
            split.queue_bytes(piece);
        }

        let a = link(&whole).receive(64, SHORT).unwrap();
        let b = link(&split).receive(64, SHORT).unwrap();
        assert_eq!(a, b);
        assert_eq!(a, Some(b"T05thread:01;".to_vec()));
    }

    #[test]
    fn test_trailing_bytes_survive_for_next_call() {
        let mock = MockTransport::new();
        mock.queue_bytes(b"$OK#9a$E01#a6");
        let mut link = link(&mock);
        assert_eq!(link.receive(64, SHORT).unwrap(), Some(b"OK".to_vec()));
        assert_eq!(link.cached(), b"$E01#a6");
        assert_eq!(link.receive(64, SHORT).unwrap(), Some(b"E01".to_vec()));
    }

    #[test]
    fn test_console_output_is_decoded() {
        let mock = MockTransport::new();
        mock.queue_packet(b"O48690a");
        assert_eq!(
            link(&mock).receive(64, SHORT).unwrap(),
            Some(b"oHi\n".to_vec())
        );
    }

    #[test]
    fn test_payload_truncated_to_max_len() {
        let mock = MockTransport::new();
        mock.queue_packet(b"0123456789");
        assert_eq!(link(&mock).receive(4, SHORT).unwrap(), Some(b"0123".to_vec()));
    }

    #[test]
    fn test_oversized_frame_is_dropped() {
        let mock = MockTransport::new();
        let mut junk = vec![b'$'];
        junk.extend(std::iter::repeat_n(b'a', 600));
        mock.queue_bytes(&junk);
        mock.queue_bytes(b"$OK#9a");
        let mut link = link(&mock);
        assert_eq!(link.receive(64, SHORT).unwrap(), Some(b"OK".to_vec()));
        assert!(link.cached().is_empty());
    }

    #[test]
    fn test_capacity_only_grows() {
        let mock = MockTransport::new();
        let mut link = link(&mock);
        assert_eq!(link.capacity(), DEFAULT_CACHE_SIZE);
        link.set_packet_capacity(80);
        assert_eq!(link.capacity(), DEFAULT_CACHE_SIZE);
        link.set_packet_capacity(1040);
        assert_eq!(link.capacity(), 1040);
        link.set_packet_capacity(100);
        assert_eq!(link.capacity(), 1040);
        link.set_packet_capacity(0);
        assert_eq!(link.capacity(), 0);

        // A released cache comes back on the next receive.
        mock.queue_packet(b"OK");
        assert_eq!(link.receive(64, SHORT).unwrap(), Some(b"OK".to_vec()));
        assert_eq!(link.capacity(), DEFAULT_CACHE_SIZE);
    }

    #[test]
    fn test_closed_transport_is_not_connected() {
        let mock = MockTransport::new();
        let mut link = link(&mock);
        link.close();
        assert!(matches!(link.send(b"!"), Err(LinkError::NotConnected)));
        assert!(matches!(link.receive(64, SHORT), Err(LinkError::NotConnected)));
    }
}
