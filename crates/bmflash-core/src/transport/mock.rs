//! Mock byte transport for testing.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use super::traits::{ByteTransport, TransportError, TransportKind};
use crate::protocol::packet;

type Responder = Box<dyn FnMut(&[u8]) -> Vec<u8> + Send>;

/// Mock transport for unit testing codec and session logic.
///
/// Clones share state, so a test can keep one handle for inspection
/// while the session owns the other.
#[derive(Clone)]
pub struct MockTransport {
    /// Queued chunks to return on recv.
    rx_queue: Arc<Mutex<VecDeque<Vec<u8>>>>,
    /// Captured writes.
    write_log: Arc<Mutex<Vec<Vec<u8>>>>,
    /// Optional scripted peer; its output is queued after every write.
    responder: Arc<Mutex<Option<Responder>>>,
    /// Whether the channel is "open".
    open: Arc<Mutex<bool>>,
    /// DTR level history.
    dtr_log: Arc<Mutex<Vec<bool>>>,
    kind: TransportKind,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            rx_queue: Arc::new(Mutex::new(VecDeque::new())),
            write_log: Arc::new(Mutex::new(Vec::new())),
            responder: Arc::new(Mutex::new(None)),
            open: Arc::new(Mutex::new(true)),
            dtr_log: Arc::new(Mutex::new(Vec::new())),
            kind: TransportKind::Serial,
        }
    }

    /// Create a mock whose peer answers every write through `responder`.
    pub fn with_responder<F>(responder: F) -> Self
    where
        F: FnMut(&[u8]) -> Vec<u8> + Send + 'static,
    {
        let mock = Self::new();
        *mock.responder.lock().unwrap() = Some(Box::new(responder));
        mock
    }

    pub fn set_kind(&mut self, kind: TransportKind) {
        self.kind = kind;
    }

    /// Queue raw bytes to be returned by one recv call.
    pub fn queue_bytes(&self, bytes: &[u8]) {
        self.rx_queue.lock().unwrap().push_back(bytes.to_vec());
    }

    /// Queue a well-formed frame carrying `payload`.
    pub fn queue_packet(&self, payload: &[u8]) {
        self.queue_bytes(&packet::encode_frame(payload));
    }

    /// Queue an ack followed by a reply frame.
    pub fn queue_reply(&self, payload: &[u8]) {
        self.queue_bytes(b"+");
        self.queue_packet(payload);
    }

    /// Get all captured writes.
    pub fn get_writes(&self) -> Vec<Vec<u8>> {
        self.write_log.lock().unwrap().clone()
    }

    /// Captured writes that were framed packets, decoded to their payloads.
    pub fn sent_packets(&self) -> Vec<Vec<u8>> {
        self.get_writes()
            .iter()
            .filter_map(|w| match packet::scan_frame(w) {
                packet::FrameScan::Complete(frame) if frame.checksum_ok => {
                    Some(packet::unescape(&w[frame.payload.clone()]))
                }
                _ => None,
            })
            .collect()
    }

    /// Clear captured writes.
    pub fn clear_writes(&self) {
        self.write_log.lock().unwrap().clear();
    }

    /// Number of chunks still waiting to be read.
    pub fn pending(&self) -> usize {
        self.rx_queue.lock().unwrap().len()
    }

    pub fn dtr_history(&self) -> Vec<bool> {
        self.dtr_log.lock().unwrap().clone()
    }

    /// Simulate the peer going away.
    pub fn disconnect(&self) {
        *self.open.lock().unwrap() = false;
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl ByteTransport for MockTransport {
    fn send(&mut self, data: &[u8]) -> Result<(), TransportError> {
        if !*self.open.lock().unwrap() {
            return Err(TransportError::Closed);
        }
        self.write_log.lock().unwrap().push(data.to_vec());
        if let Some(responder) = self.responder.lock().unwrap().as_mut() {
            let reply = responder(data);
            if !reply.is_empty() {
                self.rx_queue.lock().unwrap().push_back(reply);
            }
        }
        Ok(())
    }

    fn recv(&mut self, max_len: usize, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        if !*self.open.lock().unwrap() {
            return Err(TransportError::Closed);
        }
        let mut queue = self.rx_queue.lock().unwrap();
        match queue.pop_front() {
            Some(mut chunk) => {
                if chunk.len() > max_len {
                    let rest = chunk.split_off(max_len);
                    queue.push_front(rest);
                }
                Ok(chunk)
            }
            None => {
                drop(queue);
                // Behave like a real line: an idle read costs the timeout.
                thread::sleep(timeout.min(Duration::from_millis(5)));
                Ok(Vec::new())
            }
        }
    }

    fn is_open(&self) -> bool {
        *self.open.lock().unwrap()
    }

    fn close(&mut self) {
        *self.open.lock().unwrap() = false;
    }

    fn kind(&self) -> TransportKind {
        self.kind
    }

    fn set_dtr(&mut self, level: bool) -> Result<(), TransportError> {
        self.dtr_log.lock().unwrap().push(level);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_rx_queue() {
        let mut mock = MockTransport::new();
        mock.queue_bytes(b"+");
        mock.queue_bytes(b"$OK#9a");

        assert_eq!(mock.recv(64, Duration::ZERO).unwrap(), b"+");
        assert_eq!(mock.recv(64, Duration::ZERO).unwrap(), b"$OK#9a");

        // Queue is empty now
        assert!(mock.recv(64, Duration::ZERO).unwrap().is_empty());
    }

    #[test]
    fn test_mock_recv_respects_max_len() {
        let mut mock = MockTransport::new();
        mock.queue_bytes(b"$OK#9a");

        assert_eq!(mock.recv(3, Duration::ZERO).unwrap(), b"$OK");
        assert_eq!(mock.recv(64, Duration::ZERO).unwrap(), b"#9a");
    }

    #[test]
    fn test_mock_write_capture() {
        let mut mock = MockTransport::new();
        mock.send(b"Hello").unwrap();
        mock.send(b"World").unwrap();

        let writes = mock.get_writes();
        assert_eq!(writes.len(), 2);
        assert_eq!(writes[0], b"Hello");
        assert_eq!(writes[1], b"World");
    }

    #[test]
    fn test_mock_responder() {
        let mut mock = MockTransport::with_responder(|data| {
            if data == b"ping" {
                b"pong".to_vec()
            } else {
                Vec::new()
            }
        });
        mock.send(b"ping").unwrap();
        mock.send(b"other").unwrap();
        assert_eq!(mock.pending(), 1);
        assert_eq!(mock.recv(64, Duration::ZERO).unwrap(), b"pong");
    }

    #[test]
    fn test_mock_close() {
        let mut mock = MockTransport::new();
        let observer = mock.clone();
        assert!(observer.is_open());

        mock.close();
        assert!(!observer.is_open());
        assert!(mock.send(b"test").is_err());
    }
}
