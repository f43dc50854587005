//! Transport wrapper that emits packet events.

use std::sync::Arc;
use std::time::Duration;

use super::traits::{ByteTransport, TransportError, TransportKind};
use crate::events::{PacketDirection, ProbeEvent, ProbeObserver};

/// Number of leading bytes copied into each packet event.
const PREVIEW_LEN: usize = 32;

pub struct ObservableTransport<T: ByteTransport, O: ProbeObserver> {
    inner: T,
    observer: Arc<O>,
}

impl<T: ByteTransport, O: ProbeObserver> ObservableTransport<T, O> {
    pub fn new(inner: T, observer: Arc<O>) -> Self {
        Self { inner, observer }
    }

    fn emit(&self, direction: PacketDirection, data: &[u8]) {
        self.observer.on_event(&ProbeEvent::Packet {
            direction,
            length: data.len(),
            data: Some(data.iter().take(PREVIEW_LEN).cloned().collect()),
        });
    }
}

impl<T: ByteTransport, O: ProbeObserver> ByteTransport for ObservableTransport<T, O> {
    fn send(&mut self, data: &[u8]) -> Result<(), TransportError> {
        let res = self.inner.send(data);
        if res.is_ok() {
            self.emit(PacketDirection::Tx, data);
        }
        res
    }

    fn recv(&mut self, max_len: usize, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        let res = self.inner.recv(max_len, timeout);
        if let Ok(data) = &res {
            if !data.is_empty() {
                self.emit(PacketDirection::Rx, data);
            }
        }
        res
    }

    fn is_open(&self) -> bool {
        self.inner.is_open()
    }

    fn close(&mut self) {
        self.inner.close()
    }

    fn kind(&self) -> TransportKind {
        self.inner.kind()
    }

    fn set_dtr(&mut self, level: bool) -> Result<(), TransportError> {
        self.inner.set_dtr(level)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::test_support::RecordingObserver;
    use crate::transport::MockTransport;

    #[test]
    fn test_packets_are_reported() {
        let mock = MockTransport::new();
        mock.queue_bytes(b"+");
        let observer = Arc::new(RecordingObserver::default());
        let mut transport = ObservableTransport::new(mock, observer.clone());

        transport.send(b"$!#21").unwrap();
        transport.recv(16, Duration::ZERO).unwrap();
        // Idle reads are not reported.
        transport.recv(16, Duration::ZERO).unwrap();

        let directions: Vec<_> = observer
            .events()
            .into_iter()
            .filter_map(|e| match e {
                ProbeEvent::Packet {
                    direction, length, ..
                } => Some((direction, length)),
                _ => None,
            })
            .collect();
        assert_eq!(
            directions,
            vec![(PacketDirection::Tx, 5), (PacketDirection::Rx, 1)]
        );
    }
}
