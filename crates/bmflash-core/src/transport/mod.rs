//! Transport layer module.

pub mod mock;
pub mod observable;
pub mod serial;
pub mod tcp;
pub mod traits;

pub use mock::MockTransport;
pub use observable::ObservableTransport;
pub use serial::SerialTransport;
pub use tcp::TcpTransport;
pub use traits::{ByteTransport, TransportError, TransportKind};
