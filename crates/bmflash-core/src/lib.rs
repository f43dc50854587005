//! bmflash-core: GDB Remote Serial Protocol client for debug probes.
//!
//! This crate talks to a hardware debug probe (Black Magic Probe and
//! compatibles) over a serial line or TCP and drives attach, flash
//! programming, verification and monitor commands on the target behind it.
//!
//! # Architecture
//!
//! The crate is organized into layers:
//!
//! - **Transport**: byte channel abstraction (serial, TCP, mock)
//! - **Protocol**: RSP framing, escaping, reply classification, CRC, memory map
//! - **Link**: reliable packet exchange with ack/retry and a persistent receive cache
//! - **State**: session state machine and flash region map
//! - **Session**: connect/attach lifecycle, monitor commands, flash pipeline
//! - **Script**: init-script interpreter for device setup sequences
//! - **Events**: Observer pattern for UI decoupling
//!
//! # Example
//!
//! ```no_run
//! use bmflash_core::image::FirmwareImage;
//! use bmflash_core::session::{ProbeSession, ProbeTarget, SessionConfig};
//!
//! let mut session = ProbeSession::new(SessionConfig::default());
//! let target: ProbeTarget = "/dev/ttyACM0".parse().expect("probe address");
//! session.connect(&target).expect("connect failed");
//! session.attach(true).expect("attach failed");
//!
//! let image = FirmwareImage::load_binary("firmware.bin", 0x0800_0000).expect("image");
//! session.download(&image).expect("download failed");
//! assert!(session.verify(&image).expect("verify failed"));
//! ```

pub mod error;
pub mod events;
pub mod image;
pub mod link;
pub mod protocol;
pub mod script;
pub mod session;
pub mod state;
pub mod transport;

// Re-exports for convenience
pub use error::{ErrorCode, SessionError};
pub use events::{
    FlashOperation, LogLevel, NullObserver, ProbeEvent, ProbeObserver, TracingObserver,
};
pub use image::{FirmwareImage, ImageError, Segment, SegmentKind};
pub use link::{LinkError, LinkTimings, RspLink};
pub use protocol::Reply;
pub use script::{MemoryAccess, Operand, Operator, ScriptOp, ScriptSource};
pub use session::{ProbeKind, ProbeSession, ProbeTarget, SessionConfig, TargetInfo};
pub use state::{FlashMap, FlashRegion, SessionState};
pub use transport::{ByteTransport, MockTransport, TransportError, TransportKind};
