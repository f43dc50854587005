//! GDB Remote Serial Protocol definitions.

pub mod constants;
pub mod crc;
pub mod memory_map;
pub mod packet;
pub mod reply;

pub use memory_map::{MemoryKind, MemoryRegion, parse_memory_map};
pub use reply::Reply;
