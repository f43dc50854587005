//! Session state and target flash layout.

pub mod flash_map;
pub mod machine;

pub use flash_map::{FlashMap, FlashRegion};
pub use machine::SessionState;
