//! RSP framing bytes, command strings and protocol limits.

// Framing
pub const FRAME_START: u8 = b'$';
pub const FRAME_END: u8 = b'#';
pub const ESCAPE: u8 = b'}';
pub const ESCAPE_XOR: u8 = 0x20;
pub const ACK: u8 = b'+';
pub const NAK: u8 = b'-';
/// Break-in byte, sent bare (no frame, no ack).
pub const INTERRUPT: u8 = 0x03;

/// Tag of an asynchronous console reply as sent by the probe.
pub const CONSOLE_WIRE_TAG: u8 = b'O';
/// Tag of a console reply after the link decoded it.
pub const CONSOLE_TAG: u8 = b'o';

/// Commands whose tail is sent hex encoded instead of escaped.
pub const HEX_TAIL_PREFIXES: &[&[u8]] = &[MONITOR_PREFIX.as_bytes(), RUN.as_bytes()];

// Commands
pub const QUERY_SUPPORTED: &str = "qSupported:multiprocess+";
pub const EXTENDED_MODE: &str = "!";
pub const MONITOR_PREFIX: &str = "qRcmd,";
pub const ATTACH: &str = "vAttach;1";
pub const DETACH: &str = "D";
pub const RUN: &str = "vRun;";
pub const CONTINUE: &str = "c";
pub const FLASH_DONE: &str = "vFlashDone";
pub const MEMORY_MAP_READ: &str = "qXfer:memory-map:read::";

// Monitor commands
pub const MON_SCAN: &str = "swdp_scan";
pub const MON_VERSION: &str = "version";
pub const MON_PART_ID: &str = "partid";
pub const MON_HELP: &str = "help";
pub const MON_POWER_ON: &str = "tpwr enable";
pub const MON_POWER_OFF: &str = "tpwr disable";

// Banners
pub const BANNER_BLACK_MAGIC: &str = "Black Magic Probe";
pub const BANNER_WIRELESS: &str = "Wireless Debug Probe";
pub const PART_ID_MARKER: &str = "Part ID:";

// Sizes
/// Cache capacity used until a packet size has been negotiated.
pub const DEFAULT_CACHE_SIZE: usize = 512;
/// Packet size assumed when `qSupported` carries no `PacketSize`.
pub const DEFAULT_PACKET_SIZE: usize = 0x200;
/// Margin added to the negotiated packet size for the receive cache.
pub const CACHE_MARGIN: usize = 16;
/// Bytes reserved in a flash-write packet for framing, command and address.
pub const WRITE_PREFIX_RESERVE: usize = 32;
/// Flash-write chunks are multiples of this when possible.
pub const WRITE_ALIGN: usize = 16;
/// Block size for blank checks.
pub const BLANK_CHECK_BLOCK: usize = 512;
/// Smallest erase length `full_erase` retries with.
pub const MIN_ERASE_LENGTH: u32 = 1024;
/// Voltage below which the target counts as unpowered.
pub const POWER_THRESHOLD: f32 = 0.1;

// Network
pub const DEFAULT_GDB_PORT: u16 = 2159;
