//! Firmware image segments.
//!
//! Parsing ELF/HEX containers is left to the caller; the flash pipeline
//! only needs loadable segments with their target addresses.

use std::path::Path;

use thiserror::Error;
use tracing::info;

#[derive(Error, Debug)]
pub enum ImageError {
    #[error("Image is empty")]
    Empty,
    #[error("Segment at 0x{address:08x} ({len} bytes) runs past the 32-bit address space")]
    AddressOverflow { address: u32, len: usize },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// What a segment holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentKind {
    Code,
    Data,
    Other,
}

/// A contiguous block of image bytes and its load address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub address: u32,
    pub data: Vec<u8>,
    pub kind: SegmentKind,
}

impl Segment {
    pub fn new(address: u32, data: Vec<u8>, kind: SegmentKind) -> Self {
        Self {
            address,
            data,
            kind,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// One past the last byte, in 64 bits.
    pub fn end(&self) -> u64 {
        self.address as u64 + self.data.len() as u64
    }

    /// The part of this segment inside `[start, end)`, with its address.
    pub fn clip(&self, start: u64, end: u64) -> Option<(u32, &[u8])> {
        let lo = start.max(self.address as u64);
        let hi = end.min(self.end());
        if lo >= hi {
            return None;
        }
        let offset = (lo - self.address as u64) as usize;
        let len = (hi - lo) as usize;
        Some((lo as u32, &self.data[offset..offset + len]))
    }
}

/// An ordered set of segments.
#[derive(Debug, Clone, Default)]
pub struct FirmwareImage {
    segments: Vec<Segment>,
}

impl FirmwareImage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap a flat binary that loads at `address`.
    pub fn from_binary(address: u32, data: Vec<u8>) -> Result<Self, ImageError> {
        let mut image = Self::new();
        image.push(Segment::new(address, data, SegmentKind::Code))?;
        Ok(image)
    }

    /// Load a raw binary file.
    pub fn load_binary<P: AsRef<Path>>(path: P, address: u32) -> Result<Self, ImageError> {
        let data = std::fs::read(path.as_ref())?;
        if data.is_empty() {
            return Err(ImageError::Empty);
        }
        info!(path = %path.as_ref().display(), size = data.len(), "Loaded binary image");
        Self::from_binary(address, data)
    }

    /// Add a segment. Empty segments are ignored.
    pub fn push(&mut self, segment: Segment) -> Result<(), ImageError> {
        if segment.end() > u32::MAX as u64 + 1 {
            return Err(ImageError::AddressOverflow {
                address: segment.address,
                len: segment.len(),
            });
        }
        if segment.is_empty() {
            return Ok(());
        }
        self.segments.push(segment);
        Ok(())
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Total payload bytes.
    pub fn size(&self) -> usize {
        self.segments.iter().map(Segment::len).sum()
    }
}
