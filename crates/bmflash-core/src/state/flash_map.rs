//! Flash regions of the attached target.

use tracing::warn;

use crate::protocol::{MemoryKind, MemoryRegion};

/// A contiguous range of target flash with a uniform erase block size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlashRegion {
    pub address: u32,
    pub size: u32,
    pub block_size: u32,
}

impl FlashRegion {
    /// One past the last address. Computed in 64 bits so a region ending
    /// at the top of the address space does not wrap.
    pub fn end(&self) -> u64 {
        self.address as u64 + self.size as u64
    }

    pub fn contains(&self, address: u32) -> bool {
        address >= self.address && (address as u64) < self.end()
    }

    /// Number of erase blocks needed to cover `length` bytes from the
    /// region start.
    pub fn blocks_for(&self, length: u64) -> u64 {
        let block = self.block_size.max(1) as u64;
        length.div_ceil(block)
    }
}

/// Flash regions sorted by ascending address, never overlapping.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlashMap {
    regions: Vec<FlashRegion>,
}

impl FlashMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from regions in any order. A region that overlaps one at a
    /// lower address is dropped, as is any region of size zero.
    pub fn from_regions(mut regions: Vec<FlashRegion>) -> Self {
        regions.sort_by_key(|r| r.address);
        let mut kept: Vec<FlashRegion> = Vec::with_capacity(regions.len());
        for region in regions {
            if region.size == 0 {
                continue;
            }
            if let Some(last) = kept.last() {
                if (region.address as u64) < last.end() {
                    warn!(
                        address = %format!("0x{:08x}", region.address),
                        "Dropping flash region that overlaps 0x{:08x}",
                        last.address
                    );
                    continue;
                }
            }
            kept.push(region);
        }
        Self { regions: kept }
    }

    /// Keep the flash entries of a parsed memory map. A missing block size
    /// makes the whole region one erase block.
    pub fn from_memory_map(map: &[MemoryRegion]) -> Self {
        Self::from_regions(
            map.iter()
                .filter(|m| m.kind == MemoryKind::Flash)
                .map(|m| FlashRegion {
                    address: m.start,
                    size: m.length,
                    block_size: m.block_size.filter(|&b| b > 0).unwrap_or(m.length),
                })
                .collect(),
        )
    }

    pub fn regions(&self) -> &[FlashRegion] {
        &self.regions
    }

    pub fn iter(&self) -> impl Iterator<Item = &FlashRegion> {
        self.regions.iter()
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    pub fn clear(&mut self) {
        self.regions.clear();
    }

    /// Region containing `address`.
    pub fn find(&self, address: u32) -> Option<&FlashRegion> {
        self.regions.iter().find(|r| r.contains(address))
    }

    /// `(lowest address, highest end address)` over all regions.
    pub fn total(&self) -> Option<(u32, u32)> {
        let first = self.regions.first()?;
        let last = self.regions.last()?;
        Some((first.address, last.end().min(u32::MAX as u64) as u32))
    }
}
