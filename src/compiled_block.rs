use crate::block::ExecutableBlock;
use crate::memory::{TargetAddress, VirtualAddress};

/// A range of guest addresses
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LocationRange {
    base_address: TargetAddress,
    size: usize,
}

impl LocationRange {
    /// Creates a new location range from the start address and its size in bytes
    pub fn new(start_addr: TargetAddress, size: usize) -> Self {
        assert!(size > 0);
        assert!(start_addr as usize + size <= 0x1_0000);
        Self {
            base_address: start_addr,
            size,
        }
    }

    pub fn start(&self) -> TargetAddress {
        self.base_address
    }

    /// Exclusive end of the range. It may be 0x10000 for a range touching the top of memory.
    pub fn end(&self) -> usize {
        self.base_address as usize + self.size
    }

    /// Checks if the address is part of this location range
    pub fn contains(&self, address: TargetAddress) -> bool {
        (self.base_address as usize..self.end()).contains(&(address as usize))
    }

    /// Checks if both ranges share at least one address
    pub fn overlaps(&self, other: &LocationRange) -> bool {
        (self.base_address as usize) < other.end() && (other.base_address as usize) < self.end()
    }
}

/// A finalized translation unit, ready to be entered at its guest start address
pub struct CompiledBlock {
    block: ExecutableBlock,
    location_range: LocationRange,
    instruction_count: usize,
}

impl CompiledBlock {
    pub fn new(
        block: ExecutableBlock,
        location_range: LocationRange,
        instruction_count: usize,
    ) -> Self {
        Self {
            block,
            location_range,
            instruction_count,
        }
    }

    pub fn start_address(&self) -> TargetAddress {
        self.location_range.start()
    }

    pub fn location_range(&self) -> &LocationRange {
        &self.location_range
    }

    pub fn instruction_count(&self) -> usize {
        self.instruction_count
    }

    pub fn host_size(&self) -> usize {
        self.block.len()
    }

    pub fn entrypoint(&self) -> VirtualAddress {
        self.block.entrypoint()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn range_at_top_of_memory() {
        let range = LocationRange::new(0xFFFE, 2);
        assert!(range.contains(0xFFFF));
        assert!(!range.contains(0x0000));
        assert_eq!(range.end(), 0x1_0000);
    }

    #[test]
    fn overlapping_ranges() {
        let block = LocationRange::new(0x4000, 0x10);
        assert!(block.overlaps(&LocationRange::new(0x400F, 1)));
        assert!(block.overlaps(&LocationRange::new(0x0000, 0x8000)));
        assert!(!block.overlaps(&LocationRange::new(0x4010, 0x10)));
        assert!(!block.overlaps(&LocationRange::new(0x3FF0, 0x10)));
    }
}
