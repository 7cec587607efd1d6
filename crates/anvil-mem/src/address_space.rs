//! # GPU Address Space Management
//!
//! First-fit virtual address sub-allocation inside a reserved arena.

use anvil_core::{ByteSize, Error, GpuAddr, Result, VaRange};

/// Smallest alignment handed out
pub const MIN_ALIGNMENT: u64 = 4096;

// =============================================================================
// VA BLOCK
// =============================================================================

/// A virtual address block
#[derive(Debug, Clone)]
struct VaBlock {
    range: VaRange,
    free: bool,
}

// =============================================================================
// ADDRESS SPACE
// =============================================================================

/// GPU virtual address space
///
/// First-fit allocations never start below the placement floor. Placed
/// allocations ([`allocate_at`](Self::allocate_at)) ignore the floor.
#[derive(Debug)]
pub struct AddressSpace {
    /// Managed range
    range: VaRange,
    /// VA blocks, sorted and contiguous
    blocks: Vec<VaBlock>,
    /// Lowest address first fit may use
    floor: GpuAddr,
    /// End of the highest allocation ever made
    high_water: GpuAddr,
    /// Statistics
    stats: AddressSpaceStats,
}

/// Address space statistics
#[derive(Debug, Clone, Default)]
pub struct AddressSpaceStats {
    /// Number of allocations
    pub allocs: u64,
    /// Number of frees
    pub frees: u64,
    /// Current allocated bytes
    pub allocated: u64,
    /// Number of floor raises
    pub floor_raises: u64,
}

impl AddressSpace {
    /// Create a new address space
    pub fn new(range: VaRange) -> Self {
        Self {
            range,
            blocks: vec![VaBlock { range, free: true }],
            floor: range.start,
            high_water: range.start,
            stats: AddressSpaceStats::default(),
        }
    }

    /// Get managed range
    pub fn range(&self) -> VaRange {
        self.range
    }

    /// Current placement floor
    pub fn floor(&self) -> GpuAddr {
        self.floor
    }

    /// End of the highest allocation ever made
    pub fn high_water(&self) -> GpuAddr {
        self.high_water
    }

    /// Forbid first fit from reusing any address handed out so far
    pub fn raise_floor(&mut self) {
        if self.high_water > self.floor {
            self.floor = self.high_water;
            self.stats.floor_raises += 1;
            log::debug!("address space floor raised to {}", self.floor);
        }
    }

    /// Allocate virtual address range
    pub fn allocate(&mut self, size: ByteSize, alignment: u64) -> Result<VaRange> {
        let size = size.as_bytes();
        if size == 0 {
            return Err(Error::InvalidParameter);
        }
        let alignment = alignment.max(MIN_ALIGNMENT);
        if !alignment.is_power_of_two() {
            return Err(Error::MisalignedAddress);
        }

        // Find first free block that fits above the floor
        for i in 0..self.blocks.len() {
            if !self.blocks[i].free {
                continue;
            }

            let block = self.blocks[i].range;
            if block.end <= self.floor {
                continue;
            }

            let start = block.start.max(self.floor).align_up(alignment);
            let end = start + size;

            if end <= block.end && start >= block.start {
                let alloc_range = VaRange { start, end };
                self.split_block(i, alloc_range);
                self.account(alloc_range);
                return Ok(alloc_range);
            }
        }

        Err(Error::OutOfMemory)
    }

    /// Allocate exactly `wanted`
    pub fn allocate_at(&mut self, wanted: VaRange) -> Result<VaRange> {
        if !wanted.start.is_aligned(MIN_ALIGNMENT) {
            return Err(Error::MisalignedAddress);
        }
        if wanted.size() == ByteSize::ZERO || !self.range.encloses(&wanted) {
            return Err(Error::InvalidParameter);
        }

        let index = self
            .blocks
            .iter()
            .position(|b| b.free && b.range.encloses(&wanted))
            .ok_or(Error::AddressBindingFailed)?;

        self.split_block(index, wanted);
        self.account(wanted);
        Ok(wanted)
    }

    fn account(&mut self, range: VaRange) {
        self.stats.allocs += 1;
        self.stats.allocated += range.size().as_bytes();
        self.high_water = self.high_water.max(range.end);
    }

    /// Split a block around an allocation
    fn split_block(&mut self, index: usize, alloc: VaRange) {
        let block = self.blocks.remove(index);

        // Left fragment (before allocation)
        let mut at = index;
        if alloc.start > block.range.start {
            self.blocks.insert(at, VaBlock {
                range: VaRange {
                    start: block.range.start,
                    end: alloc.start,
                },
                free: true,
            });
            at += 1;
        }

        // Allocated block
        self.blocks.insert(at, VaBlock {
            range: alloc,
            free: false,
        });

        // Right fragment (after allocation)
        if alloc.end < block.range.end {
            self.blocks.insert(at + 1, VaBlock {
                range: VaRange {
                    start: alloc.end,
                    end: block.range.end,
                },
                free: true,
            });
        }
    }

    /// Free a virtual address range
    pub fn free(&mut self, range: VaRange) -> Result<()> {
        let index = self
            .blocks
            .iter()
            .position(|b| b.range == range && !b.free)
            .ok_or(Error::NotFound)?;

        self.blocks[index].free = true;
        self.stats.frees += 1;
        self.stats.allocated -= range.size().as_bytes();

        self.merge_free_blocks();

        Ok(())
    }

    /// Merge adjacent free blocks
    fn merge_free_blocks(&mut self) {
        let mut i = 0;
        while i + 1 < self.blocks.len() {
            if self.blocks[i].free && self.blocks[i + 1].free {
                self.blocks[i].range.end = self.blocks[i + 1].range.end;
                self.blocks.remove(i + 1);
            } else {
                i += 1;
            }
        }
    }

    /// Get statistics
    pub fn stats(&self) -> &AddressSpaceStats {
        &self.stats
    }

    /// Free space usable by first fit
    pub fn free_space(&self) -> ByteSize {
        ByteSize::from_bytes(
            self.blocks
                .iter()
                .filter(|b| b.free && b.range.end > self.floor)
                .map(|b| b.range.end - b.range.start.max(self.floor))
                .sum(),
        )
    }
}
