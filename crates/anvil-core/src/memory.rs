//! # Memory Primitives
//!
//! Allocation descriptors, virtual address ranges, dependency access modes
//! and the CPU mapping abstraction shared by the registry and devices.

use core::fmt;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::types::*;

// =============================================================================
// ALLOCATION
// =============================================================================

/// Placement heap for a buffer object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Heap {
    /// Host memory visible to the device
    #[default]
    System,
    /// Device-local memory
    Vram,
}

bitflags::bitflags! {
    /// Allocation flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct AllocFlags: u32 {
        /// Object must be mappable by the CPU
        const CPU_ACCESS = 1 << 0;
        /// Contents are zeroed at allocation
        const ZEROED = 1 << 1;
        /// CPU mapping is uncached
        const UNCACHED = 1 << 2;
    }
}

/// Tiling / layout tag, opaque to the batch layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(transparent)]
pub struct TilingTag(pub u32);

impl TilingTag {
    /// Linear layout
    pub const LINEAR: Self = Self(0);
}

/// Buffer object allocation request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocDesc {
    /// Requested size
    pub size: ByteSize,
    /// Required address alignment
    pub alignment: u64,
    /// Placement heap
    pub heap: Heap,
    /// Allocation flags
    pub flags: AllocFlags,
    /// Layout tag carried along with the object
    pub tiling: TilingTag,
}

impl AllocDesc {
    /// Page-aligned, CPU-accessible system memory of `size`
    pub const fn new(size: ByteSize) -> Self {
        Self {
            size,
            alignment: ByteSize::PAGE.as_bytes(),
            heap: Heap::System,
            flags: AllocFlags::CPU_ACCESS.union(AllocFlags::ZEROED),
            tiling: TilingTag::LINEAR,
        }
    }

    /// Set the placement heap
    pub const fn with_heap(mut self, heap: Heap) -> Self {
        self.heap = heap;
        self
    }

    /// Set the allocation flags
    pub const fn with_flags(mut self, flags: AllocFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Set the tiling tag
    pub const fn with_tiling(mut self, tiling: TilingTag) -> Self {
        self.tiling = tiling;
        self
    }

    /// Set the address alignment
    pub const fn with_alignment(mut self, alignment: u64) -> Self {
        self.alignment = alignment;
        self
    }
}

// =============================================================================
// VIRTUAL ADDRESS RANGE
// =============================================================================

/// A range in GPU virtual address space
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VaRange {
    /// Start address
    pub start: GpuAddr,
    /// End address (exclusive)
    pub end: GpuAddr,
}

impl VaRange {
    /// Create a new VA range
    pub const fn new(start: GpuAddr, size: ByteSize) -> Self {
        Self {
            start,
            end: GpuAddr::new(start.raw() + size.as_bytes()),
        }
    }

    /// Get range size
    pub fn size(&self) -> ByteSize {
        ByteSize::from_bytes(self.end - self.start)
    }

    /// Check if address is in range
    pub fn contains(&self, addr: GpuAddr) -> bool {
        addr >= self.start && addr < self.end
    }

    /// Check if `other` lies entirely inside this range
    pub fn encloses(&self, other: &VaRange) -> bool {
        other.start >= self.start && other.end <= self.end
    }

    /// Check if ranges overlap
    pub fn overlaps(&self, other: &VaRange) -> bool {
        self.start < other.end && other.start < self.end
    }
}

impl fmt::Display for VaRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}..{})", self.start, self.end)
    }
}

// =============================================================================
// ACCESS MODE
// =============================================================================

/// How a batch uses one of its dependencies
///
/// The two modes form a lattice with `Read < Write`; merging two
/// registrations of the same object takes the join, so access is only
/// ever upgraded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum Access {
    /// Read-only
    #[default]
    Read,
    /// Read-write
    Write,
}

impl Access {
    /// Access mode from a writable flag
    #[inline]
    pub const fn from_writable(writable: bool) -> Self {
        if writable {
            Self::Write
        } else {
            Self::Read
        }
    }

    /// Least upper bound of two access modes
    #[inline]
    pub fn join(self, other: Self) -> Self {
        self.max(other)
    }

    /// Whether the device may write the object
    #[inline]
    pub const fn is_write(self) -> bool {
        matches!(self, Self::Write)
    }
}

// =============================================================================
// CPU MAPPING
// =============================================================================

/// Backing store of a CPU mapping, provided by the device
///
/// Offsets are in bytes and must be 4-byte aligned.
pub trait MappedMemory: Send + Sync {
    /// Mapped length
    fn size(&self) -> ByteSize;

    /// Read one 32-bit word
    fn read_u32(&self, offset: u64) -> Result<u32>;

    /// Write one 32-bit word
    fn write_u32(&self, offset: u64, value: u32) -> Result<()>;
}

/// CPU view of a buffer object
///
/// Cloning shares the same view. The mapping stays readable after
/// [`unmap`](crate::DeviceHandle::unmap) only as long as the device keeps
/// the backing store alive; callers should drop it on unmap.
#[derive(Clone)]
pub struct CpuMapping {
    bo: BufferHandle,
    memory: Arc<dyn MappedMemory>,
}

impl CpuMapping {
    /// Wrap a device backing store
    pub fn new(bo: BufferHandle, memory: Arc<dyn MappedMemory>) -> Self {
        Self { bo, memory }
    }

    /// Object this mapping views
    pub fn buffer(&self) -> BufferHandle {
        self.bo
    }

    /// Mapped length
    pub fn size(&self) -> ByteSize {
        self.memory.size()
    }

    /// Read one 32-bit word
    pub fn read_u32(&self, offset: u64) -> Result<u32> {
        self.memory.read_u32(offset)
    }

    /// Write one 32-bit word
    pub fn write_u32(&self, offset: u64, value: u32) -> Result<()> {
        self.memory.write_u32(offset, value)
    }

    /// Read a little-endian 64-bit value
    pub fn read_u64(&self, offset: u64) -> Result<u64> {
        let lo = self.memory.read_u32(offset)?;
        let hi = self.memory.read_u32(offset + 4)?;
        Ok(((hi as u64) << 32) | lo as u64)
    }

    /// Write a little-endian 64-bit value
    pub fn write_u64(&self, offset: u64, value: u64) -> Result<()> {
        self.memory.write_u32(offset, value as u32)?;
        self.memory.write_u32(offset + 4, (value >> 32) as u32)
    }

    /// Copy consecutive words in starting at `offset`
    pub fn write_words(&self, offset: u64, words: &[u32]) -> Result<()> {
        let end = offset + words.len() as u64 * 4;
        if end > self.size().as_bytes() {
            return Err(Error::MappingFailed);
        }
        for (i, word) in words.iter().enumerate() {
            self.memory.write_u32(offset + i as u64 * 4, *word)?;
        }
        Ok(())
    }

    /// Copy consecutive words out starting at `offset`
    pub fn read_words(&self, offset: u64, out: &mut [u32]) -> Result<()> {
        for (i, word) in out.iter_mut().enumerate() {
            *word = self.memory.read_u32(offset + i as u64 * 4)?;
        }
        Ok(())
    }

    /// Fill the whole mapping with `value`
    pub fn fill(&self, value: u32) -> Result<()> {
        let words = self.size().as_words();
        for i in 0..words {
            self.memory.write_u32(i * 4, value)?;
        }
        Ok(())
    }
}

impl fmt::Debug for CpuMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CpuMapping")
            .field("bo", &self.bo)
            .field("size", &self.memory.size())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct VecMemory(Mutex<Vec<u32>>);

    impl MappedMemory for VecMemory {
        fn size(&self) -> ByteSize {
            ByteSize::from_bytes(self.0.lock().unwrap().len() as u64 * 4)
        }

        fn read_u32(&self, offset: u64) -> Result<u32> {
            self.0
                .lock()
                .unwrap()
                .get((offset / 4) as usize)
                .copied()
                .ok_or(Error::MappingFailed)
        }

        fn write_u32(&self, offset: u64, value: u32) -> Result<()> {
            let mut words = self.0.lock().unwrap();
            let slot = words.get_mut((offset / 4) as usize).ok_or(Error::MappingFailed)?;
            *slot = value;
            Ok(())
        }
    }

    fn mapping(words: usize) -> CpuMapping {
        CpuMapping::new(
            BufferHandle::new(1),
            Arc::new(VecMemory(Mutex::new(vec![0; words]))),
        )
    }

    #[test]
    fn test_access_join_never_downgrades() {
        use Access::*;
        assert_eq!(Read.join(Read), Read);
        assert_eq!(Read.join(Write), Write);
        assert_eq!(Write.join(Read), Write);
        assert_eq!(Write.join(Write), Write);
    }

    #[test]
    fn test_va_range_relations() {
        let a = VaRange::new(GpuAddr::new(0x1000), ByteSize::PAGE);
        let b = VaRange::new(GpuAddr::new(0x1800), ByteSize::PAGE);
        let c = VaRange::new(GpuAddr::new(0x2000), ByteSize::PAGE);
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c));
        assert!(a.contains(GpuAddr::new(0x1fff)));
        assert!(!a.contains(GpuAddr::new(0x2000)));
        let outer = VaRange::new(GpuAddr::new(0x1000), ByteSize::from_kib(8));
        assert!(outer.encloses(&c));
    }

    #[test]
    fn test_mapping_words_and_qwords() {
        let map = mapping(4);
        map.write_u64(0, 0x1122_3344_5566_7788).unwrap();
        assert_eq!(map.read_u32(0).unwrap(), 0x5566_7788);
        assert_eq!(map.read_u32(4).unwrap(), 0x1122_3344);
        assert_eq!(map.read_u64(0).unwrap(), 0x1122_3344_5566_7788);

        assert_eq!(map.write_words(8, &[1, 2, 3]), Err(Error::MappingFailed));
        map.fill(0xdead_beef).unwrap();
        let mut out = [0u32; 4];
        map.read_words(0, &mut out).unwrap();
        assert_eq!(out, [0xdead_beef; 4]);
    }
}
