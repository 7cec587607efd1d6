//! Object backing store shared between CPU mappings and the engines.

use core::sync::atomic::{AtomicU32, Ordering};

use anvil_core::{ByteSize, Error, MappedMemory, Result};

/// Word-addressed memory of one buffer object
#[derive(Debug)]
pub struct SimMemory {
    words: Box<[AtomicU32]>,
}

impl SimMemory {
    /// Zeroed memory of `size`, rounded up to whole words
    pub fn new(size: ByteSize) -> Self {
        Self::filled(size, 0)
    }

    /// Memory of `size` with every word set to `value`
    pub fn filled(size: ByteSize, value: u32) -> Self {
        let words = size.as_bytes().div_ceil(4) as usize;
        Self {
            words: (0..words).map(|_| AtomicU32::new(value)).collect(),
        }
    }

    fn slot(&self, offset: u64) -> Result<&AtomicU32> {
        if offset % 4 != 0 {
            return Err(Error::MisalignedAddress);
        }
        self.words.get((offset / 4) as usize).ok_or(Error::MappingFailed)
    }

    /// Length in bytes
    pub fn len_bytes(&self) -> u64 {
        self.words.len() as u64 * 4
    }
}

impl MappedMemory for SimMemory {
    fn size(&self) -> ByteSize {
        ByteSize::from_bytes(self.len_bytes())
    }

    fn read_u32(&self, offset: u64) -> Result<u32> {
        Ok(self.slot(offset)?.load(Ordering::Acquire))
    }

    fn write_u32(&self, offset: u64, value: u32) -> Result<()> {
        self.slot(offset)?.store(value, Ordering::Release);
        Ok(())
    }
}
