//! # Offset Cache
//!
//! Last-known device-virtual address per object, tagged with the
//! generation it was recorded in.
//!
//! Purging does not delete anything. It bumps the generation, and every
//! entry recorded under an older generation stops being valid at once.
//! Readers compare generations, so they can never observe a half-cleared
//! cache.

use core::sync::atomic::{AtomicU64, Ordering};

use hashbrown::HashMap;
use spin::RwLock;

use anvil_core::{BufferHandle, GpuAddr};

/// A recorded address
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CachedOffset {
    /// Address the object was observed at
    pub addr: GpuAddr,
    /// Registry binding serial at the time of recording
    pub serial: u64,
}

/// Result of a cache lookup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lookup {
    /// Valid entry for the current generation
    Hit(CachedOffset),
    /// Entry recorded before the last purge
    Stale(CachedOffset),
    /// Object never recorded
    Miss,
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    offset: CachedOffset,
    generation: u64,
}

/// Generation-tagged object address cache
#[derive(Debug)]
pub struct OffsetCache {
    generation: AtomicU64,
    entries: RwLock<HashMap<BufferHandle, Entry>>,
}

impl OffsetCache {
    /// Create an empty cache
    pub fn new() -> Self {
        Self {
            generation: AtomicU64::new(1),
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Current generation
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Look an object up
    pub fn lookup(&self, bo: BufferHandle) -> Lookup {
        let generation = self.generation();
        match self.entries.read().get(&bo) {
            Some(e) if e.generation == generation => Lookup::Hit(e.offset),
            Some(e) => Lookup::Stale(e.offset),
            None => Lookup::Miss,
        }
    }

    /// Valid address for an object, if any
    pub fn get(&self, bo: BufferHandle) -> Option<GpuAddr> {
        match self.lookup(bo) {
            Lookup::Hit(offset) => Some(offset.addr),
            _ => None,
        }
    }

    /// Record an address under the current generation
    pub fn record(&self, bo: BufferHandle, addr: GpuAddr, serial: u64) {
        let mut entries = self.entries.write();
        let generation = self.generation();
        log::trace!("offset cache: {:?} -> {} (gen {})", bo, addr, generation);
        entries.insert(bo, Entry {
            offset: CachedOffset { addr, serial },
            generation,
        });
    }

    /// Invalidate every entry; returns the new generation
    pub fn purge(&self) -> u64 {
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        log::debug!("offset cache purged, generation {}", generation);
        generation
    }

    /// Number of valid entries
    pub fn len(&self) -> usize {
        let generation = self.generation();
        self.entries
            .read()
            .values()
            .filter(|e| e.generation == generation)
            .count()
    }

    /// Whether no entry is valid
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for OffsetCache {
    fn default() -> Self {
        Self::new()
    }
}
