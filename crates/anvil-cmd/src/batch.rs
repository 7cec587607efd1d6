//! # Batch Builder
//!
//! An append-only command stream with a write cursor, a fixed capacity and
//! an ordered dependency list.
//!
//! ```text
//!   words:  [ hdr | addr lo | addr hi | ... | END | NOOP ]
//!                  └─ reloc site ─┘                 ▲
//!                                                  cursor
//!   deps:   [ (bo A, Read), (bo B, Write, pinned @ 0x...) ]
//!   cache:  bo -> (addr, generation)
//! ```
//!
//! Nothing here touches the device until submission, except allocating the
//! batch's own buffer object at construction.

use std::sync::Arc;

use anvil_core::{
    Access, AllocDesc, BufferHandle, ByteSize, CpuMapping, Destroyable, Device, Dialect, Domains,
    Error, FenceHandle, GpuAddr, HandleKind, Heap, Result,
};
use anvil_mem::{OffsetCache, Registry};

use crate::fence::{Coordinator, FenceStatus, Timeout};

// =============================================================================
// CONFIGURATION
// =============================================================================

/// How addresses reach the command stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum AddressingMode {
    /// The device patches address fields from relocation entries
    Relocation,
    /// The batch writes final addresses itself (softpin)
    #[default]
    Absolute,
}

/// Batch configuration
#[derive(Debug, Clone, Copy)]
pub struct BatchConfig {
    /// Capacity of the command stream
    pub capacity: ByteSize,
    /// Addressing mode
    pub mode: AddressingMode,
    /// Padding and end-marker words
    pub dialect: Dialect,
    /// Heap for the batch's own buffer object
    pub heap: Heap,
}

impl BatchConfig {
    /// Default configuration with the given addressing mode
    pub fn with_mode(mode: AddressingMode) -> Self {
        Self {
            mode,
            ..Self::default()
        }
    }
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            capacity: ByteSize::PAGE,
            mode: AddressingMode::default(),
            dialect: Dialect::default(),
            heap: Heap::System,
        }
    }
}

// =============================================================================
// DEPENDENCIES AND RELOCATION SITES
// =============================================================================

/// An object referenced by the batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dependency {
    /// Referenced object
    pub bo: BufferHandle,
    /// Access mode, merged upward on re-registration
    pub access: Access,
    /// Caller-chosen address, if pinned
    pub pin: Option<GpuAddr>,
}

/// A 64-bit address field in the stream awaiting resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelocSite {
    /// Byte offset of the field within the batch
    pub offset: u64,
    /// Object whose address belongs in the field
    pub target: BufferHandle,
    /// Added to the target address
    pub delta: u64,
    /// Read domain hints
    pub read_domains: Domains,
    /// Write domain hint
    pub write_domain: Domains,
}

// =============================================================================
// BATCH
// =============================================================================

/// A command batch
pub struct Batch<D: Device> {
    pub(crate) registry: Arc<Registry<D>>,
    pub(crate) coordinator: Arc<Coordinator<D>>,
    pub(crate) config: BatchConfig,
    pub(crate) bo: BufferHandle,
    pub(crate) mapping: CpuMapping,
    pub(crate) words: Vec<u32>,
    capacity_words: usize,
    pub(crate) deps: Vec<Dependency>,
    /// Holds from before a reset, kept until `last_fence` expires
    parked: Vec<BufferHandle>,
    pub(crate) sites: Vec<RelocSite>,
    pub(crate) cache: OffsetCache,
    pub(crate) last_fence: Option<FenceHandle>,
    destroyed: bool,
}

impl<D: Device> Batch<D> {
    /// Create a batch and its backing buffer object
    pub fn new(
        registry: Arc<Registry<D>>,
        coordinator: Arc<Coordinator<D>>,
        config: BatchConfig,
    ) -> Result<Self> {
        let capacity = config.capacity.as_bytes();
        if capacity < 8 || capacity % 4 != 0 {
            return Err(Error::InvalidParameter);
        }

        let bo = registry.create(&AllocDesc::new(config.capacity).with_heap(config.heap))?;
        let mapping = match registry.map(bo) {
            Ok(mapping) => mapping,
            Err(e) => {
                let _ = registry.destroy(bo);
                return Err(e);
            }
        };
        log::debug!("batch {:?}: created, {} ({:?})", bo, config.capacity, config.mode);

        let capacity_words = (capacity / 4) as usize;
        Ok(Self {
            registry,
            coordinator,
            config,
            bo,
            mapping,
            words: Vec::with_capacity(capacity_words),
            capacity_words,
            deps: Vec::new(),
            parked: Vec::new(),
            sites: Vec::new(),
            cache: OffsetCache::new(),
            last_fence: None,
            destroyed: false,
        })
    }

    pub(crate) fn ensure_live(&self) -> Result<()> {
        if self.destroyed {
            return Err(HandleKind::Batch.into());
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Stream building
    // -------------------------------------------------------------------------

    /// Append one command word
    pub fn append(&mut self, word: u32) -> Result<()> {
        self.ensure_live()?;
        if self.words.len() >= self.capacity_words {
            return Err(Error::CapacityExceeded);
        }
        self.words.push(word);
        Ok(())
    }

    /// Append several words, all or nothing
    pub fn append_slice(&mut self, words: &[u32]) -> Result<()> {
        self.ensure_live()?;
        if self.words.len() + words.len() > self.capacity_words {
            return Err(Error::CapacityExceeded);
        }
        self.words.extend_from_slice(words);
        Ok(())
    }

    /// Pad with no-ops until the cursor is a multiple of `n` words
    pub fn align_cursor(&mut self, n: usize) -> Result<()> {
        self.ensure_live()?;
        if n == 0 {
            return Err(Error::InvalidParameter);
        }
        let pad = (n - self.words.len() % n) % n;
        if self.words.len() + pad > self.capacity_words {
            return Err(Error::CapacityExceeded);
        }
        let noop = self.config.dialect.noop;
        self.words.resize(self.words.len() + pad, noop);
        Ok(())
    }

    /// Append the end marker and align the stream end
    ///
    /// A marker that lands in the last slot needs no padding.
    pub fn emit_end(&mut self) -> Result<()> {
        self.append(self.config.dialect.end)?;
        if self.words.len() == self.capacity_words {
            return Ok(());
        }
        self.align_cursor(self.config.dialect.end_align)
    }

    /// Emit a 64-bit address field for `target` at the cursor
    ///
    /// The field holds a placeholder until submission resolves it. The
    /// target becomes a dependency, writable if `write_domain` is set.
    /// Returns the byte offset of the field.
    pub fn emit_reloc(
        &mut self,
        target: BufferHandle,
        delta: u64,
        read_domains: Domains,
        write_domain: Domains,
    ) -> Result<u64> {
        self.ensure_live()?;
        if self.words.len() + 2 > self.capacity_words {
            return Err(Error::CapacityExceeded);
        }
        if target != self.bo {
            self.add_dependency(target, !write_domain.is_empty())?;
        }

        let offset = self.offset();
        self.sites.push(RelocSite {
            offset,
            target,
            delta,
            read_domains,
            write_domain,
        });
        let placeholder = self.cache.get(target).map_or(GpuAddr::null(), |a| a + delta);
        self.words.push(placeholder.lower());
        self.words.push(placeholder.upper());
        Ok(offset)
    }

    // -------------------------------------------------------------------------
    // Dependencies
    // -------------------------------------------------------------------------

    /// Register `bo` as referenced by this batch
    ///
    /// Registering an object again only ever upgrades its access mode.
    pub fn add_dependency(&mut self, bo: BufferHandle, writable: bool) -> Result<()> {
        self.register(bo, Access::from_writable(writable), None)
    }

    /// Register `bo` at a caller-chosen address
    ///
    /// Pinned objects keep their address across purges.
    pub fn add_pinned(&mut self, bo: BufferHandle, addr: GpuAddr, writable: bool) -> Result<()> {
        if !addr.is_aligned(ByteSize::PAGE.as_bytes()) {
            return Err(Error::MisalignedAddress);
        }
        self.register(bo, Access::from_writable(writable), Some(addr))
    }

    fn register(&mut self, bo: BufferHandle, access: Access, pin: Option<GpuAddr>) -> Result<()> {
        self.ensure_live()?;
        if bo == self.bo {
            return Err(Error::InvalidParameter);
        }
        if let Some(dep) = self.deps.iter_mut().find(|d| d.bo == bo) {
            dep.access = dep.access.join(access);
            if pin.is_some() {
                dep.pin = pin;
            }
            return Ok(());
        }

        self.registry.hold(bo)?;
        self.deps.push(Dependency { bo, access, pin });
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Reset and completion
    // -------------------------------------------------------------------------

    /// Rewind the cursor and clear the dependency set
    ///
    /// With `purge`, every cached address is invalidated and the next
    /// absolute-mode build assigns addresses never used before. Objects the
    /// last submission still uses stay held until it completes.
    pub fn reset(&mut self, purge: bool) -> Result<()> {
        self.ensure_live()?;
        self.words.clear();
        self.sites.clear();
        if self.outstanding() {
            self.parked.extend(self.deps.drain(..).map(|d| d.bo));
            log::debug!("batch {:?}: {} holds parked until completion", self.bo, self.parked.len());
        } else {
            self.release_deps();
        }
        self.settle();
        if purge {
            self.cache.purge();
            self.registry.raise_floor();
        }
        log::debug!("batch {:?}: reset (purge: {})", self.bo, purge);
        Ok(())
    }

    fn release_deps(&mut self) {
        let held: Vec<BufferHandle> = self.deps.drain(..).map(|d| d.bo).collect();
        self.release(held);
    }

    fn release(&self, held: Vec<BufferHandle>) {
        for bo in held {
            if let Err(e) = self.registry.release_hold(bo) {
                log::warn!("batch {:?}: releasing {:?}: {}", self.bo, bo, e);
            }
        }
    }

    /// Drop parked holds once the last submission has completed
    pub(crate) fn settle(&mut self) {
        if self.parked.is_empty() || self.outstanding() {
            return;
        }
        let parked = core::mem::take(&mut self.parked);
        self.release(parked);
    }

    /// Wait for the last submission of this batch
    pub fn sync(&mut self, timeout: Timeout) -> Result<FenceStatus> {
        let status = match &self.last_fence {
            Some(fence) => self.coordinator.wait(fence, timeout)?,
            None => FenceStatus::Expired,
        };
        if status == FenceStatus::Expired {
            self.settle();
        }
        Ok(status)
    }

    fn outstanding(&self) -> bool {
        match &self.last_fence {
            Some(fence) => !self.coordinator.is_expired(fence).unwrap_or(false),
            None => false,
        }
    }

    fn teardown(&mut self) -> Result<()> {
        self.release_deps();
        let parked = core::mem::take(&mut self.parked);
        self.release(parked);
        self.registry.unmap(self.bo)?;
        self.registry.destroy(self.bo)?;
        self.destroyed = true;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    /// The batch's own buffer object
    pub fn handle(&self) -> BufferHandle {
        self.bo
    }

    /// Command words written so far
    pub fn words(&self) -> &[u32] {
        &self.words
    }

    /// Cursor position in words
    pub fn cursor(&self) -> usize {
        self.words.len()
    }

    /// Cursor position in bytes
    pub fn offset(&self) -> u64 {
        self.words.len() as u64 * 4
    }

    /// Capacity in words
    pub fn capacity_words(&self) -> usize {
        self.capacity_words
    }

    /// Addressing mode
    pub fn mode(&self) -> AddressingMode {
        self.config.mode
    }

    /// Command dialect
    pub fn dialect(&self) -> &Dialect {
        &self.config.dialect
    }

    /// Registered dependencies, in registration order
    pub fn dependencies(&self) -> &[Dependency] {
        &self.deps
    }

    /// Pending address fields
    pub fn reloc_sites(&self) -> &[RelocSite] {
        &self.sites
    }

    /// Completion handle of the last submission
    pub fn last_fence(&self) -> Option<FenceHandle> {
        self.last_fence
    }

    /// Whether the stream ends with the end marker
    pub fn is_terminated(&self) -> bool {
        self.config.dialect.is_terminated(&self.words)
    }

    /// Last known address of `bo`, `None` if never observed or purged
    pub fn object_offset(&self, bo: BufferHandle) -> Option<GpuAddr> {
        self.cache.get(bo)
    }

    /// Whether the cached address of `bo` matches the registry's binding
    pub fn offset_agrees(&self, bo: BufferHandle) -> Result<bool> {
        Ok(self.cache.get(bo) == self.registry.address(bo)?)
    }

    /// Address cache of this batch
    pub fn cache(&self) -> &OffsetCache {
        &self.cache
    }
}

impl<D: Device> Destroyable for Batch<D> {
    fn destroy(&mut self) -> Result<()> {
        self.ensure_live()?;
        if self.outstanding() {
            log::warn!("batch {:?}: destroy with submission outstanding", self.bo);
            return Err(HandleKind::Batch.into());
        }
        self.teardown()?;
        log::debug!("batch {:?}: destroyed", self.bo);
        Ok(())
    }

    fn is_destroyed(&self) -> bool {
        self.destroyed
    }
}

impl<D: Device> Drop for Batch<D> {
    fn drop(&mut self) {
        if self.destroyed {
            return;
        }
        if self.outstanding() {
            log::warn!("batch {:?}: dropped while executing, leaking its buffer", self.bo);
            return;
        }
        if let Err(e) = self.teardown() {
            log::warn!("batch {:?}: cleanup failed: {}", self.bo, e);
        }
    }
}

impl<D: Device> core::fmt::Debug for Batch<D> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Batch")
            .field("bo", &self.bo)
            .field("mode", &self.config.mode)
            .field("cursor", &self.words.len())
            .field("deps", &self.deps.len())
            .field("parked", &self.parked.len())
            .field("last_fence", &self.last_fence)
            .finish()
    }
}
