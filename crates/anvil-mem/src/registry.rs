//! # Buffer Object Registry
//!
//! Tracks every buffer object the batch layer knows about: its size, its
//! device-virtual binding, its CPU mapping and how many batches hold it.
//!
//! Addresses chosen by the registry come out of an arena reserved from the
//! device at construction. Objects may also be placed by the device itself
//! (relocation mode), in which case the registry merely records where.

use core::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use hashbrown::HashMap;
use spin::{Mutex, RwLock};

use anvil_core::{
    AllocDesc, BufferHandle, ByteSize, CpuMapping, DeviceHandle, Error, GpuAddr, HandleKind, Heap,
    Result, TilingTag, VaRange,
};

use crate::address_space::AddressSpace;

// =============================================================================
// CONFIGURATION
// =============================================================================

/// Registry configuration
#[derive(Debug, Clone, Copy)]
pub struct RegistryConfig {
    /// Size of the VA arena reserved from the device
    pub arena_size: ByteSize,
    /// Alignment of the arena reservation
    pub arena_alignment: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            arena_size: ByteSize::from_gib(4),
            arena_alignment: 1 << 21,
        }
    }
}

// =============================================================================
// BUFFER OBJECT
// =============================================================================

/// Who chose an object's address
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingOrigin {
    /// First fit in the registry arena
    Arena,
    /// Caller-chosen address inside the arena
    Pinned,
    /// Device placement reported after a submission
    Device,
}

/// An object's current device-virtual binding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Binding {
    /// Bound range
    pub range: VaRange,
    /// Who chose the address
    pub origin: BindingOrigin,
    /// Registry-wide serial, unique per binding event
    pub serial: u64,
}

impl Binding {
    /// Start address
    pub fn addr(&self) -> GpuAddr {
        self.range.start
    }
}

/// A tracked buffer object
#[derive(Debug)]
struct BufferObject {
    size: ByteSize,
    alignment: u64,
    heap: Heap,
    tiling: TilingTag,
    binding: Option<Binding>,
    mapping: Option<CpuMapping>,
    /// Batches currently referencing the object
    holds: u32,
}

/// Registry statistics
#[derive(Debug, Clone, Default)]
pub struct RegistryStats {
    /// Live objects
    pub objects: usize,
    /// Objects with a binding
    pub bound: usize,
    /// Objects with a CPU mapping
    pub mapped: usize,
    /// Total bytes of live objects
    pub bytes: u64,
    /// Arena space still available to first fit
    pub arena_free: ByteSize,
}

// =============================================================================
// REGISTRY
// =============================================================================

/// Buffer object registry
///
/// Lock order is objects before address space.
pub struct Registry<D: DeviceHandle> {
    device: Arc<D>,
    arena: VaRange,
    space: Mutex<AddressSpace>,
    objects: RwLock<HashMap<BufferHandle, BufferObject>>,
    serial: AtomicU64,
}

impl<D: DeviceHandle> Registry<D> {
    /// Create a registry, reserving its VA arena from the device
    pub fn new(device: Arc<D>, config: RegistryConfig) -> Result<Self> {
        let arena = device
            .reserve_va(config.arena_size, config.arena_alignment)
            .map_err(|e| {
                log::warn!("registry: arena reservation of {} failed: {}", config.arena_size, e);
                Error::AddressBindingFailed
            })?;
        log::debug!("registry: arena {}", arena);

        Ok(Self {
            device,
            arena,
            space: Mutex::new(AddressSpace::new(arena)),
            objects: RwLock::new(HashMap::new()),
            serial: AtomicU64::new(0),
        })
    }

    /// Underlying device
    pub fn device(&self) -> &Arc<D> {
        &self.device
    }

    /// Reserved arena
    pub fn arena(&self) -> VaRange {
        self.arena
    }

    // -------------------------------------------------------------------------
    // Lifetime
    // -------------------------------------------------------------------------

    /// Allocate and register a buffer object
    pub fn create(&self, desc: &AllocDesc) -> Result<BufferHandle> {
        let bo = self.device.alloc(desc)?;
        self.objects.write().insert(bo, BufferObject {
            size: desc.size,
            alignment: desc.alignment,
            heap: desc.heap,
            tiling: desc.tiling,
            binding: None,
            mapping: None,
            holds: 0,
        });
        log::debug!("registry: created {:?} ({}, {:?})", bo, desc.size, desc.heap);
        Ok(bo)
    }

    /// Unmap, unbind and free a buffer object
    ///
    /// Fails with `InvalidHandleUse` while any batch still holds it.
    pub fn destroy(&self, bo: BufferHandle) -> Result<()> {
        let mut objects = self.objects.write();
        let obj = objects.get(&bo).ok_or(Error::NotFound)?;
        if obj.holds > 0 {
            log::warn!("registry: destroy of {:?} with {} holds", bo, obj.holds);
            return Err(HandleKind::Buffer.into());
        }

        if let Some(obj) = objects.get_mut(&bo) {
            if obj.mapping.take().is_some() {
                self.device.unmap(bo)?;
            }
            self.drop_binding(bo, obj, true)?;
        }
        self.device.free(bo)?;
        objects.remove(&bo);
        log::debug!("registry: destroyed {:?}", bo);
        self.log_stats(&objects);
        Ok(())
    }

    /// Whether `bo` is registered
    pub fn contains(&self, bo: BufferHandle) -> bool {
        self.objects.read().contains_key(&bo)
    }

    /// Size of a buffer object
    pub fn size(&self, bo: BufferHandle) -> Result<ByteSize> {
        self.with(bo, |obj| obj.size)
    }

    /// Tiling tag of a buffer object
    pub fn tiling(&self, bo: BufferHandle) -> Result<TilingTag> {
        self.with(bo, |obj| obj.tiling)
    }

    /// Heap of a buffer object
    pub fn heap(&self, bo: BufferHandle) -> Result<Heap> {
        self.with(bo, |obj| obj.heap)
    }

    // -------------------------------------------------------------------------
    // CPU mapping
    // -------------------------------------------------------------------------

    /// Map a buffer object, reusing an existing mapping
    pub fn map(&self, bo: BufferHandle) -> Result<CpuMapping> {
        let mut objects = self.objects.write();
        let obj = objects.get_mut(&bo).ok_or(Error::NotFound)?;
        if let Some(mapping) = &obj.mapping {
            return Ok(mapping.clone());
        }
        let mapping = self.device.map(bo)?;
        obj.mapping = Some(mapping.clone());
        Ok(mapping)
    }

    /// Drop a buffer object's CPU mapping
    pub fn unmap(&self, bo: BufferHandle) -> Result<()> {
        let mut objects = self.objects.write();
        let obj = objects.get_mut(&bo).ok_or(Error::NotFound)?;
        if obj.mapping.take().is_none() {
            return Err(HandleKind::Mapping.into());
        }
        self.device.unmap(bo)
    }

    /// Create, bind and map in one step
    ///
    /// Partial progress is undone on failure.
    pub fn alloc_and_map(&self, desc: &AllocDesc) -> Result<(BufferHandle, CpuMapping, GpuAddr)> {
        let bo = self.create(desc)?;

        let addr = match self.bind(bo) {
            Ok(addr) => addr,
            Err(e) => {
                self.unwind(bo);
                return Err(e);
            }
        };

        match self.map(bo) {
            Ok(mapping) => Ok((bo, mapping, addr)),
            Err(e) => {
                self.unwind(bo);
                Err(e)
            }
        }
    }

    fn unwind(&self, bo: BufferHandle) {
        if let Err(e) = self.destroy(bo) {
            log::warn!("registry: unwinding {:?} failed: {}", bo, e);
        }
    }

    /// Inverse of [`alloc_and_map`](Self::alloc_and_map)
    pub fn unmap_and_free(&self, bo: BufferHandle) -> Result<()> {
        self.unmap(bo)?;
        self.destroy(bo)
    }

    // -------------------------------------------------------------------------
    // Binding
    // -------------------------------------------------------------------------

    /// Bind by first fit, or return the existing binding's address
    pub fn bind(&self, bo: BufferHandle) -> Result<GpuAddr> {
        let mut objects = self.objects.write();
        let obj = objects.get_mut(&bo).ok_or(Error::NotFound)?;
        if let Some(binding) = obj.binding {
            return Ok(binding.addr());
        }

        let range = self
            .space
            .lock()
            .allocate(obj.size, obj.alignment)
            .map_err(|_| Error::AddressBindingFailed)?;
        self.attach(bo, obj, range, BindingOrigin::Arena)
    }

    /// Bind at exactly `addr`, moving an existing binding if needed
    pub fn bind_at(&self, bo: BufferHandle, addr: GpuAddr) -> Result<GpuAddr> {
        let mut objects = self.objects.write();
        let obj = objects.get_mut(&bo).ok_or(Error::NotFound)?;
        if let Some(binding) = obj.binding {
            if binding.addr() == addr {
                return Ok(addr);
            }
            self.drop_binding(bo, obj, true)?;
        }

        let wanted = VaRange::new(addr, obj.size.align_up(ByteSize::PAGE.as_bytes()));
        let range = self.space.lock().allocate_at(wanted).map_err(|e| match e {
            Error::MisalignedAddress => e,
            _ => Error::AddressBindingFailed,
        })?;
        self.attach(bo, obj, range, BindingOrigin::Pinned)
    }

    /// Move an object to a fresh first-fit address
    pub fn rebind(&self, bo: BufferHandle) -> Result<GpuAddr> {
        {
            let mut objects = self.objects.write();
            let obj = objects.get_mut(&bo).ok_or(Error::NotFound)?;
            self.drop_binding(bo, obj, true)?;
        }
        let addr = self.bind(bo)?;
        log::debug!("registry: rebound {:?} at {}", bo, addr);
        Ok(addr)
    }

    /// Drop an object's binding
    pub fn unbind(&self, bo: BufferHandle) -> Result<()> {
        let mut objects = self.objects.write();
        let obj = objects.get_mut(&bo).ok_or(Error::NotFound)?;
        self.drop_binding(bo, obj, true)
    }

    /// Record where the device placed an object
    ///
    /// Returns the binding serial in effect afterwards.
    pub fn note_placement(&self, bo: BufferHandle, addr: GpuAddr) -> Result<u64> {
        let mut objects = self.objects.write();
        let obj = objects.get_mut(&bo).ok_or(Error::NotFound)?;
        if let Some(binding) = obj.binding {
            if binding.addr() == addr {
                return Ok(binding.serial);
            }
            // The device already moved it; only our bookkeeping is stale.
            self.drop_binding(bo, obj, false)?;
        }

        let range = VaRange::new(addr, obj.size);
        let serial = self.next_serial();
        obj.binding = Some(Binding {
            range,
            origin: BindingOrigin::Device,
            serial,
        });
        log::debug!("registry: device placed {:?} at {}", bo, addr);
        Ok(serial)
    }

    /// Current address of an object, if bound
    pub fn address(&self, bo: BufferHandle) -> Result<Option<GpuAddr>> {
        self.with(bo, |obj| obj.binding.map(|b| b.addr()))
    }

    /// Current binding of an object, if bound
    pub fn binding(&self, bo: BufferHandle) -> Result<Option<Binding>> {
        self.with(bo, |obj| obj.binding)
    }

    /// Make every address handed out so far unavailable to first fit
    pub fn raise_floor(&self) {
        self.space.lock().raise_floor();
    }

    fn attach(
        &self,
        bo: BufferHandle,
        obj: &mut BufferObject,
        range: VaRange,
        origin: BindingOrigin,
    ) -> Result<GpuAddr> {
        if let Err(e) = self.device.bind(bo, range.start) {
            log::warn!("registry: device bind of {:?} at {} failed: {}", bo, range.start, e);
            let _ = self.space.lock().free(range);
            return Err(Error::AddressBindingFailed);
        }

        let serial = self.next_serial();
        obj.binding = Some(Binding { range, origin, serial });
        log::debug!("registry: bound {:?} at {} ({:?})", bo, range.start, origin);
        Ok(range.start)
    }

    fn drop_binding(&self, bo: BufferHandle, obj: &mut BufferObject, on_device: bool) -> Result<()> {
        let Some(binding) = obj.binding.take() else {
            return Ok(());
        };
        if on_device {
            self.device.unbind(bo)?;
        }
        if binding.origin != BindingOrigin::Device {
            self.space.lock().free(binding.range)?;
        }
        log::trace!("registry: unbound {:?} from {}", bo, binding.addr());
        Ok(())
    }

    fn next_serial(&self) -> u64 {
        self.serial.fetch_add(1, Ordering::Relaxed) + 1
    }

    // -------------------------------------------------------------------------
    // Batch holds
    // -------------------------------------------------------------------------

    /// Note that a batch references `bo`
    pub fn hold(&self, bo: BufferHandle) -> Result<()> {
        let mut objects = self.objects.write();
        let obj = objects.get_mut(&bo).ok_or(Error::NotFound)?;
        obj.holds += 1;
        Ok(())
    }

    /// Undo one [`hold`](Self::hold)
    pub fn release_hold(&self, bo: BufferHandle) -> Result<()> {
        let mut objects = self.objects.write();
        let obj = objects.get_mut(&bo).ok_or(Error::NotFound)?;
        if obj.holds == 0 {
            return Err(HandleKind::Buffer.into());
        }
        obj.holds -= 1;
        Ok(())
    }

    /// Number of batches holding `bo`
    pub fn holds(&self, bo: BufferHandle) -> Result<u32> {
        self.with(bo, |obj| obj.holds)
    }

    // -------------------------------------------------------------------------
    // Introspection
    // -------------------------------------------------------------------------

    /// Get statistics
    pub fn stats(&self) -> RegistryStats {
        let objects = self.objects.read();
        self.collect_stats(&objects)
    }

    fn collect_stats(&self, objects: &HashMap<BufferHandle, BufferObject>) -> RegistryStats {
        RegistryStats {
            objects: objects.len(),
            bound: objects.values().filter(|o| o.binding.is_some()).count(),
            mapped: objects.values().filter(|o| o.mapping.is_some()).count(),
            bytes: objects.values().map(|o| o.size.as_bytes()).sum(),
            arena_free: self.space.lock().free_space(),
        }
    }

    #[cfg(feature = "debug-alloc")]
    fn log_stats(&self, objects: &HashMap<BufferHandle, BufferObject>) {
        log::debug!("registry: {:?}", self.collect_stats(objects));
    }

    #[cfg(not(feature = "debug-alloc"))]
    fn log_stats(&self, _objects: &HashMap<BufferHandle, BufferObject>) {}

    fn with<T>(&self, bo: BufferHandle, f: impl FnOnce(&BufferObject) -> T) -> Result<T> {
        self.objects.read().get(&bo).map(f).ok_or(Error::NotFound)
    }
}

impl<D: DeviceHandle> core::fmt::Debug for Registry<D> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Registry")
            .field("arena", &self.arena)
            .field("objects", &self.objects.read().len())
            .finish()
    }
}

impl<D: DeviceHandle> Drop for Registry<D> {
    fn drop(&mut self) {
        let objects = core::mem::take(&mut *self.objects.write());
        for (bo, mut obj) in objects {
            if obj.mapping.take().is_some() {
                let _ = self.device.unmap(bo);
            }
            if obj.binding.take().is_some() {
                let _ = self.device.unbind(bo);
            }
            if let Err(e) = self.device.free(bo) {
                log::warn!("registry: leaking {:?}: {}", bo, e);
            }
        }
        if let Err(e) = self.device.release_va(self.arena) {
            log::warn!("registry: arena release failed: {}", e);
        }
    }
}
