//! # Reference Device
//!
//! A software device implementing the ANVIL device traits. Objects are
//! plain word arrays, bindings live in a sorted map, and every
//! (context, engine) queue is executed by its own thread.
//!
//! ## Address Layout
//!
//! ```text
//!  va_range.start                   midpoint                 va_range.end
//!       │  device placements (bump)    │  client reservations (bump)  │
//!       └──────────────────────────────┴──────────────────────────────┘
//! ```
//!
//! Neither region ever reuses an address.

use std::collections::BTreeMap;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use hashbrown::{HashMap, HashSet};

use anvil_core::{
    AllocDesc, AllocFlags, BufferHandle, ByteSize, ContextId, ContextPrimitive, CpuMapping, DeviceHandle,
    DeviceInfo, EngineMask, Error, Fragment, GpuAddr, HandleKind, Heap, MappedMemory, QueueId, RawSubmission,
    RejectReason, ResourceFlags, Result, SeqNo, SubmitPrimitive, SubmitReceipt, VaRange,
};

use crate::isa;
use crate::memory::SimMemory;
use crate::queue::{Job, QueueWorker};

const PAGE: u64 = 4096;

/// Initial contents of objects allocated without `ZEROED`
pub const POISON: u32 = 0xdead_beef;

// =============================================================================
// CONFIGURATION
// =============================================================================

/// Reference device configuration
#[derive(Debug, Clone, Copy)]
pub struct SimConfig {
    /// Reported family id
    pub family: u32,
    /// Engine classes present
    pub engines: EngineMask,
    /// Instances per engine class
    pub instances: u8,
    /// Usable virtual address range
    pub va_range: VaRange,
    /// Device-local memory available to `Heap::Vram` objects
    pub vram: ByteSize,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            family: 0x0a1f,
            engines: EngineMask::all(),
            instances: 2,
            va_range: VaRange::new(GpuAddr::new(0x10_0000), ByteSize::from_bytes((1 << 47) - 0x10_0000)),
            vram: ByteSize::from_mib(256),
        }
    }
}

// =============================================================================
// SHARED STATE
// =============================================================================

#[derive(Debug)]
pub(crate) struct SimObject {
    memory: Arc<SimMemory>,
    addr: Option<GpuAddr>,
    heap: Heap,
    cpu_access: bool,
    mapped: bool,
}

#[derive(Debug, Default)]
pub(crate) struct QueueState {
    pub(crate) submitted: SeqNo,
    pub(crate) completed: SeqNo,
}

#[derive(Debug)]
pub(crate) struct DeviceState {
    objects: HashMap<BufferHandle, SimObject>,
    /// Binding start address -> object
    bindings: BTreeMap<u64, BufferHandle>,
    contexts: HashSet<ContextId>,
    queues: HashMap<QueueId, QueueState>,
    workers: HashMap<QueueId, QueueWorker>,
    retired: Vec<JoinHandle<()>>,
    reservations: Vec<VaRange>,
    place_cursor: GpuAddr,
    place_end: GpuAddr,
    reserve_cursor: GpuAddr,
    reserve_end: GpuAddr,
    next_object: u64,
    next_context: u64,
    vram_used: u64,
    pub(crate) epoch: u64,
    pub(crate) shutdown: bool,
}

impl DeviceState {
    fn new(va: VaRange) -> Self {
        let mid = (va.start + va.size().as_bytes() / 2).align_up(1 << 21);
        Self {
            objects: HashMap::new(),
            bindings: BTreeMap::new(),
            contexts: HashSet::new(),
            queues: HashMap::new(),
            workers: HashMap::new(),
            retired: Vec::new(),
            reservations: Vec::new(),
            place_cursor: va.start.align_up(PAGE),
            place_end: mid,
            reserve_cursor: mid,
            reserve_end: va.end,
            next_object: 1,
            next_context: 1,
            vram_used: 0,
            epoch: 0,
            shutdown: false,
        }
    }

    pub(crate) fn queue_mut(&mut self, queue: QueueId) -> &mut QueueState {
        self.queues.entry(queue).or_default()
    }

    pub(crate) fn completed(&self, queue: QueueId) -> SeqNo {
        self.queues.get(&queue).map_or(SeqNo::NONE, |q| q.completed)
    }

    /// Object memory and byte offset backing `addr`
    pub(crate) fn resolve(&self, addr: GpuAddr) -> Option<(Arc<SimMemory>, u64)> {
        let (start, bo) = self.bindings.range(..=addr.raw()).next_back()?;
        let obj = self.objects.get(bo)?;
        let offset = addr.raw() - start;
        (offset < obj.memory.len_bytes()).then(|| (obj.memory.clone(), offset))
    }

    fn object(&self, bo: BufferHandle) -> Result<&SimObject> {
        self.objects.get(&bo).ok_or(Error::NotFound)
    }

    fn is_free(&self, range: VaRange) -> bool {
        match self.bindings.range(..range.end.raw()).next_back() {
            Some((start, bo)) => {
                let len = self.objects.get(bo).map_or(0, |o| o.memory.len_bytes());
                start + len <= range.start.raw()
            }
            None => true,
        }
    }

    fn bind(&mut self, bo: BufferHandle, addr: GpuAddr, va: VaRange) -> Result<()> {
        if !addr.is_aligned(PAGE) {
            return Err(Error::MisalignedAddress);
        }
        let obj = self.object(bo)?;
        if obj.addr.is_some() {
            return Err(Error::InvalidParameter);
        }
        let range = VaRange::new(addr, obj.memory.size());
        if !va.encloses(&range) {
            return Err(Error::InvalidParameter);
        }
        if !self.is_free(range) {
            return Err(Error::AddressBindingFailed);
        }

        self.bindings.insert(addr.raw(), bo);
        if let Some(obj) = self.objects.get_mut(&bo) {
            obj.addr = Some(addr);
        }
        Ok(())
    }

    fn unbind(&mut self, bo: BufferHandle) -> Result<()> {
        let obj = self.objects.get_mut(&bo).ok_or(Error::NotFound)?;
        let addr = obj.addr.take().ok_or(Error::InvalidParameter)?;
        self.bindings.remove(&addr.raw());
        Ok(())
    }

    /// Device-chosen placement for an unbound object
    fn place(&mut self, bo: BufferHandle, va: VaRange) -> core::result::Result<GpuAddr, RejectReason> {
        let size = self
            .objects
            .get(&bo)
            .ok_or(RejectReason::UnknownObject)?
            .memory
            .len_bytes();
        let addr = self.place_cursor;
        let end = (addr + size).align_up(PAGE);
        if end > self.place_end {
            return Err(RejectReason::OutOfMemory);
        }
        self.bind(bo, addr, va).map_err(|_| RejectReason::OutOfMemory)?;
        self.place_cursor = end;
        Ok(addr)
    }
}

#[derive(Debug)]
pub(crate) struct Shared {
    state: Mutex<DeviceState>,
    pub(crate) progress: Condvar,
}

impl Shared {
    pub(crate) fn lock(&self) -> MutexGuard<'_, DeviceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn wait<'a>(&self, guard: MutexGuard<'a, DeviceState>) -> MutexGuard<'a, DeviceState> {
        self.progress.wait(guard).unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn wait_timeout<'a>(
        &self,
        guard: MutexGuard<'a, DeviceState>,
        dur: Duration,
    ) -> MutexGuard<'a, DeviceState> {
        match self.progress.wait_timeout(guard, dur) {
            Ok((guard, _)) => guard,
            Err(poisoned) => poisoned.into_inner().0,
        }
    }
}

// =============================================================================
// SIM DEVICE
// =============================================================================

/// Software reference device
#[derive(Debug)]
pub struct SimDevice {
    config: SimConfig,
    shared: Arc<Shared>,
}

impl SimDevice {
    /// Create a device
    pub fn new(config: SimConfig) -> Self {
        Self {
            config,
            shared: Arc::new(Shared {
                state: Mutex::new(DeviceState::new(config.va_range)),
                progress: Condvar::new(),
            }),
        }
    }

    /// Number of live bindings
    pub fn binding_count(&self) -> usize {
        self.shared.lock().bindings.len()
    }

    /// Number of live objects
    pub fn object_count(&self) -> usize {
        self.shared.lock().objects.len()
    }

    /// Where an object is bound
    pub fn address_of(&self, bo: BufferHandle) -> Option<GpuAddr> {
        self.shared.lock().objects.get(&bo).and_then(|o| o.addr)
    }

    /// Validate a submission and apply its placements and relocations
    ///
    /// On rejection every placement made here is undone.
    fn check_submission(
        &self,
        state: &mut DeviceState,
        request: &RawSubmission,
    ) -> core::result::Result<(Vec<(BufferHandle, GpuAddr)>, Vec<isa::Op>), RejectReason> {
        if !state.contexts.contains(&request.queue.context) {
            return Err(RejectReason::UnknownContext);
        }
        if !self.info().has_engine(request.queue.engine) {
            return Err(RejectReason::EngineUnavailable);
        }
        if request.fragments.is_empty() {
            return Err(RejectReason::FragmentOutOfBounds);
        }

        // Structure only; address fields are patched below.
        for frag in &request.fragments {
            isa::decode(&fragment_words(state, frag)?)?;
        }

        let mut placed = Vec::new();
        let result = self.apply(state, request, &mut placed);
        if result.is_err() {
            for bo in placed {
                if state.unbind(bo).is_err() {
                    log::warn!("sim: rollback of {:?} failed", bo);
                }
            }
        }
        result
    }

    fn apply(
        &self,
        state: &mut DeviceState,
        request: &RawSubmission,
        placed: &mut Vec<BufferHandle>,
    ) -> core::result::Result<(Vec<(BufferHandle, GpuAddr)>, Vec<isa::Op>), RejectReason> {
        let va = self.config.va_range;
        let mut placements: Vec<(BufferHandle, GpuAddr)> = Vec::new();
        for res in &request.resources {
            let current = state.objects.get(&res.bo).ok_or(RejectReason::UnknownObject)?.addr;
            let pinned = res.flags.contains(ResourceFlags::PINNED);
            let addr = match current {
                Some(addr) if pinned && addr != res.presumed => return Err(RejectReason::AddressConflict),
                Some(addr) => addr,
                None if pinned => {
                    state
                        .bind(res.bo, res.presumed, va)
                        .map_err(|_| RejectReason::AddressConflict)?;
                    placed.push(res.bo);
                    res.presumed
                }
                None => {
                    let addr = state.place(res.bo, va)?;
                    placed.push(res.bo);
                    addr
                }
            };
            placements.push((res.bo, addr));
        }

        for frag in &request.fragments {
            if placements.iter().any(|(bo, _)| *bo == frag.bo) {
                continue;
            }
            let existing = state.object(frag.bo).map_err(|_| RejectReason::UnknownObject)?.addr;
            let addr = match existing {
                Some(addr) => addr,
                None => {
                    let addr = state.place(frag.bo, va)?;
                    placed.push(frag.bo);
                    addr
                }
            };
            placements.push((frag.bo, addr));
        }

        let mut patches = Vec::with_capacity(request.relocs.len());
        for reloc in &request.relocs {
            let target = placements
                .iter()
                .find(|(bo, _)| *bo == reloc.target)
                .map(|(_, addr)| *addr)
                .ok_or(RejectReason::UnknownObject)?;
            let holder = state.objects.get(&reloc.holder).ok_or(RejectReason::UnknownObject)?;
            if reloc.offset % 4 != 0 || reloc.offset + 8 > holder.memory.len_bytes() {
                return Err(RejectReason::FragmentOutOfBounds);
            }
            if target != reloc.presumed {
                log::trace!("sim: reloc {:?}+{:#x} -> {}", reloc.holder, reloc.offset, target);
            }
            patches.push((holder.memory.clone(), reloc.offset, (target + reloc.delta).raw()));
        }
        for (memory, offset, value) in patches {
            memory
                .write_u32(offset, value as u32)
                .and_then(|_| memory.write_u32(offset + 4, (value >> 32) as u32))
                .map_err(|_| RejectReason::FragmentOutOfBounds)?;
        }

        let mut ops = Vec::new();
        for frag in &request.fragments {
            ops.extend(isa::decode(&fragment_words(state, frag)?)?);
        }

        Ok((placements, ops))
    }
}

/// Words of a fragment, bounds checked
fn fragment_words(state: &DeviceState, frag: &Fragment) -> core::result::Result<Vec<u32>, RejectReason> {
    let obj = state.objects.get(&frag.bo).ok_or(RejectReason::UnknownObject)?;
    if frag.len == 0 || frag.offset % 4 != 0 || frag.offset + frag.len > obj.memory.len_bytes() {
        return Err(RejectReason::FragmentOutOfBounds);
    }
    (frag.offset..frag.offset + frag.len)
        .step_by(4)
        .map(|off| obj.memory.read_u32(off))
        .collect::<Result<Vec<u32>>>()
        .map_err(|_| RejectReason::FragmentOutOfBounds)
}

impl Drop for SimDevice {
    fn drop(&mut self) {
        let threads: Vec<JoinHandle<()>> = {
            let mut state = self.shared.lock();
            state.shutdown = true;
            let mut threads: Vec<_> = state.workers.drain().map(|(_, w)| w.retire()).collect();
            threads.append(&mut state.retired);
            threads
        };
        self.shared.progress.notify_all();
        for thread in threads {
            if thread.join().is_err() {
                log::warn!("sim: queue worker panicked");
            }
        }
    }
}

// =============================================================================
// DEVICE TRAITS
// =============================================================================

impl DeviceHandle for SimDevice {
    fn info(&self) -> DeviceInfo {
        DeviceInfo {
            name: "anvil-sim",
            family: self.config.family,
            engines: self.config.engines,
            instances: self.config.instances,
            va_range: self.config.va_range,
        }
    }

    fn alloc(&self, desc: &AllocDesc) -> Result<BufferHandle> {
        if desc.size == ByteSize::ZERO {
            return Err(Error::InvalidParameter);
        }
        let memory = if desc.flags.contains(AllocFlags::ZEROED) {
            SimMemory::new(desc.size)
        } else {
            SimMemory::filled(desc.size, POISON)
        };

        let mut state = self.shared.lock();
        if desc.heap == Heap::Vram {
            let used = state.vram_used + memory.len_bytes();
            if used > self.config.vram.as_bytes() {
                log::debug!("sim: vram exhausted ({} requested)", desc.size);
                return Err(Error::OutOfMemory);
            }
            state.vram_used = used;
        }
        let bo = BufferHandle::new(state.next_object);
        state.next_object += 1;
        state.objects.insert(bo, SimObject {
            memory: Arc::new(memory),
            addr: None,
            heap: desc.heap,
            cpu_access: desc.flags.contains(AllocFlags::CPU_ACCESS),
            mapped: false,
        });
        Ok(bo)
    }

    fn free(&self, bo: BufferHandle) -> Result<()> {
        let mut state = self.shared.lock();
        let obj = state.objects.remove(&bo).ok_or(Error::NotFound)?;
        if let Some(addr) = obj.addr {
            state.bindings.remove(&addr.raw());
        }
        if obj.heap == Heap::Vram {
            let used = state.vram_used.saturating_sub(obj.memory.len_bytes());
            state.vram_used = used;
        }
        Ok(())
    }

    fn map(&self, bo: BufferHandle) -> Result<CpuMapping> {
        let mut state = self.shared.lock();
        let obj = state.objects.get_mut(&bo).ok_or(Error::NotFound)?;
        if !obj.cpu_access {
            return Err(Error::MappingFailed);
        }
        obj.mapped = true;
        let memory: Arc<dyn MappedMemory> = obj.memory.clone();
        Ok(CpuMapping::new(bo, memory))
    }

    fn unmap(&self, bo: BufferHandle) -> Result<()> {
        let mut state = self.shared.lock();
        let obj = state.objects.get_mut(&bo).ok_or(Error::NotFound)?;
        if !obj.mapped {
            return Err(HandleKind::Mapping.into());
        }
        obj.mapped = false;
        Ok(())
    }

    fn reserve_va(&self, size: ByteSize, alignment: u64) -> Result<VaRange> {
        let mut state = self.shared.lock();
        let start = state.reserve_cursor.align_up(alignment.max(PAGE));
        let range = VaRange::new(start, size.align_up(PAGE));
        if range.end > state.reserve_end {
            return Err(Error::OutOfMemory);
        }
        state.reserve_cursor = range.end;
        state.reservations.push(range);
        Ok(range)
    }

    fn release_va(&self, range: VaRange) -> Result<()> {
        let mut state = self.shared.lock();
        let index = state
            .reservations
            .iter()
            .position(|r| *r == range)
            .ok_or(Error::NotFound)?;
        state.reservations.swap_remove(index);
        Ok(())
    }

    fn bind(&self, bo: BufferHandle, addr: GpuAddr) -> Result<()> {
        self.shared.lock().bind(bo, addr, self.config.va_range)
    }

    fn unbind(&self, bo: BufferHandle) -> Result<()> {
        self.shared.lock().unbind(bo)
    }
}

impl ContextPrimitive for SimDevice {
    fn create_context(&self) -> Result<ContextId> {
        let mut state = self.shared.lock();
        let ctx = ContextId::new(state.next_context);
        state.next_context += 1;
        state.contexts.insert(ctx);
        log::debug!("sim: created context {}", ctx.id());
        Ok(ctx)
    }

    fn destroy_context(&self, ctx: ContextId) -> Result<()> {
        let mut state = self.shared.lock();
        if !state.contexts.remove(&ctx) {
            return Err(Error::NotFound);
        }
        let queues: Vec<QueueId> = state.workers.keys().filter(|q| q.context == ctx).copied().collect();
        for queue in queues {
            if let Some(worker) = state.workers.remove(&queue) {
                let thread = worker.retire();
                state.retired.push(thread);
            }
        }
        log::debug!("sim: destroyed context {}", ctx.id());
        Ok(())
    }
}

impl SubmitPrimitive for SimDevice {
    fn submit(&self, request: &RawSubmission) -> Result<SubmitReceipt> {
        let mut state = self.shared.lock();
        let (placements, ops) = self.check_submission(&mut state, request).map_err(|reason| {
            log::debug!("sim: rejected submission on {}: {}", request.queue, reason);
            Error::DeviceRejected(reason)
        })?;

        let queue = request.queue;
        if !state.workers.contains_key(&queue) {
            let worker = QueueWorker::spawn(queue, self.shared.clone())
                .map_err(|_| Error::DeviceRejected(RejectReason::OutOfMemory))?;
            state.workers.insert(queue, worker);
        }

        let seqno = state.queue_mut(queue).submitted.next();
        let job = Job {
            seqno,
            waits: request.wait.clone(),
            ops,
        };
        let accepted = state.workers.get(&queue).map_or(false, |w| w.push(job));
        if !accepted {
            return Err(Error::DeviceRejected(RejectReason::EngineUnavailable));
        }
        state.queue_mut(queue).submitted = seqno;
        log::trace!("sim: queued {}#{}", queue, seqno.raw());

        Ok(SubmitReceipt { seqno, placements })
    }

    fn completed(&self, queue: QueueId) -> Result<SeqNo> {
        let state = self.shared.lock();
        if !state.queues.contains_key(&queue) && !state.contexts.contains(&queue.context) {
            return Err(Error::NotFound);
        }
        Ok(state.completed(queue))
    }

    fn progress(&self) -> u64 {
        self.shared.lock().epoch
    }

    fn wait_progress(&self, seen: u64, deadline: Option<Instant>) -> u64 {
        let mut state = self.shared.lock();
        while state.epoch == seen && !state.shutdown {
            state = match deadline {
                None => self.shared.wait(state),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        break;
                    }
                    self.shared.wait_timeout(state, deadline - now)
                }
            };
        }
        state.epoch
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anvil_core::{Domains, EngineClass, EngineId, RelocEntry, Resource};

    fn page_bo(dev: &SimDevice, addr: Option<GpuAddr>) -> (BufferHandle, CpuMapping) {
        let bo = dev.alloc(&AllocDesc::new(ByteSize::PAGE)).unwrap();
        if let Some(addr) = addr {
            dev.bind(bo, addr).unwrap();
        }
        (bo, dev.map(bo).unwrap())
    }

    fn wait_for(dev: &SimDevice, queue: QueueId, seqno: SeqNo) {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let epoch = dev.progress();
            if dev.completed(queue).unwrap() >= seqno {
                return;
            }
            assert!(Instant::now() < deadline, "device did not complete");
            dev.wait_progress(epoch, Some(deadline));
        }
    }

    #[test]
    fn test_bind_rejects_overlap() {
        let dev = SimDevice::new(SimConfig::default());
        let base = GpuAddr::new(0x4000_0000);
        let (a, _) = page_bo(&dev, Some(base));
        let (b, _) = page_bo(&dev, None);
        assert_eq!(dev.bind(b, base), Err(Error::AddressBindingFailed));
        assert_eq!(dev.bind(b, base + 0x10), Err(Error::MisalignedAddress));
        assert_eq!(dev.bind(a, base + PAGE), Err(Error::InvalidParameter));
        dev.bind(b, base + PAGE).unwrap();
        assert_eq!(dev.binding_count(), 2);
    }

    #[test]
    fn test_store_executes_on_queue() {
        let dev = SimDevice::new(SimConfig::default());
        let ctx = dev.create_context().unwrap();
        let queue = QueueId::new(ctx, EngineId::first(EngineClass::Render));

        let dst_addr = GpuAddr::new(0x4000_0000);
        let (dst, dst_map) = page_bo(&dev, Some(dst_addr));
        let (cmd, cmd_map) = page_bo(&dev, None);
        let mut words = isa::store_dword(dst_addr + 8, 0x1234).to_vec();
        words.push(isa::BATCH_END);
        cmd_map.write_words(0, &words).unwrap();

        let mut raw = RawSubmission::new(queue);
        raw.fragments.push(Fragment { bo: cmd, offset: 0, len: words.len() as u64 * 4 });
        raw.resources.push(Resource {
            bo: dst,
            presumed: dst_addr,
            flags: ResourceFlags::WRITE | ResourceFlags::PINNED,
        });
        let receipt = dev.submit(&raw).unwrap();
        assert_eq!(receipt.seqno, SeqNo::new(1));
        assert!(receipt.placements.iter().any(|(bo, _)| *bo == cmd));

        wait_for(&dev, queue, receipt.seqno);
        assert_eq!(dst_map.read_u32(8).unwrap(), 0x1234);
    }

    #[test]
    fn test_rejections() {
        let dev = SimDevice::new(SimConfig {
            engines: EngineMask::RENDER,
            ..SimConfig::default()
        });
        let ctx = dev.create_context().unwrap();
        let (cmd, cmd_map) = page_bo(&dev, None);
        cmd_map.write_words(0, &[isa::NOOP, isa::NOOP]).unwrap();

        let mut raw = RawSubmission::new(QueueId::new(ctx, EngineId::first(EngineClass::Render)));
        raw.fragments.push(Fragment { bo: cmd, offset: 0, len: 8 });
        assert_eq!(
            dev.submit(&raw),
            Err(Error::DeviceRejected(RejectReason::MissingEndMarker))
        );

        raw.queue = QueueId::new(ctx, EngineId::first(EngineClass::Copy));
        assert_eq!(
            dev.submit(&raw),
            Err(Error::DeviceRejected(RejectReason::EngineUnavailable))
        );

        raw.queue = QueueId::new(ContextId::new(99), EngineId::first(EngineClass::Render));
        assert_eq!(
            dev.submit(&raw),
            Err(Error::DeviceRejected(RejectReason::UnknownContext))
        );
    }

    #[test]
    fn test_rejected_submission_leaves_no_placements() {
        let dev = SimDevice::new(SimConfig::default());
        let ctx = dev.create_context().unwrap();
        let (target, _) = page_bo(&dev, None);
        let (cmd, cmd_map) = page_bo(&dev, None);
        cmd_map.write_words(0, &[0x7f << 23, 0, 0, isa::BATCH_END]).unwrap();

        let mut raw = RawSubmission::new(QueueId::new(ctx, EngineId::first(EngineClass::Render)));
        raw.fragments.push(Fragment { bo: cmd, offset: 0, len: 16 });
        raw.resources.push(Resource {
            bo: target,
            presumed: GpuAddr::null(),
            flags: ResourceFlags::empty(),
        });
        assert_eq!(
            dev.submit(&raw),
            Err(Error::DeviceRejected(RejectReason::MalformedStream))
        );
        assert_eq!(dev.binding_count(), 0);

        // Fails after both objects were placed
        cmd_map.write_u32(0, isa::BATCH_END).unwrap();
        raw.relocs.push(RelocEntry {
            target: BufferHandle::new(999),
            holder: cmd,
            offset: 8,
            delta: 0,
            presumed: GpuAddr::null(),
            read_domains: Domains::empty(),
            write_domain: Domains::empty(),
        });
        assert_eq!(
            dev.submit(&raw),
            Err(Error::DeviceRejected(RejectReason::UnknownObject))
        );
        assert_eq!(dev.binding_count(), 0);
        assert_eq!(dev.address_of(target), None);
        assert_eq!(cmd_map.read_u32(8).unwrap(), 0);
    }

    #[test]
    fn test_heap_and_flags() {
        let dev = SimDevice::new(SimConfig {
            vram: ByteSize::from_kib(8),
            ..SimConfig::default()
        });
        let vram = AllocDesc::new(ByteSize::PAGE).with_heap(Heap::Vram);

        let a = dev.alloc(&vram).unwrap();
        let b = dev.alloc(&vram.with_flags(AllocFlags::ZEROED)).unwrap();
        assert_eq!(dev.alloc(&vram), Err(Error::OutOfMemory));
        assert_eq!(dev.map(b).err(), Some(Error::MappingFailed));

        dev.free(a).unwrap();
        let c = dev.alloc(&vram.with_flags(AllocFlags::CPU_ACCESS)).unwrap();
        assert_eq!(dev.map(c).unwrap().read_u32(0).unwrap(), POISON);

        // System memory is not charged against the vram budget.
        let sys = dev.alloc(&AllocDesc::new(ByteSize::from_kib(64))).unwrap();
        assert_eq!(dev.map(sys).unwrap().read_u32(0).unwrap(), 0);
    }

    #[test]
    fn test_reservations_never_overlap_placements() {
        let dev = SimDevice::new(SimConfig::default());
        let r1 = dev.reserve_va(ByteSize::from_mib(4), 1 << 21).unwrap();
        let r2 = dev.reserve_va(ByteSize::from_mib(4), 1 << 21).unwrap();
        assert!(!r1.overlaps(&r2));
        dev.release_va(r1).unwrap();
        assert_eq!(dev.release_va(r1), Err(Error::NotFound));
    }
}
