//! End-to-end runs against the reference device.

use std::sync::Arc;

use anvil_core::{
    AllocDesc, BufferHandle, ByteSize, ContextId, CpuMapping, Destroyable, Domains, EngineClass,
    EngineId, EngineInstance, EngineMask, Error, FenceHandle, Fragment, GpuAddr, HandleKind,
    QueueId, RawSubmission, RejectReason, Resource, ResourceFlags, SeqNo,
};
use anvil_mem::RegistryConfig;
use anvil_sim::{isa, SimConfig, SimDevice};

use crate::{
    AddressingMode, Batch, BatchConfig, FenceStatus, SemaphoreState, Session, SubmitMode, Timeout,
};

const SETTLE: Timeout = Timeout::from_millis(5_000);

fn rig_with(config: SimConfig) -> (Session<SimDevice>, ContextId) {
    let device = Arc::new(SimDevice::new(config));
    let session = Session::new(device, RegistryConfig::default()).unwrap();
    let ctx = session.submitter.create_context().unwrap();
    (session, ctx)
}

fn rig() -> (Session<SimDevice>, ContextId) {
    rig_with(SimConfig::default())
}

fn object(s: &Session<SimDevice>) -> (BufferHandle, CpuMapping) {
    let bo = s.registry.create(&AllocDesc::new(ByteSize::PAGE)).unwrap();
    let map = s.registry.map(bo).unwrap();
    (bo, map)
}

fn words(map: &CpuMapping, n: usize) -> Vec<u32> {
    let mut out = vec![0; n];
    map.read_words(0, &mut out).unwrap();
    out
}

fn blit(batch: &mut Batch<SimDevice>, dst: BufferHandle, src: BufferHandle, n: u32) {
    batch.append(isa::COPY_MEM_HEADER).unwrap();
    batch.emit_reloc(dst, 0, Domains::RENDER, Domains::RENDER).unwrap();
    batch.emit_reloc(src, 0, Domains::RENDER, Domains::empty()).unwrap();
    batch.append(n).unwrap();
    batch.emit_end().unwrap();
}

fn store(batch: &mut Batch<SimDevice>, dst: BufferHandle, offset: u64, value: u32) {
    batch.append(isa::STORE_DWORD_HEADER).unwrap();
    batch.emit_reloc(dst, offset, Domains::RENDER, Domains::RENDER).unwrap();
    batch.append(value).unwrap();
}

/// A batch that stalls until the first word of `gate` becomes 1
fn gated(s: &Session<SimDevice>, gate: BufferHandle) -> Batch<SimDevice> {
    let mut batch = s.batch(BatchConfig::default()).unwrap();
    let [header, value, _, _] = isa::semaphore_wait(GpuAddr::null(), 1);
    batch.append_slice(&[header, value]).unwrap();
    batch.emit_reloc(gate, 0, Domains::RENDER, Domains::empty()).unwrap();
    batch.emit_end().unwrap();
    batch
}

fn exec(
    s: &Session<SimDevice>,
    batch: &mut Batch<SimDevice>,
    ctx: ContextId,
    class: EngineClass,
) -> FenceHandle {
    s.submitter
        .submit(batch, class, EngineInstance::ZERO, ctx, SubmitMode::Sync(SETTLE))
        .unwrap()
}

fn launch(
    s: &Session<SimDevice>,
    batch: &mut Batch<SimDevice>,
    ctx: ContextId,
    class: EngineClass,
) -> FenceHandle {
    s.submitter
        .submit(batch, class, EngineInstance::ZERO, ctx, SubmitMode::Async)
        .unwrap()
}

// =============================================================================
// ADDRESSING MODES
// =============================================================================

#[test]
fn test_absolute_purge_assigns_fresh_addresses() {
    let (s, ctx) = rig();
    let (src, src_map) = object(&s);
    let (dst, dst_map) = object(&s);
    let mut batch = s.batch(BatchConfig::with_mode(AddressingMode::Absolute)).unwrap();

    src_map.write_words(0, &[1, 2, 3, 4]).unwrap();
    blit(&mut batch, dst, src, 4);
    exec(&s, &mut batch, ctx, EngineClass::Copy);
    assert_eq!(words(&dst_map, 4), vec![1, 2, 3, 4]);
    let before = [batch.object_offset(src).unwrap(), batch.object_offset(dst).unwrap()];

    batch.reset(true).unwrap();
    assert_eq!(batch.object_offset(src), None);
    assert_eq!(batch.object_offset(dst), None);

    src_map.write_words(0, &[5, 6, 7, 8]).unwrap();
    blit(&mut batch, dst, src, 4);
    exec(&s, &mut batch, ctx, EngineClass::Copy);
    assert_eq!(words(&dst_map, 4), vec![5, 6, 7, 8]);

    let after = [batch.object_offset(src).unwrap(), batch.object_offset(dst).unwrap()];
    for addr in after {
        assert!(!before.contains(&addr));
    }
    assert_eq!(s.device().address_of(src), Some(after[0]));
    assert_eq!(s.device().address_of(dst), Some(after[1]));
}

#[test]
fn test_absolute_keep_reuses_addresses() {
    let (s, ctx) = rig();
    let (src, src_map) = object(&s);
    let (dst, dst_map) = object(&s);
    let mut batch = s.batch(BatchConfig::with_mode(AddressingMode::Absolute)).unwrap();

    src_map.write_words(0, &[9, 8]).unwrap();
    blit(&mut batch, dst, src, 2);
    exec(&s, &mut batch, ctx, EngineClass::Copy);
    let before = [batch.object_offset(src), batch.object_offset(dst)];

    batch.reset(false).unwrap();
    assert_eq!([batch.object_offset(src), batch.object_offset(dst)], before);

    dst_map.fill(0).unwrap();
    blit(&mut batch, dst, src, 2);
    exec(&s, &mut batch, ctx, EngineClass::Copy);
    assert_eq!(words(&dst_map, 2), vec![9, 8]);
    assert_eq!([batch.object_offset(src), batch.object_offset(dst)], before);
    assert!(batch.offset_agrees(src).unwrap());
    assert!(batch.offset_agrees(dst).unwrap());
}

#[test]
fn test_relocation_purge_forgets_then_relearns() {
    let (s, ctx) = rig();
    let (src, src_map) = object(&s);
    let (dst, dst_map) = object(&s);
    let mut batch = s.batch(BatchConfig::with_mode(AddressingMode::Relocation)).unwrap();

    src_map.write_words(0, &[0xa, 0xb, 0xc]).unwrap();
    blit(&mut batch, dst, src, 3);
    assert_eq!(batch.object_offset(dst), None);
    exec(&s, &mut batch, ctx, EngineClass::Copy);
    assert_eq!(words(&dst_map, 3), vec![0xa, 0xb, 0xc]);

    let placed = batch.object_offset(dst).unwrap();
    assert_eq!(s.registry.address(dst).unwrap(), Some(placed));
    assert_eq!(s.device().address_of(dst), Some(placed));

    batch.reset(true).unwrap();
    assert_eq!(batch.object_offset(dst), None);
    assert_eq!(batch.object_offset(src), None);

    dst_map.fill(0).unwrap();
    blit(&mut batch, dst, src, 3);
    exec(&s, &mut batch, ctx, EngineClass::Copy);
    assert_eq!(words(&dst_map, 3), vec![0xa, 0xb, 0xc]);
    assert_eq!(batch.object_offset(dst), s.device().address_of(dst));
}

#[test]
fn test_relocation_keep_retains_offsets() {
    let (s, ctx) = rig();
    let (src, src_map) = object(&s);
    let (dst, dst_map) = object(&s);
    let mut batch = s.batch(BatchConfig::with_mode(AddressingMode::Relocation)).unwrap();

    src_map.write_u32(0, 0x77).unwrap();
    blit(&mut batch, dst, src, 1);
    exec(&s, &mut batch, ctx, EngineClass::Render);
    let before = batch.object_offset(src);
    assert!(before.is_some());

    batch.reset(false).unwrap();
    assert_eq!(batch.object_offset(src), before);

    dst_map.fill(0).unwrap();
    blit(&mut batch, dst, src, 1);
    exec(&s, &mut batch, ctx, EngineClass::Render);
    assert_eq!(dst_map.read_u32(0).unwrap(), 0x77);
    assert_eq!(batch.object_offset(src), before);
}

#[test]
fn test_relocated_address_matches_reported_offset() {
    let (s, ctx) = rig();
    let (bo, map) = object(&s);
    let mut batch = s.batch(BatchConfig::with_mode(AddressingMode::Relocation)).unwrap();

    // Store the object's own address into the object
    batch.append(isa::STORE_QWORD_HEADER).unwrap();
    batch.emit_reloc(bo, 0x10, Domains::RENDER, Domains::RENDER).unwrap();
    batch.emit_reloc(bo, 0, Domains::RENDER, Domains::empty()).unwrap();
    batch.emit_end().unwrap();
    exec(&s, &mut batch, ctx, EngineClass::Render);

    let addr = batch.object_offset(bo).unwrap();
    assert_eq!(map.read_u64(0x10).unwrap(), addr.raw());
    assert!(batch.offset_agrees(bo).unwrap());
    assert_eq!(s.registry.holds(bo).unwrap(), 1);
}

#[test]
fn test_pinned_address_survives_purge() {
    let (s, ctx) = rig();
    let (bo, map) = object(&s);
    let pin = GpuAddr::new(s.registry.arena().end.raw() - (1 << 20));
    let mut batch = s.batch(BatchConfig::default()).unwrap();

    for round in 0..2u32 {
        batch.add_pinned(bo, pin, true).unwrap();
        store(&mut batch, bo, 4, 0x100 + round);
        batch.emit_end().unwrap();
        exec(&s, &mut batch, ctx, EngineClass::Compute);

        assert_eq!(map.read_u32(4).unwrap(), 0x100 + round);
        assert_eq!(batch.object_offset(bo), Some(pin));
        assert_eq!(s.device().address_of(bo), Some(pin));
        batch.reset(true).unwrap();
    }
}

#[test]
fn test_full_batch_executes() {
    let (s, ctx) = rig();
    let (bo, map) = object(&s);
    let mut batch = s
        .batch(BatchConfig {
            capacity: ByteSize::from_bytes(64),
            ..BatchConfig::default()
        })
        .unwrap();

    store(&mut batch, bo, 0, 0xf00d);
    let pad = vec![isa::NOOP; batch.capacity_words() - batch.cursor() - 1];
    batch.append_slice(&pad).unwrap();
    batch.emit_end().unwrap();
    assert_eq!(batch.cursor(), batch.capacity_words());

    exec(&s, &mut batch, ctx, EngineClass::Render);
    assert_eq!(map.read_u32(0).unwrap(), 0xf00d);
}

// =============================================================================
// FENCES
// =============================================================================

#[test]
fn test_wait_all_times_out_with_partial_result() {
    let (s, ctx) = rig();
    let (gate, gate_map) = object(&s);
    let (bo, _) = object(&s);

    let mut stalled = gated(&s, gate);
    let slow = launch(&s, &mut stalled, ctx, EngineClass::Render);

    let mut quick = s.batch(BatchConfig::default()).unwrap();
    store(&mut quick, bo, 0, 1);
    quick.emit_end().unwrap();
    let fast = launch(&s, &mut quick, ctx, EngineClass::Copy);

    let result = s.coordinator.wait_all(&[slow, fast], Timeout::from_millis(500)).unwrap();
    assert_eq!(result.status, FenceStatus::TimedOut);
    assert_eq!(result.expired, vec![fast]);
    assert_eq!(result.first, Some(1));
    assert!(!result.satisfied());

    let any = s.coordinator.wait_any(&[slow, fast], SETTLE).unwrap();
    assert!(any.satisfied());
    assert_eq!(any.first, Some(1));

    assert_eq!(s.coordinator.wait(&slow, Timeout::ZERO).unwrap(), FenceStatus::TimedOut);
    assert_eq!(s.coordinator.status(&slow).unwrap(), FenceStatus::Pending);

    gate_map.write_u32(0, 1).unwrap();
    let all = s.coordinator.wait_all(&[slow, fast], SETTLE).unwrap();
    assert!(all.satisfied());
    assert_eq!(all.expired, vec![slow, fast]);
    assert_eq!(s.coordinator.status(&slow).unwrap(), FenceStatus::Expired);
}

#[test]
fn test_wait_edge_cases() {
    let (s, ctx) = rig();
    let queue = QueueId::new(ctx, EngineId::first(EngineClass::Render));

    assert_eq!(s.coordinator.wait_any(&[], SETTLE), Err(Error::InvalidParameter));
    assert!(s.coordinator.wait_all(&[], Timeout::ZERO).unwrap().satisfied());

    let bogus = FenceHandle::new(queue, SeqNo::new(7));
    assert_eq!(
        s.coordinator.wait(&bogus, Timeout::ZERO),
        Err(Error::InvalidHandleUse(HandleKind::Fence))
    );
    assert!(s.coordinator.queue_idle(queue).unwrap());
}

#[test]
fn test_sync_submit_times_out() {
    let (s, ctx) = rig();
    let (gate, gate_map) = object(&s);
    let mut batch = gated(&s, gate);

    let result = s.submitter.submit(
        &mut batch,
        EngineClass::Render,
        EngineInstance::ZERO,
        ctx,
        SubmitMode::Sync(Timeout::from_millis(50)),
    );
    assert_eq!(result, Err(Error::Timeout));
    let fence = batch.last_fence().unwrap();
    assert_eq!(fence.seqno(), SeqNo::new(1));

    gate_map.write_u32(0, 1).unwrap();
    assert_eq!(batch.sync(SETTLE).unwrap(), FenceStatus::Expired);
}

#[test]
fn test_fences_on_one_queue_are_ordered() {
    let (s, ctx) = rig();
    let (bo, map) = object(&s);
    let mut batch = s.batch(BatchConfig::default()).unwrap();

    store(&mut batch, bo, 0, 1);
    batch.emit_end().unwrap();
    let first = launch(&s, &mut batch, ctx, EngineClass::Video);

    batch.reset(false).unwrap();
    store(&mut batch, bo, 0, 2);
    batch.emit_end().unwrap();
    let second = exec(&s, &mut batch, ctx, EngineClass::Video);

    assert_eq!(first.precedes(&second), Some(true));
    assert!(s.coordinator.is_expired(&first).unwrap());
    assert_eq!(map.read_u32(0).unwrap(), 2);
}

// =============================================================================
// SEMAPHORES
// =============================================================================

#[test]
fn test_semaphore_orders_copy_before_render() {
    let (s, ctx) = rig();
    let (sentinel, _) = object(&s);
    let (dst, dst_map) = object(&s);

    let mut producer = s.batch(BatchConfig::default()).unwrap();
    producer.append_slice(&isa::delay(20_000)).unwrap();
    store(&mut producer, sentinel, 0, 0xfeed);
    producer.emit_end().unwrap();
    let produced = launch(&s, &mut producer, ctx, EngineClass::Copy);

    let sem = s.coordinator.create_semaphore();
    s.coordinator.signal(ctx, EngineClass::Copy, EngineInstance::ZERO, sem).unwrap();
    assert_ne!(s.coordinator.semaphore_state(sem).unwrap(), SemaphoreState::Unsignaled);
    s.coordinator.wait_semaphore(ctx, EngineClass::Render, EngineInstance::ZERO, sem).unwrap();
    assert_eq!(s.coordinator.semaphore_state(sem).unwrap(), SemaphoreState::Unsignaled);

    let mut consumer = s.batch(BatchConfig::default()).unwrap();
    blit(&mut consumer, dst, sentinel, 1);
    exec(&s, &mut consumer, ctx, EngineClass::Render);

    assert_eq!(dst_map.read_u32(0).unwrap(), 0xfeed);
    assert!(s.coordinator.is_expired(&produced).unwrap());
    s.coordinator.destroy_semaphore(sem).unwrap();
}

#[test]
fn test_semaphore_orders_across_contexts() {
    let (s, producer_ctx) = rig();
    let consumer_ctx = s.submitter.create_context().unwrap();
    let (sentinel, _) = object(&s);
    let (dst, dst_map) = object(&s);

    let mut producer = s.batch(BatchConfig::default()).unwrap();
    producer.append_slice(&isa::delay(20_000)).unwrap();
    store(&mut producer, sentinel, 0, 0xbeef);
    producer.emit_end().unwrap();
    let produced = launch(&s, &mut producer, producer_ctx, EngineClass::Copy);

    let sem = s.coordinator.create_semaphore();
    s.coordinator.signal(producer_ctx, EngineClass::Copy, EngineInstance::ZERO, sem).unwrap();
    s.coordinator
        .wait_semaphore(consumer_ctx, EngineClass::Render, EngineInstance::ZERO, sem)
        .unwrap();

    let mut consumer = s.batch(BatchConfig::default()).unwrap();
    blit(&mut consumer, dst, sentinel, 1);
    exec(&s, &mut consumer, consumer_ctx, EngineClass::Render);

    assert_eq!(dst_map.read_u32(0).unwrap(), 0xbeef);
    assert!(s.coordinator.is_expired(&produced).unwrap());
}

#[test]
fn test_semaphore_signaled_only_after_producer_completes() {
    let (s, ctx) = rig();
    let (gate, gate_map) = object(&s);
    let mut producer = gated(&s, gate);
    let produced = launch(&s, &mut producer, ctx, EngineClass::Copy);

    let sem = s.coordinator.create_semaphore();
    s.coordinator.signal(ctx, EngineClass::Copy, EngineInstance::ZERO, sem).unwrap();
    assert_eq!(s.coordinator.semaphore_state(sem).unwrap(), SemaphoreState::Pending);
    assert_eq!(s.coordinator.status(&produced).unwrap(), FenceStatus::Pending);

    gate_map.write_u32(0, 1).unwrap();
    assert_eq!(producer.sync(SETTLE).unwrap(), FenceStatus::Expired);
    assert_eq!(s.coordinator.semaphore_state(sem).unwrap(), SemaphoreState::Signaled);
}

#[test]
fn test_semaphore_misuse() {
    let (s, ctx) = rig();
    let sem = s.coordinator.create_semaphore();

    assert_eq!(
        s.coordinator.wait_semaphore(ctx, EngineClass::Render, EngineInstance::ZERO, sem),
        Err(Error::InvalidHandleUse(HandleKind::Semaphore))
    );

    s.coordinator.signal(ctx, EngineClass::Copy, EngineInstance::ZERO, sem).unwrap();
    assert_eq!(
        s.coordinator.signal(ctx, EngineClass::Copy, EngineInstance::ZERO, sem),
        Err(Error::InvalidHandleUse(HandleKind::Semaphore))
    );

    // Consumed but never submitted
    s.coordinator.wait_semaphore(ctx, EngineClass::Render, EngineInstance::ZERO, sem).unwrap();
    assert!(s.coordinator.destroy_semaphore(sem).is_err());
}

// =============================================================================
// LIFETIME AND REJECTION
// =============================================================================

#[test]
fn test_destroy_releases_every_binding() {
    let device = Arc::new(SimDevice::new(SimConfig::default()));
    let s = Session::new(device.clone(), RegistryConfig::default()).unwrap();
    let ctx = s.submitter.create_context().unwrap();
    let (bo, map) = object(&s);

    let mut batch = s.batch(BatchConfig::default()).unwrap();
    store(&mut batch, bo, 8, 0x55);
    batch.emit_end().unwrap();
    s.submitter
        .submit(
            &mut batch,
            EngineClass::Render,
            EngineInstance::ZERO,
            ctx,
            SubmitMode::Sync(Timeout::Infinite),
        )
        .unwrap();
    assert_eq!(map.read_u32(8).unwrap(), 0x55);
    assert_eq!(device.binding_count(), 2);

    batch.destroy().unwrap();
    s.registry.unmap_and_free(bo).unwrap();
    assert_eq!(device.binding_count(), 0);
    assert_eq!(device.object_count(), 0);
    s.submitter.destroy_context(ctx).unwrap();
}

#[test]
fn test_busy_handles_refuse_destruction() {
    let (s, ctx) = rig();
    let (gate, gate_map) = object(&s);
    let mut batch = gated(&s, gate);
    launch(&s, &mut batch, ctx, EngineClass::Render);

    assert_eq!(batch.destroy(), Err(Error::InvalidHandleUse(HandleKind::Batch)));
    assert_eq!(
        s.submitter.destroy_context(ctx),
        Err(Error::InvalidHandleUse(HandleKind::Context))
    );
    assert_eq!(
        s.registry.destroy(gate),
        Err(Error::InvalidHandleUse(HandleKind::Buffer))
    );

    gate_map.write_u32(0, 1).unwrap();
    assert_eq!(batch.sync(SETTLE).unwrap(), FenceStatus::Expired);
    batch.destroy().unwrap();
    s.submitter.destroy_context(ctx).unwrap();
    s.registry.destroy(gate).unwrap();
}

#[test]
fn test_reset_keeps_objects_held_until_completion() {
    let (s, ctx) = rig();
    let (gate, gate_map) = object(&s);
    let mut batch = gated(&s, gate);
    launch(&s, &mut batch, ctx, EngineClass::Render);

    batch.reset(false).unwrap();
    assert!(batch.dependencies().is_empty());
    assert_eq!(s.registry.holds(gate).unwrap(), 1);
    assert_eq!(
        s.registry.destroy(gate),
        Err(Error::InvalidHandleUse(HandleKind::Buffer))
    );

    gate_map.write_u32(0, 1).unwrap();
    assert_eq!(batch.sync(SETTLE).unwrap(), FenceStatus::Expired);
    assert_eq!(s.registry.holds(gate).unwrap(), 0);
    s.registry.destroy(gate).unwrap();
}

#[test]
fn test_rejected_relocation_batch_leaves_objects_unplaced() {
    let (s, ctx) = rig();
    let (bo, map) = object(&s);
    let mut batch = s.batch(BatchConfig::with_mode(AddressingMode::Relocation)).unwrap();

    // Unknown opcode spanning the address field that follows.
    batch.append((0x7f << 23) | 2).unwrap();
    batch.emit_reloc(bo, 0, Domains::RENDER, Domains::RENDER).unwrap();
    batch.append(0).unwrap();
    batch.emit_end().unwrap();
    let rejected = s.submitter.submit(
        &mut batch,
        EngineClass::Render,
        EngineInstance::ZERO,
        ctx,
        SubmitMode::Async,
    );
    assert_eq!(rejected, Err(Error::DeviceRejected(RejectReason::MalformedStream)));
    assert_eq!(batch.last_fence(), None);
    for handle in [bo, batch.handle()] {
        assert_eq!(s.device().address_of(handle), s.registry.address(handle).unwrap());
    }
    assert_eq!(s.device().address_of(bo), None);

    let mut retry = s.batch(BatchConfig::with_mode(AddressingMode::Absolute)).unwrap();
    store(&mut retry, bo, 4, 0x77);
    retry.emit_end().unwrap();
    exec(&s, &mut retry, ctx, EngineClass::Render);
    assert_eq!(map.read_u32(4).unwrap(), 0x77);
}

#[test]
fn test_dropping_busy_batch_leaks_its_buffer() {
    let (s, ctx) = rig();
    let (gate, gate_map) = object(&s);
    let mut batch = gated(&s, gate);
    let fence = launch(&s, &mut batch, ctx, EngineClass::Render);
    let own = batch.handle();

    drop(batch);
    assert!(s.registry.contains(own));

    gate_map.write_u32(0, 1).unwrap();
    assert_eq!(s.coordinator.wait(&fence, SETTLE).unwrap(), FenceStatus::Expired);
}

#[test]
fn test_rejections_surface_as_errors() {
    let (s, ctx) = rig_with(SimConfig {
        engines: EngineMask::RENDER | EngineMask::COPY,
        ..SimConfig::default()
    });
    let (bo, _) = object(&s);
    let mut batch = s.batch(BatchConfig::default()).unwrap();

    store(&mut batch, bo, 0, 1);
    let unterminated = s.submitter.submit(
        &mut batch,
        EngineClass::Render,
        EngineInstance::ZERO,
        ctx,
        SubmitMode::Async,
    );
    assert_eq!(unterminated, Err(Error::DeviceRejected(RejectReason::MissingEndMarker)));

    batch.emit_end().unwrap();
    for (class, instance) in [
        (EngineClass::Video, EngineInstance::ZERO),
        (EngineClass::Render, EngineInstance::new(2)),
    ] {
        assert_eq!(
            s.submitter.submit(&mut batch, class, instance, ctx, SubmitMode::Async),
            Err(Error::DeviceRejected(RejectReason::EngineUnavailable))
        );
    }
    assert_eq!(batch.last_fence(), None);

    let stranger = ContextId::new(404);
    assert_eq!(
        s.submitter.submit(&mut batch, EngineClass::Render, EngineInstance::ZERO, stranger, SubmitMode::Async),
        Err(Error::DeviceRejected(RejectReason::UnknownContext))
    );
}

// =============================================================================
// RAW SUBMISSION
// =============================================================================

fn program(s: &Session<SimDevice>, body: &[u32]) -> Fragment {
    let (bo, map, _) = s.registry.alloc_and_map(&AllocDesc::new(ByteSize::PAGE)).unwrap();
    let mut stream = body.to_vec();
    stream.push(isa::BATCH_END);
    map.write_words(0, &stream).unwrap();
    Fragment {
        bo,
        offset: 0,
        len: stream.len() as u64 * 4,
    }
}

#[test]
fn test_multi_fragment_submission() {
    let (s, ctx) = rig();
    let (dst, map, addr) = s.registry.alloc_and_map(&AllocDesc::new(ByteSize::PAGE)).unwrap();

    let queue = QueueId::new(ctx, EngineId::first(EngineClass::Render));
    let mut request = RawSubmission::new(queue);
    request.fragments.push(program(&s, &isa::store_dword(addr, 1)));
    request.fragments.push(program(&s, &isa::store_dword(addr + 4, 2)));
    request.resources.push(Resource {
        bo: dst,
        presumed: addr,
        flags: ResourceFlags::WRITE | ResourceFlags::PINNED,
    });

    s.submitter.submit_raw(request, SubmitMode::Sync(SETTLE)).unwrap();
    assert_eq!(words(&map, 2), vec![1, 2]);
}

#[test]
fn test_submit_many_on_one_context() {
    let (s, ctx) = rig();
    let (dst, map, addr) = s.registry.alloc_and_map(&AllocDesc::new(ByteSize::PAGE)).unwrap();

    let requests: Vec<RawSubmission> = [(EngineClass::Render, 3u32), (EngineClass::Copy, 4)]
        .into_iter()
        .enumerate()
        .map(|(i, (class, value))| {
            let mut request = RawSubmission::new(QueueId::new(ctx, EngineId::first(class)));
            request
                .fragments
                .push(program(&s, &isa::store_dword(addr + i as u64 * 4, value)));
            request.resources.push(Resource {
                bo: dst,
                presumed: addr,
                flags: ResourceFlags::WRITE | ResourceFlags::PINNED,
            });
            request
        })
        .collect();

    let fences = s.submitter.submit_many(requests).unwrap();
    assert_eq!(fences.len(), 2);
    assert!(s.coordinator.wait_all(&fences, SETTLE).unwrap().satisfied());
    assert_eq!(words(&map, 2), vec![3, 4]);

    let other = s.submitter.create_context().unwrap();
    let mixed = vec![
        RawSubmission::new(QueueId::new(ctx, EngineId::first(EngineClass::Render))),
        RawSubmission::new(QueueId::new(other, EngineId::first(EngineClass::Render))),
    ];
    assert_eq!(s.submitter.submit_many(mixed), Err(Error::InvalidParameter));
    assert_eq!(s.submitter.submit_many(Vec::new()), Ok(Vec::new()));
}
