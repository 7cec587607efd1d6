//! # Submission Engine
//!
//! Turns a finished batch into a raw submission and hands it to the device.
//!
//! ## Submission Flow
//!
//! 1. Check the stream ends with the end marker and the engine exists
//! 2. Wait out the batch's previous submission, if still running
//! 3. Resolve dependencies and address fields
//! 4. Upload the command words into the batch's buffer object
//! 5. Attach pending semaphore waits for the target queue
//! 6. Submit, record the fence and the device's placements
//! 7. In synchronous mode, wait for completion

use std::sync::Arc;

use anvil_core::{
    ContextId, Device, DeviceInfo, EngineClass, EngineId, EngineInstance, Error,
    FenceHandle, Fragment, HandleKind, QueueId, RawSubmission, RejectReason, Result,
    SubmitReceipt,
};
use anvil_mem::Registry;

use crate::batch::Batch;
use crate::fence::{Coordinator, FenceStatus, Timeout};
use crate::reloc::Resolver;

/// Whether `submit` returns immediately or after completion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitMode {
    /// Return once the device has accepted the work
    Async,
    /// Return once the work has completed, failing with `Timeout` past the bound
    Sync(Timeout),
}

/// Submission engine
pub struct Submitter<D: Device> {
    registry: Arc<Registry<D>>,
    coordinator: Arc<Coordinator<D>>,
    info: DeviceInfo,
}

impl<D: Device> Submitter<D> {
    /// Create a submitter
    pub fn new(registry: Arc<Registry<D>>, coordinator: Arc<Coordinator<D>>) -> Self {
        let info = registry.device().info();
        log::debug!(
            "submitter: {} family {:#x}, engines {:?} x{}",
            info.name,
            info.family,
            info.engines,
            info.instances
        );
        Self {
            registry,
            coordinator,
            info,
        }
    }

    /// Device capabilities
    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }

    /// Create an execution context
    pub fn create_context(&self) -> Result<ContextId> {
        self.registry.device().create_context()
    }

    /// Destroy an execution context
    ///
    /// Fails with `InvalidHandleUse` while any of its queues has work
    /// outstanding.
    pub fn destroy_context(&self, ctx: ContextId) -> Result<()> {
        if !self.coordinator.context_idle(ctx)? {
            log::warn!("submitter: context {} destroyed while busy", ctx.id());
            return Err(HandleKind::Context.into());
        }
        self.registry.device().destroy_context(ctx)?;
        self.coordinator.forget_context(ctx);
        Ok(())
    }

    /// Submit a batch
    pub fn submit(
        &self,
        batch: &mut Batch<D>,
        class: EngineClass,
        instance: EngineInstance,
        ctx: ContextId,
        mode: SubmitMode,
    ) -> Result<FenceHandle> {
        batch.ensure_live()?;
        if !batch.is_terminated() {
            log::warn!("submitter: batch {:?} has no end marker", batch.handle());
            return Err(RejectReason::MissingEndMarker.into());
        }
        #[cfg(feature = "validation")]
        validate_sites(batch)?;

        let queue = QueueId::new(ctx, EngineId::new(class, instance));
        self.check_engine(queue)?;

        // The buffer is rewritten below; the previous run must be done with it.
        if let Some(prev) = batch.last_fence {
            self.coordinator.wait(&prev, Timeout::Infinite)?;
        }
        batch.settle();

        let resolver = Resolver::new(&*batch.registry, &batch.cache, batch.config.mode);
        let resolution = resolver.resolve(batch.bo, &batch.deps, &batch.sites, &mut batch.words)?;
        batch.mapping.write_words(0, &batch.words)?;

        let request = RawSubmission {
            queue,
            fragments: vec![Fragment {
                bo: batch.bo,
                offset: 0,
                len: batch.words.len() as u64 * 4,
            }],
            resources: resolution.resources,
            relocs: resolution.relocs,
            wait: Vec::new(),
            flags: resolution.flags,
        };

        let (fence, receipt) = self.dispatch(request)?;
        batch.last_fence = Some(fence);
        resolver.absorb(&receipt.placements)?;

        self.finish(fence, mode)
    }

    /// Submit a prebuilt request, e.g. one with several fragments
    pub fn submit_raw(&self, request: RawSubmission, mode: SubmitMode) -> Result<FenceHandle> {
        let (fence, _) = self.dispatch(request)?;
        self.finish(fence, mode)
    }

    /// Submit several requests on one context, in order
    ///
    /// Stops at the first rejection; earlier requests stay submitted.
    pub fn submit_many(&self, requests: Vec<RawSubmission>) -> Result<Vec<FenceHandle>> {
        let Some(first) = requests.first() else {
            return Ok(Vec::new());
        };
        let ctx = first.queue.context;
        if requests.iter().any(|r| r.queue.context != ctx) {
            return Err(Error::InvalidParameter);
        }

        let mut fences = Vec::with_capacity(requests.len());
        for request in requests {
            let (fence, _) = self.dispatch(request)?;
            fences.push(fence);
        }
        Ok(fences)
    }

    fn check_engine(&self, queue: QueueId) -> Result<()> {
        if !self.info.has_engine(queue.engine) {
            log::warn!("submitter: engine {} not present", queue.engine);
            return Err(RejectReason::EngineUnavailable.into());
        }
        Ok(())
    }

    fn dispatch(&self, mut request: RawSubmission) -> Result<(FenceHandle, SubmitReceipt)> {
        let queue = request.queue;
        self.check_engine(queue)?;

        let waits = self.coordinator.take_waits(queue);
        request.wait.extend(waits.iter().filter_map(|w| w.fence));

        let receipt = match self.registry.device().submit(&request) {
            Ok(receipt) => receipt,
            Err(e) => {
                log::warn!("submitter: {} rejected: {}", queue, e);
                self.coordinator.restore_waits(queue, waits);
                return Err(e);
            }
        };

        let fence = FenceHandle::new(queue, receipt.seqno);
        self.coordinator.note_submitted(fence);
        self.coordinator.commit_waits(&waits, fence);
        log::debug!(
            "submitter: {} ({} fragments, {} resources, {} relocs, {} waits)",
            fence,
            request.fragments.len(),
            request.resources.len(),
            request.relocs.len(),
            request.wait.len()
        );
        Ok((fence, receipt))
    }

    fn finish(&self, fence: FenceHandle, mode: SubmitMode) -> Result<FenceHandle> {
        match mode {
            SubmitMode::Async => Ok(fence),
            SubmitMode::Sync(timeout) => match self.coordinator.wait(&fence, timeout)? {
                FenceStatus::Expired => Ok(fence),
                _ => Err(Error::Timeout),
            },
        }
    }
}

/// Every address field lies inside the stream and targets a known object
#[cfg(feature = "validation")]
fn validate_sites<D: Device>(batch: &Batch<D>) -> Result<()> {
    let end = batch.offset();
    let mut last_end = 0;
    for site in batch.reloc_sites() {
        let known = site.target == batch.handle()
            || batch.dependencies().iter().any(|d| d.bo == site.target);
        if !known || site.offset < last_end || site.offset + 8 > end {
            log::warn!("submitter: bad address field at {:#x}", site.offset);
            return Err(RejectReason::MalformedStream.into());
        }
        last_end = site.offset + 8;
    }
    Ok(())
}

impl<D: Device> core::fmt::Debug for Submitter<D> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Submitter").field("info", &self.info).finish()
    }
}
