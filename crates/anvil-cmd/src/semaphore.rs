//! # Cross-Queue Semaphores
//!
//! A semaphore orders work between queues without blocking the host.
//!
//! `signal` captures the producer queue's most recent submission. A
//! `wait_semaphore` on a consumer queue consumes the signal and turns it
//! into an in-fence of the next submission on that queue, so the device
//! holds the consumer back until the producer's work has completed.
//!
//! ```text
//!   Unsignaled ──signal──► Signaled ──wait_semaphore──► Unsignaled
//!        │                    │
//!        └─wait: error        └─signal: error
//! ```

use hashbrown::HashMap;

use anvil_core::{
    ContextId, Device, EngineClass, EngineId, EngineInstance, FenceHandle, HandleKind, QueueId,
    Result, SemaphoreHandle,
};

use crate::fence::Coordinator;

/// Observable semaphore state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SemaphoreState {
    /// No signal pending
    Unsignaled,
    /// Signal enqueued behind producer work that is still running
    Pending,
    /// Producer work complete, signal not yet consumed
    Signaled,
}

/// A consumed signal waiting to be attached to a submission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingWait {
    /// Semaphore the signal came from
    pub sem: SemaphoreHandle,
    /// Producer fence, `None` if the producer queue was already empty
    pub fence: Option<FenceHandle>,
}

#[derive(Debug)]
struct Semaphore {
    /// `Some` while signaled
    signal: Option<Option<FenceHandle>>,
    /// Consumer queue of a wait not yet attached to a submission
    queued_on: Option<QueueId>,
    /// Submission that carries the last consumed wait
    consumer: Option<FenceHandle>,
}

/// Semaphore state machine and per-queue pending waits
#[derive(Debug, Default)]
pub struct SemaphoreTable {
    next: u64,
    sems: HashMap<SemaphoreHandle, Semaphore>,
    pending: HashMap<QueueId, Vec<PendingWait>>,
}

impl SemaphoreTable {
    /// Empty table
    pub fn new() -> Self {
        Self {
            next: 1,
            ..Self::default()
        }
    }

    /// Create an unsignaled semaphore
    pub fn create(&mut self) -> SemaphoreHandle {
        let sem = SemaphoreHandle::new(self.next);
        self.next += 1;
        self.sems.insert(sem, Semaphore {
            signal: None,
            queued_on: None,
            consumer: None,
        });
        sem
    }

    fn get_mut(&mut self, sem: SemaphoreHandle) -> Result<&mut Semaphore> {
        self.sems.get_mut(&sem).ok_or(HandleKind::Semaphore.into())
    }

    /// Current state, with `expired` deciding whether the producer is done
    pub fn state(
        &self,
        sem: SemaphoreHandle,
        mut expired: impl FnMut(&FenceHandle) -> bool,
    ) -> Result<SemaphoreState> {
        let s = self.sems.get(&sem).ok_or(HandleKind::Semaphore)?;
        Ok(match &s.signal {
            None => SemaphoreState::Unsignaled,
            Some(Some(fence)) if !expired(fence) => SemaphoreState::Pending,
            Some(_) => SemaphoreState::Signaled,
        })
    }

    /// Signal once `after` completes
    pub fn signal(&mut self, sem: SemaphoreHandle, after: Option<FenceHandle>) -> Result<()> {
        let s = self.get_mut(sem)?;
        if s.signal.is_some() {
            log::warn!("semaphore {:?} signaled twice", sem);
            return Err(HandleKind::Semaphore.into());
        }
        s.signal = Some(after);
        Ok(())
    }

    /// Consume the signal on behalf of `queue`
    pub fn wait(&mut self, sem: SemaphoreHandle, queue: QueueId) -> Result<()> {
        let s = self.get_mut(sem)?;
        let Some(fence) = s.signal.take() else {
            log::warn!("semaphore {:?} waited before being signaled", sem);
            return Err(HandleKind::Semaphore.into());
        };
        s.queued_on = Some(queue);
        self.pending.entry(queue).or_default().push(PendingWait { sem, fence });
        Ok(())
    }

    /// Detach the waits queued for `queue`
    pub fn take_waits(&mut self, queue: QueueId) -> Vec<PendingWait> {
        self.pending.remove(&queue).unwrap_or_default()
    }

    /// Put waits back after a failed submission
    pub fn restore_waits(&mut self, queue: QueueId, mut waits: Vec<PendingWait>) {
        if waits.is_empty() {
            return;
        }
        let slot = self.pending.entry(queue).or_default();
        waits.append(slot);
        *slot = waits;
    }

    /// Record the submission that carried `waits`
    pub fn commit_waits(&mut self, waits: &[PendingWait], consumer: FenceHandle) {
        for wait in waits {
            if let Some(s) = self.sems.get_mut(&wait.sem) {
                s.queued_on = None;
                s.consumer = Some(consumer);
            }
        }
    }

    /// Destroy a semaphore
    ///
    /// Fails while a consumed wait is unsubmitted or its consumer is
    /// still running.
    pub fn destroy(
        &mut self,
        sem: SemaphoreHandle,
        mut expired: impl FnMut(&FenceHandle) -> bool,
    ) -> Result<()> {
        let s = self.sems.get(&sem).ok_or(HandleKind::Semaphore)?;
        let busy = s.queued_on.is_some() || s.consumer.as_ref().map_or(false, |f| !expired(f));
        if busy {
            log::warn!("semaphore {:?} destroyed with a wait outstanding", sem);
            return Err(HandleKind::Semaphore.into());
        }
        self.sems.remove(&sem);
        Ok(())
    }

    /// Drop all waits queued on `ctx`'s queues
    pub fn drop_context(&mut self, ctx: ContextId) {
        let queues: Vec<QueueId> = self.pending.keys().filter(|q| q.context == ctx).copied().collect();
        for queue in queues {
            for wait in self.pending.remove(&queue).unwrap_or_default() {
                if let Some(s) = self.sems.get_mut(&wait.sem) {
                    s.queued_on = None;
                }
            }
        }
    }
}

// =============================================================================
// COORDINATOR SEMAPHORE API
// =============================================================================

impl<D: Device> Coordinator<D> {
    /// Create an unsignaled semaphore
    pub fn create_semaphore(&self) -> SemaphoreHandle {
        self.semaphores.lock().create()
    }

    /// Destroy a semaphore
    pub fn destroy_semaphore(&self, sem: SemaphoreHandle) -> Result<()> {
        let mut table = self.semaphores.lock();
        table.destroy(sem, |fence| self.is_expired(fence).unwrap_or(false))
    }

    /// Current semaphore state
    pub fn semaphore_state(&self, sem: SemaphoreHandle) -> Result<SemaphoreState> {
        let table = self.semaphores.lock();
        table.state(sem, |fence| self.is_expired(fence).unwrap_or(false))
    }

    /// Signal `sem` once everything queued so far on the engine completes
    ///
    /// The semaphore reads `Pending` until the captured work completes.
    /// A wait may consume it in either state.
    pub fn signal(
        &self,
        ctx: ContextId,
        class: EngineClass,
        instance: EngineInstance,
        sem: SemaphoreHandle,
    ) -> Result<()> {
        let queue = QueueId::new(ctx, EngineId::new(class, instance));
        let after = self.last_submitted(queue);
        self.semaphores.lock().signal(sem, after)?;
        log::debug!("semaphore {:?} signaled after {:?}", sem, after.map(|f| f.seqno()));
        Ok(())
    }

    /// Hold back later work on the engine until `sem` is signaled
    pub fn wait_semaphore(
        &self,
        ctx: ContextId,
        class: EngineClass,
        instance: EngineInstance,
        sem: SemaphoreHandle,
    ) -> Result<()> {
        let queue = QueueId::new(ctx, EngineId::new(class, instance));
        self.semaphores.lock().wait(sem, queue)?;
        log::debug!("semaphore {:?} wait queued on {}", sem, queue);
        Ok(())
    }

    pub(crate) fn take_waits(&self, queue: QueueId) -> Vec<PendingWait> {
        self.semaphores.lock().take_waits(queue)
    }

    pub(crate) fn restore_waits(&self, queue: QueueId, waits: Vec<PendingWait>) {
        self.semaphores.lock().restore_waits(queue, waits);
    }

    pub(crate) fn commit_waits(&self, waits: &[PendingWait], consumer: FenceHandle) {
        if !waits.is_empty() {
            self.semaphores.lock().commit_waits(waits, consumer);
        }
    }
}
