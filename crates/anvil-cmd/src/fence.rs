//! # Fence Coordination
//!
//! Completion tracking for submissions and blocking waits over sets of
//! fences.
//!
//! ## Fence States
//!
//! ```text
//!            ┌─────────┐   device completes   ┌─────────┐
//!            │ Pending │─────────────────────►│ Expired │
//!            └────┬────┘                      └─────────┘
//!                 │ bounded wait elapses
//!                 ▼
//!            ┌──────────┐
//!            │ TimedOut │  (outcome of that wait only;
//!            └──────────┘   a fresh wait re-evaluates)
//! ```
//!
//! Once a queue's completed sequence number has been observed, every fence
//! at or below it is answered from the cache without asking the device.

use std::sync::Arc;
use std::time::{Duration, Instant};

use hashbrown::HashMap;
use spin::Mutex;

use anvil_core::{ContextId, Device, Error, FenceHandle, HandleKind, QueueId, Result, SeqNo};

use crate::semaphore::SemaphoreTable;

// =============================================================================
// TIMEOUTS AND RESULTS
// =============================================================================

/// How long a wait may block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeout {
    /// Block until the condition holds
    Infinite,
    /// Block at most this many nanoseconds
    Nanos(u64),
}

impl Timeout {
    /// Poll without blocking
    pub const ZERO: Timeout = Timeout::Nanos(0);

    /// Bounded timeout in milliseconds
    pub const fn from_millis(ms: u64) -> Self {
        Self::Nanos(ms * 1_000_000)
    }

    /// Bounded timeout from a duration
    pub fn from_duration(duration: Duration) -> Self {
        Self::Nanos(u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX))
    }

    fn deadline(self, start: Instant) -> Option<Instant> {
        match self {
            Self::Infinite => None,
            Self::Nanos(ns) => Some(
                start
                    .checked_add(Duration::from_nanos(ns))
                    .unwrap_or_else(|| start + Duration::from_secs(u32::MAX as u64)),
            ),
        }
    }
}

/// Observed state of a fence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FenceStatus {
    /// Not yet complete
    Pending,
    /// Complete
    Expired,
    /// A bounded wait elapsed first
    TimedOut,
}

/// Outcome of a multi-fence wait
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WaitResult {
    /// Fences observed expired at return time, in input order
    pub expired: Vec<FenceHandle>,
    /// Input index of the first fence seen expired
    pub first: Option<usize>,
    /// `Expired` if the wait condition held, `TimedOut` otherwise
    pub status: FenceStatus,
}

impl WaitResult {
    /// Whether the wait condition held
    pub fn satisfied(&self) -> bool {
        self.status == FenceStatus::Expired
    }
}

// =============================================================================
// COORDINATOR
// =============================================================================

#[derive(Debug, Default)]
struct FenceState {
    /// Highest completed seqno seen per queue
    observed: HashMap<QueueId, SeqNo>,
    /// Highest submitted seqno per queue
    submitted: HashMap<QueueId, SeqNo>,
}

/// Fence and semaphore coordinator
///
/// Lock order is semaphores before fences.
pub struct Coordinator<D: Device> {
    pub(crate) device: Arc<D>,
    fences: Mutex<FenceState>,
    pub(crate) semaphores: Mutex<SemaphoreTable>,
}

impl<D: Device> Coordinator<D> {
    /// Create a coordinator for `device`
    pub fn new(device: Arc<D>) -> Self {
        Self {
            device,
            fences: Mutex::new(FenceState::default()),
            semaphores: Mutex::new(SemaphoreTable::new()),
        }
    }

    /// Underlying device
    pub fn device(&self) -> &Arc<D> {
        &self.device
    }

    pub(crate) fn note_submitted(&self, fence: FenceHandle) {
        let mut state = self.fences.lock();
        let last = state.submitted.entry(fence.queue()).or_default();
        *last = (*last).max(fence.seqno());
    }

    /// Most recent submission on `queue`
    pub fn last_submitted(&self, queue: QueueId) -> Option<FenceHandle> {
        self.fences
            .lock()
            .submitted
            .get(&queue)
            .map(|seqno| FenceHandle::new(queue, *seqno))
    }

    fn validate(&self, fence: &FenceHandle) -> Result<()> {
        let state = self.fences.lock();
        let submitted = state.submitted.get(&fence.queue()).copied().unwrap_or_default();
        if fence.seqno() == SeqNo::NONE || fence.seqno() > submitted {
            log::warn!("fence {} was never issued", fence);
            return Err(HandleKind::Fence.into());
        }
        Ok(())
    }

    /// Non-blocking completion check
    pub fn is_expired(&self, fence: &FenceHandle) -> Result<bool> {
        self.validate(fence)?;
        self.poll(fence)
    }

    /// Non-blocking status query
    pub fn status(&self, fence: &FenceHandle) -> Result<FenceStatus> {
        Ok(if self.is_expired(fence)? {
            FenceStatus::Expired
        } else {
            FenceStatus::Pending
        })
    }

    fn poll(&self, fence: &FenceHandle) -> Result<bool> {
        let queue = fence.queue();
        if let Some(seen) = self.fences.lock().observed.get(&queue) {
            if fence.is_covered_by(*seen) {
                return Ok(true);
            }
        }

        let completed = self.device.completed(queue)?;
        let mut state = self.fences.lock();
        let seen = state.observed.entry(queue).or_default();
        *seen = (*seen).max(completed);
        Ok(fence.is_covered_by(*seen))
    }

    /// Block until `fence` expires or `timeout` elapses
    pub fn wait(&self, fence: &FenceHandle, timeout: Timeout) -> Result<FenceStatus> {
        Ok(self.wait_for(core::slice::from_ref(fence), true, timeout)?.status)
    }

    /// Block until any fence expires or `timeout` elapses
    pub fn wait_any(&self, fences: &[FenceHandle], timeout: Timeout) -> Result<WaitResult> {
        if fences.is_empty() {
            return Err(Error::InvalidParameter);
        }
        self.wait_for(fences, false, timeout)
    }

    /// Block until every fence expires or `timeout` elapses
    ///
    /// On timeout the result lists the subset that did expire.
    pub fn wait_all(&self, fences: &[FenceHandle], timeout: Timeout) -> Result<WaitResult> {
        self.wait_for(fences, true, timeout)
    }

    fn wait_for(&self, fences: &[FenceHandle], all: bool, timeout: Timeout) -> Result<WaitResult> {
        for fence in fences {
            self.validate(fence)?;
        }

        let deadline = timeout.deadline(Instant::now());
        let mut first = None;
        loop {
            // Read the epoch before polling so a completion in between still wakes us.
            let epoch = self.device.progress();

            let mut expired = Vec::with_capacity(fences.len());
            for (i, fence) in fences.iter().enumerate() {
                if self.poll(fence)? {
                    first.get_or_insert(i);
                    expired.push(*fence);
                }
            }

            let done = if all {
                expired.len() == fences.len()
            } else {
                !expired.is_empty()
            };
            if done {
                return Ok(WaitResult {
                    expired,
                    first,
                    status: FenceStatus::Expired,
                });
            }

            if deadline.map_or(false, |d| Instant::now() >= d) {
                log::debug!(
                    "wait_{} timed out with {}/{} fences expired",
                    if all { "all" } else { "any" },
                    expired.len(),
                    fences.len()
                );
                return Ok(WaitResult {
                    expired,
                    first,
                    status: FenceStatus::TimedOut,
                });
            }

            self.device.wait_progress(epoch, deadline);
        }
    }

    /// Whether every submission on `queue` has completed
    pub fn queue_idle(&self, queue: QueueId) -> Result<bool> {
        match self.last_submitted(queue) {
            Some(fence) => self.poll(&fence),
            None => Ok(true),
        }
    }

    /// Whether every submission on every queue of `ctx` has completed
    pub fn context_idle(&self, ctx: ContextId) -> Result<bool> {
        let queues: Vec<QueueId> = self
            .fences
            .lock()
            .submitted
            .keys()
            .filter(|q| q.context == ctx)
            .copied()
            .collect();
        for queue in queues {
            if !self.queue_idle(queue)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    pub(crate) fn forget_context(&self, ctx: ContextId) {
        self.semaphores.lock().drop_context(ctx);
        let mut state = self.fences.lock();
        state.observed.retain(|q, _| q.context != ctx);
        state.submitted.retain(|q, _| q.context != ctx);
    }
}

impl<D: Device> core::fmt::Debug for Coordinator<D> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let state = self.fences.lock();
        f.debug_struct("Coordinator")
            .field("queues", &state.submitted.len())
            .finish()
    }
}
