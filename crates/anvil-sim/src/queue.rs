//! # Engine Queues
//!
//! One worker thread per (context, engine) queue. Jobs on a queue run in
//! submission order; different queues run concurrently.
//!
//! ```text
//!   submit ──► mpsc ──► worker ──► wait in-fences ──► execute ops
//!                                                       │
//!                    Condvar::notify_all ◄── completed = seqno, epoch += 1
//! ```

use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anvil_core::{FenceHandle, GpuAddr, QueueId, SeqNo};

use crate::device::{DeviceState, Shared};
use crate::isa::Op;

/// Poll interval of SEMAPHORE_WAIT
const POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Work handed to a queue
#[derive(Debug)]
pub(crate) struct Job {
    pub(crate) seqno: SeqNo,
    pub(crate) waits: Vec<FenceHandle>,
    pub(crate) ops: Vec<Op>,
}

/// Handle on a running queue thread
#[derive(Debug)]
pub(crate) struct QueueWorker {
    tx: Sender<Job>,
    thread: JoinHandle<()>,
}

impl QueueWorker {
    /// Start the worker thread for `queue`
    pub(crate) fn spawn(queue: QueueId, shared: Arc<Shared>) -> std::io::Result<Self> {
        let (tx, rx) = mpsc::channel();
        let thread = thread::Builder::new()
            .name(format!("sim-{}", queue))
            .spawn(move || run(queue, &shared, rx))?;
        Ok(Self { tx, thread })
    }

    /// Queue a job; false if the worker has exited
    pub(crate) fn push(&self, job: Job) -> bool {
        self.tx.send(job).is_ok()
    }

    /// Stop accepting jobs; the thread exits once its backlog drains
    pub(crate) fn retire(self) -> JoinHandle<()> {
        drop(self.tx);
        self.thread
    }
}

fn run(queue: QueueId, shared: &Shared, rx: Receiver<Job>) {
    log::trace!("sim: {} worker started", queue);
    while let Ok(job) = rx.recv() {
        if !wait_fences(shared, &job.waits) {
            break;
        }
        for op in &job.ops {
            if !execute(shared, queue, op) {
                log::debug!("sim: {} abandoning job {} at shutdown", queue, job.seqno.raw());
                return;
            }
        }

        let mut state = shared.lock();
        state.queue_mut(queue).completed = job.seqno;
        state.epoch += 1;
        drop(state);
        shared.progress.notify_all();
        log::trace!("sim: {} completed {}", queue, job.seqno.raw());
    }
    log::trace!("sim: {} worker exiting", queue);
}

/// Block until every in-fence has expired; false on shutdown
fn wait_fences(shared: &Shared, waits: &[FenceHandle]) -> bool {
    let mut state = shared.lock();
    loop {
        if state.shutdown {
            return false;
        }
        if waits.iter().all(|f| f.is_covered_by(state.completed(f.queue()))) {
            return true;
        }
        state = shared.wait(state);
    }
}

/// Run one instruction; false on shutdown
fn execute(shared: &Shared, queue: QueueId, op: &Op) -> bool {
    match *op {
        Op::StoreDword { addr, value } => {
            store(shared, queue, addr, value);
        }
        Op::StoreQword { addr, value } => {
            store(shared, queue, addr, value as u32);
            store(shared, queue, addr + 4, (value >> 32) as u32);
        }
        Op::Copy { dst, src, words } => {
            for i in 0..words as u64 {
                if let Some(value) = load(shared, queue, src + i * 4) {
                    store(shared, queue, dst + i * 4, value);
                }
            }
        }
        Op::SemaphoreWait { addr, value } => {
            let mut state = shared.lock();
            loop {
                if state.shutdown {
                    return false;
                }
                match read_locked(&state, addr) {
                    Some(v) if v == value => break,
                    Some(_) => {}
                    None => {
                        log::warn!("sim: {} semaphore wait on unbound {}", queue, addr);
                        break;
                    }
                }
                state = shared.wait_timeout(state, POLL_INTERVAL);
            }
        }
        Op::Delay { micros } => thread::sleep(Duration::from_micros(micros as u64)),
    }
    true
}

fn read_locked(state: &MutexGuard<'_, DeviceState>, addr: GpuAddr) -> Option<u32> {
    let (memory, offset) = state.resolve(addr)?;
    anvil_core::MappedMemory::read_u32(&*memory, offset).ok()
}

fn load(shared: &Shared, queue: QueueId, addr: GpuAddr) -> Option<u32> {
    let value = read_locked(&shared.lock(), addr);
    if value.is_none() {
        log::warn!("sim: {} read fault at {}", queue, addr);
    }
    value
}

fn store(shared: &Shared, queue: QueueId, addr: GpuAddr, value: u32) {
    let target = shared.lock().resolve(addr);
    let written = target
        .map(|(memory, offset)| anvil_core::MappedMemory::write_u32(&*memory, offset, value).is_ok())
        .unwrap_or(false);
    if !written {
        log::warn!("sim: {} write fault at {}", queue, addr);
    }
}
