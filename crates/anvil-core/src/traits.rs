//! # ANVIL Device Traits
//!
//! The device-facing surface the batch layer consumes and never
//! reimplements.
//!
//! ## Trait Hierarchy
//!
//! ```text
//! Device
//!    │
//!    ├── DeviceHandle      (alloc, map, VA reservation, binding, info)
//!    │
//!    ├── ContextPrimitive  (create/destroy execution contexts)
//!    │
//!    └── SubmitPrimitive   (raw submission, completion query)
//! ```

use std::time::Instant;

use crate::cmd::Domains;
use crate::engine::*;
use crate::error::Result;
use crate::memory::*;
use crate::types::*;

// =============================================================================
// DEVICE INFO
// =============================================================================

/// Static device capabilities
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Human-readable device name
    pub name: &'static str,
    /// Generation / family identifier
    pub family: u32,
    /// Engine classes present
    pub engines: EngineMask,
    /// Instances available per engine class
    pub instances: u8,
    /// Usable virtual address range
    pub va_range: VaRange,
}

impl DeviceInfo {
    /// Whether `engine` exists on this device
    pub fn has_engine(&self, engine: EngineId) -> bool {
        self.engines.contains(engine.class.mask()) && engine.instance.index() < self.instances
    }
}

// =============================================================================
// DEVICE HANDLE
// =============================================================================

/// Memory and address-space services of a device
pub trait DeviceHandle: Send + Sync {
    /// Query device capabilities
    fn info(&self) -> DeviceInfo;

    /// Allocate a buffer object
    fn alloc(&self, desc: &AllocDesc) -> Result<BufferHandle>;

    /// Free a buffer object, dropping any binding it still has
    fn free(&self, bo: BufferHandle) -> Result<()>;

    /// Map a buffer object for CPU access
    fn map(&self, bo: BufferHandle) -> Result<CpuMapping>;

    /// Unmap a buffer object
    fn unmap(&self, bo: BufferHandle) -> Result<()>;

    /// Reserve a virtual address range
    fn reserve_va(&self, size: ByteSize, alignment: u64) -> Result<VaRange>;

    /// Release a reserved virtual address range
    fn release_va(&self, range: VaRange) -> Result<()>;

    /// Bind a buffer object at a virtual address
    fn bind(&self, bo: BufferHandle, addr: GpuAddr) -> Result<()>;

    /// Remove a buffer object's binding
    fn unbind(&self, bo: BufferHandle) -> Result<()>;
}

// =============================================================================
// CONTEXT PRIMITIVE
// =============================================================================

/// Execution context management
pub trait ContextPrimitive: Send + Sync {
    /// Create an execution context
    fn create_context(&self) -> Result<ContextId>;

    /// Destroy an execution context
    fn destroy_context(&self, ctx: ContextId) -> Result<()>;
}

// =============================================================================
// RAW SUBMISSION
// =============================================================================

/// One command-buffer fragment of a submission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fragment {
    /// Object holding the commands
    pub bo: BufferHandle,
    /// Byte offset of the first command word
    pub offset: u64,
    /// Length in bytes
    pub len: u64,
}

bitflags::bitflags! {
    /// Per-resource submission flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ResourceFlags: u32 {
        /// Device may write the object
        const WRITE = 1 << 0;
        /// Object must live exactly at its presumed address
        const PINNED = 1 << 1;
    }
}

/// One entry of the submission's resource list
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resource {
    /// Referenced object
    pub bo: BufferHandle,
    /// Address the submitter believes the object lives at, null if unknown
    pub presumed: GpuAddr,
    /// Resource flags
    pub flags: ResourceFlags,
}

/// Address field the device must patch at submission time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelocEntry {
    /// Object whose address is written
    pub target: BufferHandle,
    /// Object holding the address field
    pub holder: BufferHandle,
    /// Byte offset of the 64-bit field within `holder`
    pub offset: u64,
    /// Added to the target address
    pub delta: u64,
    /// Value currently in the field, minus `delta`
    pub presumed: GpuAddr,
    /// Read domain hints
    pub read_domains: Domains,
    /// Write domain hint
    pub write_domain: Domains,
}

bitflags::bitflags! {
    /// Whole-submission flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct SubmitFlags: u32 {
        /// Presumed addresses are final; no relocation processing
        const NO_RELOC = 1 << 0;
    }
}

/// Everything the device needs for one submission
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawSubmission {
    /// Target queue
    pub queue: QueueId,
    /// Command fragments, executed in order
    pub fragments: Vec<Fragment>,
    /// Objects referenced by the commands
    pub resources: Vec<Resource>,
    /// Address fields to patch
    pub relocs: Vec<RelocEntry>,
    /// Fences that must expire before execution starts
    pub wait: Vec<FenceHandle>,
    /// Submission flags
    pub flags: SubmitFlags,
}

impl RawSubmission {
    /// Empty submission on `queue`
    pub fn new(queue: QueueId) -> Self {
        Self {
            queue,
            fragments: Vec::new(),
            resources: Vec::new(),
            relocs: Vec::new(),
            wait: Vec::new(),
            flags: SubmitFlags::empty(),
        }
    }
}

/// Device answer to an accepted submission
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitReceipt {
    /// Sequence number assigned on the submission's queue
    pub seqno: SeqNo,
    /// Final address of every resource and fragment object
    pub placements: Vec<(BufferHandle, GpuAddr)>,
}

// =============================================================================
// SUBMIT PRIMITIVE
// =============================================================================

/// Raw submission and completion tracking
pub trait SubmitPrimitive: Send + Sync {
    /// Hand a submission to the device
    fn submit(&self, request: &RawSubmission) -> Result<SubmitReceipt>;

    /// Highest sequence number completed on `queue`
    fn completed(&self, queue: QueueId) -> Result<SeqNo>;

    /// Completion epoch, bumped whenever any queue completes work
    fn progress(&self) -> u64;

    /// Block until the epoch moves past `seen` or `deadline` passes
    ///
    /// Returns the epoch observed on return.
    fn wait_progress(&self, seen: u64, deadline: Option<Instant>) -> u64;
}

/// A complete device
pub trait Device: DeviceHandle + ContextPrimitive + SubmitPrimitive {}

impl<T: DeviceHandle + ContextPrimitive + SubmitPrimitive> Device for T {}

// =============================================================================
// RESOURCE LIFECYCLE
// =============================================================================

/// Trait for resources that need explicit cleanup
pub trait Destroyable {
    /// Destroy the resource, releasing device memory
    ///
    /// Fails with `InvalidHandleUse` while the device may still use it.
    fn destroy(&mut self) -> Result<()>;

    /// Whether [`destroy`](Self::destroy) has completed
    fn is_destroyed(&self) -> bool;
}

// =============================================================================
// COMPILE-TIME ASSERTIONS
// =============================================================================

static_assertions::assert_impl_all!(GpuAddr: Send, Sync, Copy);
static_assertions::assert_impl_all!(ByteSize: Send, Sync, Copy);
static_assertions::assert_impl_all!(BufferHandle: Send, Sync, Copy);
static_assertions::assert_impl_all!(FenceHandle: Send, Sync, Copy);
static_assertions::assert_impl_all!(QueueId: Send, Sync, Copy);
static_assertions::assert_impl_all!(CpuMapping: Send, Sync, Clone);
static_assertions::assert_impl_all!(RawSubmission: Send, Sync);
