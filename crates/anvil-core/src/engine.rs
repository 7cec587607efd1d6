//! # Engines, Contexts and Queues
//!
//! Identifiers for hardware execution units and the ordered queues that
//! submissions land on.
//!
//! A queue is one (context, engine) pair. Sequence numbers are only
//! meaningful inside the queue that issued them, which is why [`SeqNo`] is
//! never exposed without its [`QueueId`] in a [`FenceHandle`].

use core::fmt;

use crate::types::{ContextMarker, Handle};

// =============================================================================
// ENGINE CLASS
// =============================================================================

/// Category of hardware execution unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum EngineClass {
    /// 3D / general command streamer
    Render = 0,
    /// Compute-only command streamer
    Compute = 1,
    /// Copy / DMA engine
    Copy = 2,
    /// Video decode/encode engine
    Video = 3,
}

impl EngineClass {
    /// All engine classes, in discriminant order
    pub const ALL: [EngineClass; 4] = [Self::Render, Self::Compute, Self::Copy, Self::Video];

    /// Availability bit for this class
    pub const fn mask(self) -> EngineMask {
        match self {
            Self::Render => EngineMask::RENDER,
            Self::Compute => EngineMask::COMPUTE,
            Self::Copy => EngineMask::COPY,
            Self::Video => EngineMask::VIDEO,
        }
    }

    /// Short name used in logs
    pub const fn name(self) -> &'static str {
        match self {
            Self::Render => "rcs",
            Self::Compute => "ccs",
            Self::Copy => "bcs",
            Self::Video => "vcs",
        }
    }
}

bitflags::bitflags! {
    /// Engine availability bitmask reported by the device
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct EngineMask: u32 {
        /// Render engine present
        const RENDER = 1 << 0;
        /// Compute engine present
        const COMPUTE = 1 << 1;
        /// Copy engine present
        const COPY = 1 << 2;
        /// Video engine present
        const VIDEO = 1 << 3;
    }
}

// =============================================================================
// ENGINE IDENTITY
// =============================================================================

/// Index of one queue (ring) within an engine class
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct EngineInstance(u8);

impl EngineInstance {
    /// First instance of a class
    pub const ZERO: Self = Self(0);

    /// Create an instance index
    #[inline]
    pub const fn new(index: u8) -> Self {
        Self(index)
    }

    /// Raw index
    #[inline]
    pub const fn index(self) -> u8 {
        self.0
    }
}

/// A specific engine: class plus instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EngineId {
    /// Engine category
    pub class: EngineClass,
    /// Instance within the category
    pub instance: EngineInstance,
}

impl EngineId {
    /// Create an engine id
    #[inline]
    pub const fn new(class: EngineClass, instance: EngineInstance) -> Self {
        Self { class, instance }
    }

    /// Instance zero of `class`
    #[inline]
    pub const fn first(class: EngineClass) -> Self {
        Self::new(class, EngineInstance::ZERO)
    }
}

impl fmt::Display for EngineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.class.name(), self.instance.0)
    }
}

// =============================================================================
// CONTEXTS AND QUEUES
// =============================================================================

/// Execution context handle
pub type ContextId = Handle<ContextMarker>;

/// One ordered submission queue: a (context, engine) pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct QueueId {
    /// Owning context
    pub context: ContextId,
    /// Target engine
    pub engine: EngineId,
}

impl QueueId {
    /// Create a queue id
    #[inline]
    pub const fn new(context: ContextId, engine: EngineId) -> Self {
        Self { context, engine }
    }
}

impl fmt::Display for QueueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx{}:{}", self.context.id(), self.engine)
    }
}

// =============================================================================
// SEQUENCE NUMBERS AND FENCES
// =============================================================================

/// Per-queue monotonically increasing submission sequence number
///
/// `SeqNo::NONE` (zero) means "nothing has completed yet"; the first
/// submission on a queue receives 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct SeqNo(u64);

impl SeqNo {
    /// No submission
    pub const NONE: Self = Self(0);

    /// Wrap a raw sequence number
    #[inline]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Raw value
    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// The following sequence number
    #[inline]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

/// Completion handle for one submission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FenceHandle {
    queue: QueueId,
    seqno: SeqNo,
}

impl FenceHandle {
    /// Create a fence for `seqno` on `queue`
    #[inline]
    pub const fn new(queue: QueueId, seqno: SeqNo) -> Self {
        Self { queue, seqno }
    }

    /// Queue the fence belongs to
    #[inline]
    pub const fn queue(&self) -> QueueId {
        self.queue
    }

    /// Sequence number within the queue
    #[inline]
    pub const fn seqno(&self) -> SeqNo {
        self.seqno
    }

    /// Whether a queue that has completed up to `completed` covers this fence
    #[inline]
    pub fn is_covered_by(&self, completed: SeqNo) -> bool {
        self.seqno <= completed
    }

    /// Submission order relative to `other`, or `None` across queues
    pub fn precedes(&self, other: &FenceHandle) -> Option<bool> {
        (self.queue == other.queue).then(|| self.seqno < other.seqno)
    }
}

impl fmt::Display for FenceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.queue, self.seqno.0)
    }
}
