//! # ANVIL Core Types
//!
//! Fundamental type definitions used across the stack.
//!
//! These types provide:
//! - Strong typing for device-virtual addresses
//! - Byte sizes with alignment helpers
//! - Typed opaque handles that cannot be mixed across resource kinds

use core::cmp::Ordering;
use core::fmt;
use core::hash::{Hash, Hasher};
use core::marker::PhantomData;
use core::ops::{Add, Sub};

// =============================================================================
// GPU ADDRESS
// =============================================================================

/// GPU Virtual Address
///
/// This is an address in the device's virtual address space.
/// It is NOT a CPU pointer and cannot be dereferenced directly.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct GpuAddr(u64);

impl GpuAddr {
    /// Create a new GPU address
    #[inline]
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    /// Create a null GPU address
    #[inline]
    pub const fn null() -> Self {
        Self(0)
    }

    /// Get the raw u64 value
    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Check if null
    #[inline]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Check alignment
    #[inline]
    pub const fn is_aligned(self, alignment: u64) -> bool {
        self.0 & (alignment - 1) == 0
    }

    /// Align up to boundary
    #[inline]
    pub const fn align_up(self, alignment: u64) -> Self {
        let mask = alignment - 1;
        Self((self.0 + mask) & !mask)
    }

    /// Offset by bytes
    #[inline]
    pub const fn offset(self, bytes: u64) -> Self {
        Self(self.0.wrapping_add(bytes))
    }

    /// Low 32 bits, as written into the first word of an address field
    #[inline]
    pub const fn lower(self) -> u32 {
        self.0 as u32
    }

    /// High 32 bits, as written into the second word of an address field
    #[inline]
    pub const fn upper(self) -> u32 {
        (self.0 >> 32) as u32
    }

    /// Reassemble an address from its two words
    #[inline]
    pub const fn from_words(lower: u32, upper: u32) -> Self {
        Self(((upper as u64) << 32) | lower as u64)
    }
}

impl Add<u64> for GpuAddr {
    type Output = Self;

    fn add(self, rhs: u64) -> Self::Output {
        Self(self.0.wrapping_add(rhs))
    }
}

impl Sub<GpuAddr> for GpuAddr {
    type Output = u64;

    fn sub(self, rhs: GpuAddr) -> Self::Output {
        self.0.wrapping_sub(rhs.0)
    }
}

impl fmt::Debug for GpuAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GpuAddr(0x{:016x})", self.0)
    }
}

impl fmt::Display for GpuAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016x}", self.0)
    }
}

// =============================================================================
// SIZE TYPES
// =============================================================================

/// Size in bytes
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct ByteSize(u64);

impl ByteSize {
    /// Zero size
    pub const ZERO: Self = Self(0);
    /// 4 KiB, one page
    pub const PAGE: Self = Self(4 * 1024);

    /// Create from bytes
    #[inline]
    pub const fn from_bytes(bytes: u64) -> Self {
        Self(bytes)
    }

    /// Create from KiB
    #[inline]
    pub const fn from_kib(kib: u64) -> Self {
        Self(kib * 1024)
    }

    /// Create from MiB
    #[inline]
    pub const fn from_mib(mib: u64) -> Self {
        Self(mib * 1024 * 1024)
    }

    /// Create from GiB
    #[inline]
    pub const fn from_gib(gib: u64) -> Self {
        Self(gib * 1024 * 1024 * 1024)
    }

    /// Get as bytes
    #[inline]
    pub const fn as_bytes(self) -> u64 {
        self.0
    }

    /// Number of whole 32-bit words
    #[inline]
    pub const fn as_words(self) -> u64 {
        self.0 / 4
    }

    /// Align up
    #[inline]
    pub const fn align_up(self, alignment: u64) -> Self {
        let mask = alignment - 1;
        Self((self.0 + mask) & !mask)
    }
}

impl fmt::Debug for ByteSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 >= 1024 * 1024 * 1024 {
            write!(f, "{} GiB", self.0 / (1024 * 1024 * 1024))
        } else if self.0 >= 1024 * 1024 {
            write!(f, "{} MiB", self.0 / (1024 * 1024))
        } else if self.0 >= 1024 {
            write!(f, "{} KiB", self.0 / 1024)
        } else {
            write!(f, "{} B", self.0)
        }
    }
}

impl fmt::Display for ByteSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

// =============================================================================
// HANDLE TYPES
// =============================================================================

/// Opaque handle to a device resource
///
/// Handles are type-safe wrappers that prevent mixing different resource types.
/// Ids are never reused by the allocating side, so a stale handle is detectable.
#[repr(transparent)]
pub struct Handle<T> {
    id: u64,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Handle<T> {
    /// Create a new handle
    #[inline]
    pub const fn new(id: u64) -> Self {
        Self {
            id,
            _marker: PhantomData,
        }
    }

    /// Create a null handle
    #[inline]
    pub const fn null() -> Self {
        Self::new(0)
    }

    /// Get the raw ID
    #[inline]
    pub const fn id(self) -> u64 {
        self.id
    }

    /// Check if null
    #[inline]
    pub const fn is_null(self) -> bool {
        self.id == 0
    }
}

// Manual impls: the marker type carries no data and needs no bounds.
impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Handle<T> {}

impl<T> PartialEq for Handle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl<T> Eq for Handle<T> {}

impl<T> PartialOrd for Handle<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Handle<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.id.cmp(&other.id)
    }
}

impl<T> Hash for Handle<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl<T> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = core::any::type_name::<T>();
        let short = name.rsplit("::").next().unwrap_or(name);
        write!(f, "Handle<{}>(0x{:x})", short, self.id)
    }
}

// Marker types for handles
/// Marker for buffer object handle
#[derive(Debug)]
pub struct BufferMarker;
/// Marker for execution context handle
#[derive(Debug)]
pub struct ContextMarker;
/// Marker for cross-queue semaphore handle
#[derive(Debug)]
pub struct SemaphoreMarker;

/// Handle to a device buffer object
pub type BufferHandle = Handle<BufferMarker>;
/// Handle to a cross-queue semaphore
pub type SemaphoreHandle = Handle<SemaphoreMarker>;
