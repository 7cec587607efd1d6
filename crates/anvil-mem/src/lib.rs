//! # ANVIL Memory Management
//!
//! Buffer object bookkeeping and GPU virtual address assignment for the
//! batch layer.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                      ANVIL Memory System                        │
//! │                                                                 │
//! │  ┌──────────────────────────┐   ┌────────────────────────────┐  │
//! │  │         Registry         │   │       Offset Cache         │  │
//! │  │ (objects, maps, binding) │   │ (per batch, generation     │  │
//! │  └────────────┬─────────────┘   │  tagged last-known addr)   │  │
//! │               │                 └────────────────────────────┘  │
//! │  ┌────────────┴─────────────┐                                   │
//! │  │      Address Space       │                                   │
//! │  │ (first fit above floor)  │                                   │
//! │  └────────────┬─────────────┘                                   │
//! │               │                                                 │
//! │  ┌────────────┴──────────────────────────────────────────────┐  │
//! │  │                  Device (DeviceHandle)                    │  │
//! │  └───────────────────────────────────────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Address Reuse
//!
//! The address space keeps a placement floor. Raising the floor to the
//! high-water mark guarantees that no address handed out before the raise
//! is ever handed out again by a first-fit allocation, which is what makes
//! a purged offset cache produce genuinely fresh addresses.

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod address_space;
pub mod offset_cache;
pub mod registry;

// Re-exports
pub use address_space::{AddressSpace, AddressSpaceStats};
pub use offset_cache::{CachedOffset, Lookup, OffsetCache};
pub use registry::{Binding, BindingOrigin, Registry, RegistryConfig, RegistryStats};
