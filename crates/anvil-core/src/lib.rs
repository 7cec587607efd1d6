//! # ANVIL Core
//!
//! Foundational value types, the error taxonomy, and the device-facing traits
//! that the rest of the ANVIL stack builds on.
//!
//! ## Design Principles
//!
//! 1. **Strong identifiers**: engines, contexts, queues and sequence numbers
//!    are distinct value types, so a sequence number from one queue can never
//!    be compared with one from another
//! 2. **Opaque payload**: command words are never interpreted here, beyond the
//!    no-op and end-marker words of a [`cmd::Dialect`]
//! 3. **Device at arm's length**: allocation, mapping, VA reservation,
//!    contexts and raw submission are consumed through [`traits`], never
//!    reimplemented
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      anvil-core                             │
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────────────┐  │
//! │  │   Traits    │  │   Types     │  │     Error           │  │
//! │  │  (Device,   │  │ (GpuAddr,   │  │   Taxonomy          │  │
//! │  │   Submit)   │  │  QueueId)   │  │                     │  │
//! │  └─────────────┘  └─────────────┘  └─────────────────────┘  │
//! └─────────────────────────────────────────────────────────────┘
//! ```

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::new_without_default)]

// =============================================================================
// MODULE EXPORTS
// =============================================================================

pub mod cmd;
pub mod engine;
pub mod error;
pub mod memory;
pub mod traits;
pub mod types;

// Re-exports for convenience
pub use cmd::{Dialect, Domains};
pub use engine::{ContextId, EngineClass, EngineId, EngineInstance, EngineMask, FenceHandle, QueueId, SeqNo};
pub use error::{Error, HandleKind, RejectReason, Result};
pub use memory::{Access, AllocDesc, AllocFlags, CpuMapping, Heap, MappedMemory, TilingTag, VaRange};
pub use traits::*;
pub use types::*;
