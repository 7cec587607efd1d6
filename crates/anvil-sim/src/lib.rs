//! # ANVIL Reference Device
//!
//! A software device that implements [`anvil_core::Device`] well enough to
//! drive the batch layer end to end: real CPU mappings, real bindings with
//! overlap checks, relocation processing, and concurrent engine queues with
//! in-fence dependencies.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                       SimDevice                          │
//! │  objects ── bindings ── contexts ── queue states         │
//! │        │                                   │             │
//! │        ▼                                   ▼             │
//! │   SimMemory (words)            QueueWorker per (ctx, eng)│
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! Command streams use the reference command set in [`isa`].

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::all)]

mod device;
pub mod isa;
mod memory;
mod queue;

pub use device::{SimConfig, SimDevice, POISON};
pub use memory::SimMemory;
