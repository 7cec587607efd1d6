//! # ANVIL Command Submission
//!
//! Builds command batches, resolves the addresses they reference, submits
//! them to engine queues and tracks their completion.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                            Session                               │
//! │                                                                  │
//! │  ┌──────────────┐    ┌──────────────┐    ┌────────────────────┐  │
//! │  │    Batch     │───►│   Resolver   │───►│     Submitter      │  │
//! │  │ words, deps, │    │ absolute or  │    │ upload, in-fences, │  │
//! │  │ reloc sites  │    │ relocation   │    │ device submit      │  │
//! │  └──────────────┘    └──────────────┘    └─────────┬──────────┘  │
//! │                                                    │             │
//! │  ┌─────────────────────────────────────────────────┴──────────┐  │
//! │  │                       Coordinator                          │  │
//! │  │   fences (expired cache, wait any/all)   semaphores        │  │
//! │  └────────────────────────────────────────────────────────────┘  │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! let session = Session::new(device, RegistryConfig::default())?;
//! let ctx = session.submitter.create_context()?;
//! let mut batch = session.batch(BatchConfig::default())?;
//! batch.append(STORE_DWORD_HEADER)?;
//! batch.emit_reloc(target, 0, Domains::RENDER, Domains::RENDER)?;
//! batch.append(0xc0ffee)?;
//! batch.emit_end()?;
//! session.submitter.submit(
//!     &mut batch,
//!     EngineClass::Render,
//!     EngineInstance::ZERO,
//!     ctx,
//!     SubmitMode::Sync(Timeout::Infinite),
//! )?;
//! ```

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod batch;
pub mod fence;
pub mod reloc;
pub mod semaphore;
pub mod session;
pub mod submit;

#[cfg(test)]
mod scenarios;

// Re-exports
pub use batch::{AddressingMode, Batch, BatchConfig, Dependency, RelocSite};
pub use fence::{Coordinator, FenceStatus, Timeout, WaitResult};
pub use reloc::{Resolution, Resolver};
pub use semaphore::{PendingWait, SemaphoreState, SemaphoreTable};
pub use session::Session;
pub use submit::{SubmitMode, Submitter};

static_assertions::assert_impl_all!(Timeout: Send, Sync, Copy);
static_assertions::assert_impl_all!(WaitResult: Send, Sync);
static_assertions::assert_impl_all!(BatchConfig: Send, Sync, Copy);
