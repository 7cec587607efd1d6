//! # Session
//!
//! One registry, one coordinator and one submitter sharing a device. Most
//! callers only ever need this.

use std::sync::Arc;

use anvil_core::{Device, Result};
use anvil_mem::{Registry, RegistryConfig};

use crate::batch::{Batch, BatchConfig};
use crate::fence::Coordinator;
use crate::submit::Submitter;

/// Shared state for building and submitting batches on one device
pub struct Session<D: Device> {
    /// Buffer object registry
    pub registry: Arc<Registry<D>>,
    /// Fence and semaphore coordinator
    pub coordinator: Arc<Coordinator<D>>,
    /// Submission engine
    pub submitter: Submitter<D>,
}

impl<D: Device> Session<D> {
    /// Open a session on `device`
    pub fn new(device: Arc<D>, config: RegistryConfig) -> Result<Self> {
        let registry = Arc::new(Registry::new(device.clone(), config)?);
        let coordinator = Arc::new(Coordinator::new(device));
        let submitter = Submitter::new(registry.clone(), coordinator.clone());
        Ok(Self {
            registry,
            coordinator,
            submitter,
        })
    }

    /// Create a batch bound to this session
    pub fn batch(&self, config: BatchConfig) -> Result<Batch<D>> {
        Batch::new(self.registry.clone(), self.coordinator.clone(), config)
    }

    /// Underlying device
    pub fn device(&self) -> &Arc<D> {
        self.registry.device()
    }
}

impl<D: Device> core::fmt::Debug for Session<D> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Session")
            .field("registry", &self.registry.stats())
            .field("coordinator", &self.coordinator)
            .field("submitter", &self.submitter)
            .finish()
    }
}
