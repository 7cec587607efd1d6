//! # Address Resolver
//!
//! Decides, per dependency, how its address reaches the command stream.
//!
//! ## Absolute Mode
//!
//! | cache      | registry binding            | action                  |
//! |------------|-----------------------------|-------------------------|
//! | pinned     | any                         | bind at the pin         |
//! | hit        | same serial                 | reuse verbatim          |
//! | stale      | still at the stale address  | rebind above the floor  |
//! | any other  | bound                       | adopt current binding   |
//! | any other  | unbound                     | bind by first fit       |
//!
//! A purge raises the registry floor, so the rebind in the third row can
//! never land on an address handed out before the purge.
//!
//! ## Relocation Mode
//!
//! The cache is never read. Every address field becomes a relocation entry
//! carrying the registry's current address (or null) as its presumed value;
//! the device patches the field and reports final placements, which are
//! then recorded.

use anvil_core::{
    BufferHandle, DeviceHandle, Error, GpuAddr, RelocEntry, Resource, ResourceFlags, Result,
    SubmitFlags,
};
use anvil_mem::{Lookup, OffsetCache, Registry};

use crate::batch::{AddressingMode, Dependency, RelocSite};

/// Resolved resource list and relocations for one submission
#[derive(Debug, Clone, Default)]
pub struct Resolution {
    /// One entry per dependency plus the batch itself, batch last
    pub resources: Vec<Resource>,
    /// Address fields for the device to patch
    pub relocs: Vec<RelocEntry>,
    /// Submission flags implied by the mode
    pub flags: SubmitFlags,
}

/// Address resolver over one batch's cache
#[derive(Debug)]
pub struct Resolver<'a, D: DeviceHandle> {
    registry: &'a Registry<D>,
    cache: &'a OffsetCache,
    mode: AddressingMode,
}

impl<'a, D: DeviceHandle> Resolver<'a, D> {
    /// Create a resolver
    pub fn new(registry: &'a Registry<D>, cache: &'a OffsetCache, mode: AddressingMode) -> Self {
        Self { registry, cache, mode }
    }

    /// Choose an address for `bo` in absolute mode and record it
    pub fn place(&self, bo: BufferHandle, pin: Option<GpuAddr>) -> Result<GpuAddr> {
        if let Some(pin) = pin {
            let addr = self.registry.bind_at(bo, pin)?;
            self.record(bo, addr)?;
            return Ok(addr);
        }

        let current = self.registry.binding(bo)?;
        let addr = match (self.cache.lookup(bo), current) {
            (Lookup::Hit(hit), Some(binding)) if binding.serial == hit.serial => {
                log::trace!("resolver: {:?} cached at {}", bo, hit.addr);
                return Ok(hit.addr);
            }
            (Lookup::Stale(stale), Some(binding)) if binding.addr() == stale.addr => {
                self.registry.rebind(bo)?
            }
            (_, Some(binding)) => binding.addr(),
            (_, None) => self.registry.bind(bo)?,
        };
        self.record(bo, addr)?;
        Ok(addr)
    }

    fn record(&self, bo: BufferHandle, addr: GpuAddr) -> Result<()> {
        let serial = self.registry.binding(bo)?.map_or(0, |b| b.serial);
        self.cache.record(bo, addr, serial);
        Ok(())
    }

    /// Resolve every dependency of a batch and fix up its address fields
    pub fn resolve(
        &self,
        holder: BufferHandle,
        deps: &[Dependency],
        sites: &[RelocSite],
        words: &mut [u32],
    ) -> Result<Resolution> {
        let mut resolution = Resolution::default();

        for dep in deps {
            let (presumed, mut flags) = self.presume(dep.bo, dep.pin)?;
            if dep.access.is_write() {
                flags |= ResourceFlags::WRITE;
            }
            resolution.resources.push(Resource {
                bo: dep.bo,
                presumed,
                flags,
            });
        }
        let (holder_addr, holder_flags) = self.presume(holder, None)?;
        resolution.resources.push(Resource {
            bo: holder,
            presumed: holder_addr,
            flags: holder_flags,
        });

        for site in sites {
            let presumed = resolution
                .resources
                .iter()
                .find(|r| r.bo == site.target)
                .map(|r| r.presumed)
                .ok_or(Error::InvalidParameter)?;

            let index = (site.offset / 4) as usize;
            let field = words.get_mut(index..index + 2).ok_or(Error::InvalidParameter)?;
            let value = if presumed.is_null() {
                GpuAddr::null()
            } else {
                presumed + site.delta
            };
            field[0] = value.lower();
            field[1] = value.upper();

            if self.mode == AddressingMode::Relocation {
                resolution.relocs.push(RelocEntry {
                    target: site.target,
                    holder,
                    offset: site.offset,
                    delta: site.delta,
                    presumed,
                    read_domains: site.read_domains,
                    write_domain: site.write_domain,
                });
            }
        }

        if self.mode == AddressingMode::Absolute {
            resolution.flags |= SubmitFlags::NO_RELOC;
        }
        log::trace!(
            "resolver: {} resources, {} relocs ({:?})",
            resolution.resources.len(),
            resolution.relocs.len(),
            self.mode
        );
        Ok(resolution)
    }

    fn presume(&self, bo: BufferHandle, pin: Option<GpuAddr>) -> Result<(GpuAddr, ResourceFlags)> {
        match (self.mode, pin) {
            (AddressingMode::Absolute, _) => Ok((self.place(bo, pin)?, ResourceFlags::PINNED)),
            (AddressingMode::Relocation, Some(pin)) => {
                Ok((self.registry.bind_at(bo, pin)?, ResourceFlags::PINNED))
            }
            (AddressingMode::Relocation, None) => Ok((
                self.registry.address(bo)?.unwrap_or_default(),
                ResourceFlags::empty(),
            )),
        }
    }

    /// Record the placements a device reported for a submission
    pub fn absorb(&self, placements: &[(BufferHandle, GpuAddr)]) -> Result<()> {
        for (bo, addr) in placements {
            let serial = self.registry.note_placement(*bo, *addr)?;
            self.cache.record(*bo, *addr, serial);
        }
        Ok(())
    }
}
