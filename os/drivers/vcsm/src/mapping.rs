//! # Mapping Table
//!
//! Virtual mappings of resources into process address spaces. A mapping is
//! created *reserved*: the host sets up the region but installs nothing. Each
//! first access of a page faults into [`SharedMemory::resolve_fault`], which
//! installs exactly that page, locking the resource first if nobody holds a
//! lock on it.
//!
//! Mappings do not keep their resource alive; releasing the resource tears
//! down whatever mappings are left.

use log::{debug, error, trace};

use crate::addresses::{BusAddress, PageFrame, VirtualAddress, VirtualRange};
use crate::cache::CacheMaintenance;
use crate::config::DebugLevel;
use crate::coordinator::remote_handle;
use crate::error::SmError;
use crate::host::{HostMemory, InsertError, RegionFlags};
use crate::registry::{Guid, MapKey, Mapping, ResourceInfo};
use crate::remote::{ActionKind, Outcome, RemoteHandle, RemoteMemoryService};
use crate::session::{ProcessId, Session};
use crate::stats::StatKind;
use crate::SharedMemory;

/// A request to map a resource.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct MapRequest {
    /// Page offset into the device; the resource's GUID in pages.
    pub offset: u64,
    /// Region the host reserved for the mapping.
    pub region: VirtualRange,
}

impl MapRequest {
    #[must_use]
    pub const fn new(guid: Guid, region: VirtualRange) -> Self {
        Self {
            offset: guid.page_offset(),
            region,
        }
    }
}

/// A mapping that was set up.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Mapped {
    pub key: MapKey,
    /// Attributes the host must apply to the region.
    pub flags: RegionFlags,
}

impl<R, H, C> SharedMemory<R, H, C>
where
    R: RemoteMemoryService,
    H: HostMemory,
    C: CacheMaintenance,
{
    /// Sets up a demand-resolved mapping of a resource into `caller`'s
    /// address space.
    ///
    /// # Errors
    /// * [`SmError::InvalidArgument`] for a bad offset, a misaligned region,
    ///   or a length other than the resource's size,
    /// * [`SmError::NotFound`] if the session does not own the resource,
    /// * [`SmError::PermissionDenied`] if `caller` may not touch it.
    pub fn map(
        &self,
        session: &Session,
        caller: ProcessId,
        request: MapRequest,
    ) -> Result<Mapped, SmError> {
        self.settle_pending(session);
        let guid = Guid::from_page_offset(request.offset)
            .ok_or(SmError::InvalidArgument("mapping offset out of range"))?;
        let info = self.registry.acquire_by_guid(session, guid)?;
        let result = self.map_acquired(caller, &info, request.region);
        self.release(guid, false);
        result
    }

    fn map_acquired(
        &self,
        caller: ProcessId,
        info: &ResourceInfo,
        region: VirtualRange,
    ) -> Result<Mapped, SmError> {
        info.check_access(caller)?;
        if region.len != u64::from(info.size) {
            error!(
                "mapping {} bytes of {} which has {} bytes",
                region.len, info.guid, info.size
            );
            return Err(SmError::InvalidArgument("mapping length differs from resource size"));
        }
        if !region.start.is_page_aligned() {
            return Err(SmError::InvalidArgument("mapping not page aligned"));
        }

        let guid = info.guid;
        let key = self.registry.with(|t| {
            if let Some(resource) = t.resources.get_mut(&guid) {
                resource.stats.record(StatKind::Map);
            }
            t.add_mapping(Mapping {
                resource: guid,
                pid: caller,
                remote_handle: info.handle,
                region,
                attachments: 1,
            })
        });

        if self.verbose(DebugLevel::Min) {
            debug!("mapped {guid} at {} for process {caller} ({key})", region.start);
        }
        Ok(Mapped {
            key,
            flags: RegionFlags::shared_memory(info.cache.host_cached()),
        })
    }

    /// Another address space now shares the mapping.
    ///
    /// Returns `false` if the mapping is gone.
    pub fn attach(&self, key: MapKey) -> bool {
        self.registry.with(|t| {
            t.mappings
                .get_mut(&key)
                .map(|m| m.attachments += 1)
                .is_some()
        })
    }

    /// An address space dropped the mapping; the last one unregisters it.
    ///
    /// Returns `true` if the mapping was unregistered.
    pub fn detach(&self, key: MapKey) -> bool {
        let last = self.registry.with(|t| {
            let mapping = t.mappings.get_mut(&key)?;
            mapping.attachments = mapping.attachments.saturating_sub(1);
            Some(mapping.attachments == 0)
        });
        match last {
            Some(true) => self.unregister(key),
            Some(false) => false,
            None => {
                trace!("{key} already torn down");
                false
            }
        }
    }

    /// Removes a mapping from the tables without touching page tables.
    pub fn unregister(&self, key: MapKey) -> bool {
        let removed = self.registry.with(|t| t.remove_mapping(key));
        if let Some(mapping) = &removed
            && self.verbose(DebugLevel::Min)
        {
            debug!(
                "unmapped {} at {} from process {}",
                mapping.resource, mapping.region.start, mapping.pid
            );
        }
        removed.is_some()
    }

    /// Resolves an access to `address` inside the mapping `key`.
    ///
    /// Locks the resource on first touch, then installs the one page that
    /// contains `address` and returns its frame.
    ///
    /// # Errors
    /// * [`SmError::BusFault`] if the mapping is gone, the address is outside
    ///   it, or the first-touch lock failed,
    /// * [`SmError::OutOfMemory`] if the host could not install the page.
    pub fn resolve_fault(&self, key: MapKey, address: VirtualAddress) -> Result<PageFrame, SmError> {
        let fault = SmError::BusFault(address);
        let (mapping, info) = self
            .registry
            .with(|t| {
                let mapping = *t.mappings.get(&key)?;
                let resource = t.resources.get_mut(&mapping.resource)?;
                resource.ref_count += 1;
                Some((mapping, resource.info()))
            })
            .ok_or(fault)?;

        let result = self.resolve_acquired(&mapping, &info, address);
        self.release(info.guid, false);
        result
    }

    fn resolve_acquired(
        &self,
        mapping: &Mapping,
        info: &ResourceInfo,
        address: VirtualAddress,
    ) -> Result<PageFrame, SmError> {
        let fault = SmError::BusFault(address);
        if !mapping.region.contains(address) {
            return Err(fault);
        }

        let base = if info.lock_count == 0 {
            self.first_touch_lock(info).ok_or(fault)?
        } else {
            info.base
        };

        let page = address.page_base();
        let offset = page.as_u64() - mapping.region.start.as_u64();
        let frame = (base.to_physical(self.config.window_base) + offset).frame();
        if self.verbose(DebugLevel::Max) {
            trace!("fault at {address} in {}: frame {:#x}", info.guid, frame.number());
        }

        match self.host.insert_frame(mapping.pid, page, frame) {
            Ok(()) | Err(InsertError::Retry) => Ok(frame),
            Err(InsertError::OutOfMemory) => Err(SmError::OutOfMemory),
            Err(InsertError::NoRegion) => Err(fault),
        }
    }

    /// Locks an unlocked resource on behalf of a faulting access.
    ///
    /// There is no session to retry on, so an abandoned call is cleaned up
    /// immediately.
    fn first_touch_lock(&self, info: &ResourceInfo) -> Option<BusAddress> {
        let guid = info.guid;
        let handle = remote_handle(info).ok()?;
        let tx = self.remote.lock(handle, info.base);
        let reply = match tx.outcome {
            Outcome::Completed(reply) if !reply.address.is_null() => reply,
            Outcome::Completed(_) | Outcome::Failed(_) => {
                error!("first-touch lock of {guid} failed");
                self.registry.update(guid, |r| r.stats.record_failure(StatKind::Lock));
                return None;
            }
            Outcome::Abandoned => {
                self.record_interrupted(None, ActionKind::Lock, tx.id);
                return None;
            }
        };

        let physical = self.physical_range(reply.address, u64::from(info.size));
        self.cache.invalidate_outer(physical);

        self.registry.update(guid, |r| {
            r.stats.record(StatKind::Lock);
            r.lock_count += 1;
            if !reply.previous.is_null() && reply.address != reply.previous {
                r.base = reply.address;
            }
        });
        if self.verbose(DebugLevel::Intermediate) {
            debug!("first touch locked {guid} at {}", reply.address);
        }
        Some(reply.address)
    }

    /// GUID of the resource `pid` has mapped at `address`.
    #[must_use]
    pub fn handle_from_address(&self, pid: ProcessId, address: VirtualAddress) -> Option<Guid> {
        self.registry
            .with(|t| t.mapping_at(pid, address).map(|(_, m)| m.resource))
    }

    /// Remote handle of the resource `pid` has mapped at `address`.
    #[must_use]
    pub fn remote_handle_from_address(
        &self,
        pid: ProcessId,
        address: VirtualAddress,
    ) -> Option<RemoteHandle> {
        self.registry
            .with(|t| t.mapping_at(pid, address).and_then(|(_, m)| m.remote_handle))
    }

    /// Start address of `pid`'s mapping of resource `guid`.
    #[must_use]
    pub fn address_from_handle(&self, pid: ProcessId, guid: Guid) -> Option<VirtualAddress> {
        self.registry
            .with(|t| t.mapping_of(pid, guid).map(|(_, m)| m.region.start))
    }

    /// Mapping key of the region of `pid` that covers `address`.
    #[must_use]
    pub fn mapping_at(&self, pid: ProcessId, address: VirtualAddress) -> Option<MapKey> {
        self.registry
            .with(|t| t.mapping_at(pid, address).map(|(key, _)| key))
    }
}
