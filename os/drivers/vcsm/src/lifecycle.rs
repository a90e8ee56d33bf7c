//! # Resource Lifecycle
//!
//! Allocation, sharing and release of resources. These are the registry
//! operations that involve the remote side, so they live on the driver
//! rather than on [`Registry`](crate::Registry) itself.

use alloc::vec::Vec;
use log::{debug, error, warn};

use crate::addresses::page_align_up;
use crate::cache::CacheMaintenance;
use crate::config::{ALLOC_ALIGNMENT, DEFAULT_RESOURCE_NAME, DebugLevel};
use crate::error::SmError;
use crate::host::HostMemory;
use crate::name::ResourceName;
use crate::registry::{Detached, Guid, Mapping, Release, Resource, Unref};
use crate::remote::{ActionKind, AllocKind, AllocRequest, Outcome, RemoteMemoryService};
use crate::session::{ProcessId, Session};
use crate::stats::{OpStats, StatKind};
use crate::{CachePolicy, SharedMemory};

/// Parameters of [`SharedMemory::allocate`].
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct AllocSpec<'a> {
    /// Bytes per unit; rounded up to the host page size.
    pub size: u32,
    pub count: u32,
    pub cache: CachePolicy,
    /// Empty names are replaced by [`DEFAULT_RESOURCE_NAME`].
    pub name: &'a str,
}

impl<'a> AllocSpec<'a> {
    #[must_use]
    pub const fn new(size: u32, cache: CachePolicy) -> Self {
        Self {
            size,
            count: 1,
            cache,
            name: "",
        }
    }

    #[must_use]
    pub const fn with_count(mut self, count: u32) -> Self {
        self.count = count;
        self
    }

    #[must_use]
    pub const fn with_name(mut self, name: &'a str) -> Self {
        self.name = name;
        self
    }
}

impl<R, H, C> SharedMemory<R, H, C>
where
    R: RemoteMemoryService,
    H: HostMemory,
    C: CacheMaintenance,
{
    /// Allocates remote memory for `caller` and registers it in `session`.
    ///
    /// # Errors
    /// * [`SmError::InvalidArgument`] for empty or oversized requests,
    /// * [`SmError::OutOfMemory`] if the remote side could not allocate or no GUID is free,
    /// * [`SmError::Interrupted`] if the remote call was abandoned.
    pub fn allocate(
        &self,
        session: &Session,
        caller: ProcessId,
        params: AllocSpec<'_>,
    ) -> Result<Guid, SmError> {
        self.settle_pending(session);
        self.allocate_as(session, caller, params)
    }

    pub(crate) fn allocate_as(
        &self,
        session: &Session,
        owner: ProcessId,
        params: AllocSpec<'_>,
    ) -> Result<Guid, SmError> {
        if params.size == 0 || params.count == 0 {
            return Err(SmError::InvalidArgument("empty allocation"));
        }
        let base_unit = page_align_up(u64::from(params.size))
            .and_then(|v| u32::try_from(v).ok())
            .ok_or(SmError::InvalidArgument("unit size too large"))?;
        let size = base_unit
            .checked_mul(params.count)
            .ok_or(SmError::InvalidArgument("allocation too large"))?;

        let name = ResourceName::new(if params.name.is_empty() {
            DEFAULT_RESOURCE_NAME
        } else {
            params.name
        });
        let request = AllocRequest {
            kind: if params.cache.remote_cached() {
                AllocKind::Cached
            } else {
                AllocKind::NonCached
            },
            base_unit,
            num_unit: params.count,
            alignment: ALLOC_ALIGNMENT,
            allocator: owner,
            name,
        };
        if self.verbose(DebugLevel::Min) {
            debug!(
                "allocating \"{name}\": {:?}, {} x {base_unit} ({} requested)",
                request.kind, params.count, params.size
            );
        }

        let tx = self.remote.allocate(&request);
        let allocation = match tx.outcome {
            Outcome::Completed(allocation) if !allocation.address.is_null() => allocation,
            Outcome::Completed(allocation) => {
                error!(
                    "remote allocation of \"{name}\" returned handle {} without memory",
                    allocation.handle
                );
                self.remote.free(allocation.handle, allocation.address);
                self.allocation_failed(true);
                return Err(SmError::OutOfMemory);
            }
            Outcome::Failed(status) => {
                error!(
                    "remote allocation of \"{name}\" failed (status {status}, transaction {})",
                    tx.id
                );
                self.allocation_failed(true);
                return Err(SmError::OutOfMemory);
            }
            Outcome::Abandoned => {
                self.record_interrupted(Some(session.id()), ActionKind::Alloc, tx.id);
                self.allocation_failed(false);
                return Err(SmError::Interrupted(tx.id));
            }
        };

        let mut stats = OpStats::default();
        stats.record(StatKind::Alloc);
        let registered = self.registry.register(Resource {
            guid: Guid::default(),
            session: Some(session.id()),
            owner,
            handle: Some(allocation.handle),
            base: allocation.address,
            size,
            cache: params.cache,
            lock_count: 0,
            ref_count: 1,
            shared: None,
            mappings: Vec::new(),
            stats,
            name,
        });
        let guid = match registered {
            Ok(guid) => guid,
            Err(e) => {
                error!("no GUID left for \"{name}\" (handle {})", allocation.handle);
                self.remote.free(allocation.handle, allocation.address);
                self.allocation_failed(false);
                return Err(e);
            }
        };

        if self.verbose(DebugLevel::Min) {
            debug!(
                "allocated {guid}: handle {}, base {}, size {size}, cache {}",
                allocation.handle, allocation.address, params.cache
            );
        }
        Ok(guid)
    }

    fn allocation_failed(&self, remote_failure: bool) {
        let mut stats = OpStats::default();
        if remote_failure {
            stats.record_failure(StatKind::Alloc);
        }
        self.registry.record_deceased(&stats, true);
    }

    /// Creates an alias of an existing resource in `session`.
    ///
    /// The alias keeps a reference on the resource it shares until the alias
    /// itself is released. Returns the alias GUID and the shared size.
    ///
    /// # Errors
    /// * [`SmError::NotFound`] if no resource has this GUID,
    /// * [`SmError::OutOfMemory`] if no GUID is free.
    pub fn allocate_share(
        &self,
        session: &Session,
        caller: ProcessId,
        guid: Guid,
    ) -> Result<(Guid, u32), SmError> {
        self.settle_pending(session);
        let canonical = self.registry.acquire_global(guid)?;

        let mut stats = OpStats::default();
        stats.record(StatKind::Alloc);
        let registered = self.registry.register(Resource {
            guid: Guid::default(),
            session: Some(session.id()),
            owner: caller,
            handle: canonical.handle,
            base: canonical.base,
            size: canonical.size,
            cache: canonical.cache,
            lock_count: 0,
            ref_count: 1,
            shared: Some(canonical.guid),
            mappings: Vec::new(),
            stats,
            name: canonical.name,
        });
        let alias = match registered {
            Ok(alias) => alias,
            Err(e) => {
                error!("no GUID left to share {guid}");
                self.release(canonical.guid, false);
                return Err(e);
            }
        };

        if self.verbose(DebugLevel::Min) {
            debug!("shared {guid} as {alias} for process {caller}");
        }
        Ok((alias, canonical.size))
    }

    /// Drops the session's own reference on a resource.
    ///
    /// The resource goes away immediately unless something else (an alias,
    /// an operation in flight) still references it.
    ///
    /// # Errors
    /// * [`SmError::NotFound`] if the session does not own `guid`,
    /// * [`SmError::PermissionDenied`] if `caller` does not own the resource.
    pub fn free(&self, session: &Session, caller: ProcessId, guid: Guid) -> Result<(), SmError> {
        self.settle_pending(session);
        self.free_unsettled(session, caller, guid)
    }

    pub(crate) fn free_unsettled(
        &self,
        session: &Session,
        caller: ProcessId,
        guid: Guid,
    ) -> Result<(), SmError> {
        let info = self.registry.acquire_by_guid(session, guid)?;
        if let Err(e) = info.check_access(caller) {
            error!("{e}");
            self.release(guid, false);
            return Err(e);
        }

        self.release(guid, false);
        if let Release::Referenced(remaining) = self.release(guid, false) {
            if self.verbose(DebugLevel::Intermediate) {
                debug!("{guid} freed by its session, {remaining} references remain");
            }
            self.registry.orphan(guid);
        }
        Ok(())
    }

    /// Drops one reference on a resource, tearing it down on the last one.
    ///
    /// Teardown force-unmaps surviving mappings, frees the remote memory if
    /// no other resource shares it, and releases the canonical resource of an
    /// alias. `force` marks teardown driven by session close; it only changes
    /// diagnostics and which statistics bucket the resource ends up in.
    pub fn release(&self, guid: Guid, force: bool) -> Release {
        let detached = match self.registry.unref(guid) {
            Unref::Missing => {
                warn!("release of unknown resource {guid}");
                return Release::Missing;
            }
            Unref::Referenced(remaining) => {
                if force {
                    warn!("resource {guid} still in use ({remaining} references)");
                }
                return Release::Referenced(remaining);
            }
            Unref::Detached(detached) => detached,
        };

        let shared = detached.resource.shared;
        self.tear_down(detached, force);
        if let Some(canonical) = shared {
            self.release(canonical, false);
        }
        Release::Destroyed
    }

    fn tear_down(&self, detached: Detached, force: bool) {
        let Detached {
            mut resource,
            mappings,
        } = detached;
        resource.stats.record(StatKind::Free);

        for mapping in &mappings {
            self.force_unmap(mapping);
        }

        if let Some(handle) = resource.handle {
            let tx = self.remote.free(handle, resource.base);
            match tx.outcome {
                Outcome::Completed(()) => {}
                Outcome::Failed(status) => {
                    error!(
                        "remote free of {} (handle {handle}) failed with status {status}",
                        resource.guid
                    );
                    resource.stats.record_failure(StatKind::Free);
                }
                Outcome::Abandoned => {
                    self.record_interrupted(resource.session, ActionKind::Free, tx.id);
                }
            }
        }

        if self.verbose(DebugLevel::Min) {
            debug!(
                "{} \"{}\" released ({} mappings torn down{})",
                resource.guid,
                resource.name,
                mappings.len(),
                if force { ", forced" } else { "" }
            );
        }
        self.registry.record_deceased(&resource.stats, force);
    }

    pub(crate) fn force_unmap(&self, mapping: &Mapping) {
        if mapping.pid.is_kernel() {
            self.host.unmap_kernel_window(mapping.region.start);
        } else if let Err(e) = self.host.unmap_range(mapping.pid, mapping.region) {
            warn!(
                "could not unmap {} bytes at {} from process {}: {e}",
                mapping.region.len, mapping.region.start, mapping.pid
            );
        }
    }
}
