//! # Lock Coordinator
//!
//! Lock, unlock and resize: the operations that change what the remote side
//! believes about a resource.
//!
//! A lock pins the memory at a stable bus address for as long as the host
//! accesses it. The remote side may move the memory while it is unlocked, so a
//! lock reply can report a new address; the broker then adopts it. When the
//! last holder unlocks, every process translation is dropped so the next
//! access faults and locks again (see [`resolve_fault`](SharedMemory::resolve_fault)).
//!
//! Remote calls run without the registry lock. Each operation holds a
//! reference on the resource for its whole duration instead.

use alloc::vec::Vec;
use log::{debug, error, warn};

use crate::addresses::{BusAddress, PhysicalRange, VirtualAddress, VirtualRange};
use crate::cache::{CacheMaintenance, MappedRange};
use crate::config::DebugLevel;
use crate::error::SmError;
use crate::host::HostMemory;
use crate::registry::{Guid, Mapping, ResourceInfo};
use crate::remote::{ActionKind, Outcome, RemoteHandle, RemoteMemoryService};
use crate::session::{ProcessId, Session};
use crate::stats::StatKind;
use crate::{CachePolicy, SharedMemory};

/// Parameters of [`SharedMemory::lock`].
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct LockOptions {
    /// Adopt this cache policy once the lock is held.
    pub cache: Option<CachePolicy>,
    /// The caller already knows where the memory lives; skip the remote call.
    pub external_address: Option<BusAddress>,
}

/// Parameters of [`SharedMemory::unlock`].
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct UnlockOptions {
    /// Clean host caches before handing the memory back.
    pub flush: bool,
    /// Wait for the remote side to acknowledge the unlock.
    pub wait_reply: bool,
    /// Only drop the host-side lock; the remote side is not told.
    pub skip_remote: bool,
}

impl Default for UnlockOptions {
    fn default() -> Self {
        Self {
            flush: false,
            wait_reply: true,
            skip_remote: false,
        }
    }
}

impl UnlockOptions {
    #[must_use]
    pub const fn flushing() -> Self {
        Self {
            flush: true,
            wait_reply: true,
            skip_remote: false,
        }
    }
}

/// What a successful lock changed, computed under the registry lock.
struct Locked {
    address: BusAddress,
    relocated: bool,
    /// Kernel window made stale by a relocation.
    stale_window: Option<Mapping>,
    /// Process mappings that were live during a relocation.
    stale_ranges: Vec<MappedRange>,
    user_address: Option<VirtualAddress>,
    needs_window: bool,
    info: ResourceInfo,
}

pub(crate) fn remote_handle(info: &ResourceInfo) -> Result<RemoteHandle, SmError> {
    info.handle
        .ok_or(SmError::InvalidArgument("resource has no remote handle"))
}

impl<R, H, C> SharedMemory<R, H, C>
where
    R: RemoteMemoryService,
    H: HostMemory,
    C: CacheMaintenance,
{
    #[inline]
    pub(crate) fn physical_range(&self, base: BusAddress, len: u64) -> PhysicalRange {
        PhysicalRange::new(base.to_physical(self.config.window_base), len)
    }

    /// Locks a resource in place.
    ///
    /// Returns the caller's user address if it has the resource mapped, or
    /// the address of a freshly created kernel window for kernel-owned
    /// resources that nobody has mapped.
    ///
    /// # Errors
    /// * [`SmError::NotFound`] if the session does not own `guid`,
    /// * [`SmError::PermissionDenied`] if `caller` may not touch it,
    /// * [`SmError::RemoteFailure`] / [`SmError::OutOfMemory`] if the remote lock failed,
    /// * [`SmError::Interrupted`] if the remote call was abandoned.
    pub fn lock(
        &self,
        session: &Session,
        caller: ProcessId,
        guid: Guid,
        options: LockOptions,
    ) -> Result<Option<VirtualAddress>, SmError> {
        self.settle_pending(session);
        self.lock_unsettled(session, caller, guid, options)
    }

    pub(crate) fn lock_unsettled(
        &self,
        session: &Session,
        caller: ProcessId,
        guid: Guid,
        options: LockOptions,
    ) -> Result<Option<VirtualAddress>, SmError> {
        let info = self.registry.acquire_by_guid(session, guid)?;
        let result = self.lock_acquired(session, caller, &info, options);
        self.release(guid, false);
        result
    }

    fn lock_acquired(
        &self,
        session: &Session,
        caller: ProcessId,
        info: &ResourceInfo,
        options: LockOptions,
    ) -> Result<Option<VirtualAddress>, SmError> {
        info.check_access(caller)?;
        let guid = info.guid;

        let external = options.external_address.is_some();
        let (address, previous) = match options.external_address {
            Some(address) => (address, info.base),
            None => {
                let tx = self.remote.lock(remote_handle(info)?, info.base);
                match tx.outcome {
                    Outcome::Completed(reply) if !reply.address.is_null() => {
                        (reply.address, reply.previous)
                    }
                    Outcome::Completed(_) => {
                        error!("remote lock of {guid} returned no address");
                        self.registry.update(guid, |r| r.stats.record_failure(StatKind::Lock));
                        return Err(SmError::OutOfMemory);
                    }
                    Outcome::Failed(status) => {
                        error!("remote lock of {guid} failed with status {status}");
                        self.registry.update(guid, |r| r.stats.record_failure(StatKind::Lock));
                        return Err(SmError::RemoteFailure(status));
                    }
                    Outcome::Abandoned => {
                        self.record_interrupted(Some(session.id()), ActionKind::Lock, tx.id);
                        return Err(SmError::Interrupted(tx.id));
                    }
                }
            }
        };

        let locked = self
            .registry
            .with(|t| {
                // A caller-supplied address is adopted as is.
                let relocated = !external
                    && !address.is_null()
                    && !previous.is_null()
                    && address != previous;
                let resource = t.resources.get_mut(&guid)?;
                resource.stats.record(StatKind::Lock);
                resource.lock_count += 1;
                if relocated || external {
                    resource.base = address;
                }
                if let Some(cache) = options.cache {
                    resource.cache = cache;
                }
                let kernel_owned = resource.owner.is_kernel();

                let mut stale_window = None;
                if relocated && kernel_owned {
                    let window = t.mapping_of(ProcessId::KERNEL, guid).map(|(key, _)| key);
                    stale_window = window.and_then(|key| t.remove_mapping(key));
                }
                let stale_ranges = if relocated {
                    t.mapped_ranges(guid)
                        .into_iter()
                        .filter(|m| !m.pid.is_kernel())
                        .collect()
                } else {
                    Vec::new()
                };

                let user_address = t.mapping_of(caller, guid).map(|(_, m)| m.region.start);
                let info = t.resources.get(&guid)?.info();
                Some(Locked {
                    address,
                    relocated,
                    stale_window,
                    stale_ranges,
                    user_address,
                    needs_window: kernel_owned && info.map_count == 0,
                    info,
                })
            })
            .ok_or(SmError::NotFound(guid))?;

        if locked.relocated {
            warn!("{guid} relocated from {previous} to {}", locked.address);
        }
        if let Some(window) = locked.stale_window {
            self.host.unmap_kernel_window(window.region.start);
        }
        if !locked.stale_ranges.is_empty() {
            // Translations point at the old location; drop them so the next
            // access faults against the new one.
            error!(
                "{guid} moved while mapped by {} processes",
                locked.stale_ranges.len()
            );
            for mapped in &locked.stale_ranges {
                self.host.zap_range(mapped.pid, mapped.range);
            }
        }

        if self.verbose(DebugLevel::Intermediate) {
            debug!(
                "locked {guid} at {} (lock count {})",
                locked.address, locked.info.lock_count
            );
        }

        if let Some(address) = locked.user_address {
            return Ok(Some(address));
        }
        if locked.needs_window {
            return Ok(self.open_kernel_window(&locked.info));
        }
        Ok(None)
    }

    fn open_kernel_window(&self, info: &ResourceInfo) -> Option<VirtualAddress> {
        let len = u64::from(info.size);
        let physical = self.physical_range(info.base, len);
        let Some(address) = self
            .host
            .map_kernel_window(physical, info.cache.host_cached())
        else {
            error!("could not map {} into the kernel", info.guid);
            return None;
        };
        self.registry.with(|t| {
            t.add_mapping(Mapping {
                resource: info.guid,
                pid: ProcessId::KERNEL,
                remote_handle: info.handle,
                region: VirtualRange::new(address, len),
                attachments: 1,
            })
        });
        Some(address)
    }

    /// Releases a lock taken by [`lock`](Self::lock).
    ///
    /// # Errors
    /// * [`SmError::NotFound`] if the session does not own `guid`,
    /// * [`SmError::PermissionDenied`] if `caller` may not touch it,
    /// * [`SmError::RemoteFailure`] if the remote unlock failed; the lock is kept,
    /// * [`SmError::Interrupted`] if the remote call was abandoned; the lock is kept.
    pub fn unlock(
        &self,
        session: &Session,
        caller: ProcessId,
        guid: Guid,
        options: UnlockOptions,
    ) -> Result<(), SmError> {
        self.settle_pending(session);
        self.unlock_unsettled(session, caller, guid, options)
    }

    pub(crate) fn unlock_unsettled(
        &self,
        session: &Session,
        caller: ProcessId,
        guid: Guid,
        options: UnlockOptions,
    ) -> Result<(), SmError> {
        let info = self.registry.acquire_by_guid(session, guid)?;
        let result = self.unlock_acquired(session, caller, &info, options);
        self.release(guid, false);
        result
    }

    fn unlock_acquired(
        &self,
        session: &Session,
        caller: ProcessId,
        info: &ResourceInfo,
        options: UnlockOptions,
    ) -> Result<(), SmError> {
        info.check_access(caller)?;
        let guid = info.guid;
        let physical = self.physical_range(info.base, u64::from(info.size));

        if info.owner.is_kernel() {
            // Only this call and the owner hold references: nobody else can
            // be using the kernel window.
            if info.ref_count == 2 {
                self.close_kernel_window(info, physical, options.flush);
            }
        } else {
            let ranges = self.registry.with(|t| t.mapped_ranges(guid));
            if options.flush && info.cache.is_cached() {
                self.registry.update(guid, |r| r.stats.record(StatKind::Flush));
                self.cache_controller().clean(&ranges, physical);
            }
            if info.lock_count == 1 {
                for mapped in &ranges {
                    self.host.zap_range(mapped.pid, mapped.range);
                }
            }
        }

        if info.lock_count == 0 {
            return Ok(());
        }

        if !options.skip_remote {
            let tx = self
                .remote
                .unlock(remote_handle(info)?, info.base, options.wait_reply);
            match tx.outcome {
                Outcome::Completed(()) => {}
                Outcome::Failed(status) => {
                    error!("remote unlock of {guid} failed with status {status}");
                    self.registry.update(guid, |r| r.stats.record_failure(StatKind::Unlock));
                    return Err(SmError::RemoteFailure(status));
                }
                Outcome::Abandoned => {
                    self.record_interrupted(Some(session.id()), ActionKind::Unlock, tx.id);
                    return Err(SmError::Interrupted(tx.id));
                }
            }
        }

        let remaining = self.registry.update(guid, |r| {
            r.stats.record(StatKind::Unlock);
            r.lock_count = r.lock_count.saturating_sub(1);
            r.lock_count
        });
        if self.verbose(DebugLevel::Intermediate) {
            debug!("unlocked {guid} (lock count {remaining:?})");
        }
        Ok(())
    }

    fn close_kernel_window(&self, info: &ResourceInfo, physical: PhysicalRange, flush: bool) {
        let window = self.registry.with(|t| {
            let key = t.mapping_of(ProcessId::KERNEL, info.guid).map(|(key, _)| key)?;
            t.remove_mapping(key)
        });
        let Some(window) = window else {
            return;
        };
        if flush && info.cache.host_cached() {
            self.registry.update(info.guid, |r| r.stats.record(StatKind::Flush));
            self.cache_controller()
                .clean(&[window.mapped_range()], physical);
        }
        self.host.unmap_kernel_window(window.region.start);
    }

    /// Changes the size of an unlocked, unmapped resource.
    ///
    /// Returns the size before the change.
    ///
    /// # Errors
    /// * [`SmError::NotFound`] if the session does not own `guid`,
    /// * [`SmError::InvalidArgument`] if the resource is locked or mapped, or `new_size` is zero,
    /// * [`SmError::PermissionDenied`] if `caller` may not touch it,
    /// * [`SmError::RemoteFailure`] if the remote side refused,
    /// * [`SmError::Interrupted`] if the remote call was abandoned.
    pub fn resize(
        &self,
        session: &Session,
        caller: ProcessId,
        guid: Guid,
        new_size: u32,
    ) -> Result<u32, SmError> {
        self.settle_pending(session);
        self.resize_unsettled(session, caller, guid, new_size)
    }

    pub(crate) fn resize_unsettled(
        &self,
        session: &Session,
        caller: ProcessId,
        guid: Guid,
        new_size: u32,
    ) -> Result<u32, SmError> {
        let info = self.registry.acquire_by_guid(session, guid)?;
        let result = self.resize_acquired(session, caller, &info, new_size);
        self.release(guid, false);
        result
    }

    fn resize_acquired(
        &self,
        session: &Session,
        caller: ProcessId,
        info: &ResourceInfo,
        new_size: u32,
    ) -> Result<u32, SmError> {
        let handle = remote_handle(info)?;
        // Aliases share the remote block, so their locks and mappings count too.
        let in_use = info.lock_count > 0
            || info.map_count > 0
            || self.registry.with(|t| t.share_in_use(handle));
        if in_use {
            error!(
                "cannot resize {}: it or a resource sharing its block is locked or mapped",
                info.guid
            );
            return Err(SmError::InvalidArgument("resource is locked or mapped"));
        }
        info.check_access(caller)?;
        if new_size == 0 {
            return Err(SmError::InvalidArgument("empty resize"));
        }

        let tx = self.remote.resize(handle, info.base, new_size);
        match tx.outcome {
            Outcome::Completed(()) => {}
            Outcome::Failed(status) => {
                error!("remote resize of {} failed with status {status}", info.guid);
                return Err(SmError::RemoteFailure(status));
            }
            Outcome::Abandoned => {
                self.record_interrupted(Some(session.id()), ActionKind::Resize, tx.id);
                return Err(SmError::Interrupted(tx.id));
            }
        }

        let old_size = self
            .registry
            .with(|t| t.resize_shared(info.guid, handle, new_size))
            .unwrap_or(info.size);
        if self.verbose(DebugLevel::Min) {
            debug!("resized {} from {old_size} to {new_size}", info.guid);
        }
        Ok(old_size)
    }
}
